//! Builder API for pipelines.
//!
//! Components are added by name and connected by name; pins are assigned in connection
//! order and every connecting buffer is sized in periods of the producer's stream.

use crate::buffer::{BufferId, CompBuffer, CompId};
use crate::component::{CompDev, CompDriver, DevCtx};
use crate::control::PipelineId;
use crate::error::Error;
use crate::graph::{Graph, GraphError, NodeId};
use crate::heap::Heap;
use crate::pipeline::Pipeline;
use std::collections::HashMap;
use std::sync::Arc;

/// Builder errors.
#[derive(Debug, Clone, PartialEq)]
pub enum DslError {
    Graph(GraphError),
    MissingNode(String),
    DuplicateName(String),
    /// A buffer could not be allocated.
    Alloc(Error),
    Pipeline(Error),
}

impl From<DslError> for Error {
    fn from(e: DslError) -> Self {
        match e {
            DslError::Graph(g) => g.into(),
            DslError::MissingNode(_) => Error::NoDevice,
            DslError::DuplicateName(_) => Error::Exists,
            DslError::Alloc(e) | DslError::Pipeline(e) => e,
        }
    }
}

/// Builds one pipeline.
#[derive(Debug)]
pub struct PipelineBuilder {
    heap: Arc<Heap>,
    id: PipelineId,
    core: usize,
    period_us: u64,
    graph: Graph,
    names: HashMap<String, NodeId>,
    next_buffer: u32,
    endpoints: Option<(String, String)>,
}

impl PipelineBuilder {
    pub fn new(heap: Arc<Heap>, id: PipelineId, core: usize, period_us: u64) -> Self {
        Self {
            heap,
            id,
            core,
            period_us,
            graph: Graph::new(),
            names: HashMap::new(),
            next_buffer: 0,
            endpoints: None,
        }
    }

    /// Add component `comp` under `name`, READY with default stream parameters.
    pub fn component(
        &mut self,
        name: &str,
        comp: CompId,
        driver: Box<dyn CompDriver>,
    ) -> Result<NodeId, DslError> {
        if self.names.contains_key(name) {
            return Err(DslError::DuplicateName(name.to_string()));
        }
        let ctx = DevCtx::new(comp, self.id, self.core, self.period_us);
        let node = self.graph.add_component(CompDev::new(ctx, driver));
        self.names.insert(name.to_string(), node);
        Ok(node)
    }

    /// Mutable access to a component's context, e.g. to set its stream parameters.
    pub fn ctx_mut(&mut self, name: &str) -> Result<&mut DevCtx, DslError> {
        let node = self.node(name)?;
        self.graph
            .node_mut(node)
            .map(CompDev::ctx_mut)
            .ok_or_else(|| DslError::MissingNode(name.to_string()))
    }

    pub fn node(&self, name: &str) -> Result<NodeId, DslError> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| DslError::MissingNode(name.to_string()))
    }

    /// Connect `from` to `to` through a new buffer of `periods` periods.
    pub fn connect(&mut self, from: &str, to: &str, periods: usize) -> Result<BufferId, DslError> {
        let from_node = self.node(from)?;
        let to_node = self.node(to)?;
        let from_dev = self
            .graph
            .node(from_node)
            .ok_or_else(|| DslError::MissingNode(from.to_string()))?;
        let to_dev = self
            .graph
            .node(to_node)
            .ok_or_else(|| DslError::MissingNode(to.to_string()))?;
        let from_pin = from_dev.ctx().sinks().len();
        let to_pin = to_dev.ctx().sources().len();
        let params = from_dev.ctx().params;

        let id = BufferId(self.next_buffer);
        let buffer = CompBuffer::with_periods(&self.heap, id, params, self.period_us, periods.max(1))
            .map_err(DslError::Alloc)?;
        self.graph
            .connect(from_node, from_pin, to_node, to_pin, buffer)
            .map_err(DslError::Graph)?;
        self.next_buffer += 1;
        Ok(id)
    }

    /// Name the source and sink endpoints. Without this the first planned source and the
    /// last planned sink are used, and the source paces the pipeline.
    pub fn endpoints(&mut self, source: &str, sink: &str) -> &mut Self {
        self.endpoints = Some((source.to_string(), sink.to_string()));
        self
    }

    pub fn build(self) -> Result<Pipeline, DslError> {
        let endpoints = match &self.endpoints {
            Some((src, snk)) => Some((self.node(src)?, self.node(snk)?)),
            None => None,
        };
        let pipeline = Pipeline::new(self.id, self.graph).map_err(DslError::Pipeline)?;
        match endpoints {
            Some((src, snk)) => pipeline
                .with_endpoints(src, snk, src)
                .map_err(DslError::Pipeline),
            None => Ok(pipeline),
        }
    }
}
