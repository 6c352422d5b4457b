//! Component graphs: devices joined by buffers, acyclic by construction.
//!
//! An edge is one [`CompBuffer`] bound to a sink pin of its producer and a source pin of
//! its consumer. `connect` validates everything before binding, so a rejected edge leaves
//! both devices untouched.

use crate::buffer::{BufferId, CompBuffer, CompId};
use crate::component::{BindDir, CompDev, MAX_PINS};
use crate::error::Error;
use crate::invariant_ppt::{assert_invariant, GRAPH_ACYCLIC, GRAPH_REJECTS_INVALID};
use std::sync::Arc;

/// Index of a component in its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// A buffer between a producer's sink pin and a consumer's source pin.
#[derive(Debug, Clone)]
pub struct Edge {
    pub from: NodeId,
    pub from_pin: usize,
    pub to: NodeId,
    pub to_pin: usize,
    pub buffer: Arc<CompBuffer>,
}

/// Errors that can occur when building the graph.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphError {
    /// Node does not exist.
    InvalidNode,
    /// Pin index out of range.
    InvalidPin,
    /// Adding the edge would create a cycle.
    CycleDetected,
    /// The pin already carries a buffer.
    PinAlreadyConnected,
    /// The buffer is already part of the graph.
    BufferInUse,
    /// A device refused the binding.
    Bind(Error),
}

impl From<GraphError> for Error {
    fn from(e: GraphError) -> Self {
        match e {
            GraphError::InvalidNode => Error::NoDevice,
            GraphError::InvalidPin => Error::Invalid("pin out of range"),
            GraphError::CycleDetected => Error::Invalid("connection would create a cycle"),
            GraphError::PinAlreadyConnected | GraphError::BufferInUse => Error::Exists,
            GraphError::Bind(e) => e,
        }
    }
}

/// The component graph of one pipeline.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<Option<CompDev>>,
    edges: Vec<Edge>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device.
    pub fn add_component(&mut self, dev: CompDev) -> NodeId {
        let id = NodeId(self.nodes.len());
        tracing::debug!(node = id.0, comp = dev.id().0, name = dev.name(), "component added");
        self.nodes.push(Some(dev));
        id
    }

    /// Slots, including removed ones.
    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    /// Live components.
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn node(&self, id: NodeId) -> Option<&CompDev> {
        self.nodes.get(id.0).and_then(|n| n.as_ref())
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut CompDev> {
        self.nodes.get_mut(id.0).and_then(|n| n.as_mut())
    }

    /// Live node ids in insertion order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref().map(|_| NodeId(i)))
    }

    /// Node holding device `comp`.
    pub fn find(&self, comp: CompId) -> Option<NodeId> {
        self.node_ids()
            .find(|&id| self.node(id).is_some_and(|d| d.id() == comp))
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Connect `from`'s sink pin to `to`'s source pin through `buffer`.
    pub fn connect(
        &mut self,
        from: NodeId,
        from_pin: usize,
        to: NodeId,
        to_pin: usize,
        buffer: Arc<CompBuffer>,
    ) -> Result<(), GraphError> {
        if self.node(from).is_none() || self.node(to).is_none() {
            return Err(GraphError::InvalidNode);
        }
        if from_pin >= MAX_PINS || to_pin >= MAX_PINS {
            return Err(GraphError::InvalidPin);
        }
        if from == to || self.reaches(to, from) {
            assert_invariant(
                GRAPH_REJECTS_INVALID,
                from == to || self.reaches(to, from),
                "cycle rejected",
                Some("connect"),
            );
            return Err(GraphError::CycleDetected);
        }
        if self
            .edges
            .iter()
            .any(|e| (e.from == from && e.from_pin == from_pin) || (e.to == to && e.to_pin == to_pin))
        {
            return Err(GraphError::PinAlreadyConnected);
        }
        if self.edges.iter().any(|e| e.buffer.id() == buffer.id()) {
            return Err(GraphError::BufferInUse);
        }

        self.bind(from, BindDir::Sink, from_pin, buffer.clone())?;
        if let Err(e) = self.bind(to, BindDir::Source, to_pin, buffer.clone()) {
            if let Some(dev) = self.node_mut(from) {
                let _ = dev.unbind(BindDir::Sink, from_pin);
            }
            return Err(e);
        }
        tracing::debug!(from = from.0, to = to.0, buffer = buffer.id().0, "components connected");
        self.edges.push(Edge {
            from,
            from_pin,
            to,
            to_pin,
            buffer,
        });
        assert_invariant(GRAPH_ACYCLIC, !self.reaches(to, from), "graph stays acyclic", Some("connect"));
        Ok(())
    }

    fn bind(&mut self, id: NodeId, dir: BindDir, pin: usize, buf: Arc<CompBuffer>) -> Result<(), GraphError> {
        let dev = self.node_mut(id).ok_or(GraphError::InvalidNode)?;
        dev.bind(dir, pin, buf).map_err(GraphError::Bind)
    }

    /// Remove the edge carried by `buffer` and unbind it from both ends.
    pub fn disconnect(&mut self, buffer: BufferId) -> Result<Edge, GraphError> {
        let pos = self
            .edges
            .iter()
            .position(|e| e.buffer.id() == buffer)
            .ok_or(GraphError::InvalidNode)?;
        let edge = self.edges.remove(pos);
        if let Some(dev) = self.node_mut(edge.from) {
            let _ = dev.unbind(BindDir::Sink, edge.from_pin);
        }
        if let Some(dev) = self.node_mut(edge.to) {
            let _ = dev.unbind(BindDir::Source, edge.to_pin);
        }
        Ok(edge)
    }

    /// Remove a component and every edge touching it.
    pub fn remove_component(&mut self, id: NodeId) -> Result<CompDev, GraphError> {
        if self.node(id).is_none() {
            return Err(GraphError::InvalidNode);
        }
        let touching: Vec<BufferId> = self
            .edges
            .iter()
            .filter(|e| e.from == id || e.to == id)
            .map(|e| e.buffer.id())
            .collect();
        for buf in touching {
            self.disconnect(buf)?;
        }
        self.nodes[id.0].take().ok_or(GraphError::InvalidNode)
    }

    /// Nodes feeding `id`.
    pub fn upstream(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.edges.iter().filter(move |e| e.to == id).map(|e| e.from)
    }

    /// Nodes fed by `id`.
    pub fn downstream(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.edges.iter().filter(move |e| e.from == id).map(|e| e.to)
    }

    /// Whether `target` can be reached from `start` along edges.
    fn reaches(&self, start: NodeId, target: NodeId) -> bool {
        let mut visited = vec![false; self.nodes.len()];
        let mut stack = vec![start];
        while let Some(cur) = stack.pop() {
            if cur == target {
                return true;
            }
            if std::mem::replace(&mut visited[cur.0], true) {
                continue;
            }
            stack.extend(self.downstream(cur));
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::StreamParams;
    use crate::component::{CompDriver, DevCtx, PathStatus};
    use crate::control::PipelineId;
    use crate::heap::Heap;
    use proptest::prelude::*;

    struct Null;

    impl CompDriver for Null {
        fn name(&self) -> &'static str {
            "null"
        }
        fn copy(&mut self, _ctx: &mut DevCtx) -> crate::error::Result<PathStatus> {
            Ok(PathStatus::Continue)
        }
    }

    fn dev(id: u32) -> CompDev {
        CompDev::new(DevCtx::new(CompId(id), PipelineId(0), 0, 1000), Box::new(Null))
    }

    fn buf(heap: &Heap, id: u32) -> Arc<CompBuffer> {
        CompBuffer::new(heap, BufferId(id), 64, StreamParams::default()).unwrap()
    }

    #[test]
    fn cycles_are_rejected() {
        let heap = Heap::unbounded();
        let mut g = Graph::new();
        let a = g.add_component(dev(1));
        let b = g.add_component(dev(2));
        g.connect(a, 0, b, 0, buf(&heap, 1)).unwrap();
        assert_eq!(g.connect(b, 0, a, 0, buf(&heap, 2)), Err(GraphError::CycleDetected));
        assert_eq!(g.connect(a, 1, a, 1, buf(&heap, 3)), Err(GraphError::CycleDetected));
        assert!(g.node(a).unwrap().ctx().pin(BindDir::Source, 0).is_none());
    }

    #[test]
    fn pins_and_buffers_are_exclusive() {
        let heap = Heap::unbounded();
        let mut g = Graph::new();
        let a = g.add_component(dev(1));
        let b = g.add_component(dev(2));
        let c = g.add_component(dev(3));
        let shared = buf(&heap, 1);
        g.connect(a, 0, b, 0, shared.clone()).unwrap();
        assert_eq!(g.connect(a, 0, c, 0, buf(&heap, 2)), Err(GraphError::PinAlreadyConnected));
        assert_eq!(g.connect(a, 1, c, 0, shared), Err(GraphError::BufferInUse));
        assert_eq!(g.connect(a, MAX_PINS, c, 0, buf(&heap, 3)), Err(GraphError::InvalidPin));
        assert_eq!(g.connect(a, 1, NodeId(9), 0, buf(&heap, 4)), Err(GraphError::InvalidNode));
    }

    #[test]
    fn removing_a_component_unbinds_its_buffers() {
        let heap = Heap::unbounded();
        let mut g = Graph::new();
        let a = g.add_component(dev(1));
        let b = g.add_component(dev(2));
        let link = buf(&heap, 1);
        g.connect(a, 0, b, 0, link.clone()).unwrap();
        let removed = g.remove_component(b).unwrap();
        assert_eq!(removed.id(), CompId(2));
        assert!(g.edges().is_empty());
        assert_eq!(link.producer(), None);
        assert_eq!(g.len(), 1);
        assert_eq!(g.find(CompId(1)), Some(a));
        assert!(g.find(CompId(2)).is_none());
    }

    proptest! {
        #[test]
        fn accepted_edges_never_form_a_cycle(pairs in proptest::collection::vec((0usize..6, 0usize..6), 0..24)) {
            let heap = Heap::unbounded();
            let mut g = Graph::new();
            let ids: Vec<NodeId> = (0..6).map(|i| g.add_component(dev(i))).collect();
            for (n, (f, t)) in pairs.into_iter().enumerate() {
                let from_pin = g.downstream(ids[f]).count();
                let to_pin = g.upstream(ids[t]).count();
                if from_pin >= MAX_PINS || to_pin >= MAX_PINS {
                    continue;
                }
                let _ = g.connect(ids[f], from_pin, ids[t], to_pin, buf(&heap, n as u32));
            }
            for e in g.edges() {
                prop_assert!(!g.reaches(e.to, e.from));
            }
        }
    }
}
