//! Copy plans: the fixed order a pipeline walks its components.

use crate::graph::{Graph, NodeId};
use crate::invariant_ppt::{assert_invariant, PLAN_COVERS_GRAPH, PLAN_TOPOLOGICAL};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Errors during plan compilation.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanError {
    CycleDetected,
    Empty,
}

impl From<PlanError> for crate::error::Error {
    fn from(e: PlanError) -> Self {
        match e {
            PlanError::CycleDetected => crate::error::Error::Invalid("component graph has a cycle"),
            PlanError::Empty => crate::error::Error::Invalid("empty component graph"),
        }
    }
}

/// Topological order plus adjacency, indexed by node id.
#[derive(Debug, Clone, PartialEq)]
pub struct CopyPlan {
    order: Vec<NodeId>,
    upstream: Vec<Vec<NodeId>>,
    downstream: Vec<Vec<NodeId>>,
}

impl CopyPlan {
    /// Order the live components so every producer precedes its consumers. Ties break
    /// on the lower node id, so a graph always compiles to the same plan.
    pub fn compile(graph: &Graph) -> Result<Self, PlanError> {
        let slots = graph.capacity();
        let mut upstream = vec![Vec::new(); slots];
        let mut downstream = vec![Vec::new(); slots];
        let mut in_degree = vec![0usize; slots];
        for e in graph.edges() {
            upstream[e.to.0].push(e.from);
            downstream[e.from.0].push(e.to);
            in_degree[e.to.0] += 1;
        }

        let mut ready: BinaryHeap<Reverse<NodeId>> = graph
            .node_ids()
            .filter(|id| in_degree[id.0] == 0)
            .map(Reverse)
            .collect();
        let mut order = Vec::with_capacity(graph.len());
        while let Some(Reverse(node)) = ready.pop() {
            order.push(node);
            for &next in &downstream[node.0] {
                in_degree[next.0] -= 1;
                if in_degree[next.0] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        if order.is_empty() {
            return Err(PlanError::Empty);
        }
        if order.len() != graph.len() {
            return Err(PlanError::CycleDetected);
        }
        let plan = Self {
            order,
            upstream,
            downstream,
        };
        assert_invariant(PLAN_COVERS_GRAPH, plan.order.len() == graph.len(), "every component planned", Some("compile"));
        assert_invariant(PLAN_TOPOLOGICAL, plan.is_topological(graph), "producers precede consumers", Some("compile"));
        tracing::debug!(components = plan.order.len(), "copy plan compiled");
        Ok(plan)
    }

    fn is_topological(&self, graph: &Graph) -> bool {
        let mut rank = vec![usize::MAX; self.upstream.len()];
        for (i, id) in self.order.iter().enumerate() {
            rank[id.0] = i;
        }
        graph.edges().iter().all(|e| rank[e.from.0] < rank[e.to.0])
    }

    /// Producers first.
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    pub fn upstream(&self, id: NodeId) -> &[NodeId] {
        self.upstream.get(id.0).map_or(&[][..], Vec::as_slice)
    }

    pub fn downstream(&self, id: NodeId) -> &[NodeId] {
        self.downstream.get(id.0).map_or(&[][..], Vec::as_slice)
    }

    /// Components nothing feeds.
    pub fn sources(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.order.iter().copied().filter(|id| self.upstream(*id).is_empty())
    }

    /// Components that feed nothing.
    pub fn sinks(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.order.iter().copied().filter(|id| self.downstream(*id).is_empty())
    }

    /// Node id slots covered, including removed ones.
    pub fn slots(&self) -> usize {
        self.upstream.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferId, CompBuffer, CompId, StreamParams};
    use crate::component::{CompDev, CompDriver, DevCtx, PathStatus};
    use crate::control::PipelineId;
    use crate::heap::Heap;

    struct Null;

    impl CompDriver for Null {
        fn name(&self) -> &'static str {
            "null"
        }
        fn copy(&mut self, _ctx: &mut DevCtx) -> crate::error::Result<PathStatus> {
            Ok(PathStatus::Continue)
        }
    }

    fn graph(n: u32, edges: &[(usize, usize, usize, usize)]) -> Graph {
        let heap = Heap::unbounded();
        let mut g = Graph::new();
        let ids: Vec<NodeId> = (0..n)
            .map(|i| g.add_component(CompDev::new(DevCtx::new(CompId(i), PipelineId(0), 0, 1000), Box::new(Null))))
            .collect();
        for (k, &(f, fp, t, tp)) in edges.iter().enumerate() {
            let b = CompBuffer::new(&heap, BufferId(k as u32), 64, StreamParams::default()).unwrap();
            g.connect(ids[f], fp, ids[t], tp, b).unwrap();
        }
        g
    }

    #[test]
    fn diamond_orders_producers_first() {
        // 3 -> 1 -> 0, 3 -> 2 -> 0
        let g = graph(4, &[(3, 0, 1, 0), (3, 1, 2, 0), (1, 0, 0, 0), (2, 0, 0, 1)]);
        let plan = CopyPlan::compile(&g).unwrap();
        assert_eq!(plan.order(), &[NodeId(3), NodeId(1), NodeId(2), NodeId(0)]);
        assert_eq!(plan.sources().collect::<Vec<_>>(), vec![NodeId(3)]);
        assert_eq!(plan.sinks().collect::<Vec<_>>(), vec![NodeId(0)]);
        assert_eq!(plan.upstream(NodeId(0)).len(), 2);
    }

    #[test]
    fn compilation_is_deterministic() {
        let g = graph(5, &[(0, 0, 2, 0), (1, 0, 2, 1), (2, 0, 3, 0), (2, 1, 4, 0)]);
        assert_eq!(CopyPlan::compile(&g).unwrap(), CopyPlan::compile(&g).unwrap());
    }

    #[test]
    fn empty_graph_has_no_plan() {
        assert_eq!(CopyPlan::compile(&Graph::new()), Err(PlanError::Empty));
    }
}
