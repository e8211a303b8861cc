use orchcore::{NodeId, WorkflowDefinition, WorkflowEdge, WorkflowError, WorkflowNode};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

/// Indexed, validated view of a workflow definition used by the scheduler
pub struct WorkflowGraph {
    graph: DiGraph<NodeId, usize>,
    node_to_index: HashMap<NodeId, NodeIndex>,
    nodes: HashMap<NodeId, WorkflowNode>,
    edges: Vec<WorkflowEdge>,
    order: Vec<NodeId>,
    start: NodeId,
}

impl WorkflowGraph {
    /// Validate the definition and build its dependency graph
    pub fn build(definition: &WorkflowDefinition) -> Result<Self, WorkflowError> {
        definition.validate()?;

        let mut graph = DiGraph::new();
        let mut node_to_index = HashMap::new();

        for node in &definition.nodes {
            let idx = graph.add_node(node.id.clone());
            node_to_index.insert(node.id.clone(), idx);
        }

        // Edge weights point back into `edges`
        for (position, edge) in definition.edges.iter().enumerate() {
            let from_idx = node_to_index
                .get(&edge.source)
                .ok_or_else(|| WorkflowError::NodeNotFound(edge.source.clone()))?;
            let to_idx = node_to_index
                .get(&edge.target)
                .ok_or_else(|| WorkflowError::NodeNotFound(edge.target.clone()))?;
            graph.add_edge(*from_idx, *to_idx, position);
        }

        let sorted = toposort(&graph, None).map_err(|_| WorkflowError::CyclicDependency)?;
        let order = sorted.into_iter().map(|idx| graph[idx].clone()).collect();

        let start = definition
            .start_node()
            .map(|n| n.id.clone())
            .ok_or_else(|| WorkflowError::Invalid("missing start node".to_string()))?;

        Ok(Self {
            graph,
            node_to_index,
            nodes: definition
                .nodes
                .iter()
                .map(|n| (n.id.clone(), n.clone()))
                .collect(),
            edges: definition.edges.clone(),
            order,
            start,
        })
    }

    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.get(id)
    }

    pub fn start(&self) -> &str {
        &self.start
    }

    /// Node ids in topological order
    pub fn topological_order(&self) -> &[NodeId] {
        &self.order
    }

    /// Edges pointing at `id`
    pub fn incoming(&self, id: &str) -> Vec<&WorkflowEdge> {
        self.edges_directed(id, Direction::Incoming)
    }

    /// Distinct immediate predecessors of `id`
    pub fn predecessors(&self, id: &str) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.incoming(id)
            .into_iter()
            .map(|e| e.source.as_str())
            .filter(|source| seen.insert(*source))
            .collect()
    }

    fn edges_directed(&self, id: &str, direction: Direction) -> Vec<&WorkflowEdge> {
        use petgraph::visit::EdgeRef;

        let Some(idx) = self.node_to_index.get(id) else {
            return Vec::new();
        };
        let mut positions: Vec<usize> = self
            .graph
            .edges_directed(*idx, direction)
            .map(|e| *e.weight())
            .collect();
        // petgraph walks adjacency lists newest-first; keep definition order
        positions.sort_unstable();
        positions.into_iter().map(|p| &self.edges[p]).collect()
    }

    /// Every node reachable from the start node
    pub fn reachable_from_start(&self) -> HashSet<NodeId> {
        let mut reachable = HashSet::new();
        if let Some(start_idx) = self.node_to_index.get(&self.start) {
            let mut dfs = Dfs::new(&self.graph, *start_idx);
            while let Some(idx) = dfs.next(&self.graph) {
                reachable.insert(self.graph[idx].clone());
            }
        }
        reachable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> WorkflowDefinition {
        let mut wf = WorkflowDefinition::new("wf", "Diamond");
        wf.add_node(WorkflowNode::start("start"));
        wf.add_node(WorkflowNode::task("a", "debug.log"));
        wf.add_node(WorkflowNode::task("b", "debug.log"));
        wf.add_node(WorkflowNode::task("join", "debug.log"));
        wf.add_node(WorkflowNode::end("end"));
        wf.connect("start", "a");
        wf.connect("start", "b");
        wf.connect("a", "join");
        wf.connect("b", "join");
        wf.connect("join", "end");
        wf
    }

    #[test]
    fn test_builds_topological_order() {
        let graph = WorkflowGraph::build(&diamond()).unwrap();
        let order = graph.topological_order();
        let pos = |id: &str| order.iter().position(|n| n == id).unwrap();
        assert_eq!(order.len(), 5);
        assert!(pos("start") < pos("a"));
        assert!(pos("a") < pos("join"));
        assert!(pos("b") < pos("join"));
        assert!(pos("join") < pos("end"));
    }

    #[test]
    fn test_join_predecessors() {
        let graph = WorkflowGraph::build(&diamond()).unwrap();
        assert_eq!(graph.predecessors("join"), vec!["a", "b"]);
        assert_eq!(graph.incoming("join").len(), 2);
        assert!(graph.incoming("start").is_empty());
    }

    #[test]
    fn test_cycle_rejected() {
        let mut wf = diamond();
        wf.connect("join", "a");
        assert!(matches!(
            WorkflowGraph::build(&wf),
            Err(WorkflowError::CyclicDependency)
        ));
    }

    #[test]
    fn test_reachability_ignores_orphans() {
        let mut wf = diamond();
        wf.add_node(WorkflowNode::task("orphan", "debug.log"));
        let graph = WorkflowGraph::build(&wf).unwrap();
        let reachable = graph.reachable_from_start();
        assert!(reachable.contains("join"));
        assert!(!reachable.contains("orphan"));
    }
}
