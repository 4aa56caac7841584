use std::collections::{HashMap, HashSet, VecDeque};

use weft_core::error::{Result, WeftError};
use weft_core::graph::{Connection, Graph};
use weft_core::types::{GraphId, NodeId};
use weft_nodes::NodeRegistry;

/// The nodes a loop controller re-runs on every iteration.
#[derive(Debug, Clone)]
pub struct LoopRegion {
    pub controller: NodeId,
    /// Everything forward-reachable from the controller's non-break outputs.
    pub members: HashSet<NodeId>,
    /// Members downstream of the break port, re-armed once the loop breaks.
    pub break_members: HashSet<NodeId>,
    pub max_iterations: usize,
}

/// Static structure of a graph, computed once per run.
#[derive(Debug, Clone)]
pub struct Topology {
    graph_id: GraphId,
    /// Node ids in a topological order of the graph without its back-edges.
    order: Vec<NodeId>,
    incoming: HashMap<NodeId, Vec<Connection>>,
    outgoing: HashMap<NodeId, Vec<Connection>>,
    loops: HashMap<NodeId, LoopRegion>,
    back_edges: HashSet<Connection>,
}

impl Topology {
    /// Validate the graph, find loop regions and reject cycles that do not
    /// pass through a loop controller.
    pub fn analyze(graph: &Graph, registry: &NodeRegistry, default_max_iterations: usize) -> Result<Self> {
        graph.validate()?;

        let mut incoming: HashMap<NodeId, Vec<Connection>> = HashMap::new();
        let mut outgoing: HashMap<NodeId, Vec<Connection>> = HashMap::new();
        for node in &graph.nodes {
            incoming.entry(node.id.clone()).or_default();
            outgoing.entry(node.id.clone()).or_default();
        }
        for conn in &graph.connections {
            incoming
                .entry(conn.input_node_id.clone())
                .or_default()
                .push(conn.clone());
            outgoing
                .entry(conn.output_node_id.clone())
                .or_default()
                .push(conn.clone());
        }

        let mut topology = Self {
            graph_id: graph.metadata.id.clone(),
            order: Vec::new(),
            incoming,
            outgoing,
            loops: HashMap::new(),
            back_edges: HashSet::new(),
        };

        for node in &graph.nodes {
            let node_type = registry.resolve(&node.node_type)?;
            let Some(control) = node_type.loop_control(node) else {
                continue;
            };

            let body_starts: Vec<NodeId> = topology.outgoing[&node.id]
                .iter()
                .filter(|c| c.output_id != control.break_port)
                .map(|c| c.input_node_id.clone())
                .collect();
            let members = topology.reach_from(&node.id, body_starts);

            let break_starts: Vec<NodeId> = topology.outgoing[&node.id]
                .iter()
                .filter(|c| c.output_id == control.break_port)
                .map(|c| c.input_node_id.clone())
                .collect();
            let break_members = topology
                .reach_from(&node.id, break_starts)
                .intersection(&members)
                .cloned()
                .collect();

            for conn in &topology.incoming[&node.id] {
                if members.contains(&conn.output_node_id) {
                    topology.back_edges.insert(conn.clone());
                }
            }

            topology.loops.insert(
                node.id.clone(),
                LoopRegion {
                    controller: node.id.clone(),
                    members,
                    break_members,
                    max_iterations: control.max_iterations.unwrap_or(default_max_iterations),
                },
            );
        }

        topology.order = topology.sort(graph)?;
        Ok(topology)
    }

    /// Forward closure from `starts`, never entering `controller` itself.
    fn reach_from(&self, controller: &NodeId, starts: Vec<NodeId>) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<NodeId> = starts.into();
        while let Some(id) = queue.pop_front() {
            if &id == controller || !seen.insert(id.clone()) {
                continue;
            }
            if let Some(out) = self.outgoing.get(&id) {
                queue.extend(out.iter().map(|c| c.input_node_id.clone()));
            }
        }
        seen
    }

    /// Kahn's algorithm over the graph minus its back-edges.
    fn sort(&self, graph: &Graph) -> Result<Vec<NodeId>> {
        let mut in_degree: HashMap<&NodeId, usize> = graph.nodes.iter().map(|n| (&n.id, 0)).collect();
        for conn in &graph.connections {
            if !self.back_edges.contains(conn) {
                *in_degree.entry(&conn.input_node_id).or_default() += 1;
            }
        }

        let mut ready: VecDeque<&NodeId> = graph
            .nodes
            .iter()
            .map(|n| &n.id)
            .filter(|id| in_degree[id] == 0)
            .collect();
        let mut order = Vec::with_capacity(graph.nodes.len());

        while let Some(id) = ready.pop_front() {
            order.push(id.clone());
            for conn in &self.outgoing[id] {
                if self.back_edges.contains(conn) {
                    continue;
                }
                if let Some(degree) = in_degree.get_mut(&conn.input_node_id) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(&conn.input_node_id);
                    }
                }
            }
        }

        if order.len() != graph.nodes.len() {
            let stuck: Vec<String> = graph
                .nodes
                .iter()
                .filter(|n| !order.contains(&n.id))
                .map(|n| n.id.to_string())
                .collect();
            return Err(WeftError::InvalidGraph {
                graph_id: self.graph_id.clone(),
                message: format!(
                    "cycle without a loop controller through nodes {}",
                    stuck.join(", ")
                ),
            });
        }
        Ok(order)
    }

    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    pub fn incoming(&self, id: &NodeId) -> &[Connection] {
        self.incoming.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn outgoing(&self, id: &NodeId) -> &[Connection] {
        self.outgoing.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn is_back_edge(&self, conn: &Connection) -> bool {
        self.back_edges.contains(conn)
    }

    pub fn loop_region(&self, controller: &NodeId) -> Option<&LoopRegion> {
        self.loops.get(controller)
    }

    pub fn loop_regions(&self) -> impl Iterator<Item = &LoopRegion> {
        self.loops.values()
    }

    /// Whether `node` is re-run by the loop `controller`.
    pub fn in_region(&self, controller: &NodeId, node: &NodeId) -> bool {
        self.loops
            .get(controller)
            .is_some_and(|region| region.members.contains(node))
    }

    /// Every node upstream of `id`, following connections backwards.
    /// Back-edges are not followed.
    pub fn dependency_nodes_deep(&self, id: &NodeId) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&NodeId> = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            for conn in self.incoming(current) {
                if self.is_back_edge(conn) {
                    continue;
                }
                if seen.insert(conn.output_node_id.clone()) {
                    queue.push_back(&conn.output_node_id);
                }
            }
        }
        seen.remove(id);
        self.order.iter().filter(|n| seen.contains(*n)).cloned().collect()
    }

    /// `starts` plus everything downstream of them.
    pub fn forward_reachable(&self, starts: &[NodeId]) -> HashSet<NodeId> {
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut queue: VecDeque<&NodeId> = starts.iter().collect();
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.clone()) {
                continue;
            }
            for conn in self.outgoing(current) {
                if !self.is_back_edge(conn) {
                    queue.push_back(&conn.input_node_id);
                }
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_core::node::Node;

    fn registry() -> NodeRegistry {
        NodeRegistry::with_builtins()
    }

    #[test]
    fn test_fan_in_order() {
        let mut graph = Graph::new("g");
        let x = graph.add_node(Node::new("passthrough", "X", json!({})));
        let y = graph.add_node(Node::new("passthrough", "Y", json!({})));
        let z = graph.add_node(Node::new("text", "Z", json!({"text": "{{a}}{{b}}"})));
        graph.connect(&x, "output1", &z, "a");
        graph.connect(&y, "output1", &z, "b");

        let topology = Topology::analyze(&graph, &registry(), 100).unwrap();
        assert_eq!(topology.order().last(), Some(&z));
        assert_eq!(topology.dependency_nodes_deep(&z).len(), 2);
        assert!(topology.dependency_nodes_deep(&x).is_empty());
    }

    #[test]
    fn test_loop_region_and_back_edges() {
        let mut graph = Graph::new("g");
        let seed = graph.add_node(Node::new("passthrough", "Seed", json!({})));
        let lc = graph.add_node(Node::new("loop-controller", "Loop", json!({})));
        let body = graph.add_node(Node::new("passthrough", "Body", json!({})));
        let after = graph.add_node(Node::new("passthrough", "After", json!({})));
        graph.connect(&seed, "output1", &lc, "input1Default");
        graph.connect(&lc, "output1", &body, "input1");
        graph.connect(&body, "output1", &lc, "input1");
        graph.connect(&lc, "break", &after, "input1");

        let topology = Topology::analyze(&graph, &registry(), 100).unwrap();
        let region = topology.loop_region(&lc).unwrap();
        assert_eq!(region.members, HashSet::from([body.clone()]));
        assert!(region.break_members.is_empty());
        assert_eq!(region.max_iterations, 100);

        let back: Vec<_> = topology
            .incoming(&lc)
            .iter()
            .filter(|c| topology.is_back_edge(c))
            .collect();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].output_node_id, body);

        assert!(!topology.dependency_nodes_deep(&lc).contains(&body));
        let forward = topology.forward_reachable(&[lc.clone()]);
        assert!(forward.contains(&after) && forward.contains(&body));
        assert!(!forward.contains(&seed));
    }

    #[test]
    fn test_cycle_without_controller_is_rejected() {
        let mut graph = Graph::new("g");
        let a = graph.add_node(Node::new("passthrough", "A", json!({})));
        let b = graph.add_node(Node::new("passthrough", "B", json!({})));
        graph.connect(&a, "output1", &b, "input1");
        graph.connect(&b, "output1", &a, "input1");

        let err = Topology::analyze(&graph, &registry(), 100).unwrap_err();
        assert!(matches!(err, WeftError::InvalidGraph { .. }));
    }

    #[test]
    fn test_unknown_node_type_is_rejected() {
        let mut graph = Graph::new("g");
        graph.add_node(Node::new("does-not-exist", "?", json!({})));
        let err = Topology::analyze(&graph, &registry(), 100).unwrap_err();
        assert!(matches!(err, WeftError::UnknownNodeType(_)));
    }
}
