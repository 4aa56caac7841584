//! Shared fixtures for Weft tests: mock node types, a graph builder and
//! event helpers.

pub mod mock;

use std::sync::Arc;

use serde_json::Value;

use weft_core::event::{EventStream, ProcessEvent};
use weft_core::graph::{Graph, Project};
use weft_core::node::Node;
use weft_core::types::{GraphId, NodeId, Outputs};
use weft_nodes::NodeRegistry;

pub use mock::ConcurrencyProbe;

/// Built-in node types plus the mocks in [`mock`].
pub fn test_registry() -> Arc<NodeRegistry> {
    Arc::new(registry_with_mocks(None))
}

/// Like [`test_registry`], with `test-sleep` reporting to `probe`.
pub fn test_registry_with_probe(probe: Arc<ConcurrencyProbe>) -> Arc<NodeRegistry> {
    Arc::new(registry_with_mocks(Some(probe)))
}

fn registry_with_mocks(probe: Option<Arc<ConcurrencyProbe>>) -> NodeRegistry {
    let mut registry = NodeRegistry::with_builtins();
    registry.register(mock::ValueNode);
    registry.register(mock::IncrementNode);
    registry.register(mock::FailNode);
    registry.register(mock::StreamNode);
    registry.register(mock::OptionalOutputNode);
    registry.register(match probe {
        Some(probe) => mock::SleepNode::with_probe(probe),
        None => mock::SleepNode::default(),
    });
    registry
}

/// Builds a graph whose id equals its name.
pub struct GraphBuilder {
    graph: Graph,
}

impl GraphBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            graph: Graph::new(name).with_id(name),
        }
    }

    pub fn node(&mut self, node_type: &str, title: &str, data: Value) -> NodeId {
        self.graph.add_node(Node::new(node_type, title, data))
    }

    pub fn add(&mut self, node: Node) -> NodeId {
        self.graph.add_node(node)
    }

    pub fn connect(&mut self, from: &NodeId, output: &str, to: &NodeId, input: &str) -> &mut Self {
        self.graph.connect(from, output, to, input);
        self
    }

    pub fn build(self) -> Graph {
        self.graph
    }

    /// A project holding just this graph, as its main graph.
    pub fn into_project(self) -> (Arc<Project>, GraphId) {
        let mut project = Project::new("test");
        let id = project.add_graph(self.graph);
        (Arc::new(project), id)
    }
}

/// A project of several graphs; the first is the main graph.
pub fn project_of(graphs: impl IntoIterator<Item = Graph>) -> Arc<Project> {
    let mut project = Project::new("test");
    for graph in graphs {
        project.add_graph(graph);
    }
    Arc::new(project)
}

/// Drain a subscription until the run's terminal event.
pub async fn collect_events(mut events: EventStream) -> Vec<ProcessEvent> {
    let mut collected = Vec::new();
    while let Some(event) = events.recv().await {
        collected.push(event);
    }
    collected
}

pub fn event_names(events: &[ProcessEvent]) -> Vec<&'static str> {
    events.iter().map(ProcessEvent::name).collect()
}

/// Events named `name` about the node titled `title`.
pub fn events_for<'a>(events: &'a [ProcessEvent], name: &str, title: &str) -> Vec<&'a ProcessEvent> {
    events
        .iter()
        .filter(|e| e.name() == name && e.node().is_some_and(|n| n.title == title))
        .collect()
}

/// Outputs of every `nodeFinish` for the node titled `title`, in order.
pub fn finished_outputs<'a>(events: &'a [ProcessEvent], title: &str) -> Vec<&'a Outputs> {
    events
        .iter()
        .filter_map(|e| match e {
            ProcessEvent::NodeFinish { node, outputs, .. } if node.title == title => Some(outputs),
            _ => None,
        })
        .collect()
}
