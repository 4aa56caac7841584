use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, WeftError};
use crate::node::Node;
use crate::types::{GraphId, NodeId, PortId};

/// A directed edge from one node's output port to another node's input port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Connection {
    pub output_node_id: NodeId,
    pub output_id: PortId,
    pub input_node_id: NodeId,
    pub input_id: PortId,
}

impl Connection {
    pub fn new(
        output_node_id: NodeId,
        output_id: impl Into<PortId>,
        input_node_id: NodeId,
        input_id: impl Into<PortId>,
    ) -> Self {
        Self {
            output_node_id,
            output_id: output_id.into(),
            input_node_id,
            input_id: input_id.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphMetadata {
    pub id: GraphId,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Graph {
    pub metadata: GraphMetadata,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            metadata: GraphMetadata {
                id: GraphId::new(),
                name: name.into(),
                description: String::new(),
            },
            nodes: Vec::new(),
            connections: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.metadata.id = GraphId(id.into());
        self
    }

    pub fn id(&self) -> &GraphId {
        &self.metadata.id
    }

    pub fn add_node(&mut self, node: Node) -> NodeId {
        let id = node.id.clone();
        self.nodes.push(node);
        id
    }

    pub fn connect(
        &mut self,
        from: &NodeId,
        output: impl Into<PortId>,
        to: &NodeId,
        input: impl Into<PortId>,
    ) {
        self.connections
            .push(Connection::new(from.clone(), output, to.clone(), input));
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    pub fn incoming<'a>(&'a self, id: &'a NodeId) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections.iter().filter(move |c| &c.input_node_id == id)
    }

    pub fn outgoing<'a>(&'a self, id: &'a NodeId) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections.iter().filter(move |c| &c.output_node_id == id)
    }

    /// Check node id uniqueness, dangling connections, and that each input
    /// port has at most one incoming connection.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| WeftError::InvalidGraph {
            graph_id: self.metadata.id.clone(),
            message,
        };

        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(&node.id) {
                return Err(invalid(format!("duplicate node id {}", node.id)));
            }
        }

        let mut inputs = HashSet::new();
        for conn in &self.connections {
            for end in [&conn.output_node_id, &conn.input_node_id] {
                if !ids.contains(end) {
                    return Err(invalid(format!("connection references unknown node {end}")));
                }
            }
            if !inputs.insert((&conn.input_node_id, &conn.input_id)) {
                return Err(invalid(format!(
                    "input {} on node {} has more than one connection",
                    conn.input_id, conn.input_node_id
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectMetadata {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_graph_id: Option<GraphId>,
    /// Where the project was loaded from. Never serialized.
    #[serde(skip)]
    pub path: Option<PathBuf>,
}

/// A set of graphs plus shared static data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub metadata: ProjectMetadata,
    #[serde(default)]
    pub graphs: HashMap<GraphId, Graph>,
    #[serde(default)]
    pub data: HashMap<String, Value>,
}

impl Project {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            metadata: ProjectMetadata {
                id: uuid::Uuid::new_v4().to_string(),
                title: title.into(),
                description: String::new(),
                main_graph_id: None,
                path: None,
            },
            graphs: HashMap::new(),
            data: HashMap::new(),
        }
    }

    /// Load a project from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut project: Project = serde_json::from_str(&content)?;
        project.metadata.path = Some(path.to_path_buf());
        Ok(project)
    }

    pub fn add_graph(&mut self, graph: Graph) -> GraphId {
        let id = graph.metadata.id.clone();
        if self.metadata.main_graph_id.is_none() {
            self.metadata.main_graph_id = Some(id.clone());
        }
        self.graphs.insert(id.clone(), graph);
        id
    }

    pub fn graph(&self, id: &GraphId) -> Option<&Graph> {
        self.graphs.get(id)
    }

    /// Look a graph up by id, falling back to its name.
    pub fn find_graph(&self, id_or_name: &str) -> Option<&Graph> {
        self.graphs
            .get(&GraphId::from(id_or_name))
            .or_else(|| self.graphs.values().find(|g| g.metadata.name == id_or_name))
    }

    pub fn main_graph(&self) -> Option<&Graph> {
        self.metadata
            .main_graph_id
            .as_ref()
            .and_then(|id| self.graphs.get(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn two_nodes() -> (Graph, NodeId, NodeId) {
        let mut graph = Graph::new("g");
        let a = graph.add_node(Node::new("text", "A", json!({})));
        let b = graph.add_node(Node::new("text", "B", json!({})));
        (graph, a, b)
    }

    #[test]
    fn test_validate_accepts_fan_out() {
        let (mut graph, a, b) = two_nodes();
        graph.connect(&a, "output", &b, "x");
        graph.connect(&a, "output", &b, "y");
        graph.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_second_connection_into_input() {
        let (mut graph, a, b) = two_nodes();
        graph.connect(&a, "output", &b, "x");
        graph.connect(&b, "output", &b, "x");
        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("more than one connection"));
    }

    #[test]
    fn test_validate_rejects_dangling_connection() {
        let (mut graph, a, _) = two_nodes();
        graph.connect(&a, "output", &NodeId::from("ghost"), "x");
        assert!(graph.validate().is_err());
    }

    #[test]
    fn test_find_graph_by_name() {
        let mut project = Project::new("p");
        let id = project.add_graph(Graph::new("main"));
        assert_eq!(project.find_graph("main").unwrap().id(), &id);
        assert_eq!(project.find_graph(id.as_str()).unwrap().id(), &id);
        assert_eq!(project.main_graph().unwrap().id(), &id);
        assert!(project.find_graph("other").is_none());
    }

    #[test]
    fn test_load_sets_path() {
        let mut project = Project::new("p");
        project.add_graph(Graph::new("main"));
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), serde_json::to_string(&project).unwrap()).unwrap();

        let loaded = Project::load(file.path()).unwrap();
        assert_eq!(loaded.metadata.path.as_deref(), Some(file.path()));
        assert_eq!(loaded.graphs.len(), 1);
    }
}
