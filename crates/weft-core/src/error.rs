use thiserror::Error;

use crate::types::{GraphId, NodeId, PortId};
use crate::value::DataType;

#[derive(Debug, Error)]
pub enum WeftError {
    // Value errors
    #[error("Cannot coerce {from} to {to}")]
    Coercion { from: DataType, to: DataType },

    // Node errors
    #[error("Node {title} ({node_id}) failed: {message}")]
    NodeExecution {
        node_id: NodeId,
        title: String,
        message: String,
    },

    #[error("Missing required input '{port}' on node {node_id}")]
    MissingInput { node_id: NodeId, port: PortId },

    #[error("Missing required output '{port}' from node {node_id}")]
    MissingOutput { node_id: NodeId, port: PortId },

    #[error("Invalid data on node {node_id}: {message}")]
    InvalidNodeData { node_id: NodeId, message: String },

    #[error("Node type {0} requires a native API, but none was provided")]
    NativeApiRequired(String),

    #[error("Native API error: {0}")]
    NativeApi(String),

    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    // Graph errors
    #[error("Graph not found: {0}")]
    GraphNotFound(String),

    #[error("Invalid graph {graph_id}: {message}")]
    InvalidGraph { graph_id: GraphId, message: String },

    #[error("Graph {graph_id} is already on the call stack: {}", join_ids(.stack))]
    CyclicGraphReference { graph_id: GraphId, stack: Vec<GraphId> },

    #[error("Loop controller {node_id} exceeded {limit} iterations")]
    LoopIterationLimitExceeded { node_id: NodeId, limit: usize },

    #[error("Missing preloaded outputs for nodes: {}", join_ids(.node_ids))]
    MissingPreloadData { node_ids: Vec<NodeId> },

    // Run control errors
    #[error("Graph execution aborted: {}", .reason.as_deref().unwrap_or("aborted by caller"))]
    Aborted { reason: Option<String> },

    #[error("Processor is already running")]
    AlreadyRunning,

    #[error("User input request for node {0} was dropped")]
    UserInputDropped(NodeId),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WeftError {
    /// Errors that end the whole run regardless of the error policy.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::CyclicGraphReference { .. }
                | Self::LoopIterationLimitExceeded { .. }
                | Self::MissingPreloadData { .. }
        )
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}

fn join_ids<T: std::fmt::Display>(ids: &[T]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub type Result<T> = std::result::Result<T, WeftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cyclic_reference_message_lists_stack() {
        let err = WeftError::CyclicGraphReference {
            graph_id: GraphId::from("a"),
            stack: vec![GraphId::from("a"), GraphId::from("b")],
        };
        assert_eq!(err.to_string(), "Graph a is already on the call stack: a -> b");
        assert!(err.is_fatal());
    }

    #[test]
    fn test_aborted_message() {
        let err = WeftError::Aborted { reason: None };
        assert_eq!(err.to_string(), "Graph execution aborted: aborted by caller");

        let err = WeftError::Aborted {
            reason: Some("stop".into()),
        };
        assert_eq!(err.to_string(), "Graph execution aborted: stop");
        assert!(!err.is_fatal());
    }
}
