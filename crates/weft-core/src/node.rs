use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, WeftError};
use crate::types::{NodeId, PortId};
use crate::value::DataType;

/// What happens to the run when a node fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorPolicy {
    /// Abort the remaining work and end the run with an error.
    #[default]
    FailRun,
    /// Mark everything downstream as skipped and keep going.
    SkipDependents,
}

/// Editor placement. Carried through, never interpreted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisualData {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
}

/// A node instance inside a graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: String,
    pub title: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub visual_data: VisualData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_policy: Option<ErrorPolicy>,
}

impl Node {
    pub fn new(node_type: impl Into<String>, title: impl Into<String>, data: Value) -> Self {
        Self {
            id: NodeId::new(),
            node_type: node_type.into(),
            title: title.into(),
            data,
            visual_data: VisualData::default(),
            error_policy: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = NodeId(id.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = Some(policy);
        self
    }

    /// Deserialize the node's configuration.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        let data = if self.data.is_null() {
            Value::Object(Default::default())
        } else {
            self.data.clone()
        };
        serde_json::from_value(data).map_err(|e| WeftError::InvalidNodeData {
            node_id: self.id.clone(),
            message: e.to_string(),
        })
    }

    /// Configuration for port derivation, falling back to defaults when the
    /// data is malformed. Malformed data still fails at `process`.
    pub fn data_or_default<T: DeserializeOwned + Default>(&self) -> T {
        self.data_as().unwrap_or_default()
    }
}

/// The declared type of a port: one kind or a union of kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortType {
    Single(DataType),
    Union(Vec<DataType>),
}

impl PortType {
    /// The kind values are coerced to when they match no member.
    pub fn primary(&self) -> DataType {
        match self {
            Self::Single(t) => *t,
            Self::Union(types) => types.first().copied().unwrap_or(DataType::ANY),
        }
    }

    pub fn accepts(&self, data_type: DataType) -> bool {
        match self {
            Self::Single(t) => *t == data_type || *t == DataType::ANY,
            Self::Union(types) => types.iter().any(|t| *t == data_type || *t == DataType::ANY),
        }
    }
}

impl From<DataType> for PortType {
    fn from(t: DataType) -> Self {
        Self::Single(t)
    }
}

fn default_true() -> bool {
    true
}

/// Declaration of one input or output port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortDefinition {
    pub id: PortId,
    pub title: String,
    pub data_type: PortType,
    #[serde(default = "default_true")]
    pub coerced: bool,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PortDefinition {
    pub fn new(id: impl Into<String>, title: impl Into<String>, data_type: impl Into<PortType>) -> Self {
        Self {
            id: PortId(id.into()),
            title: title.into(),
            data_type: data_type.into(),
            coerced: true,
            required: false,
            description: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn uncoerced(mut self) -> Self {
        self.coerced = false;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Default, Deserialize)]
    struct Sample {
        #[serde(default)]
        count: usize,
    }

    #[test]
    fn test_node_wire_form() {
        let node: Node = serde_json::from_value(json!({
            "id": "n1",
            "type": "text",
            "title": "Greeting",
            "data": {"text": "hi"}
        }))
        .unwrap();
        assert_eq!(node.id, NodeId::from("n1"));
        assert_eq!(node.node_type, "text");
        assert!(node.error_policy.is_none());
    }

    #[test]
    fn test_data_as_reports_invalid_data() {
        let node = Node::new("x", "X", json!({"count": "many"}));
        let err = node.data_as::<Sample>().unwrap_err();
        assert!(matches!(err, WeftError::InvalidNodeData { .. }));
        assert_eq!(node.data_or_default::<Sample>().count, 0);
    }

    #[test]
    fn test_null_data_reads_as_empty_object() {
        let node = Node::new("x", "X", Value::Null);
        assert_eq!(node.data_as::<Sample>().unwrap().count, 0);
    }

    #[test]
    fn test_port_type_union_deserializes() {
        let port: PortDefinition = serde_json::from_value(json!({
            "id": "content",
            "title": "Content",
            "data_type": ["string", "binary"]
        }))
        .unwrap();
        assert!(port.coerced);
        assert!(!port.required);
        assert!(port.data_type.accepts(DataType::BINARY));
        assert_eq!(port.data_type.primary(), DataType::STRING);
    }
}
