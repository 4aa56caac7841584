use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};

use weft_core::coerce::coerce_type_optional;
use weft_core::context::ProcessContext;
use weft_core::error::Result;
use weft_core::graph::{Graph, Project};
use weft_core::node::{Node, PortDefinition};
use weft_core::traits::{GraphPort, NodeType};
use weft_core::types::{Inputs, Outputs};
use weft_core::value::{DataType, DataValue};

use super::{input, outputs};

pub const GRAPH_INPUT: &str = "graph-input";
pub const GRAPH_OUTPUT: &str = "graph-output";

#[derive(Debug, Deserialize)]
struct GraphInputData {
    #[serde(default = "default_input_id")]
    id: String,
    #[serde(default = "default_data_type")]
    data_type: DataType,
    #[serde(default)]
    use_default_value_input: bool,
    #[serde(default)]
    default_value: Option<Value>,
}

impl Default for GraphInputData {
    fn default() -> Self {
        Self {
            id: default_input_id(),
            data_type: default_data_type(),
            use_default_value_input: false,
            default_value: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GraphOutputData {
    #[serde(default = "default_output_id")]
    id: String,
    #[serde(default = "default_data_type")]
    data_type: DataType,
}

impl Default for GraphOutputData {
    fn default() -> Self {
        Self {
            id: default_output_id(),
            data_type: default_data_type(),
        }
    }
}

fn default_input_id() -> String { "input".to_string() }
fn default_output_id() -> String { "output".to_string() }
fn default_data_type() -> DataType { DataType::STRING }

/// Input ports a graph exposes to its callers, one per graph-input node.
pub fn graph_input_ports(graph: &Graph) -> Vec<PortDefinition> {
    graph
        .nodes
        .iter()
        .filter(|n| n.node_type == GRAPH_INPUT)
        .map(|n| {
            let data: GraphInputData = n.data_or_default();
            PortDefinition::new(data.id.clone(), data.id, data.data_type)
        })
        .collect()
}

/// Output ports a graph exposes to its callers, one per graph-output node.
pub fn graph_output_ports(graph: &Graph) -> Vec<PortDefinition> {
    graph
        .nodes
        .iter()
        .filter(|n| n.node_type == GRAPH_OUTPUT)
        .map(|n| {
            let data: GraphOutputData = n.data_or_default();
            PortDefinition::new(data.id.clone(), data.id, data.data_type)
        })
        .collect()
}

/// Reads one of the graph's inputs.
pub struct GraphInputNode;

impl NodeType for GraphInputNode {
    fn type_name(&self) -> &str {
        GRAPH_INPUT
    }

    fn display_name(&self) -> &str {
        "Graph Input"
    }

    fn create(&self) -> Node {
        Node::new(GRAPH_INPUT, "Graph Input", json!({ "id": "input", "data_type": "string" }))
    }

    fn input_definitions(&self, node: &Node, _project: &Project) -> Vec<PortDefinition> {
        let data: GraphInputData = node.data_or_default();
        if data.use_default_value_input {
            vec![PortDefinition::new("default", "Default", data.data_type)]
        } else {
            Vec::new()
        }
    }

    fn output_definitions(&self, node: &Node, _project: &Project) -> Vec<PortDefinition> {
        let data: GraphInputData = node.data_or_default();
        vec![PortDefinition::new("data", data.id, data.data_type)]
    }

    fn process<'a>(
        &'a self,
        node: &'a Node,
        inputs: Inputs,
        ctx: ProcessContext,
    ) -> BoxFuture<'a, Result<Outputs>> {
        Box::pin(async move {
            let data: GraphInputData = node.data_as()?;

            let value = match ctx.graph_inputs.get(&data.id) {
                Some(provided) => Some(
                    coerce_type_optional(provided, data.data_type).unwrap_or_else(|| provided.clone()),
                ),
                None => input(&inputs, "default").cloned().or_else(|| {
                    data.default_value.clone().map(|v| {
                        DataValue::from_json(data.data_type, v.clone())
                            .unwrap_or_else(|_| DataValue::infer(v))
                    })
                }),
            };

            Ok(match value {
                Some(value) => outputs([("data", value)]),
                None => Outputs::new(),
            })
        })
    }

    fn graph_port(&self, node: &Node) -> Option<GraphPort> {
        let data: GraphInputData = node.data_or_default();
        Some(GraphPort::Input {
            id: data.id,
            data_type: data.data_type,
        })
    }
}

/// Publishes a value as one of the graph's outputs.
pub struct GraphOutputNode;

impl NodeType for GraphOutputNode {
    fn type_name(&self) -> &str {
        GRAPH_OUTPUT
    }

    fn display_name(&self) -> &str {
        "Graph Output"
    }

    fn create(&self) -> Node {
        Node::new(GRAPH_OUTPUT, "Graph Output", json!({ "id": "output", "data_type": "string" }))
    }

    fn input_definitions(&self, node: &Node, _project: &Project) -> Vec<PortDefinition> {
        let data: GraphOutputData = node.data_or_default();
        vec![PortDefinition::new("value", data.id, data.data_type)]
    }

    fn output_definitions(&self, node: &Node, _project: &Project) -> Vec<PortDefinition> {
        let data: GraphOutputData = node.data_or_default();
        vec![PortDefinition::new("valueOutput", data.id, data.data_type)]
    }

    fn process<'a>(
        &'a self,
        node: &'a Node,
        inputs: Inputs,
        ctx: ProcessContext,
    ) -> BoxFuture<'a, Result<Outputs>> {
        Box::pin(async move {
            let data: GraphOutputData = node.data_as()?;
            let Some(value) = input(&inputs, "value").cloned() else {
                return Ok(Outputs::new());
            };
            ctx.set_graph_output(data.id, value.clone());
            Ok(outputs([("valueOutput", value)]))
        })
    }

    fn graph_port(&self, node: &Node) -> Option<GraphPort> {
        let data: GraphOutputData = node.data_or_default();
        Some(GraphPort::Output {
            id: data.id,
            data_type: data.data_type,
        })
    }
}
