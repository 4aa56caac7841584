use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use weft_core::context::ProcessContext;
use weft_core::error::{Result, WeftError};
use weft_core::graph::Project;
use weft_core::node::{Node, PortDefinition};
use weft_core::traits::NodeType;
use weft_core::types::{GraphId, GraphInputs, GraphOutputs, Inputs, Outputs, PortId};
use weft_core::value::{DataType, DataValue};

use super::graph_io::{graph_input_ports, graph_output_ports};
use super::{input, input_string, outputs};

#[derive(Debug, Default, Deserialize)]
struct SubGraphData {
    #[serde(default)]
    graph_id: Option<GraphId>,
}

pub(crate) fn to_graph_inputs(inputs: Inputs) -> GraphInputs {
    inputs
        .into_iter()
        .filter(|(_, v)| !v.is_excluded())
        .map(|(port, value)| (port.0, value))
        .collect()
}

pub(crate) fn to_outputs(outputs: GraphOutputs) -> Outputs {
    outputs
        .into_iter()
        .map(|(id, value)| (PortId(id), value))
        .collect()
}

/// Runs another graph of the project. Its graph-input and graph-output
/// nodes become this node's ports.
pub struct SubGraphNode;

impl NodeType for SubGraphNode {
    fn type_name(&self) -> &str {
        "subgraph"
    }

    fn display_name(&self) -> &str {
        "Subgraph"
    }

    fn create(&self) -> Node {
        Node::new("subgraph", "Subgraph", json!({ "graph_id": null }))
    }

    fn input_definitions(&self, node: &Node, project: &Project) -> Vec<PortDefinition> {
        let data: SubGraphData = node.data_or_default();
        data.graph_id
            .and_then(|id| project.graph(&id).map(graph_input_ports))
            .unwrap_or_default()
    }

    fn output_definitions(&self, node: &Node, project: &Project) -> Vec<PortDefinition> {
        let data: SubGraphData = node.data_or_default();
        data.graph_id
            .and_then(|id| project.graph(&id).map(graph_output_ports))
            .unwrap_or_default()
    }

    fn process<'a>(
        &'a self,
        node: &'a Node,
        inputs: Inputs,
        ctx: ProcessContext,
    ) -> BoxFuture<'a, Result<Outputs>> {
        Box::pin(async move {
            let data: SubGraphData = node.data_as()?;
            let graph_id = data.graph_id.ok_or_else(|| WeftError::InvalidNodeData {
                node_id: node.id.clone(),
                message: "no graph selected".to_string(),
            })?;

            debug!(node_id = %node.id, graph_id = %graph_id, "Running subgraph");
            let results = ctx.run_subgraph(graph_id, to_graph_inputs(inputs)).await?;
            Ok(to_outputs(results))
        })
    }
}

/// Runs a graph chosen at run time by id or name. Inputs and outputs travel
/// as objects keyed by graph-input / graph-output id.
pub struct CallGraphNode;

impl NodeType for CallGraphNode {
    fn type_name(&self) -> &str {
        "call-graph"
    }

    fn display_name(&self) -> &str {
        "Call Graph"
    }

    fn create(&self) -> Node {
        Node::new("call-graph", "Call Graph", json!({}))
    }

    fn input_definitions(&self, _node: &Node, _project: &Project) -> Vec<PortDefinition> {
        vec![
            PortDefinition::new("graph", "Graph", DataType::STRING).required(),
            PortDefinition::new("inputs", "Inputs", DataType::OBJECT),
        ]
    }

    fn output_definitions(&self, _node: &Node, _project: &Project) -> Vec<PortDefinition> {
        vec![PortDefinition::new("outputs", "Outputs", DataType::OBJECT).required()]
    }

    fn process<'a>(
        &'a self,
        node: &'a Node,
        inputs: Inputs,
        ctx: ProcessContext,
    ) -> BoxFuture<'a, Result<Outputs>> {
        Box::pin(async move {
            let reference = input_string(&inputs, "graph").ok_or_else(|| WeftError::MissingInput {
                node_id: node.id.clone(),
                port: PortId::from("graph"),
            })?;
            let graph_id = ctx
                .project
                .find_graph(&reference)
                .map(|g| g.metadata.id.clone())
                .ok_or_else(|| WeftError::GraphNotFound(reference.clone()))?;

            let graph_inputs = match input(&inputs, "inputs").map(DataValue::to_json) {
                Some(Value::Object(map)) => object_to_graph_inputs(map),
                _ => GraphInputs::new(),
            };

            let results = ctx.run_subgraph(graph_id, graph_inputs).await?;
            let object = results
                .into_iter()
                .map(|(id, value)| serde_json::to_value(value).map(|v| (id, v)))
                .collect::<serde_json::Result<Map<String, Value>>>()?;
            Ok(outputs([("outputs", DataValue::object(Value::Object(object)))]))
        })
    }
}

/// Entries may be tagged values (`{"type", "value"}`) or plain JSON.
fn object_to_graph_inputs(map: Map<String, Value>) -> GraphInputs {
    map.into_iter()
        .map(|(id, raw)| {
            let value = serde_json::from_value::<DataValue>(raw.clone())
                .unwrap_or_else(|_| DataValue::infer(raw));
            (id, value)
        })
        .collect()
}
