use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use weft_core::coerce::coerce_type_optional;
use weft_core::context::ProcessContext;
use weft_core::error::{Result, WeftError};
use weft_core::graph::Project;
use weft_core::node::{Node, PortDefinition};
use weft_core::traits::{LoopControl, NodeType};
use weft_core::types::{GraphId, Inputs, Outputs, PortId};
use weft_core::value::{DataType, DataValue, ScalarType};

use super::graph_io::{graph_input_ports, graph_output_ports};
use super::subgraph::{to_graph_inputs, to_outputs};
use super::outputs;

pub const BREAK_PORT: &str = "break";

/// Drives a loop inside the graph.
///
/// The first iteration reads `inputN Default`; later iterations read the
/// back-edges into `inputN`. While `continue` is truthy the values leave
/// through `outputN` and `break` is excluded; once it is falsy (or a looped
/// value is excluded) they leave through `break` instead.
pub struct LoopControllerNode;

#[derive(Debug, Deserialize)]
struct LoopControllerData {
    #[serde(default = "default_count")]
    count: usize,
    #[serde(default)]
    max_iterations: Option<usize>,
}

impl Default for LoopControllerData {
    fn default() -> Self {
        Self {
            count: default_count(),
            max_iterations: None,
        }
    }
}

fn default_count() -> usize { 1 }

impl NodeType for LoopControllerNode {
    fn type_name(&self) -> &str {
        "loop-controller"
    }

    fn display_name(&self) -> &str {
        "Loop Controller"
    }

    fn create(&self) -> Node {
        Node::new("loop-controller", "Loop Controller", json!({ "count": 1 }))
    }

    fn input_definitions(&self, node: &Node, _project: &Project) -> Vec<PortDefinition> {
        let data: LoopControllerData = node.data_or_default();
        let mut ports = vec![PortDefinition::new("continue", "Continue", DataType::BOOLEAN)];
        for i in 1..=data.count {
            ports.push(PortDefinition::new(format!("input{i}"), format!("Input {i}"), DataType::ANY));
            ports.push(PortDefinition::new(
                format!("input{i}Default"),
                format!("Input {i} Default"),
                DataType::ANY,
            ));
        }
        ports
    }

    fn output_definitions(&self, node: &Node, _project: &Project) -> Vec<PortDefinition> {
        let data: LoopControllerData = node.data_or_default();
        let mut ports = vec![PortDefinition::new(BREAK_PORT, "Break", DataType::Array(ScalarType::Any))];
        ports.extend(
            (1..=data.count)
                .map(|i| PortDefinition::new(format!("output{i}"), format!("Output {i}"), DataType::ANY)),
        );
        ports
    }

    fn process<'a>(
        &'a self,
        node: &'a Node,
        mut inputs: Inputs,
        ctx: ProcessContext,
    ) -> BoxFuture<'a, Result<Outputs>> {
        Box::pin(async move {
            let data: LoopControllerData = node.data_as()?;
            let first = ctx.loop_iteration == 0;

            let values: Vec<DataValue> = (1..=data.count)
                .map(|i| {
                    let port = if first {
                        format!("input{i}Default")
                    } else {
                        format!("input{i}")
                    };
                    inputs
                        .remove(&PortId(port))
                        .unwrap_or(DataValue::any(serde_json::Value::Null))
                })
                .collect();

            let keep_going = first
                || (values.iter().all(|v| !v.is_excluded())
                    && match inputs.get(&PortId::from("continue")) {
                        None => true,
                        Some(v) if v.is_excluded() => false,
                        Some(v) => coerce_type_optional(v, DataType::BOOLEAN)
                            .and_then(|b| b.as_bool())
                            .unwrap_or(false),
                    });

            debug!(node_id = %node.id, iteration = ctx.loop_iteration, keep_going, "Loop controller step");

            let mut result = Outputs::new();
            if keep_going {
                result.insert(PortId::from(BREAK_PORT), DataValue::excluded());
                for (i, value) in values.into_iter().enumerate() {
                    result.insert(PortId(format!("output{}", i + 1)), value);
                }
            } else {
                for i in 1..=data.count {
                    result.insert(PortId(format!("output{i}")), DataValue::excluded());
                }
                result.insert(
                    PortId::from(BREAK_PORT),
                    DataValue::Array {
                        item: ScalarType::Any,
                        values: values.iter().map(DataValue::to_scalar).collect(),
                    },
                );
            }
            Ok(result)
        })
    }

    fn accepts_excluded(&self) -> bool {
        true
    }

    fn loop_control(&self, node: &Node) -> Option<LoopControl> {
        let data: LoopControllerData = node.data_or_default();
        Some(LoopControl {
            break_port: PortId::from(BREAK_PORT),
            max_iterations: data.max_iterations,
        })
    }
}

/// Re-runs a graph, feeding each run's outputs back as the next run's
/// inputs, until the condition output is truthy.
pub struct LoopUntilNode;

#[derive(Debug, Deserialize)]
struct LoopUntilData {
    #[serde(default)]
    graph_id: Option<GraphId>,
    #[serde(default = "default_condition")]
    condition_output: String,
    #[serde(default = "default_max_iterations")]
    max_iterations: usize,
}

impl Default for LoopUntilData {
    fn default() -> Self {
        Self {
            graph_id: None,
            condition_output: default_condition(),
            max_iterations: default_max_iterations(),
        }
    }
}

fn default_condition() -> String { "done".to_string() }
fn default_max_iterations() -> usize { 100 }

impl NodeType for LoopUntilNode {
    fn type_name(&self) -> &str {
        "loop-until"
    }

    fn display_name(&self) -> &str {
        "Loop Until"
    }

    fn create(&self) -> Node {
        Node::new("loop-until", "Loop Until", json!({ "condition_output": "done" }))
    }

    fn input_definitions(&self, node: &Node, project: &Project) -> Vec<PortDefinition> {
        let data: LoopUntilData = node.data_or_default();
        data.graph_id
            .and_then(|id| project.graph(&id).map(graph_input_ports))
            .unwrap_or_default()
    }

    fn output_definitions(&self, node: &Node, project: &Project) -> Vec<PortDefinition> {
        let data: LoopUntilData = node.data_or_default();
        let mut ports = data
            .graph_id
            .and_then(|id| project.graph(&id).map(graph_output_ports))
            .unwrap_or_default();
        ports.push(PortDefinition::new("iterations", "Iterations", DataType::NUMBER).required());
        ports
    }

    fn process<'a>(
        &'a self,
        node: &'a Node,
        inputs: Inputs,
        ctx: ProcessContext,
    ) -> BoxFuture<'a, Result<Outputs>> {
        Box::pin(async move {
            let data: LoopUntilData = node.data_as()?;
            let graph_id = data.graph_id.ok_or_else(|| WeftError::InvalidNodeData {
                node_id: node.id.clone(),
                message: "no graph selected".to_string(),
            })?;

            let mut current = to_graph_inputs(inputs);
            let mut iterations = 0usize;
            loop {
                if ctx.is_aborted() {
                    return Err(WeftError::Aborted { reason: None });
                }
                if iterations >= data.max_iterations {
                    return Err(WeftError::LoopIterationLimitExceeded {
                        node_id: node.id.clone(),
                        limit: data.max_iterations,
                    });
                }
                iterations += 1;

                let results = ctx.run_subgraph(graph_id.clone(), current.clone()).await?;
                ctx.on_partial_outputs(outputs([(
                    "iterations",
                    DataValue::number(iterations as f64),
                )]));

                let done = results
                    .get(&data.condition_output)
                    .and_then(|v| coerce_type_optional(v, DataType::BOOLEAN))
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);

                if done {
                    let mut out = to_outputs(results);
                    out.insert(PortId::from("iterations"), DataValue::number(iterations as f64));
                    return Ok(out);
                }

                for (id, value) in results {
                    if let Some(slot) = current.get_mut(&id) {
                        *slot = value;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ctx(node: &Node, loop_iteration: usize) -> ProcessContext {
        ProcessContext::detached(node.clone(), Arc::new(Project::new("p")))
            .with_iteration(loop_iteration, loop_iteration)
    }

    #[tokio::test]
    async fn test_first_iteration_reads_defaults_and_continues() {
        let node = LoopControllerNode.create();
        let mut inputs = Inputs::new();
        inputs.insert(PortId::from("input1Default"), DataValue::number(0.0));
        inputs.insert(PortId::from("continue"), DataValue::boolean(false));

        let out = LoopControllerNode.process(&node, inputs, ctx(&node, 0)).await.unwrap();
        assert!(out[&PortId::from(BREAK_PORT)].is_excluded());
        assert_eq!(out[&PortId::from("output1")], DataValue::number(0.0));
    }

    #[tokio::test]
    async fn test_falsy_continue_breaks_with_values() {
        let node = LoopControllerNode.create();
        let mut inputs = Inputs::new();
        inputs.insert(PortId::from("input1"), DataValue::number(3.0));
        inputs.insert(PortId::from("continue"), DataValue::boolean(false));

        let out = LoopControllerNode.process(&node, inputs, ctx(&node, 2)).await.unwrap();
        assert!(out[&PortId::from("output1")].is_excluded());
        assert_eq!(out[&PortId::from(BREAK_PORT)].to_json(), json!([3.0]));
    }

    #[test]
    fn test_loop_control_declares_break_port() {
        let node = Node::new("loop-controller", "L", json!({"max_iterations": 5}));
        let control = LoopControllerNode.loop_control(&node).unwrap();
        assert_eq!(control.break_port, PortId::from("break"));
        assert_eq!(control.max_iterations, Some(5));
    }
}
