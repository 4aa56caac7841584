use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};

use weft_core::context::ProcessContext;
use weft_core::error::{Result, WeftError};
use weft_core::graph::Project;
use weft_core::node::{Node, PortDefinition};
use weft_core::traits::NodeType;
use weft_core::types::{Inputs, Outputs, PortId};
use weft_core::value::{DataType, DataValue, Scalar};

use super::{input, input_bool, outputs};

/// Routes `value` to `output` when the condition holds, else to `falseOutput`.
/// The branch not taken is control-flow-excluded.
pub struct IfNode;

impl NodeType for IfNode {
    fn type_name(&self) -> &str {
        "if"
    }

    fn display_name(&self) -> &str {
        "If"
    }

    fn create(&self) -> Node {
        Node::new("if", "If", json!({}))
    }

    fn input_definitions(&self, _node: &Node, _project: &Project) -> Vec<PortDefinition> {
        vec![
            PortDefinition::new("if", "Condition", DataType::ANY).required(),
            PortDefinition::new("value", "Value", DataType::ANY),
        ]
    }

    fn output_definitions(&self, _node: &Node, _project: &Project) -> Vec<PortDefinition> {
        vec![
            PortDefinition::new("output", "True", DataType::ANY),
            PortDefinition::new("falseOutput", "False", DataType::ANY),
        ]
    }

    fn process<'a>(
        &'a self,
        node: &'a Node,
        inputs: Inputs,
        _ctx: ProcessContext,
    ) -> BoxFuture<'a, Result<Outputs>> {
        Box::pin(async move {
            let condition = input(&inputs, "if").ok_or_else(|| WeftError::MissingInput {
                node_id: node.id.clone(),
                port: PortId::from("if"),
            })?;
            let truthy = input_bool(&inputs, "if").unwrap_or(false);
            let value = input(&inputs, "value").unwrap_or(condition).clone();

            let (on_true, on_false) = if truthy {
                (value, DataValue::excluded())
            } else {
                (DataValue::excluded(), value)
            };
            Ok(outputs([("output", on_true), ("falseOutput", on_false)]))
        })
    }
}

/// Picks the first input that carries a value, merging branches back
/// together.
pub struct CoalesceNode;

#[derive(Debug, Deserialize)]
struct CoalesceData {
    #[serde(default = "default_count")]
    count: usize,
}

impl Default for CoalesceData {
    fn default() -> Self {
        Self { count: default_count() }
    }
}

fn default_count() -> usize { 2 }

impl NodeType for CoalesceNode {
    fn type_name(&self) -> &str {
        "coalesce"
    }

    fn display_name(&self) -> &str {
        "Coalesce"
    }

    fn create(&self) -> Node {
        Node::new("coalesce", "Coalesce", json!({ "count": 2 }))
    }

    fn input_definitions(&self, node: &Node, _project: &Project) -> Vec<PortDefinition> {
        let data: CoalesceData = node.data_or_default();
        let mut ports = vec![PortDefinition::new("conditional", "Conditional", DataType::BOOLEAN)];
        ports.extend(
            (1..=data.count)
                .map(|i| PortDefinition::new(format!("input{i}"), format!("Input {i}"), DataType::ANY)),
        );
        ports
    }

    fn output_definitions(&self, _node: &Node, _project: &Project) -> Vec<PortDefinition> {
        vec![PortDefinition::new("output", "Output", DataType::ANY)]
    }

    fn process<'a>(
        &'a self,
        node: &'a Node,
        inputs: Inputs,
        _ctx: ProcessContext,
    ) -> BoxFuture<'a, Result<Outputs>> {
        Box::pin(async move {
            let data: CoalesceData = node.data_as()?;
            if input_bool(&inputs, "conditional") == Some(false) {
                return Ok(outputs([("output", DataValue::excluded())]));
            }

            let chosen = (1..=data.count)
                .filter_map(|i| input(&inputs, &format!("input{i}")))
                .find(|v| !matches!(v, DataValue::Scalar(Scalar::Any(Value::Null))))
                .cloned()
                .unwrap_or(DataValue::ControlFlowExcluded);
            Ok(outputs([("output", chosen)]))
        })
    }

    fn accepts_excluded(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ctx(node: &Node) -> ProcessContext {
        ProcessContext::detached(node.clone(), Arc::new(Project::new("p")))
    }

    #[tokio::test]
    async fn test_if_routes_value_to_one_branch() {
        let node = IfNode.create();
        let mut inputs = Inputs::new();
        inputs.insert(PortId::from("if"), DataValue::string("false"));
        inputs.insert(PortId::from("value"), DataValue::number(1.0));

        let out = IfNode.process(&node, inputs, ctx(&node)).await.unwrap();
        assert!(out[&PortId::from("output")].is_excluded());
        assert_eq!(out[&PortId::from("falseOutput")], DataValue::number(1.0));
    }

    #[tokio::test]
    async fn test_coalesce_skips_excluded_inputs() {
        let node = CoalesceNode.create();
        let mut inputs = Inputs::new();
        inputs.insert(PortId::from("input1"), DataValue::excluded());
        inputs.insert(PortId::from("input2"), DataValue::string("b"));

        let out = CoalesceNode.process(&node, inputs, ctx(&node)).await.unwrap();
        assert_eq!(out[&PortId::from("output")], DataValue::string("b"));
    }

    #[tokio::test]
    async fn test_coalesce_all_excluded_is_excluded() {
        let node = CoalesceNode.create();
        let mut inputs = Inputs::new();
        inputs.insert(PortId::from("input1"), DataValue::excluded());

        let out = CoalesceNode.process(&node, inputs, ctx(&node)).await.unwrap();
        assert!(out[&PortId::from("output")].is_excluded());
    }
}
