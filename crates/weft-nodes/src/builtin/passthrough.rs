use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;

use weft_core::context::ProcessContext;
use weft_core::error::Result;
use weft_core::graph::Project;
use weft_core::node::{Node, PortDefinition};
use weft_core::traits::NodeType;
use weft_core::types::{Inputs, Outputs, PortId};
use weft_core::value::DataType;

/// Forwards each `inputN` to `outputN` unchanged.
pub struct PassthroughNode;

#[derive(Debug, Deserialize)]
struct PassthroughData {
    #[serde(default = "default_count")]
    count: usize,
}

impl Default for PassthroughData {
    fn default() -> Self {
        Self { count: default_count() }
    }
}

fn default_count() -> usize { 1 }

impl NodeType for PassthroughNode {
    fn type_name(&self) -> &str {
        "passthrough"
    }

    fn display_name(&self) -> &str {
        "Passthrough"
    }

    fn create(&self) -> Node {
        Node::new("passthrough", "Passthrough", json!({ "count": 1 }))
    }

    fn input_definitions(&self, node: &Node, _project: &Project) -> Vec<PortDefinition> {
        let data: PassthroughData = node.data_or_default();
        (1..=data.count)
            .map(|i| PortDefinition::new(format!("input{i}"), format!("Input {i}"), DataType::ANY))
            .collect()
    }

    fn output_definitions(&self, node: &Node, _project: &Project) -> Vec<PortDefinition> {
        let data: PassthroughData = node.data_or_default();
        (1..=data.count)
            .map(|i| PortDefinition::new(format!("output{i}"), format!("Output {i}"), DataType::ANY))
            .collect()
    }

    fn process<'a>(
        &'a self,
        node: &'a Node,
        mut inputs: Inputs,
        _ctx: ProcessContext,
    ) -> BoxFuture<'a, Result<Outputs>> {
        Box::pin(async move {
            let data: PassthroughData = node.data_as()?;
            let outputs = (1..=data.count)
                .filter_map(|i| {
                    inputs
                        .remove(&PortId(format!("input{i}")))
                        .map(|v| (PortId(format!("output{i}")), v))
                })
                .collect();
            Ok(outputs)
        })
    }
}
