use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;

use weft_core::context::ProcessContext;
use weft_core::error::{Result, WeftError};
use weft_core::graph::Project;
use weft_core::node::{Node, PortDefinition};
use weft_core::traits::NodeType;
use weft_core::types::{Inputs, Outputs, PortId};
use weft_core::value::DataType;

use super::input_number;

/// Waits, then passes `input1` through. Aborting the run cuts the wait short.
pub struct DelayNode;

#[derive(Debug, Default, Deserialize)]
struct DelayData {
    #[serde(default)]
    delay_ms: u64,
}

impl NodeType for DelayNode {
    fn type_name(&self) -> &str {
        "delay"
    }

    fn display_name(&self) -> &str {
        "Delay"
    }

    fn create(&self) -> Node {
        Node::new("delay", "Delay", json!({ "delay_ms": 1000 }))
    }

    fn input_definitions(&self, _node: &Node, _project: &Project) -> Vec<PortDefinition> {
        vec![
            PortDefinition::new("input1", "Input", DataType::ANY),
            PortDefinition::new("delay", "Delay (ms)", DataType::NUMBER)
                .with_description("Overrides the configured delay"),
        ]
    }

    fn output_definitions(&self, _node: &Node, _project: &Project) -> Vec<PortDefinition> {
        vec![PortDefinition::new("output1", "Output", DataType::ANY)]
    }

    fn process<'a>(
        &'a self,
        node: &'a Node,
        mut inputs: Inputs,
        ctx: ProcessContext,
    ) -> BoxFuture<'a, Result<Outputs>> {
        Box::pin(async move {
            let data: DelayData = node.data_as()?;
            let delay_ms = input_number(&inputs, "delay")
                .map(|ms| ms.max(0.0) as u64)
                .unwrap_or(data.delay_ms);

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                _ = ctx.signal.cancelled() => {
                    return Err(WeftError::Aborted { reason: None });
                }
            }

            let mut out = Outputs::new();
            if let Some(value) = inputs.remove(&PortId::from("input1")) {
                out.insert(PortId::from("output1"), value);
            }
            Ok(out)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use weft_core::value::DataValue;

    #[tokio::test(start_paused = true)]
    async fn test_delay_passes_value_through() {
        let node = DelayNode.create();
        let ctx = ProcessContext::detached(node.clone(), Arc::new(Project::new("p")));
        let mut inputs = Inputs::new();
        inputs.insert(PortId::from("input1"), DataValue::string("x"));

        let out = DelayNode.process(&node, inputs, ctx).await.unwrap();
        assert_eq!(out[&PortId::from("output1")], DataValue::string("x"));
    }

    #[tokio::test]
    async fn test_delay_stops_on_abort() {
        let node = DelayNode.create();
        let ctx = ProcessContext::detached(node.clone(), Arc::new(Project::new("p")));
        ctx.signal.cancel();

        let err = DelayNode.process(&node, Inputs::new(), ctx).await.unwrap_err();
        assert!(err.is_aborted());
    }
}
