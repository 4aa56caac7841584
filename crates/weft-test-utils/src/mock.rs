//! Node types for exercising the scheduler without real work.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};

use weft_core::context::ProcessContext;
use weft_core::error::{Result, WeftError};
use weft_core::graph::Project;
use weft_core::node::{Node, PortDefinition};
use weft_core::traits::NodeType;
use weft_core::types::{Inputs, Outputs, PortId};
use weft_core::value::{DataType, DataValue};

fn single(port: &str, value: DataValue) -> Outputs {
    Outputs::from([(PortId::from(port), value)])
}

/// Emits its `value` data as output `value`.
pub struct ValueNode;

#[derive(Debug, Default, Deserialize)]
struct ValueData {
    #[serde(default)]
    value: Value,
}

impl NodeType for ValueNode {
    fn type_name(&self) -> &str {
        "test-value"
    }

    fn display_name(&self) -> &str {
        "Test Value"
    }

    fn create(&self) -> Node {
        Node::new("test-value", "Value", json!({ "value": null }))
    }

    fn input_definitions(&self, _node: &Node, _project: &Project) -> Vec<PortDefinition> {
        Vec::new()
    }

    fn output_definitions(&self, _node: &Node, _project: &Project) -> Vec<PortDefinition> {
        vec![PortDefinition::new("value", "Value", DataType::ANY).required()]
    }

    fn process<'a>(&'a self, node: &'a Node, _inputs: Inputs, _ctx: ProcessContext) -> BoxFuture<'a, Result<Outputs>> {
        Box::pin(async move {
            let data: ValueData = node.data_as()?;
            Ok(single("value", DataValue::infer(data.value)))
        })
    }
}

/// Adds one to `value`; `continue` stays true while the result is below
/// `limit`. Drives loop-controller tests.
pub struct IncrementNode;

#[derive(Debug, Deserialize)]
struct IncrementData {
    #[serde(default = "default_limit")]
    limit: f64,
}

fn default_limit() -> f64 {
    3.0
}

impl NodeType for IncrementNode {
    fn type_name(&self) -> &str {
        "test-increment"
    }

    fn display_name(&self) -> &str {
        "Test Increment"
    }

    fn create(&self) -> Node {
        Node::new("test-increment", "Increment", json!({ "limit": 3 }))
    }

    fn input_definitions(&self, _node: &Node, _project: &Project) -> Vec<PortDefinition> {
        vec![PortDefinition::new("value", "Value", DataType::NUMBER).required()]
    }

    fn output_definitions(&self, _node: &Node, _project: &Project) -> Vec<PortDefinition> {
        vec![
            PortDefinition::new("value", "Value", DataType::NUMBER),
            PortDefinition::new("continue", "Continue", DataType::BOOLEAN),
        ]
    }

    fn process<'a>(&'a self, node: &'a Node, inputs: Inputs, _ctx: ProcessContext) -> BoxFuture<'a, Result<Outputs>> {
        Box::pin(async move {
            let data: IncrementData = node.data_as()?;
            let value = inputs
                .get(&PortId::from("value"))
                .and_then(DataValue::as_number)
                .unwrap_or_default()
                + 1.0;
            Ok(Outputs::from([
                (PortId::from("value"), DataValue::number(value)),
                (PortId::from("continue"), DataValue::boolean(value < data.limit)),
            ]))
        })
    }
}

/// Always fails with its `message` data, or panics with it when `panic`
/// is set.
pub struct FailNode;

impl NodeType for FailNode {
    fn type_name(&self) -> &str {
        "test-fail"
    }

    fn display_name(&self) -> &str {
        "Test Fail"
    }

    fn create(&self) -> Node {
        Node::new("test-fail", "Fail", json!({ "message": "boom" }))
    }

    fn input_definitions(&self, _node: &Node, _project: &Project) -> Vec<PortDefinition> {
        vec![PortDefinition::new("input", "Input", DataType::ANY)]
    }

    fn output_definitions(&self, _node: &Node, _project: &Project) -> Vec<PortDefinition> {
        vec![PortDefinition::new("output", "Output", DataType::ANY)]
    }

    fn process<'a>(&'a self, node: &'a Node, _inputs: Inputs, _ctx: ProcessContext) -> BoxFuture<'a, Result<Outputs>> {
        Box::pin(async move {
            let message = node.data["message"].as_str().unwrap_or("boom").to_string();
            if node.data["panic"].as_bool() == Some(true) {
                panic!("{message}");
            }
            Err(WeftError::NodeExecution {
                node_id: node.id.clone(),
                title: node.title.clone(),
                message,
            })
        })
    }
}

/// Tracks how many nodes run at once.
#[derive(Debug, Default)]
pub struct ConcurrencyProbe {
    current: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicUsize,
}

impl ConcurrencyProbe {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Sleeps `ms`, then passes `input` through to `output`. Stops early with
/// `Aborted` when the run is cancelled.
#[derive(Default)]
pub struct SleepNode {
    probe: Option<Arc<ConcurrencyProbe>>,
}

impl SleepNode {
    pub fn with_probe(probe: Arc<ConcurrencyProbe>) -> Self {
        Self { probe: Some(probe) }
    }
}

impl NodeType for SleepNode {
    fn type_name(&self) -> &str {
        "test-sleep"
    }

    fn display_name(&self) -> &str {
        "Test Sleep"
    }

    fn create(&self) -> Node {
        Node::new("test-sleep", "Sleep", json!({ "ms": 10 }))
    }

    fn input_definitions(&self, _node: &Node, _project: &Project) -> Vec<PortDefinition> {
        vec![PortDefinition::new("input", "Input", DataType::ANY)]
    }

    fn output_definitions(&self, _node: &Node, _project: &Project) -> Vec<PortDefinition> {
        vec![PortDefinition::new("output", "Output", DataType::ANY)]
    }

    fn process<'a>(&'a self, node: &'a Node, inputs: Inputs, ctx: ProcessContext) -> BoxFuture<'a, Result<Outputs>> {
        Box::pin(async move {
            let ms = node.data["ms"].as_u64().unwrap_or(10);
            if let Some(probe) = &self.probe {
                probe.enter();
            }
            let result = tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                    let value = inputs
                        .get(&PortId::from("input"))
                        .cloned()
                        .unwrap_or_else(|| DataValue::number(ms as f64));
                    Ok(single("output", value))
                }
                _ = ctx.signal.cancelled() => Err(WeftError::Aborted { reason: None }),
            };
            if let Some(probe) = &self.probe {
                probe.leave();
            }
            result
        })
    }
}

/// Streams its `chunks` as growing partial `response` outputs.
pub struct StreamNode;

impl NodeType for StreamNode {
    fn type_name(&self) -> &str {
        "test-stream"
    }

    fn display_name(&self) -> &str {
        "Test Stream"
    }

    fn create(&self) -> Node {
        Node::new("test-stream", "Stream", json!({ "chunks": ["Hello", ", world"] }))
    }

    fn input_definitions(&self, _node: &Node, _project: &Project) -> Vec<PortDefinition> {
        Vec::new()
    }

    fn output_definitions(&self, _node: &Node, _project: &Project) -> Vec<PortDefinition> {
        vec![PortDefinition::new("response", "Response", DataType::STRING).required()]
    }

    fn process<'a>(&'a self, node: &'a Node, _inputs: Inputs, ctx: ProcessContext) -> BoxFuture<'a, Result<Outputs>> {
        Box::pin(async move {
            let chunks: Vec<String> = node
                .data
                .get("chunks")
                .cloned()
                .map(serde_json::from_value)
                .transpose()?
                .unwrap_or_default();

            let mut response = String::new();
            for chunk in chunks {
                response.push_str(&chunk);
                ctx.on_partial_outputs(single("response", DataValue::string(response.clone())));
                tokio::task::yield_now().await;
            }
            Ok(single("response", DataValue::string(response)))
        })
    }
}

/// Declares a required `always` and an optional `maybe` output but only
/// produces `always`. With `drop_required` it produces nothing.
pub struct OptionalOutputNode;

impl NodeType for OptionalOutputNode {
    fn type_name(&self) -> &str {
        "optional-output"
    }

    fn display_name(&self) -> &str {
        "Optional Output"
    }

    fn create(&self) -> Node {
        Node::new("optional-output", "Optional", json!({}))
    }

    fn input_definitions(&self, _node: &Node, _project: &Project) -> Vec<PortDefinition> {
        Vec::new()
    }

    fn output_definitions(&self, _node: &Node, _project: &Project) -> Vec<PortDefinition> {
        vec![
            PortDefinition::new("always", "Always", DataType::STRING).required(),
            PortDefinition::new("maybe", "Maybe", DataType::STRING),
        ]
    }

    fn process<'a>(&'a self, node: &'a Node, _inputs: Inputs, _ctx: ProcessContext) -> BoxFuture<'a, Result<Outputs>> {
        Box::pin(async move {
            if node.data["drop_required"].as_bool().unwrap_or(false) {
                return Ok(Outputs::new());
            }
            Ok(single("always", DataValue::string("ok")))
        })
    }
}
