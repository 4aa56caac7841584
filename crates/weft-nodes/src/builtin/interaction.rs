use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};

use weft_core::context::ProcessContext;
use weft_core::error::Result;
use weft_core::graph::Project;
use weft_core::node::{Node, PortDefinition};
use weft_core::traits::NodeType;
use weft_core::types::{Inputs, Outputs};
use weft_core::value::{DataType, DataValue, ScalarType};

use super::{input, input_bool, input_string, outputs};

/// Asks the caller one or more questions and waits for the answers.
pub struct UserInputNode;

#[derive(Debug, Default, Deserialize)]
struct UserInputData {
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    use_input: bool,
}

impl NodeType for UserInputNode {
    fn type_name(&self) -> &str {
        "user-input"
    }

    fn display_name(&self) -> &str {
        "User Input"
    }

    fn create(&self) -> Node {
        Node::new("user-input", "User Input", json!({ "prompt": "This is an example question?" }))
    }

    fn input_definitions(&self, node: &Node, _project: &Project) -> Vec<PortDefinition> {
        let data: UserInputData = node.data_or_default();
        if data.use_input {
            vec![PortDefinition::new("questions", "Questions", DataType::Array(ScalarType::String))]
        } else {
            Vec::new()
        }
    }

    fn output_definitions(&self, _node: &Node, _project: &Project) -> Vec<PortDefinition> {
        let strings = DataType::Array(ScalarType::String);
        vec![
            PortDefinition::new("output", "Answers Only", strings).required(),
            PortDefinition::new("questionsAndAnswers", "Q & A", strings),
        ]
    }

    fn process<'a>(
        &'a self,
        node: &'a Node,
        inputs: Inputs,
        ctx: ProcessContext,
    ) -> BoxFuture<'a, Result<Outputs>> {
        Box::pin(async move {
            let data: UserInputData = node.data_as()?;
            let prompts: Vec<String> = match input(&inputs, "questions") {
                Some(questions) if data.use_input => match questions.to_json() {
                    Value::Array(items) => items
                        .into_iter()
                        .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                        .collect(),
                    other => vec![other.as_str().map(str::to_string).unwrap_or_else(|| other.to_string())],
                },
                _ => vec![data.prompt.clone()],
            };

            let answers = ctx.request_user_input(prompts.clone()).await?;
            let qa: Vec<String> = prompts
                .iter()
                .zip(answers.iter())
                .map(|(q, a)| format!("Q: {q}\nA: {a}"))
                .collect();

            Ok(outputs([
                ("output", DataValue::string_array(answers)),
                ("questionsAndAnswers", DataValue::string_array(qa)),
            ]))
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct EventData {
    #[serde(default)]
    event_name: String,
}

fn event_name(node: &Node, inputs: &Inputs) -> Result<String> {
    let data: EventData = node.data_as()?;
    Ok(input_string(inputs, "eventName").unwrap_or(data.event_name))
}

/// Raises a named user event carrying `data`.
pub struct RaiseEventNode;

impl NodeType for RaiseEventNode {
    fn type_name(&self) -> &str {
        "raise-event"
    }

    fn display_name(&self) -> &str {
        "Raise Event"
    }

    fn create(&self) -> Node {
        Node::new("raise-event", "Raise Event", json!({ "event_name": "toast" }))
    }

    fn input_definitions(&self, _node: &Node, _project: &Project) -> Vec<PortDefinition> {
        vec![
            PortDefinition::new("eventName", "Event Name", DataType::STRING),
            PortDefinition::new("data", "Data", DataType::ANY),
        ]
    }

    fn output_definitions(&self, _node: &Node, _project: &Project) -> Vec<PortDefinition> {
        vec![PortDefinition::new("result", "Result", DataType::ANY)]
    }

    fn process<'a>(
        &'a self,
        node: &'a Node,
        inputs: Inputs,
        ctx: ProcessContext,
    ) -> BoxFuture<'a, Result<Outputs>> {
        Box::pin(async move {
            let name = event_name(node, &inputs)?;
            let value = input(&inputs, "data")
                .cloned()
                .unwrap_or(DataValue::any(Value::Null));
            ctx.raise_event(name, value.clone());
            Ok(outputs([("result", value)]))
        })
    }
}

/// Suspends until a named user event is raised.
pub struct WaitForEventNode;

impl NodeType for WaitForEventNode {
    fn type_name(&self) -> &str {
        "wait-for-event"
    }

    fn display_name(&self) -> &str {
        "Wait For Event"
    }

    fn create(&self) -> Node {
        Node::new("wait-for-event", "Wait For Event", json!({ "event_name": "continue" }))
    }

    fn input_definitions(&self, _node: &Node, _project: &Project) -> Vec<PortDefinition> {
        vec![
            PortDefinition::new("eventName", "Event Name", DataType::STRING),
            PortDefinition::new("inputData", "Data", DataType::ANY),
        ]
    }

    fn output_definitions(&self, _node: &Node, _project: &Project) -> Vec<PortDefinition> {
        vec![
            PortDefinition::new("outputData", "Data", DataType::ANY),
            PortDefinition::new("eventData", "Event Data", DataType::ANY).required(),
        ]
    }

    fn process<'a>(
        &'a self,
        node: &'a Node,
        inputs: Inputs,
        ctx: ProcessContext,
    ) -> BoxFuture<'a, Result<Outputs>> {
        Box::pin(async move {
            let name = event_name(node, &inputs)?;
            let event = ctx.wait_for_event(name).await?;
            let mut out = outputs([("eventData", event)]);
            if let Some(data) = input(&inputs, "inputData") {
                out.insert("outputData".into(), data.clone());
            }
            Ok(out)
        })
    }
}

/// Ends the current graph, either successfully or with an error.
pub struct AbortGraphNode;

#[derive(Debug, Default, Deserialize)]
struct AbortGraphData {
    #[serde(default)]
    successful: bool,
    #[serde(default)]
    error_message: String,
}

impl NodeType for AbortGraphNode {
    fn type_name(&self) -> &str {
        "abort-graph"
    }

    fn display_name(&self) -> &str {
        "Abort Graph"
    }

    fn create(&self) -> Node {
        Node::new("abort-graph", "Abort Graph", json!({ "successful": false }))
    }

    fn input_definitions(&self, _node: &Node, _project: &Project) -> Vec<PortDefinition> {
        vec![
            PortDefinition::new("data", "Data or Error", DataType::ANY),
            PortDefinition::new("successful", "Successful", DataType::BOOLEAN),
        ]
    }

    fn output_definitions(&self, _node: &Node, _project: &Project) -> Vec<PortDefinition> {
        Vec::new()
    }

    fn process<'a>(
        &'a self,
        node: &'a Node,
        inputs: Inputs,
        ctx: ProcessContext,
    ) -> BoxFuture<'a, Result<Outputs>> {
        Box::pin(async move {
            let data: AbortGraphData = node.data_as()?;
            let successful = input_bool(&inputs, "successful").unwrap_or(data.successful);

            let message = if successful {
                None
            } else {
                input_string(&inputs, "data")
                    .filter(|m| !m.is_empty())
                    .or_else(|| Some(data.error_message).filter(|m| !m.is_empty()))
            };

            ctx.abort_graph(successful, message);
            Ok(Outputs::new())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use weft_core::context::DetachedHooks;
    use weft_core::types::PortId;

    #[tokio::test]
    async fn test_raise_then_wait_outside_processor() {
        let project = Arc::new(Project::new("p"));
        let hooks = Arc::new(DetachedHooks::default());

        let raise = RaiseEventNode.create();
        let ctx = ProcessContext::new(raise.clone(), Default::default(), project.clone(), hooks.clone());
        let mut inputs = Inputs::new();
        inputs.insert(PortId::from("data"), DataValue::number(7.0));
        RaiseEventNode.process(&raise, inputs, ctx).await.unwrap();

        let wait = Node::new("wait-for-event", "Wait", json!({ "event_name": "toast" }));
        let ctx = ProcessContext::new(wait.clone(), Default::default(), project, hooks);
        let out = WaitForEventNode.process(&wait, Inputs::new(), ctx).await.unwrap();
        assert_eq!(out[&PortId::from("eventData")], DataValue::number(7.0));
    }

    #[tokio::test]
    async fn test_user_input_outside_processor_fails() {
        let node = UserInputNode.create();
        let ctx = ProcessContext::detached(node.clone(), Arc::new(Project::new("p")));
        assert!(UserInputNode.process(&node, Inputs::new(), ctx).await.is_err());
    }
}
