use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;

use weft_core::context::ProcessContext;
use weft_core::error::{Result, WeftError};
use weft_core::graph::Project;
use weft_core::node::{Node, PortDefinition};
use weft_core::traits::NodeType;
use weft_core::types::{Inputs, Outputs, PortId};
use weft_core::value::{ChatMessage, DataType, DataValue, Scalar, ScalarType};

use super::{input, outputs};

/// Drops chat messages until the rest fits a token budget.
pub struct TrimChatMessagesNode;

#[derive(Debug, Deserialize)]
struct TrimChatMessagesData {
    #[serde(default = "default_max_tokens")]
    max_token_count: usize,
    #[serde(default = "default_true")]
    remove_from_beginning: bool,
}

impl Default for TrimChatMessagesData {
    fn default() -> Self {
        Self {
            max_token_count: default_max_tokens(),
            remove_from_beginning: true,
        }
    }
}

fn default_max_tokens() -> usize { 4096 }
fn default_true() -> bool { true }

/// Per-message overhead of the chat format, in tokens.
const MESSAGE_OVERHEAD: usize = 4;

impl NodeType for TrimChatMessagesNode {
    fn type_name(&self) -> &str {
        "trim-chat-messages"
    }

    fn display_name(&self) -> &str {
        "Trim Chat Messages"
    }

    fn create(&self) -> Node {
        Node::new(
            "trim-chat-messages",
            "Trim Chat Messages",
            json!({ "max_token_count": 4096, "remove_from_beginning": true }),
        )
    }

    fn input_definitions(&self, _node: &Node, _project: &Project) -> Vec<PortDefinition> {
        vec![PortDefinition::new("input", "Input", DataType::Array(ScalarType::ChatMessage)).required()]
    }

    fn output_definitions(&self, _node: &Node, _project: &Project) -> Vec<PortDefinition> {
        vec![PortDefinition::new("trimmed", "Trimmed", DataType::Array(ScalarType::ChatMessage)).required()]
    }

    fn process<'a>(
        &'a self,
        node: &'a Node,
        inputs: Inputs,
        ctx: ProcessContext,
    ) -> BoxFuture<'a, Result<Outputs>> {
        Box::pin(async move {
            let data: TrimChatMessagesData = node.data_as()?;
            let mut messages: Vec<ChatMessage> = match input(&inputs, "input") {
                Some(DataValue::Array { values, .. }) => values
                    .iter()
                    .filter_map(|v| match v {
                        Scalar::ChatMessage(m) => Some(m.clone()),
                        _ => None,
                    })
                    .collect(),
                Some(DataValue::Scalar(Scalar::ChatMessage(m))) => vec![m.clone()],
                _ => {
                    return Err(WeftError::MissingInput {
                        node_id: node.id.clone(),
                        port: PortId::from("input"),
                    })
                }
            };

            let count = |m: &ChatMessage| -> usize {
                let text = m.content.as_str();
                let tokens = match &ctx.tokenizer {
                    Some(tokenizer) => tokenizer.count_tokens(text),
                    None => text.chars().count().div_ceil(4),
                };
                tokens + MESSAGE_OVERHEAD
            };
            if ctx.tokenizer.is_none() {
                ctx.trace("No tokenizer configured, estimating four characters per token");
            }

            let mut total: usize = messages.iter().map(count).sum();
            while total > data.max_token_count {
                let removed = if data.remove_from_beginning && !messages.is_empty() {
                    Some(messages.remove(0))
                } else {
                    messages.pop()
                };
                let Some(removed) = removed else { break };
                total -= count(&removed);
            }

            Ok(outputs([(
                "trimmed",
                DataValue::Array {
                    item: ScalarType::ChatMessage,
                    values: messages.into_iter().map(Scalar::ChatMessage).collect(),
                },
            )]))
        })
    }
}
