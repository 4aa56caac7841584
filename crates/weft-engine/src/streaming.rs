//! Projection of processor events into a client-facing stream.
//!
//! [`EventProjector`] turns raw [`ProcessEvent`]s into the smaller
//! [`StreamEvent`] vocabulary (text deltas, node start/finish, done, error)
//! according to an [`EventStreamFilter`]. The SSE helpers frame those events
//! for an HTTP response body.

use std::collections::HashMap;

use futures::{future, Stream, StreamExt};
use serde::{Deserialize, Serialize};

use weft_core::coerce::coerce_type_optional;
use weft_core::event::{NodeRef, ProcessEvent};
use weft_core::types::{GraphOutputs, Inputs, NodeId, Outputs, PortId};
use weft_core::value::{DataType, DataValue, ScalarType};

const RESPONSE_PORT: &str = "response";
const USAGE_PORT: &str = "usage";
const VALUE_OUTPUT_PORT: &str = "valueOutput";

/// Nodes an option applies to: every node (`true`), none (`false`), or the
/// listed node ids and titles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeSelector {
    Flag(bool),
    Nodes(Vec<String>),
}

impl Default for NodeSelector {
    fn default() -> Self {
        Self::Flag(false)
    }
}

impl NodeSelector {
    pub fn matches(&self, node: &NodeRef) -> bool {
        match self {
            Self::Flag(all) => *all,
            Self::Nodes(names) => names
                .iter()
                .any(|n| n == node.id.as_str() || n == &node.title),
        }
    }
}

/// What a stream consumer wants to see.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EventStreamFilter {
    /// Text deltas of the `response` output.
    pub partial_outputs: NodeSelector,
    pub node_start: NodeSelector,
    pub node_finish: NodeSelector,
    /// Send the graph outputs when the run is done.
    pub done: bool,
    pub error: bool,
    pub expose_cost: bool,
    pub expose_usage: bool,
    /// Drop the `output` key from the done event.
    pub remove_final_output: bool,
}

impl EventStreamFilter {
    /// Deltas and the final value of one node, by id or title.
    pub fn single_node(id_or_title: impl Into<String>) -> Self {
        let name = id_or_title.into();
        Self {
            partial_outputs: NodeSelector::Nodes(vec![name.clone()]),
            node_finish: NodeSelector::Nodes(vec![name]),
            ..Self::default()
        }
    }

    /// Graph outputs with cost, usage and final output removed per flags.
    /// `usages` is attached when usage is exposed and any were collected.
    fn redact(&self, mut results: GraphOutputs, usages: &[DataValue]) -> GraphOutputs {
        if !self.expose_cost {
            results.remove("cost");
        }
        if !self.expose_usage {
            results.remove("requestTokens");
            results.remove("responseTokens");
            results.remove("usages");
        } else if !usages.is_empty() {
            results.insert(
                "usages".to_string(),
                DataValue::Array {
                    item: ScalarType::Any,
                    values: usages.iter().map(DataValue::to_scalar).collect(),
                },
            );
        }
        if self.remove_final_output {
            results.remove("output");
        }
        results
    }
}

/// One event of the projected stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum StreamEvent {
    PartialOutput {
        node_id: NodeId,
        node_title: String,
        delta: String,
    },
    NodeStart {
        node_id: NodeId,
        node_title: String,
        inputs: Inputs,
    },
    NodeFinish {
        node_id: NodeId,
        node_title: String,
        outputs: Outputs,
    },
    Done {
        graph_output: GraphOutputs,
    },
    Error {
        error: String,
    },
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PartialOutput { .. } => "partialOutput",
            Self::NodeStart { .. } => "nodeStart",
            Self::NodeFinish { .. } => "nodeFinish",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    /// `event: <type>\ndata: <json>\n\n`
    pub fn to_sse(&self) -> String {
        let data = serde_json::to_string(self).unwrap_or_else(|_| "null".to_string());
        format!("event: {}\ndata: {}\n\n", self.name(), data)
    }
}

/// Stateful projection from processor events to stream events.
///
/// Remembers how much of each node's response was already sent, so partial
/// outputs become deltas, and collects `usage` outputs for the done event.
#[derive(Debug, Default)]
pub struct EventProjector {
    filter: EventStreamFilter,
    sent: HashMap<NodeId, usize>,
    usages: Vec<DataValue>,
}

impl EventProjector {
    pub fn new(filter: EventStreamFilter) -> Self {
        Self {
            filter,
            sent: HashMap::new(),
            usages: Vec::new(),
        }
    }

    pub fn filter(&self) -> &EventStreamFilter {
        &self.filter
    }

    pub fn project(&mut self, event: ProcessEvent) -> Option<StreamEvent> {
        match event {
            ProcessEvent::PartialOutput { node, outputs, .. } => {
                if !self.filter.partial_outputs.matches(&node) {
                    return None;
                }
                let current = response_text(&outputs);
                let sent = self.sent.entry(node.id.clone()).or_default();
                let delta: String = current.chars().skip(*sent).collect();
                *sent = current.chars().count();
                Some(StreamEvent::PartialOutput {
                    node_id: node.id,
                    node_title: node.title,
                    delta,
                })
            }
            ProcessEvent::NodeStart { node, inputs, .. } => {
                self.filter.node_start.matches(&node).then(|| StreamEvent::NodeStart {
                    node_id: node.id,
                    node_title: node.title,
                    inputs,
                })
            }
            ProcessEvent::NodeFinish { node, outputs, .. } => {
                if self.filter.expose_usage {
                    if let Some(usage) = outputs.get(&PortId::from(USAGE_PORT)) {
                        self.usages.push(usage.clone());
                    }
                }
                // A later run of the same node streams from the start again.
                self.sent.remove(&node.id);
                self.filter.node_finish.matches(&node).then(|| StreamEvent::NodeFinish {
                    node_id: node.id,
                    node_title: node.title,
                    outputs,
                })
            }
            ProcessEvent::Done { results } => self.filter.done.then(|| StreamEvent::Done {
                graph_output: self.filter.redact(results, &self.usages),
            }),
            ProcessEvent::Error { error } => {
                self.filter.error.then_some(StreamEvent::Error { error })
            }
            _ => None,
        }
    }
}

fn response_text(outputs: &Outputs) -> String {
    outputs
        .get(&PortId::from(RESPONSE_PORT))
        .and_then(|v| coerce_type_optional(v, DataType::STRING))
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

/// Filter and project a processor event stream.
pub fn project_events<S>(events: S, filter: EventStreamFilter) -> impl Stream<Item = StreamEvent>
where
    S: Stream<Item = ProcessEvent>,
{
    let mut projector = EventProjector::new(filter);
    events.filter_map(move |event| future::ready(projector.project(event)))
}

/// Projected events framed as Server-Sent Events.
pub fn sse_stream<S>(events: S, filter: EventStreamFilter) -> impl Stream<Item = String>
where
    S: Stream<Item = ProcessEvent>,
{
    project_events(events, filter).map(|event| event.to_sse())
}

/// A bare text stream for one node: `data:` frames carry response deltas
/// and the node's final `valueOutput`; `error:` and `graphOutput:` frames
/// close it.
pub fn single_node_stream<S>(events: S, filter: EventStreamFilter) -> impl Stream<Item = String>
where
    S: Stream<Item = ProcessEvent>,
{
    project_events(events, filter).map(|event| match event {
        StreamEvent::PartialOutput { delta, .. } => format!("data: {}\n\n", json(&delta)),
        StreamEvent::NodeFinish { outputs, .. } => {
            let value = outputs
                .get(&PortId::from(VALUE_OUTPUT_PORT))
                .map(DataValue::to_json)
                .unwrap_or(serde_json::Value::Null);
            format!("data: {value}\n\n")
        }
        StreamEvent::Error { error } => format!("error: {}\n\n", json(&error)),
        StreamEvent::Done { graph_output } => format!("graphOutput: {}\n\n", json(&graph_output)),
        StreamEvent::NodeStart { .. } => String::new(),
    })
    .filter(|frame| future::ready(!frame.is_empty()))
}

fn json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::types::{GraphId, ProcessId};

    fn node(id: &str, title: &str) -> NodeRef {
        NodeRef {
            id: NodeId::from(id),
            title: title.to_string(),
            node_type: "test-stream".to_string(),
        }
    }

    fn partial(node: NodeRef, text: &str) -> ProcessEvent {
        let mut outputs = Outputs::new();
        outputs.insert(PortId::from("response"), DataValue::string(text));
        ProcessEvent::PartialOutput {
            graph_id: GraphId::from("g"),
            node,
            outputs,
            iteration: 0,
            process_id: ProcessId::new(),
        }
    }

    fn done(pairs: &[(&str, DataValue)]) -> ProcessEvent {
        ProcessEvent::Done {
            results: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    #[test]
    fn test_partial_outputs_become_deltas() {
        let filter = EventStreamFilter {
            partial_outputs: NodeSelector::Nodes(vec!["Chat".into()]),
            ..Default::default()
        };
        let mut projector = EventProjector::new(filter);

        let deltas: Vec<String> = ["He", "Hello", "Hello, world"]
            .into_iter()
            .filter_map(|text| projector.project(partial(node("n1", "Chat"), text)))
            .map(|event| match event {
                StreamEvent::PartialOutput { delta, .. } => delta,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(deltas, vec!["He", "llo", ", world"]);

        assert!(projector.project(partial(node("n2", "Other"), "x")).is_none());
    }

    #[test]
    fn test_done_redacts_cost_usage_and_output() {
        let filter = EventStreamFilter {
            done: true,
            remove_final_output: true,
            ..Default::default()
        };
        let mut projector = EventProjector::new(filter);
        let event = projector
            .project(done(&[
                ("output", DataValue::string("x")),
                ("cost", DataValue::number(0.1)),
                ("requestTokens", DataValue::number(5.0)),
                ("answer", DataValue::number(42.0)),
            ]))
            .unwrap();

        let StreamEvent::Done { graph_output } = event else {
            panic!("expected done");
        };
        assert_eq!(graph_output.len(), 1);
        assert_eq!(graph_output["answer"], DataValue::number(42.0));
    }

    #[test]
    fn test_exposed_usage_is_aggregated() {
        let filter = EventStreamFilter {
            done: true,
            expose_usage: true,
            ..Default::default()
        };
        let mut projector = EventProjector::new(filter);

        let mut outputs = Outputs::new();
        outputs.insert(PortId::from("usage"), DataValue::object(serde_json::json!({ "tokens": 3 })));
        let finish = ProcessEvent::NodeFinish {
            graph_id: GraphId::from("g"),
            node: node("n1", "Chat"),
            outputs,
            iteration: 0,
            process_id: ProcessId::new(),
        };
        assert!(projector.project(finish).is_none());

        let Some(StreamEvent::Done { graph_output }) = projector.project(done(&[])) else {
            panic!("expected done");
        };
        assert!(matches!(&graph_output["usages"], DataValue::Array { values, .. } if values.len() == 1));
    }

    #[test]
    fn test_error_passes_only_when_requested() {
        let mut quiet = EventProjector::new(EventStreamFilter::default());
        assert!(quiet
            .project(ProcessEvent::Error { error: "boom".into() })
            .is_none());

        let mut loud = EventProjector::new(EventStreamFilter {
            error: true,
            ..Default::default()
        });
        let event = loud
            .project(ProcessEvent::Error { error: "boom".into() })
            .unwrap();
        assert_eq!(event.to_sse(), "event: error\ndata: {\"type\":\"error\",\"error\":\"boom\"}\n\n");
    }

    #[test]
    fn test_filter_deserializes_flags_and_lists() {
        let filter: EventStreamFilter = serde_json::from_str(
            r#"{ "partialOutputs": true, "nodeFinish": ["Out"], "done": true }"#,
        )
        .unwrap();
        assert_eq!(filter.partial_outputs, NodeSelector::Flag(true));
        assert_eq!(filter.node_finish, NodeSelector::Nodes(vec!["Out".into()]));
        assert_eq!(filter.node_start, NodeSelector::Flag(false));
        assert!(filter.done && !filter.error);
    }

    #[tokio::test]
    async fn test_single_node_stream_frames() {
        let mut outputs = Outputs::new();
        outputs.insert(PortId::from("valueOutput"), DataValue::string("Hi!"));
        let events = futures::stream::iter(vec![
            partial(node("n1", "Out"), "Hi"),
            partial(node("n1", "Out"), "Hi!"),
            ProcessEvent::NodeFinish {
                graph_id: GraphId::from("g"),
                node: node("n1", "Out"),
                outputs,
                iteration: 0,
                process_id: ProcessId::new(),
            },
        ]);

        let frames: Vec<String> = single_node_stream(events, EventStreamFilter::single_node("Out"))
            .collect()
            .await;
        assert_eq!(frames, vec!["data: \"Hi\"\n\n", "data: \"!\"\n\n", "data: \"Hi!\"\n\n"]);
    }
}
