use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::node::Node;
use crate::types::{GraphId, GraphInputs, GraphOutputs, Inputs, NodeId, Outputs, ProcessId};
use crate::value::DataValue;

/// Identifies the node an event is about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRef {
    pub id: NodeId,
    pub title: String,
    #[serde(rename = "type")]
    pub node_type: String,
}

impl From<&Node> for NodeRef {
    fn from(node: &Node) -> Self {
        Self {
            id: node.id.clone(),
            title: node.title.clone(),
            node_type: node.node_type.clone(),
        }
    }
}

/// Everything a run reports while it executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ProcessEvent {
    /// The top-level run started.
    Start { graph_id: GraphId, inputs: GraphInputs },
    /// A graph (top-level or nested) started executing.
    GraphStart {
        graph_id: GraphId,
        inputs: GraphInputs,
        depth: usize,
    },
    GraphFinish {
        graph_id: GraphId,
        outputs: GraphOutputs,
        depth: usize,
    },
    NodeStart {
        graph_id: GraphId,
        node: NodeRef,
        inputs: Inputs,
        iteration: usize,
        process_id: ProcessId,
    },
    PartialOutput {
        graph_id: GraphId,
        node: NodeRef,
        outputs: Outputs,
        iteration: usize,
        process_id: ProcessId,
    },
    NodeFinish {
        graph_id: GraphId,
        node: NodeRef,
        outputs: Outputs,
        iteration: usize,
        process_id: ProcessId,
    },
    NodeError {
        graph_id: GraphId,
        node: NodeRef,
        error: String,
        iteration: usize,
        process_id: Option<ProcessId>,
    },
    NodeExcluded {
        graph_id: GraphId,
        node: NodeRef,
        iteration: usize,
    },
    /// A loop re-armed the node; `iteration` is the one being discarded.
    NodeOutputsCleared {
        graph_id: GraphId,
        node: NodeRef,
        iteration: usize,
    },
    UserInput {
        graph_id: GraphId,
        node: NodeRef,
        prompts: Vec<String>,
        process_id: ProcessId,
    },
    UserEvent { name: String, value: DataValue },
    Trace {
        graph_id: GraphId,
        node: NodeRef,
        message: String,
    },
    Pause,
    Resume,
    Done { results: GraphOutputs },
    Error { error: String },
    Abort {
        successful: bool,
        error: Option<String>,
    },
}

impl ProcessEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::GraphStart { .. } => "graphStart",
            Self::GraphFinish { .. } => "graphFinish",
            Self::NodeStart { .. } => "nodeStart",
            Self::PartialOutput { .. } => "partialOutput",
            Self::NodeFinish { .. } => "nodeFinish",
            Self::NodeError { .. } => "nodeError",
            Self::NodeExcluded { .. } => "nodeExcluded",
            Self::NodeOutputsCleared { .. } => "nodeOutputsCleared",
            Self::UserInput { .. } => "userInput",
            Self::UserEvent { .. } => "userEvent",
            Self::Trace { .. } => "trace",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
            Self::Abort { .. } => "abort",
        }
    }

    /// `done`, `error` and `abort` end a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. } | Self::Abort { .. })
    }

    pub fn node(&self) -> Option<&NodeRef> {
        match self {
            Self::NodeStart { node, .. }
            | Self::PartialOutput { node, .. }
            | Self::NodeFinish { node, .. }
            | Self::NodeError { node, .. }
            | Self::NodeExcluded { node, .. }
            | Self::NodeOutputsCleared { node, .. }
            | Self::UserInput { node, .. }
            | Self::Trace { node, .. } => Some(node),
            _ => None,
        }
    }
}

/// Fan-out of processor events to any number of subscribers.
///
/// Each subscriber has its own unbounded queue, so a slow consumer never
/// loses events and never stalls the run. Subscriptions end after the next
/// terminal event.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ProcessEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, event: ProcessEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        let terminal = event.is_terminal();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        if terminal {
            subscribers.clear();
        }
    }

    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        EventStream { rx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

/// One subscriber's view of the event sequence.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<ProcessEvent>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<ProcessEvent> {
        self.rx.recv().await
    }
}

impl Stream for EventStream {
    type Item = ProcessEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_every_subscriber_sees_every_event_in_order() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(ProcessEvent::Pause);
        bus.publish(ProcessEvent::Resume);
        bus.publish(ProcessEvent::Done {
            results: Default::default(),
        });

        for stream in [&mut a, &mut b] {
            let names: Vec<_> = stream.map(|e| e.name()).collect().await;
            assert_eq!(names, vec!["pause", "resume", "done"]);
        }
    }

    #[tokio::test]
    async fn test_terminal_event_ends_subscriptions() {
        let bus = EventBus::new();
        let _stream = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        bus.publish(ProcessEvent::Error {
            error: "boom".into(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_serializes_camel_case_tag() {
        let json = serde_json::to_value(ProcessEvent::Abort {
            successful: false,
            error: Some("stop".into()),
        })
        .unwrap();
        assert_eq!(json["type"], "abort");
        assert_eq!(json["successful"], false);

        let json = serde_json::to_value(ProcessEvent::GraphStart {
            graph_id: GraphId::from("g"),
            inputs: Default::default(),
            depth: 1,
        })
        .unwrap();
        assert_eq!(json["type"], "graphStart");
        assert_eq!(json["graphId"], "g");
    }
}
