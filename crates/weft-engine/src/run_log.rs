use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use weft_core::event::{EventStream, ProcessEvent};
use weft_core::types::GraphId;

/// JSONL run recorder.
///
/// Consumes a processor's event stream and appends one JSON object per line
/// to `{log_dir}/{graph_id}/{timestamp}.jsonl`. Every line is flushed as it
/// is written, so a crashed run still leaves a readable log.
pub struct RunRecorder {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    graph_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunRecorder {
    /// `level` controls verbosity: 1 = run summary, 2 = node lifecycle,
    /// 3 = partial outputs, traces and user events too.
    pub fn new(log_dir: impl Into<PathBuf>, level: u8) -> Self {
        Self {
            log_dir: log_dir.into(),
            level,
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Record until the run ends or `cancel` fires. Returns the log path,
    /// or `None` if the file could not be created.
    pub async fn run(self, mut events: EventStream, graph_id: GraphId, cancel: CancellationToken) -> Option<PathBuf> {
        let graph_dir = self.log_dir.join(graph_id.as_str());
        if let Err(e) = tokio::fs::create_dir_all(&graph_dir).await {
            error!(error = %e, path = %graph_dir.display(), "Failed to create run log directory");
            return None;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S%.3f").to_string();
        let log_path = graph_dir.join(format!("{timestamp}.jsonl"));
        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open run log");
                return None;
            }
        };

        info!(path = %log_path.display(), "Run recorder started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Run recorder cancelled");
                    break;
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        debug!("Event stream closed, run recorder stopping");
                        break;
                    };
                    let terminal = event.is_terminal();

                    if let Some(entry) = self.entry(&graph_id, &event) {
                        if let Ok(json) = serde_json::to_string(&entry) {
                            if let Err(e) = writer.write_all(format!("{json}\n").as_bytes()).await {
                                error!(error = %e, "Failed to write run log entry");
                                break;
                            }
                            if let Err(e) = writer.flush().await {
                                error!(error = %e, "Failed to flush run log");
                            }
                        }
                    }

                    if terminal {
                        break;
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "Run recorder finished");
        Some(log_path)
    }

    fn level_of(event: &ProcessEvent) -> u8 {
        match event {
            ProcessEvent::Start { .. }
            | ProcessEvent::Done { .. }
            | ProcessEvent::Error { .. }
            | ProcessEvent::Abort { .. } => 1,
            ProcessEvent::GraphStart { .. }
            | ProcessEvent::GraphFinish { .. }
            | ProcessEvent::NodeStart { .. }
            | ProcessEvent::NodeFinish { .. }
            | ProcessEvent::NodeError { .. }
            | ProcessEvent::NodeExcluded { .. }
            | ProcessEvent::NodeOutputsCleared { .. }
            | ProcessEvent::UserInput { .. }
            | ProcessEvent::Pause
            | ProcessEvent::Resume => 2,
            ProcessEvent::PartialOutput { .. } | ProcessEvent::UserEvent { .. } | ProcessEvent::Trace { .. } => 3,
        }
    }

    fn entry(&self, graph_id: &GraphId, event: &ProcessEvent) -> Option<LogEntry> {
        if Self::level_of(event) > self.level {
            return None;
        }

        let node = event.node();
        let detail = match event {
            ProcessEvent::Start { inputs, .. } => serde_json::to_value(inputs).ok(),
            ProcessEvent::Done { results } => serde_json::to_value(results).ok(),
            ProcessEvent::Error { error } => Some(serde_json::json!({ "error": error })),
            ProcessEvent::Abort { successful, error } => {
                Some(serde_json::json!({ "successful": successful, "error": error }))
            }
            ProcessEvent::GraphStart { graph_id, depth, .. } | ProcessEvent::GraphFinish { graph_id, depth, .. } => {
                Some(serde_json::json!({ "graph_id": graph_id, "depth": depth }))
            }
            ProcessEvent::NodeStart { iteration, .. }
            | ProcessEvent::NodeExcluded { iteration, .. }
            | ProcessEvent::NodeOutputsCleared { iteration, .. } => Some(serde_json::json!({ "iteration": iteration })),
            ProcessEvent::NodeFinish { iteration, outputs, .. } => Some(serde_json::json!({
                "iteration": iteration,
                "outputs": outputs.keys().collect::<Vec<_>>(),
            })),
            ProcessEvent::NodeError { iteration, error, .. } => {
                Some(serde_json::json!({ "iteration": iteration, "error": error }))
            }
            ProcessEvent::UserInput { prompts, .. } => Some(serde_json::json!({ "prompts": prompts })),
            ProcessEvent::UserEvent { name, .. } => Some(serde_json::json!({ "name": name })),
            ProcessEvent::Trace { message, .. } => Some(serde_json::json!({ "message": message })),
            ProcessEvent::PartialOutput { .. } | ProcessEvent::Pause | ProcessEvent::Resume => None,
        };

        Some(LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            graph_id: graph_id.to_string(),
            event_type: event.name(),
            node_id: node.map(|n| n.id.to_string()),
            node_title: node.map(|n| n.title.clone()),
            detail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::event::{EventBus, NodeRef};
    use weft_core::types::{NodeId, Outputs, ProcessId};

    fn node_finish() -> ProcessEvent {
        ProcessEvent::NodeFinish {
            graph_id: GraphId::from("g"),
            node: NodeRef {
                id: NodeId::from("n1"),
                title: "Text".into(),
                node_type: "text".into(),
            },
            outputs: Outputs::new(),
            iteration: 0,
            process_id: ProcessId::new(),
        }
    }

    #[tokio::test]
    async fn test_records_until_terminal_event() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let events = bus.subscribe();

        bus.publish(ProcessEvent::Start {
            graph_id: GraphId::from("g"),
            inputs: Default::default(),
        });
        bus.publish(node_finish());
        bus.publish(ProcessEvent::Done {
            results: Default::default(),
        });

        let recorder = RunRecorder::new(dir.path(), 2);
        let path = recorder
            .run(events, GraphId::from("g"), CancellationToken::new())
            .await
            .unwrap();
        assert!(path.starts_with(dir.path().join("g")));

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1]["event_type"], "nodeFinish");
        assert_eq!(lines[1]["node_id"], "n1");
        assert_eq!(lines[2]["event_type"], "done");
    }

    #[tokio::test]
    async fn test_summary_level_skips_node_events() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let events = bus.subscribe();
        bus.publish(node_finish());
        bus.publish(ProcessEvent::Error { error: "boom".into() });

        let path = RunRecorder::new(dir.path(), 1)
            .run(events, GraphId::from("g"), CancellationToken::new())
            .await
            .unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("boom"));
    }
}
