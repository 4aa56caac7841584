//! The graph processor: dataflow scheduling of a project's graphs.

pub mod control;
pub mod processor;
pub mod run_log;
pub mod state;
pub mod streaming;
pub mod topology;

pub use processor::{GraphProcessor, RunOptions};
pub use run_log::RunRecorder;
pub use state::{LastRunData, NodeRunRecord, NodeStatus};
pub use streaming::{project_events, single_node_stream, sse_stream, EventProjector, EventStreamFilter, NodeSelector, StreamEvent};
pub use topology::{LoopRegion, Topology};
