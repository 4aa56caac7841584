pub mod coerce;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod graph;
pub mod node;
pub mod traits;
pub mod types;
pub mod value;

pub use coerce::{coerce_type, coerce_type_optional};
pub use config::{AppConfig, Settings};
pub use context::ProcessContext;
pub use error::{Result, WeftError};
pub use event::{EventBus, EventStream, ProcessEvent};
pub use graph::{Connection, Graph, Project};
pub use node::{ErrorPolicy, Node, PortDefinition, PortType};
pub use types::*;
pub use value::{ChatMessage, DataType, DataValue, Scalar, ScalarType};
