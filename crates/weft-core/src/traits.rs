use futures::future::BoxFuture;

use crate::context::ProcessContext;
use crate::error::Result;
use crate::event::NodeRef;
use crate::graph::Project;
use crate::node::{Node, PortDefinition};
use crate::types::*;
use crate::value::{DataType, DataValue};

/// One implementation per kind of node.
///
/// Port shapes are pure functions of the node's data (and the project, for
/// nodes that reference other graphs). The engine recomputes them whenever
/// it needs them.
pub trait NodeType: Send + Sync + 'static {
    /// Type tag stored in `Node::node_type`.
    fn type_name(&self) -> &str;

    /// Human-readable name.
    fn display_name(&self) -> &str;

    /// A fresh node of this type with default data.
    fn create(&self) -> Node;

    fn input_definitions(&self, node: &Node, project: &Project) -> Vec<PortDefinition>;

    fn output_definitions(&self, node: &Node, project: &Project) -> Vec<PortDefinition>;

    /// Run the node. Inputs arrive coerced to their declared port types.
    fn process<'a>(
        &'a self,
        node: &'a Node,
        inputs: Inputs,
        ctx: ProcessContext,
    ) -> BoxFuture<'a, Result<Outputs>>;

    /// Whether `process` runs even when inputs are control-flow-excluded.
    fn accepts_excluded(&self) -> bool {
        false
    }

    /// Loop controllers declare their break port here.
    fn loop_control(&self, node: &Node) -> Option<LoopControl> {
        let _ = node;
        None
    }

    /// Nodes that bind a graph input or output declare it here.
    fn graph_port(&self, node: &Node) -> Option<GraphPort> {
        let _ = node;
        None
    }
}

/// How a loop controller is wired into the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopControl {
    /// Output that carries a value only when the loop is done.
    pub break_port: PortId,
    /// Overrides the run-wide iteration limit.
    pub max_iterations: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GraphPort {
    Input { id: String, data_type: DataType },
    Output { id: String, data_type: DataType },
}

/// Options for `NativeApi::read_dir`.
#[derive(Debug, Clone, Default)]
pub struct ReadDirOptions {
    pub recursive: bool,
    pub include_directories: bool,
    /// Return paths relative to the listed directory.
    pub relative: bool,
    /// Entries whose path contains any of these substrings are skipped.
    pub ignores: Vec<String>,
}

/// Host filesystem access for nodes that need it.
pub trait NativeApi: Send + Sync + 'static {
    fn create_dir(&self, path: String, recursive: bool) -> BoxFuture<'_, Result<()>>;

    fn read_dir(&self, path: String, options: ReadDirOptions) -> BoxFuture<'_, Result<Vec<String>>>;

    fn read_text_file(&self, path: String) -> BoxFuture<'_, Result<String>>;

    fn read_binary_file(&self, path: String) -> BoxFuture<'_, Result<Vec<u8>>>;

    fn write_text_file(&self, path: String, data: String) -> BoxFuture<'_, Result<()>>;

    fn write_binary_file(&self, path: String, data: Vec<u8>) -> BoxFuture<'_, Result<()>>;

    fn exists(&self, path: String) -> BoxFuture<'_, Result<bool>>;

    fn join(&self, parts: &[&str]) -> String;

    /// A path that does not exist yet, derived from `path`.
    fn unique_filename(&self, path: String) -> BoxFuture<'_, Result<String>>;
}

/// Token counting for context-window management.
pub trait Tokenizer: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn count_tokens(&self, text: &str) -> usize;
}

/// Run-level capabilities handed to nodes through their context.
///
/// Implemented by the engine so composite nodes can run graphs and talk to
/// the caller without depending on the engine crate.
pub trait RunHooks: Send + Sync + 'static {
    fn partial_outputs(&self, node: &Node, iteration: usize, process_id: &ProcessId, outputs: Outputs);

    fn trace(&self, node: &Node, message: String);

    fn set_graph_output(&self, id: String, value: DataValue);

    /// Run another graph of the project to completion.
    fn run_subgraph(&self, graph_id: GraphId, inputs: GraphInputs) -> BoxFuture<'_, Result<GraphOutputs>>;

    /// Ask the caller for answers and wait for them.
    fn request_user_input(
        &self,
        node: NodeRef,
        prompts: Vec<String>,
        process_id: ProcessId,
    ) -> BoxFuture<'_, Result<Vec<String>>>;

    fn raise_event(&self, name: String, value: DataValue);

    fn wait_for_event(&self, name: String) -> BoxFuture<'_, Result<DataValue>>;

    /// End the current graph. A successful abort keeps the outputs so far.
    fn abort_graph(&self, successful: bool, message: Option<String>);
}
