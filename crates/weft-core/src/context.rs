use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::error::{Result, WeftError};
use crate::event::NodeRef;
use crate::graph::Project;
use crate::node::Node;
use crate::traits::{NativeApi, RunHooks, Tokenizer};
use crate::types::*;
use crate::value::DataValue;

/// Everything a node can reach while it runs.
#[derive(Clone)]
pub struct ProcessContext {
    pub node: Node,
    pub graph_id: GraphId,
    pub project: Arc<Project>,
    pub settings: Arc<Settings>,
    /// Cancelled when the run is aborted.
    pub signal: CancellationToken,
    pub graph_inputs: Arc<GraphInputs>,
    pub tokenizer: Option<Arc<dyn Tokenizer>>,
    pub native_api: Option<Arc<dyn NativeApi>>,
    /// Per-node execution counter within the run.
    pub iteration: usize,
    /// For loop controllers: completed iterations of the current loop.
    pub loop_iteration: usize,
    pub process_id: ProcessId,
    hooks: Arc<dyn RunHooks>,
}

impl std::fmt::Debug for ProcessContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessContext")
            .field("node", &self.node.id)
            .field("graph_id", &self.graph_id)
            .field("iteration", &self.iteration)
            .field("loop_iteration", &self.loop_iteration)
            .field("process_id", &self.process_id)
            .field("tokenizer", &self.tokenizer.is_some())
            .field("native_api", &self.native_api.is_some())
            .finish()
    }
}

impl ProcessContext {
    pub fn new(
        node: Node,
        graph_id: GraphId,
        project: Arc<Project>,
        hooks: Arc<dyn RunHooks>,
    ) -> Self {
        Self {
            node,
            graph_id,
            project,
            settings: Arc::new(Settings::default()),
            signal: CancellationToken::new(),
            graph_inputs: Arc::new(GraphInputs::new()),
            tokenizer: None,
            native_api: None,
            iteration: 0,
            loop_iteration: 0,
            process_id: ProcessId::new(),
            hooks,
        }
    }

    /// A context for invoking a node outside any run.
    pub fn detached(node: Node, project: Arc<Project>) -> Self {
        let graph_id = project
            .metadata
            .main_graph_id
            .clone()
            .unwrap_or_default();
        Self::new(node, graph_id, project, Arc::new(DetachedHooks::default()))
    }

    pub fn with_settings(mut self, settings: Arc<Settings>) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = signal;
        self
    }

    pub fn with_graph_inputs(mut self, inputs: Arc<GraphInputs>) -> Self {
        self.graph_inputs = inputs;
        self
    }

    pub fn with_tokenizer(mut self, tokenizer: Option<Arc<dyn Tokenizer>>) -> Self {
        self.tokenizer = tokenizer;
        self
    }

    pub fn with_native_api(mut self, native_api: Option<Arc<dyn NativeApi>>) -> Self {
        self.native_api = native_api;
        self
    }

    pub fn with_iteration(mut self, iteration: usize, loop_iteration: usize) -> Self {
        self.iteration = iteration;
        self.loop_iteration = loop_iteration;
        self
    }

    pub fn with_process_id(mut self, process_id: ProcessId) -> Self {
        self.process_id = process_id;
        self
    }

    pub fn is_aborted(&self) -> bool {
        self.signal.is_cancelled()
    }

    /// Report outputs before `process` returns. The final outputs supersede them.
    pub fn on_partial_outputs(&self, outputs: Outputs) {
        self.hooks
            .partial_outputs(&self.node, self.iteration, &self.process_id, outputs);
    }

    pub fn trace(&self, message: impl Into<String>) {
        self.hooks.trace(&self.node, message.into());
    }

    pub fn get_plugin_config(&self, plugin: &str, key: &str) -> Option<String> {
        self.settings.plugin_config(plugin, key)
    }

    /// The host filesystem, or an error naming this node's type.
    pub fn native_api(&self) -> Result<&Arc<dyn NativeApi>> {
        self.native_api
            .as_ref()
            .ok_or_else(|| WeftError::NativeApiRequired(self.node.node_type.clone()))
    }

    pub fn set_graph_output(&self, id: impl Into<String>, value: DataValue) {
        self.hooks.set_graph_output(id.into(), value);
    }

    pub async fn run_subgraph(&self, graph_id: GraphId, inputs: GraphInputs) -> Result<GraphOutputs> {
        self.hooks.run_subgraph(graph_id, inputs).await
    }

    pub async fn request_user_input(&self, prompts: Vec<String>) -> Result<Vec<String>> {
        self.hooks
            .request_user_input(NodeRef::from(&self.node), prompts, self.process_id.clone())
            .await
    }

    pub fn raise_event(&self, name: impl Into<String>, value: DataValue) {
        self.hooks.raise_event(name.into(), value);
    }

    pub async fn wait_for_event(&self, name: impl Into<String>) -> Result<DataValue> {
        self.hooks.wait_for_event(name.into()).await
    }

    pub fn abort_graph(&self, successful: bool, message: Option<String>) {
        self.hooks.abort_graph(successful, message);
    }
}

/// Hooks for a node running outside a processor.
///
/// Graph outputs are kept so callers can inspect them; anything that needs
/// a live run fails.
#[derive(Default)]
pub struct DetachedHooks {
    pub graph_outputs: Mutex<GraphOutputs>,
    pub partial_outputs: Mutex<Vec<Outputs>>,
    pub events: Mutex<HashMap<String, DataValue>>,
}

impl RunHooks for DetachedHooks {
    fn partial_outputs(&self, _node: &Node, _iteration: usize, _process_id: &ProcessId, outputs: Outputs) {
        self.partial_outputs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(outputs);
    }

    fn trace(&self, node: &Node, message: String) {
        tracing::debug!(node_id = %node.id, "{message}");
    }

    fn set_graph_output(&self, id: String, value: DataValue) {
        self.graph_outputs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, value);
    }

    fn run_subgraph(&self, graph_id: GraphId, _inputs: GraphInputs) -> BoxFuture<'_, Result<GraphOutputs>> {
        Box::pin(async move {
            Err(WeftError::Config(format!(
                "cannot run graph {graph_id} outside a processor"
            )))
        })
    }

    fn request_user_input(
        &self,
        node: NodeRef,
        _prompts: Vec<String>,
        _process_id: ProcessId,
    ) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move { Err(WeftError::UserInputDropped(node.id)) })
    }

    fn raise_event(&self, name: String, value: DataValue) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name, value);
    }

    fn wait_for_event(&self, name: String) -> BoxFuture<'_, Result<DataValue>> {
        Box::pin(async move {
            self.events
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&name)
                .ok_or_else(|| WeftError::Config(format!("no event named {name} outside a processor")))
        })
    }

    fn abort_graph(&self, _successful: bool, _message: Option<String>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_native_api_missing_names_node_type() {
        let ctx = ProcessContext::detached(
            Node::new("read-file", "Read", json!({})),
            Arc::new(Project::new("p")),
        );
        let err = ctx.native_api().err().unwrap();
        assert_eq!(
            err.to_string(),
            "Node type read-file requires a native API, but none was provided"
        );
    }

    #[tokio::test]
    async fn test_detached_context_rejects_subgraphs() {
        let ctx = ProcessContext::detached(
            Node::new("subgraph", "Sub", json!({})),
            Arc::new(Project::new("p")),
        );
        assert!(ctx.run_subgraph(GraphId::from("g"), GraphInputs::new()).await.is_err());
    }
}
