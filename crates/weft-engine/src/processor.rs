use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weft_core::coerce::coerce_to_port;
use weft_core::config::{EngineConfig, Settings};
use weft_core::context::ProcessContext;
use weft_core::error::{Result, WeftError};
use weft_core::event::{EventBus, EventStream, NodeRef, ProcessEvent};
use weft_core::graph::Project;
use weft_core::node::{ErrorPolicy, Node};
use weft_core::traits::{GraphPort, LoopControl, NativeApi, NodeType, RunHooks, Tokenizer};
use weft_core::types::{GraphId, GraphInputs, GraphOutputs, Inputs, NodeId, Outputs, ProcessId};
use weft_core::value::DataValue;
use weft_nodes::NodeRegistry;

use crate::control::{UserEventHub, UserInputBroker};
use crate::state::{LastRunData, LoopPhase, NodeRunRecord, NodeState, NodeStatus};
use crate::topology::{LoopRegion, Topology};

/// Per-run scheduling options.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Maximum nodes in flight per graph (0 = unbounded).
    pub max_concurrency: usize,
    /// Iteration limit for loop controllers that do not set their own.
    pub max_loop_iterations: usize,
    /// What a node error does to the run, unless the node overrides it.
    pub error_policy: ErrorPolicy,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for RunOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency,
            max_loop_iterations: config.max_loop_iterations,
            error_policy: config.error_policy,
        }
    }
}

#[derive(Debug, Clone)]
struct AbortRequest {
    successful: bool,
    message: Option<String>,
}

type AbortSlot = Arc<Mutex<Option<AbortRequest>>>;

/// Channels shared by the processor handle and every graph of its run.
struct Control {
    bus: Arc<EventBus>,
    paused: watch::Sender<bool>,
    user_input: UserInputBroker,
    user_events: UserEventHub,
    last_run: Mutex<LastRunData>,
}

/// Everything a graph run needs, shared with the graphs it calls.
struct Runtime {
    project: Arc<Project>,
    registry: Arc<NodeRegistry>,
    settings: Arc<Settings>,
    options: RunOptions,
    native_api: Option<Arc<dyn NativeApi>>,
    tokenizer: Option<Arc<dyn Tokenizer>>,
    control: Arc<Control>,
}

/// What to run and where it sits in the call stack.
struct GraphPlan {
    graph_id: GraphId,
    inputs: GraphInputs,
    depth: usize,
    stack: Vec<GraphId>,
    signal: CancellationToken,
    abort: AbortSlot,
    preloaded: HashMap<NodeId, Outputs>,
    run_from: Vec<NodeId>,
}

/// Runs one graph of a project.
///
/// Build it, subscribe to [`events`](Self::events), then await
/// [`run`](Self::run). While the run is in flight the handle accepts
/// `abort`, `pause`, `resume`, `user_input` and `raise_event`.
pub struct GraphProcessor {
    project: Arc<Project>,
    graph_id: GraphId,
    registry: Arc<NodeRegistry>,
    inputs: GraphInputs,
    options: RunOptions,
    settings: Arc<Settings>,
    native_api: Option<Arc<dyn NativeApi>>,
    tokenizer: Option<Arc<dyn Tokenizer>>,
    preloaded: HashMap<NodeId, Outputs>,
    run_from: Vec<NodeId>,
    control: Arc<Control>,
    running: AtomicBool,
    signal: Mutex<CancellationToken>,
    abort: AbortSlot,
}

impl GraphProcessor {
    pub fn new(project: Arc<Project>, graph_id: GraphId, registry: Arc<NodeRegistry>) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            project,
            graph_id,
            registry,
            inputs: GraphInputs::new(),
            options: RunOptions::default(),
            settings: Arc::new(Settings::default()),
            native_api: None,
            tokenizer: None,
            preloaded: HashMap::new(),
            run_from: Vec::new(),
            control: Arc::new(Control {
                bus: Arc::new(EventBus::new()),
                paused,
                user_input: UserInputBroker::new(),
                user_events: UserEventHub::new(),
                last_run: Mutex::new(LastRunData::default()),
            }),
            running: AtomicBool::new(false),
            signal: Mutex::new(CancellationToken::new()),
            abort: AbortSlot::default(),
        }
    }

    pub fn with_inputs(mut self, inputs: GraphInputs) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_settings(mut self, settings: Arc<Settings>) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_native_api(mut self, native_api: Arc<dyn NativeApi>) -> Self {
        self.native_api = Some(native_api);
        self
    }

    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    /// Outputs to use for upstream nodes in a partial run.
    pub fn with_preloaded_outputs(mut self, outputs: HashMap<NodeId, Outputs>) -> Self {
        self.preloaded = outputs;
        self
    }

    /// Run only this node and everything downstream of it. May be called
    /// more than once.
    pub fn run_from_node(mut self, node_id: NodeId) -> Self {
        self.run_from.push(node_id);
        self
    }

    pub fn graph_id(&self) -> &GraphId {
        &self.graph_id
    }

    /// Subscribe to this processor's events. Subscribe before `run` to see
    /// the whole sequence; the stream ends after `done`, `error` or `abort`.
    pub fn events(&self) -> EventStream {
        self.control.bus.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        *self.control.paused.borrow()
    }

    /// Execute the graph to completion and return its outputs.
    pub async fn run(&self) -> Result<GraphOutputs> {
        let signal = {
            let mut current = self.signal.lock().unwrap_or_else(|e| e.into_inner());
            if self.running.swap(true, Ordering::SeqCst) {
                return Err(WeftError::AlreadyRunning);
            }
            let signal = CancellationToken::new();
            *current = signal.clone();
            *self.abort.lock().unwrap_or_else(|e| e.into_inner()) = None;
            signal
        };
        let guard = RunGuard {
            processor: self,
            signal: signal.clone(),
            finished: false,
        };

        self.control
            .last_run
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.control.user_events.reset();
        self.control.user_input.clear().await;
        self.control.paused.send_replace(false);

        let runtime = Arc::new(Runtime {
            project: self.project.clone(),
            registry: self.registry.clone(),
            settings: self.settings.clone(),
            options: self.options.clone(),
            native_api: self.native_api.clone(),
            tokenizer: self.tokenizer.clone(),
            control: self.control.clone(),
        });

        info!(graph_id = %self.graph_id, partial = !self.run_from.is_empty(), "Graph run started");
        self.control.bus.publish(ProcessEvent::Start {
            graph_id: self.graph_id.clone(),
            inputs: self.inputs.clone(),
        });

        let plan = GraphPlan {
            graph_id: self.graph_id.clone(),
            inputs: self.inputs.clone(),
            depth: 0,
            stack: vec![self.graph_id.clone()],
            signal: signal.clone(),
            abort: self.abort.clone(),
            preloaded: self.preloaded.clone(),
            run_from: self.run_from.clone(),
        };
        let result = execute_graph(runtime, plan).await;

        let terminal = match &result {
            Ok(_) if signal.is_cancelled() => {
                info!(graph_id = %self.graph_id, "Graph run aborted successfully");
                ProcessEvent::Abort {
                    successful: true,
                    error: None,
                }
            }
            Ok(outputs) => {
                info!(graph_id = %self.graph_id, outputs = outputs.len(), "Graph run complete");
                ProcessEvent::Done {
                    results: outputs.clone(),
                }
            }
            Err(e) if e.is_aborted() => {
                warn!(graph_id = %self.graph_id, error = %e, "Graph run aborted");
                ProcessEvent::Abort {
                    successful: false,
                    error: Some(e.to_string()),
                }
            }
            Err(e) => {
                error!(graph_id = %self.graph_id, error = %e, "Graph run failed");
                ProcessEvent::Error {
                    error: e.to_string(),
                }
            }
        };

        guard.finish(terminal);
        result
    }

    /// Stop the run. In-flight nodes are cancelled through their signal and
    /// awaited before the `abort` event. A successful abort returns the
    /// outputs gathered so far. No-op when nothing is running.
    pub fn abort(&self, successful: bool, error: Option<String>) {
        let signal = self.signal.lock().unwrap_or_else(|e| e.into_inner());
        if !self.is_running() {
            debug!(graph_id = %self.graph_id, "Abort ignored, processor is not running");
            return;
        }
        {
            let mut slot = self.abort.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(AbortRequest {
                    successful,
                    message: error,
                });
            }
        }
        signal.cancel();
    }

    /// Stop dispatching new nodes. Running nodes finish.
    pub fn pause(&self) {
        if !self.control.paused.send_replace(true) {
            debug!(graph_id = %self.graph_id, "Processor paused");
            self.control.bus.publish(ProcessEvent::Pause);
        }
    }

    pub fn resume(&self) {
        if self.control.paused.send_replace(false) {
            debug!(graph_id = %self.graph_id, "Processor resumed");
            self.control.bus.publish(ProcessEvent::Resume);
        }
    }

    /// Answer a pending user-input request. Returns false if the node is
    /// not waiting for input.
    pub async fn user_input(&self, node_id: &NodeId, answers: Vec<String>) -> bool {
        self.control.user_input.respond(node_id, answers).await
    }

    /// Nodes currently waiting for user input.
    pub async fn pending_user_input(&self) -> Vec<NodeId> {
        self.control.user_input.pending_requests().await
    }

    /// Raise a user event into the run, waking any `wait-for-event` node.
    pub fn raise_event(&self, name: impl Into<String>, value: DataValue) {
        let name = name.into();
        self.control.user_events.raise(&name, value.clone());
        self.control.bus.publish(ProcessEvent::UserEvent { name, value });
    }

    pub fn last_run_data(&self) -> LastRunData {
        self.control
            .last_run
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Transitive upstream closure of a node in this processor's graph.
    pub fn dependency_nodes_deep(&self, node_id: &NodeId) -> Result<Vec<NodeId>> {
        let graph = self
            .project
            .graph(&self.graph_id)
            .ok_or_else(|| WeftError::GraphNotFound(self.graph_id.to_string()))?;
        if graph.node(node_id).is_none() {
            return Err(WeftError::NodeNotFound(node_id.clone()));
        }
        let topology = Topology::analyze(graph, &self.registry, self.options.max_loop_iterations)?;
        Ok(topology.dependency_nodes_deep(node_id))
    }
}

/// Clears `running` when a run ends. A run whose future is dropped before
/// it finishes is cancelled and reported with an unsuccessful `abort`.
struct RunGuard<'a> {
    processor: &'a GraphProcessor,
    signal: CancellationToken,
    finished: bool,
}

impl RunGuard<'_> {
    fn finish(mut self, terminal: ProcessEvent) {
        self.finished = true;
        self.processor.running.store(false, Ordering::SeqCst);
        self.processor.control.bus.publish(terminal);
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!(graph_id = %self.processor.graph_id, "Graph run dropped before it finished");
        self.signal.cancel();
        self.processor.running.store(false, Ordering::SeqCst);
        self.processor.control.bus.publish(ProcessEvent::Abort {
            successful: false,
            error: Some("run was dropped before it finished".to_string()),
        });
    }
}

fn execute_graph(runtime: Arc<Runtime>, plan: GraphPlan) -> BoxFuture<'static, Result<GraphOutputs>> {
    Box::pin(async move {
        let run = GraphRun::prepare(runtime, plan)?;
        run.execute().await
    })
}

/// Capabilities handed to the nodes of one graph run.
struct GraphHooks {
    runtime: Arc<Runtime>,
    graph_id: GraphId,
    depth: usize,
    stack: Vec<GraphId>,
    signal: CancellationToken,
    abort: AbortSlot,
    outputs: Mutex<GraphOutputs>,
}

impl GraphHooks {
    fn publish(&self, event: ProcessEvent) {
        self.runtime.control.bus.publish(event);
    }

    fn take_outputs(&self) -> GraphOutputs {
        std::mem::take(&mut *self.outputs.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl RunHooks for GraphHooks {
    fn partial_outputs(&self, node: &Node, iteration: usize, process_id: &ProcessId, outputs: Outputs) {
        self.publish(ProcessEvent::PartialOutput {
            graph_id: self.graph_id.clone(),
            node: NodeRef::from(node),
            outputs,
            iteration,
            process_id: process_id.clone(),
        });
    }

    fn trace(&self, node: &Node, message: String) {
        debug!(graph_id = %self.graph_id, node_id = %node.id, "{message}");
        self.publish(ProcessEvent::Trace {
            graph_id: self.graph_id.clone(),
            node: NodeRef::from(node),
            message,
        });
    }

    fn set_graph_output(&self, id: String, value: DataValue) {
        self.outputs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, value);
    }

    fn run_subgraph(&self, graph_id: GraphId, inputs: GraphInputs) -> BoxFuture<'_, Result<GraphOutputs>> {
        if self.stack.contains(&graph_id) {
            let err = WeftError::CyclicGraphReference {
                graph_id,
                stack: self.stack.clone(),
            };
            return Box::pin(async move { Err(err) });
        }

        let mut stack = self.stack.clone();
        stack.push(graph_id.clone());
        let plan = GraphPlan {
            graph_id,
            inputs,
            depth: self.depth + 1,
            stack,
            signal: self.signal.child_token(),
            abort: AbortSlot::default(),
            preloaded: HashMap::new(),
            run_from: Vec::new(),
        };
        execute_graph(self.runtime.clone(), plan)
    }

    fn request_user_input(
        &self,
        node: NodeRef,
        prompts: Vec<String>,
        process_id: ProcessId,
    ) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            let rx = self.runtime.control.user_input.request(node.id.clone()).await;
            let node_id = node.id.clone();
            self.publish(ProcessEvent::UserInput {
                graph_id: self.graph_id.clone(),
                node,
                prompts,
                process_id,
            });

            let answered = tokio::select! {
                answers = rx => answers.map_err(|_| WeftError::UserInputDropped(node_id.clone())),
                _ = self.signal.cancelled() => Err(WeftError::Aborted { reason: None }),
            };
            if answered.is_err() {
                self.runtime.control.user_input.withdraw(&node_id).await;
            }
            answered
        })
    }

    fn raise_event(&self, name: String, value: DataValue) {
        self.runtime.control.user_events.raise(&name, value.clone());
        self.publish(ProcessEvent::UserEvent { name, value });
    }

    fn wait_for_event(&self, name: String) -> BoxFuture<'_, Result<DataValue>> {
        Box::pin(async move {
            let rx = self.runtime.control.user_events.wait(&name);
            tokio::select! {
                value = rx => value.map_err(|_| WeftError::Aborted {
                    reason: Some(format!("event {name} was discarded"))
                }),
                _ = self.signal.cancelled() => Err(WeftError::Aborted { reason: None }),
            }
        })
    }

    fn abort_graph(&self, successful: bool, message: Option<String>) {
        info!(graph_id = %self.graph_id, successful, "Graph aborted by node");
        {
            let mut slot = self.abort.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(AbortRequest { successful, message });
            }
        }
        self.signal.cancel();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// A finished `process` call, handed back to the dispatch loop.
struct Completion {
    node_id: NodeId,
    process_id: ProcessId,
    iteration: usize,
    inputs: Inputs,
    started_at: DateTime<Utc>,
    result: Result<Outputs>,
}

enum Readiness {
    Wait,
    Run(Inputs),
    Exclude,
    Skip,
    Fail(Inputs, WeftError),
}

/// The state table and dispatch loop of one graph execution.
struct GraphRun {
    runtime: Arc<Runtime>,
    graph_id: GraphId,
    depth: usize,
    topology: Arc<Topology>,
    nodes: HashMap<NodeId, Node>,
    types: HashMap<NodeId, Arc<dyn NodeType>>,
    states: HashMap<NodeId, NodeState>,
    active: Option<HashSet<NodeId>>,
    inputs: Arc<GraphInputs>,
    hooks: Arc<GraphHooks>,
    signal: CancellationToken,
    fatal: Option<WeftError>,
}

impl GraphRun {
    fn prepare(runtime: Arc<Runtime>, plan: GraphPlan) -> Result<Self> {
        let graph = runtime
            .project
            .graph(&plan.graph_id)
            .cloned()
            .ok_or_else(|| WeftError::GraphNotFound(plan.graph_id.to_string()))?;
        let topology = Topology::analyze(&graph, &runtime.registry, runtime.options.max_loop_iterations)?;

        let types = graph
            .nodes
            .iter()
            .map(|n| Ok((n.id.clone(), runtime.registry.resolve(&n.node_type)?)))
            .collect::<Result<HashMap<_, _>>>()?;
        let mut states: HashMap<NodeId, NodeState> = graph
            .nodes
            .iter()
            .map(|n| (n.id.clone(), NodeState::default()))
            .collect();

        let active = if plan.run_from.is_empty() {
            None
        } else {
            if let Some(unknown) = plan.run_from.iter().find(|id| !states.contains_key(*id)) {
                return Err(WeftError::NodeNotFound(unknown.clone()));
            }
            let active = topology.forward_reachable(&plan.run_from);
            let needed: HashSet<NodeId> = active
                .iter()
                .flat_map(|id| topology.dependency_nodes_deep(id))
                .filter(|id| !active.contains(id))
                .collect();

            let mut missing = Vec::new();
            for id in topology.order().iter().filter(|id| needed.contains(*id)) {
                match plan.preloaded.get(id) {
                    Some(outputs) => {
                        states.insert(id.clone(), NodeState::preloaded(outputs.clone()));
                    }
                    None => missing.push(id.clone()),
                }
            }
            if !missing.is_empty() {
                return Err(WeftError::MissingPreloadData { node_ids: missing });
            }
            debug!(graph_id = %plan.graph_id, active = active.len(), preloaded = needed.len(), "Partial run planned");
            Some(active)
        };

        let hooks = Arc::new(GraphHooks {
            runtime: runtime.clone(),
            graph_id: plan.graph_id.clone(),
            depth: plan.depth,
            stack: plan.stack,
            signal: plan.signal.clone(),
            abort: plan.abort,
            outputs: Mutex::new(GraphOutputs::new()),
        });

        Ok(Self {
            runtime,
            graph_id: plan.graph_id,
            depth: plan.depth,
            topology: Arc::new(topology),
            nodes: graph.nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
            types,
            states,
            active,
            inputs: Arc::new(plan.inputs),
            hooks,
            signal: plan.signal,
            fatal: None,
        })
    }

    async fn execute(mut self) -> Result<GraphOutputs> {
        self.hooks.publish(ProcessEvent::GraphStart {
            graph_id: self.graph_id.clone(),
            inputs: (*self.inputs).clone(),
            depth: self.depth,
        });
        debug!(graph_id = %self.graph_id, depth = self.depth, nodes = self.nodes.len(), "Graph started");

        let signal = self.signal.clone();
        let mut paused = self.runtime.control.paused.subscribe();
        let mut pause_open = true;
        let mut cancel_seen = false;
        let mut in_flight: FuturesUnordered<BoxFuture<'static, Completion>> = FuturesUnordered::new();

        loop {
            let is_paused = *paused.borrow_and_update();
            if !self.halted() && !is_paused {
                self.schedule(&mut in_flight);
            }
            if in_flight.is_empty() && (self.halted() || !is_paused) {
                break;
            }

            tokio::select! {
                Some(done) = in_flight.next() => self.on_complete(done),
                _ = signal.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    debug!(graph_id = %self.graph_id, in_flight = in_flight.len(), "Graph cancelled, draining running nodes");
                }
                changed = paused.changed(), if pause_open => {
                    if changed.is_err() {
                        pause_open = false;
                    }
                }
                else => break,
            }
        }

        if let Some(err) = self.fatal.take() {
            return Err(err);
        }

        let outputs = self.hooks.take_outputs();
        if self.signal.is_cancelled() {
            let request = self.hooks.abort.lock().unwrap_or_else(|e| e.into_inner()).clone();
            return match request {
                Some(AbortRequest { successful: true, .. }) => Ok(outputs),
                Some(AbortRequest { message, .. }) => Err(WeftError::Aborted { reason: message }),
                None => Err(WeftError::Aborted { reason: None }),
            };
        }

        let stuck: Vec<&NodeId> = self
            .topology
            .order()
            .iter()
            .filter(|id| self.is_active(id) && self.states[*id].status == NodeStatus::Pending)
            .collect();
        if !stuck.is_empty() {
            warn!(graph_id = %self.graph_id, nodes = ?stuck, "Nodes never became ready");
        }

        self.hooks.publish(ProcessEvent::GraphFinish {
            graph_id: self.graph_id.clone(),
            outputs: outputs.clone(),
            depth: self.depth,
        });
        debug!(graph_id = %self.graph_id, depth = self.depth, "Graph finished");
        Ok(outputs)
    }

    fn halted(&self) -> bool {
        self.fatal.is_some() || self.signal.is_cancelled()
    }

    fn is_active(&self, id: &NodeId) -> bool {
        self.active.as_ref().map_or(true, |active| active.contains(id))
    }

    fn state_mut(&mut self, id: &NodeId) -> &mut NodeState {
        self.states.entry(id.clone()).or_default()
    }

    fn at_capacity(&self, in_flight: usize) -> bool {
        let max = self.runtime.options.max_concurrency;
        max > 0 && in_flight >= max
    }

    /// Resolve everything that can be resolved without running a node,
    /// and dispatch every ready node, until nothing changes.
    fn schedule(&mut self, in_flight: &mut FuturesUnordered<BoxFuture<'static, Completion>>) {
        let topology = self.topology.clone();
        loop {
            let mut progressed = false;

            for region in topology.loop_regions() {
                let controller = &region.controller;
                let state = &self.states[controller];
                if self.is_active(controller)
                    && state.status == NodeStatus::Complete
                    && state.loop_phase == LoopPhase::Iterating
                    && self.region_settled(region)
                {
                    let state = self.state_mut(controller);
                    state.status = NodeStatus::Pending;
                    state.iteration += 1;
                    progressed = true;
                }
            }

            for id in topology.order() {
                if !self.is_active(id) || self.states[id].status != NodeStatus::Pending {
                    continue;
                }
                match self.readiness(id) {
                    Readiness::Wait => {}
                    Readiness::Run(inputs) => {
                        if self.at_capacity(in_flight.len()) {
                            continue;
                        }
                        in_flight.push(self.dispatch(id, inputs));
                        progressed = true;
                    }
                    Readiness::Exclude => {
                        self.exclude(id);
                        progressed = true;
                    }
                    Readiness::Skip => {
                        self.skip(id);
                        progressed = true;
                    }
                    Readiness::Fail(inputs, err) => {
                        self.fail(id, inputs, err, None, Utc::now());
                        progressed = true;
                    }
                }
                if self.halted() {
                    return;
                }
            }

            if !progressed {
                break;
            }
        }
    }

    fn region_settled(&self, region: &LoopRegion) -> bool {
        region
            .members
            .iter()
            .filter(|id| self.is_active(id))
            .all(|id| {
                let state = &self.states[id];
                state.status.is_resolved()
                    && !(state.status == NodeStatus::Complete && state.loop_phase == LoopPhase::Iterating)
            })
    }

    /// Whether `viewer` may read `source` now. A loop that is still
    /// iterating is only visible inside its own region.
    fn source_resolved(&self, source: &NodeId, viewer: &NodeId) -> bool {
        let state = &self.states[source];
        match state.status {
            NodeStatus::Pending | NodeStatus::Running => false,
            NodeStatus::Complete if state.loop_phase == LoopPhase::Iterating => {
                self.topology.in_region(source, viewer)
            }
            _ => true,
        }
    }

    fn readiness(&self, id: &NodeId) -> Readiness {
        let state = &self.states[id];
        let node = &self.nodes[id];
        let node_type = &self.types[id];

        let mut inputs = Inputs::new();
        let mut connected = 0usize;
        let mut excluded = 0usize;
        let mut failed = false;

        for conn in self.topology.incoming(id) {
            // The first iteration of a loop runs without its back-edges.
            if state.loop_iteration == 0 && self.topology.is_back_edge(conn) {
                continue;
            }
            if !self.source_resolved(&conn.output_node_id, id) {
                return Readiness::Wait;
            }
            connected += 1;

            let source = &self.states[&conn.output_node_id];
            if source.status.is_failed() {
                failed = true;
                continue;
            }
            let value = match source.status {
                NodeStatus::Excluded => Some(DataValue::excluded()),
                _ => source
                    .outputs
                    .as_ref()
                    .and_then(|outputs| outputs.get(&conn.output_id))
                    .cloned(),
            };
            if let Some(value) = value {
                if value.is_excluded() {
                    excluded += 1;
                }
                inputs.insert(conn.input_id.clone(), value);
            }
        }

        if failed {
            return Readiness::Skip;
        }

        let definitions = node_type.input_definitions(node, &self.runtime.project);
        if !node_type.accepts_excluded() {
            let required_excluded = definitions
                .iter()
                .any(|d| d.required && inputs.get(&d.id).is_some_and(DataValue::is_excluded));
            if (connected > 0 && excluded == connected) || required_excluded {
                return Readiness::Exclude;
            }
            inputs.retain(|_, value| !value.is_excluded());
        }

        if let Some(missing) = definitions
            .iter()
            .find(|d| d.required && !inputs.contains_key(&d.id))
        {
            let err = WeftError::MissingInput {
                node_id: id.clone(),
                port: missing.id.clone(),
            };
            return Readiness::Fail(inputs, err);
        }

        for definition in definitions.iter().filter(|d| d.coerced) {
            let Some(value) = inputs.get(&definition.id) else {
                continue;
            };
            match coerce_to_port(value, &definition.data_type) {
                Ok(coerced) => {
                    inputs.insert(definition.id.clone(), coerced);
                }
                Err(err) => return Readiness::Fail(inputs, err),
            }
        }

        Readiness::Run(inputs)
    }

    fn dispatch(&mut self, id: &NodeId, inputs: Inputs) -> BoxFuture<'static, Completion> {
        let node = self.nodes[id].clone();
        let node_type = self.types[id].clone();
        let state = self.state_mut(id);
        state.status = NodeStatus::Running;
        let (iteration, loop_iteration) = (state.iteration, state.loop_iteration);
        let process_id = ProcessId::new();

        debug!(graph_id = %self.graph_id, node_id = %id, node_type = %node.node_type, iteration, "Dispatching node");
        self.hooks.publish(ProcessEvent::NodeStart {
            graph_id: self.graph_id.clone(),
            node: NodeRef::from(&node),
            inputs: inputs.clone(),
            iteration,
            process_id: process_id.clone(),
        });

        let ctx = ProcessContext::new(
            node.clone(),
            self.graph_id.clone(),
            self.runtime.project.clone(),
            self.hooks.clone(),
        )
        .with_settings(self.runtime.settings.clone())
        .with_signal(self.signal.clone())
        .with_graph_inputs(self.inputs.clone())
        .with_tokenizer(self.runtime.tokenizer.clone())
        .with_native_api(self.runtime.native_api.clone())
        .with_iteration(iteration, loop_iteration)
        .with_process_id(process_id.clone());

        let started_at = Utc::now();
        async move {
            let result = AssertUnwindSafe(node_type.process(&node, inputs.clone(), ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(WeftError::NodeExecution {
                        node_id: node.id.clone(),
                        title: node.title.clone(),
                        message: format!("node panicked: {}", panic_message(panic.as_ref())),
                    })
                });
            Completion {
                node_id: node.id,
                process_id,
                iteration,
                inputs,
                started_at,
                result,
            }
        }
        .boxed()
    }

    fn on_complete(&mut self, done: Completion) {
        let Completion {
            node_id,
            process_id,
            iteration,
            inputs,
            started_at,
            result,
        } = done;

        match result.and_then(|outputs| self.check_outputs(&node_id, outputs)) {
            Ok(outputs) => self.finish(&node_id, iteration, process_id, inputs, outputs, started_at),
            Err(err) => self.fail(&node_id, inputs, err, Some(process_id), started_at),
        }
    }

    fn check_outputs(&self, id: &NodeId, outputs: Outputs) -> Result<Outputs> {
        let node = &self.nodes[id];
        let definitions = self.types[id].output_definitions(node, &self.runtime.project);
        match definitions
            .iter()
            .find(|d| d.required && !outputs.contains_key(&d.id))
        {
            Some(missing) => Err(WeftError::MissingOutput {
                node_id: id.clone(),
                port: missing.id.clone(),
            }),
            None => Ok(outputs),
        }
    }

    fn finish(
        &mut self,
        id: &NodeId,
        iteration: usize,
        process_id: ProcessId,
        inputs: Inputs,
        outputs: Outputs,
        started_at: DateTime<Utc>,
    ) {
        let node = self.nodes[id].clone();
        let control = self.types[id].loop_control(&node);
        if let Some(err) = control
            .as_ref()
            .and_then(|control| self.loop_limit_exceeded(&node, control, &outputs))
        {
            self.fail(id, inputs, err, Some(process_id), started_at);
            return;
        }
        debug!(graph_id = %self.graph_id, node_id = %id, iteration, "Node finished");

        self.hooks.publish(ProcessEvent::NodeFinish {
            graph_id: self.graph_id.clone(),
            node: NodeRef::from(&node),
            outputs: outputs.clone(),
            iteration,
            process_id: process_id.clone(),
        });
        self.record(NodeRunRecord {
            node_id: id.clone(),
            graph_id: self.graph_id.clone(),
            iteration,
            process_id: Some(process_id),
            status: NodeStatus::Complete,
            inputs,
            outputs: Some(outputs.clone()),
            error: None,
            started_at,
            finished_at: Utc::now(),
        });

        let state = self.state_mut(id);
        state.status = NodeStatus::Complete;
        state.outputs = Some(outputs);

        if let Some(control) = control {
            self.advance_loop(&node, &control);
        }
    }

    /// The error a controller's completion would raise by starting one
    /// iteration more than its region allows.
    fn loop_limit_exceeded(&self, node: &Node, control: &LoopControl, outputs: &Outputs) -> Option<WeftError> {
        let region = self.topology.loop_region(&node.id)?;
        let continuing = outputs.get(&control.break_port).is_some_and(DataValue::is_excluded);
        let next = self.states[&node.id].loop_iteration + 1;
        (continuing && next > region.max_iterations).then(|| WeftError::LoopIterationLimitExceeded {
            node_id: node.id.clone(),
            limit: region.max_iterations,
        })
    }

    /// Move a loop controller on after it completed: another iteration
    /// re-arms the region, a break re-arms what reads the break port.
    fn advance_loop(&mut self, node: &Node, control: &LoopControl) {
        let topology = self.topology.clone();
        let Some(region) = topology.loop_region(&node.id) else {
            return;
        };

        let state = self.state_mut(&node.id);
        let continuing = state
            .outputs
            .as_ref()
            .and_then(|outputs| outputs.get(&control.break_port))
            .is_some_and(DataValue::is_excluded);

        if !continuing {
            state.loop_phase = LoopPhase::Broken;
            let iterations = state.loop_iteration;
            debug!(graph_id = %self.graph_id, node_id = %node.id, iterations, "Loop finished");
            self.rearm(&region.break_members);
            return;
        }

        let previous = state.loop_iteration;
        state.loop_iteration += 1;
        state.loop_phase = LoopPhase::Iterating;

        if previous > 0 {
            self.rearm(&region.members);
        }
    }

    fn rearm(&mut self, members: &HashSet<NodeId>) {
        let topology = self.topology.clone();
        for id in topology.order().iter().filter(|id| members.contains(*id)) {
            if !self.is_active(id) {
                continue;
            }
            let node = NodeRef::from(&self.nodes[id]);
            if let Some(iteration) = self.state_mut(id).rearm() {
                self.hooks.publish(ProcessEvent::NodeOutputsCleared {
                    graph_id: self.graph_id.clone(),
                    node,
                    iteration,
                });
            }
        }
    }

    fn exclude(&mut self, id: &NodeId) {
        let node = self.nodes[id].clone();
        let state = self.state_mut(id);
        state.status = NodeStatus::Excluded;
        state.outputs = None;
        let iteration = state.iteration;

        debug!(graph_id = %self.graph_id, node_id = %id, iteration, "Node excluded");
        self.hooks.publish(ProcessEvent::NodeExcluded {
            graph_id: self.graph_id.clone(),
            node: NodeRef::from(&node),
            iteration,
        });
        let now = Utc::now();
        self.record(NodeRunRecord {
            node_id: id.clone(),
            graph_id: self.graph_id.clone(),
            iteration,
            process_id: None,
            status: NodeStatus::Excluded,
            inputs: Inputs::new(),
            outputs: None,
            error: None,
            started_at: now,
            finished_at: now,
        });

        if let Some(GraphPort::Output { id: port, .. }) = self.types[id].graph_port(&node) {
            self.hooks.set_graph_output(port, DataValue::excluded());
        }
    }

    fn skip(&mut self, id: &NodeId) {
        let state = self.state_mut(id);
        state.status = NodeStatus::Skipped;
        state.outputs = None;
        let iteration = state.iteration;

        debug!(graph_id = %self.graph_id, node_id = %id, iteration, "Node skipped after upstream failure");
        let now = Utc::now();
        self.record(NodeRunRecord {
            node_id: id.clone(),
            graph_id: self.graph_id.clone(),
            iteration,
            process_id: None,
            status: NodeStatus::Skipped,
            inputs: Inputs::new(),
            outputs: None,
            error: None,
            started_at: now,
            finished_at: now,
        });
    }

    fn fail(
        &mut self,
        id: &NodeId,
        inputs: Inputs,
        err: WeftError,
        process_id: Option<ProcessId>,
        started_at: DateTime<Utc>,
    ) {
        let node = self.nodes[id].clone();
        let state = self.state_mut(id);
        state.status = NodeStatus::Errored;
        state.outputs = None;
        let iteration = state.iteration;

        self.record(NodeRunRecord {
            node_id: id.clone(),
            graph_id: self.graph_id.clone(),
            iteration,
            process_id: process_id.clone(),
            status: NodeStatus::Errored,
            inputs,
            outputs: None,
            error: Some(err.to_string()),
            started_at,
            finished_at: Utc::now(),
        });

        if err.is_aborted() && self.signal.is_cancelled() {
            debug!(graph_id = %self.graph_id, node_id = %id, "Node stopped by abort");
            return;
        }

        self.hooks.publish(ProcessEvent::NodeError {
            graph_id: self.graph_id.clone(),
            node: NodeRef::from(&node),
            error: err.to_string(),
            iteration,
            process_id,
        });

        let policy = node.error_policy.unwrap_or(self.runtime.options.error_policy);
        if err.is_fatal() || policy == ErrorPolicy::FailRun {
            error!(graph_id = %self.graph_id, node_id = %id, error = %err, "Node failed, stopping graph");
            if self.fatal.is_none() {
                self.fatal = Some(err);
            }
            self.signal.cancel();
        } else {
            warn!(graph_id = %self.graph_id, node_id = %id, error = %err, "Node failed, skipping dependents");
        }
    }

    fn record(&self, record: NodeRunRecord) {
        self.runtime
            .control
            .last_run
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(record);
    }
}
