use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use weft_core::config::{AppConfig, Settings};
use weft_core::event::{EventStream, ProcessEvent};
use weft_core::graph::Project;
use weft_core::types::{GraphInputs, NodeId, Outputs};
use weft_core::value::DataValue;
use weft_engine::{EventProjector, EventStreamFilter, GraphProcessor, NodeSelector, RunOptions, RunRecorder};
use weft_nodes::builtin::graph_io::{graph_input_ports, graph_output_ports};
use weft_nodes::{FsNativeApi, NodeRegistry, TiktokenTokenizer};

#[derive(Parser)]
#[command(name = "weft", version, about = "Run node-graph projects")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "weft.toml", env = "WEFT_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a graph of a project and print its outputs
    Run {
        /// Project file (JSON)
        project: PathBuf,
        /// Graph id or name (default: the project's main graph)
        #[arg(short, long)]
        graph: Option<String>,
        /// Graph input as key=value; JSON values are parsed, anything else is a string
        #[arg(short, long = "input", value_parser = parse_key_value)]
        inputs: Vec<(String, String)>,
        /// Print response deltas and results as Server-Sent Events
        #[arg(long)]
        stream: bool,
        /// Run only this node and what is downstream of it
        #[arg(long)]
        from_node: Vec<String>,
        /// JSON file of node id -> outputs for the nodes upstream of --from-node
        #[arg(long)]
        preload: Option<PathBuf>,
    },
    /// List the graphs of a project
    Graphs {
        /// Project file (JSON)
        project: PathBuf,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weft=info,warn")))
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "weft", &mut io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Graphs { project } => {
            let project = Project::load(&project).with_context(|| format!("loading {}", project.display()))?;
            list_graphs(&project);
        }
        Commands::Run {
            project,
            graph,
            inputs,
            stream,
            from_node,
            preload,
        } => {
            let request = RunRequest {
                project,
                graph,
                inputs,
                stream,
                from_node,
                preload,
            };
            run_graph(&config, request).await?;
        }
        // Handled before config loading.
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    let home_config = dirs_home().map(|h| h.join(".weft").join("config.toml"));
    match home_config {
        Some(path) if path.exists() => {
            info!(path = %path.display(), "Loading config from home directory");
            Ok(AppConfig::load(&path)?)
        }
        _ => Ok(AppConfig::default()),
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{s}'"))
}

/// `42` is a number, `true` a boolean, `{"a":1}` an object; anything that
/// does not parse as JSON is taken as a string.
fn parse_input_value(raw: &str) -> DataValue {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => DataValue::infer(value),
        Err(_) => DataValue::string(raw),
    }
}

fn list_graphs(project: &Project) {
    let main = project.metadata.main_graph_id.as_ref();
    let mut graphs: Vec<_> = project.graphs.values().collect();
    graphs.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

    println!("{} ({} graphs)", project.metadata.title, graphs.len());
    for graph in graphs {
        let marker = if Some(graph.id()) == main { "*" } else { " " };
        let ins: Vec<String> = graph_input_ports(graph).into_iter().map(|p| p.id.to_string()).collect();
        let outs: Vec<String> = graph_output_ports(graph).into_iter().map(|p| p.id.to_string()).collect();
        println!(
            "{marker} {:<24} {:<38} nodes: {:<4} in: [{}] out: [{}]",
            graph.metadata.name,
            graph.id(),
            graph.nodes.len(),
            ins.join(", "),
            outs.join(", ")
        );
    }
}

struct RunRequest {
    project: PathBuf,
    graph: Option<String>,
    inputs: Vec<(String, String)>,
    stream: bool,
    from_node: Vec<String>,
    preload: Option<PathBuf>,
}

async fn run_graph(config: &AppConfig, request: RunRequest) -> anyhow::Result<()> {
    let project = Project::load(&request.project)
        .with_context(|| format!("loading {}", request.project.display()))?;
    let graph = match &request.graph {
        Some(name) => project.find_graph(name),
        None => project.main_graph(),
    }
    .ok_or_else(|| anyhow!("graph not found: {}", request.graph.as_deref().unwrap_or("<main>")))?;
    let graph_id = graph.id().clone();

    let inputs: GraphInputs = request
        .inputs
        .iter()
        .map(|(k, v)| (k.clone(), parse_input_value(v)))
        .collect();
    let base_dir = request
        .project
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut processor = GraphProcessor::new(Arc::new(project), graph_id.clone(), Arc::new(NodeRegistry::with_builtins()))
        .with_inputs(inputs)
        .with_options(RunOptions::from(&config.engine))
        .with_settings(Arc::new(Settings::from_config(config)))
        .with_native_api(Arc::new(FsNativeApi::with_base_dir(base_dir)))
        .with_tokenizer(Arc::new(TiktokenTokenizer::cl100k()));

    if let Some(path) = &request.preload {
        let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let data: HashMap<NodeId, Outputs> = serde_json::from_str(&content)?;
        processor = processor.with_preloaded_outputs(data);
    }
    for id in &request.from_node {
        processor = processor.run_from_node(NodeId(id.clone()));
    }
    let processor = Arc::new(processor);

    let cancel = CancellationToken::new();
    let recorder = match &config.log {
        Some(log) if log.enabled => {
            let recorder = RunRecorder::new(config.log_dir(), log.level);
            let events = processor.events();
            let graph_id = graph_id.clone();
            let cancel = cancel.clone();
            Some(tokio::spawn(async move { recorder.run(events, graph_id, cancel).await }))
        }
        _ => None,
    };

    let printer = tokio::spawn(print_events(processor.clone(), processor.events(), request.stream));

    let interrupt = processor.clone();
    let ctrl_c = tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        warn!("Interrupted, aborting run");
        interrupt.abort(false, Some("interrupted".to_string()));
    });

    let result = processor.run().await;
    ctrl_c.abort();
    printer.await.ok();
    if let Some(recorder) = recorder {
        if let Ok(Some(path)) = recorder.await {
            info!(path = %path.display(), "Run recorded");
        }
    }
    cancel.cancel();

    match result {
        Ok(outputs) => {
            if !request.stream {
                let json: serde_json::Map<String, serde_json::Value> =
                    outputs.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
                println!("{}", serde_json::to_string_pretty(&json)?);
            }
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Graph run failed");
            Err(e.into())
        }
    }
}

async fn print_events(processor: Arc<GraphProcessor>, mut events: EventStream, stream: bool) {
    let mut projector = EventProjector::new(EventStreamFilter {
        partial_outputs: NodeSelector::Flag(true),
        done: true,
        error: true,
        ..Default::default()
    });

    while let Some(event) = events.recv().await {
        if let ProcessEvent::UserInput { node, prompts, .. } = &event {
            let answers = ask_user(node.title.clone(), prompts.clone()).await;
            if !processor.user_input(&node.id, answers).await {
                warn!(node_id = %node.id, "User input no longer pending");
            }
            continue;
        }

        if stream {
            if let Some(projected) = projector.project(event) {
                print!("{}", projected.to_sse());
                io::stdout().flush().ok();
            }
            continue;
        }

        match event {
            ProcessEvent::NodeStart { node, iteration, .. } if iteration > 0 => {
                eprintln!("[{}: run {}]", node.title, iteration + 1);
            }
            ProcessEvent::NodeStart { node, .. } => eprintln!("[{}]", node.title),
            ProcessEvent::NodeError { node, error, .. } => eprintln!("[{}: ERROR] {}", node.title, error),
            ProcessEvent::Trace { node, message, .. } => eprintln!("[{}] {}", node.title, message),
            ProcessEvent::Abort { successful, error } => {
                eprintln!("[aborted{}]", if successful { "" } else { " with error" });
                if let Some(error) = error {
                    eprintln!("  {error}");
                }
            }
            ProcessEvent::Error { error } => eprintln!("[error: {error}]"),
            _ => {}
        }
    }
}

/// One answer per prompt, read on a blocking thread.
async fn ask_user(title: String, prompts: Vec<String>) -> Vec<String> {
    tokio::task::spawn_blocking(move || {
        eprintln!("\n[{title}: input requested]");
        prompts
            .iter()
            .map(|prompt| {
                dialoguer::Input::<String>::new()
                    .with_prompt(prompt.as_str())
                    .allow_empty(true)
                    .interact_text()
                    .unwrap_or_default()
            })
            .collect()
    })
    .await
    .unwrap_or_default()
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
