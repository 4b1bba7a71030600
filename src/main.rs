use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vigil_core::config::AppConfig;
use vigil_core::event::EventBus;
use vigil_core::traits::StateStore;
use vigil_core::types::{ConversationId, GraphEvent};

use vigil_agent::graph::GraphSpec;
use vigil_agent::{pipelines, Capabilities, ExecutorConfig, GraphExecutor, LaneManager, Orchestrator};
use vigil_tools::ToolRegistry;

#[derive(Parser)]
#[command(name = "vigil", version, about = "Conversation-orchestration graph executor")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "vigil.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a graph declaration and print its topology
    Check {
        /// Graph declaration (TOML)
        graph: PathBuf,
    },
    /// Run one pass of a graph for a conversation
    Run {
        /// Built-in pipeline (triage, surveillance)
        #[arg(long, conflicts_with = "graph", default_value = "triage")]
        preset: String,
        /// Graph declaration (TOML) to run instead of a preset
        #[arg(long)]
        graph: Option<PathBuf>,
        /// Conversation identity (auto-generated if not provided)
        #[arg(long)]
        conversation: Option<String>,
        /// Author recorded on the new history turn
        #[arg(long, default_value = "user")]
        author: String,
        /// The new input; read from stdin when empty
        #[arg(trailing_var_arg = true)]
        message: Vec<String>,
    },
    /// Print the persisted state of a conversation
    Show {
        conversation: String,
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
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vigil=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle commands that need no config
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "vigil", &mut io::stdout());
            return Ok(());
        }
        Commands::Check { graph } => return check(graph),
        _ => {}
    }

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        warn!(path = %cli.config.display(), "No config file found, using defaults");
        AppConfig::default()
    };

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Show { conversation } => {
            let store = vigil_memory::open_store(&config)?;
            let state = store.load(&ConversationId::from_str(&conversation)).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Commands::Run {
            preset,
            graph,
            conversation,
            author,
            message,
        } => {
            let spec = match graph {
                Some(path) => GraphSpec::load(&path)?,
                None => pipelines::preset(&preset).ok_or_else(|| {
                    anyhow::anyhow!(
                        "unknown preset '{}' (available: {})",
                        preset,
                        pipelines::PRESETS.join(", ")
                    )
                })?,
            };
            let mut input = message.join(" ");
            if input.is_empty() {
                input = io::stdin()
                    .lock()
                    .lines()
                    .map_while(|l| l.ok())
                    .collect::<Vec<_>>()
                    .join("\n");
            }
            let conversation = conversation
                .map(|c| ConversationId::from_str(&c))
                .unwrap_or_default();
            run_once(&config, spec, &conversation, &author, &input).await?;
        }
        Commands::Check { .. } | Commands::Completions { .. } => {}
    }

    Ok(())
}

fn check(path: &PathBuf) -> anyhow::Result<()> {
    let spec = GraphSpec::load(path)?;
    match spec.compile() {
        Ok(graph) => {
            print!("{}", graph);
            Ok(())
        }
        Err(e) => anyhow::bail!("{} ({} rule violated)", e, e.rule()),
    }
}

async fn run_once(
    config: &AppConfig,
    spec: GraphSpec,
    conversation: &ConversationId,
    author: &str,
    input: &str,
) -> anyhow::Result<()> {
    let graph = Arc::new(spec.compile()?);

    let tools = Arc::new(ToolRegistry::with_builtins(&config.tools));
    let mut capabilities = Capabilities::with_builtins(tools);
    for (name, analyzer) in vigil_analyzers::build_analyzers(config) {
        capabilities.insert_analyzer(name, analyzer);
    }

    let event_bus = Arc::new(EventBus::new(config.engine.event_capacity));
    let executor = GraphExecutor::new(
        Arc::new(capabilities),
        ExecutorConfig::from(&config.engine),
    );
    let orchestrator = Orchestrator::new(
        graph.clone(),
        executor,
        vigil_memory::open_store(config)?,
        LaneManager::new(config.engine.lane_policy),
    )
    .with_event_bus(event_bus.clone());

    // Spawn event printer
    let mut rx = event_bus.subscribe();
    let print_handle = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                GraphEvent::NodeCompleted { node, elapsed_ms } => {
                    eprintln!("[{}: done in {}ms]", node, elapsed_ms);
                }
                GraphEvent::Routed { node, decision, target } => {
                    eprintln!("[{}: {} -> {}]", node, decision, target);
                }
                GraphEvent::ToolExecuted { result } => {
                    let tag = if result.is_error { "ERROR" } else { "ok" };
                    eprintln!("[{}: {}] {}", result.tool, tag, truncate(&result.content, 200));
                }
                GraphEvent::LoopReentered { node, loop_count } => {
                    eprintln!("[loop {} -> {}]", loop_count, node);
                }
                GraphEvent::RunFailed { error, .. } => {
                    eprintln!("[run failed] {}", error);
                }
                _ => {}
            }
        }
    });

    info!(conversation = %conversation, graph = %graph.name(), "Handling request");
    let outcome = orchestrator.handle(conversation, author, input).await;

    // Closing the bus lets the printer drain and exit
    drop(orchestrator);
    drop(event_bus);
    let _ = print_handle.await;

    let outcome = outcome?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
