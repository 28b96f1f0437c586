//! ChainRun launcher - runs one chain over an input and prints the result.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chainrun_core::{RunId, RunInput, RunStatus, SegmentationMethod};
use chainrun_engine::metrics::collect_metrics;
use chainrun_engine::{
    ChainRegistry, CheckpointStore, CommandInvoker, EngineConfig, FileCheckpointStore,
    RunCoordinator,
};

/// ChainRun - execute chains of model steps
#[derive(Parser)]
#[command(name = "chainrun")]
#[command(about = "Run a chain of model-invocation steps over an input", long_about = None)]
struct Cli {
    /// Engine config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Checkpoint directory (overrides the config file)
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a chain and wait for it to finish
    Run {
        /// Directory of chain definitions (*.json)
        #[arg(long, default_value = "chains")]
        chains_dir: PathBuf,

        /// Chain ID to run
        #[arg(long)]
        chain: String,

        /// Input text
        #[arg(short, long, conflicts_with = "input_file")]
        input: Option<String>,

        /// Read input text from a file
        #[arg(long)]
        input_file: Option<PathBuf>,

        /// Attach a file to the input (repeatable)
        #[arg(long = "attach")]
        attachments: Vec<PathBuf>,

        /// Command that answers prompts on stdin
        #[arg(long)]
        command: String,

        /// Arguments passed to the command
        #[arg(last = true)]
        args: Vec<String>,

        /// Maximum concurrent segments per step
        #[arg(long)]
        max_parallel_chunks: Option<usize>,

        /// Token threshold above which input is segmented
        #[arg(long)]
        max_tokens_per_chunk: Option<usize>,

        /// Segmentation method (simple, semantic, recursive)
        #[arg(long)]
        segmentation: Option<String>,

        /// Do not write checkpoints
        #[arg(long)]
        no_checkpoints: bool,

        /// Print run metadata as JSON instead of the output text
        #[arg(long)]
        json: bool,

        /// Print Prometheus metrics to stderr when the run ends
        #[arg(long)]
        metrics: bool,
    },

    /// List checkpoints of a run stored under the checkpoint directory
    Checkpoints {
        /// Run ID
        run_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(dir) = cli.checkpoint_dir {
        config.checkpoint_dir = Some(dir);
    }

    match cli.command {
        Commands::Run {
            chains_dir,
            chain,
            input,
            input_file,
            attachments,
            command,
            args,
            max_parallel_chunks,
            max_tokens_per_chunk,
            segmentation,
            no_checkpoints,
            json,
            metrics,
        } => {
            if let Some(n) = max_parallel_chunks {
                config.processing.max_parallel_chunks = n;
            }
            if let Some(n) = max_tokens_per_chunk {
                config.processing.max_tokens_per_chunk = n;
            }
            if let Some(method) = segmentation {
                config.processing.segmentation_method = parse_method(&method)?;
            }
            if no_checkpoints {
                config.processing.save_checkpoints = false;
            }
            config.validate()?;

            let text = match (input, input_file) {
                (Some(text), _) => text,
                (None, Some(path)) => tokio::fs::read_to_string(&path).await?,
                (None, None) => String::new(),
            };
            let mut run_input = RunInput::text(text);
            for path in attachments {
                let content = tokio::fs::read_to_string(&path).await?;
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| path.display().to_string());
                run_input = run_input.with_file(name, content);
            }

            let mut invoker = CommandInvoker::new(command);
            for arg in args {
                invoker = invoker.with_arg(arg);
            }

            let chains = Arc::new(ChainRegistry::new());
            chains.load_dir(&chains_dir).await?;

            let coordinator =
                RunCoordinator::from_config(chains, Arc::new(invoker), &config).await?;
            run_chain(&coordinator, &chain, run_input, &config, json, metrics).await?;
        }
        Commands::Checkpoints { run_id } => {
            let dir = config
                .checkpoint_dir
                .ok_or("a checkpoint directory is required (--checkpoint-dir or config)")?;
            let store = FileCheckpointStore::open(dir, config.externalize_threshold_bytes).await?;
            let checkpoints = store.list(&RunId::new(run_id)).await?;
            println!("{}", serde_json::to_string_pretty(&checkpoints)?);
        }
    }

    Ok(())
}

async fn run_chain(
    coordinator: &RunCoordinator,
    chain: &str,
    input: RunInput,
    config: &EngineConfig,
    json: bool,
    metrics: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let run_id = coordinator
        .run_chain(&chain.into(), input, config.processing.clone())
        .await?;
    info!(run_id = %run_id, chain_id = %chain, "Waiting for run");

    let meta = tokio::select! {
        meta = coordinator.wait_for_run(&run_id) => meta?,
        _ = tokio::signal::ctrl_c() => {
            warn!(run_id = %run_id, "Interrupted, cancelling run");
            if let Err(e) = coordinator.cancel_run(&run_id).await {
                warn!(run_id = %run_id, error = %e, "Cancel failed");
            }
            coordinator.wait_for_run(&run_id).await?
        }
    };

    if metrics {
        eprint!("{}", collect_metrics(coordinator).await);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&meta)?);
    } else if meta.status == RunStatus::Completed {
        println!("{}", coordinator.get_run_results(&run_id).await?);
    }

    match meta.status {
        RunStatus::Completed => Ok(()),
        status => Err(format!(
            "run {} ended {:?}: {}",
            run_id,
            status,
            meta.error.as_deref().unwrap_or("no error recorded")
        )
        .into()),
    }
}

fn parse_method(name: &str) -> Result<SegmentationMethod, String> {
    match name {
        "simple" => Ok(SegmentationMethod::Simple),
        "semantic" => Ok(SegmentationMethod::Semantic),
        "recursive" => Ok(SegmentationMethod::Recursive),
        other => Err(format!(
            "unknown segmentation method '{other}' (expected simple, semantic or recursive)"
        )),
    }
}
