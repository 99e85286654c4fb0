//! paperpipe CLI - resumable enrichment runs over paper corpora.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use paperpipe::checkpoint::CheckpointError;
use paperpipe::{
    registry_from_config, BatchOrchestrator, ChainConfig, CheckpointManager, Config, CostLedger,
    FallbackChain, ItemSource, JsonlSource, OrchestratorOptions, PipelineError, RunStats,
    SessionState,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "paperpipe")]
#[command(version)]
#[command(about = "Resumable, cost-bounded enrichment pipeline for academic paper corpora")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "paperpipe.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the enrichment pipeline (new session)
    Run {
        /// Attempt to load a checkpoint before running
        #[arg(long)]
        resume: bool,

        /// Session id to resume; defaults to the most recent valid one
        #[arg(long)]
        session: Option<String>,

        /// Start a fresh session if the checkpoint is corrupt
        #[arg(long)]
        fresh_on_corrupt: bool,

        /// Override checkpoint interval in minutes (0 disables periodic saves)
        #[arg(long)]
        checkpoint_interval: Option<u64>,

        /// Override output path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Resume the most recent session (shorthand for run --resume)
    Resume {
        /// Session id to resume; defaults to the most recent valid one
        #[arg(long)]
        session: Option<String>,

        /// Start a fresh session if the checkpoint is corrupt
        #[arg(long)]
        fresh_on_corrupt: bool,
    },

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");
}

fn print_example_config() {
    let example = r#"# paperpipe configuration file

[pipeline]
name = "paperpipe"
state_root = ".paperpipe/state"
output = "out/enriched.json"
batch_size = 25
batch_concurrency = 8
checkpoint_interval_mins = 5   # 0 disables periodic checkpoints

[extraction]
min_confidence = 0.7
per_item_budget_usd = 0.25
run_budget_usd = 10.0
backend_timeout_secs = 60

[[sources]]
id = "arxiv"
path = "data/arxiv.jsonl"

[[sources]]
id = "neurips"
path = "data/neurips.jsonl"

# Tried in ascending priority order; ties broken by listed order.
[[backends]]
name = "metadata"
priority = 0
kind = "free"
fields = ["title", "authors", "abstract", "affiliations"]

[[backends]]
name = "local-ocr"
priority = 1
kind = "local"
endpoint = "local-ocr"
features = ["text", "affiliations"]

[[backends]]
name = "cloud-a"
priority = 2
kind = "paid"
cost_per_item_usd = 0.04
endpoint = "cloud-a"

[[backends]]
name = "cloud-b"
priority = 3
kind = "paid"
cost_per_item_usd = 0.09
endpoint = "cloud-b"

[endpoints.local-ocr]
base_url = "http://localhost:8070"

[endpoints.cloud-a]
base_url = "https://vision-a.example.com"
api_key_env = "CLOUD_A_API_KEY"

[endpoints.cloud-b]
base_url = "https://vision-b.example.com"
api_key_env = "CLOUD_B_API_KEY"
"#;
    println!("{example}");
}

fn print_summary(stats: &RunStats) {
    println!("\n=== Enrichment Complete ===");
    println!("Items:          {}", stats.total_items);
    println!("Accepted:       {}", stats.accepted);
    println!("Low confidence: {}", stats.low_confidence);
    println!("Failed:         {}", stats.failed);
    println!("Acceptance:     {:.1}%", stats.acceptance_rate * 100.0);
    println!("Batches run:    {}", stats.batches_run);
    println!("Batches skipped: {}", stats.batches_skipped);
    println!("Throughput:     {:.0}/hr", stats.throughput_per_hour);
    println!("Total cost:     ${:.4}", stats.total_cost_usd);
    println!("Runtime:        {:.1}s", stats.runtime_secs);
}

fn load_sources(config: &Config) -> Result<Vec<Arc<dyn ItemSource>>> {
    let mut sources: Vec<Arc<dyn ItemSource>> = Vec::with_capacity(config.sources.len());
    for spec in &config.sources {
        let source = JsonlSource::from_path(spec.id.clone(), &spec.path)
            .with_context(|| format!("Failed to load source '{}'", spec.id))?;
        sources.push(Arc::new(source));
    }
    Ok(sources)
}

fn input_reference(config: &Config) -> String {
    config
        .sources
        .iter()
        .map(|s| format!("{}:{}", s.id, s.path.display()))
        .collect::<Vec<_>>()
        .join(",")
}

async fn run_pipeline(
    config: Config,
    resume: bool,
    session: Option<String>,
    fresh_on_corrupt: bool,
) -> Result<()> {
    // An explicit session id implies a resume attempt
    let resume = resume || session.is_some();
    config.validate().context("Invalid configuration")?;

    let registry = registry_from_config(&config).context("Failed to build backend registry")?;
    info!(backends = ?registry.names(), "Backend chain ready");

    let ledger = Arc::new(CostLedger::new(config.extraction.run_budget_usd));
    let chain = FallbackChain::new(registry, ChainConfig::from(&config.extraction), ledger);

    let sources = load_sources(&config)?;
    if sources.is_empty() {
        bail!("No sources configured");
    }

    let options = OrchestratorOptions {
        batch_size: config.pipeline.batch_size,
        batch_concurrency: config.pipeline.batch_concurrency,
        output_path: config.pipeline.output.clone(),
    };

    // Interrupts take the forced-checkpoint path inside the orchestrator
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, finishing current batch");
                shutdown.store(true, Ordering::SeqCst);
            }
        });
    }

    let state_root = &config.pipeline.state_root;
    let pipeline_name = &config.pipeline.name;
    let interval = config.pipeline.checkpoint_interval_mins;

    let mut orchestrator = if resume {
        let session_id = match session {
            Some(id) => Some(id),
            None => CheckpointManager::latest_session(state_root, pipeline_name)
                .context("Failed to scan for existing sessions")?,
        };

        match session_id {
            None => {
                info!("No checkpoint found, starting a new session");
                fresh_orchestrator(&config, chain, options, Arc::clone(&shutdown))?
            }
            Some(session_id) => {
                let manager =
                    CheckpointManager::new(state_root, pipeline_name, &session_id, interval)
                        .context("Failed to open session directory")?;
                match manager.load() {
                    Ok(checkpoint) => {
                        report_resume_plan(&checkpoint.state);
                        BatchOrchestrator::resume(
                            chain,
                            manager,
                            checkpoint,
                            options,
                            Arc::clone(&shutdown),
                        )
                    }
                    Err(CheckpointError::Absent) => {
                        info!(
                            session_id = %session_id,
                            "No checkpoint found for session, starting a new session"
                        );
                        fresh_orchestrator(&config, chain, options, Arc::clone(&shutdown))?
                    }
                    Err(e @ CheckpointError::Corrupt { .. }) => {
                        // Never silently discard progress: corruption needs
                        // an explicit operator decision.
                        if fresh_on_corrupt {
                            warn!(
                                session_id = %session_id,
                                error = %e,
                                "Checkpoint is corrupt; starting fresh as requested"
                            );
                            fresh_orchestrator(&config, chain, options, Arc::clone(&shutdown))?
                        } else {
                            bail!(
                                "Checkpoint for session {session_id} is corrupt ({e}). \
                                 Re-run with --fresh-on-corrupt to discard it, or remove \
                                 the session directory manually."
                            );
                        }
                    }
                    Err(e) => return Err(e).context("Failed to load checkpoint"),
                }
            }
        }
    } else {
        fresh_orchestrator(&config, chain, options, Arc::clone(&shutdown))?
    };

    info!(session_id = %orchestrator.session_id(), "Session ready");

    match orchestrator.run(&sources).await {
        Ok(stats) => {
            print_summary(&stats);
            println!("Output:         {:?}", config.pipeline.output);
            Ok(())
        }
        Err(PipelineError::Interrupted) => {
            println!("\nRun interrupted. Resume with:");
            println!(
                "  paperpipe resume --session {}",
                orchestrator.session_id()
            );
            Ok(())
        }
        Err(e) => Err(e).context("Pipeline run failed"),
    }
}

fn fresh_orchestrator(
    config: &Config,
    chain: FallbackChain,
    options: OrchestratorOptions,
    shutdown: Arc<AtomicBool>,
) -> Result<BatchOrchestrator> {
    let source_ids: Vec<String> = config.sources.iter().map(|s| s.id.clone()).collect();
    let state = SessionState::new(
        config.pipeline.name.clone(),
        input_reference(config),
        &source_ids,
    );
    let manager = CheckpointManager::new(
        &config.pipeline.state_root,
        &config.pipeline.name,
        &state.session_id,
        config.pipeline.checkpoint_interval_mins,
    )
    .context("Failed to create checkpoint directory")?;

    Ok(BatchOrchestrator::new(chain, manager, state, options, shutdown))
}

fn report_resume_plan(state: &SessionState) {
    for source in state.sources.values() {
        info!(
            source = %source.id,
            status = %source.status,
            batches_done = source.batches_done(),
            "Resume plan"
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Example => {
            print_example_config();
            Ok(())
        }

        Commands::Validate => {
            let config = Config::from_file(&cli.config)
                .with_context(|| format!("Failed to load config from {:?}", cli.config))?;
            config.validate().context("Invalid configuration")?;

            // Endpoint auth must resolve before a run burns any budget
            for backend in &config.backends {
                if let Some(endpoint) = &backend.endpoint {
                    config
                        .resolve_endpoint_api_key(endpoint)
                        .with_context(|| format!("Backend '{}'", backend.name))?;
                }
            }

            info!("Configuration is valid");
            info!("  Sources:  {}", config.sources.len());
            info!("  Backends: {}", config.backends.len());
            info!(
                "  Budget:   ${:.2} run, ${:.2} per item",
                config.extraction.run_budget_usd, config.extraction.per_item_budget_usd
            );
            info!(
                "  Checkpoint interval: {} min",
                config.pipeline.checkpoint_interval_mins
            );
            Ok(())
        }

        Commands::Run {
            resume,
            session,
            fresh_on_corrupt,
            checkpoint_interval,
            output,
        } => {
            let mut config = Config::from_file(&cli.config)
                .with_context(|| format!("Failed to load config from {:?}", cli.config))?;

            if let Some(mins) = checkpoint_interval {
                config.pipeline.checkpoint_interval_mins = mins;
            }
            if let Some(path) = output {
                config.pipeline.output = path;
            }

            run_pipeline(config, resume, session, fresh_on_corrupt).await
        }

        Commands::Resume {
            session,
            fresh_on_corrupt,
        } => {
            let config = Config::from_file(&cli.config)
                .with_context(|| format!("Failed to load config from {:?}", cli.config))?;

            run_pipeline(config, true, session, fresh_on_corrupt).await
        }
    }
}
