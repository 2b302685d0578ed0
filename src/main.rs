use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pipesync_core::config::AppConfig;
use pipesync_core::traits::{ExecutionEngine, RunStore};
use pipesync_core::types::LabelSelector;
use pipesync_engine::CommandEngine;
use pipesync_reconciler::{Reconciler, RunPhase};
use pipesync_store::{Seed, SqliteStore};

#[derive(Parser)]
#[command(name = "pipesync", version, about = "Pipeline run state reconciler")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "pipesync.toml", env = "PIPESYNC_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reconcile loop until Ctrl-C
    Serve,
    /// Run a single reconcile pass and print its report
    SyncOnce,
    /// List runs with their phase and execution state
    Runs {
        /// Include finished runs
        #[arg(long)]
        all: bool,
    },
    /// Load runs, pipelines, and projects from a JSON file into the store
    Apply {
        /// JSON file with `runs`, `pipelines`, and `projects` arrays
        file: PathBuf,
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
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("pipesync=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "pipesync", &mut std::io::stdout());
        return Ok(());
    }

    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    if let Commands::Config = cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let db_path = config.store.resolved_path();
    let store = Arc::new(SqliteStore::open(&db_path)?);
    info!(path = %db_path.display(), "Opened store");

    match cli.command {
        Commands::Serve => {
            let cancel = CancellationToken::new();
            let cancel_clone = cancel.clone();

            // Graceful shutdown on Ctrl-C
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down reconciler...");
                cancel_clone.cancel();
            });

            let reconciler = build_reconciler(&config, store, cancel)?;
            reconciler.run().await;
        }
        Commands::SyncOnce => {
            let reconciler = build_reconciler(&config, store, CancellationToken::new())?;
            let report = reconciler.sync_once().await;
            println!(
                "scanned: {}  runs written: {}  pipelines written: {}  errors: {}",
                report.scanned, report.runs_written, report.pipelines_written, report.errors
            );
        }
        Commands::Runs { all } => {
            let selector = if all {
                LabelSelector::new()
            } else {
                LabelSelector::unfinished()
            };
            let runs = store.list(&selector).await?;
            if runs.is_empty() {
                println!("No runs.");
            }
            for run in runs {
                println!(
                    "{:<40} {:<13} {:<9} {}",
                    run.id(),
                    RunPhase::of(&run.status).as_str(),
                    run.status.execution_state.as_str(),
                    run.spec.pipeline_name
                );
            }
        }
        Commands::Apply { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let seed: Seed = serde_json::from_str(&content)?;
            let inserted = store.apply_seed(seed)?;
            println!("Applied {} record(s) from {}", inserted, file.display());
        }
        Commands::Config | Commands::Completions { .. } => {
            unreachable!("handled before store setup")
        }
    }

    Ok(())
}

fn build_reconciler(
    config: &AppConfig,
    store: Arc<SqliteStore>,
    cancel: CancellationToken,
) -> anyhow::Result<Reconciler> {
    let engine_config = config
        .engine
        .clone()
        .context("no [engine] section in config")?;
    let engine: Arc<dyn ExecutionEngine> = Arc::new(CommandEngine::new(engine_config));

    Ok(Reconciler::new(
        config.reconciler.clone(),
        store.clone(),
        store.clone(),
        store,
        engine,
        cancel,
    ))
}
