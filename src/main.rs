use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use transq::cli::Console;
use transq::config::AppConfig;
use transq::context::AppContext;
use transq::core::Orchestrator;
use transq::{adapters, logging};

/// Worker notifications buffered before the worker waits for the registry
const NOTIFICATION_BUFFER: usize = 256;

#[derive(Parser)]
#[command(name = "transq")]
#[command(about = "Transcoding job queue on top of ffmpeg", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Use the in-process simulated worker instead of ffmpeg
    #[arg(long, global = true)]
    simulation: bool,

    /// Config file (default: transq.toml, or $TRANSQ_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive job queue
    Run(RunArgs),
    /// Print the metadata of a media file
    Probe { path: PathBuf },
    /// List the configured presets
    Presets,
}

#[derive(Args, Serialize, Default)]
struct RunArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    max_concurrency: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    command_timeout_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    ffmpeg_program: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,
}

/// Command line values layered over file and environment config.
#[derive(Serialize)]
struct Overrides<'a> {
    #[serde(flatten)]
    run: Option<&'a RunArgs>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    simulation: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let overrides = Overrides {
        run: match &cli.command {
            Commands::Run(args) => Some(args),
            _ => None,
        },
        simulation: cli.simulation,
    };
    let config = match &cli.config {
        Some(path) => AppConfig::load(path, Some(&overrides))?,
        None => AppConfig::new(Some(&overrides))?,
    };

    logging::init((&config).into());

    match cli.command {
        Commands::Run(_) => run_queue(config).await.context("Job queue failed")?,
        Commands::Probe { path } => run_probe(config, path)
            .await
            .context("Failed to probe media")?,
        Commands::Presets => run_presets(&config)?,
    }

    Ok(())
}

async fn run_queue(config: AppConfig) -> Result<()> {
    let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
    let (gateway, simulator) =
        adapters::create_worker(&config, tx).context("Failed to create worker")?;
    let ctx = AppContext::new(config, gateway, simulator);

    info!(
        max_concurrency = ctx.config.max_concurrency,
        simulation = ctx.config.simulation,
        presets = ctx.config.presets.len(),
        "Starting job queue"
    );

    let shutdown = CancellationToken::new();

    let mut orchestrator = Orchestrator::new(ctx.clone());
    let loop_shutdown = shutdown.clone();
    let notifications = tokio::spawn(async move { orchestrator.run(rx, loop_shutdown).await });

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received SIGINT (Ctrl-C), shutting down");
            signal_shutdown.cancel();
        }
    });

    let console = Console::new(ctx.clone()).run(shutdown.clone()).await;

    let stopped = ctx.registry.stop_all_jobs().await;
    if stopped > 0 {
        info!(count = stopped, "Stopped active jobs");
    }

    shutdown.cancel();
    match tokio::time::timeout(Duration::from_secs(5), notifications).await {
        Ok(joined) => joined.context("Notification loop panicked")??,
        Err(_) => warn!("Notification loop did not stop in time"),
    }

    console
}

async fn run_probe(config: AppConfig, path: PathBuf) -> Result<()> {
    // Probing never produces notifications
    let (tx, _rx) = mpsc::channel(1);
    let (gateway, simulator) = adapters::create_worker(&config, tx)?;
    let ctx = AppContext::new(config, gateway, simulator);

    let metadata = ctx.registry.probe_metadata(&path).await?;
    println!("{}", serde_json::to_string_pretty(&metadata)?);
    Ok(())
}

fn run_presets(config: &AppConfig) -> Result<()> {
    if config.presets.is_empty() {
        println!("No presets configured");
        return Ok(());
    }
    println!("{}", serde_json::to_string_pretty(&config.presets)?);
    Ok(())
}
