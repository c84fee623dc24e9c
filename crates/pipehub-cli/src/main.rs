//! pipehub - talk to every other pipehub process on this host.
//!
//! Run it in several terminals. The first becomes the hub; the others join.
//! Each line typed is broadcast to everyone else. Close the hub and the
//! remaining processes elect a new one.

mod console;

use anyhow::{Context, Result};
use clap::Parser;
use pipehub_core::platform::default_runtime_dir;
use pipehub_core::{CancellationToken, FileLockProvider, RelayConfig, Supervisor, SupervisorExit};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const CONSOLE_QUEUE_DEPTH: usize = 64;
const PRINTER_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(name = "pipehub")]
#[command(about = "Serverless broadcast chat between processes on one host")]
struct Args {
    /// Endpoint name; processes with the same name talk to each other
    #[arg(short, long)]
    name: Option<String>,

    /// Directory for the endpoint socket and lock files
    #[arg(long)]
    runtime_dir: Option<PathBuf>,

    /// JSON config file (fields not given keep their defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.debug);

    match run(args).await {
        Ok(exit) => {
            info!("Exiting ({:?})", exit);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // stdout belongs to the conversation; logs go to stderr.
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn load_config(args: &Args) -> Result<RelayConfig> {
    let mut config = match &args.config {
        Some(path) => RelayConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => RelayConfig::new(),
    };
    if let Some(name) = &args.name {
        config = config.with_endpoint_name(name.clone());
    }
    if let Some(dir) = &args.runtime_dir {
        config = config.with_runtime_dir(dir.clone());
    }
    config.validate()?;
    Ok(config)
}

async fn run(args: Args) -> Result<SupervisorExit> {
    let config = load_config(&args)?;
    let runtime_dir = config
        .runtime_dir
        .clone()
        .unwrap_or_else(default_runtime_dir);
    info!("Runtime directory: {}", runtime_dir.display());

    let locks = Arc::new(FileLockProvider::new(runtime_dir));
    let shutdown = CancellationToken::new();

    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            on_signal.cancel();
        }
    });

    let supervisor = Supervisor::new(config, locks, shutdown)
        .context("Failed to set up the endpoint")?;
    tokio::spawn(console::report_roles(
        supervisor.subscribe(),
        supervisor.endpoint().name().to_string(),
    ));

    let (outbox_tx, mut outbox) = mpsc::channel(CONSOLE_QUEUE_DEPTH);
    let (inbox, inbox_rx) = mpsc::channel(CONSOLE_QUEUE_DEPTH);
    console::spawn_stdin_reader(outbox_tx);
    let printer = tokio::spawn(console::print_inbox(inbox_rx, std::io::stdout()));

    let exit = supervisor.run(&mut outbox, inbox).await?;

    // Let frames that arrived just before exit reach the terminal.
    let _ = tokio::time::timeout(PRINTER_DRAIN_TIMEOUT, printer).await;
    Ok(exit)
}
