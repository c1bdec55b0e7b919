//! kbusd - kbus bus daemon
//!
//! Creates the buses listed in the configuration file, sweeps expired reply
//! deadlines in the background and shuts down on SIGTERM or SIGINT.
//!
//! With `--stdio`, control frames are read from stdin and answered on
//! stdout, one JSON object per line. Logs then go to stderr or `--log-file`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use kbus_core::spawn_reply_sweeper;
use kbus_daemon::{BusService, DaemonConfig, serve_lines};
use tokio::io::BufReader;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// kbus daemon - kernel-style message bus broker
#[derive(Parser, Debug)]
#[command(name = "kbusd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to daemon configuration file
    #[arg(short, long, env = "KBUSD_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long)]
    log_level: Option<String>,

    /// Log to file instead of stderr; overrides the config file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Serve JSON control frames on stdin/stdout
    #[arg(long)]
    stdio: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => DaemonConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => DaemonConfig::default(),
    };

    init_logging(&args, &config)?;

    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    runtime.block_on(async_main(args, config))
}

fn init_logging(args: &Args, config: &DaemonConfig) -> Result<()> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level);
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = args.log_file.as_ref().or(config.daemon.log_file.as_ref()) {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}

async fn async_main(args: Args, config: DaemonConfig) -> Result<()> {
    let service = Arc::new(
        BusService::from_config(&config, config.daemon.owner())
            .context("failed to create configured buses")?,
    );
    info!(
        buses = ?service.bus_names(),
        sweep_interval_ms = config.daemon.sweep_interval_ms,
        "kbusd started"
    );

    let sweeper = spawn_reply_sweeper(
        Arc::clone(&service),
        config.daemon.sweep_interval(),
        service.shutdown_flag(),
    );

    let control_task = if args.stdio {
        let control_service = Arc::clone(&service);
        Some(tokio::spawn(async move {
            let reader = BufReader::new(tokio::io::stdin());
            match serve_lines(&control_service, reader, tokio::io::stdout()).await {
                Ok(served) => info!(served, "stdin closed"),
                Err(e) => error!("Control stream error: {}", e),
            }
        }))
    } else {
        None
    };

    let signal_task = tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    });

    tokio::select! {
        _ = signal_task => {
            info!("Signal handler triggered shutdown");
        }
        result = async {
            if let Some(task) = control_task {
                task.await
            } else {
                std::future::pending().await
            }
        } => {
            if let Err(e) = result {
                error!("Control task failed: {}", e);
            }
            info!("Control stream exited");
        }
    }

    service.request_shutdown();
    sweeper.await.context("reply sweeper panicked")?;
    info!("kbusd stopped");
    Ok(())
}
