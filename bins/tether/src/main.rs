use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{sleep, Duration};
use tracing::{error, info};

use tether_supervisor::{ConfigResult, ProcessManager, SupervisorOutcome, TetherConfig};

/// Clean shutdown, or every process ended without failure
const EXIT_OK: u8 = 0;
/// Configuration or other fatal error
const EXIT_FATAL: u8 = 1;
/// At least one process could not be kept alive
const EXIT_PROCESS_FAILED: u8 = 2;

/// Tether - keeps long-running processes alive under a memory ceiling
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path (YAML or JSON)
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Validate the configuration, print the resolved command lines and exit
    #[arg(long)]
    check: bool,

    /// Run duration in seconds (for testing)
    #[arg(long, value_name = "SECS")]
    run_duration: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = TetherConfig::load_from_file(&args.config);
    let level = if args.debug {
        "debug".to_string()
    } else {
        config
            .as_ref()
            .map(|c| c.supervisor.log_level.clone())
            .unwrap_or_else(|_| "info".to_string())
    };

    if let Err(e) = initialize_logging(&level) {
        eprintln!("tether: {:#}", e);
        return ExitCode::from(EXIT_FATAL);
    }

    match run(&args, config).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(EXIT_FATAL)
        }
    }
}

async fn run(args: &Args, config: ConfigResult<TetherConfig>) -> Result<u8> {
    let config = config.with_context(|| {
        format!("failed to load configuration from {}", args.config.display())
    })?;

    if args.check {
        for descriptor in config.descriptors()? {
            println!("{}: {}", descriptor.id, descriptor.command_line());
        }
        return Ok(EXIT_OK);
    }

    info!("Starting tether {}", tether_supervisor::VERSION);
    info!("Config file: {}", args.config.display());
    info!("Loaded configuration for {} apps", config.apps.len());

    let mut manager = ProcessManager::new(config)?;
    manager.start();

    tokio::select! {
        signal = shutdown_signal() => {
            info!("Received {} signal", signal?);
        }
        _ = sleep(Duration::from_secs(args.run_duration.unwrap_or_default())), if args.run_duration.is_some() => {
            info!("Run duration elapsed");
        }
        outcomes = manager.wait_all() => {
            info!("All supervised processes have ended");
            return Ok(report(&outcomes));
        }
    }

    info!("Shutting down process manager...");
    let outcomes = manager.shutdown().await.context("shutdown failed")?;
    info!("Process manager shut down successfully");
    Ok(report(&outcomes))
}

/// Log every outcome and pick the exit code.
fn report(outcomes: &BTreeMap<String, SupervisorOutcome>) -> u8 {
    let mut code = EXIT_OK;
    for (id, outcome) in outcomes {
        if outcome.is_failure() {
            error!("[{}] {}", id, outcome);
            code = EXIT_PROCESS_FAILED;
        } else {
            info!("[{}] {}", id, outcome);
        }
    }
    code
}

fn initialize_logging(level: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
                .with_context(|| format!("invalid log level '{}'", level))?,
        )
        .with_target(false)
        .with_thread_ids(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))
}

async fn shutdown_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => Ok("SIGTERM"),
            _ = sigint.recv() => Ok("SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl+C")?;
        Ok("Ctrl+C")
    }
}
