use clap::Parser;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Test executable for tether end-to-end testing
#[derive(Parser, Debug)]
#[command(name = "testexe")]
#[command(about = "Test executable for process supervisor testing", long_about = None)]
struct Args {
    /// Duration in seconds to run before exiting (0 = run indefinitely)
    #[arg(long, default_value = "0")]
    run_duration: u64,

    /// Memory in Megabytes to allocate and hold
    #[arg(long, default_value = "0")]
    memory_mb: usize,

    /// Only allocate memory on the first start recorded in the marker file
    #[arg(long, requires = "marker_file")]
    allocate_once: bool,

    /// Exit code to return when the run duration ends or a signal arrives
    #[arg(long, default_value = "0")]
    exit_code: i32,

    /// Seconds after startup to exit with `--exit-code`
    #[arg(long)]
    crash_after: Option<u64>,

    /// Append one line with the PID to this file on every start
    #[arg(long)]
    marker_file: Option<PathBuf>,

    /// Keep running when SIGTERM or SIGINT arrives
    #[arg(long)]
    ignore_signals: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .init();

    let args = Args::parse();
    info!("Starting testexe with args: {:?}", args);

    let previous_starts = match &args.marker_file {
        Some(path) => match record_start(path) {
            Ok(previous) => previous,
            Err(e) => {
                error!("Failed to write marker file {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => 0,
    };

    let mut memory_holder: Vec<Vec<u8>> = Vec::new();
    if args.memory_mb > 0 && !(args.allocate_once && previous_starts > 0) {
        info!("Allocating {} MB of memory", args.memory_mb);
        allocate_memory(&mut memory_holder, args.memory_mb);
        info!("Memory allocation complete. Current: {} MB", memory_holder.len());
    }

    info!("Testexe is fully operational");

    let run_for = async {
        match (args.run_duration, args.crash_after) {
            (0, None) => std::future::pending::<()>().await,
            (0, Some(crash)) => sleep(Duration::from_secs(crash)).await,
            (run, None) => sleep(Duration::from_secs(run)).await,
            (run, Some(crash)) => sleep(Duration::from_secs(run.min(crash))).await,
        }
    };

    tokio::select! {
        _ = run_for => {
            if args.crash_after.is_some() {
                error!("Testexe exiting with code {} as requested", args.exit_code);
            } else {
                info!("Run duration ({} seconds) reached, exiting", args.run_duration);
            }
        }
        signal = wait_for_signal(args.ignore_signals) => {
            info!("Received {}", signal);
        }
    }

    drop(memory_holder);
    std::process::exit(args.exit_code);
}

fn allocate_memory(holder: &mut Vec<Vec<u8>>, megabytes: usize) {
    for _ in 0..megabytes {
        let mut chunk = vec![0u8; 1024 * 1024];
        // Touch every page so it is actually resident
        for i in (0..chunk.len()).step_by(4096) {
            chunk[i] = 42;
        }
        holder.push(chunk);
    }
}

/// Append this process's PID and return how many starts were already recorded.
fn record_start(path: &Path) -> std::io::Result<usize> {
    let previous = match std::fs::read_to_string(path) {
        Ok(contents) => contents.lines().count(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
        Err(e) => return Err(e),
    };
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", std::process::id())?;
    Ok(previous)
}

#[cfg(unix)]
async fn wait_for_signal(ignore: bool) -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to setup signal handlers: {}", e);
                std::process::exit(1);
            }
        };

    loop {
        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        if !ignore {
            return name;
        }
        warn!("Ignoring {}", name);
    }
}

#[cfg(not(unix))]
async fn wait_for_signal(ignore: bool) -> &'static str {
    loop {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        if !ignore {
            return "Ctrl+C";
        }
        warn!("Ignoring Ctrl+C");
    }
}
