mod can;
mod codec;
mod dispatch;
mod engine;
mod error;
mod state;
mod supervisor;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use engine::Strategy;
use supervisor::Supervisor;

/// Virtual OBD-II engine control unit speaking diagnostics over CAN.
#[derive(Parser, Debug)]
#[command(name = "virtual-ecu", version, about)]
struct Args {
    /// CAN interface to bind to.
    #[arg(long, default_value = "vcan0")]
    interface: String,

    /// Disable random DTC injection in the scenario strategy.
    #[arg(long)]
    no_dtc: bool,

    /// Logging verbosity.
    #[arg(long, default_value = "INFO")]
    log_level: String,

    /// Vehicle state simulation strategy.
    #[arg(long, default_value = "scenario")]
    strategy: String,

    /// Seed the engine's RNG for reproducible runs.
    #[arg(long)]
    seed: Option<u64>,
}

fn parse_log_level(level: &str) -> Level {
    match level.to_uppercase().as_str() {
        "DEBUG" => Level::DEBUG,
        "INFO" => Level::INFO,
        "WARNING" | "WARN" => Level::WARN,
        "ERROR" => Level::ERROR,
        other => {
            eprintln!("unknown log level '{other}', defaulting to INFO");
            Level::INFO
        }
    }
}

fn init_logging(level: Level) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::daily("logs", "virtual-ecu.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking.and(std::io::stderr))
        .init();

    guard
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level = parse_log_level(&args.log_level);
    let _log_guard = init_logging(level);

    let strategy: Strategy = args.strategy.parse().map_err(anyhow::Error::msg)?;

    info!(
        interface = args.interface,
        strategy = args.strategy,
        seed = args.seed,
        "starting virtual ECU"
    );

    let mut supervisor = Supervisor::start(&args.interface, strategy, args.seed, !args.no_dtc)
        .inspect_err(|e| error!(error = %e, "startup failed"))?;

    let running = supervisor.running_flag();
    ctrlc_handler(running.clone())?;

    while running.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    supervisor.shutdown();
    supervisor.log_final_stats();
    Ok(())
}

/// Install a SIGINT/SIGTERM handler that flips the shared `running` flag
/// rather than touching the channel directly (§9 "Signal-driven shutdown").
fn ctrlc_handler(running: Arc<std::sync::atomic::AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })?;
    Ok(())
}
