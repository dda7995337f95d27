//! Pitwall CLI - command-line interface for the Pitwall training orchestrator
//!
//! This CLI provides a `pitwall` command for checking job requests, previewing
//! the backend start-job spec and running jobs end to end against simulated
//! training services.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use commands::{simulate, spec, validate};

/// Pitwall CLI - training job orchestration
///
/// Pitwall admits queued training job requests against the available
/// capacity and drives each job from start to cleanup.
#[derive(Parser, Debug)]
#[command(
    name = "pitwall",
    author,
    version,
    about = "Pitwall - training job orchestration",
    long_about = "Pitwall admits queued training job requests against the available capacity\nand drives each job through initialization, monitoring and cleanup."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn", global = true)]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Orchestrator configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a job request
    ///
    /// Parses a job request JSON file and checks every field the
    /// orchestrator depends on.
    Validate {
        /// Path to the job request JSON file
        file: PathBuf,

        /// Output result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the backend start-job spec for a job request
    Spec {
        /// Path to the job request JSON file
        file: PathBuf,

        /// Telemetry stream name (defaults to the job id)
        #[arg(long)]
        stream: Option<String>,
    },

    /// Run job requests end to end against simulated services
    ///
    /// Each non-empty line of the file is one queue message. Messages go
    /// through the queue worker, the dispatcher and the orchestrator exactly
    /// as they would in production.
    Simulate {
        /// Path to a JSON-lines file of job requests
        file: PathBuf,

        /// Concurrent training job ceiling
        #[arg(long, default_value_t = 2)]
        ceiling: u32,

        /// Polls before a simulated job completes
        #[arg(long, default_value_t = 1)]
        polls_to_complete: u32,

        /// Monitor poll interval in milliseconds (overrides the config)
        #[arg(long)]
        poll_interval_ms: Option<u64>,

        /// Fail every simulated job with this message
        #[arg(long)]
        fail_with: Option<String>,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(log_level: &str, json: bool) -> anyhow::Result<()> {
    let level = match log_level {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };
    // RUST_LOG wins over --log-level when set.
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    if json {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .without_time()
            .with_target(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level, args.log_json)?;

    let config = config::load_config(args.config.as_deref())?;

    match args.command {
        Command::Validate { file, json } => {
            validate::execute(&file, json)?;
        }
        Command::Spec { file, stream } => {
            spec::execute(&file, stream, &config)?;
        }
        Command::Simulate { file, ceiling, polls_to_complete, poll_interval_ms, fail_with, json } => {
            let options = simulate::SimulateOptions { ceiling, polls_to_complete, poll_interval_ms, fail_with, json };
            simulate::execute(&file, options, config).await?;
        }
    }

    Ok(())
}
