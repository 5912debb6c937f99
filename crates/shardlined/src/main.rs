//! shardlined — run a measured multi-instance workload.
//!
//! Spawns a batch of worker instances, drives synthetic load against
//! them, stops the run and prints its `RunStats`.
//!
//! # Usage
//!
//! ```text
//! shardlined run --instances 4 --shards 2 --duration 10s --rate 50 --simulated
//! shardlined run --config shardline.toml --format prometheus
//! shardlined config > shardline.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use shardline_core::{parse_duration, OrchestratorConfig, StartRequest};
use shardline_metrics::render_prometheus;
use shardline_orchestrator::OrchestratorController;
use shardline_runtime::{InstanceLauncher, ProcessLauncher, SimulatedLauncher};

#[derive(Parser)]
#[command(
    name = "shardlined",
    about = "Shardline — multi-instance workload orchestrator",
    version
)]
struct Cli {
    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a run, generate load, stop it and print the stats.
    Run {
        /// Config file (TOML). Defaults apply when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Instances to spawn (overrides the config).
        #[arg(long)]
        instances: Option<u32>,

        /// Shards to partition instances into (overrides the config).
        #[arg(long)]
        shards: Option<u32>,

        /// How long to generate load, e.g. `500ms`, `10s`, `2m`.
        #[arg(long, default_value = "10s", value_parser = duration_arg)]
        duration: Duration,

        /// Synthetic requests per second.
        #[arg(long, default_value = "50")]
        rate: u32,

        /// Use in-process simulated instances instead of the worker command.
        #[arg(long)]
        simulated: bool,

        /// Output format for the stop response.
        #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },
    /// Print the default configuration as TOML.
    Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Prometheus,
}

fn duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).ok_or_else(|| format!("invalid duration `{s}` (expected e.g. 500ms, 10s, 2m)"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run {
            config,
            instances,
            shards,
            duration,
            rate,
            simulated,
            format,
        } => {
            let mut config = match config {
                Some(path) => OrchestratorConfig::from_file(&path)?,
                None => OrchestratorConfig::default(),
            };
            if let Some(n) = instances {
                config.instance_count = n;
            }
            if let Some(m) = shards {
                config.shard_count = m;
            }
            run(config, duration, rate, simulated, format).await
        }
        Command::Config => {
            print!("{}", OrchestratorConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    // Logs go to stderr so stdout carries only the stop response.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,shardline=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(
    config: OrchestratorConfig,
    duration: Duration,
    rate: u32,
    simulated: bool,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let launcher: Arc<dyn InstanceLauncher> = if simulated {
        Arc::new(SimulatedLauncher::new())
    } else {
        Arc::new(ProcessLauncher::new(config.worker.clone()))
    };
    let request = StartRequest {
        instance_count: config.instance_count,
        shard_count: config.shard_count,
    };
    let controller = OrchestratorController::new(config, launcher)?;

    let started = controller.start(request).await?;
    info!(
        run = started.run,
        instances = started.instances,
        shards = started.shards,
        pids = ?started.pids,
        "run started"
    );

    // Ctrl-C cuts the load phase short; the run is still stopped cleanly.
    tokio::select! {
        result = controller.simulate_workload(duration, rate) => {
            let report = result?;
            info!(dispatched = report.dispatched, planned = report.planned, "load phase finished");
        }
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("interrupt received, stopping run early"),
                Err(e) => warn!(error = %e, "failed to listen for interrupt, stopping run"),
            }
        }
    }

    let stopped = controller.stop().await?;
    for warning in &stopped.warnings {
        warn!(?warning, "run finished with warning");
    }

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stopped)?),
        OutputFormat::Prometheus => print!("{}", render_prometheus(&stopped.stats)),
    }
    Ok(())
}
