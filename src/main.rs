use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pipeline_sentinel::circuit_breaker::default_registry;
use pipeline_sentinel::config::{AppConfig, CliConfig, FileConfig};
use pipeline_sentinel::health_store::{HealthStore, SqliteHealthStore};
use pipeline_sentinel::lifecycle::RunLifecycle;
use pipeline_sentinel::metrics;
use pipeline_sentinel::sweep::{run_watch, serve_metrics, HealthSweep};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    if path_buf.is_absolute() {
        return Ok(path_buf);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(path_buf))
}

#[derive(Parser, Debug)]
#[command(name = "pipeline-sentinel", about = "Ingestion pipeline health monitor")]
struct CliArgs {
    /// Path to a TOML config file. Values in the file override CLI flags.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Path to the SQLite health database.
    #[clap(long, value_parser = parse_path)]
    pub db_path: Option<PathBuf>,

    /// Path to the source expectations TOML file.
    #[clap(long, value_parser = parse_path)]
    pub expectations: Option<PathBuf>,

    /// The port for the metrics server (Prometheus scraping), used by `watch`.
    #[clap(long, default_value_t = 9091)]
    pub metrics_port: u16,

    /// Seconds between health sweeps, used by `watch`.
    #[clap(long, default_value_t = 300)]
    pub sweep_interval_secs: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate staleness of every configured source.
    Check {
        /// Append the resulting alerts to the alert log.
        #[clap(long)]
        persist: bool,
    },
    /// Compute the aggregate health score.
    Score,
    /// Show the current incident, or all incidents of the last N hours.
    Incident {
        #[clap(long)]
        hours: Option<i64>,
    },
    /// Show the persisted staleness alert history, newest first.
    Alerts {
        #[clap(long, default_value_t = 50)]
        limit: usize,
        #[clap(long)]
        source: Option<String>,
    },
    /// Run the canaries configured for a source against its output tables.
    Canary { source_id: String },
    /// Show the circuit breakers known to this process.
    Breakers,
    /// Sweep periodically and serve metrics until a sweep fails.
    Watch,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let cli_config = CliConfig {
        db_path: cli_args.db_path.clone(),
        expectations_path: cli_args.expectations.clone(),
        metrics_port: cli_args.metrics_port,
        sweep_interval_secs: cli_args.sweep_interval_secs,
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;

    let store: Arc<dyn HealthStore> = Arc::new(SqliteHealthStore::new(&config.db_path)?);
    let breakers = default_registry();
    let sweep = Arc::new(HealthSweep::new(store.clone(), breakers.clone(), config.clone()));

    match cli_args.command {
        Command::Check { persist } => {
            let engine = sweep.engine(sweep.load_expectations()?);
            print_json(&engine.monitor().check_all_sources(persist))
        }
        Command::Score => {
            let engine = sweep.engine(sweep.load_expectations()?);
            print_json(&engine.compute_health_score())
        }
        Command::Incident { hours } => {
            let engine = sweep.engine(sweep.load_expectations()?);
            match hours {
                Some(hours) => print_json(&engine.correlator().get_recent_incidents(hours)),
                None => print_json(&engine.correlator().get_current_incident()),
            }
        }
        Command::Alerts { limit, source } => {
            print_json(&store.list_staleness_alerts(source.as_deref(), limit)?)
        }
        Command::Canary { source_id } => {
            let lifecycle = RunLifecycle::from_config(&config, store.clone(), breakers)?;
            print_json(&lifecycle.canaries().run(&source_id, None))
        }
        Command::Breakers => print_json(&breakers.snapshots()),
        Command::Watch => {
            metrics::init_metrics();
            info!(
                "Watching pipeline health every {:?}",
                config.sweep_interval
            );
            tokio::select! {
                result = serve_metrics(config.metrics_port) => {
                    if let Err(e) = &result {
                        error!("Metrics server stopped: {:#}", e);
                    }
                    result
                }
                result = run_watch(sweep, config.sweep_interval) => {
                    if let Err(e) = &result {
                        error!("Health sweep failed: {:#}", e);
                    }
                    result
                }
            }
        }
    }
}
