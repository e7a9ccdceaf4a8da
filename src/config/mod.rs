mod file_config;

pub use file_config::{
    CanaryCheckConfig, CanaryConfig, CircuitBreakerFileConfig, CorrelationFileConfig, FileConfig,
};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::correlator::CorrelationSettings;
use crate::health_score::TrackedTable;
use crate::sqlite_persistence::is_valid_identifier;
use anyhow::{anyhow, bail, Result};
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments that can be overridden by the TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_path: Option<PathBuf>,
    pub expectations_path: Option<PathBuf>,
    pub metrics_port: u16,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub expectations_path: PathBuf,
    pub metrics_port: u16,
    pub sweep_interval: Duration,
    pub approved_sources: Vec<String>,

    pub circuit_breaker: CircuitBreakerConfig,
    pub correlation: CorrelationSettings,
    pub tracked_tables: Vec<TrackedTable>,
    pub canaries: Vec<CanaryConfig>,
}

fn check_identifier(name: &str, what: &str) -> Result<()> {
    if !is_valid_identifier(name) {
        bail!("Invalid {} name {:?}: expected [A-Za-z_][A-Za-z0-9_]*", what, name);
    }
    Ok(())
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_path = file
            .db_path
            .map(PathBuf::from)
            .or_else(|| cli.db_path.clone())
            .ok_or_else(|| anyhow!("db_path must be specified via --db-path or in config file"))?;

        let expectations_path = file
            .expectations_path
            .map(PathBuf::from)
            .or_else(|| cli.expectations_path.clone())
            .ok_or_else(|| {
                anyhow!("expectations_path must be specified via --expectations or in config file")
            })?;

        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);
        let sweep_interval_secs = file.sweep_interval_secs.unwrap_or(cli.sweep_interval_secs);
        if sweep_interval_secs == 0 {
            bail!("sweep_interval_secs must be greater than 0");
        }

        let cb_file = file.circuit_breaker.unwrap_or_default();
        let cb_defaults = CircuitBreakerConfig::default();
        let circuit_breaker = CircuitBreakerConfig {
            failure_threshold: cb_file
                .failure_threshold
                .unwrap_or(cb_defaults.failure_threshold),
            reset_timeout: cb_file
                .reset_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(cb_defaults.reset_timeout),
        };
        if circuit_breaker.failure_threshold == 0 {
            bail!("circuit_breaker.failure_threshold must be at least 1");
        }

        let corr_file = file.correlation.unwrap_or_default();
        let corr_defaults = CorrelationSettings::default();
        let correlation = CorrelationSettings {
            current_window_minutes: corr_file
                .current_window_minutes
                .unwrap_or(corr_defaults.current_window_minutes),
            min_sources: corr_file.min_sources.unwrap_or(corr_defaults.min_sources),
            min_open_breakers: corr_file
                .min_open_breakers
                .unwrap_or(corr_defaults.min_open_breakers),
        };
        if correlation.current_window_minutes <= 0 {
            bail!("correlation.current_window_minutes must be greater than 0");
        }
        if correlation.min_sources == 0 || correlation.min_open_breakers == 0 {
            bail!("correlation.min_sources and min_open_breakers must be at least 1");
        }

        let tracked_tables = file.tracked_tables.unwrap_or_default();
        for tracked in &tracked_tables {
            check_identifier(&tracked.table, "tracked table")?;
            check_identifier(&tracked.recency_column, "recency column")?;
        }

        let canaries = file.canaries.unwrap_or_default();
        for canary in &canaries {
            for identifier in canary.check.identifiers() {
                check_identifier(identifier, &format!("canary ({}) table/column", canary.source_id))?;
            }
        }

        Ok(Self {
            db_path,
            expectations_path,
            metrics_port,
            sweep_interval: Duration::from_secs(sweep_interval_secs),
            approved_sources: file.approved_sources.unwrap_or_default(),
            circuit_breaker,
            correlation,
            tracked_tables,
            canaries,
        })
    }
}
