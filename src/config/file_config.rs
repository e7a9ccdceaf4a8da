use crate::health_score::TrackedTable;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_path: Option<String>,
    pub expectations_path: Option<String>,
    pub metrics_port: Option<u16>,
    pub sweep_interval_secs: Option<u64>,
    pub approved_sources: Option<Vec<String>>,

    // Feature configs
    pub circuit_breaker: Option<CircuitBreakerFileConfig>,
    pub correlation: Option<CorrelationFileConfig>,
    pub tracked_tables: Option<Vec<TrackedTable>>,
    pub canaries: Option<Vec<CanaryConfig>>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct CircuitBreakerFileConfig {
    pub failure_threshold: Option<u32>,
    pub reset_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct CorrelationFileConfig {
    pub current_window_minutes: Option<i64>,
    pub min_sources: Option<usize>,
    pub min_open_breakers: Option<usize>,
}

/// One `[[canaries]]` entry.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct CanaryConfig {
    pub source_id: String,
    #[serde(flatten)]
    pub check: CanaryCheckConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CanaryCheckConfig {
    WeekdayVolume,
    DuplicateKey {
        table: String,
        key_column: String,
    },
    MonotonicTimestamp {
        table: String,
        timestamp_column: String,
        #[serde(default = "default_sample_size")]
        sample_size: usize,
    },
}

fn default_sample_size() -> usize {
    20
}

impl CanaryCheckConfig {
    /// Table and column names interpolated into SQL by this check.
    pub fn identifiers(&self) -> Vec<&str> {
        match self {
            CanaryCheckConfig::WeekdayVolume => vec![],
            CanaryCheckConfig::DuplicateKey { table, key_column } => {
                vec![table.as_str(), key_column.as_str()]
            }
            CanaryCheckConfig::MonotonicTimestamp {
                table,
                timestamp_column,
                ..
            } => vec![table.as_str(), timestamp_column.as_str()],
        }
    }
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config: FileConfig = toml::from_str(
            r#"
            db_path = "/var/lib/sentinel/health.db"
            expectations_path = "/etc/sentinel/expectations.toml"
            metrics_port = 9200
            sweep_interval_secs = 120
            approved_sources = ["congress", "fr_delta"]

            [circuit_breaker]
            failure_threshold = 4

            [correlation]
            min_sources = 4

            [[tracked_tables]]
            table = "bills"
            recency_column = "updated_at"

            [[canaries]]
            source_id = "congress"
            kind = "weekday_volume"

            [[canaries]]
            source_id = "congress"
            kind = "duplicate_key"
            table = "bills"
            key_column = "bill_id"

            [[canaries]]
            source_id = "fr_delta"
            kind = "monotonic_timestamp"
            table = "documents"
            timestamp_column = "published_at"
            "#,
        )
        .unwrap();

        assert_eq!(config.metrics_port, Some(9200));
        assert_eq!(config.circuit_breaker.unwrap().failure_threshold, Some(4));
        assert_eq!(config.correlation.unwrap().min_sources, Some(4));
        assert_eq!(config.tracked_tables.unwrap().len(), 1);

        let canaries = config.canaries.unwrap();
        assert_eq!(canaries.len(), 3);
        assert_eq!(canaries[0].check, CanaryCheckConfig::WeekdayVolume);
        assert_eq!(
            canaries[2].check,
            CanaryCheckConfig::MonotonicTimestamp {
                table: "documents".into(),
                timestamp_column: "published_at".into(),
                sample_size: 20,
            }
        );
    }

    #[test]
    fn test_empty_config_is_default() {
        let config: FileConfig = toml::from_str("").unwrap();
        assert!(config.db_path.is_none());
        assert!(config.canaries.is_none());
    }

    #[test]
    fn test_unknown_canary_kind_fails() {
        let result: Result<FileConfig, _> = toml::from_str(
            r#"
            [[canaries]]
            source_id = "x"
            kind = "row_count"
            "#,
        );
        assert!(result.is_err());
    }
}
