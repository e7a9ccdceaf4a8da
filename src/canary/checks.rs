use super::{CanaryCheck, CanaryInput, CheckOutcome};
use crate::config::{CanaryCheckConfig, CanaryConfig};
use crate::health_store::{HealthStore, Severity};
use anyhow::{bail, Result};
use chrono::{Datelike, Weekday};
use std::sync::Arc;

/// Duplicate values reported in a failure message.
const DUPLICATE_SAMPLE: usize = 5;

pub(super) fn build_check(
    config: &CanaryConfig,
    store: Arc<dyn HealthStore>,
) -> Result<Arc<dyn CanaryCheck>> {
    let check: Arc<dyn CanaryCheck> = match &config.check {
        CanaryCheckConfig::WeekdayVolume => Arc::new(WeekdayVolumeCheck),
        CanaryCheckConfig::DuplicateKey { table, key_column } => Arc::new(DuplicateKeyCheck {
            store,
            table: table.clone(),
            key_column: key_column.clone(),
        }),
        CanaryCheckConfig::MonotonicTimestamp {
            table,
            timestamp_column,
            sample_size,
        } => {
            if *sample_size < 2 {
                bail!(
                    "monotonic_timestamp canary for {} needs sample_size >= 2",
                    config.source_id
                );
            }
            Arc::new(MonotonicTimestampCheck {
                store,
                table: table.clone(),
                timestamp_column: timestamp_column.clone(),
                sample_size: *sample_size,
            })
        }
    };
    Ok(check)
}

/// Flags a business-day run that fetched nothing.
pub struct WeekdayVolumeCheck;

impl CanaryCheck for WeekdayVolumeCheck {
    fn name(&self) -> &str {
        "weekday_volume"
    }

    fn severity(&self) -> Severity {
        Severity::Warning
    }

    fn run(&self, input: &CanaryInput) -> CheckOutcome {
        if matches!(input.now.weekday(), Weekday::Sat | Weekday::Sun) {
            return CheckOutcome::Skipped;
        }
        let Some(run) = input.run else {
            return CheckOutcome::Skipped;
        };
        if run.records_fetched == 0 {
            CheckOutcome::Failed(format!(
                "{} fetched 0 records on a business day ({:?})",
                input.source_id,
                input.now.weekday()
            ))
        } else {
            CheckOutcome::Passed(format!("{} records fetched", run.records_fetched))
        }
    }
}

/// Any key occurring more than once means the upsert/dedup path is broken.
pub struct DuplicateKeyCheck {
    pub store: Arc<dyn HealthStore>,
    pub table: String,
    pub key_column: String,
}

impl CanaryCheck for DuplicateKeyCheck {
    fn name(&self) -> &str {
        "duplicate_key"
    }

    fn severity(&self) -> Severity {
        Severity::Critical
    }

    fn run(&self, _input: &CanaryInput) -> CheckOutcome {
        match self
            .store
            .duplicate_keys(&self.table, &self.key_column, DUPLICATE_SAMPLE)
        {
            Err(e) => CheckOutcome::Errored(format!("{:#}", e)),
            Ok(duplicates) if duplicates.is_empty() => CheckOutcome::Passed(format!(
                "no duplicate {} values in {}",
                self.key_column, self.table
            )),
            Ok(duplicates) => {
                let listed = duplicates
                    .iter()
                    .map(|(key, count)| format!("{} (x{})", key, count))
                    .collect::<Vec<_>>()
                    .join(", ");
                CheckOutcome::Failed(format!(
                    "duplicate {} values in {}: {}",
                    self.key_column, self.table, listed
                ))
            }
        }
    }
}

/// The last `sample_size` rows must carry non-decreasing timestamps in
/// insertion order.
pub struct MonotonicTimestampCheck {
    pub store: Arc<dyn HealthStore>,
    pub table: String,
    pub timestamp_column: String,
    pub sample_size: usize,
}

impl CanaryCheck for MonotonicTimestampCheck {
    fn name(&self) -> &str {
        "monotonic_timestamp"
    }

    fn severity(&self) -> Severity {
        Severity::Warning
    }

    fn run(&self, _input: &CanaryInput) -> CheckOutcome {
        let values = match self.store.recent_timestamps(
            &self.table,
            &self.timestamp_column,
            self.sample_size,
        ) {
            Ok(values) => values,
            Err(e) => return CheckOutcome::Errored(format!("{:#}", e)),
        };

        // Null or unparseable values carry no ordering information.
        let timestamps: Vec<_> = values.into_iter().flatten().collect();
        if timestamps.len() < 2 {
            return CheckOutcome::Skipped;
        }

        for (i, pair) in timestamps.windows(2).enumerate() {
            if pair[1] < pair[0] {
                return CheckOutcome::Failed(format!(
                    "{}.{} goes backwards at sample {}: {} then {}",
                    self.table,
                    self.timestamp_column,
                    i + 1,
                    pair[0].to_rfc3339(),
                    pair[1].to_rfc3339()
                ));
            }
        }
        CheckOutcome::Passed(format!(
            "last {} {} values are in order",
            timestamps.len(),
            self.timestamp_column
        ))
    }
}
