//! Post-ingestion canary assertions.
//!
//! Canaries are cheap "does this look right" checks registered per source.
//! They are advisory: running them never fails and never blocks the job.

mod checks;

pub use checks::{DuplicateKeyCheck, MonotonicTimestampCheck, WeekdayVolumeCheck};

use crate::config::CanaryConfig;
use crate::health_store::{HealthStore, RunRecord, Severity};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tracing::{error, warn};

/// What a canary sees about the job it checks.
pub struct CanaryInput<'a> {
    pub source_id: &'a str,
    pub run: Option<&'a RunRecord>,
    pub now: DateTime<Utc>,
}

/// Result of one check invocation. Failing is an expected outcome, not an
/// error.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    Passed(String),
    Failed(String),
    /// Check does not apply right now (e.g. weekend); produces no result.
    Skipped,
    /// The check itself could not run.
    Errored(String),
}

pub trait CanaryCheck: Send + Sync {
    fn name(&self) -> &str;
    /// Severity reported when the check fails.
    fn severity(&self) -> Severity;
    fn run(&self, input: &CanaryInput) -> CheckOutcome;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanaryResult {
    pub check: String,
    pub passed: bool,
    pub message: String,
    pub severity: Severity,
}

impl CanaryResult {
    fn broken(check: &str, message: String) -> Self {
        Self {
            check: check.to_string(),
            passed: false,
            message,
            severity: Severity::Critical,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "check panicked".to_string()
    }
}

/// Ordered canary checks per source id.
#[derive(Default)]
pub struct CanaryRegistry {
    checks: RwLock<HashMap<String, Vec<Arc<dyn CanaryCheck>>>>,
}

impl CanaryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from `[[canaries]]` configuration.
    pub fn from_config(configs: &[CanaryConfig], store: Arc<dyn HealthStore>) -> Result<Self> {
        let registry = Self::new();
        for config in configs {
            registry.register(&config.source_id, checks::build_check(config, store.clone())?);
        }
        Ok(registry)
    }

    pub fn register(&self, source_id: &str, check: Arc<dyn CanaryCheck>) {
        self.checks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(source_id.to_string())
            .or_default()
            .push(check);
    }

    pub fn registered_sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = self
            .checks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        sources.sort();
        sources
    }

    /// Runs every check registered for `source_id`, in registration order.
    ///
    /// Unregistered sources yield no results. A check that errors or panics
    /// yields one critical result carrying the error text.
    pub fn run(&self, source_id: &str, run: Option<&RunRecord>) -> Vec<CanaryResult> {
        self.run_at(source_id, run, Utc::now())
    }

    pub fn run_at(
        &self,
        source_id: &str,
        run: Option<&RunRecord>,
        now: DateTime<Utc>,
    ) -> Vec<CanaryResult> {
        let checks = match self
            .checks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(source_id)
        {
            Some(checks) => checks.clone(),
            None => return Vec::new(),
        };

        let input = CanaryInput {
            source_id,
            run,
            now,
        };
        let mut results = Vec::with_capacity(checks.len());
        for check in checks {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| check.run(&input)));
            let result = match outcome {
                Ok(CheckOutcome::Passed(message)) => CanaryResult {
                    check: check.name().to_string(),
                    passed: true,
                    message,
                    severity: check.severity(),
                },
                Ok(CheckOutcome::Failed(message)) => {
                    warn!(
                        "Canary {} failed for {}: {}",
                        check.name(),
                        source_id,
                        message
                    );
                    CanaryResult {
                        check: check.name().to_string(),
                        passed: false,
                        message,
                        severity: check.severity(),
                    }
                }
                Ok(CheckOutcome::Skipped) => continue,
                Ok(CheckOutcome::Errored(message)) => {
                    error!("Canary {} errored for {}: {}", check.name(), source_id, message);
                    CanaryResult::broken(check.name(), format!("check error: {}", message))
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!("Canary {} panicked for {}: {}", check.name(), source_id, message);
                    CanaryResult::broken(check.name(), format!("check panicked: {}", message))
                }
            };
            results.push(result);
        }
        results
    }
}
