//! Pre/post checks wrapped around every ingestion job.
//!
//! Precondition failures abort the job before it runs. Postcondition issues
//! never abort; they come back as [`Finding`]s on the [`RunContext`].

use crate::canary::CanaryRegistry;
use crate::circuit_breaker::{BreakerError, BreakerRegistry, CircuitBreakerConfig};
use crate::config::AppConfig;
use crate::expectations::ExpectationSet;
use crate::health_store::{HealthStore, RunRecord, Severity};
use crate::metrics;
use crate::staleness::StalenessMonitor;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PreconditionError {
    #[error("storage unreachable: {0}")]
    StorageUnreachable(String),
    #[error("circuit breaker for {source_id} is open")]
    BreakerOpen { source_id: String },
}

impl PreconditionError {
    fn reason(&self) -> &'static str {
        match self {
            PreconditionError::StorageUnreachable(_) => "storage_unreachable",
            PreconditionError::BreakerOpen { .. } => "breaker_open",
        }
    }
}

/// Lookup of approved source ids. Informational only: unknown sources are
/// logged, never rejected.
pub trait SourceRegistry: Send + Sync {
    fn is_known(&self, source_id: &str) -> bool;
}

/// Explicitly approved ids plus every id matched by a configured
/// expectation.
pub struct ApprovedSources {
    ids: BTreeSet<String>,
    expectations: Arc<ExpectationSet>,
}

impl ApprovedSources {
    pub fn new(ids: impl IntoIterator<Item = String>, expectations: Arc<ExpectationSet>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
            expectations,
        }
    }
}

impl SourceRegistry for ApprovedSources {
    fn is_known(&self, source_id: &str) -> bool {
        self.ids.contains(source_id) || self.expectations.matching(source_id).next().is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    WriteNotVerified,
    CanaryFailed,
    SourceStale,
    CheckError,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finding {
    pub kind: FindingKind,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunContext {
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub known_source: bool,
    pub findings: Vec<Finding>,
}

impl RunContext {
    pub fn has_findings(&self) -> bool {
        !self.findings.is_empty()
    }

    pub fn max_severity(&self) -> Option<Severity> {
        self.findings.iter().map(|f| f.severity).max()
    }
}

/// What a finished job reports back: its run record and, when it persisted
/// the record itself, the row id it got.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub record: RunRecord,
    pub row_id: Option<i64>,
}

pub struct RunLifecycle {
    store: Arc<dyn HealthStore>,
    breakers: Arc<BreakerRegistry>,
    canaries: Arc<CanaryRegistry>,
    monitor: StalenessMonitor,
    sources: Arc<dyn SourceRegistry>,
    breaker_config: CircuitBreakerConfig,
}

impl RunLifecycle {
    pub fn new(
        store: Arc<dyn HealthStore>,
        breakers: Arc<BreakerRegistry>,
        canaries: Arc<CanaryRegistry>,
        expectations: Arc<ExpectationSet>,
        sources: Arc<dyn SourceRegistry>,
    ) -> Self {
        Self {
            monitor: StalenessMonitor::new(store.clone(), expectations),
            store,
            breakers,
            canaries,
            sources,
            breaker_config: CircuitBreakerConfig::default(),
        }
    }

    /// Configuration for breakers created by [`RunLifecycle::run_guarded_job`].
    pub fn with_breaker_config(mut self, breaker_config: CircuitBreakerConfig) -> Self {
        self.breaker_config = breaker_config;
        self
    }

    /// Wires a lifecycle from resolved configuration, loading expectations
    /// and canaries.
    pub fn from_config(
        config: &AppConfig,
        store: Arc<dyn HealthStore>,
        breakers: Arc<BreakerRegistry>,
    ) -> anyhow::Result<Self> {
        let expectations = Arc::new(ExpectationSet::load(&config.expectations_path)?);
        let canaries = Arc::new(CanaryRegistry::from_config(&config.canaries, store.clone())?);
        let sources = Arc::new(ApprovedSources::new(
            config.approved_sources.iter().cloned(),
            expectations.clone(),
        ));
        Ok(Self::new(store, breakers, canaries, expectations, sources)
            .with_breaker_config(config.circuit_breaker))
    }

    pub fn canaries(&self) -> &CanaryRegistry {
        &self.canaries
    }

    pub fn breaker_config(&self) -> &CircuitBreakerConfig {
        &self.breaker_config
    }

    fn reject(&self, source_id: &str, err: PreconditionError) -> PreconditionError {
        warn!("Precondition failed for {}: {}", source_id, err);
        metrics::record_precondition_failure(err.reason());
        err
    }

    /// Decides whether a job for `source_id` may run.
    pub fn pre_run_check(&self, source_id: &str) -> Result<RunContext, PreconditionError> {
        if let Err(e) = self.store.ping() {
            return Err(self.reject(
                source_id,
                PreconditionError::StorageUnreachable(format!("{:#}", e)),
            ));
        }

        if let Some(breaker) = self.breakers.get(source_id) {
            if breaker.is_open() {
                return Err(self.reject(
                    source_id,
                    PreconditionError::BreakerOpen {
                        source_id: source_id.to_string(),
                    },
                ));
            }
        }

        let known_source = self.sources.is_known(source_id);
        if !known_source {
            warn!("Running unrecognized source {}", source_id);
        }

        Ok(RunContext {
            source_id: source_id.to_string(),
            started_at: Utc::now(),
            known_source,
            findings: Vec::new(),
        })
    }

    pub fn post_run_check(&self, ctx: RunContext, report: Option<&JobReport>) -> RunContext {
        self.post_run_check_at(ctx, report, Utc::now())
    }

    /// Verifies the write, runs canaries and re-checks staleness of matching
    /// sources. Never fails.
    pub fn post_run_check_at(
        &self,
        mut ctx: RunContext,
        report: Option<&JobReport>,
        now: DateTime<Utc>,
    ) -> RunContext {
        if let Some(JobReport {
            record,
            row_id: Some(row_id),
        }) = report
        {
            if let Some(finding) = self.verify_write(record, *row_id) {
                ctx.findings.push(finding);
            }
        }

        let record = report.map(|r| &r.record);
        for result in self.canaries.run_at(&ctx.source_id, record, now) {
            if result.passed {
                continue;
            }
            metrics::record_canary_failure(&ctx.source_id, result.severity);
            ctx.findings.push(Finding {
                kind: FindingKind::CanaryFailed,
                severity: result.severity,
                message: format!("{}: {}", result.check, result.message),
            });
        }

        for alert in self.monitor.check_matching_at(&ctx.source_id, now) {
            ctx.findings.push(Finding {
                kind: FindingKind::SourceStale,
                severity: alert.severity,
                message: match alert.hours_overdue {
                    Some(h) => format!(
                        "{} is {:.1}h overdue ({} consecutive failures)",
                        alert.source_id, h, alert.consecutive_failures
                    ),
                    None => format!(
                        "{} is stale ({} consecutive failures)",
                        alert.source_id, alert.consecutive_failures
                    ),
                },
            });
        }

        debug!(
            "Post-run check for {} produced {} findings",
            ctx.source_id,
            ctx.findings.len()
        );
        ctx
    }

    fn verify_write(&self, record: &RunRecord, row_id: i64) -> Option<Finding> {
        match self.store.get_run(row_id) {
            Ok(Some(stored)) if stored.source_id == record.source_id => None,
            Ok(Some(stored)) => Some(Finding {
                kind: FindingKind::WriteNotVerified,
                severity: Severity::Critical,
                message: format!(
                    "run row {} belongs to {}, expected {}",
                    row_id, stored.source_id, record.source_id
                ),
            }),
            Ok(None) => Some(Finding {
                kind: FindingKind::WriteNotVerified,
                severity: Severity::Critical,
                message: format!("run row {} for {} is not readable", row_id, record.source_id),
            }),
            Err(e) => {
                error!("Failed to verify run row {}: {:#}", row_id, e);
                Some(Finding {
                    kind: FindingKind::CheckError,
                    severity: Severity::Critical,
                    message: format!("could not verify run row {}: {:#}", row_id, e),
                })
            }
        }
    }

    /// Runs `job` between the pre and post checks and records its run.
    ///
    /// The job returns the number of records it fetched; `0` is recorded as
    /// `NO_DATA`, an error as `ERROR`.
    pub fn run_job<F>(&self, source_id: &str, job: F) -> Result<RunContext, PreconditionError>
    where
        F: FnOnce() -> anyhow::Result<u64>,
    {
        let ctx = self.pre_run_check(source_id)?;
        let outcome = job();
        Ok(self.finish(ctx, outcome))
    }

    /// Like [`RunLifecycle::run_job`], with the job also passing through the
    /// source's circuit breaker so its outcome counts toward tripping it.
    /// A missing breaker is created with the lifecycle's breaker config.
    pub fn run_guarded_job<F>(&self, source_id: &str, job: F) -> Result<RunContext, PreconditionError>
    where
        F: FnOnce() -> anyhow::Result<u64>,
    {
        let breaker = self.breakers.get_or_create(source_id, self.breaker_config);
        let ctx = self.pre_run_check(source_id)?;
        let outcome = match breaker.call(job) {
            Ok(n) => Ok(n),
            Err(BreakerError::Call(e)) => Err(e),
            Err(BreakerError::Open { .. }) => {
                return Err(self.reject(
                    source_id,
                    PreconditionError::BreakerOpen {
                        source_id: source_id.to_string(),
                    },
                ))
            }
        };
        Ok(self.finish(ctx, outcome))
    }

    fn finish(&self, mut ctx: RunContext, outcome: anyhow::Result<u64>) -> RunContext {
        let ended_at = Utc::now();
        let record = match outcome {
            Ok(0) => RunRecord::no_data(&ctx.source_id, ctx.started_at, ended_at),
            Ok(n) => RunRecord::success(&ctx.source_id, ctx.started_at, ended_at, n),
            Err(e) => RunRecord::error(
                &ctx.source_id,
                ctx.started_at,
                ended_at,
                vec![format!("{:#}", e)],
            ),
        };

        let row_id = match self.store.insert_run(&record) {
            Ok(id) => Some(id),
            Err(e) => {
                error!("Failed to record run for {}: {:#}", ctx.source_id, e);
                ctx.findings.push(Finding {
                    kind: FindingKind::WriteNotVerified,
                    severity: Severity::Critical,
                    message: format!("run record was not written: {:#}", e),
                });
                None
            }
        };

        self.post_run_check_at(ctx, Some(&JobReport { record, row_id }), ended_at)
    }
}
