//! Common test infrastructure
//!
//! Builds an in-memory health store plus the engines that read it, with a
//! fixed clock so scenarios are deterministic.

#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use pipeline_sentinel::circuit_breaker::{BreakerError, BreakerRegistry, CircuitBreakerConfig};
use pipeline_sentinel::correlator::CorrelationSettings;
use pipeline_sentinel::expectations::{ExpectationSet, Frequency, SourceExpectation};
use pipeline_sentinel::health_score::{HealthScoreEngine, TrackedTable};
use pipeline_sentinel::health_store::{HealthStore, RunRecord, SqliteHealthStore};
use std::sync::Arc;
use std::time::Duration as StdDuration;

/// Wednesday noon, so weekday canaries apply.
pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 4, 12, 0, 0).unwrap()
}

pub fn minutes_ago(minutes: i64) -> DateTime<Utc> {
    fixed_now() - Duration::minutes(minutes)
}

pub fn hours_ago(hours: f64) -> DateTime<Utc> {
    fixed_now() - Duration::milliseconds((hours * 3_600_000.0) as i64)
}

pub fn daily(source_id: &str, tolerance: f64, alert_after: f64, is_critical: bool) -> SourceExpectation {
    SourceExpectation::new(source_id, Frequency::Daily, tolerance, alert_after, is_critical).unwrap()
}

pub struct TestHealth {
    pub store: Arc<SqliteHealthStore>,
    pub breakers: Arc<BreakerRegistry>,
    pub expectations: Arc<ExpectationSet>,
}

impl TestHealth {
    pub fn new(expectations: Vec<SourceExpectation>) -> Self {
        Self {
            store: Arc::new(SqliteHealthStore::in_memory().unwrap()),
            breakers: Arc::new(BreakerRegistry::new()),
            expectations: Arc::new(ExpectationSet::new(expectations).unwrap()),
        }
    }

    pub fn engine(&self, tracked_tables: Vec<TrackedTable>) -> HealthScoreEngine {
        HealthScoreEngine::new(
            self.store.clone(),
            self.expectations.clone(),
            self.breakers.clone(),
            CorrelationSettings::default(),
            tracked_tables,
        )
    }

    pub fn success(&self, source_id: &str, ended: DateTime<Utc>, records: u64) -> i64 {
        self.store
            .insert_run(&RunRecord::success(source_id, ended, ended, records))
            .unwrap()
    }

    pub fn no_data(&self, source_id: &str, ended: DateTime<Utc>) -> i64 {
        self.store
            .insert_run(&RunRecord::no_data(source_id, ended, ended))
            .unwrap()
    }

    pub fn error(&self, source_id: &str, ended: DateTime<Utc>) -> i64 {
        self.store
            .insert_run(&RunRecord::error(
                source_id,
                ended,
                ended,
                vec![format!("{} upstream returned 503", source_id)],
            ))
            .unwrap()
    }

    /// Creates a breaker for `name` and trips it.
    pub fn trip_breaker(&self, name: &str) {
        let breaker = self.breakers.get_or_create(
            name,
            CircuitBreakerConfig {
                failure_threshold: 1,
                reset_timeout: StdDuration::from_secs(3600),
            },
        );
        let result: Result<(), BreakerError<&str>> = breaker.call(|| Err("connection refused"));
        assert!(result.is_err());
    }

    pub fn closed_breaker(&self, name: &str) {
        self.breakers
            .get_or_create(name, CircuitBreakerConfig::default());
    }
}
