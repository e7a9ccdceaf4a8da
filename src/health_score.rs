//! Aggregate 0-100 health score over four weighted dimensions.
//!
//! Every call re-reads the store and the breaker registry; nothing is
//! cached. A dimension that cannot be computed scores a neutral 100 and says
//! so in its detail, so the result is always complete.

use crate::circuit_breaker::{BreakerRegistry, BreakerState};
use crate::correlator::{CorrelatedIncident, CorrelationSettings, FailureCorrelator};
use crate::expectations::ExpectationSet;
use crate::health_store::{HealthStore, RunCounts};
use crate::staleness::{
    hours_between, StalenessMonitor, FAILURE_RATE_ESCALATION, FAILURE_RATE_WINDOW_HOURS,
};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

pub const FRESHNESS_WEIGHT: f64 = 0.35;
pub const ERROR_RATE_WEIGHT: f64 = 0.30;
pub const BREAKER_WEIGHT: f64 = 0.20;
pub const COVERAGE_WEIGHT: f64 = 0.15;

/// Points taken off the error-rate dimension when any single source fails
/// more than half of its runs.
pub const FAILING_SOURCE_PENALTY: f64 = 20.0;

/// How recent a tracked table's newest row must be to count as covered.
pub const COVERAGE_WINDOW_HOURS: i64 = 24;

/// Number of recent hours whose incidents are attached to the score.
const INCIDENT_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    pub fn from_score(score: f64) -> Self {
        if score >= 90.0 {
            Grade::A
        } else if score >= 75.0 {
            Grade::B
        } else if score >= 60.0 {
            Grade::C
        } else if score >= 40.0 {
            Grade::D
        } else {
            Grade::F
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthDimension {
    pub name: &'static str,
    pub weight: f64,
    pub score: f64,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateHealth {
    pub score: f64,
    pub grade: Grade,
    pub dimensions: Vec<HealthDimension>,
    pub incidents: Vec<CorrelatedIncident>,
    pub computed_at: DateTime<Utc>,
}

impl AggregateHealth {
    pub fn dimension(&self, name: &str) -> Option<&HealthDimension> {
        self.dimensions.iter().find(|d| d.name == name)
    }
}

/// An output table whose recency column shows whether data is flowing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedTable {
    pub table: String,
    pub recency_column: String,
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Score plus human readable detail for one dimension.
type Scored = (f64, String);

pub struct HealthScoreEngine {
    store: Arc<dyn HealthStore>,
    breakers: Arc<BreakerRegistry>,
    monitor: StalenessMonitor,
    correlator: FailureCorrelator,
    tracked_tables: Vec<TrackedTable>,
}

impl HealthScoreEngine {
    pub fn new(
        store: Arc<dyn HealthStore>,
        expectations: Arc<ExpectationSet>,
        breakers: Arc<BreakerRegistry>,
        correlation: CorrelationSettings,
        tracked_tables: Vec<TrackedTable>,
    ) -> Self {
        Self {
            monitor: StalenessMonitor::new(store.clone(), expectations),
            correlator: FailureCorrelator::new(store.clone(), breakers.clone(), correlation),
            store,
            breakers,
            tracked_tables,
        }
    }

    pub fn monitor(&self) -> &StalenessMonitor {
        &self.monitor
    }

    pub fn correlator(&self) -> &FailureCorrelator {
        &self.correlator
    }

    pub fn compute_health_score(&self) -> AggregateHealth {
        self.compute_health_score_at(Utc::now())
    }

    pub fn compute_health_score_at(&self, now: DateTime<Utc>) -> AggregateHealth {
        let dimensions = vec![
            Self::dimension(
                "source_freshness",
                FRESHNESS_WEIGHT,
                self.freshness_score(now),
            ),
            Self::dimension("error_rate", ERROR_RATE_WEIGHT, self.error_rate_score(now)),
            Self::dimension(
                "circuit_breaker_health",
                BREAKER_WEIGHT,
                Ok(self.breaker_score()),
            ),
            Self::dimension("data_coverage", COVERAGE_WEIGHT, self.coverage_score(now)),
        ];

        let score = round1(dimensions.iter().map(|d| d.weight * d.score).sum());
        AggregateHealth {
            score,
            grade: Grade::from_score(score),
            dimensions,
            incidents: self.correlator.get_recent_incidents_at(INCIDENT_HOURS, now),
            computed_at: now,
        }
    }

    fn dimension(name: &'static str, weight: f64, scored: Result<Scored>) -> HealthDimension {
        let (score, detail) = match scored {
            Ok((score, detail)) => (score, detail),
            Err(e) => {
                error!("Failed to compute {} health dimension: {:#}", name, e);
                (100.0, format!("unknown: {:#}", e))
            }
        };
        HealthDimension {
            name,
            weight,
            score: round1(score.clamp(0.0, 100.0)),
            detail,
        }
    }

    fn freshness_score(&self, now: DateTime<Utc>) -> Result<Scored> {
        let expectations = self.monitor.expectations();
        if expectations.is_empty() {
            return Ok((100.0, "no sources configured".to_string()));
        }

        let mut total_weight = 0.0;
        let mut fresh_weight = 0.0;
        let mut stale = Vec::new();
        for expectation in expectations.iter() {
            let weight = if expectation.is_critical { 2.0 } else { 1.0 };
            total_weight += weight;
            let fresh = self
                .store
                .last_success_at(&expectation.source_filter())?
                .is_some_and(|last| hours_between(last, now) <= expectation.tolerance_hours);
            if fresh {
                fresh_weight += weight;
            } else {
                stale.push(expectation.source_id.as_str());
            }
        }

        let detail = if stale.is_empty() {
            format!("all {} sources fresh", expectations.len())
        } else {
            format!(
                "{} of {} sources stale: {}",
                stale.len(),
                expectations.len(),
                stale.join(", ")
            )
        };
        Ok((fresh_weight / total_weight * 100.0, detail))
    }

    fn error_rate_score(&self, now: DateTime<Utc>) -> Result<Scored> {
        let mut totals = RunCounts::default();
        let mut failing = Vec::new();
        for expectation in self.monitor.expectations().iter() {
            let counts = self.monitor.run_counts_at(
                &expectation.source_filter(),
                FAILURE_RATE_WINDOW_HOURS,
                now,
            )?;
            if counts.failure_rate() > FAILURE_RATE_ESCALATION {
                failing.push(expectation.source_id.as_str());
            }
            totals += counts;
        }

        if totals.total() == 0 {
            return Ok((100.0, "no runs in the last 24h".to_string()));
        }

        let healthy = (totals.total() - totals.error) as f64;
        let mut score = healthy / totals.total() as f64 * 100.0;
        let mut detail = format!(
            "{} errors in {} runs over 24h",
            totals.error,
            totals.total()
        );
        if !failing.is_empty() {
            score = (score - FAILING_SOURCE_PENALTY).max(0.0);
            detail.push_str(&format!(
                "; failing more than half the time: {}",
                failing.join(", ")
            ));
        }
        Ok((score, detail))
    }

    fn breaker_score(&self) -> Scored {
        let snapshots = self.breakers.snapshots();
        if snapshots.is_empty() {
            return (100.0, "no circuit breakers registered".to_string());
        }

        let mut open = Vec::new();
        let mut half_open = 0;
        let mut sum = 0.0;
        for snapshot in &snapshots {
            sum += match snapshot.state {
                BreakerState::Closed => 1.0,
                BreakerState::HalfOpen => {
                    half_open += 1;
                    0.5
                }
                BreakerState::Open => {
                    open.push(snapshot.name.as_str());
                    0.0
                }
            };
        }

        let mut detail = format!(
            "{} breakers: {} open, {} half-open",
            snapshots.len(),
            open.len(),
            half_open
        );
        if !open.is_empty() {
            detail.push_str(&format!(" ({})", open.join(", ")));
        }
        (sum / snapshots.len() as f64 * 100.0, detail)
    }

    fn coverage_score(&self, now: DateTime<Utc>) -> Result<Scored> {
        if self.tracked_tables.is_empty() {
            return Ok((100.0, "no tracked tables".to_string()));
        }

        let cutoff = now - Duration::hours(COVERAGE_WINDOW_HOURS);
        let mut inactive = Vec::new();
        for tracked in &self.tracked_tables {
            let active = self
                .store
                .latest_activity(&tracked.table, &tracked.recency_column)?
                .is_some_and(|latest| latest >= cutoff);
            if !active {
                inactive.push(tracked.table.as_str());
            }
        }

        let n = self.tracked_tables.len();
        let active = n - inactive.len();
        let detail = if inactive.is_empty() {
            format!("all {} tables active in the last 24h", n)
        } else {
            format!(
                "{} of {} tables active in the last 24h; inactive: {}",
                active,
                n,
                inactive.join(", ")
            )
        };
        Ok((active as f64 / n as f64 * 100.0, detail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{BreakerError, CircuitBreakerConfig};
    use crate::expectations::{Frequency, SourceExpectation};
    use crate::health_store::testing::UnreachableStore;
    use crate::health_store::{RunRecord, SqliteHealthStore};
    use chrono::TimeZone;
    use std::time::Duration as StdDuration;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, 12, 0, 0).unwrap()
    }

    fn hours_before(h: i64) -> DateTime<Utc> {
        now() - Duration::hours(h)
    }

    fn daily(id: &str, is_critical: bool) -> SourceExpectation {
        SourceExpectation::new(id, Frequency::Daily, 6.0, 24.0, is_critical).unwrap()
    }

    struct Fixture {
        store: Arc<SqliteHealthStore>,
        breakers: Arc<BreakerRegistry>,
        engine: HealthScoreEngine,
    }

    fn fixture(expectations: Vec<SourceExpectation>, tracked: Vec<TrackedTable>) -> Fixture {
        let store = Arc::new(SqliteHealthStore::in_memory().unwrap());
        let breakers = Arc::new(BreakerRegistry::new());
        let engine = HealthScoreEngine::new(
            store.clone(),
            Arc::new(ExpectationSet::new(expectations).unwrap()),
            breakers.clone(),
            CorrelationSettings::default(),
            tracked,
        );
        Fixture {
            store,
            breakers,
            engine,
        }
    }

    fn success(store: &SqliteHealthStore, id: &str, h: i64) {
        store
            .insert_run(&RunRecord::success(id, hours_before(h), hours_before(h), 1))
            .unwrap();
    }

    fn failure(store: &SqliteHealthStore, id: &str, h: i64) {
        store
            .insert_run(&RunRecord::error(id, hours_before(h), hours_before(h), vec!["x".into()]))
            .unwrap();
    }

    #[test]
    fn test_grades() {
        assert_eq!(Grade::from_score(90.0), Grade::A);
        assert_eq!(Grade::from_score(89.9), Grade::B);
        assert_eq!(Grade::from_score(75.0), Grade::B);
        assert_eq!(Grade::from_score(60.0), Grade::C);
        assert_eq!(Grade::from_score(40.0), Grade::D);
        assert_eq!(Grade::from_score(39.9), Grade::F);
    }

    #[test]
    fn test_empty_system_scores_perfect() {
        let f = fixture(vec![], vec![]);
        let health = f.engine.compute_health_score_at(now());
        assert_eq!(health.score, 100.0);
        assert_eq!(health.grade, Grade::A);
        assert_eq!(health.dimensions.len(), 4);
        assert!(health.incidents.is_empty());
    }

    #[test]
    fn test_freshness_weights_critical_sources_double() {
        let f = fixture(vec![daily("a", true), daily("b", false)], vec![]);
        success(&f.store, "b", 1);
        // a (weight 2) stale, b (weight 1) fresh.
        let health = f.engine.compute_health_score_at(now());
        let freshness = health.dimension("source_freshness").unwrap();
        assert_eq!(freshness.score, 33.3);
        assert!(freshness.detail.contains("a"));
    }

    #[test]
    fn test_one_failing_source_is_not_averaged_away() {
        let ids: Vec<String> = (0..10).map(|i| format!("src{}", i)).collect();
        let f = fixture(ids.iter().map(|id| daily(id, false)).collect(), vec![]);
        for id in &ids[..9] {
            success(&f.store, id, 1);
        }
        failure(&f.store, &ids[9], 1);

        let health = f.engine.compute_health_score_at(now());
        let error_rate = health.dimension("error_rate").unwrap();
        assert_eq!(error_rate.score, 70.0);
        assert!(error_rate.score <= 80.0);
    }

    #[test]
    fn test_no_data_is_healthy_for_error_rate() {
        let f = fixture(vec![daily("a", false)], vec![]);
        f.store
            .insert_run(&RunRecord::no_data("a", hours_before(2), hours_before(2)))
            .unwrap();
        f.store
            .insert_run(&RunRecord::no_data("a", hours_before(1), hours_before(1)))
            .unwrap();
        let health = f.engine.compute_health_score_at(now());
        assert_eq!(health.dimension("error_rate").unwrap().score, 100.0);
    }

    #[test]
    fn test_breaker_dimension() {
        let f = fixture(vec![], vec![]);
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: StdDuration::from_secs(3600),
        };
        for name in ["a", "b", "c", "d", "e"] {
            f.breakers.get_or_create(name, config);
        }
        for name in ["a", "b", "c"] {
            let r: Result<(), BreakerError<&str>> =
                f.breakers.get(name).unwrap().call(|| Err("down"));
            assert!(r.is_err());
        }
        let health = f.engine.compute_health_score_at(now());
        assert_eq!(health.dimension("circuit_breaker_health").unwrap().score, 40.0);
        assert!(health.incidents.iter().any(|i| i.is_cascade));
    }

    #[test]
    fn test_coverage_counts_missing_tables_inactive() {
        let f = fixture(
            vec![],
            vec![
                TrackedTable {
                    table: "bills".into(),
                    recency_column: "updated_at".into(),
                },
                TrackedTable {
                    table: "missing".into(),
                    recency_column: "updated_at".into(),
                },
            ],
        );
        f.store
            .with_connection(|conn| {
                conn.execute(
                    "CREATE TABLE bills (updated_at TEXT)",
                    [],
                )?;
                conn.execute(
                    "INSERT INTO bills VALUES (?1)",
                    [crate::timestamps::format_timestamp(&hours_before(3))],
                )?;
                Ok(())
            })
            .unwrap();

        let health = f.engine.compute_health_score_at(now());
        let coverage = health.dimension("data_coverage").unwrap();
        assert_eq!(coverage.score, 50.0);
        assert!(coverage.detail.contains("missing"));
    }

    #[test]
    fn test_invalid_tracked_table_degrades_to_unknown() {
        let f = fixture(
            vec![],
            vec![TrackedTable {
                table: "bad name".into(),
                recency_column: "x".into(),
            }],
        );
        let health = f.engine.compute_health_score_at(now());
        let coverage = health.dimension("data_coverage").unwrap();
        assert_eq!(coverage.score, 100.0);
        assert!(coverage.detail.starts_with("unknown"));
    }

    #[test]
    fn test_score_is_idempotent() {
        let f = fixture(vec![daily("a", false), daily("b", true)], vec![]);
        success(&f.store, "a", 10);
        failure(&f.store, "b", 1);
        let first = f.engine.compute_health_score_at(now());
        let second = f.engine.compute_health_score_at(now());
        assert_eq!(first, second);
    }

    #[test]
    fn test_unreachable_store_yields_neutral_dimensions() {
        let engine = HealthScoreEngine::new(
            Arc::new(UnreachableStore),
            Arc::new(ExpectationSet::new(vec![daily("a", false)]).unwrap()),
            Arc::new(BreakerRegistry::new()),
            CorrelationSettings::default(),
            vec![TrackedTable {
                table: "bills".into(),
                recency_column: "updated_at".into(),
            }],
        );
        let health = engine.compute_health_score_at(now());

        assert_eq!(health.dimensions.len(), 4);
        for name in ["source_freshness", "error_rate", "data_coverage"] {
            let dimension = health.dimension(name).unwrap();
            assert_eq!(dimension.score, 100.0, "{}", name);
            assert!(dimension.detail.starts_with("unknown"), "{}", dimension.detail);
        }
        assert_eq!(health.dimension("circuit_breaker_health").unwrap().score, 100.0);
        assert_eq!(health.score, 100.0);
        assert!(health.incidents.is_empty());
    }
}
