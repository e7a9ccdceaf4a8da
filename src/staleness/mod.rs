//! Staleness monitor: compares each source's run history against its
//! expectation and turns the gap into a severity.

mod rules;

pub use rules::{fired_rules, resolve_severity, resolve_with, RuleInput, SeverityRule, SEVERITY_RULES};

use crate::expectations::{ExpectationSet, SourceExpectation};
use crate::health_store::{
    HealthStore, RunCounts, Severity, SourceFilter, StalenessAlert, ALERT_TYPE_MISSING,
};
use crate::metrics;
use anyhow::Result;
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Runs inspected when counting a failure streak. Anything past the
/// critical streak length is irrelevant to severity.
const STREAK_LOOKBACK: usize = 50;

/// Failure-rate window used for escalation and error-rate scoring.
pub const FAILURE_RATE_WINDOW_HOURS: i64 = 24;

/// A 24h failure rate above this forces an alert to critical.
pub const FAILURE_RATE_ESCALATION: f64 = 0.5;

pub(crate) fn hours_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    (later - earlier).num_milliseconds() as f64 / 3_600_000.0
}

pub struct StalenessMonitor {
    store: Arc<dyn HealthStore>,
    expectations: Arc<ExpectationSet>,
}

impl StalenessMonitor {
    pub fn new(store: Arc<dyn HealthStore>, expectations: Arc<ExpectationSet>) -> Self {
        Self {
            store,
            expectations,
        }
    }

    pub fn expectations(&self) -> &ExpectationSet {
        &self.expectations
    }

    /// Number of `ERROR` runs since the most recent `SUCCESS` or `NO_DATA`.
    pub fn consecutive_failures(&self, filter: &SourceFilter) -> Result<u32> {
        let runs = self.store.recent_runs(filter, STREAK_LOOKBACK)?;
        Ok(runs
            .iter()
            .take_while(|run| run.status.is_failure())
            .count() as u32)
    }

    /// Run totals for `filter` over the last `window_hours`.
    pub fn run_counts_at(
        &self,
        filter: &SourceFilter,
        window_hours: i64,
        now: DateTime<Utc>,
    ) -> Result<RunCounts> {
        let since = TimeDelta::try_hours(window_hours)
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or_default();
        self.store.run_counts(filter, since)
    }

    /// Share of `ERROR` runs for `source_id` in the last `window_hours`.
    /// `NO_DATA` runs count toward the total only.
    ///
    /// A configured source is resolved through its run id patterns; any other
    /// id matches itself exactly.
    pub fn get_failure_rate(&self, source_id: &str, window_hours: i64) -> Result<f64> {
        self.failure_rate_at(source_id, window_hours, Utc::now())
    }

    pub fn failure_rate_at(
        &self,
        source_id: &str,
        window_hours: i64,
        now: DateTime<Utc>,
    ) -> Result<f64> {
        let filter = match self.expectations.get(source_id) {
            Some(expectation) => expectation.source_filter(),
            None => SourceFilter::exact(source_id),
        };
        Ok(self.run_counts_at(&filter, window_hours, now)?.failure_rate())
    }

    fn evaluate_at(
        &self,
        expectation: &SourceExpectation,
        now: DateTime<Utc>,
    ) -> Result<Option<StalenessAlert>> {
        let filter = expectation.source_filter();
        let last_success_at = self.store.last_success_at(&filter)?;
        let consecutive_failures = self.consecutive_failures(&filter)?;

        let raw_overdue = last_success_at
            .map(|last| hours_between(last, now) - expectation.tolerance_hours);
        let input = RuleInput {
            hours_overdue: raw_overdue,
            alert_after_hours: expectation.alert_after_hours,
            is_critical: expectation.is_critical,
            consecutive_failures,
        };

        let Some(severity) = resolve_severity(&input) else {
            return Ok(None);
        };
        debug!(
            "{} is stale ({}), rules fired: {:?}",
            expectation.source_id,
            severity,
            fired_rules(&input)
        );

        Ok(Some(StalenessAlert {
            source_id: expectation.source_id.clone(),
            alert_type: ALERT_TYPE_MISSING.to_string(),
            last_success_at,
            hours_overdue: raw_overdue.filter(|h| *h > 0.0),
            consecutive_failures,
            severity,
            created_at: now,
        }))
    }

    /// Classifies one source. `None` means healthy.
    ///
    /// A store failure while evaluating yields a critical alert: not being
    /// able to tell is treated like the worst case.
    pub fn check_source_at(
        &self,
        expectation: &SourceExpectation,
        now: DateTime<Utc>,
    ) -> Option<StalenessAlert> {
        let mut alert = match self.evaluate_at(expectation, now) {
            Ok(alert) => alert?,
            Err(e) => {
                error!(
                    "Failed to evaluate staleness of {}: {:#}",
                    expectation.source_id, e
                );
                return Some(StalenessAlert {
                    source_id: expectation.source_id.clone(),
                    alert_type: ALERT_TYPE_MISSING.to_string(),
                    last_success_at: None,
                    hours_overdue: None,
                    consecutive_failures: 0,
                    severity: Severity::Critical,
                    created_at: now,
                });
            }
        };

        if alert.severity < Severity::Critical {
            match self.run_counts_at(&expectation.source_filter(), FAILURE_RATE_WINDOW_HOURS, now)
            {
                Ok(counts) if counts.failure_rate() > FAILURE_RATE_ESCALATION => {
                    debug!(
                        "{} failure rate {:.2} escalates {} to critical",
                        expectation.source_id,
                        counts.failure_rate(),
                        alert.severity
                    );
                    alert.severity = Severity::Critical;
                }
                Ok(_) => {}
                Err(e) => error!(
                    "Failed to compute failure rate of {}: {:#}",
                    expectation.source_id, e
                ),
            }
        }
        Some(alert)
    }

    /// Appends `alert` to the alert log. Failures are logged, not returned.
    pub fn persist(&self, alert: &StalenessAlert) {
        match self.store.insert_staleness_alert(alert) {
            Ok(_) => {
                info!(
                    "Staleness alert for {}: {} (overdue {:?}h, {} consecutive failures)",
                    alert.source_id, alert.severity, alert.hours_overdue, alert.consecutive_failures
                );
                metrics::record_staleness_alert(alert.severity);
            }
            Err(e) => error!(
                "Failed to persist staleness alert for {}: {:#}",
                alert.source_id, e
            ),
        }
    }

    /// Evaluates every configured source, optionally persisting the alerts.
    pub fn check_all_sources(&self, persist: bool) -> Vec<StalenessAlert> {
        self.check_all_sources_at(persist, Utc::now())
    }

    pub fn check_all_sources_at(&self, persist: bool, now: DateTime<Utc>) -> Vec<StalenessAlert> {
        let alerts: Vec<StalenessAlert> = self
            .expectations
            .iter()
            .filter_map(|expectation| self.check_source_at(expectation, now))
            .collect();
        if persist {
            for alert in &alerts {
                self.persist(alert);
            }
        }
        alerts
    }

    /// Re-checks every expectation whose run id patterns match
    /// `run_source_id` and persists any alert right away.
    pub fn check_matching_at(&self, run_source_id: &str, now: DateTime<Utc>) -> Vec<StalenessAlert> {
        let alerts: Vec<StalenessAlert> = self
            .expectations
            .matching(run_source_id)
            .filter_map(|expectation| self.check_source_at(expectation, now))
            .collect();
        for alert in &alerts {
            self.persist(alert);
        }
        alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expectations::Frequency;
    use crate::health_store::testing::UnreachableStore;
    use crate::health_store::{RunRecord, SqliteHealthStore};
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, 12, 0, 0).unwrap()
    }

    fn hours_before(h: f64) -> DateTime<Utc> {
        now() - Duration::milliseconds((h * 3_600_000.0) as i64)
    }

    fn monitor_for(
        expectations: Vec<SourceExpectation>,
    ) -> (Arc<SqliteHealthStore>, StalenessMonitor) {
        let store = Arc::new(SqliteHealthStore::in_memory().unwrap());
        let monitor = StalenessMonitor::new(
            store.clone(),
            Arc::new(ExpectationSet::new(expectations).unwrap()),
        );
        (store, monitor)
    }

    fn fr_delta(is_critical: bool) -> SourceExpectation {
        SourceExpectation::new("fr_delta", Frequency::Daily, 6.0, 24.0, is_critical).unwrap()
    }

    fn insert(store: &SqliteHealthStore, run: RunRecord) {
        store.insert_run(&run).unwrap();
    }

    fn error_run(source: &str, h: f64) -> RunRecord {
        RunRecord::error(source, hours_before(h), hours_before(h), vec!["HTTP 500".into()])
    }

    #[test]
    fn test_no_runs_is_critical_with_unknown_overdue() {
        let (_store, monitor) = monitor_for(vec![fr_delta(false)]);
        let alert = monitor.check_source_at(&fr_delta(false), now()).unwrap();
        assert_eq!(alert.severity, Severity::Critical);
        assert!(alert.hours_overdue.is_none());
        assert!(alert.last_success_at.is_none());
        assert_eq!(alert.alert_type, "missing");
    }

    #[test]
    fn test_store_failure_is_critical() {
        let monitor = StalenessMonitor::new(
            Arc::new(UnreachableStore),
            Arc::new(ExpectationSet::new(vec![fr_delta(false)]).unwrap()),
        );
        let alert = monitor.check_source_at(&fr_delta(false), now()).unwrap();
        assert_eq!(alert.severity, Severity::Critical);
        assert!(alert.hours_overdue.is_none());

        // Persisting fails too, but is only logged.
        let alerts = monitor.check_all_sources_at(true, now());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Critical);
    }

    #[test]
    fn test_fresh_source_is_healthy() {
        let (store, monitor) = monitor_for(vec![fr_delta(false)]);
        insert(&store, RunRecord::success("fr_delta", hours_before(2.5), hours_before(2.0), 3));
        assert!(monitor.check_source_at(&fr_delta(false), now()).is_none());
    }

    #[test]
    fn test_overdue_within_alert_threshold_is_warning() {
        let (store, monitor) = monitor_for(vec![fr_delta(false)]);
        insert(&store, RunRecord::success("fr_delta", hours_before(10.0), hours_before(10.0), 3));
        let alert = monitor.check_source_at(&fr_delta(false), now()).unwrap();
        assert_eq!(alert.severity, Severity::Warning);
        assert!((alert.hours_overdue.unwrap() - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_sub_source_runs_count() {
        let (store, monitor) = monitor_for(vec![fr_delta(false)]);
        insert(
            &store,
            RunRecord::success("fr_delta_title38", hours_before(1.0), hours_before(1.0), 3),
        );
        insert(&store, RunRecord::success("old_fr_delta", hours_before(1.0), hours_before(1.0), 3));
        assert!(monitor.check_source_at(&fr_delta(false), now()).is_none());

        let (store, monitor) = monitor_for(vec![fr_delta(false)]);
        insert(&store, RunRecord::success("old_fr_delta", hours_before(1.0), hours_before(1.0), 3));
        assert!(monitor.check_source_at(&fr_delta(false), now()).is_some());
    }

    #[test]
    fn test_no_data_breaks_failure_streak() {
        let (store, monitor) = monitor_for(vec![fr_delta(false)]);
        insert(&store, error_run("fr_delta", 5.0));
        insert(&store, error_run("fr_delta", 4.0));
        insert(&store, error_run("fr_delta", 3.0));
        insert(&store, RunRecord::no_data("fr_delta", hours_before(2.0), hours_before(2.0)));
        insert(&store, error_run("fr_delta", 1.0));

        let filter = fr_delta(false).source_filter();
        assert_eq!(monitor.consecutive_failures(&filter).unwrap(), 1);
    }

    #[test]
    fn test_failure_streak_escalates_fresh_source() {
        let (store, monitor) = monitor_for(vec![fr_delta(false)]);
        insert(&store, RunRecord::success("fr_delta", hours_before(50.0), hours_before(5.0), 1));
        for h in [4.0, 3.0, 2.0] {
            insert(&store, error_run("fr_delta", h));
        }
        let alert = monitor.check_source_at(&fr_delta(false), now()).unwrap();
        assert_eq!(alert.consecutive_failures, 3);
        assert!(alert.hours_overdue.is_none());
        // 3 errors out of 4 runs in 24h pushes the alert to critical.
        assert_eq!(alert.severity, Severity::Critical);
    }

    #[test]
    fn test_failure_rate_ignores_no_data() {
        let (store, monitor) = monitor_for(vec![fr_delta(false)]);
        insert(&store, RunRecord::no_data("fr_delta", hours_before(3.0), hours_before(3.0)));
        insert(&store, RunRecord::no_data("fr_delta", hours_before(2.0), hours_before(2.0)));
        insert(&store, RunRecord::success("fr_delta", hours_before(1.5), hours_before(1.5), 1));
        insert(&store, error_run("fr_delta", 1.0));
        insert(&store, error_run("fr_delta", 30.0));

        let rate = monitor.failure_rate_at("fr_delta", 24, now()).unwrap();
        assert!((rate - 0.25).abs() < 1e-9);
        assert_eq!(monitor.failure_rate_at("unconfigured", 24, now()).unwrap(), 0.0);
    }

    #[test]
    fn test_check_all_sources_persists_when_asked() {
        let gao = SourceExpectation::new("gao", Frequency::Weekly, 170.0, 48.0, false).unwrap();
        let (store, monitor) = monitor_for(vec![fr_delta(false), gao]);
        insert(&store, RunRecord::success("gao", hours_before(1.0), hours_before(1.0), 1));

        let alerts = monitor.check_all_sources_at(false, now());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].source_id, "fr_delta");
        assert!(store.list_staleness_alerts(None, 10).unwrap().is_empty());

        monitor.check_all_sources_at(true, now());
        monitor.check_all_sources_at(true, now());
        assert_eq!(store.list_staleness_alerts(None, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_check_matching_only_touches_matching_sources() {
        let gao = SourceExpectation::new("gao", Frequency::Weekly, 170.0, 48.0, false).unwrap();
        let (store, monitor) = monitor_for(vec![fr_delta(false), gao]);

        let alerts = monitor.check_matching_at("fr_delta_title12", now());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].source_id, "fr_delta");
        assert_eq!(
            store.list_staleness_alerts(Some("fr_delta"), 10).unwrap().len(),
            1
        );
        assert!(store.list_staleness_alerts(Some("gao"), 10).unwrap().is_empty());
    }
}
