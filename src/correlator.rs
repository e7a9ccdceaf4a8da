//! Classifies the shape of current failures: one flaky source, a handful of
//! sources, or the whole pipeline.

use crate::circuit_breaker::{BreakerRegistry, BreakerState};
use crate::health_store::HealthStore;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentType {
    Isolated,
    SourceCluster,
    Infrastructure,
}

impl IncidentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentType::Isolated => "isolated",
            IncidentType::SourceCluster => "source_cluster",
            IncidentType::Infrastructure => "infrastructure",
        }
    }
}

/// A computed view over recent run history or breaker state. Never
/// persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrelatedIncident {
    pub incident_type: IncidentType,
    /// Sorted, unique.
    pub affected_sources: Vec<String>,
    pub error_count: usize,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub message: String,
    pub is_cascade: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelationSettings {
    /// Window used by [`FailureCorrelator::get_current_incident`].
    pub current_window_minutes: i64,
    pub min_sources: usize,
    pub min_open_breakers: usize,
}

impl Default for CorrelationSettings {
    fn default() -> Self {
        Self {
            current_window_minutes: 30,
            min_sources: 3,
            min_open_breakers: 3,
        }
    }
}

/// Start of a window of `minutes` ending at `now`. Windows reaching past the
/// representable range start at the unix epoch instead.
fn window_start(now: DateTime<Utc>, minutes: i64) -> DateTime<Utc> {
    TimeDelta::try_minutes(minutes)
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or_else(|| {
            warn!("Correlation window of {} minutes is out of range, clamping", minutes);
            DateTime::<Utc>::default()
        })
}

pub struct FailureCorrelator {
    store: Arc<dyn HealthStore>,
    breakers: Arc<BreakerRegistry>,
    settings: CorrelationSettings,
}

impl FailureCorrelator {
    pub fn new(
        store: Arc<dyn HealthStore>,
        breakers: Arc<BreakerRegistry>,
        settings: CorrelationSettings,
    ) -> Self {
        Self {
            store,
            breakers,
            settings,
        }
    }

    pub fn settings(&self) -> &CorrelationSettings {
        &self.settings
    }

    /// Groups `ERROR` runs that ended in the last `window_minutes` by source.
    /// `None` when no source failed or the history could not be read.
    pub fn detect_correlated_failures(
        &self,
        window_minutes: i64,
        min_sources: usize,
    ) -> Option<CorrelatedIncident> {
        self.detect_correlated_failures_at(window_minutes, min_sources, Utc::now())
    }

    pub fn detect_correlated_failures_at(
        &self,
        window_minutes: i64,
        min_sources: usize,
        now: DateTime<Utc>,
    ) -> Option<CorrelatedIncident> {
        let window_start = window_start(now, window_minutes);
        let runs = match self.store.error_runs_between(window_start, now) {
            Ok(runs) => runs,
            Err(e) => {
                error!("Failed to read error runs for correlation: {:#}", e);
                return None;
            }
        };
        if runs.is_empty() {
            return None;
        }

        let sources: BTreeSet<&str> = runs.iter().map(|r| r.source_id.as_str()).collect();
        let n = sources.len();
        let incident_type = if n >= min_sources {
            IncidentType::Infrastructure
        } else if n == 1 {
            IncidentType::Isolated
        } else {
            IncidentType::SourceCluster
        };
        let message = match incident_type {
            IncidentType::Infrastructure => format!(
                "{} sources failed within {} minutes; likely shared infrastructure",
                n, window_minutes
            ),
            IncidentType::SourceCluster => format!(
                "{} sources failed within {} minutes",
                n, window_minutes
            ),
            IncidentType::Isolated => format!(
                "only {} failed within {} minutes ({} errors)",
                runs[0].source_id,
                window_minutes,
                runs.len()
            ),
        };

        Some(CorrelatedIncident {
            incident_type,
            affected_sources: sources.into_iter().map(String::from).collect(),
            error_count: runs.len(),
            window_start,
            window_end: now,
            message,
            is_cascade: false,
        })
    }

    /// Infrastructure incident when at least `min_open` breakers are open.
    pub fn detect_circuit_breaker_cascade(&self, min_open: usize) -> Option<CorrelatedIncident> {
        self.detect_circuit_breaker_cascade_at(min_open, Utc::now())
    }

    pub fn detect_circuit_breaker_cascade_at(
        &self,
        min_open: usize,
        now: DateTime<Utc>,
    ) -> Option<CorrelatedIncident> {
        let open: Vec<_> = self
            .breakers
            .snapshots()
            .into_iter()
            .filter(|s| s.state == BreakerState::Open)
            .collect();
        if open.is_empty() || open.len() < min_open {
            return None;
        }

        let window_start = open
            .iter()
            .filter_map(|s| s.opened_at)
            .min()
            .unwrap_or(now);
        Some(CorrelatedIncident {
            incident_type: IncidentType::Infrastructure,
            affected_sources: open.iter().map(|s| s.name.clone()).collect(),
            error_count: open.iter().map(|s| s.consecutive_failures as usize).sum(),
            window_start,
            window_end: now,
            message: format!(
                "{} circuit breakers are open; calls are being rejected",
                open.len()
            ),
            is_cascade: true,
        })
    }

    /// The most actionable incident right now. A breaker cascade takes
    /// precedence over recent errors.
    pub fn get_current_incident(&self) -> Option<CorrelatedIncident> {
        self.get_current_incident_at(Utc::now())
    }

    pub fn get_current_incident_at(&self, now: DateTime<Utc>) -> Option<CorrelatedIncident> {
        self.detect_circuit_breaker_cascade_at(self.settings.min_open_breakers, now)
            .or_else(|| {
                self.detect_correlated_failures_at(
                    self.settings.current_window_minutes,
                    self.settings.min_sources,
                    now,
                )
            })
    }

    /// Failures over the last `hours` plus the current cascade, if any. The
    /// two may describe the same outage.
    pub fn get_recent_incidents(&self, hours: i64) -> Vec<CorrelatedIncident> {
        self.get_recent_incidents_at(hours, Utc::now())
    }

    pub fn get_recent_incidents_at(&self, hours: i64, now: DateTime<Utc>) -> Vec<CorrelatedIncident> {
        let window_minutes = hours.saturating_mul(60);
        self.detect_correlated_failures_at(window_minutes, self.settings.min_sources, now)
            .into_iter()
            .chain(self.detect_circuit_breaker_cascade_at(self.settings.min_open_breakers, now))
            .collect()
    }
}
