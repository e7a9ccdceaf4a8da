//! Periodic health sweep used by `watch`.
//!
//! Each sweep re-reads the expectations file, evaluates and persists
//! staleness for every source, computes the aggregate score and publishes
//! everything as metrics.

use crate::circuit_breaker::BreakerRegistry;
use crate::config::AppConfig;
use crate::expectations::ExpectationSet;
use crate::health_score::{AggregateHealth, HealthScoreEngine};
use crate::health_store::{HealthStore, StalenessAlert};
use crate::metrics;
use anyhow::{Context, Result};
use axum::{routing::get, Router};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub alerts: Vec<StalenessAlert>,
    pub health: AggregateHealth,
}

pub struct HealthSweep {
    store: Arc<dyn HealthStore>,
    breakers: Arc<BreakerRegistry>,
    config: AppConfig,
}

impl HealthSweep {
    pub fn new(store: Arc<dyn HealthStore>, breakers: Arc<BreakerRegistry>, config: AppConfig) -> Self {
        Self {
            store,
            breakers,
            config,
        }
    }

    pub fn load_expectations(&self) -> Result<Arc<ExpectationSet>> {
        let expectations = ExpectationSet::load(&self.config.expectations_path)?;
        Ok(Arc::new(expectations))
    }

    pub fn engine(&self, expectations: Arc<ExpectationSet>) -> HealthScoreEngine {
        HealthScoreEngine::new(
            self.store.clone(),
            expectations,
            self.breakers.clone(),
            self.config.correlation,
            self.config.tracked_tables.clone(),
        )
    }

    /// One full sweep. Fails only when the expectations cannot be loaded.
    pub fn run_once(&self) -> Result<SweepReport> {
        let expectations = self
            .load_expectations()
            .context("Expectations reload failed")?;
        let engine = self.engine(expectations);

        let alerts = engine.monitor().check_all_sources(true);
        let health = engine.compute_health_score();

        metrics::publish_health(&health);
        metrics::publish_breakers(&self.breakers.snapshots());
        metrics::publish_incidents(&health.incidents);

        info!(
            "Health sweep: score {} ({:?}), {} stale sources, {} incidents",
            health.score,
            health.grade,
            alerts.len(),
            health.incidents.len()
        );
        for incident in &health.incidents {
            warn!(
                "Incident [{}]: {}",
                incident.incident_type.as_str(),
                incident.message
            );
        }
        Ok(SweepReport { alerts, health })
    }
}

/// Runs sweeps every `interval` until one fails.
pub async fn run_watch(sweep: Arc<HealthSweep>, interval: Duration) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let sweep = sweep.clone();
        tokio::task::spawn_blocking(move || sweep.run_once())
            .await
            .context("Health sweep task panicked")??;
    }
}

pub async fn serve_metrics(port: u16) -> Result<()> {
    let app = Router::new().route("/metrics", get(metrics::metrics_handler));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .with_context(|| format!("Failed to bind metrics port {}", port))?;
    info!("Metrics available at port {}", port);
    Ok(axum::serve(listener, app).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::correlator::CorrelationSettings;
    use crate::health_store::{RunRecord, SqliteHealthStore};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn config(expectations_path: PathBuf) -> AppConfig {
        AppConfig {
            db_path: PathBuf::from(":memory:"),
            expectations_path,
            metrics_port: 0,
            sweep_interval: Duration::from_millis(10),
            approved_sources: vec![],
            circuit_breaker: CircuitBreakerConfig::default(),
            correlation: CorrelationSettings::default(),
            tracked_tables: vec![],
            canaries: vec![],
        }
    }

    const EXPECTATIONS: &str = r#"
        [[sources]]
        source_id = "fr_delta"
        frequency = "daily"
        tolerance_hours = 6
        alert_after_hours = 24

        [[sources]]
        source_id = "congress"
        frequency = "daily"
        tolerance_hours = 6
        alert_after_hours = 24
    "#;

    #[test]
    fn test_run_once_persists_alerts_and_scores() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("expectations.toml");
        std::fs::write(&path, EXPECTATIONS).unwrap();

        let store = Arc::new(SqliteHealthStore::in_memory().unwrap());
        let now = Utc::now();
        store
            .insert_run(&RunRecord::success(
                "congress",
                now - ChronoDuration::hours(1),
                now,
                10,
            ))
            .unwrap();

        let sweep = HealthSweep::new(store.clone(), Arc::new(BreakerRegistry::new()), config(path));
        let report = sweep.run_once().unwrap();

        assert_eq!(report.alerts.len(), 1);
        assert_eq!(report.alerts[0].source_id, "fr_delta");
        assert_eq!(store.list_staleness_alerts(None, 10).unwrap().len(), 1);
        assert_eq!(
            report.health.dimension("source_freshness").unwrap().score,
            50.0
        );
    }

    #[test]
    fn test_invalid_expectations_fail_the_sweep() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("expectations.toml");
        std::fs::write(&path, "sources = []").unwrap();

        let sweep = HealthSweep::new(
            Arc::new(SqliteHealthStore::in_memory().unwrap()),
            Arc::new(BreakerRegistry::new()),
            config(path),
        );
        assert!(sweep.run_once().is_err());
    }

    #[tokio::test]
    async fn test_watch_stops_on_reload_failure() {
        let dir = TempDir::new().unwrap();
        let sweep = Arc::new(HealthSweep::new(
            Arc::new(SqliteHealthStore::in_memory().unwrap()),
            Arc::new(BreakerRegistry::new()),
            config(dir.path().join("missing.toml")),
        ));
        let result = run_watch(sweep, Duration::from_millis(10)).await;
        assert!(result.is_err());
    }
}
