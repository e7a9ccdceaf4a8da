use crate::circuit_breaker::BreakerSnapshot;
use crate::correlator::{CorrelatedIncident, IncidentType};
use crate::health_score::AggregateHealth;
use crate::health_store::Severity;
use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{CounterVec, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};

/// Metric name prefix for all pipeline sentinel metrics
const PREFIX: &str = "pipeline_sentinel";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref HEALTH_SCORE: Gauge = Gauge::new(
        format!("{PREFIX}_health_score"),
        "Aggregate pipeline health score (0-100)"
    ).expect("Failed to create health_score metric");

    pub static ref HEALTH_DIMENSION_SCORE: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_health_dimension_score"), "Score of one health dimension (0-100)"),
        &["dimension"]
    ).expect("Failed to create health_dimension_score metric");

    pub static ref BREAKER_STATE: GaugeVec = GaugeVec::new(
        Opts::new(
            format!("{PREFIX}_breaker_state"),
            "Circuit breaker state (0 = closed, 1 = half-open, 2 = open)"
        ),
        &["name"]
    ).expect("Failed to create breaker_state metric");

    pub static ref STALENESS_ALERTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_staleness_alerts_total"), "Persisted staleness alerts"),
        &["severity"]
    ).expect("Failed to create staleness_alerts_total metric");

    pub static ref PRECONDITION_FAILURES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_precondition_failures_total"), "Jobs aborted before running"),
        &["reason"]
    ).expect("Failed to create precondition_failures_total metric");

    pub static ref CANARY_FAILURES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_canary_failures_total"), "Failed canary assertions"),
        &["source_id", "severity"]
    ).expect("Failed to create canary_failures_total metric");

    pub static ref ACTIVE_INCIDENTS: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_active_incidents"), "Correlated incidents seen by the last sweep"),
        &["incident_type"]
    ).expect("Failed to create active_incidents metric");
}

/// Register all metrics with the Prometheus registry
pub fn init_metrics() {
    // Ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(HEALTH_SCORE.clone()));
    let _ = REGISTRY.register(Box::new(HEALTH_DIMENSION_SCORE.clone()));
    let _ = REGISTRY.register(Box::new(BREAKER_STATE.clone()));
    let _ = REGISTRY.register(Box::new(STALENESS_ALERTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(PRECONDITION_FAILURES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CANARY_FAILURES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(ACTIVE_INCIDENTS.clone()));

    tracing::info!("Metrics system initialized successfully");
}

pub fn record_staleness_alert(severity: Severity) {
    STALENESS_ALERTS_TOTAL
        .with_label_values(&[severity.as_str()])
        .inc();
}

pub fn record_precondition_failure(reason: &str) {
    PRECONDITION_FAILURES_TOTAL
        .with_label_values(&[reason])
        .inc();
}

pub fn record_canary_failure(source_id: &str, severity: Severity) {
    CANARY_FAILURES_TOTAL
        .with_label_values(&[source_id, severity.as_str()])
        .inc();
}

pub fn publish_health(health: &AggregateHealth) {
    HEALTH_SCORE.set(health.score);
    for dimension in &health.dimensions {
        HEALTH_DIMENSION_SCORE
            .with_label_values(&[dimension.name])
            .set(dimension.score);
    }
}

pub fn publish_breakers(snapshots: &[BreakerSnapshot]) {
    for snapshot in snapshots {
        BREAKER_STATE
            .with_label_values(&[snapshot.name.as_str()])
            .set(snapshot.state.as_gauge());
    }
}

pub fn publish_incidents(incidents: &[CorrelatedIncident]) {
    for incident_type in [
        IncidentType::Isolated,
        IncidentType::SourceCluster,
        IncidentType::Infrastructure,
    ] {
        let count = incidents
            .iter()
            .filter(|i| i.incident_type == incident_type)
            .count();
        ACTIVE_INCIDENTS
            .with_label_values(&[incident_type.as_str()])
            .set(count as f64);
    }
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_default();
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}
