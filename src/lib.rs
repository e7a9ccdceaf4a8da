//! Pipeline Sentinel Library
//!
//! Resilience and health scoring for independently scheduled ingestion jobs:
//! circuit breakers, canary assertions, staleness monitoring, failure
//! correlation and an aggregate health score, wired around each job by the
//! run lifecycle.

pub mod canary;
pub mod circuit_breaker;
pub mod config;
pub mod correlator;
pub mod expectations;
pub mod health_score;
pub mod health_store;
pub mod lifecycle;
pub mod metrics;
pub mod sqlite_persistence;
pub mod staleness;
pub mod sweep;
pub mod timestamps;

// Re-export commonly used types for convenience
pub use circuit_breaker::{default_registry, BreakerRegistry, CircuitBreaker, CircuitBreakerConfig};
pub use health_score::{AggregateHealth, Grade, HealthScoreEngine};
pub use health_store::{HealthStore, RunRecord, RunStatus, Severity, SqliteHealthStore};
pub use lifecycle::{PreconditionError, RunContext, RunLifecycle};
