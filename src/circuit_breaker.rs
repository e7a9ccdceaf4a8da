//! Per-resource circuit breakers.
//!
//! A breaker guards calls to one external dependency. After
//! `failure_threshold` consecutive failures it opens and rejects calls
//! without running them. Once `reset_timeout` has elapsed the next call is
//! admitted as a trial call: success closes the breaker, failure re-opens it.
//!
//! Breakers never retry and never report their trips anywhere. Discovery of
//! open breakers is pull-based through [`BreakerRegistry::snapshots`].

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        }
    }

    /// Value exported on the `breaker_state` gauge.
    pub fn as_gauge(&self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::HalfOpen => 1.0,
            BreakerState::Open => 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// Time an open breaker waits before admitting a trial call.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The breaker is open; the wrapped call was not made.
    #[error("circuit breaker '{name}' is open")]
    Open { name: String },
    #[error(transparent)]
    Call(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub failure_threshold: u32,
    pub reset_timeout_secs: f64,
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                opened_at_wall: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    // A panic while holding the lock cannot leave `Inner` half-updated, so a
    // poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn timeout_elapsed(&self, inner: &Inner) -> bool {
        inner
            .opened_at
            .map(|at| at.elapsed() >= self.config.reset_timeout)
            .unwrap_or(true)
    }

    /// Effective state. An open breaker whose reset timeout has elapsed
    /// reports `HalfOpen`, since the next call would be admitted.
    pub fn state(&self) -> BreakerState {
        let inner = self.lock();
        match inner.state {
            BreakerState::Open if self.timeout_elapsed(&inner) => BreakerState::HalfOpen,
            state => state,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == BreakerState::Open
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        let state = match inner.state {
            BreakerState::Open if self.timeout_elapsed(&inner) => BreakerState::HalfOpen,
            state => state,
        };
        BreakerSnapshot {
            name: self.name.clone(),
            state,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at_wall,
            failure_threshold: self.config.failure_threshold,
            reset_timeout_secs: self.config.reset_timeout.as_secs_f64(),
        }
    }

    /// Decides whether a call may proceed, performing the OPEN -> HALF_OPEN
    /// transition when the reset timeout has elapsed.
    fn try_admit(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                if self.timeout_elapsed(&inner) {
                    debug!("Circuit breaker '{}' admitting trial call", self.name);
                    inner.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        match inner.state {
            BreakerState::HalfOpen => {
                info!("Circuit breaker '{}' recovered, closing", self.name);
                inner.state = BreakerState::Closed;
                inner.opened_at = None;
                inner.opened_at_wall = None;
            }
            BreakerState::Closed => {}
            // A call admitted before the trip finished late; only a call
            // admitted after the reset timeout may close the breaker.
            BreakerState::Open => {
                debug!(
                    "Circuit breaker '{}' ignoring late success while open",
                    self.name
                );
            }
        }
    }

    fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let trip = match inner.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            BreakerState::Open => false,
        };
        if trip {
            warn!(
                "Circuit breaker '{}' opened after {} consecutive failures",
                self.name, inner.consecutive_failures
            );
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            inner.opened_at_wall = Some(Utc::now());
        }
    }

    /// Runs `f` if the breaker admits it and records the outcome.
    ///
    /// The lock is not held while `f` runs, so a slow call never blocks
    /// callers of other breakers or state queries on this one.
    pub fn call<T, E, F>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        if !self.try_admit() {
            return Err(BreakerError::Open {
                name: self.name.clone(),
            });
        }
        match f() {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(BreakerError::Call(e))
            }
        }
    }
}

/// Named breakers, one instance per name.
///
/// Construct one per process (or per test) and pass it where needed;
/// [`default_registry`] exists for callers that want a shared instance.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the breaker for `name`, creating it with `config` if needed.
    /// The configuration of the first call wins.
    pub fn get_or_create(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.get(name) {
            return breaker;
        }
        let mut breakers = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// A detached copy of the registry contents, ordered by name.
    pub fn all(&self) -> BTreeMap<String, Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.clone()))
            .collect()
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.all().values().map(|b| b.snapshot()).collect()
    }

    pub fn len(&self) -> usize {
        self.breakers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

lazy_static! {
    static ref DEFAULT_REGISTRY: Arc<BreakerRegistry> = Arc::new(BreakerRegistry::new());
}

/// The process-wide registry.
pub fn default_registry() -> Arc<BreakerRegistry> {
    DEFAULT_REGISTRY.clone()
}
