use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Runs
// =============================================================================

/// Terminal outcome of one ingestion job execution.
///
/// `NoData` means the source was checked and had nothing new. It is a normal
/// outcome and never counts as a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Success,
    NoData,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "SUCCESS",
            RunStatus::NoData => "NO_DATA",
            RunStatus::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUCCESS" => Some(RunStatus::Success),
            "NO_DATA" => Some(RunStatus::NoData),
            "ERROR" => Some(RunStatus::Error),
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, RunStatus::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub status: RunStatus,
    pub records_fetched: u64,
    pub errors: Vec<String>,
}

impl RunRecord {
    pub fn success(
        source_id: impl Into<String>,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        records_fetched: u64,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            started_at,
            ended_at,
            status: RunStatus::Success,
            records_fetched,
            errors: Vec::new(),
        }
    }

    pub fn no_data(
        source_id: impl Into<String>,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            started_at,
            ended_at,
            status: RunStatus::NoData,
            records_fetched: 0,
            errors: Vec::new(),
        }
    }

    pub fn error(
        source_id: impl Into<String>,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        errors: Vec<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            started_at,
            ended_at,
            status: RunStatus::Error,
            records_fetched: 0,
            errors,
        }
    }

    /// Checks the invariants every persisted run must satisfy.
    pub fn validate(&self) -> Result<()> {
        if self.source_id.trim().is_empty() {
            bail!("Run record has an empty source_id");
        }
        if self.ended_at < self.started_at {
            bail!(
                "Run record for {} ends ({}) before it starts ({})",
                self.source_id,
                self.ended_at,
                self.started_at
            );
        }
        if self.status == RunStatus::Error && self.errors.is_empty() {
            bail!(
                "Run record for {} has status ERROR but no error messages",
                self.source_id
            );
        }
        if i64::try_from(self.records_fetched).is_err() {
            bail!(
                "Run record for {} has records_fetched {} beyond the storable range",
                self.source_id,
                self.records_fetched
            );
        }
        Ok(())
    }
}

/// Run totals for one source (or group of sources) inside a time window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    pub success: u64,
    pub no_data: u64,
    pub error: u64,
}

impl RunCounts {
    pub fn total(&self) -> u64 {
        self.success + self.no_data + self.error
    }

    /// Share of `ERROR` runs among all runs, `0.0` when there were none.
    pub fn failure_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.error as f64 / total as f64,
        }
    }
}

impl std::ops::AddAssign for RunCounts {
    fn add_assign(&mut self, other: Self) {
        self.success += other.success;
        self.no_data += other.no_data;
        self.error += other.error;
    }
}

/// Selects the `source_runs` rows that belong to one logical source.
///
/// Holds SQL `LIKE` patterns (escape character `\`). Build it with
/// [`SourceFilter::exact`] or from a configured expectation, never from
/// free-form substrings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFilter {
    like_patterns: Vec<String>,
}

impl SourceFilter {
    pub fn exact(source_id: &str) -> Self {
        Self {
            like_patterns: vec![escape_like(source_id)],
        }
    }

    pub fn from_like_patterns(like_patterns: Vec<String>) -> Self {
        Self { like_patterns }
    }

    pub fn like_patterns(&self) -> &[String] {
        &self.like_patterns
    }
}

/// Escapes `%`, `_` and `\` so `s` matches itself literally under
/// `LIKE ... ESCAPE '\'`.
pub fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

// =============================================================================
// Severity and staleness alerts
// =============================================================================

/// Ordered so that `max()` picks the most severe value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Alert,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Alert => "alert",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "warning" => Some(Severity::Warning),
            "alert" => Some(Severity::Alert),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub const ALERT_TYPE_MISSING: &str = "missing";

/// "Source X is currently stale", as observed at `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StalenessAlert {
    pub source_id: String,
    pub alert_type: String,
    pub last_success_at: Option<DateTime<Utc>>,
    /// `None` when unknown (no success ever) or not yet past tolerance.
    pub hours_overdue: Option<f64>,
    pub consecutive_failures: u32,
    pub severity: Severity,
    pub created_at: DateTime<Utc>,
}
