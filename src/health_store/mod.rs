mod models;
mod schema;
mod sqlite_health_store;

pub use models::*;
pub use schema::HEALTH_VERSIONED_SCHEMAS;
pub use sqlite_health_store::SqliteHealthStore;

use anyhow::Result;
use chrono::{DateTime, Utc};

/// The narrow query/command interface the health engine needs from storage.
///
/// Implementations must not cache: every call reflects the store as it is
/// right now.
pub trait HealthStore: Send + Sync {
    /// Trivial liveness query.
    fn ping(&self) -> Result<()>;

    // Source runs
    fn insert_run(&self, run: &RunRecord) -> Result<i64>;
    fn get_run(&self, id: i64) -> Result<Option<RunRecord>>;
    /// `ended_at` of the most recent `SUCCESS` run matching `filter`.
    fn last_success_at(&self, filter: &SourceFilter) -> Result<Option<DateTime<Utc>>>;
    /// Most recent runs matching `filter`, newest first.
    fn recent_runs(&self, filter: &SourceFilter, limit: usize) -> Result<Vec<RunRecord>>;
    /// Runs matching `filter` that ended at or after `since`, grouped by status.
    fn run_counts(&self, filter: &SourceFilter, since: DateTime<Utc>) -> Result<RunCounts>;
    /// All `ERROR` runs that ended inside `[start, end]`, newest first.
    fn error_runs_between(&self, start: DateTime<Utc>, end: DateTime<Utc>)
        -> Result<Vec<RunRecord>>;

    // Staleness alerts (append-only)
    fn insert_staleness_alert(&self, alert: &StalenessAlert) -> Result<i64>;
    fn list_staleness_alerts(
        &self,
        source_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StalenessAlert>>;

    // Output table inspection
    fn table_exists(&self, table: &str) -> Result<bool>;
    /// Largest value of `column` in `table`, parsed as a timestamp. `None` when
    /// the table does not exist, is empty, or the value is unparseable.
    fn latest_activity(&self, table: &str, column: &str) -> Result<Option<DateTime<Utc>>>;
    /// Values of `key_column` that occur more than once, with their counts.
    fn duplicate_keys(&self, table: &str, key_column: &str, limit: usize)
        -> Result<Vec<(String, i64)>>;
    /// The last `limit` inserted values of `column`, oldest first. Unparseable
    /// values are `None`.
    fn recent_timestamps(
        &self,
        table: &str,
        column: &str,
        limit: usize,
    ) -> Result<Vec<Option<DateTime<Utc>>>>;
}
