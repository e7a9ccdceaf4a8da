//! SQLite schema for the health database.
//!
//! `source_runs` is written once per ingestion job; `staleness_alerts` is an
//! append-only log written by the staleness monitor.

use crate::sqlite_column;
use crate::sqlite_persistence::{SqlType, Table, VersionedSchema};

// =============================================================================
// Version 1 - Source runs and staleness alerts
// =============================================================================

const SOURCE_RUNS_TABLE_V1: Table = Table {
    name: "source_runs",
    columns: &[
        sqlite_column!("id", SqlType::Integer, is_primary_key = true),
        sqlite_column!("source_id", SqlType::Text, non_null = true),
        sqlite_column!("started_at", SqlType::Text, non_null = true),
        sqlite_column!("ended_at", SqlType::Text, non_null = true),
        sqlite_column!("status", SqlType::Text, non_null = true),
        sqlite_column!("records_fetched", SqlType::Integer, non_null = true),
        sqlite_column!("errors_json", SqlType::Text, non_null = true),
    ],
    indices: &[
        ("idx_source_runs_source_ended", "source_id, ended_at DESC"),
        ("idx_source_runs_status_ended", "status, ended_at"),
    ],
};

const STALENESS_ALERTS_TABLE_V1: Table = Table {
    name: "staleness_alerts",
    columns: &[
        sqlite_column!("id", SqlType::Integer, is_primary_key = true),
        sqlite_column!("source_id", SqlType::Text, non_null = true),
        sqlite_column!("alert_type", SqlType::Text, non_null = true),
        sqlite_column!("last_success_at", SqlType::Text),
        sqlite_column!("hours_overdue", SqlType::Real),
        sqlite_column!("consecutive_failures", SqlType::Integer, non_null = true),
        sqlite_column!("severity", SqlType::Text, non_null = true),
        sqlite_column!("created_at", SqlType::Text, non_null = true),
    ],
    indices: &[("idx_staleness_alerts_source_created", "source_id, created_at DESC")],
};

pub const HEALTH_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 1,
    tables: &[SOURCE_RUNS_TABLE_V1, STALENESS_ALERTS_TABLE_V1],
    migration: None,
}];

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_latest_schema_creates_and_validates() {
        let conn = Connection::open_in_memory().unwrap();
        let schema = HEALTH_VERSIONED_SCHEMAS.last().unwrap();
        schema.create(&conn).unwrap();
        schema.validate(&conn).unwrap();
    }

    #[test]
    fn test_run_ids_autoincrement() {
        let conn = Connection::open_in_memory().unwrap();
        HEALTH_VERSIONED_SCHEMAS[0].create(&conn).unwrap();
        let sql = "INSERT INTO source_runs
            (source_id, started_at, ended_at, status, records_fetched, errors_json)
            VALUES ('a', 't', 't', 'SUCCESS', 1, '[]')";
        conn.execute(sql, []).unwrap();
        conn.execute(sql, []).unwrap();
        assert_eq!(conn.last_insert_rowid(), 2);
    }
}
