use super::models::{RunCounts, RunRecord, RunStatus, Severity, SourceFilter, StalenessAlert};
use super::schema::HEALTH_VERSIONED_SCHEMAS;
use super::HealthStore;
use crate::sqlite_persistence::{is_valid_identifier, open_versioned};
use crate::timestamps::{format_timestamp, parse_loose, parse_timestamp};
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::info;

const RUN_COLUMNS: &str =
    "id, source_id, started_at, ended_at, status, records_fetched, errors_json";

pub struct SqliteHealthStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteHealthStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        info!("Opening health database at {:?}", path);
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open health database at {:?}", path))?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        // Several ingestion processes may write to the same file.
        conn.busy_timeout(Duration::from_secs(5))?;
        open_versioned(&mut conn, HEALTH_VERSIONED_SCHEMAS, "health")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Health database connection lock is poisoned"))
    }

    /// Runs `f` against the underlying connection.
    ///
    /// Ingestion jobs sharing this database use it to write their output
    /// tables.
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn()?;
        f(&conn)
    }

    fn filter_clause(filter: &SourceFilter, values: &mut Vec<Value>) -> String {
        if filter.like_patterns().is_empty() {
            return "0".to_string();
        }
        let parts = filter
            .like_patterns()
            .iter()
            .map(|pattern| {
                values.push(Value::Text(pattern.clone()));
                format!("source_id LIKE ?{} ESCAPE '\\'", values.len())
            })
            .collect::<Vec<_>>();
        format!("({})", parts.join(" OR "))
    }

    fn table_exists_in(conn: &Connection, table: &str) -> Result<bool> {
        let exists = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1",
                params![table],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        Ok(exists)
    }

    fn check_identifiers(names: &[&str]) -> Result<()> {
        for name in names {
            if !is_valid_identifier(name) {
                bail!("Invalid SQL identifier: {:?}", name);
            }
        }
        Ok(())
    }

    fn column_timestamp(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
        parse_timestamp(s).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                Type::Text,
                format!("invalid timestamp {:?}", s).into(),
            )
        })
    }

    fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<RunRecord> {
        let status_str: String = row.get("status")?;
        // An unrecognised status is treated as a failure rather than hidden.
        let status = RunStatus::parse(&status_str).unwrap_or(RunStatus::Error);

        let started_at: String = row.get("started_at")?;
        let ended_at: String = row.get("ended_at")?;
        let records_fetched: i64 = row.get("records_fetched")?;
        let errors_json: String = row.get("errors_json")?;
        let errors = serde_json::from_str::<Vec<String>>(&errors_json)
            .unwrap_or_else(|_| vec![errors_json.clone()]);

        Ok(RunRecord {
            source_id: row.get("source_id")?,
            started_at: Self::column_timestamp(2, &started_at)?,
            ended_at: Self::column_timestamp(3, &ended_at)?,
            status,
            records_fetched: records_fetched.max(0) as u64,
            errors,
        })
    }

    fn row_to_alert(row: &rusqlite::Row) -> rusqlite::Result<StalenessAlert> {
        let severity_str: String = row.get("severity")?;
        let last_success_at: Option<String> = row.get("last_success_at")?;
        let created_at: String = row.get("created_at")?;
        let consecutive_failures: i64 = row.get("consecutive_failures")?;

        Ok(StalenessAlert {
            source_id: row.get("source_id")?,
            alert_type: row.get("alert_type")?,
            last_success_at: last_success_at.as_deref().and_then(parse_timestamp),
            hours_overdue: row.get("hours_overdue")?,
            consecutive_failures: consecutive_failures.max(0) as u32,
            severity: Severity::parse(&severity_str).unwrap_or(Severity::Critical),
            created_at: Self::column_timestamp(7, &created_at)?,
        })
    }
}

impl HealthStore for SqliteHealthStore {
    fn ping(&self) -> Result<()> {
        let conn = self.conn()?;
        let one: i64 = conn
            .query_row("SELECT 1", [], |row| row.get(0))
            .context("Health database liveness query failed")?;
        if one != 1 {
            bail!("Health database liveness query returned {}", one);
        }
        Ok(())
    }

    fn insert_run(&self, run: &RunRecord) -> Result<i64> {
        run.validate()?;
        let records_fetched = i64::try_from(run.records_fetched)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO source_runs
             (source_id, started_at, ended_at, status, records_fetched, errors_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run.source_id,
                format_timestamp(&run.started_at),
                format_timestamp(&run.ended_at),
                run.status.as_str(),
                records_fetched,
                serde_json::to_string(&run.errors)?,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_run(&self, id: i64) -> Result<Option<RunRecord>> {
        let conn = self.conn()?;
        let run = conn
            .query_row(
                &format!("SELECT {} FROM source_runs WHERE id = ?1", RUN_COLUMNS),
                params![id],
                Self::row_to_run,
            )
            .optional()?;
        Ok(run)
    }

    fn last_success_at(&self, filter: &SourceFilter) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        let mut values = vec![Value::Text(RunStatus::Success.as_str().to_string())];
        let clause = Self::filter_clause(filter, &mut values);
        let latest: Option<String> = conn.query_row(
            &format!(
                "SELECT MAX(ended_at) FROM source_runs WHERE status = ?1 AND {}",
                clause
            ),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;
        Ok(latest.as_deref().and_then(parse_timestamp))
    }

    fn recent_runs(&self, filter: &SourceFilter, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.conn()?;
        let mut values = Vec::new();
        let clause = Self::filter_clause(filter, &mut values);
        values.push(Value::Integer(limit as i64));
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM source_runs WHERE {} ORDER BY ended_at DESC, id DESC LIMIT ?{}",
            RUN_COLUMNS,
            clause,
            values.len()
        ))?;
        let runs = stmt
            .query_map(params_from_iter(values.iter()), Self::row_to_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    fn run_counts(&self, filter: &SourceFilter, since: DateTime<Utc>) -> Result<RunCounts> {
        let conn = self.conn()?;
        let mut values = vec![Value::Text(format_timestamp(&since))];
        let clause = Self::filter_clause(filter, &mut values);
        let mut stmt = conn.prepare(&format!(
            "SELECT status, COUNT(*) FROM source_runs WHERE ended_at >= ?1 AND {} GROUP BY status",
            clause
        ))?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut counts = RunCounts::default();
        for (status, count) in rows {
            let count = count.max(0) as u64;
            match RunStatus::parse(&status).unwrap_or(RunStatus::Error) {
                RunStatus::Success => counts.success += count,
                RunStatus::NoData => counts.no_data += count,
                RunStatus::Error => counts.error += count,
            }
        }
        Ok(counts)
    }

    fn error_runs_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RunRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM source_runs
             WHERE status = ?1 AND ended_at >= ?2 AND ended_at <= ?3
             ORDER BY ended_at DESC, id DESC",
            RUN_COLUMNS
        ))?;
        let runs = stmt
            .query_map(
                params![
                    RunStatus::Error.as_str(),
                    format_timestamp(&start),
                    format_timestamp(&end)
                ],
                Self::row_to_run,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    fn insert_staleness_alert(&self, alert: &StalenessAlert) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO staleness_alerts
             (source_id, alert_type, last_success_at, hours_overdue,
              consecutive_failures, severity, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                alert.source_id,
                alert.alert_type,
                alert.last_success_at.as_ref().map(format_timestamp),
                alert.hours_overdue,
                alert.consecutive_failures as i64,
                alert.severity.as_str(),
                format_timestamp(&alert.created_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn list_staleness_alerts(
        &self,
        source_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StalenessAlert>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, source_id, alert_type, last_success_at, hours_overdue,
                    consecutive_failures, severity, created_at
             FROM staleness_alerts
             WHERE ?1 IS NULL OR source_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2",
        )?;
        let alerts = stmt
            .query_map(params![source_id, limit as i64], Self::row_to_alert)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(alerts)
    }

    fn table_exists(&self, table: &str) -> Result<bool> {
        let conn = self.conn()?;
        Self::table_exists_in(&conn, table)
    }

    fn latest_activity(&self, table: &str, column: &str) -> Result<Option<DateTime<Utc>>> {
        Self::check_identifiers(&[table, column])?;
        let conn = self.conn()?;
        if !Self::table_exists_in(&conn, table)? {
            return Ok(None);
        }
        let latest: Value = conn.query_row(
            &format!("SELECT MAX({}) FROM {}", column, table),
            [],
            |row| row.get(0),
        )?;
        Ok(parse_loose(&latest))
    }

    fn duplicate_keys(
        &self,
        table: &str,
        key_column: &str,
        limit: usize,
    ) -> Result<Vec<(String, i64)>> {
        Self::check_identifiers(&[table, key_column])?;
        let conn = self.conn()?;
        if !Self::table_exists_in(&conn, table)? {
            bail!("Table {} does not exist", table);
        }
        let mut stmt = conn.prepare(&format!(
            "SELECT {key}, COUNT(*) AS occurrences FROM {table}
             WHERE {key} IS NOT NULL
             GROUP BY {key} HAVING COUNT(*) > 1
             ORDER BY occurrences DESC LIMIT ?1",
            key = key_column,
            table = table
        ))?;
        let duplicates = stmt
            .query_map(params![limit as i64], |row| {
                let key = match row.get::<_, Value>(0)? {
                    Value::Text(s) => s,
                    Value::Integer(i) => i.to_string(),
                    Value::Real(r) => r.to_string(),
                    Value::Blob(b) => format!("<{} byte blob>", b.len()),
                    Value::Null => "NULL".to_string(),
                };
                Ok((key, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(duplicates)
    }

    fn recent_timestamps(
        &self,
        table: &str,
        column: &str,
        limit: usize,
    ) -> Result<Vec<Option<DateTime<Utc>>>> {
        Self::check_identifiers(&[table, column])?;
        let conn = self.conn()?;
        if !Self::table_exists_in(&conn, table)? {
            bail!("Table {} does not exist", table);
        }
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} ORDER BY rowid DESC LIMIT ?1",
            column, table
        ))?;
        let mut values = stmt
            .query_map(params![limit as i64], |row| row.get::<_, Value>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .iter()
            .map(parse_loose)
            .collect::<Vec<_>>();
        values.reverse();
        Ok(values)
    }
}
