mod versioned_schema;

pub use versioned_schema::{Column, SqlType, Table, VersionedSchema, BASE_DB_VERSION};

use anyhow::{bail, Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use rusqlite::Connection;
use tracing::info;

lazy_static! {
    static ref SQL_IDENTIFIER: Regex =
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier regex is valid");
}

/// Whether `name` can be interpolated into SQL as a table or column name.
///
/// Table and column names come from configuration, and SQLite cannot bind
/// identifiers as parameters.
pub fn is_valid_identifier(name: &str) -> bool {
    SQL_IDENTIFIER.is_match(name)
}

/// Brings `conn` to the latest of `schemas`.
///
/// A database with `user_version == 0` gets the latest schema created. It may
/// already hold tables written by ingestion jobs; those are left alone. Anything
/// else is validated against the schema of its
/// recorded version and then migrated forward inside one transaction.
pub fn open_versioned(
    conn: &mut Connection,
    schemas: &[VersionedSchema],
    label: &str,
) -> Result<()> {
    let latest = schemas
        .last()
        .with_context(|| format!("No schema versions defined for {} database", label))?;

    let raw_version: i64 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;

    if raw_version == 0 {
        info!("Creating {} database schema v{}", label, latest.version);
        return latest.create(conn);
    }

    let db_version = raw_version - BASE_DB_VERSION as i64;
    if db_version < 1 {
        bail!(
            "{} database version {} is invalid (expected >= 1)",
            label,
            db_version
        );
    }

    let current = schemas
        .iter()
        .find(|s| s.version as i64 == db_version)
        .with_context(|| format!("Unknown {} database version {}", label, db_version))?;
    current
        .validate(conn)
        .with_context(|| format!("{} schema validation failed for version {}", label, db_version))?;

    if (db_version as usize) < latest.version {
        info!(
            "Migrating {} database from version {} to {}",
            label, db_version, latest.version
        );
        let tx = conn.transaction()?;
        for schema in schemas.iter().filter(|s| s.version > db_version as usize) {
            if let Some(migration) = schema.migration {
                migration(&tx)
                    .with_context(|| format!("Failed to migrate to version {}", schema.version))?;
            }
        }
        tx.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + latest.version),
            [],
        )?;
        tx.commit()?;
    }
    Ok(())
}
