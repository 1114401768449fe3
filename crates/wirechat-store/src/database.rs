//! Database connection management.
//!
//! [`Database`] owns a single [`rusqlite::Connection`] behind a mutex and
//! guarantees that migrations have run before any other operation. SQLite
//! performs best with one writer, so all access is serialized through the
//! same connection; callers hold the lock only for the duration of one
//! statement or transaction.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::error::Result;
use crate::migrations;

/// The persistence gateway consumed by the hub and services.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database at the given path.
    ///
    /// Applies the recommended pragmas (WAL journaling, foreign keys, busy
    /// timeout) and runs schema migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        tracing::info!(path = %path.display(), "opening database");

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        migrations::run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection. Lock poisoning is not fatal for SQLite state,
    /// so a poisoned guard is recovered rather than propagated.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Parse an RFC 3339 timestamp out of a query result column.
pub(crate) fn column_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// Parse an optional RFC 3339 timestamp column.
pub(crate) fn column_ts_opt(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match raw {
        Some(s) => column_ts(idx, &s).map(Some),
        None => Ok(None),
    }
}

/// Decode an enum-backed text column, failing the row on unknown values.
pub(crate) fn column_enum<T>(
    idx: usize,
    raw: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown value: {raw}").into(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        let db = Database::open(&path).expect("should open");
        let version: u32 = db
            .conn()
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, migrations::CURRENT_VERSION);
    }

    #[test]
    fn reopen_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        drop(Database::open(&path).unwrap());
        Database::open(&path).expect("second open should succeed");
    }
}
