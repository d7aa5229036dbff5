//! Storage layer for Muster data.
//!
//! All coordination state lives in one SQLite database (`muster.db`) shared by
//! every agent process. The connection is opened with:
//!
//! - `journal_mode=WAL` so readers never block the writer
//! - `foreign_keys=ON` so parent sessions, claimants and projects must exist
//! - a non-zero `busy_timeout` so contending writers wait, then fail
//!
//! Every state-changing operation runs in a single `BEGIN IMMEDIATE`
//! transaction that mutates the primary rows and appends its event rows.
//! Entity-specific operations live in the submodules:
//!
//! - [`agents`] - session leases (register/heartbeat/deregister) and sweep primitives
//! - [`work_items`] - the claim state machine
//! - [`events`] - the append-only event log
//! - [`projects`] - project namespaces
//! - [`migrations`] - versioned, forward-only schema migrations

pub mod agents;
pub mod events;
pub mod migrations;
pub mod projects;
pub mod work_items;

pub use agents::{DeregisterSummary, HeartbeatAck};
pub use migrations::SCHEMA_VERSION;
pub use work_items::{ClaimResult, DeleteResult, MetadataUpdate};

use crate::models::{AgentStatus, Priority, Source, TargetType, WorkStatus};
use crate::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Database file name inside the data directory.
pub const DB_FILE: &str = "muster.db";

/// Environment variable that overrides the data directory.
pub const DATA_DIR_ENV: &str = "MUSTER_DATA_DIR";

/// Handle to the shared coordination store.
pub struct Storage {
    /// Path of the database file (":memory:" for in-memory stores)
    path: PathBuf,
    /// SQLite connection
    conn: Connection,
}

impl Storage {
    /// Open or create the store at `path`, applying pending migrations.
    ///
    /// Fails with [`Error::SchemaTooNew`] if the store was written by a newer
    /// version of Muster.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if i32::try_from(busy_timeout.as_millis()).is_err() {
            return Err(Error::InvalidInput(format!(
                "Busy timeout too long: {}ms",
                busy_timeout.as_millis()
            )));
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            tracing::warn!(mode = %mode, path = %path.display(), "store is not in WAL mode");
        }
        conn.pragma_update(None, "foreign_keys", true)?;

        migrations::apply(&mut conn)?;

        Ok(Self {
            path: path.to_path_buf(),
            conn,
        })
    }

    /// Open a private in-memory store (for tests).
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", true)?;
        migrations::apply(&mut conn)?;
        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn,
        })
    }

    /// Check if a store exists in the given data directory.
    pub fn exists(data_dir: &Path) -> bool {
        data_dir.join(DB_FILE).exists()
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Expose the raw connection (for tests or advanced read-only usage).
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Schema version currently applied to this store.
    pub fn schema_version(&self) -> Result<i64> {
        migrations::current_version(&self.conn)
    }

    /// Begin a write transaction that takes the database write lock up front.
    ///
    /// Deferred transactions that read first and write later can fail with
    /// SQLITE_BUSY on lock upgrade without waiting on the busy handler.
    fn write_tx(&mut self) -> Result<Transaction<'_>> {
        Ok(self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?)
    }
}

/// Resolve the data directory.
///
/// Precedence: explicit path > `MUSTER_DATA_DIR` > `<platform data dir>/muster`.
pub fn get_data_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    let data_dir = dirs::data_dir()
        .ok_or_else(|| Error::Config("Could not determine data directory".to_string()))?;
    Ok(data_dir.join("muster"))
}

/// Generate an opaque, never-reused session identifier.
pub fn generate_session_id() -> String {
    format!("ses-{}", uuid::Uuid::new_v4().simple())
}

// === Column helpers ===

/// Format a timestamp for storage.
///
/// Fixed-width RFC 3339 with microseconds and a `Z` suffix, so string
/// comparison in SQL orders chronologically.
pub(crate) fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: &str, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                format!("bad timestamp in column {}: {}", idx, e).into(),
            )
        })
}

pub(crate) fn ts_col(row: &Row<'_>, col: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(col)?;
    parse_ts(col, &raw)
}

pub(crate) fn ts_col_opt(row: &Row<'_>, col: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(col)?;
    raw.map(|s| parse_ts(col, &s)).transpose()
}

pub(crate) fn json_col_opt(row: &Row<'_>, col: &str) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = row.get(col)?;
    raw.map(|s| {
        serde_json::from_str(&s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
    })
    .transpose()
}

pub(crate) fn pid_col(row: &Row<'_>, col: &str) -> rusqlite::Result<Option<u32>> {
    let raw: Option<i64> = row.get(col)?;
    Ok(raw.and_then(|v| u32::try_from(v).ok()))
}

/// Run a single-row query, mapping "no rows" to `None`.
pub(crate) fn query_opt<T, P, F>(conn: &Connection, sql: &str, params: P, f: F) -> Result<Option<T>>
where
    P: rusqlite::Params,
    F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
{
    Ok(conn.query_row(sql, params, f).optional()?)
}

macro_rules! sql_text_enum {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse::<$ty>()
                    .map_err(|e| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

sql_text_enum!(AgentStatus);
sql_text_enum!(WorkStatus);
sql_text_enum!(Priority);
sql_text_enum!(Source);
sql_text_enum!(TargetType);
