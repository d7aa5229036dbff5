//! Versioned, forward-only schema migrations.
//!
//! The `schema_version` table records every applied migration. Pending
//! migrations are applied at open time, each in its own immediate
//! transaction together with its version row, so concurrent openers never
//! apply the same step twice. A store whose recorded version is newer than
//! [`SCHEMA_VERSION`] is refused.

use super::fmt_ts;
use crate::{Error, Result};
use chrono::Utc;
use rusqlite::{Connection, TransactionBehavior, params};

/// Latest schema version this build understands.
pub const SCHEMA_VERSION: i64 = 2;

struct Migration {
    version: i64,
    description: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "initial coordination schema",
        sql: r#"
            CREATE TABLE projects (
                project_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                root_path TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE agents (
                session_id TEXT PRIMARY KEY,
                agent_name TEXT NOT NULL,
                pid INTEGER,
                parent_id TEXT REFERENCES agents(session_id),
                project TEXT,
                current_work TEXT,
                status TEXT NOT NULL DEFAULT 'active'
                    CHECK (status IN ('active', 'idle', 'completed', 'stale')),
                started_at TEXT NOT NULL,
                last_seen_at TEXT NOT NULL,
                metadata TEXT
            );

            CREATE TABLE work_items (
                item_id TEXT PRIMARY KEY,
                project_id TEXT REFERENCES projects(project_id),
                title TEXT NOT NULL,
                description TEXT,
                source TEXT NOT NULL
                    CHECK (source IN ('github', 'local', 'operator')),
                source_ref TEXT,
                status TEXT NOT NULL DEFAULT 'available'
                    CHECK (status IN ('available', 'claimed', 'completed', 'blocked')),
                priority TEXT NOT NULL DEFAULT 'P2'
                    CHECK (priority IN ('P1', 'P2', 'P3')),
                claimed_by TEXT REFERENCES agents(session_id),
                claimed_at TEXT,
                completed_at TEXT,
                blocked_by TEXT,
                created_at TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                CHECK ((claimed_by IS NULL) = (claimed_at IS NULL)),
                CHECK (status <> 'claimed' OR claimed_by IS NOT NULL),
                CHECK (status IN ('claimed', 'blocked') OR claimed_by IS NULL),
                CHECK ((status = 'completed') = (completed_at IS NOT NULL))
            );

            CREATE TABLE heartbeats (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL REFERENCES agents(session_id),
                timestamp TEXT NOT NULL,
                progress TEXT,
                work_item_id TEXT REFERENCES work_items(item_id),
                metadata TEXT
            );

            CREATE TABLE events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                event_type TEXT NOT NULL,
                actor_id TEXT,
                target_id TEXT,
                target_type TEXT
                    CHECK (target_type IS NULL OR target_type IN ('agent', 'work_item', 'project')),
                summary TEXT NOT NULL,
                metadata TEXT
            );
        "#,
    },
    Migration {
        version: 2,
        description: "secondary indexes for sweep, claim and event polling",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_agents_status_seen ON agents(status, last_seen_at);
            CREATE INDEX IF NOT EXISTS idx_agents_parent ON agents(parent_id);
            CREATE INDEX IF NOT EXISTS idx_work_items_status_priority
                ON work_items(status, priority, created_at);
            CREATE INDEX IF NOT EXISTS idx_work_items_claimed_by ON work_items(claimed_by);
            CREATE INDEX IF NOT EXISTS idx_work_items_project ON work_items(project_id);
            CREATE INDEX IF NOT EXISTS idx_heartbeats_timestamp ON heartbeats(timestamp);
            CREATE INDEX IF NOT EXISTS idx_heartbeats_session ON heartbeats(session_id);
            CREATE INDEX IF NOT EXISTS idx_heartbeats_work_item ON heartbeats(work_item_id);
            CREATE INDEX IF NOT EXISTS idx_events_target ON events(target_id, id);
            CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type, id);
        "#,
    },
];

/// Highest version recorded in `schema_version`, or 0 for a fresh store.
pub fn current_version(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?)
}

/// Apply every pending migration. Returns the resulting schema version.
pub fn apply(conn: &mut Connection) -> Result<i64> {
    apply_up_to(conn, SCHEMA_VERSION)
}

fn apply_up_to(conn: &mut Connection, target: i64) -> Result<i64> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL,
            description TEXT NOT NULL
        );",
    )?;

    let found = current_version(conn)?;
    if found > SCHEMA_VERSION {
        return Err(Error::SchemaTooNew {
            found,
            supported: SCHEMA_VERSION,
        });
    }

    for migration in MIGRATIONS
        .iter()
        .filter(|m| m.version > found && m.version <= target)
    {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // Another process may have applied this step while we waited for the lock.
        if current_version(&tx)? >= migration.version {
            continue;
        }

        tx.execute_batch(migration.sql)?;
        tx.execute(
            "INSERT INTO schema_version (version, applied_at, description) VALUES (?1, ?2, ?3)",
            params![migration.version, fmt_ts(Utc::now()), migration.description],
        )?;
        tx.commit()?;

        tracing::debug!(
            version = migration.version,
            description = migration.description,
            "applied schema migration"
        );
    }

    current_version(conn)
}
