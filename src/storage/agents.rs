//! Agent session leases.
//!
//! A session is created by registration, kept warm by heartbeats and ends
//! either by deregistration (`completed`) or by the stale sweep (`stale`).
//! Sessions are never deleted. Both terminal paths release every claim the
//! session holds inside the same transaction that flips its status.

use super::events::{NewEvent, insert_event};
use super::{
    Storage, fmt_ts, generate_session_id, json_col_opt, pid_col, query_opt, ts_col,
};
use crate::models::{AgentFilter, AgentSession, AgentStatus, Heartbeat, KnownEventType, NewAgent};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

const AGENT_COLUMNS: &str = "session_id, agent_name, pid, parent_id, project, current_work, \
                             status, started_at, last_seen_at, metadata";

/// Acknowledgement returned by a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub session_id: String,
    /// Session status after the heartbeat; a stale or completed session has lost its leases
    pub status: AgentStatus,
    pub last_seen_at: DateTime<Utc>,
    pub heartbeat_id: i64,
    /// Set when progress was reported and a `heartbeat_received` event was written
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<i64>,
}

/// Result of a deregistration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeregisterSummary {
    pub session_id: String,
    /// Seconds from registration to deregistration (0 on a repeated call)
    pub duration_secs: i64,
    pub released_count: usize,
    pub released_items: Vec<String>,
    /// True when the session had already ended and nothing changed
    pub already_ended: bool,
    pub status: AgentStatus,
}

fn row_to_agent(row: &Row<'_>) -> rusqlite::Result<AgentSession> {
    Ok(AgentSession {
        session_id: row.get("session_id")?,
        agent_name: row.get("agent_name")?,
        pid: pid_col(row, "pid")?,
        parent_id: row.get("parent_id")?,
        project: row.get("project")?,
        current_work: row.get("current_work")?,
        status: row.get("status")?,
        started_at: ts_col(row, "started_at")?,
        last_seen_at: ts_col(row, "last_seen_at")?,
        metadata: json_col_opt(row, "metadata")?,
    })
}

pub(crate) fn load_agent(conn: &Connection, session_id: &str) -> Result<Option<AgentSession>> {
    query_opt(
        conn,
        &format!("SELECT {} FROM agents WHERE session_id = ?1", AGENT_COLUMNS),
        params![session_id],
        row_to_agent,
    )
}

pub(crate) fn require_agent(conn: &Connection, session_id: &str) -> Result<AgentSession> {
    load_agent(conn, session_id)?.ok_or_else(|| Error::AgentNotFound(session_id.to_string()))
}

/// Drop every claim held by `session_id`.
///
/// Claimed items go back to `available`. Blocked items keep their block but
/// lose the preserved claim, so unblocking makes them available. Returns the
/// affected item IDs.
pub(crate) fn release_session_claims(conn: &Connection, session_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT item_id FROM work_items
         WHERE claimed_by = ?1 AND status IN ('claimed', 'blocked')
         ORDER BY item_id",
    )?;
    let items = stmt
        .query_map(params![session_id], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    if !items.is_empty() {
        conn.execute(
            "UPDATE work_items
             SET status = CASE WHEN status = 'claimed' THEN 'available' ELSE status END,
                 claimed_by = NULL,
                 claimed_at = NULL
             WHERE claimed_by = ?1 AND status IN ('claimed', 'blocked')",
            params![session_id],
        )?;
    }

    Ok(items)
}

impl Storage {
    /// Register a new agent session.
    ///
    /// Inserts the session as `active` and appends `agent_registered` in one
    /// transaction. A supplied parent must already exist.
    pub fn register_agent(&mut self, new: &NewAgent) -> Result<AgentSession> {
        if new.agent_name.trim().is_empty() {
            return Err(Error::InvalidInput("Agent name must not be empty".to_string()));
        }
        let metadata = new
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let session_id = generate_session_id();
        let now = fmt_ts(Utc::now());
        let tx = self.write_tx()?;

        if let Some(ref parent) = new.parent_id {
            if load_agent(&tx, parent)?.is_none() {
                return Err(Error::AgentNotFound(parent.clone()));
            }
        }

        tx.execute(
            "INSERT INTO agents (session_id, agent_name, pid, parent_id, project, current_work,
                                 status, started_at, last_seen_at, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'active', ?7, ?7, ?8)",
            params![
                session_id,
                new.agent_name,
                new.pid.map(i64::from),
                new.parent_id,
                new.project,
                new.current_work,
                now,
                metadata,
            ],
        )?;

        insert_event(
            &tx,
            &NewEvent::new(
                KnownEventType::AgentRegistered,
                format!("Agent {} registered", new.agent_name),
            )
            .actor(&session_id)
            .agent(&session_id)
            .metadata(json!({
                "agent_name": new.agent_name,
                "pid": new.pid,
                "parent_id": new.parent_id,
                "project": new.project,
            })),
        )?;

        let session = require_agent(&tx, &session_id)?;
        tx.commit()?;

        tracing::debug!(session_id = %session.session_id, agent = %session.agent_name, "registered agent");
        Ok(session)
    }

    /// Record a heartbeat for a session.
    ///
    /// Always advances `last_seen_at` and appends a heartbeat row. Only a
    /// heartbeat carrying progress text overwrites `current_work`, returns an
    /// idle session to active and emits `heartbeat_received`.
    pub fn heartbeat(
        &mut self,
        session_id: &str,
        progress: Option<&str>,
        work_item_id: Option<&str>,
        metadata: Option<&Value>,
    ) -> Result<HeartbeatAck> {
        let metadata = metadata.map(serde_json::to_string).transpose()?;
        let now = fmt_ts(Utc::now());
        let tx = self.write_tx()?;

        let agent = require_agent(&tx, session_id)?;
        if let Some(item_id) = work_item_id {
            let exists: bool = tx.query_row(
                "SELECT COUNT(*) > 0 FROM work_items WHERE item_id = ?1",
                params![item_id],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(Error::ItemNotFound(item_id.to_string()));
            }
        }

        tx.execute(
            "UPDATE agents
             SET last_seen_at = MAX(last_seen_at, ?2),
                 current_work = COALESCE(?3, current_work),
                 status = CASE WHEN ?3 IS NOT NULL AND status = 'idle' THEN 'active' ELSE status END
             WHERE session_id = ?1",
            params![session_id, now, progress],
        )?;

        tx.execute(
            "INSERT INTO heartbeats (session_id, timestamp, progress, work_item_id, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![session_id, now, progress, work_item_id, metadata],
        )?;
        let heartbeat_id = tx.last_insert_rowid();

        let event_id = match progress {
            Some(text) => {
                let mut event = NewEvent::new(
                    KnownEventType::HeartbeatReceived,
                    format!("{}: {}", agent.agent_name, text),
                )
                .actor(session_id)
                .agent(session_id);
                if let Some(item_id) = work_item_id {
                    event = event.metadata(json!({ "work_item_id": item_id }));
                }
                Some(insert_event(&tx, &event)?)
            }
            None => None,
        };

        let updated = require_agent(&tx, session_id)?;
        tx.commit()?;

        Ok(HeartbeatAck {
            session_id: updated.session_id,
            status: updated.status,
            last_seen_at: updated.last_seen_at,
            heartbeat_id,
            event_id,
        })
    }

    /// Move an active session to idle.
    ///
    /// Idle sessions keep their claims and are still swept. Marking an idle
    /// session idle again is a no-op.
    pub fn mark_idle(&mut self, session_id: &str) -> Result<AgentSession> {
        let now = fmt_ts(Utc::now());
        let tx = self.write_tx()?;

        let agent = require_agent(&tx, session_id)?;
        match agent.status {
            AgentStatus::Idle => return Ok(agent),
            AgentStatus::Completed | AgentStatus::Stale => {
                return Err(Error::AgentInactive {
                    session: session_id.to_string(),
                    status: agent.status.to_string(),
                });
            }
            AgentStatus::Active => {}
        }

        tx.execute(
            "UPDATE agents SET status = 'idle', last_seen_at = MAX(last_seen_at, ?2)
             WHERE session_id = ?1",
            params![session_id, now],
        )?;
        insert_event(
            &tx,
            &NewEvent::new(
                KnownEventType::AgentIdle,
                format!("Agent {} is idle", agent.agent_name),
            )
            .actor(session_id)
            .agent(session_id),
        )?;

        let updated = require_agent(&tx, session_id)?;
        tx.commit()?;
        Ok(updated)
    }

    /// Deregister a session, releasing all of its claims.
    ///
    /// Idempotent: a session that has already ended (completed or stale)
    /// yields a zero-duration, zero-release summary and no event.
    pub fn deregister_agent(&mut self, session_id: &str) -> Result<DeregisterSummary> {
        let now = Utc::now();
        let tx = self.write_tx()?;

        let agent = require_agent(&tx, session_id)?;
        if !agent.status.is_live() {
            return Ok(DeregisterSummary {
                session_id: session_id.to_string(),
                duration_secs: 0,
                released_count: 0,
                released_items: Vec::new(),
                already_ended: true,
                status: agent.status,
            });
        }

        let released = release_session_claims(&tx, session_id)?;

        tx.execute(
            "UPDATE agents SET status = 'completed', last_seen_at = MAX(last_seen_at, ?2)
             WHERE session_id = ?1",
            params![session_id, fmt_ts(now)],
        )?;

        let duration_secs = (now - agent.started_at).num_seconds().max(0);
        insert_event(
            &tx,
            &NewEvent::new(
                KnownEventType::AgentDeregistered,
                format!(
                    "Agent {} deregistered after {}s, released {} work item(s)",
                    agent.agent_name,
                    duration_secs,
                    released.len()
                ),
            )
            .actor(session_id)
            .agent(session_id)
            .metadata(json!({
                "duration_secs": duration_secs,
                "released_count": released.len(),
                "released_items": released,
            })),
        )?;

        tx.commit()?;

        tracing::debug!(session_id, released = released.len(), "deregistered agent");
        Ok(DeregisterSummary {
            session_id: session_id.to_string(),
            duration_secs,
            released_count: released.len(),
            released_items: released,
            already_ended: false,
            status: AgentStatus::Completed,
        })
    }

    /// Get a session by ID.
    pub fn get_agent(&self, session_id: &str) -> Result<AgentSession> {
        require_agent(&self.conn, session_id)
    }

    /// List sessions. Without an explicit filter only live sessions are returned.
    pub fn list_agents(&self, filter: &AgentFilter) -> Result<Vec<AgentSession>> {
        let mut sql = format!("SELECT {} FROM agents WHERE 1=1", AGENT_COLUMNS);
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if !filter.all {
            let statuses: Vec<AgentStatus> = if filter.statuses.is_empty() {
                vec![AgentStatus::Active, AgentStatus::Idle]
            } else {
                filter.statuses.clone()
            };
            let placeholders = vec!["?"; statuses.len()].join(", ");
            sql.push_str(&format!(" AND status IN ({})", placeholders));
            for status in statuses {
                params_vec.push(Box::new(status));
            }
        }
        if let Some(ref project) = filter.project {
            sql.push_str(" AND project = ?");
            params_vec.push(Box::new(project.clone()));
        }

        sql.push_str(" ORDER BY started_at ASC, session_id ASC");

        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|p| p.as_ref()).collect();

        let mut stmt = self.conn.prepare(&sql)?;
        let agents = stmt
            .query_map(params_refs.as_slice(), row_to_agent)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(agents)
    }

    /// Most recent heartbeats for a session, newest first.
    pub fn heartbeats_for(&self, session_id: &str, limit: usize) -> Result<Vec<Heartbeat>> {
        require_agent(&self.conn, session_id)?;
        let mut stmt = self.conn.prepare(
            "SELECT id, session_id, timestamp, progress, work_item_id, metadata
             FROM heartbeats WHERE session_id = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let heartbeats = stmt
            .query_map(params![session_id, limit as i64], |row| {
                Ok(Heartbeat {
                    id: row.get("id")?,
                    session_id: row.get("session_id")?,
                    timestamp: ts_col(row, "timestamp")?,
                    progress: row.get("progress")?,
                    work_item_id: row.get("work_item_id")?,
                    metadata: json_col_opt(row, "metadata")?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(heartbeats)
    }

    // === Sweep primitives ===

    /// Live sessions whose last contact is older than `cutoff`.
    pub fn stale_candidates(&self, cutoff: DateTime<Utc>) -> Result<Vec<AgentSession>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM agents
             WHERE status IN ('active', 'idle') AND last_seen_at < ?1
             ORDER BY last_seen_at ASC",
            AGENT_COLUMNS
        ))?;
        let agents = stmt
            .query_map(params![fmt_ts(cutoff)], row_to_agent)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(agents)
    }

    /// Refresh a live session's lease on behalf of its supervisor.
    ///
    /// No event is written. Returns false if the session is no longer live.
    pub fn refresh_lease(&mut self, session_id: &str) -> Result<bool> {
        let changes = self.conn.execute(
            "UPDATE agents SET last_seen_at = MAX(last_seen_at, ?2)
             WHERE session_id = ?1 AND status IN ('active', 'idle')",
            params![session_id, fmt_ts(Utc::now())],
        )?;
        Ok(changes == 1)
    }

    /// Mark a session stale and release its claims.
    ///
    /// The staleness condition is re-evaluated against the committed
    /// `last_seen_at` inside the transaction: a session that heartbeated after
    /// it was selected as a candidate is left alone and `None` is returned.
    /// Otherwise returns the released item IDs.
    pub fn reclaim_stale(
        &mut self,
        session_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<Vec<String>>> {
        let tx = self.write_tx()?;

        let changes = tx.execute(
            "UPDATE agents SET status = 'stale'
             WHERE session_id = ?1 AND status IN ('active', 'idle') AND last_seen_at < ?2",
            params![session_id, fmt_ts(cutoff)],
        )?;
        if changes == 0 {
            return Ok(None);
        }

        let agent = require_agent(&tx, session_id)?;
        let released = release_session_claims(&tx, session_id)?;

        insert_event(
            &tx,
            &NewEvent::new(
                KnownEventType::AgentStale,
                format!(
                    "Agent {} marked stale (pid {} not running)",
                    agent.agent_name,
                    agent
                        .pid
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "unknown".to_string())
                ),
            )
            .agent(session_id)
            .metadata(json!({
                "pid": agent.pid,
                "last_seen_at": fmt_ts(agent.last_seen_at),
            })),
        )?;

        if !released.is_empty() {
            insert_event(
                &tx,
                &NewEvent::new(
                    KnownEventType::StaleLocksReleased,
                    format!(
                        "Released {} work item(s) held by stale agent {}",
                        released.len(),
                        agent.agent_name
                    ),
                )
                .agent(session_id)
                .metadata(json!({
                    "released_count": released.len(),
                    "released_items": released,
                })),
            )?;
        }

        tx.commit()?;
        Ok(Some(released))
    }

    /// Delete heartbeat rows older than `before`. Returns the number removed.
    pub fn prune_heartbeats(&mut self, before: DateTime<Utc>) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM heartbeats WHERE timestamp < ?1",
            params![fmt_ts(before)],
        )?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventQuery, WorkStatus};
    use crate::test_utils::{agent, item};

    fn backdate(storage: &Storage, session_id: &str, secs: i64) {
        let past = fmt_ts(Utc::now() - chrono::Duration::seconds(secs));
        storage
            .conn()
            .execute(
                "UPDATE agents SET last_seen_at = ?2, started_at = ?2 WHERE session_id = ?1",
                params![session_id, past],
            )
            .unwrap();
    }

    fn count_events(storage: &Storage, event_type: &str) -> usize {
        storage
            .list_events(&EventQuery {
                event_type: Some(event_type.to_string()),
                ..EventQuery::default()
            })
            .unwrap()
            .len()
    }

    #[test]
    fn test_register_agent() {
        let mut storage = Storage::open_in_memory().unwrap();
        let session = storage
            .register_agent(&NewAgent {
                agent_name: "worker".to_string(),
                pid: Some(4242),
                project: Some("core".to_string()),
                current_work: Some("warming up".to_string()),
                ..NewAgent::default()
            })
            .unwrap();

        assert_eq!(session.status, AgentStatus::Active);
        assert_eq!(session.pid, Some(4242));
        assert_eq!(session.started_at, session.last_seen_at);
        assert_eq!(count_events(&storage, "agent_registered"), 1);
    }

    #[test]
    fn test_register_agent_with_missing_parent_fails() {
        let mut storage = Storage::open_in_memory().unwrap();
        let err = storage
            .register_agent(&NewAgent {
                agent_name: "child".to_string(),
                parent_id: Some("ses-missing".to_string()),
                ..NewAgent::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::AgentNotFound(_)));
        assert_eq!(count_events(&storage, "agent_registered"), 0);
    }

    #[test]
    fn test_register_agent_with_parent() {
        let mut storage = Storage::open_in_memory().unwrap();
        let parent = storage.register_agent(&agent("lead")).unwrap();
        let child = storage
            .register_agent(&NewAgent {
                agent_name: "helper".to_string(),
                parent_id: Some(parent.session_id.clone()),
                ..NewAgent::default()
            })
            .unwrap();
        assert_eq!(child.parent_id, Some(parent.session_id));
    }

    #[test]
    fn test_heartbeat_without_progress_emits_no_event() {
        let mut storage = Storage::open_in_memory().unwrap();
        let session = storage.register_agent(&agent("a")).unwrap();
        backdate(&storage, &session.session_id, 60);

        let ack = storage
            .heartbeat(&session.session_id, None, None, None)
            .unwrap();
        assert!(ack.event_id.is_none());
        assert_eq!(count_events(&storage, "heartbeat_received"), 0);

        let heartbeats = storage.heartbeats_for(&session.session_id, 10).unwrap();
        assert_eq!(heartbeats.len(), 1);
    }

    #[test]
    fn test_heartbeat_with_progress_updates_work_and_emits_event() {
        let mut storage = Storage::open_in_memory().unwrap();
        let session = storage.register_agent(&agent("a")).unwrap();

        let ack = storage
            .heartbeat(&session.session_id, Some("compiling"), None, None)
            .unwrap();
        assert!(ack.event_id.is_some());

        let updated = storage.get_agent(&session.session_id).unwrap();
        assert_eq!(updated.current_work.as_deref(), Some("compiling"));
        assert_eq!(count_events(&storage, "heartbeat_received"), 1);
    }

    #[test]
    fn test_heartbeat_unknown_session() {
        let mut storage = Storage::open_in_memory().unwrap();
        let err = storage.heartbeat("ses-nope", None, None, None).unwrap_err();
        assert!(matches!(err, Error::AgentNotFound(_)));
    }

    #[test]
    fn test_heartbeat_unknown_work_item() {
        let mut storage = Storage::open_in_memory().unwrap();
        let session = storage.register_agent(&agent("a")).unwrap();
        let err = storage
            .heartbeat(&session.session_id, None, Some("w-missing"), None)
            .unwrap_err();
        assert!(matches!(err, Error::ItemNotFound(_)));
    }

    #[test]
    fn test_last_seen_never_moves_backwards() {
        let mut storage = Storage::open_in_memory().unwrap();
        let session = storage.register_agent(&agent("a")).unwrap();
        let future = Utc::now() + chrono::Duration::hours(1);
        storage
            .conn()
            .execute(
                "UPDATE agents SET last_seen_at = ?2 WHERE session_id = ?1",
                params![session.session_id, fmt_ts(future)],
            )
            .unwrap();

        let ack = storage
            .heartbeat(&session.session_id, None, None, None)
            .unwrap();
        assert_eq!(fmt_ts(ack.last_seen_at), fmt_ts(future));
    }

    #[test]
    fn test_mark_idle_and_progress_reactivates() {
        let mut storage = Storage::open_in_memory().unwrap();
        let session = storage.register_agent(&agent("a")).unwrap();

        let idle = storage.mark_idle(&session.session_id).unwrap();
        assert_eq!(idle.status, AgentStatus::Idle);

        storage
            .heartbeat(&session.session_id, None, None, None)
            .unwrap();
        assert_eq!(
            storage.get_agent(&session.session_id).unwrap().status,
            AgentStatus::Idle
        );

        storage
            .heartbeat(&session.session_id, Some("back at it"), None, None)
            .unwrap();
        assert_eq!(
            storage.get_agent(&session.session_id).unwrap().status,
            AgentStatus::Active
        );
    }

    #[test]
    fn test_deregister_releases_claims() {
        let mut storage = Storage::open_in_memory().unwrap();
        let session = storage.register_agent(&agent("a")).unwrap();
        storage.create_work_item(&item("w1")).unwrap();
        storage.create_work_item(&item("w2")).unwrap();
        storage.claim("w1", &session.session_id).unwrap();
        storage.claim("w2", &session.session_id).unwrap();

        let summary = storage.deregister_agent(&session.session_id).unwrap();
        assert_eq!(summary.released_count, 2);
        assert_eq!(summary.released_items, vec!["w1", "w2"]);
        assert!(!summary.already_ended);

        let w1 = storage.get_work_item("w1").unwrap();
        assert_eq!(w1.status, WorkStatus::Available);
        assert!(w1.claimed_by.is_none());
        assert!(w1.claimed_at.is_none());

        assert_eq!(
            storage.get_agent(&session.session_id).unwrap().status,
            AgentStatus::Completed
        );
        assert_eq!(count_events(&storage, "agent_deregistered"), 1);
    }

    #[test]
    fn test_deregister_is_idempotent() {
        let mut storage = Storage::open_in_memory().unwrap();
        let session = storage.register_agent(&agent("a")).unwrap();
        storage.create_work_item(&item("w1")).unwrap();
        storage.claim("w1", &session.session_id).unwrap();

        storage.deregister_agent(&session.session_id).unwrap();
        let second = storage.deregister_agent(&session.session_id).unwrap();

        assert_eq!(second.released_count, 0);
        assert_eq!(second.duration_secs, 0);
        assert!(second.already_ended);
        assert_eq!(second.status, AgentStatus::Completed);
        assert_eq!(count_events(&storage, "agent_deregistered"), 1);
    }

    #[test]
    fn test_deregister_reports_duration() {
        let mut storage = Storage::open_in_memory().unwrap();
        let session = storage.register_agent(&agent("a")).unwrap();
        backdate(&storage, &session.session_id, 120);

        let summary = storage.deregister_agent(&session.session_id).unwrap();
        assert!(summary.duration_secs >= 119);
    }

    #[test]
    fn test_deregister_unknown_session() {
        let mut storage = Storage::open_in_memory().unwrap();
        assert!(matches!(
            storage.deregister_agent("ses-nope").unwrap_err(),
            Error::AgentNotFound(_)
        ));
    }

    #[test]
    fn test_list_agents_default_excludes_ended() {
        let mut storage = Storage::open_in_memory().unwrap();
        let a = storage.register_agent(&agent("a")).unwrap();
        let b = storage.register_agent(&agent("b")).unwrap();
        storage.deregister_agent(&b.session_id).unwrap();

        let live = storage.list_agents(&AgentFilter::default()).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].session_id, a.session_id);

        let all = storage
            .list_agents(&AgentFilter {
                all: true,
                ..AgentFilter::default()
            })
            .unwrap();
        assert_eq!(all.len(), 2);

        let completed = storage
            .list_agents(&AgentFilter {
                statuses: vec![AgentStatus::Completed],
                ..AgentFilter::default()
            })
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].session_id, b.session_id);
    }

    #[test]
    fn test_reclaim_stale_releases_and_emits_events() {
        let mut storage = Storage::open_in_memory().unwrap();
        let session = storage.register_agent(&agent("a")).unwrap();
        storage.create_work_item(&item("w1")).unwrap();
        storage.claim("w1", &session.session_id).unwrap();
        backdate(&storage, &session.session_id, 600);

        let cutoff = Utc::now() - chrono::Duration::seconds(300);
        let released = storage
            .reclaim_stale(&session.session_id, cutoff)
            .unwrap()
            .unwrap();
        assert_eq!(released, vec!["w1"]);
        assert_eq!(
            storage.get_agent(&session.session_id).unwrap().status,
            AgentStatus::Stale
        );
        assert_eq!(count_events(&storage, "agent_stale"), 1);
        assert_eq!(count_events(&storage, "stale_locks_released"), 1);
    }

    #[test]
    fn test_reclaim_stale_skips_fresh_session() {
        let mut storage = Storage::open_in_memory().unwrap();
        let session = storage.register_agent(&agent("a")).unwrap();

        let cutoff = Utc::now() - chrono::Duration::seconds(300);
        assert!(
            storage
                .reclaim_stale(&session.session_id, cutoff)
                .unwrap()
                .is_none()
        );
        assert_eq!(count_events(&storage, "agent_stale"), 0);
    }

    #[test]
    fn test_prune_heartbeats() {
        let mut storage = Storage::open_in_memory().unwrap();
        let session = storage.register_agent(&agent("a")).unwrap();
        storage
            .heartbeat(&session.session_id, None, None, None)
            .unwrap();
        storage
            .heartbeat(&session.session_id, None, None, None)
            .unwrap();
        let old = fmt_ts(Utc::now() - chrono::Duration::days(10));
        storage
            .conn()
            .execute(
                "UPDATE heartbeats SET timestamp = ?1 WHERE id = (SELECT MIN(id) FROM heartbeats)",
                params![old],
            )
            .unwrap();

        let pruned = storage
            .prune_heartbeats(Utc::now() - chrono::Duration::days(7))
            .unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(storage.heartbeats_for(&session.session_id, 10).unwrap().len(), 1);
    }
}
