//! Append-only event log.
//!
//! Events are inserted only inside the transaction of the mutation that
//! caused them. Callers get read access through [`Storage::list_events`]
//! and [`Storage::latest_event_id`]; pollers track the greatest id seen.

use super::{Storage, fmt_ts, json_col_opt, query_opt, ts_col};
use crate::Result;
use crate::models::{Event, EventQuery, KnownEventType, TargetType};
use chrono::Utc;
use rusqlite::{Connection, Row, params};
use serde_json::Value;

const EVENT_COLUMNS: &str =
    "id, timestamp, event_type, actor_id, target_id, target_type, summary, metadata";

/// An event about to be appended.
#[derive(Debug, Clone)]
pub(crate) struct NewEvent<'a> {
    pub event_type: &'a str,
    pub actor_id: Option<&'a str>,
    pub target_id: Option<&'a str>,
    pub target_type: Option<TargetType>,
    pub summary: String,
    pub metadata: Option<Value>,
}

impl<'a> NewEvent<'a> {
    pub fn new(event_type: KnownEventType, summary: impl Into<String>) -> Self {
        Self {
            event_type: event_type.as_str(),
            actor_id: None,
            target_id: None,
            target_type: None,
            summary: summary.into(),
            metadata: None,
        }
    }

    pub fn actor(mut self, actor_id: &'a str) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    pub fn agent(mut self, session_id: &'a str) -> Self {
        self.target_id = Some(session_id);
        self.target_type = Some(TargetType::Agent);
        self
    }

    pub fn work_item(mut self, item_id: &'a str) -> Self {
        self.target_id = Some(item_id);
        self.target_type = Some(TargetType::WorkItem);
        self
    }

    pub fn project(mut self, project_id: &'a str) -> Self {
        self.target_id = Some(project_id);
        self.target_type = Some(TargetType::Project);
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Append an event on `conn` (normally an open transaction). Returns its id.
pub(crate) fn insert_event(conn: &Connection, event: &NewEvent<'_>) -> Result<i64> {
    let metadata = event
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "INSERT INTO events (timestamp, event_type, actor_id, target_id, target_type, summary, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            fmt_ts(Utc::now()),
            event.event_type,
            event.actor_id,
            event.target_id,
            event.target_type,
            event.summary,
            metadata,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn load_event(conn: &Connection, id: i64) -> Result<Option<Event>> {
    query_opt(
        conn,
        &format!("SELECT {} FROM events WHERE id = ?1", EVENT_COLUMNS),
        params![id],
        row_to_event,
    )
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        id: row.get("id")?,
        timestamp: ts_col(row, "timestamp")?,
        event_type: row.get("event_type")?,
        actor_id: row.get("actor_id")?,
        target_id: row.get("target_id")?,
        target_type: row.get("target_type")?,
        summary: row.get("summary")?,
        metadata: json_col_opt(row, "metadata")?,
    })
}

impl Storage {
    /// Query the event log in ascending id order.
    pub fn list_events(&self, query: &EventQuery) -> Result<Vec<Event>> {
        let mut sql = format!("SELECT {} FROM events WHERE 1=1", EVENT_COLUMNS);
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(since) = query.since_id {
            sql.push_str(" AND id > ?");
            params_vec.push(Box::new(since));
        }
        if let Some(ref target) = query.target_id {
            sql.push_str(" AND target_id = ?");
            params_vec.push(Box::new(target.clone()));
        }
        if let Some(target_type) = query.target_type {
            sql.push_str(" AND target_type = ?");
            params_vec.push(Box::new(target_type));
        }
        if let Some(ref event_type) = query.event_type {
            sql.push_str(" AND event_type = ?");
            params_vec.push(Box::new(event_type.clone()));
        }
        if let Some(ref actor) = query.actor_id {
            sql.push_str(" AND actor_id = ?");
            params_vec.push(Box::new(actor.clone()));
        }

        sql.push_str(" ORDER BY id ASC");

        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            params_vec.push(Box::new(limit as i64));
        }

        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|p| p.as_ref()).collect();

        let mut stmt = self.conn.prepare(&sql)?;
        let events = stmt
            .query_map(params_refs.as_slice(), row_to_event)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Greatest event id written so far (0 for an empty log).
    pub fn latest_event_id(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COALESCE(MAX(id), 0) FROM events", [], |row| {
                row.get(0)
            })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_query_events() {
        let storage = Storage::open_in_memory().unwrap();
        let conn = storage.conn();

        let first = insert_event(
            conn,
            &NewEvent::new(KnownEventType::Comment, "first").work_item("w1"),
        )
        .unwrap();
        let second = insert_event(
            conn,
            &NewEvent::new(KnownEventType::Comment, "second")
                .work_item("w2")
                .actor("ses-a")
                .metadata(serde_json::json!({"k": "v"})),
        )
        .unwrap();
        assert!(second > first);

        let all = storage.list_events(&EventQuery::default()).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].summary, "first");

        let since = storage
            .list_events(&EventQuery {
                since_id: Some(first),
                ..EventQuery::default()
            })
            .unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].id, second);
        assert_eq!(since[0].actor_id.as_deref(), Some("ses-a"));
        assert_eq!(since[0].target_type, Some(TargetType::WorkItem));
        assert_eq!(since[0].metadata, Some(serde_json::json!({"k": "v"})));

        let by_target = storage
            .list_events(&EventQuery {
                target_id: Some("w1".to_string()),
                ..EventQuery::default()
            })
            .unwrap();
        assert_eq!(by_target.len(), 1);

        assert_eq!(storage.latest_event_id().unwrap(), second);
    }

    #[test]
    fn test_list_events_limit() {
        let storage = Storage::open_in_memory().unwrap();
        for i in 0..5 {
            insert_event(
                storage.conn(),
                &NewEvent::new(KnownEventType::Comment, format!("e{}", i)),
            )
            .unwrap();
        }
        let limited = storage
            .list_events(&EventQuery {
                limit: Some(3),
                ..EventQuery::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 3);
        assert_eq!(limited[2].summary, "e2");
    }

    #[test]
    fn test_latest_event_id_empty_log() {
        let storage = Storage::open_in_memory().unwrap();
        assert_eq!(storage.latest_event_id().unwrap(), 0);
    }
}
