//! Work-item claim state machine.
//!
//! ```text
//!   create ──► available ──claim──► claimed ──complete──► completed
//!                  ▲                   │
//!                  └─────release───────┘
//!   block: any non-completed ──► blocked (claim preserved)
//!   unblock: blocked ──► claimed if the claim survived, else available
//! ```
//!
//! The claim transition is a single conditional `UPDATE ... WHERE status =
//! 'available'`; its affected-row count decides the winner. Losing a race is
//! reported as `claimed = false`, never as an error.

use super::agents::require_agent;
use super::events::{NewEvent, insert_event, load_event};
use super::projects::load_project;
use super::{Storage, fmt_ts, query_opt, ts_col, ts_col_opt};
use crate::models::{
    Event, KnownEventType, Metadata, NewWorkItem, WorkFilter, WorkItem, WorkStatus,
    validate_item_id,
};
use crate::{Error, Result};
use chrono::Utc;
use rusqlite::{Connection, Row, params};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

const ITEM_COLUMNS: &str = "item_id, project_id, title, description, source, source_ref, status, \
                            priority, claimed_by, claimed_at, completed_at, blocked_by, \
                            created_at, metadata";

/// Outcome of a claim attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimResult {
    /// True only for the caller whose conditional update took effect
    pub claimed: bool,
    /// Item state after the attempt
    pub item: WorkItem,
}

/// Outcome of a delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteResult {
    pub item_id: String,
    pub prior_status: WorkStatus,
    pub prior_claimant: Option<String>,
    /// Heartbeat rows whose work-item reference was cleared
    pub heartbeats_detached: usize,
}

/// Outcome of a metadata merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataUpdate {
    pub item_id: String,
    pub changed_keys: Vec<String>,
    pub metadata: Metadata,
}

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<WorkItem> {
    let raw_metadata: String = row.get("metadata")?;
    let metadata: Metadata = serde_json::from_str(&raw_metadata).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(WorkItem {
        item_id: row.get("item_id")?,
        project_id: row.get("project_id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        source: row.get("source")?,
        source_ref: row.get("source_ref")?,
        status: row.get("status")?,
        priority: row.get("priority")?,
        claimed_by: row.get("claimed_by")?,
        claimed_at: ts_col_opt(row, "claimed_at")?,
        completed_at: ts_col_opt(row, "completed_at")?,
        blocked_by: row.get("blocked_by")?,
        created_at: ts_col(row, "created_at")?,
        metadata,
    })
}

fn load_item(conn: &Connection, item_id: &str) -> Result<Option<WorkItem>> {
    query_opt(
        conn,
        &format!("SELECT {} FROM work_items WHERE item_id = ?1", ITEM_COLUMNS),
        params![item_id],
        row_to_item,
    )
}

fn require_item(conn: &Connection, item_id: &str) -> Result<WorkItem> {
    load_item(conn, item_id)?.ok_or_else(|| Error::ItemNotFound(item_id.to_string()))
}

/// The claiming session must exist and still hold a live lease.
fn require_live_agent(conn: &Connection, session_id: &str) -> Result<()> {
    let agent = require_agent(conn, session_id)?;
    if !agent.status.is_live() {
        return Err(Error::AgentInactive {
            session: session_id.to_string(),
            status: agent.status.to_string(),
        });
    }
    Ok(())
}

/// Ownership precondition shared by release and complete.
fn require_owned(item: &WorkItem, session_id: &str) -> Result<()> {
    if item.status == WorkStatus::Completed {
        return Err(Error::AlreadyCompleted(item.item_id.clone()));
    }
    match (&item.status, &item.claimed_by) {
        (WorkStatus::Claimed, Some(owner)) if owner == session_id => Ok(()),
        (WorkStatus::Claimed, Some(owner)) => Err(Error::NotClaimedBySession {
            item: item.item_id.clone(),
            session: session_id.to_string(),
            owner: owner.clone(),
        }),
        _ => Err(Error::NotClaimed(item.item_id.clone())),
    }
}

/// Shallow merge: keys in `partial` win. Returns the keys whose value changed.
fn merge_metadata(target: &mut Metadata, partial: &Metadata) -> Vec<String> {
    let mut changed = Vec::new();
    for (key, value) in partial {
        if target.get(key) != Some(value) {
            target.insert(key.clone(), value.clone());
            changed.push(key.clone());
        }
    }
    changed
}

fn store_metadata(conn: &Connection, item_id: &str, metadata: &Metadata) -> Result<()> {
    conn.execute(
        "UPDATE work_items SET metadata = ?2 WHERE item_id = ?1",
        params![item_id, serde_json::to_string(metadata)?],
    )?;
    Ok(())
}

/// Attempt the available -> claimed transition. True if this call won.
fn try_claim(conn: &Connection, item_id: &str, session_id: &str) -> Result<bool> {
    let changes = conn.execute(
        "UPDATE work_items
         SET status = 'claimed', claimed_by = ?2, claimed_at = ?3
         WHERE item_id = ?1 AND status = 'available'",
        params![item_id, session_id, fmt_ts(Utc::now())],
    )?;
    Ok(changes == 1)
}

fn claimed_event<'a>(item: &WorkItem, session_id: &'a str, item_id: &'a str) -> NewEvent<'a> {
    NewEvent::new(
        KnownEventType::WorkClaimed,
        format!("Claimed {}: {}", item.item_id, item.title),
    )
    .actor(session_id)
    .work_item(item_id)
}

impl Storage {
    fn insert_item(&mut self, new: &NewWorkItem, claimant: Option<&str>) -> Result<WorkItem> {
        validate_item_id(&new.item_id)?;
        if new.title.trim().is_empty() {
            return Err(Error::InvalidInput("Title must not be empty".to_string()));
        }
        let metadata = serde_json::to_string(&new.metadata)?;
        let now = fmt_ts(Utc::now());

        let tx = self.write_tx()?;

        if load_item(&tx, &new.item_id)?.is_some() {
            return Err(Error::ItemExists(new.item_id.clone()));
        }
        if let Some(ref project_id) = new.project_id {
            if load_project(&tx, project_id)?.is_none() {
                return Err(Error::ProjectNotFound(project_id.clone()));
            }
        }
        if let Some(session_id) = claimant {
            require_live_agent(&tx, session_id)?;
        }

        let status = if claimant.is_some() {
            WorkStatus::Claimed
        } else {
            WorkStatus::Available
        };
        let claimed_at = claimant.map(|_| now.clone());

        tx.execute(
            "INSERT INTO work_items (item_id, project_id, title, description, source, source_ref,
                                     status, priority, claimed_by, claimed_at, created_at, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                new.item_id,
                new.project_id,
                new.title,
                new.description,
                new.source,
                new.source_ref,
                status,
                new.priority,
                claimant,
                claimed_at,
                now,
                metadata,
            ],
        )?;

        let mut created = NewEvent::new(
            KnownEventType::WorkCreated,
            format!("Created {} [{}]: {}", new.item_id, new.priority, new.title),
        )
        .work_item(&new.item_id)
        .metadata(json!({
            "source": new.source,
            "source_ref": new.source_ref,
            "project_id": new.project_id,
            "priority": new.priority,
        }));
        if let Some(session_id) = claimant {
            created = created.actor(session_id);
        }
        insert_event(&tx, &created)?;

        let item = require_item(&tx, &new.item_id)?;
        if let Some(session_id) = claimant {
            insert_event(&tx, &claimed_event(&item, session_id, &new.item_id))?;
        }
        tx.commit()?;

        tracing::debug!(item_id = %item.item_id, status = %item.status, "created work item");
        Ok(item)
    }

    /// Create an available work item.
    pub fn create_work_item(&mut self, new: &NewWorkItem) -> Result<WorkItem> {
        self.insert_item(new, None)
    }

    /// Create a work item already claimed by `session_id`.
    ///
    /// The item is never observable in the `available` state.
    pub fn create_and_claim(&mut self, new: &NewWorkItem, session_id: &str) -> Result<WorkItem> {
        self.insert_item(new, Some(session_id))
    }

    /// Attempt to claim an item for a session.
    ///
    /// Returns `claimed = false` without an event when the item was not
    /// available, including when another session won a concurrent race.
    pub fn claim(&mut self, item_id: &str, session_id: &str) -> Result<ClaimResult> {
        let tx = self.write_tx()?;

        require_live_agent(&tx, session_id)?;
        require_item(&tx, item_id)?;

        let claimed = try_claim(&tx, item_id, session_id)?;
        let item = require_item(&tx, item_id)?;
        if claimed {
            insert_event(&tx, &claimed_event(&item, session_id, item_id))?;
        }
        tx.commit()?;

        if claimed {
            tracing::debug!(item_id, session_id, "claimed work item");
        }
        Ok(ClaimResult { claimed, item })
    }

    /// Claim the highest-priority available item, optionally within a project.
    ///
    /// Candidates are tried in priority then creation order; returns `None`
    /// when there is nothing left to claim.
    pub fn claim_next(
        &mut self,
        session_id: &str,
        project_id: Option<&str>,
    ) -> Result<Option<WorkItem>> {
        let tx = self.write_tx()?;
        require_live_agent(&tx, session_id)?;

        let candidates: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT item_id FROM work_items
                 WHERE status = 'available' AND (?1 IS NULL OR project_id = ?1)
                 ORDER BY priority ASC, created_at ASC, item_id ASC",
            )?;
            stmt.query_map(params![project_id], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };

        for item_id in &candidates {
            if try_claim(&tx, item_id, session_id)? {
                let item = require_item(&tx, item_id)?;
                insert_event(&tx, &claimed_event(&item, session_id, item_id))?;
                tx.commit()?;
                tracing::debug!(item_id = %item_id, session_id, "claimed next work item");
                return Ok(Some(item));
            }
        }

        Ok(None)
    }

    /// Return a claimed item to the pool. Only the claimant may release.
    pub fn release(&mut self, item_id: &str, session_id: &str) -> Result<WorkItem> {
        let tx = self.write_tx()?;

        let item = require_item(&tx, item_id)?;
        require_owned(&item, session_id)?;

        tx.execute(
            "UPDATE work_items SET status = 'available', claimed_by = NULL, claimed_at = NULL
             WHERE item_id = ?1 AND status = 'claimed' AND claimed_by = ?2",
            params![item_id, session_id],
        )?;
        insert_event(
            &tx,
            &NewEvent::new(
                KnownEventType::WorkReleased,
                format!("Released {}: {}", item.item_id, item.title),
            )
            .actor(session_id)
            .work_item(item_id),
        )?;

        let updated = require_item(&tx, item_id)?;
        tx.commit()?;
        tracing::debug!(item_id, session_id, "released work item");
        Ok(updated)
    }

    /// Mark a claimed item completed. Only the claimant may complete; terminal.
    pub fn complete(&mut self, item_id: &str, session_id: &str) -> Result<WorkItem> {
        let tx = self.write_tx()?;

        let item = require_item(&tx, item_id)?;
        require_owned(&item, session_id)?;

        tx.execute(
            "UPDATE work_items
             SET status = 'completed', completed_at = ?3, claimed_by = NULL, claimed_at = NULL
             WHERE item_id = ?1 AND status = 'claimed' AND claimed_by = ?2",
            params![item_id, session_id, fmt_ts(Utc::now())],
        )?;
        insert_event(
            &tx,
            &NewEvent::new(
                KnownEventType::WorkCompleted,
                format!("Completed {}: {}", item.item_id, item.title),
            )
            .actor(session_id)
            .work_item(item_id),
        )?;

        let updated = require_item(&tx, item_id)?;
        tx.commit()?;
        tracing::debug!(item_id, session_id, "completed work item");
        Ok(updated)
    }

    /// Block an item. Any existing claim is kept for when it is unblocked.
    pub fn block(
        &mut self,
        item_id: &str,
        blocked_by: Option<&str>,
        actor: Option<&str>,
    ) -> Result<WorkItem> {
        let tx = self.write_tx()?;

        let item = require_item(&tx, item_id)?;
        if item.status == WorkStatus::Completed {
            return Err(Error::AlreadyCompleted(item_id.to_string()));
        }

        tx.execute(
            "UPDATE work_items SET status = 'blocked', blocked_by = ?2 WHERE item_id = ?1",
            params![item_id, blocked_by],
        )?;

        let summary = match blocked_by {
            Some(reason) => format!("Blocked {} by {}", item_id, reason),
            None => format!("Blocked {}", item_id),
        };
        let mut event = NewEvent::new(KnownEventType::WorkBlocked, summary)
            .work_item(item_id)
            .metadata(json!({
                "prior_status": item.status,
                "blocked_by": blocked_by,
                "claimed_by": item.claimed_by,
            }));
        if let Some(actor) = actor {
            event = event.actor(actor);
        }
        insert_event(&tx, &event)?;

        let updated = require_item(&tx, item_id)?;
        tx.commit()?;
        tracing::debug!(item_id, "blocked work item");
        Ok(updated)
    }

    /// Lift a block, restoring the surviving claim if there is one.
    pub fn unblock(&mut self, item_id: &str, actor: Option<&str>) -> Result<WorkItem> {
        let tx = self.write_tx()?;

        let item = require_item(&tx, item_id)?;
        if item.status != WorkStatus::Blocked {
            return Err(Error::NotBlocked(item_id.to_string()));
        }

        tx.execute(
            "UPDATE work_items
             SET status = CASE WHEN claimed_by IS NOT NULL THEN 'claimed' ELSE 'available' END,
                 blocked_by = NULL
             WHERE item_id = ?1",
            params![item_id],
        )?;

        let updated = require_item(&tx, item_id)?;
        let mut event = NewEvent::new(
            KnownEventType::WorkUnblocked,
            format!("Unblocked {} ({})", item_id, updated.status),
        )
        .work_item(item_id)
        .metadata(json!({
            "status": updated.status,
            "claimed_by": updated.claimed_by,
        }));
        if let Some(actor) = actor {
            event = event.actor(actor);
        }
        insert_event(&tx, &event)?;
        tx.commit()?;

        tracing::debug!(item_id, status = %updated.status, "unblocked work item");
        Ok(updated)
    }

    /// Delete an item. Items with a claimant require `force`.
    pub fn delete_work_item(
        &mut self,
        item_id: &str,
        force: bool,
        actor: Option<&str>,
    ) -> Result<DeleteResult> {
        let tx = self.write_tx()?;

        let item = require_item(&tx, item_id)?;
        if let Some(ref owner) = item.claimed_by {
            if !force {
                return Err(Error::ItemClaimed {
                    item: item_id.to_string(),
                    owner: owner.clone(),
                });
            }
        }

        let heartbeats_detached = tx.execute(
            "UPDATE heartbeats SET work_item_id = NULL WHERE work_item_id = ?1",
            params![item_id],
        )?;
        tx.execute("DELETE FROM work_items WHERE item_id = ?1", params![item_id])?;

        let summary = match item.claimed_by {
            Some(ref owner) => format!(
                "Deleted {} (was {}, claimed by {}): {}",
                item_id, item.status, owner, item.title
            ),
            None => format!("Deleted {} (was {}): {}", item_id, item.status, item.title),
        };
        let mut event = NewEvent::new(KnownEventType::WorkDeleted, summary)
            .work_item(item_id)
            .metadata(json!({
                "prior_status": item.status,
                "prior_claimant": item.claimed_by,
                "title": item.title,
                "forced": force,
            }));
        if let Some(actor) = actor {
            event = event.actor(actor);
        }
        insert_event(&tx, &event)?;
        tx.commit()?;

        tracing::debug!(item_id, force, "deleted work item");
        Ok(DeleteResult {
            item_id: item_id.to_string(),
            prior_status: item.status,
            prior_claimant: item.claimed_by,
            heartbeats_detached,
        })
    }

    /// Shallow-merge `partial` into the item's metadata.
    ///
    /// Emits `metadata_updated` only when at least one key changed.
    pub fn update_metadata(
        &mut self,
        item_id: &str,
        partial: &Metadata,
        actor: Option<&str>,
    ) -> Result<MetadataUpdate> {
        let tx = self.write_tx()?;

        let mut item = require_item(&tx, item_id)?;
        let changed_keys = merge_metadata(&mut item.metadata, partial);

        if !changed_keys.is_empty() {
            store_metadata(&tx, item_id, &item.metadata)?;
            let mut event = NewEvent::new(
                KnownEventType::MetadataUpdated,
                format!("Updated metadata on {}: {}", item_id, changed_keys.join(", ")),
            )
            .work_item(item_id)
            .metadata(json!({ "changed_keys": changed_keys }));
            if let Some(actor) = actor {
                event = event.actor(actor);
            }
            insert_event(&tx, &event)?;
        }
        tx.commit()?;

        Ok(MetadataUpdate {
            item_id: item_id.to_string(),
            changed_keys,
            metadata: item.metadata,
        })
    }

    /// Annotate an item's timeline without changing its status.
    ///
    /// `item_flags`, when given, is merged into the item's metadata in the
    /// same transaction (used for review markers).
    pub fn append_work_event(
        &mut self,
        item_id: &str,
        event_type: KnownEventType,
        summary: &str,
        actor: Option<&str>,
        metadata: Option<Value>,
        item_flags: Option<&Metadata>,
    ) -> Result<Event> {
        if summary.trim().is_empty() {
            return Err(Error::InvalidInput("Summary must not be empty".to_string()));
        }
        let tx = self.write_tx()?;

        let mut item = require_item(&tx, item_id)?;
        if let Some(flags) = item_flags {
            if !merge_metadata(&mut item.metadata, flags).is_empty() {
                store_metadata(&tx, item_id, &item.metadata)?;
            }
        }

        let mut event = NewEvent::new(event_type, summary).work_item(item_id);
        if let Some(actor) = actor {
            event = event.actor(actor);
        }
        if let Some(metadata) = metadata {
            event = event.metadata(metadata);
        }
        let id = insert_event(&tx, &event)?;
        let stored = load_event(&tx, id)?
            .ok_or(Error::Database(rusqlite::Error::QueryReturnedNoRows))?;
        tx.commit()?;
        Ok(stored)
    }

    /// Get a work item by ID.
    pub fn get_work_item(&self, item_id: &str) -> Result<WorkItem> {
        require_item(&self.conn, item_id)
    }

    /// List work items ordered by priority (P1 first) then creation time.
    pub fn list_work_items(&self, filter: &WorkFilter) -> Result<Vec<WorkItem>> {
        let mut sql = format!("SELECT {} FROM work_items WHERE 1=1", ITEM_COLUMNS);
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if !filter.statuses.is_empty() {
            let placeholders = vec!["?"; filter.statuses.len()].join(", ");
            sql.push_str(&format!(" AND status IN ({})", placeholders));
            for status in &filter.statuses {
                params_vec.push(Box::new(*status));
            }
        }
        if let Some(ref project_id) = filter.project_id {
            sql.push_str(" AND project_id = ?");
            params_vec.push(Box::new(project_id.clone()));
        }
        if let Some(ref claimed_by) = filter.claimed_by {
            sql.push_str(" AND claimed_by = ?");
            params_vec.push(Box::new(claimed_by.clone()));
        }

        sql.push_str(" ORDER BY priority ASC, created_at ASC, item_id ASC");

        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|p| p.as_ref()).collect();

        let mut stmt = self.conn.prepare(&sql)?;
        let items = stmt
            .query_map(params_refs.as_slice(), row_to_item)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items)
    }
}
