//! Project namespaces.

use super::events::{NewEvent, insert_event};
use super::{Storage, fmt_ts, query_opt, ts_col};
use crate::models::{KnownEventType, Project};
use crate::{Error, Result};
use chrono::Utc;
use rusqlite::{Connection, Row, params};

fn row_to_project(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        project_id: row.get("project_id")?,
        name: row.get("name")?,
        root_path: row.get("root_path")?,
        created_at: ts_col(row, "created_at")?,
    })
}

pub(crate) fn load_project(conn: &Connection, project_id: &str) -> Result<Option<Project>> {
    query_opt(
        conn,
        "SELECT project_id, name, root_path, created_at FROM projects WHERE project_id = ?1",
        params![project_id],
        row_to_project,
    )
}

impl Storage {
    /// Register a project.
    ///
    /// Idempotent by identifier: registering the same id with the same name
    /// and root path returns the existing row without emitting an event.
    /// Different attributes fail with [`Error::ProjectConflict`].
    pub fn register_project(
        &mut self,
        project_id: &str,
        name: &str,
        root_path: Option<&str>,
    ) -> Result<Project> {
        if project_id.trim().is_empty() {
            return Err(Error::InvalidInput("Project ID must not be empty".to_string()));
        }
        if name.trim().is_empty() {
            return Err(Error::InvalidInput("Project name must not be empty".to_string()));
        }

        let tx = self.write_tx()?;

        if let Some(existing) = load_project(&tx, project_id)? {
            if existing.name == name && existing.root_path.as_deref() == root_path {
                return Ok(existing);
            }
            return Err(Error::ProjectConflict(project_id.to_string()));
        }

        tx.execute(
            "INSERT INTO projects (project_id, name, root_path, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![project_id, name, root_path, fmt_ts(Utc::now())],
        )?;
        insert_event(
            &tx,
            &NewEvent::new(
                KnownEventType::ProjectRegistered,
                format!("Project {} registered as \"{}\"", project_id, name),
            )
            .project(project_id),
        )?;

        let project = load_project(&tx, project_id)?
            .ok_or_else(|| Error::ProjectNotFound(project_id.to_string()))?;
        tx.commit()?;

        tracing::debug!(project_id, "registered project");
        Ok(project)
    }

    /// Get a project by ID.
    pub fn get_project(&self, project_id: &str) -> Result<Project> {
        load_project(&self.conn, project_id)?
            .ok_or_else(|| Error::ProjectNotFound(project_id.to_string()))
    }

    /// List all projects ordered by ID.
    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self.conn.prepare(
            "SELECT project_id, name, root_path, created_at FROM projects ORDER BY project_id",
        )?;
        let projects = stmt
            .query_map([], row_to_project)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(projects)
    }
}
