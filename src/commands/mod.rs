//! Command implementations for the Muster CLI.
//!
//! Each function parses raw CLI arguments into typed values, calls the
//! [`Engine`] and returns a result that implements [`Output`]. Commands are
//! grouped by entity:
//! - `agent_*` - session lifecycle
//! - `work_*` - work-item state machine
//! - `project_*` - project namespaces
//! - `events`, `sweep`, `config_show`, `config_set`

use crate::config::{CONFIG_FILE, MusterConfig, ResolvedConfig};
use crate::engine::Engine;
use crate::models::{
    AgentFilter, AgentSession, Event, EventQuery, Heartbeat, NewAgent, NewWorkItem, Priority,
    Project, Source, TargetType, WorkFilter, WorkItem, parse_metadata,
};
use crate::storage::{ClaimResult, DeleteResult, DeregisterSummary, HeartbeatAck, MetadataUpdate};
use crate::sweep::SweepReport;
use crate::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Command results that can be serialized to JSON or formatted for humans.
pub trait Output {
    /// Serialize to JSON string.
    fn to_json(&self) -> String;

    /// Format for human-readable output.
    fn to_human(&self) -> String;
}

fn json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|e| format!(r#"{{"error": "serialization failed: {}"}}"#, e))
}

/// Parse a comma-separated list of enum values.
fn parse_list<T: FromStr<Err = Error>>(raw: Option<&str>) -> Result<Vec<T>> {
    match raw {
        None => Ok(Vec::new()),
        Some(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect(),
    }
}

fn opt_or<'a>(value: Option<&'a str>, fallback: &'a str) -> &'a str {
    value.unwrap_or(fallback)
}

// === Agent commands ===

impl Output for AgentSession {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut lines = vec![
            format!("{} {} [{}]", self.session_id, self.agent_name, self.status),
            format!("  started:   {}", self.started_at.format("%Y-%m-%d %H:%M:%S")),
            format!("  last seen: {}", self.last_seen_at.format("%Y-%m-%d %H:%M:%S")),
        ];
        if let Some(pid) = self.pid {
            lines.push(format!("  pid:       {}", pid));
        }
        if let Some(ref parent) = self.parent_id {
            lines.push(format!("  parent:    {}", parent));
        }
        if let Some(ref project) = self.project {
            lines.push(format!("  project:   {}", project));
        }
        if let Some(ref work) = self.current_work {
            lines.push(format!("  working on: {}", work));
        }
        lines.join("\n")
    }
}

/// Register a session for the calling agent.
#[allow(clippy::too_many_arguments)]
pub fn agent_register(
    engine: &mut Engine,
    name: &str,
    pid: Option<u32>,
    parent_id: Option<String>,
    project: Option<String>,
    current_work: Option<String>,
    metadata: Option<&str>,
) -> Result<AgentSession> {
    let metadata = metadata.map(parse_metadata).transpose()?.map(Value::Object);
    engine.register_agent(NewAgent {
        agent_name: name.to_string(),
        pid,
        parent_id,
        project,
        current_work,
        metadata,
    })
}

impl Output for HeartbeatAck {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!(
            "Heartbeat recorded for {} [{}] at {}",
            self.session_id,
            self.status,
            self.last_seen_at.format("%H:%M:%S")
        )
    }
}

pub fn agent_heartbeat(
    engine: &mut Engine,
    session_id: &str,
    progress: Option<&str>,
    work_item_id: Option<&str>,
    metadata: Option<&str>,
) -> Result<HeartbeatAck> {
    engine.heartbeat(session_id, progress, work_item_id, metadata)
}

pub fn agent_idle(engine: &mut Engine, session_id: &str) -> Result<AgentSession> {
    engine.mark_idle(session_id)
}

impl Output for DeregisterSummary {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.already_ended {
            return format!("Session {} had already ended ({})", self.session_id, self.status);
        }
        let mut out = format!(
            "Deregistered {} after {}s, released {} work item(s)",
            self.session_id, self.duration_secs, self.released_count
        );
        for item in &self.released_items {
            out.push_str(&format!("\n  {}", item));
        }
        out
    }
}

pub fn agent_deregister(engine: &mut Engine, session_id: &str) -> Result<DeregisterSummary> {
    engine.deregister(session_id)
}

#[derive(Serialize)]
pub struct AgentList {
    pub agents: Vec<AgentSession>,
    pub count: usize,
}

impl Output for AgentList {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.agents.is_empty() {
            return "No agents.".to_string();
        }
        let mut lines = vec![format!("{} agent(s):", self.count)];
        for agent in &self.agents {
            lines.push(format!(
                "  {} {:<20} {:<9} {}",
                agent.session_id,
                agent.agent_name,
                agent.status.as_str(),
                agent.current_work.as_deref().unwrap_or("")
            ));
        }
        lines.join("\n")
    }
}

pub fn agent_list(
    engine: &Engine,
    status: Option<&str>,
    all: bool,
    project: Option<String>,
) -> Result<AgentList> {
    let agents = engine.list_agents(&AgentFilter {
        statuses: parse_list(status)?,
        all,
        project,
    })?;
    Ok(AgentList {
        count: agents.len(),
        agents,
    })
}

#[derive(Serialize)]
pub struct AgentDetail {
    pub agent: AgentSession,
    pub heartbeats: Vec<Heartbeat>,
    pub claimed_items: Vec<String>,
}

impl Output for AgentDetail {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut out = self.agent.to_human();
        if !self.claimed_items.is_empty() {
            out.push_str(&format!("\n  claims:    {}", self.claimed_items.join(", ")));
        }
        if !self.heartbeats.is_empty() {
            out.push_str("\n  recent heartbeats:");
            for hb in &self.heartbeats {
                out.push_str(&format!(
                    "\n    {} {}",
                    hb.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    hb.progress.as_deref().unwrap_or("-")
                ));
            }
        }
        out
    }
}

pub fn agent_show(engine: &Engine, session_id: &str, heartbeats: usize) -> Result<AgentDetail> {
    let agent = engine.get_agent(session_id)?;
    let heartbeats = engine.heartbeats_for(session_id, heartbeats)?;
    let claimed_items = engine
        .list_work_items(&WorkFilter {
            claimed_by: Some(session_id.to_string()),
            ..WorkFilter::default()
        })?
        .into_iter()
        .map(|item| item.item_id)
        .collect();
    Ok(AgentDetail {
        agent,
        heartbeats,
        claimed_items,
    })
}

// === Work commands ===

impl Output for WorkItem {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut lines = vec![format!(
            "{} [{}] {} ({})",
            self.item_id, self.priority, self.title, self.status
        )];
        if let Some(ref owner) = self.claimed_by {
            lines.push(format!("  claimed by: {}", owner));
        }
        if let Some(ref blocker) = self.blocked_by {
            lines.push(format!("  blocked by: {}", blocker));
        }
        if let Some(ref project) = self.project_id {
            lines.push(format!("  project:    {}", project));
        }
        lines.push(format!("  source:     {}", self.source));
        if let Some(ref reference) = self.source_ref {
            lines.push(format!("  reference:  {}", reference));
        }
        if let Some(ref description) = self.description {
            lines.push(String::new());
            lines.push(description.clone());
        }
        lines.join("\n")
    }
}

/// Raw arguments for `work create`.
#[derive(Debug, Clone, Default)]
pub struct CreateWork<'a> {
    pub item_id: &'a str,
    pub title: &'a str,
    pub description: Option<&'a str>,
    pub project_id: Option<&'a str>,
    pub source: Option<&'a str>,
    pub source_ref: Option<&'a str>,
    pub priority: Option<&'a str>,
    pub metadata: Option<&'a str>,
    /// Create already claimed by this session
    pub claim_as: Option<&'a str>,
}

pub fn work_create(engine: &mut Engine, args: &CreateWork<'_>) -> Result<WorkItem> {
    let draft = NewWorkItem {
        item_id: args.item_id.to_string(),
        title: args.title.to_string(),
        description: args.description.map(str::to_string),
        project_id: args.project_id.map(str::to_string),
        source: opt_or(args.source, "local").parse::<Source>()?,
        source_ref: args.source_ref.map(str::to_string),
        priority: opt_or(args.priority, "P2").parse::<Priority>()?,
        metadata: args
            .metadata
            .map(parse_metadata)
            .transpose()?
            .unwrap_or_default(),
    };
    match args.claim_as {
        Some(session_id) => engine.create_and_claim(draft, session_id),
        None => engine.create_work_item(draft),
    }
}

impl Output for ClaimResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.claimed {
            format!("Claimed {}: {}", self.item.item_id, self.item.title)
        } else {
            format!(
                "Not claimed: {} is {}{}",
                self.item.item_id,
                self.item.status,
                self.item
                    .claimed_by
                    .as_ref()
                    .map(|owner| format!(" by {}", owner))
                    .unwrap_or_default()
            )
        }
    }
}

pub fn work_claim(engine: &mut Engine, item_id: &str, session_id: &str) -> Result<ClaimResult> {
    engine.claim(item_id, session_id)
}

#[derive(Serialize)]
pub struct ClaimNext {
    pub claimed: bool,
    pub item: Option<WorkItem>,
}

impl Output for ClaimNext {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        match self.item {
            Some(ref item) => format!("Claimed {}: {}", item.item_id, item.title),
            None => "No available work items.".to_string(),
        }
    }
}

pub fn work_next(
    engine: &mut Engine,
    session_id: &str,
    project_id: Option<&str>,
) -> Result<ClaimNext> {
    let item = engine.claim_next(session_id, project_id)?;
    Ok(ClaimNext {
        claimed: item.is_some(),
        item,
    })
}

pub fn work_release(engine: &mut Engine, item_id: &str, session_id: &str) -> Result<WorkItem> {
    engine.release(item_id, session_id)
}

pub fn work_complete(engine: &mut Engine, item_id: &str, session_id: &str) -> Result<WorkItem> {
    engine.complete(item_id, session_id)
}

pub fn work_block(
    engine: &mut Engine,
    item_id: &str,
    blocked_by: Option<&str>,
    actor: Option<&str>,
) -> Result<WorkItem> {
    engine.block(item_id, blocked_by, actor)
}

pub fn work_unblock(engine: &mut Engine, item_id: &str, actor: Option<&str>) -> Result<WorkItem> {
    engine.unblock(item_id, actor)
}

impl Output for DeleteResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        match self.prior_claimant {
            Some(ref owner) => format!(
                "Deleted {} (was {}, claimed by {})",
                self.item_id, self.prior_status, owner
            ),
            None => format!("Deleted {} (was {})", self.item_id, self.prior_status),
        }
    }
}

pub fn work_delete(
    engine: &mut Engine,
    item_id: &str,
    force: bool,
    actor: Option<&str>,
) -> Result<DeleteResult> {
    engine.delete_work_item(item_id, force, actor)
}

impl Output for MetadataUpdate {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.changed_keys.is_empty() {
            format!("No metadata changes on {}", self.item_id)
        } else {
            format!(
                "Updated {} on {}",
                self.changed_keys.join(", "),
                self.item_id
            )
        }
    }
}

pub fn work_meta(
    engine: &mut Engine,
    item_id: &str,
    partial: &str,
    actor: Option<&str>,
) -> Result<MetadataUpdate> {
    engine.update_metadata(item_id, partial, actor)
}

impl Output for Event {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!(
            "#{} {} {:<20} {}",
            self.id,
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.event_type,
            self.summary
        )
    }
}

pub fn work_note(
    engine: &mut Engine,
    item_id: &str,
    event_type: &str,
    summary: &str,
    actor: Option<&str>,
    metadata: Option<&str>,
    source: Option<&str>,
) -> Result<Event> {
    let source = opt_or(source, "local").parse::<Source>()?;
    engine.append_event(item_id, event_type, summary, actor, metadata, source)
}

#[derive(Serialize)]
pub struct WorkList {
    pub items: Vec<WorkItem>,
    pub count: usize,
}

impl Output for WorkList {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.items.is_empty() {
            return "No work items.".to_string();
        }
        let mut lines = vec![format!("{} work item(s):", self.count)];
        for item in &self.items {
            lines.push(format!(
                "  {} [{}] {:<9} {}",
                item.item_id,
                item.priority,
                item.status.as_str(),
                item.title
            ));
        }
        lines.join("\n")
    }
}

pub fn work_list(
    engine: &Engine,
    status: Option<&str>,
    project_id: Option<String>,
    claimed_by: Option<String>,
) -> Result<WorkList> {
    let items = engine.list_work_items(&WorkFilter {
        statuses: parse_list(status)?,
        project_id,
        claimed_by,
    })?;
    Ok(WorkList {
        count: items.len(),
        items,
    })
}

#[derive(Serialize)]
pub struct WorkDetail {
    pub item: WorkItem,
    pub events: Vec<Event>,
}

impl Output for WorkDetail {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut out = self.item.to_human();
        if !self.events.is_empty() {
            out.push_str("\n\nHistory:");
            for event in &self.events {
                out.push_str(&format!("\n  {}", event.to_human()));
            }
        }
        out
    }
}

pub fn work_show(engine: &Engine, item_id: &str) -> Result<WorkDetail> {
    let item = engine.get_work_item(item_id)?;
    let events = engine.list_events(&EventQuery {
        target_id: Some(item_id.to_string()),
        target_type: Some(TargetType::WorkItem),
        ..EventQuery::default()
    })?;
    Ok(WorkDetail { item, events })
}

// === Project commands ===

impl Output for Project {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        match self.root_path {
            Some(ref root) => format!("{} {} ({})", self.project_id, self.name, root),
            None => format!("{} {}", self.project_id, self.name),
        }
    }
}

pub fn project_register(
    engine: &mut Engine,
    project_id: &str,
    name: &str,
    root_path: Option<&str>,
) -> Result<Project> {
    engine.register_project(project_id, name, root_path)
}

pub fn project_show(engine: &Engine, project_id: &str) -> Result<Project> {
    engine.get_project(project_id)
}

#[derive(Serialize)]
pub struct ProjectList {
    pub projects: Vec<Project>,
    pub count: usize,
}

impl Output for ProjectList {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.projects.is_empty() {
            return "No projects.".to_string();
        }
        self.projects
            .iter()
            .map(|p| p.to_human())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub fn project_list(engine: &Engine) -> Result<ProjectList> {
    let projects = engine.list_projects()?;
    Ok(ProjectList {
        count: projects.len(),
        projects,
    })
}

// === Events ===

#[derive(Serialize)]
pub struct EventList {
    pub events: Vec<Event>,
    /// Greatest event id in the store; poll again with `--since` this value
    pub latest_id: i64,
}

impl Output for EventList {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        if self.events.is_empty() {
            return "No events.".to_string();
        }
        self.events
            .iter()
            .map(|e| e.to_human())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub fn events(
    engine: &Engine,
    since_id: Option<i64>,
    target_id: Option<String>,
    target_type: Option<&str>,
    event_type: Option<String>,
    actor_id: Option<String>,
    limit: Option<usize>,
) -> Result<EventList> {
    let query = EventQuery {
        since_id,
        target_id,
        target_type: target_type.map(TargetType::from_str).transpose()?,
        event_type,
        actor_id,
        limit,
    };
    Ok(EventList {
        events: engine.list_events(&query)?,
        latest_id: engine.latest_event_id()?,
    })
}

// === Sweep ===

impl Output for SweepReport {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut lines = Vec::new();
        if self.dry_run {
            lines.push(format!("Dry run: {} candidate(s)", self.candidates.len()));
            for c in &self.candidates {
                lines.push(format!(
                    "  {} {} pid={} {:?}",
                    c.session_id,
                    c.agent_name,
                    c.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                    c.liveness
                ));
            }
            return lines.join("\n");
        }
        lines.push(format!(
            "Marked {} session(s) stale, released {} work item(s)",
            self.stale.len(),
            self.released_count()
        ));
        for s in &self.stale {
            lines.push(format!(
                "  {} {}: {}",
                s.session_id,
                s.agent_name,
                if s.released_items.is_empty() {
                    "-".to_string()
                } else {
                    s.released_items.join(", ")
                }
            ));
        }
        lines.push(format!(
            "Verified alive: {}",
            self.verified_alive.len()
        ));
        lines.push(format!("Heartbeats pruned: {}", self.heartbeats_pruned));
        lines.join("\n")
    }
}

pub fn sweep(engine: &mut Engine, dry_run: bool) -> Result<SweepReport> {
    engine.sweep(dry_run)
}

// === Config ===

#[derive(Serialize)]
pub struct ConfigShow {
    pub data_dir: PathBuf,
    pub database: PathBuf,
    pub settings: ResolvedConfig,
}

impl Output for ConfigShow {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let s = &self.settings;
        [
            format!("data dir:                 {}", self.data_dir.display()),
            format!("database:                 {}", self.database.display()),
            format!(
                "stale-threshold-secs:     {} ({})",
                s.stale_threshold_secs.value, s.stale_threshold_secs.source
            ),
            format!(
                "heartbeat-retention-days: {} ({})",
                s.heartbeat_retention_days.value, s.heartbeat_retention_days.source
            ),
            format!(
                "busy-timeout-ms:          {} ({})",
                s.busy_timeout_ms.value, s.busy_timeout_ms.source
            ),
            format!(
                "auto-sweep:               {} ({})",
                s.auto_sweep.value, s.auto_sweep.source
            ),
        ]
        .join("\n")
    }
}

pub fn config_show(data_dir: &Path, settings: ResolvedConfig) -> ConfigShow {
    ConfigShow {
        data_dir: data_dir.to_path_buf(),
        database: data_dir.join(crate::storage::DB_FILE),
        settings,
    }
}

#[derive(Debug, Serialize)]
pub struct ConfigSet {
    pub key: String,
    pub value: Value,
    pub path: PathBuf,
}

impl Output for ConfigSet {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!("Set {} = {} in {}", self.key, self.value, self.path.display())
    }
}

fn positive(key: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| Error::InvalidInput(format!("{} must be a positive integer", key)))
}

/// Write one key to `<data-dir>/config.kdl`, keeping the others.
pub fn config_set(data_dir: &Path, key: &str, value: &str) -> Result<ConfigSet> {
    let path = data_dir.join(CONFIG_FILE);
    let mut config = MusterConfig::load(&path)?;

    let stored = match key {
        "stale-threshold-secs" => {
            let v = positive(key, value)?;
            config.stale_threshold_secs = Some(v);
            Value::from(v)
        }
        "heartbeat-retention-days" => {
            let v = positive(key, value)?;
            config.heartbeat_retention_days = Some(v);
            Value::from(v)
        }
        "busy-timeout-ms" => {
            let v = positive(key, value)?;
            config.busy_timeout_ms = Some(v);
            Value::from(v)
        }
        "auto-sweep" => {
            let v = match value.trim() {
                "true" | "#true" => true,
                "false" | "#false" => false,
                _ => {
                    return Err(Error::InvalidInput(
                        "auto-sweep must be true or false".to_string(),
                    ));
                }
            };
            config.auto_sweep = Some(v);
            Value::from(v)
        }
        other => {
            return Err(Error::InvalidInput(format!(
                "Unknown config key: {} (expected stale-threshold-secs, heartbeat-retention-days, busy-timeout-ms or auto-sweep)",
                other
            )));
        }
    };

    config.validate()?;
    config.save(&path)?;
    Ok(ConfigSet {
        key: key.to_string(),
        value: stored,
        path,
    })
}
