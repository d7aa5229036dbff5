//! Data models for Muster entities.
//!
//! This module defines the core data structures:
//! - `AgentSession` - One live or historical agent process holding leases
//! - `WorkItem` - A unit of work moving through the claim state machine
//! - `Event` - One immutable audit record in the event log
//! - `Heartbeat` - A timestamped liveness/progress record for a session
//! - `Project` - A lightweight namespace for agents and work items

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Structured metadata attached to work items (always a JSON object).
pub type Metadata = Map<String, Value>;

/// Agent session status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Active,
    Idle,
    /// Terminal, reached through deregistration
    Completed,
    /// Terminal, reached through the stale sweep
    Stale,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Active => "active",
            AgentStatus::Idle => "idle",
            AgentStatus::Completed => "completed",
            AgentStatus::Stale => "stale",
        }
    }

    /// Whether the session still holds (or may acquire) leases.
    pub fn is_live(&self) -> bool {
        matches!(self, AgentStatus::Active | AgentStatus::Idle)
    }
}

impl FromStr for AgentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "active" => Ok(AgentStatus::Active),
            "idle" => Ok(AgentStatus::Idle),
            "completed" => Ok(AgentStatus::Completed),
            "stale" => Ok(AgentStatus::Stale),
            _ => Err(Error::InvalidInput(format!("Invalid agent status: {}", s))),
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Work item status in the claim state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    #[default]
    Available,
    Claimed,
    /// Terminal
    Completed,
    Blocked,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Available => "available",
            WorkStatus::Claimed => "claimed",
            WorkStatus::Completed => "completed",
            WorkStatus::Blocked => "blocked",
        }
    }
}

impl FromStr for WorkStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "available" => Ok(WorkStatus::Available),
            "claimed" => Ok(WorkStatus::Claimed),
            "completed" => Ok(WorkStatus::Completed),
            "blocked" => Ok(WorkStatus::Blocked),
            _ => Err(Error::InvalidInput(format!("Invalid work status: {}", s))),
        }
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Work item priority. P1 is the most urgent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    P1,
    #[default]
    P2,
    P3,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::P1 => "P1",
            Priority::P2 => "P2",
            Priority::P3 => "P3",
        }
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "P1" | "1" => Ok(Priority::P1),
            "P2" | "2" => Ok(Priority::P2),
            "P3" | "3" => Ok(Priority::P3),
            _ => Err(Error::InvalidInput(format!(
                "Invalid priority: {} (expected P1, P2 or P3)",
                s
            ))),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Provenance of a work item. Drives the content-filter trust policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Imported from GitHub; untrusted text
    Github,
    #[default]
    Local,
    Operator,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Github => "github",
            Source::Local => "local",
            Source::Operator => "operator",
        }
    }

    /// Sources whose text bypasses the content filter.
    pub fn is_trusted(&self) -> bool {
        matches!(self, Source::Local | Source::Operator)
    }
}

impl FromStr for Source {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" => Err(Error::InvalidInput("Source must not be empty".to_string())),
            "github" => Ok(Source::Github),
            "local" => Ok(Source::Local),
            "operator" => Ok(Source::Operator),
            other => Err(Error::InvalidInput(format!(
                "Invalid source: {} (expected github, local or operator)",
                other
            ))),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of entity an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Agent,
    WorkItem,
    Project,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Agent => "agent",
            TargetType::WorkItem => "work_item",
            TargetType::Project => "project",
        }
    }
}

impl FromStr for TargetType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "agent" => Ok(TargetType::Agent),
            "work_item" | "work-item" | "item" => Ok(TargetType::WorkItem),
            "project" => Ok(TargetType::Project),
            _ => Err(Error::InvalidInput(format!("Invalid target type: {}", s))),
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Event types the engine knows about.
///
/// The log itself stores event types as free-form strings. This closed set
/// is only enforced when a caller appends an arbitrary event to a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KnownEventType {
    AgentRegistered,
    AgentDeregistered,
    AgentIdle,
    AgentStale,
    HeartbeatReceived,
    StaleLocksReleased,
    WorkCreated,
    WorkClaimed,
    WorkReleased,
    WorkCompleted,
    WorkBlocked,
    WorkUnblocked,
    WorkDeleted,
    MetadataUpdated,
    ProjectRegistered,
    Comment,
    ProgressNote,
    ReviewRequested,
    ExternalUpdate,
}

impl KnownEventType {
    pub const ALL: &'static [KnownEventType] = &[
        KnownEventType::AgentRegistered,
        KnownEventType::AgentDeregistered,
        KnownEventType::AgentIdle,
        KnownEventType::AgentStale,
        KnownEventType::HeartbeatReceived,
        KnownEventType::StaleLocksReleased,
        KnownEventType::WorkCreated,
        KnownEventType::WorkClaimed,
        KnownEventType::WorkReleased,
        KnownEventType::WorkCompleted,
        KnownEventType::WorkBlocked,
        KnownEventType::WorkUnblocked,
        KnownEventType::WorkDeleted,
        KnownEventType::MetadataUpdated,
        KnownEventType::ProjectRegistered,
        KnownEventType::Comment,
        KnownEventType::ProgressNote,
        KnownEventType::ReviewRequested,
        KnownEventType::ExternalUpdate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            KnownEventType::AgentRegistered => "agent_registered",
            KnownEventType::AgentDeregistered => "agent_deregistered",
            KnownEventType::AgentIdle => "agent_idle",
            KnownEventType::AgentStale => "agent_stale",
            KnownEventType::HeartbeatReceived => "heartbeat_received",
            KnownEventType::StaleLocksReleased => "stale_locks_released",
            KnownEventType::WorkCreated => "work_created",
            KnownEventType::WorkClaimed => "work_claimed",
            KnownEventType::WorkReleased => "work_released",
            KnownEventType::WorkCompleted => "work_completed",
            KnownEventType::WorkBlocked => "work_blocked",
            KnownEventType::WorkUnblocked => "work_unblocked",
            KnownEventType::WorkDeleted => "work_deleted",
            KnownEventType::MetadataUpdated => "metadata_updated",
            KnownEventType::ProjectRegistered => "project_registered",
            KnownEventType::Comment => "comment",
            KnownEventType::ProgressNote => "progress_note",
            KnownEventType::ReviewRequested => "review_requested",
            KnownEventType::ExternalUpdate => "external_update",
        }
    }
}

impl FromStr for KnownEventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        KnownEventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown event type: {}", s)))
    }
}

impl fmt::Display for KnownEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One live or historical agent process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSession {
    /// Opaque, engine-generated identifier (e.g., "ses-3f2a...")
    pub session_id: String,

    /// Display name
    pub agent_name: String,

    /// OS process id used by the liveness probe
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,

    /// Session that delegated work to this one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,

    /// Free-text note of what the agent is doing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_work: Option<String>,

    pub status: AgentStatus,

    pub started_at: DateTime<Utc>,

    /// Last contact; only ever moves forward
    pub last_seen_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Registration request for a new agent session.
#[derive(Debug, Clone, Default)]
pub struct NewAgent {
    pub agent_name: String,
    pub pid: Option<u32>,
    pub parent_id: Option<String>,
    pub project: Option<String>,
    pub current_work: Option<String>,
    pub metadata: Option<Value>,
}

/// A unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Caller-supplied identifier
    pub item_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,

    pub title: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub source: Source,

    /// External reference (e.g., an issue URL)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,

    pub status: WorkStatus,

    pub priority: Priority,

    /// Claiming session; survives a block so the claimant can resume
    pub claimed_by: Option<String>,

    pub claimed_at: Option<DateTime<Utc>>,

    pub completed_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub metadata: Metadata,
}

/// Creation request for a work item.
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    pub item_id: String,
    pub title: String,
    pub description: Option<String>,
    pub project_id: Option<String>,
    pub source: Source,
    pub source_ref: Option<String>,
    pub priority: Priority,
    pub metadata: Metadata,
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Monotonically increasing identifier
    pub id: i64,

    pub timestamp: DateTime<Utc>,

    /// Free-form event type; see [`KnownEventType`] for the engine's own set
    pub event_type: String,

    /// Acting session, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_type: Option<TargetType>,

    pub summary: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// A liveness/progress record for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub id: i64,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_item_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// A namespace for agents and work items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub project_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Filter for listing agent sessions.
///
/// By default only live (active/idle) sessions are returned.
#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    /// Explicit status allow-list; overrides the default live-only view
    pub statuses: Vec<AgentStatus>,
    /// Return every session regardless of status
    pub all: bool,
    pub project: Option<String>,
}

/// Filter for listing work items.
#[derive(Debug, Clone, Default)]
pub struct WorkFilter {
    pub statuses: Vec<WorkStatus>,
    pub project_id: Option<String>,
    pub claimed_by: Option<String>,
}

/// Query over the event log.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    /// Only events with an id strictly greater than this
    pub since_id: Option<i64>,
    pub target_id: Option<String>,
    pub target_type: Option<TargetType>,
    pub event_type: Option<String>,
    pub actor_id: Option<String>,
    pub limit: Option<usize>,
}

/// Parse caller-supplied metadata text into a JSON object.
pub fn parse_metadata(raw: &str) -> Result<Metadata> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(Error::InvalidMetadata(format!(
            "expected a JSON object, got {}",
            json_type_name(&other)
        ))),
        Err(e) => Err(Error::InvalidMetadata(e.to_string())),
    }
}

/// Parse caller-supplied metadata text into any well-formed JSON value.
pub fn parse_metadata_value(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|e| Error::InvalidMetadata(e.to_string()))
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Validate a caller-supplied work item identifier.
pub fn validate_item_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidInput("Work item ID must not be empty".to_string()));
    }
    if id.len() > 128 {
        return Err(Error::InvalidInput(format!(
            "Work item ID must be at most 128 characters, got {}",
            id.len()
        )));
    }
    if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::InvalidInput(format!(
            "Work item ID must not contain whitespace: {:?}",
            id
        )));
    }
    Ok(())
}
