//! Muster - lease and work-item coordination for concurrently running agents.
//!
//! Independent agent processes share a pool of work items through a single
//! SQLite store. This library provides the coordination engine behind the
//! `muster` CLI: agent session leases, the work-item claim state machine,
//! the stale-lease sweep, and the append-only event log.

pub mod cli;
pub mod commands;
pub mod config;
pub mod engine;
pub mod guard;
pub mod models;
pub mod storage;
pub mod sweep;
pub mod sys;

pub use engine::Engine;


/// Coarse failure categories exposed to CLI and HTTP collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidInput,
    PreconditionFailed,
    ContentBlocked,
    SchemaTooNew,
    Internal,
}

impl ErrorKind {
    /// Stable string form used in structured error envelopes.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::PreconditionFailed => "precondition_failed",
            ErrorKind::ContentBlocked => "content_blocked",
            ErrorKind::SchemaTooNew => "schema_too_new",
            ErrorKind::Internal => "internal",
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::Internal => 1,
            ErrorKind::InvalidInput => 2,
            ErrorKind::NotFound => 3,
            ErrorKind::AlreadyExists => 4,
            ErrorKind::PreconditionFailed => 5,
            ErrorKind::ContentBlocked => 6,
            ErrorKind::SchemaTooNew => 7,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Library-level error type for Muster operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Agent session not found: {0}")]
    AgentNotFound(String),

    #[error("Work item not found: {0}")]
    ItemNotFound(String),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Work item already exists: {0}")]
    ItemExists(String),

    #[error("Project {0} is already registered with different attributes")]
    ProjectConflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("Work item {0} is not claimed")]
    NotClaimed(String),

    #[error("Work item {item} is claimed by {owner}, not {session}")]
    NotClaimedBySession {
        item: String,
        session: String,
        owner: String,
    },

    #[error("Work item {0} is already completed")]
    AlreadyCompleted(String),

    #[error("Work item {item} is claimed by {owner}; pass force to delete it")]
    ItemClaimed { item: String, owner: String },

    #[error("Work item {0} is not blocked")]
    NotBlocked(String),

    #[error("Agent session {session} is {status}")]
    AgentInactive { session: String, status: String },

    #[error("Content blocked: {0}")]
    ContentBlocked(String),

    #[error("Store schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i64, supported: i64 },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Collapse this error onto its caller-facing category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::AgentNotFound(_) | Error::ItemNotFound(_) | Error::ProjectNotFound(_) => {
                ErrorKind::NotFound
            }
            Error::ItemExists(_) | Error::ProjectConflict(_) => ErrorKind::AlreadyExists,
            Error::InvalidInput(_) | Error::InvalidMetadata(_) | Error::Config(_) => {
                ErrorKind::InvalidInput
            }
            Error::NotClaimed(_)
            | Error::NotClaimedBySession { .. }
            | Error::AlreadyCompleted(_)
            | Error::ItemClaimed { .. }
            | Error::NotBlocked(_)
            | Error::AgentInactive { .. } => ErrorKind::PreconditionFailed,
            Error::ContentBlocked(_) => ErrorKind::ContentBlocked,
            Error::SchemaTooNew { .. } => ErrorKind::SchemaTooNew,
            Error::Io(_) | Error::Json(_) | Error::Database(_) => ErrorKind::Internal,
        }
    }
}

/// Result type alias for Muster operations.
pub type Result<T> = std::result::Result<T, Error>;
