//! CLI argument definitions for Muster.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Environment variable naming the caller's session, used when `--session`
/// is omitted.
pub const SESSION_ENV: &str = "MUSTER_SESSION_ID";

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("MUSTER_GIT_COMMIT"),
    " built ",
    env!("MUSTER_BUILD_TIMESTAMP"),
    ")"
);

/// Muster - lease and work-item coordination for concurrently running agents.
///
/// Register with `muster agent register`, then `muster work next` to claim work.
#[derive(Parser, Debug)]
#[command(name = "muster")]
#[command(author, version, long_version = LONG_VERSION, about = "Lease and work-item coordination for concurrently running agents", long_about = None)]
pub struct Cli {
    /// Output in human-readable format instead of JSON
    #[arg(short = 'H', long = "human", global = true)]
    pub human_readable: bool,

    /// Directory holding muster.db and config.kdl
    #[arg(long, global = true, env = "MUSTER_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Seconds of silence before a session is swept (overrides config)
    #[arg(long, global = true)]
    pub stale_threshold_secs: Option<u64>,

    /// Days of heartbeat history to keep (overrides config)
    #[arg(long, global = true)]
    pub heartbeat_retention_days: Option<u64>,

    /// Milliseconds a writer waits for the store lock (overrides config)
    #[arg(long, global = true)]
    pub busy_timeout_ms: Option<u64>,

    /// Skip the automatic stale sweep for this invocation
    #[arg(long, global = true)]
    pub no_auto_sweep: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Agent session commands
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },

    /// Work item commands
    Work {
        #[command(subcommand)]
        command: WorkCommands,
    },

    /// Project commands
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },

    /// Read the event log
    Events {
        /// Only events with id greater than this
        #[arg(long)]
        since: Option<i64>,

        /// Filter by target id (session, work item or project)
        #[arg(long)]
        target: Option<String>,

        /// Filter by target kind
        #[arg(long, value_parser = ["agent", "work_item", "project"])]
        target_type: Option<String>,

        /// Filter by event type
        #[arg(long = "type", short = 't')]
        event_type: Option<String>,

        /// Filter by actor session
        #[arg(long)]
        actor: Option<String>,

        /// Maximum number of events to return
        #[arg(long, short = 'n')]
        limit: Option<usize>,
    },

    /// Mark sessions whose process is gone as stale and release their claims
    Sweep {
        /// Report candidates and liveness without changing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

impl Commands {
    /// Whether this command runs the automatic sweep first.
    ///
    /// Reads of the log and config, and the explicit sweep itself, do not.
    pub fn triggers_sweep(&self) -> bool {
        !matches!(
            self,
            Commands::Events { .. } | Commands::Sweep { .. } | Commands::Config { .. }
        )
    }
}

/// Agent subcommands
#[derive(Subcommand, Debug)]
pub enum AgentCommands {
    /// Register a new session and print it (the session_id is your lease)
    Register {
        /// Agent name
        name: String,

        /// Process id to probe for liveness (defaults to the caller's parent)
        #[arg(long)]
        pid: Option<u32>,

        /// Session id of the spawning agent
        #[arg(long)]
        parent: Option<String>,

        /// Project label
        #[arg(long)]
        project: Option<String>,

        /// What the agent is about to work on
        #[arg(long)]
        work: Option<String>,

        /// JSON object of extra attributes
        #[arg(long)]
        metadata: Option<String>,
    },

    /// Renew the session lease
    Heartbeat {
        /// Session id
        #[arg(long, env = SESSION_ENV)]
        session: String,

        /// Progress note (also reactivates an idle session)
        #[arg(long)]
        progress: Option<String>,

        /// Work item the agent is on
        #[arg(long)]
        item: Option<String>,

        /// JSON object of extra attributes
        #[arg(long)]
        metadata: Option<String>,
    },

    /// Mark the session idle
    Idle {
        /// Session id
        #[arg(long, env = SESSION_ENV)]
        session: String,
    },

    /// End the session and release its claims
    Deregister {
        /// Session id
        #[arg(long, env = SESSION_ENV)]
        session: String,
    },

    /// List sessions (active and idle by default)
    List {
        /// Comma-separated statuses (active, idle, completed, stale)
        #[arg(long)]
        status: Option<String>,

        /// Include every status
        #[arg(long)]
        all: bool,

        /// Filter by project label
        #[arg(long)]
        project: Option<String>,
    },

    /// Show a session with its claims and recent heartbeats
    Show {
        /// Session id
        session: String,

        /// Number of heartbeats to include
        #[arg(long, default_value = "10")]
        heartbeats: usize,
    },
}

/// Work item subcommands
#[derive(Subcommand, Debug)]
pub enum WorkCommands {
    /// Create a work item
    Create {
        /// Item id (letters, digits, '-', '_', '.', ':', '/')
        id: String,

        /// Title
        title: String,

        /// Longer description
        #[arg(short, long)]
        description: Option<String>,

        /// Project id (must be registered)
        #[arg(long)]
        project: Option<String>,

        /// Where the item came from
        #[arg(long, value_parser = ["github", "local", "operator"])]
        source: Option<String>,

        /// External reference (issue URL, ticket key)
        #[arg(long)]
        source_ref: Option<String>,

        /// Priority (P1 highest)
        #[arg(short, long, value_parser = ["P1", "P2", "P3", "1", "2", "3"])]
        priority: Option<String>,

        /// JSON object of initial metadata
        #[arg(long)]
        metadata: Option<String>,

        /// Create the item already claimed by this session
        #[arg(long)]
        claim_as: Option<String>,
    },

    /// Attempt to claim an available item
    Claim {
        /// Item id
        id: String,

        /// Session id
        #[arg(long, env = SESSION_ENV)]
        session: String,
    },

    /// Claim the highest-priority available item
    Next {
        /// Session id
        #[arg(long, env = SESSION_ENV)]
        session: String,

        /// Only consider items in this project
        #[arg(long)]
        project: Option<String>,
    },

    /// Return a claimed item to the pool
    Release {
        /// Item id
        id: String,

        /// Session id
        #[arg(long, env = SESSION_ENV)]
        session: String,
    },

    /// Mark a claimed item completed
    Complete {
        /// Item id
        id: String,

        /// Session id
        #[arg(long, env = SESSION_ENV)]
        session: String,
    },

    /// Mark an item blocked
    Block {
        /// Item id
        id: String,

        /// What the item is waiting on
        #[arg(long)]
        by: Option<String>,

        /// Acting session
        #[arg(long, env = SESSION_ENV)]
        session: Option<String>,
    },

    /// Lift a block
    Unblock {
        /// Item id
        id: String,

        /// Acting session
        #[arg(long, env = SESSION_ENV)]
        session: Option<String>,
    },

    /// Delete an item
    Delete {
        /// Item id
        id: String,

        /// Delete even if another session holds the claim
        #[arg(long)]
        force: bool,

        /// Acting session
        #[arg(long, env = SESSION_ENV)]
        session: Option<String>,
    },

    /// Merge a JSON object into an item's metadata
    Meta {
        /// Item id
        id: String,

        /// JSON object; top-level keys replace existing ones
        json: String,

        /// Acting session
        #[arg(long, env = SESSION_ENV)]
        session: Option<String>,
    },

    /// Append an event to an item's timeline
    Note {
        /// Item id
        id: String,

        /// Event type (e.g. comment, progress_update)
        #[arg(long = "type", short = 't', default_value = "comment")]
        event_type: String,

        /// Summary text
        summary: String,

        /// JSON metadata attached to the event
        #[arg(long)]
        metadata: Option<String>,

        /// Where the text came from
        #[arg(long, value_parser = ["github", "local", "operator"])]
        source: Option<String>,

        /// Acting session
        #[arg(long, env = SESSION_ENV)]
        session: Option<String>,
    },

    /// List work items
    List {
        /// Comma-separated statuses (available, claimed, completed, blocked)
        #[arg(long)]
        status: Option<String>,

        /// Filter by project
        #[arg(long)]
        project: Option<String>,

        /// Filter by claimant session
        #[arg(long)]
        claimed_by: Option<String>,
    },

    /// Show an item and its event history
    Show {
        /// Item id
        id: String,
    },
}

/// Project subcommands
#[derive(Subcommand, Debug)]
pub enum ProjectCommands {
    /// Register a project (idempotent for identical attributes)
    Register {
        /// Project id
        id: String,

        /// Display name
        name: String,

        /// Filesystem root
        #[arg(long)]
        root: Option<String>,
    },

    /// List projects
    List,

    /// Show a project
    Show {
        /// Project id
        id: String,
    },
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show effective settings and where each came from
    Show,

    /// Set a value in config.kdl
    Set {
        /// Configuration key (e.g. stale-threshold-secs)
        key: String,
        /// Configuration value
        value: String,
    },
}
