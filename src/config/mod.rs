//! Configuration for Muster.
//!
//! Settings live in `config.kdl` inside the data directory (next to
//! `muster.db`), so every agent sharing a store also shares its tunables:
//!
//! - `stale-threshold-secs` - silence before a session is a sweep candidate (300)
//! - `heartbeat-retention-days` - heartbeat history kept by the sweep (7)
//! - `busy-timeout-ms` - how long a writer waits for the store lock (5000)
//! - `auto-sweep` - sweep before state-changing commands (#true)
//!
//! ## Precedence
//!
//! CLI flag > `MUSTER_*` environment variable > config.kdl > defaults.
//!
//! Use the [`resolver`] module for precedence resolution.

pub mod resolver;
pub mod schema;

pub use resolver::{
    AUTO_SWEEP_ENV, BUSY_TIMEOUT_ENV, ConfigOverrides, HEARTBEAT_RETENTION_ENV, Resolved,
    ResolvedConfig, STALE_THRESHOLD_ENV, ValueSource, resolve_config,
};
pub use schema::{CONFIG_FILE, MusterConfig, Settings};
