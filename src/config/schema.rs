//! KDL schema for `config.kdl`.
//!
//! ```kdl
//! stale-threshold-secs 300
//! heartbeat-retention-days 7
//! busy-timeout-ms 5000
//! auto-sweep #true
//! ```

use crate::{Error, Result};
use kdl::{KdlDocument, KdlEntry, KdlNode, KdlValue};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Config file name inside the data directory.
pub const CONFIG_FILE: &str = "config.kdl";

pub const DEFAULT_STALE_THRESHOLD_SECS: u64 = 300;
pub const DEFAULT_HEARTBEAT_RETENTION_DAYS: u64 = 7;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;
/// SQLite takes the busy timeout as an `int` of milliseconds.
pub const MAX_BUSY_TIMEOUT_MS: u64 = i32::MAX as u64;

// Clamp for chrono durations, which panic when out of range.
const MAX_SPAN_DAYS: i64 = 365_000;

/// Values set in `config.kdl`. Unset keys fall through to defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MusterConfig {
    /// Seconds without contact before a session becomes a sweep candidate
    pub stale_threshold_secs: Option<u64>,
    /// Days of heartbeat history kept
    pub heartbeat_retention_days: Option<u64>,
    /// How long a writer waits for the store lock
    pub busy_timeout_ms: Option<u64>,
    /// Run the stale sweep before state-changing commands
    pub auto_sweep: Option<bool>,
}

fn first_value<'a>(doc: &'a KdlDocument, name: &str) -> Option<&'a KdlValue> {
    doc.get(name)
        .and_then(|node| node.entries().first())
        .map(|entry| entry.value())
}

fn positive_int(doc: &KdlDocument, name: &str) -> Result<Option<u64>> {
    match first_value(doc, name) {
        None => Ok(None),
        Some(value) => value
            .as_integer()
            .and_then(|i| u64::try_from(i).ok())
            .filter(|i| *i > 0)
            .map(Some)
            .ok_or_else(|| {
                Error::Config(format!("{} must be a positive integer, got {}", name, value))
            }),
    }
}

/// Reject busy timeouts SQLite cannot represent.
pub fn check_busy_timeout(ms: Option<u64>) -> Result<()> {
    match ms {
        Some(ms) if ms > MAX_BUSY_TIMEOUT_MS => Err(Error::Config(format!(
            "busy-timeout-ms must be at most {}, got {}",
            MAX_BUSY_TIMEOUT_MS, ms
        ))),
        _ => Ok(()),
    }
}

fn int_node(name: &str, value: u64) -> KdlNode {
    let mut node = KdlNode::new(name);
    node.push(KdlEntry::new(KdlValue::Integer(value as i128)));
    node
}

impl MusterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("stale-threshold-secs", self.stale_threshold_secs),
            ("heartbeat-retention-days", self.heartbeat_retention_days),
            ("busy-timeout-ms", self.busy_timeout_ms),
        ] {
            if value == Some(0) {
                return Err(Error::Config(format!("{} must be greater than 0", name)));
            }
        }
        check_busy_timeout(self.busy_timeout_ms)
    }

    /// Parse config from a KDL document.
    pub fn from_kdl(doc: &KdlDocument) -> Result<Self> {
        let auto_sweep = match first_value(doc, "auto-sweep") {
            None => None,
            Some(value) => Some(value.as_bool().ok_or_else(|| {
                Error::Config(format!("auto-sweep must be #true or #false, got {}", value))
            })?),
        };

        Ok(Self {
            stale_threshold_secs: positive_int(doc, "stale-threshold-secs")?,
            heartbeat_retention_days: positive_int(doc, "heartbeat-retention-days")?,
            busy_timeout_ms: positive_int(doc, "busy-timeout-ms")?,
            auto_sweep,
        })
    }

    /// Convert config to a KDL document.
    pub fn to_kdl(&self) -> KdlDocument {
        let mut doc = KdlDocument::new();

        if let Some(secs) = self.stale_threshold_secs {
            doc.nodes_mut().push(int_node("stale-threshold-secs", secs));
        }
        if let Some(days) = self.heartbeat_retention_days {
            doc.nodes_mut()
                .push(int_node("heartbeat-retention-days", days));
        }
        if let Some(ms) = self.busy_timeout_ms {
            doc.nodes_mut().push(int_node("busy-timeout-ms", ms));
        }
        if let Some(enabled) = self.auto_sweep {
            let mut node = KdlNode::new("auto-sweep");
            node.push(KdlEntry::new(KdlValue::Bool(enabled)));
            doc.nodes_mut().push(node);
        }

        doc
    }

    /// Load `config.kdl` from `path`. A missing file is an empty config.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = std::fs::read_to_string(path)?;
        let doc: KdlDocument = content.parse().map_err(|e| {
            Error::Config(format!("Failed to parse KDL in {}: {}", path.display(), e))
        })?;
        let config = Self::from_kdl(&doc)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config to `path` as KDL.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_kdl().to_string())?;
        Ok(())
    }
}

/// Concrete settings the engine runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub stale_threshold_secs: u64,
    pub heartbeat_retention_days: u64,
    pub busy_timeout_ms: u64,
    pub auto_sweep: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            stale_threshold_secs: DEFAULT_STALE_THRESHOLD_SECS,
            heartbeat_retention_days: DEFAULT_HEARTBEAT_RETENTION_DAYS,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            auto_sweep: true,
        }
    }
}

impl Settings {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn stale_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            i64::try_from(self.stale_threshold_secs)
                .unwrap_or(i64::MAX)
                .min(MAX_SPAN_DAYS * 86_400),
        )
    }

    pub fn heartbeat_retention(&self) -> chrono::Duration {
        chrono::Duration::days(
            i64::try_from(self.heartbeat_retention_days)
                .unwrap_or(i64::MAX)
                .min(MAX_SPAN_DAYS),
        )
    }
}
