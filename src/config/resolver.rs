//! Precedence resolution for settings.
//!
//! Each setting is resolved independently, highest precedence first:
//!
//! 1. CLI flags (passed at runtime)
//! 2. `MUSTER_*` environment variables
//! 3. `<data-dir>/config.kdl`
//! 4. Built-in defaults

use crate::config::schema::{
    CONFIG_FILE, MAX_BUSY_TIMEOUT_MS, MusterConfig, Settings, check_busy_timeout,
};
use crate::{Error, Result};
use serde::Serialize;
use std::path::Path;
use std::str::FromStr;

pub const STALE_THRESHOLD_ENV: &str = "MUSTER_STALE_THRESHOLD_SECS";
pub const HEARTBEAT_RETENTION_ENV: &str = "MUSTER_HEARTBEAT_RETENTION_DAYS";
pub const BUSY_TIMEOUT_ENV: &str = "MUSTER_BUSY_TIMEOUT_MS";
pub const AUTO_SWEEP_ENV: &str = "MUSTER_AUTO_SWEEP";

/// Tracks where a resolved value came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueSource {
    /// Value from CLI flag
    CliFlag,
    /// Value from environment variable
    EnvVar(String),
    /// Value from config.kdl
    File,
    /// Built-in default value
    Default,
}

impl std::fmt::Display for ValueSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueSource::CliFlag => write!(f, "cli"),
            ValueSource::EnvVar(name) => write!(f, "env:{}", name),
            ValueSource::File => write!(f, "file"),
            ValueSource::Default => write!(f, "default"),
        }
    }
}

impl Serialize for ValueSource {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A resolved value with its source.
#[derive(Debug, Clone, Serialize)]
pub struct Resolved<T> {
    /// The resolved value
    pub value: T,
    /// Where the value came from
    pub source: ValueSource,
}

impl<T> Resolved<T> {
    pub fn new(value: T, source: ValueSource) -> Self {
        Self { value, source }
    }
}

/// Fully resolved settings with source tracking.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    pub stale_threshold_secs: Resolved<u64>,
    pub heartbeat_retention_days: Resolved<u64>,
    pub busy_timeout_ms: Resolved<u64>,
    pub auto_sweep: Resolved<bool>,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        let defaults = Settings::default();
        Self {
            stale_threshold_secs: Resolved::new(defaults.stale_threshold_secs, ValueSource::Default),
            heartbeat_retention_days: Resolved::new(
                defaults.heartbeat_retention_days,
                ValueSource::Default,
            ),
            busy_timeout_ms: Resolved::new(defaults.busy_timeout_ms, ValueSource::Default),
            auto_sweep: Resolved::new(defaults.auto_sweep, ValueSource::Default),
        }
    }
}

impl ResolvedConfig {
    /// Strip source tracking.
    pub fn settings(&self) -> Settings {
        Settings {
            stale_threshold_secs: self.stale_threshold_secs.value,
            heartbeat_retention_days: self.heartbeat_retention_days.value,
            busy_timeout_ms: self.busy_timeout_ms.value,
            auto_sweep: self.auto_sweep.value,
        }
    }
}

/// CLI overrides for settings resolution.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub stale_threshold_secs: Option<u64>,
    pub heartbeat_retention_days: Option<u64>,
    pub busy_timeout_ms: Option<u64>,
    pub auto_sweep: Option<bool>,
}

impl ConfigOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stale_threshold_secs(mut self, secs: u64) -> Self {
        self.stale_threshold_secs = Some(secs);
        self
    }

    pub fn with_busy_timeout_ms(mut self, ms: u64) -> Self {
        self.busy_timeout_ms = Some(ms);
        self
    }

    pub fn with_auto_sweep(mut self, enabled: bool) -> Self {
        self.auto_sweep = Some(enabled);
        self
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_positive(raw: &str) -> Option<u64> {
    u64::from_str(raw.trim()).ok().filter(|v| *v > 0)
}

fn parse_busy_timeout(raw: &str) -> Option<u64> {
    parse_positive(raw).filter(|v| *v <= MAX_BUSY_TIMEOUT_MS)
}

/// Read an environment variable, failing if it is set but malformed.
fn env_value<T>(name: &str, parse: fn(&str) -> Option<T>) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) if !raw.is_empty() => parse(&raw)
            .map(Some)
            .ok_or_else(|| Error::Config(format!("Invalid value for {}: {:?}", name, raw))),
        _ => Ok(None),
    }
}

fn pick<T: Copy>(
    cli: Option<T>,
    env: (&str, Option<T>),
    file: Option<T>,
    default: T,
) -> Resolved<T> {
    if let Some(v) = cli {
        Resolved::new(v, ValueSource::CliFlag)
    } else if let Some(v) = env.1 {
        Resolved::new(v, ValueSource::EnvVar(env.0.to_string()))
    } else if let Some(v) = file {
        Resolved::new(v, ValueSource::File)
    } else {
        Resolved::new(default, ValueSource::Default)
    }
}

/// Resolve settings for the store in `data_dir`.
pub fn resolve_config(data_dir: &Path, overrides: &ConfigOverrides) -> Result<ResolvedConfig> {
    let file = MusterConfig::load(&data_dir.join(CONFIG_FILE))?;
    let defaults = Settings::default();

    for (name, value) in [
        ("stale threshold", overrides.stale_threshold_secs),
        ("heartbeat retention", overrides.heartbeat_retention_days),
        ("busy timeout", overrides.busy_timeout_ms),
    ] {
        if value == Some(0) {
            return Err(Error::Config(format!("{} must be greater than 0", name)));
        }
    }
    check_busy_timeout(overrides.busy_timeout_ms)?;

    Ok(ResolvedConfig {
        stale_threshold_secs: pick(
            overrides.stale_threshold_secs,
            (STALE_THRESHOLD_ENV, env_value(STALE_THRESHOLD_ENV, parse_positive)?),
            file.stale_threshold_secs,
            defaults.stale_threshold_secs,
        ),
        heartbeat_retention_days: pick(
            overrides.heartbeat_retention_days,
            (
                HEARTBEAT_RETENTION_ENV,
                env_value(HEARTBEAT_RETENTION_ENV, parse_positive)?,
            ),
            file.heartbeat_retention_days,
            defaults.heartbeat_retention_days,
        ),
        busy_timeout_ms: pick(
            overrides.busy_timeout_ms,
            (BUSY_TIMEOUT_ENV, env_value(BUSY_TIMEOUT_ENV, parse_busy_timeout)?),
            file.busy_timeout_ms,
            defaults.busy_timeout_ms,
        ),
        auto_sweep: pick(
            overrides.auto_sweep,
            (AUTO_SWEEP_ENV, env_value(AUTO_SWEEP_ENV, parse_bool)?),
            file.auto_sweep,
            defaults.auto_sweep,
        ),
    })
}
