//! Common test utilities for muster integration tests.
//!
//! Provides `TestEnv` for isolated test environments that don't touch the
//! user's `~/.local/share/muster/` directory.

#![allow(dead_code)]

use assert_cmd::Command;
use serde_json::Value;
pub use tempfile::TempDir;

/// Variables that would leak the developer's own setup into a test run.
const INHERITED_ENV: &[&str] = &[
    "MUSTER_SESSION_ID",
    "MUSTER_STALE_THRESHOLD_SECS",
    "MUSTER_HEARTBEAT_RETENTION_DAYS",
    "MUSTER_BUSY_TIMEOUT_MS",
    "MUSTER_AUTO_SWEEP",
    "MUSTER_LOG",
];

/// A test environment with an isolated data directory.
///
/// The `muster()` method returns a `Command` that sets `MUSTER_DATA_DIR`
/// per-invocation, making tests parallel-safe.
pub struct TestEnv {
    pub data_dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            data_dir: TempDir::new().unwrap(),
        }
    }

    /// Get a Command for the muster binary with isolated data directory.
    pub fn muster(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_muster"));
        for name in INHERITED_ENV {
            cmd.env_remove(name);
        }
        cmd.env("MUSTER_DATA_DIR", self.data_dir.path());
        cmd
    }

    /// Run a command that must succeed and parse its JSON output.
    pub fn json(&self, args: &[&str]) -> Value {
        let output = self.muster().args(args).output().unwrap();
        assert!(
            output.status.success(),
            "muster {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        serde_json::from_slice(&output.stdout).unwrap()
    }

    /// Register an agent and return its session id.
    pub fn register(&self, name: &str) -> String {
        let agent = self.json(&["agent", "register", name]);
        agent["session_id"].as_str().unwrap().to_string()
    }

    /// Create an available work item.
    pub fn create_item(&self, id: &str, title: &str) {
        self.json(&["work", "create", id, title]);
    }

    pub fn data_path(&self) -> &std::path::Path {
        self.data_dir.path()
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the JSON error envelope written to stderr.
pub fn error_envelope(stderr: &[u8]) -> Value {
    let text = String::from_utf8_lossy(stderr);
    let line = text
        .lines()
        .rev()
        .find(|l| l.starts_with('{'))
        .unwrap_or_else(|| panic!("no JSON error on stderr: {}", text));
    serde_json::from_str(line).unwrap()
}
