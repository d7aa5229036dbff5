//! Stale-lease sweep.
//!
//! Finds live sessions that have not been heard from within the stale
//! threshold, probes their processes, and reclaims the leases of the dead
//! ones. Sessions whose process is still running get their lease refreshed.
//! Old heartbeat rows are pruned on every non-dry run.

use crate::Result;
use crate::storage::Storage;
use crate::sys::{Liveness, ProcessProbe};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Tunables for one sweep run.
#[derive(Debug, Clone, Copy)]
pub struct SweepOptions {
    /// Sessions silent for longer than this are candidates
    pub stale_threshold: Duration,
    /// Heartbeat rows older than this are deleted
    pub heartbeat_retention: Duration,
    /// Probe and report only
    pub dry_run: bool,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            stale_threshold: Duration::seconds(300),
            heartbeat_retention: Duration::days(7),
            dry_run: false,
        }
    }
}

/// A candidate session and the probe verdict for its process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepCandidate {
    pub session_id: String,
    pub agent_name: String,
    pub pid: Option<u32>,
    pub last_seen_at: DateTime<Utc>,
    pub liveness: Liveness,
}

/// A session the sweep marked stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaleSession {
    pub session_id: String,
    pub agent_name: String,
    pub pid: Option<u32>,
    pub released_items: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepReport {
    pub dry_run: bool,
    pub candidates: Vec<SweepCandidate>,
    pub stale: Vec<StaleSession>,
    /// Sessions whose process was found running and whose lease was refreshed
    pub verified_alive: Vec<String>,
    pub heartbeats_pruned: usize,
}

impl SweepReport {
    pub fn released_count(&self) -> usize {
        self.stale.iter().map(|s| s.released_items.len()).sum()
    }
}

/// Run one sweep pass against `storage`.
pub fn sweep(
    storage: &mut Storage,
    probe: &dyn ProcessProbe,
    options: &SweepOptions,
) -> Result<SweepReport> {
    let now = Utc::now();
    let cutoff = now - options.stale_threshold;

    let mut report = SweepReport {
        dry_run: options.dry_run,
        ..SweepReport::default()
    };

    for session in storage.stale_candidates(cutoff)? {
        let liveness = probe.probe(session.pid);
        report.candidates.push(SweepCandidate {
            session_id: session.session_id.clone(),
            agent_name: session.agent_name.clone(),
            pid: session.pid,
            last_seen_at: session.last_seen_at,
            liveness,
        });

        if options.dry_run {
            continue;
        }

        match liveness {
            Liveness::Alive => {
                if storage.refresh_lease(&session.session_id)? {
                    report.verified_alive.push(session.session_id);
                }
            }
            Liveness::Dead => {
                // Recheck against the committed last_seen_at: a heartbeat that
                // landed after selection wins over the probe.
                match storage.reclaim_stale(&session.session_id, cutoff)? {
                    Some(released_items) => {
                        tracing::info!(
                            session_id = %session.session_id,
                            agent = %session.agent_name,
                            released = released_items.len(),
                            "reclaimed stale agent session"
                        );
                        report.stale.push(StaleSession {
                            session_id: session.session_id,
                            agent_name: session.agent_name,
                            pid: session.pid,
                            released_items,
                        });
                    }
                    None => {
                        tracing::debug!(
                            session_id = %session.session_id,
                            "session heartbeated during sweep, skipping"
                        );
                    }
                }
            }
        }
    }

    if !options.dry_run {
        report.heartbeats_pruned = storage.prune_heartbeats(now - options.heartbeat_retention)?;
    }

    Ok(report)
}
