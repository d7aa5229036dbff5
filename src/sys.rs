//! OS-level process probing.

use serde::{Deserialize, Serialize};

/// Verdict of a process liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Alive,
    Dead,
}

/// Decides whether the process behind an agent session is still running.
pub trait ProcessProbe {
    /// Probe `pid`. A session without a recorded pid is always dead.
    fn probe(&self, pid: Option<u32>) -> Liveness;
}

/// Probes with a null signal (`kill(pid, 0)`).
///
/// Permission denied means the process exists under another user, so it
/// counts as alive. Only "no such process" counts as dead.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalProbe;

impl ProcessProbe for SignalProbe {
    fn probe(&self, pid: Option<u32>) -> Liveness {
        match pid {
            None | Some(0) => Liveness::Dead,
            Some(pid) => signal_probe(pid),
        }
    }
}

#[cfg(unix)]
fn signal_probe(pid: u32) -> Liveness {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return Liveness::Dead;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => Liveness::Alive,
        Err(Errno::ESRCH) => Liveness::Dead,
        Err(e) => {
            tracing::debug!(pid, error = %e, "unexpected probe failure, assuming alive");
            Liveness::Alive
        }
    }
}

#[cfg(not(unix))]
fn signal_probe(_pid: u32) -> Liveness {
    // No signal probe available; never reclaim on a guess.
    Liveness::Alive
}

/// Process ID of the calling process's parent.
///
/// The CLI is normally invoked by the agent itself, so the parent is the
/// process whose lifetime the session should track.
#[cfg(unix)]
pub fn parent_pid() -> Option<u32> {
    u32::try_from(nix::unistd::getppid().as_raw()).ok()
}

#[cfg(not(unix))]
pub fn parent_pid() -> Option<u32> {
    None
}
