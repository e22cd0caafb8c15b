//! Orphan detection for tasks whose executor may have died.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::state::ExecutionState;
use crate::task::Task;

/// Answers questions about processes on this machine.
pub trait ProcessProbe: Send + Sync {
    fn hostname(&self) -> String;
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probe backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn hostname(&self) -> String {
        current_hostname()
    }

    fn is_alive(&self, pid: u32) -> bool {
        pid_alive(pid)
    }
}

pub fn current_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    // No signal: only checks that the process exists. EPERM means it does.
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

/// Result of an orphan check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanCheck {
    pub orphaned: bool,
    pub reason: String,
}

impl OrphanCheck {
    fn alive(reason: impl Into<String>) -> Self {
        Self {
            orphaned: false,
            reason: reason.into(),
        }
    }

    fn orphaned(reason: impl Into<String>) -> Self {
        Self {
            orphaned: true,
            reason: reason.into(),
        }
    }
}

/// Decide whether a task's recorded executor is gone.
///
/// A task is orphaned when it claims to be running and either its process
/// is dead on this host or its heartbeat is older than `stale_after`. On a
/// different host only the heartbeat is consulted. Missing execution
/// metadata never counts as orphaned.
pub fn check_orphaned(
    task: &Task,
    state: &ExecutionState,
    stale_after: Duration,
    probe: &dyn ProcessProbe,
    now: DateTime<Utc>,
) -> OrphanCheck {
    if !task.status.is_active() {
        return OrphanCheck::alive(format!("task is {}", task.status));
    }
    let Some(info) = state.execution.as_ref() else {
        return OrphanCheck::alive("no execution metadata");
    };

    if info.hostname == probe.hostname() && !probe.is_alive(info.pid) {
        return OrphanCheck::orphaned(format!("executor process {} is not running", info.pid));
    }

    let age = now.signed_duration_since(info.last_heartbeat);
    let stale = chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::MAX);
    if age > stale {
        return OrphanCheck::orphaned(format!(
            "heartbeat stale (last seen {}s ago on {})",
            age.num_seconds(),
            info.hostname
        ));
    }

    OrphanCheck::alive(format!(
        "executor {} on {} heartbeat {}s ago",
        info.pid,
        info.hostname,
        age.num_seconds()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ExecutionInfo;
    use crate::task::{TaskStatus, Weight};

    struct FakeProbe {
        host: &'static str,
        alive: bool,
    }

    impl ProcessProbe for FakeProbe {
        fn hostname(&self) -> String {
            self.host.to_string()
        }
        fn is_alive(&self, _pid: u32) -> bool {
            self.alive
        }
    }

    const STALE: Duration = Duration::from_secs(300);

    fn running(host: &str, heartbeat_age_secs: i64) -> (Task, ExecutionState) {
        let mut task = Task::new("TASK-001", "t", Weight::Small);
        task.status = TaskStatus::Running;
        let mut state = ExecutionState::new("TASK-001");
        let mut info = ExecutionInfo::current();
        info.pid = 4242;
        info.hostname = host.to_string();
        info.last_heartbeat = Utc::now() - chrono::Duration::seconds(heartbeat_age_secs);
        state.start_execution(info);
        (task, state)
    }

    #[test]
    fn test_dead_pid_same_host_is_orphaned() {
        let (task, state) = running("box-a", 5);
        let probe = FakeProbe {
            host: "box-a",
            alive: false,
        };
        let check = check_orphaned(&task, &state, STALE, &probe, Utc::now());
        assert!(check.orphaned);
        assert!(check.reason.contains("4242"));
    }

    #[test]
    fn test_live_pid_fresh_heartbeat_is_not_orphaned() {
        let (task, state) = running("box-a", 5);
        let probe = FakeProbe {
            host: "box-a",
            alive: true,
        };
        assert!(!check_orphaned(&task, &state, STALE, &probe, Utc::now()).orphaned);
    }

    #[test]
    fn test_live_pid_stale_heartbeat_is_orphaned() {
        let (task, state) = running("box-a", 600);
        let probe = FakeProbe {
            host: "box-a",
            alive: true,
        };
        let check = check_orphaned(&task, &state, STALE, &probe, Utc::now());
        assert!(check.orphaned);
        assert!(check.reason.contains("stale"));
    }

    #[test]
    fn test_other_host_uses_heartbeat_only() {
        let (task, state) = running("box-b", 5);
        let probe = FakeProbe {
            host: "box-a",
            alive: false,
        };
        assert!(!check_orphaned(&task, &state, STALE, &probe, Utc::now()).orphaned);

        let (task, state) = running("box-b", 900);
        assert!(check_orphaned(&task, &state, STALE, &probe, Utc::now()).orphaned);
    }

    #[test]
    fn test_missing_metadata_is_not_orphaned() {
        let mut task = Task::new("TASK-001", "t", Weight::Small);
        task.status = TaskStatus::Running;
        let state = ExecutionState::new("TASK-001");
        let probe = FakeProbe {
            host: "box-a",
            alive: false,
        };
        let check = check_orphaned(&task, &state, STALE, &probe, Utc::now());
        assert!(!check.orphaned);
        assert_eq!(check.reason, "no execution metadata");
    }

    #[test]
    fn test_inactive_task_is_never_orphaned() {
        let (mut task, state) = running("box-a", 900);
        task.status = TaskStatus::Blocked;
        let probe = FakeProbe {
            host: "box-a",
            alive: false,
        };
        assert!(!check_orphaned(&task, &state, STALE, &probe, Utc::now()).orphaned);
    }

    #[test]
    fn test_system_probe_sees_current_process() {
        assert!(SystemProbe.is_alive(std::process::id()));
        assert!(!SystemProbe.hostname().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_system_probe_rejects_invalid_pids() {
        assert!(!SystemProbe.is_alive(0));
        assert!(!SystemProbe.is_alive(u32::MAX));
    }
}
