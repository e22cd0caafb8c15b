//! Typed error hierarchy for the taskforge engine.
//!
//! One enum per subsystem:
//! - `ExecutorError`: orchestrator run outcomes the caller has to branch on
//! - `ResumeError`: resume validation and phase selection
//! - `StorageError`: persistence backends
//! - `SyncError`: branch synchronization during finalize
//! - `AgentError`: agent process invocation

use std::path::PathBuf;

use thiserror::Error;

use crate::blocked::BlockedSignal;
use crate::settings::SyncStrategy;

/// Errors returned by the orchestrator's run operations.
///
/// `Interrupted` and `TaskBlocked` are not failures: the first is a clean
/// stop after cancellation, the second hands control to an operator.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Execution interrupted during phase {phase}")]
    Interrupted { phase: String },

    #[error("Task {} blocked: {}", .0.task_id, .0.message)]
    TaskBlocked(Box<BlockedSignal>),

    #[error("Task {task_id} has unresolved blockers: {}", blockers.join(", "))]
    BlockersUnresolved {
        task_id: String,
        blockers: Vec<String>,
    },

    #[error("Phase {phase} failed: {message}")]
    PhaseFailed { phase: String, message: String },

    #[error("Task {task_id} is {status}; run `taskforge resume {task_id}` to continue it")]
    ResumeRequired { task_id: String, status: String },

    #[error("Phase {phase} is not part of the plan for task {task_id}")]
    PhaseNotFound { task_id: String, phase: String },

    #[error(transparent)]
    Resume(#[from] ResumeError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ExecutorError {
    /// The blocked signal, when this error hands the task to an operator.
    pub fn blocked(&self) -> Option<&BlockedSignal> {
        match self {
            ExecutorError::TaskBlocked(signal) => Some(&**signal),
            _ => None,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, ExecutorError::Interrupted { .. })
    }
}

/// Errors from resume validation and resume-phase selection.
#[derive(Debug, Error)]
pub enum ResumeError {
    #[error("Task {task_id} is already completed")]
    AlreadyCompleted { task_id: String },

    #[error(
        "Task {task_id} is currently running (pid {pid} on {hostname}); use --force to take over"
    )]
    StillRunning {
        task_id: String,
        pid: u32,
        hostname: String,
    },

    #[error("Task {task_id} cannot be resumed from status '{status}'")]
    NotResumable { task_id: String, status: String },

    #[error("No resumable phase found for task {task_id}")]
    NoResumePhase { task_id: String },
}

/// Errors from a persistence backend.
///
/// Not-found cases are distinct variants so callers can fall back to a
/// fresh value instead of treating a missing record as corruption.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Task {id} not found")]
    TaskNotFound { id: String },

    #[error("Invalid task id '{id}' (expected TASK-<number>)")]
    InvalidTaskId { id: String },

    #[error("No execution state recorded for task {id}")]
    StateNotFound { id: String },

    #[error("No plan recorded for task {id}")]
    PlanNotFound { id: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Failed to serialize record: {0}")]
    Serialize(#[source] serde_yaml::Error),

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::TaskNotFound { .. }
                | StorageError::StateNotFound { .. }
                | StorageError::PlanNotFound { .. }
        )
    }
}

/// Errors from synchronizing a task branch with its target.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{strategy} with {target} produced conflicts in {} file(s)", files.len())]
    Conflict {
        target: String,
        strategy: SyncStrategy,
        files: Vec<String>,
    },

    #[error("Target branch {0} not found")]
    TargetNotFound(String),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),
}

/// Errors from invoking the agent process.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to spawn agent process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Agent stream failed: {0}")]
    Stream(#[source] std::io::Error),

    #[error("Agent invocation cancelled")]
    Cancelled,

    #[error("Agent timed out after {secs}s")]
    TimedOut { secs: u64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
