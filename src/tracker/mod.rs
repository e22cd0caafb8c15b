//! Git checkpointing and branch synchronization.
//!
//! The orchestrator only sees [`VersionControl`]; [`GitWorkspace`] is the
//! git2-backed implementation used by the CLI.

mod git;
mod sync;
mod workspace;

pub use git::GitTracker;
pub use sync::SyncOutcome;
pub use workspace::GitWorkspace;

#[cfg(test)]
pub(crate) use git::test_support;

use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::errors::SyncError;
use crate::settings::SyncStrategy;
use crate::task::Task;

/// Size of a branch's changes relative to its target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub files_changed: usize,
    pub insertions: usize,
    pub deletions: usize,
}

impl DiffStats {
    pub fn lines_changed(&self) -> usize {
        self.insertions + self.deletions
    }
}

/// Where a task's phases run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub path: PathBuf,
    pub branch: String,
    /// Commit the task branch forked from the target.
    pub base_commit: Option<String>,
    /// True when `path` is a dedicated worktree.
    pub isolated: bool,
}

/// Version-control operations the orchestrator depends on.
pub trait VersionControl: Send + Sync {
    /// Ensure the task branch exists and is checked out somewhere.
    fn prepare(&self, task: &Task, target: &str) -> Result<Workspace>;

    /// Commit the workspace after `phase`; returns the new commit SHA.
    fn checkpoint(&self, ws: &Workspace, task_id: &str, phase: &str) -> Result<String>;

    fn rewind(&self, ws: &Workspace, sha: &str) -> Result<()>;

    fn diff_stats(&self, ws: &Workspace, target: &str) -> Result<DiffStats>;

    fn sync(
        &self,
        ws: &Workspace,
        target: &str,
        strategy: SyncStrategy,
    ) -> Result<SyncOutcome, SyncError>;

    /// Release the workspace once the task no longer needs it.
    fn cleanup(&self, ws: &Workspace) -> Result<()>;
}
