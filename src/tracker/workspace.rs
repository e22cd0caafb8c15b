use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};

use crate::errors::SyncError;
use crate::settings::{GitSection, SyncStrategy};
use crate::task::Task;
use crate::tracker::{DiffStats, GitTracker, SyncOutcome, VersionControl, Workspace};

/// git2-backed [`VersionControl`] rooted at the project checkout.
pub struct GitWorkspace {
    project_dir: PathBuf,
    git: GitSection,
}

impl GitWorkspace {
    pub fn new(project_dir: impl Into<PathBuf>, git: GitSection) -> Self {
        Self {
            project_dir: project_dir.into(),
            git,
        }
    }

    fn worktree_path(&self, task_id: &str) -> PathBuf {
        let root = if self.git.worktree_dir.is_absolute() {
            self.git.worktree_dir.clone()
        } else {
            self.project_dir.join(&self.git.worktree_dir)
        };
        root.join(task_id)
    }

    fn open(&self, path: &Path) -> Result<GitTracker> {
        GitTracker::open(path)
    }
}

impl VersionControl for GitWorkspace {
    fn prepare(&self, task: &Task, target: &str) -> Result<Workspace> {
        let tracker = self.open(&self.project_dir)?;
        if tracker.head_sha().is_none() {
            bail!(
                "Repository at {} has no commits; make an initial commit first",
                self.project_dir.display()
            );
        }

        let branch = if task.branch.is_empty() {
            self.git.branch_name(&task.id)
        } else {
            task.branch.clone()
        };
        if !tracker.branch_exists(&branch) {
            let from = if tracker.resolve_commit(target).is_ok() {
                target
            } else {
                warn!(target, "Target branch not found, branching from HEAD");
                "HEAD"
            };
            tracker.create_branch(&branch, from)?;
            info!(%branch, from, "Created task branch");
        }
        let base_commit = tracker.merge_base(&branch, target);

        if self.git.worktrees {
            let path = self.worktree_path(&task.id);
            if !path.exists() {
                tracker.add_worktree(&task.id, &path, &branch)?;
                info!(path = %path.display(), "Created worktree");
            }
            return Ok(Workspace {
                path,
                branch,
                base_commit,
                isolated: true,
            });
        }

        if tracker.current_branch().as_deref() != Some(branch.as_str()) {
            tracker
                .checkout_branch(&branch)
                .with_context(|| format!("Failed to switch to task branch {}", branch))?;
            debug!(%branch, "Checked out task branch");
        }
        Ok(Workspace {
            path: self.project_dir.clone(),
            branch,
            base_commit,
            isolated: false,
        })
    }

    fn checkpoint(&self, ws: &Workspace, task_id: &str, phase: &str) -> Result<String> {
        let message = format!("{} {}: {} - completed", self.git.commit_prefix, task_id, phase);
        self.open(&ws.path)?.checkpoint(&message)
    }

    fn rewind(&self, ws: &Workspace, sha: &str) -> Result<()> {
        self.open(&ws.path)?.rewind_to(sha)
    }

    fn diff_stats(&self, ws: &Workspace, target: &str) -> Result<DiffStats> {
        self.open(&ws.path)?.diff_stats(target, "HEAD")
    }

    fn sync(
        &self,
        ws: &Workspace,
        target: &str,
        strategy: SyncStrategy,
    ) -> Result<SyncOutcome, SyncError> {
        let tracker = GitTracker::open(&ws.path)
            .map_err(|e| SyncError::Git(git2::Error::from_str(&e.to_string())))?;
        if self.git.fetch_before_sync
            && let Err(e) = tracker.fetch(&self.git.remote, target)
        {
            warn!(remote = %self.git.remote, target, "Fetch failed, syncing with local refs: {e:#}");
        }
        tracker.sync_with(target, strategy)
    }

    fn cleanup(&self, ws: &Workspace) -> Result<()> {
        if !ws.isolated {
            return Ok(());
        }
        let Some(name) = ws.path.file_name().and_then(|n| n.to_str()) else {
            return Ok(());
        };
        self.open(&self.project_dir)?.remove_worktree(name)?;
        info!(path = %ws.path.display(), "Removed worktree");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Weight;
    use crate::tracker::test_support::*;
    use tempfile::tempdir;

    #[test]
    fn test_prepare_creates_and_checks_out_branch() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let vcs = GitWorkspace::new(dir.path(), GitSection::default());
        let task = Task::new("TASK-001", "t", Weight::Small);

        let ws = vcs.prepare(&task, "main").unwrap();
        assert_eq!(ws.branch, "taskforge/TASK-001");
        assert!(!ws.isolated);
        assert!(ws.base_commit.is_some());
        let tracker = GitTracker::open(dir.path()).unwrap();
        assert_eq!(tracker.current_branch().as_deref(), Some("taskforge/TASK-001"));

        // Idempotent on resume
        let again = vcs.prepare(&task, "main").unwrap();
        assert_eq!(again, ws);
    }

    #[test]
    fn test_prepare_with_worktree_and_cleanup() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let git = GitSection {
            worktrees: true,
            ..GitSection::default()
        };
        let vcs = GitWorkspace::new(dir.path(), git);
        let task = Task::new("TASK-002", "t", Weight::Small);

        let ws = vcs.prepare(&task, "main").unwrap();
        assert!(ws.isolated);
        assert!(ws.path.ends_with(".taskforge/worktrees/TASK-002"));
        assert!(ws.path.join("README.md").exists());

        let sha = vcs.checkpoint(&ws, "TASK-002", "spec").unwrap();
        assert_eq!(GitTracker::open(&ws.path).unwrap().head_sha(), Some(sha));
        // Main checkout untouched
        let main = GitTracker::open(dir.path()).unwrap();
        assert_eq!(main.current_branch().as_deref(), Some("main"));

        vcs.cleanup(&ws).unwrap();
        assert!(!ws.path.exists());
    }

    #[test]
    fn test_checkpoint_message_and_diff_stats() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let vcs = GitWorkspace::new(dir.path(), GitSection::default());
        let task = Task::new("TASK-003", "t", Weight::Small);
        let ws = vcs.prepare(&task, "main").unwrap();

        std::fs::write(dir.path().join("new.rs"), "a\nb\n").unwrap();
        vcs.checkpoint(&ws, "TASK-003", "implement").unwrap();
        let tracker = GitTracker::open(dir.path()).unwrap();
        let head = tracker.head_commit().unwrap();
        assert_eq!(
            head.message(),
            Some("[taskforge] TASK-003: implement - completed")
        );

        let stats = vcs.diff_stats(&ws, "main").unwrap();
        assert_eq!(stats.files_changed, 1);
        assert_eq!(stats.lines_changed(), 2);
    }

    #[test]
    fn test_prepare_rejects_empty_repository() {
        let dir = tempdir().unwrap();
        git2::Repository::init(dir.path()).unwrap();
        let vcs = GitWorkspace::new(dir.path(), GitSection::default());
        let task = Task::new("TASK-004", "t", Weight::Small);
        let err = vcs.prepare(&task, "main").unwrap_err();
        assert!(err.to_string().contains("no commits"));
    }
}
