use anyhow::{Context, Result, anyhow};
use git2::{
    BranchType, Commit, IndexAddOption, Repository, ResetType, Signature, WorktreeAddOptions,
    WorktreePruneOptions, build::CheckoutBuilder,
};
use std::path::Path;

use crate::config::DATA_DIR;
use crate::tracker::DiffStats;

/// Thin wrapper over a git2 repository handle.
///
/// Open one per operation; handles are cheap and this keeps worktrees and
/// the main checkout from sharing stale state.
pub struct GitTracker {
    pub(crate) repo: Repository,
}

impl GitTracker {
    pub fn open(dir: &Path) -> Result<Self> {
        let repo = Repository::open(dir)
            .with_context(|| format!("Failed to open git repository at {}", dir.display()))?;
        Ok(Self { repo })
    }

    pub(crate) fn signature(&self) -> Result<Signature<'static>, git2::Error> {
        self.repo
            .signature()
            .or_else(|_| Signature::now("taskforge", "taskforge@localhost"))
    }

    /// Get the HEAD commit if it exists (returns None for unborn branches)
    pub(crate) fn head_commit(&self) -> Option<Commit<'_>> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
    }

    /// Get current HEAD SHA (returns None for unborn branches)
    pub fn head_sha(&self) -> Option<String> {
        self.head_commit().map(|c| c.id().to_string())
    }

    pub fn current_branch(&self) -> Option<String> {
        let head = self.repo.head().ok()?;
        if !head.is_branch() {
            return None;
        }
        head.shorthand().map(str::to_string)
    }

    /// Stage everything outside the data directory and commit it.
    ///
    /// Commits even when nothing changed, so every checkpoint has a SHA.
    pub fn checkpoint(&self, message: &str) -> Result<String> {
        let mut index = self.repo.index()?;
        let mut skip_data_dir = |path: &Path, _spec: &[u8]| -> i32 {
            if path.starts_with(DATA_DIR) { 1 } else { 0 }
        };
        index.add_all(
            ["*"].iter(),
            IndexAddOption::DEFAULT,
            Some(&mut skip_data_dir as &mut git2::IndexMatchedPath),
        )?;
        index.update_all(
            ["*"].iter(),
            Some(&mut skip_data_dir as &mut git2::IndexMatchedPath),
        )?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;
        let sig = self.signature()?;

        // Handle unborn branch (new repo with no commits yet)
        let commit_id = match self.head_commit() {
            Some(parent) => {
                self.repo
                    .commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?
            }
            None => self.repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[])?,
        };

        Ok(commit_id.to_string())
    }

    /// Hard-reset the checkout to `sha`.
    pub fn rewind_to(&self, sha: &str) -> Result<()> {
        let oid = git2::Oid::from_str(sha).with_context(|| format!("Invalid commit '{}'", sha))?;
        let commit = self
            .repo
            .find_commit(oid)
            .with_context(|| format!("Commit {} not found", sha))?;
        self.repo
            .reset(commit.as_object(), ResetType::Hard, None)
            .with_context(|| format!("Failed to reset to {}", sha))?;
        Ok(())
    }

    /// Resolve a branch or revision, falling back to `origin/<name>`.
    pub fn resolve_commit(&self, name: &str) -> Result<Commit<'_>, git2::Error> {
        let object = self
            .repo
            .revparse_single(name)
            .or_else(|_| self.repo.revparse_single(&format!("origin/{}", name)))?;
        object.peel_to_commit()
    }

    /// Changes on `head` since it diverged from `base`.
    pub fn diff_stats(&self, base: &str, head: &str) -> Result<DiffStats> {
        let base_commit = self.resolve_commit(base)?;
        let head_commit = self.resolve_commit(head)?;
        let fork = self
            .repo
            .merge_base(base_commit.id(), head_commit.id())
            .unwrap_or(base_commit.id());
        let fork_tree = self.repo.find_commit(fork)?.tree()?;
        let head_tree = head_commit.tree()?;

        let diff = self
            .repo
            .diff_tree_to_tree(Some(&fork_tree), Some(&head_tree), None)?;
        let stats = diff.stats()?;
        Ok(DiffStats {
            files_changed: stats.files_changed(),
            insertions: stats.insertions(),
            deletions: stats.deletions(),
        })
    }

    /// Commits HEAD has that `target` lacks, and the reverse.
    pub fn ahead_behind(&self, target: &str) -> Result<(usize, usize)> {
        let head = self
            .head_commit()
            .ok_or_else(|| anyhow!("repository has no commits"))?;
        let target = self.resolve_commit(target)?;
        Ok(self.repo.graph_ahead_behind(head.id(), target.id())?)
    }

    pub fn branch_exists(&self, name: &str) -> bool {
        self.repo.find_branch(name, BranchType::Local).is_ok()
    }

    pub fn create_branch(&self, name: &str, from: &str) -> Result<String> {
        let base = self
            .resolve_commit(from)
            .with_context(|| format!("Cannot branch from '{}'", from))?;
        self.repo
            .branch(name, &base, false)
            .with_context(|| format!("Failed to create branch {}", name))?;
        Ok(base.id().to_string())
    }

    pub fn checkout_branch(&self, name: &str) -> Result<()> {
        let refname = format!("refs/heads/{}", name);
        let object = self.repo.revparse_single(&refname)?;
        self.repo
            .checkout_tree(&object, Some(CheckoutBuilder::new().safe()))
            .with_context(|| format!("Failed to check out {}", name))?;
        self.repo.set_head(&refname)?;
        Ok(())
    }

    pub fn delete_branch(&self, name: &str) -> Result<()> {
        let mut branch = self.repo.find_branch(name, BranchType::Local)?;
        branch.delete()?;
        Ok(())
    }

    pub fn merge_base(&self, a: &str, b: &str) -> Option<String> {
        let a = self.resolve_commit(a).ok()?;
        let b = self.resolve_commit(b).ok()?;
        self.repo
            .merge_base(a.id(), b.id())
            .ok()
            .map(|oid| oid.to_string())
    }

    /// Create a linked worktree at `path` checked out on `branch`.
    pub fn add_worktree(&self, name: &str, path: &Path, branch: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let reference = self
            .repo
            .find_branch(branch, BranchType::Local)?
            .into_reference();
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        self.repo
            .worktree(name, path, Some(&opts))
            .with_context(|| format!("Failed to create worktree at {}", path.display()))?;
        Ok(())
    }

    pub fn remove_worktree(&self, name: &str) -> Result<()> {
        let worktree = self.repo.find_worktree(name)?;
        let mut opts = WorktreePruneOptions::new();
        opts.valid(true).working_tree(true);
        worktree.prune(Some(&mut opts))?;
        Ok(())
    }

    pub fn fetch(&self, remote: &str, branch: &str) -> Result<()> {
        let mut remote = self.repo.find_remote(remote)?;
        remote.fetch(&[branch], None, None)?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_head_sha_and_branch() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let tracker = GitTracker::open(dir.path()).unwrap();
        assert_eq!(tracker.head_sha().unwrap().len(), 40);
        assert_eq!(tracker.current_branch().as_deref(), Some("main"));
    }

    #[test]
    fn test_checkpoint_commits_changes_and_skips_data_dir() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        fs::write(dir.path().join("lib.rs"), "pub fn f() {}").unwrap();
        fs::create_dir_all(dir.path().join(".taskforge/tasks")).unwrap();
        fs::write(dir.path().join(".taskforge/tasks/state.yaml"), "x").unwrap();

        let tracker = GitTracker::open(dir.path()).unwrap();
        let sha = tracker.checkpoint("[taskforge] TASK-001: spec - completed").unwrap();
        let commit = tracker.repo.find_commit(git2::Oid::from_str(&sha).unwrap()).unwrap();
        let tree = commit.tree().unwrap();
        assert!(tree.get_path(Path::new("lib.rs")).is_ok());
        assert!(tree.get_path(Path::new(".taskforge/tasks/state.yaml")).is_err());
        assert_eq!(commit.message(), Some("[taskforge] TASK-001: spec - completed"));
    }

    #[test]
    fn test_checkpoint_without_changes_still_commits() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let tracker = GitTracker::open(dir.path()).unwrap();
        let before = tracker.head_sha().unwrap();
        let sha = tracker.checkpoint("empty").unwrap();
        assert_ne!(before, sha);
    }

    #[test]
    fn test_checkpoint_stages_deletions() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        commit_file(dir.path(), "old.txt", "bye", "add old");
        fs::remove_file(dir.path().join("old.txt")).unwrap();
        let tracker = GitTracker::open(dir.path()).unwrap();
        let sha = tracker.checkpoint("remove").unwrap();
        let commit = tracker.repo.find_commit(git2::Oid::from_str(&sha).unwrap()).unwrap();
        assert!(commit.tree().unwrap().get_path(Path::new("old.txt")).is_err());
    }

    #[test]
    fn test_rewind_restores_tree() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let tracker = GitTracker::open(dir.path()).unwrap();
        let base = tracker.head_sha().unwrap();
        commit_file(dir.path(), "feature.rs", "fn x() {}", "feature");
        assert!(dir.path().join("feature.rs").exists());

        tracker.rewind_to(&base).unwrap();
        assert_eq!(tracker.head_sha().unwrap(), base);
        assert!(!dir.path().join("feature.rs").exists());
    }

    #[test]
    fn test_branch_lifecycle_and_diff_stats() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let tracker = GitTracker::open(dir.path()).unwrap();
        tracker.create_branch("taskforge/TASK-001", "main").unwrap();
        assert!(tracker.branch_exists("taskforge/TASK-001"));
        tracker.checkout_branch("taskforge/TASK-001").unwrap();
        assert_eq!(tracker.current_branch().as_deref(), Some("taskforge/TASK-001"));

        commit_file(dir.path(), "a.rs", "line1\nline2\n", "a");
        commit_file(dir.path(), "b.rs", "one\n", "b");
        let stats = tracker.diff_stats("main", "HEAD").unwrap();
        assert_eq!(stats.files_changed, 2);
        assert_eq!(stats.insertions, 3);
        assert_eq!(stats.deletions, 0);
        assert_eq!(tracker.ahead_behind("main").unwrap(), (2, 0));

        tracker.checkout_branch("main").unwrap();
        tracker.delete_branch("taskforge/TASK-001").unwrap();
        assert!(!tracker.branch_exists("taskforge/TASK-001"));
    }

    #[test]
    fn test_worktree_add_and_remove() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let tracker = GitTracker::open(dir.path()).unwrap();
        tracker.create_branch("taskforge/TASK-002", "main").unwrap();

        let wt_root = tempdir().unwrap();
        let wt_path = wt_root.path().join("TASK-002");
        tracker
            .add_worktree("TASK-002", &wt_path, "taskforge/TASK-002")
            .unwrap();
        assert!(wt_path.join("README.md").exists());
        let wt = GitTracker::open(&wt_path).unwrap();
        assert_eq!(wt.current_branch().as_deref(), Some("taskforge/TASK-002"));

        tracker.remove_worktree("TASK-002").unwrap();
        assert!(!wt_path.exists());
    }

    #[test]
    fn test_resolve_unknown_revision_fails() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let tracker = GitTracker::open(dir.path()).unwrap();
        assert!(tracker.resolve_commit("no-such-branch").is_err());
    }
}
