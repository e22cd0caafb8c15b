//! Bring a task branch up to date with its target before finalizing.

use git2::{ErrorCode, Index, build::CheckoutBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::SyncError;
use crate::settings::SyncStrategy;
use crate::tracker::GitTracker;

/// Result of a successful sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    /// Whether target commits were brought into the branch.
    pub changed: bool,
    /// Task commits not on the target, measured before syncing.
    pub ahead: usize,
    /// Target commits missing from the branch, measured before syncing.
    pub behind: usize,
    pub head: String,
}

impl GitTracker {
    /// Merge or rebase HEAD onto `target`.
    ///
    /// Conflicts leave the checkout as it was and report the conflicting paths.
    pub fn sync_with(&self, target: &str, strategy: SyncStrategy) -> Result<SyncOutcome, SyncError> {
        let head = self
            .head_commit()
            .ok_or_else(|| git2::Error::from_str("repository has no commits"))?;
        let target_commit = self
            .resolve_commit(target)
            .map_err(|_| SyncError::TargetNotFound(target.to_string()))?;
        let (ahead, behind) = self
            .repo
            .graph_ahead_behind(head.id(), target_commit.id())?;

        if behind == 0 {
            debug!(target, ahead, "Branch already contains target");
            return Ok(SyncOutcome {
                changed: false,
                ahead,
                behind,
                head: head.id().to_string(),
            });
        }

        info!(target, %strategy, ahead, behind, "Syncing branch with target");
        let new_head = match strategy {
            SyncStrategy::Merge => self.merge_target(target, &head, &target_commit)?,
            SyncStrategy::Rebase => self.rebase_onto(target, &target_commit)?,
        };
        Ok(SyncOutcome {
            changed: true,
            ahead,
            behind,
            head: new_head,
        })
    }

    fn merge_target(
        &self,
        target: &str,
        head: &git2::Commit<'_>,
        target_commit: &git2::Commit<'_>,
    ) -> Result<String, SyncError> {
        let mut index = self.repo.merge_commits(head, target_commit, None)?;
        if index.has_conflicts() {
            return Err(SyncError::Conflict {
                target: target.to_string(),
                strategy: SyncStrategy::Merge,
                files: conflict_paths(&index)?,
            });
        }

        let tree_id = index.write_tree_to(&self.repo)?;
        let tree = self.repo.find_tree(tree_id)?;
        let sig = self.signature()?;
        let branch = self.current_branch().unwrap_or_else(|| "HEAD".to_string());
        let message = format!("Merge {} into {}", target, branch);
        let oid = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, &message, &tree, &[head, target_commit])?;
        self.repo
            .checkout_head(Some(CheckoutBuilder::new().force()))?;
        Ok(oid.to_string())
    }

    fn rebase_onto(
        &self,
        target: &str,
        target_commit: &git2::Commit<'_>,
    ) -> Result<String, SyncError> {
        let head_ref = self.repo.head()?;
        let branch = self.repo.reference_to_annotated_commit(&head_ref)?;
        let upstream = self.repo.find_annotated_commit(target_commit.id())?;
        let sig = self.signature()?;

        let mut rebase = self
            .repo
            .rebase(Some(&branch), Some(&upstream), None, None)?;
        while let Some(op) = rebase.next() {
            if let Err(e) = op {
                let _ = rebase.abort();
                return Err(e.into());
            }
            let index = self.repo.index()?;
            if index.has_conflicts() {
                let files = conflict_paths(&index)?;
                rebase.abort()?;
                return Err(SyncError::Conflict {
                    target: target.to_string(),
                    strategy: SyncStrategy::Rebase,
                    files,
                });
            }
            match rebase.commit(None, &sig, None) {
                Ok(_) => {}
                // Patch already present upstream
                Err(e) if e.code() == ErrorCode::Applied => {}
                Err(e) => {
                    let _ = rebase.abort();
                    return Err(e.into());
                }
            }
        }
        rebase.finish(Some(&sig))?;

        self.head_sha()
            .ok_or_else(|| SyncError::Git(git2::Error::from_str("HEAD missing after rebase")))
    }
}

fn conflict_paths(index: &Index) -> Result<Vec<String>, git2::Error> {
    let mut files = Vec::new();
    for conflict in index.conflicts()? {
        let conflict = conflict?;
        if let Some(entry) = conflict.our.or(conflict.their).or(conflict.ancestor) {
            files.push(String::from_utf8_lossy(&entry.path).into_owned());
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::git::test_support::*;
    use tempfile::tempdir;

    fn task_branch(dir: &std::path::Path) -> GitTracker {
        let tracker = GitTracker::open(dir).unwrap();
        tracker.create_branch("taskforge/TASK-001", "main").unwrap();
        tracker.checkout_branch("taskforge/TASK-001").unwrap();
        tracker
    }

    // =========================================
    // Merge tests
    // =========================================

    #[test]
    fn test_sync_noop_when_target_unchanged() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let tracker = task_branch(dir.path());
        commit_file(dir.path(), "feature.rs", "fn f() {}", "feature");

        let outcome = tracker.sync_with("main", SyncStrategy::Merge).unwrap();
        assert!(!outcome.changed);
        assert_eq!(outcome.ahead, 1);
        assert_eq!(outcome.behind, 0);
    }

    #[test]
    fn test_merge_brings_in_target_commits() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let tracker = task_branch(dir.path());
        commit_file(dir.path(), "feature.rs", "fn f() {}", "feature");
        commit_on_branch(dir.path(), "main", &[("upstream.rs", "fn u() {}")], "upstream");

        let outcome = tracker.sync_with("main", SyncStrategy::Merge).unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.behind, 1);
        assert!(dir.path().join("upstream.rs").exists());
        assert!(dir.path().join("feature.rs").exists());
        let head = tracker.head_commit().unwrap();
        assert_eq!(head.parent_count(), 2);
        assert_eq!(tracker.ahead_behind("main").unwrap().1, 0);
    }

    #[test]
    fn test_merge_conflict_reports_sorted_files() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        commit_file(dir.path(), "a.go", "package a\n", "a");
        commit_file(dir.path(), "b.go", "package b\n", "b");
        let tracker = task_branch(dir.path());
        commit_file(dir.path(), "b.go", "package b // task\n", "task b");
        commit_file(dir.path(), "a.go", "package a // task\n", "task a");
        commit_on_branch(
            dir.path(),
            "main",
            &[("a.go", "package a // main\n"), ("b.go", "package b // main\n")],
            "main edits",
        );
        let before = tracker.head_sha().unwrap();

        let err = tracker.sync_with("main", SyncStrategy::Merge).unwrap_err();
        match err {
            SyncError::Conflict {
                target,
                strategy,
                files,
            } => {
                assert_eq!(target, "main");
                assert_eq!(strategy, SyncStrategy::Merge);
                assert_eq!(files, vec!["a.go".to_string(), "b.go".to_string()]);
            }
            other => panic!("Expected Conflict, got {:?}", other),
        }
        assert_eq!(tracker.head_sha().unwrap(), before);
    }

    #[test]
    fn test_sync_unknown_target() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let tracker = GitTracker::open(dir.path()).unwrap();
        assert!(matches!(
            tracker.sync_with("release", SyncStrategy::Merge),
            Err(SyncError::TargetNotFound(t)) if t == "release"
        ));
    }

    // =========================================
    // Rebase tests
    // =========================================

    #[test]
    fn test_rebase_replays_task_commits() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let tracker = task_branch(dir.path());
        commit_file(dir.path(), "feature.rs", "fn f() {}", "feature");
        commit_on_branch(dir.path(), "main", &[("upstream.rs", "fn u() {}")], "upstream");

        let outcome = tracker.sync_with("main", SyncStrategy::Rebase).unwrap();
        assert!(outcome.changed);
        let head = tracker.head_commit().unwrap();
        assert_eq!(head.parent_count(), 1);
        assert_eq!(head.message(), Some("feature"));
        assert_eq!(tracker.ahead_behind("main").unwrap(), (1, 0));
        assert!(dir.path().join("upstream.rs").exists());
        assert_eq!(tracker.current_branch().as_deref(), Some("taskforge/TASK-001"));
    }

    #[test]
    fn test_rebase_conflict_aborts() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        commit_file(dir.path(), "a.go", "package a\n", "a");
        let tracker = task_branch(dir.path());
        commit_file(dir.path(), "a.go", "package a // task\n", "task a");
        commit_on_branch(dir.path(), "main", &[("a.go", "package a // main\n")], "main a");
        let before = tracker.head_sha().unwrap();

        let err = tracker.sync_with("main", SyncStrategy::Rebase).unwrap_err();
        assert!(matches!(
            err,
            SyncError::Conflict { strategy: SyncStrategy::Rebase, ref files, .. } if files == &vec!["a.go".to_string()]
        ));
        assert_eq!(tracker.head_sha().unwrap(), before);
        assert_eq!(tracker.current_branch().as_deref(), Some("taskforge/TASK-001"));
    }
}
