//! Blocked-task signalling and operator diagnostics.
//!
//! [`BlockedSignal`] travels inside `ExecutorError::TaskBlocked` to the
//! caller. [`BlockedContext`] is rebuilt on demand from task metadata and
//! settings whenever someone asks why a task is stuck; it is never stored.

use std::path::{Path, PathBuf};

use crate::settings::{Settings, SyncStrategy};
use crate::task::{BlockedReason, Task, meta};

/// Why a run stopped for operator action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedSignal {
    pub task_id: String,
    pub reason: BlockedReason,
    pub message: String,
    /// Populated for sync conflicts
    pub conflict_files: Vec<String>,
    pub sync_strategy: Option<SyncStrategy>,
}

impl BlockedSignal {
    pub fn new(task_id: &str, reason: BlockedReason, message: impl Into<String>) -> Self {
        Self {
            task_id: task_id.to_string(),
            reason,
            message: message.into(),
            conflict_files: Vec::new(),
            sync_strategy: None,
        }
    }

    pub fn with_conflicts(mut self, files: Vec<String>, strategy: SyncStrategy) -> Self {
        self.conflict_files = files;
        self.sync_strategy = Some(strategy);
        self
    }
}

/// Everything an operator needs to unblock a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedContext {
    pub task_id: String,
    pub reason: Option<BlockedReason>,
    pub error: Option<String>,
    pub worktree_path: PathBuf,
    pub branch: String,
    pub conflict_files: Vec<String>,
    pub sync_strategy: SyncStrategy,
    pub target_branch: String,
    /// Phase waiting on a gate decision, if any
    pub gate_phase: Option<String>,
}

impl BlockedContext {
    pub fn from_task(task: &Task, settings: &Settings, project_dir: &Path) -> Self {
        let worktree_path = match task.meta(meta::WORKTREE_PATH) {
            Some(path) => PathBuf::from(path),
            None if settings.git.worktrees => {
                let root = if settings.git.worktree_dir.is_absolute() {
                    settings.git.worktree_dir.clone()
                } else {
                    project_dir.join(&settings.git.worktree_dir)
                };
                root.join(&task.id)
            }
            None => project_dir.to_path_buf(),
        };

        let conflict_files = task
            .meta(meta::CONFLICT_FILES)
            .map(|files| {
                files
                    .lines()
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let sync_strategy = task
            .meta(meta::SYNC_STRATEGY)
            .and_then(|s| s.parse().ok())
            .unwrap_or(settings.finalize.sync_strategy);

        let target_branch = task
            .meta(meta::TARGET_BRANCH)
            .map(str::to_string)
            .unwrap_or_else(|| settings.git.target_branch.clone());

        let branch = if task.branch.is_empty() {
            settings.git.branch_name(&task.id)
        } else {
            task.branch.clone()
        };

        Self {
            task_id: task.id.clone(),
            reason: task.blocked_reason(),
            error: task.meta(meta::BLOCKED_ERROR).map(str::to_string),
            worktree_path,
            branch,
            conflict_files,
            sync_strategy,
            target_branch,
            gate_phase: task.meta(meta::GATE_PHASE).map(str::to_string),
        }
    }

    /// Step-by-step instructions for the operator.
    pub fn guidance(&self) -> Vec<String> {
        let dir = self.worktree_path.display();
        let id = &self.task_id;
        match self.reason {
            Some(BlockedReason::SyncConflict) => {
                let mut steps = vec![format!("cd {}", dir)];
                match self.sync_strategy {
                    SyncStrategy::Merge => {
                        steps.push(format!("git merge {}", self.target_branch));
                        steps.push(format!(
                            "Resolve conflicts in: {}",
                            self.conflict_files.join(", ")
                        ));
                        steps.push("git add <files> && git commit".to_string());
                    }
                    SyncStrategy::Rebase => {
                        steps.push(format!("git rebase {}", self.target_branch));
                        steps.push(format!(
                            "Resolve conflicts in: {}",
                            self.conflict_files.join(", ")
                        ));
                        steps.push("git add <files> && git rebase --continue".to_string());
                    }
                }
                steps.push(format!("taskforge resume {}", id));
                steps
            }
            Some(BlockedReason::AwaitingApproval) => {
                let phase = self.gate_phase.as_deref().unwrap_or("<phase>");
                vec![
                    format!("Review the {} output with `taskforge show {}`", phase, id),
                    format!("taskforge approve {} --phase {}", id, phase),
                    format!(
                        "or: taskforge reject {} --phase {} --reason \"...\"",
                        id, phase
                    ),
                    format!("taskforge resume {}", id),
                ]
            }
            Some(BlockedReason::GateRejected) => vec![
                "Read the rejection reason above and adjust the task or code".to_string(),
                format!("taskforge resume {}", id),
                format!("or rewind: taskforge rewind {} <phase>", id),
            ],
            Some(BlockedReason::RetryPending) => vec![
                format!("Check the failure with `taskforge show {}`", id),
                format!("taskforge resume {} (reruns from the retry target)", id),
            ],
            Some(BlockedReason::Interrupted) | Some(BlockedReason::ForcedResume) => {
                vec![format!("taskforge resume {}", id)]
            }
            None => vec![format!("taskforge show {}", id)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Weight;

    fn conflicted_task() -> Task {
        let mut task = Task::new("TASK-001", "t", Weight::Small);
        task.mark_blocked(BlockedReason::SyncConflict, "merge conflict");
        task.set_meta(meta::CONFLICT_FILES, "a.go\nb.go");
        task.set_meta(meta::SYNC_STRATEGY, "rebase");
        task.set_meta(meta::TARGET_BRANCH, "develop");
        task
    }

    #[test]
    fn test_context_from_conflict_metadata() {
        let ctx = BlockedContext::from_task(
            &conflicted_task(),
            &Settings::default(),
            Path::new("/repo"),
        );
        assert_eq!(ctx.reason, Some(BlockedReason::SyncConflict));
        assert_eq!(ctx.conflict_files, vec!["a.go", "b.go"]);
        assert_eq!(ctx.sync_strategy, SyncStrategy::Rebase);
        assert_eq!(ctx.target_branch, "develop");
        assert_eq!(ctx.worktree_path, PathBuf::from("/repo"));
        assert_eq!(ctx.branch, "taskforge/TASK-001");
    }

    #[test]
    fn test_context_defaults_from_settings() {
        let mut task = Task::new("TASK-002", "t", Weight::Small);
        task.mark_blocked(BlockedReason::GateRejected, "review rejected");
        let mut settings = Settings::default();
        settings.git.worktrees = true;
        let ctx = BlockedContext::from_task(&task, &settings, Path::new("/repo"));
        assert!(ctx.conflict_files.is_empty());
        assert_eq!(ctx.sync_strategy, SyncStrategy::Merge);
        assert_eq!(ctx.target_branch, "main");
        assert_eq!(
            ctx.worktree_path,
            PathBuf::from("/repo/.taskforge/worktrees/TASK-002")
        );
        assert_eq!(ctx.error.as_deref(), Some("review rejected"));
    }

    #[test]
    fn test_rebase_guidance_names_files_and_continue() {
        let ctx = BlockedContext::from_task(
            &conflicted_task(),
            &Settings::default(),
            Path::new("/repo"),
        );
        let steps = ctx.guidance();
        assert_eq!(steps[0], "cd /repo");
        assert!(steps.iter().any(|s| s == "git rebase develop"));
        assert!(steps.iter().any(|s| s.contains("a.go, b.go")));
        assert!(steps.iter().any(|s| s.contains("rebase --continue")));
        assert_eq!(steps.last().map(String::as_str), Some("taskforge resume TASK-001"));
    }

    #[test]
    fn test_approval_guidance_names_phase() {
        let mut task = Task::new("TASK-003", "t", Weight::Small);
        task.mark_blocked(BlockedReason::AwaitingApproval, "awaiting approval");
        task.set_meta(meta::GATE_PHASE, "review");
        let ctx = BlockedContext::from_task(&task, &Settings::default(), Path::new("/repo"));
        assert!(
            ctx.guidance()
                .iter()
                .any(|s| s == "taskforge approve TASK-003 --phase review")
        );
    }

    #[test]
    fn test_retry_pending_guidance_points_at_resume() {
        let mut task = Task::new("TASK-005", "t", Weight::Small);
        task.mark_blocked(BlockedReason::RetryPending, "review failed");
        let ctx = BlockedContext::from_task(&task, &Settings::default(), Path::new("/repo"));
        let steps = ctx.guidance();
        assert_eq!(steps[0], "Check the failure with `taskforge show TASK-005`");
        assert!(steps[1].starts_with("taskforge resume TASK-005"));
    }

    #[test]
    fn test_signal_with_conflicts() {
        let signal = BlockedSignal::new("TASK-001", BlockedReason::SyncConflict, "conflict")
            .with_conflicts(vec!["a.go".into()], SyncStrategy::Merge);
        assert_eq!(signal.sync_strategy, Some(SyncStrategy::Merge));
        assert_eq!(signal.conflict_files.len(), 1);
    }
}
