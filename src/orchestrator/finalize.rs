//! The finalize phase: sync with the target branch, assess risk, gate the merge.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::blocked::BlockedSignal;
use crate::errors::{ExecutorError, ResumeError, SyncError};
use crate::events::ExecutionEvent;
use crate::gates::{GateDecision, GateOutcome};
use crate::orchestrator::Executor;
use crate::orchestrator::executor::PhaseStep;
use crate::plan::{FINALIZE_PHASE, GateKind, Phase, Plan, build_plan};
use crate::settings::SyncStrategy;
use crate::state::ExecutionState;
use crate::task::{BlockedReason, Task, TaskStatus, meta};
use crate::tracker::{DiffStats, SyncOutcome, Workspace};

/// How risky a branch's changes are to merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
            RiskLevel::Critical => write!(f, "critical"),
        }
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "critical" => Ok(RiskLevel::Critical),
            other => Err(format!(
                "Invalid risk level '{}'. Valid values: low, medium, high, critical",
                other
            )),
        }
    }
}

/// Rule-based risk from the size of the change.
pub fn classify_risk(stats: &DiffStats) -> RiskLevel {
    let files = stats.files_changed;
    let lines = stats.lines_changed();
    if files > 30 || lines > 1000 {
        RiskLevel::Critical
    } else if files > 15 || lines > 500 {
        RiskLevel::High
    } else if files > 5 || lines > 100 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

/// What finalize did, kept in execution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizeReport {
    pub target: String,
    pub strategy: SyncStrategy,
    /// Target commits were brought into the branch
    pub synced: bool,
    pub ahead: usize,
    pub behind: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk: Option<RiskLevel>,
    #[serde(default)]
    pub needs_review: bool,
    #[serde(default)]
    pub files_changed: usize,
    #[serde(default)]
    pub lines_changed: usize,
}

impl FinalizeReport {
    pub fn summary(&self) -> String {
        let sync = if self.synced {
            format!(
                "{} with {} ({} behind, {} ahead)",
                self.strategy, self.target, self.behind, self.ahead
            )
        } else {
            format!("up to date with {} ({} ahead)", self.target, self.ahead)
        };
        match self.risk {
            Some(risk) => format!(
                "{}; risk {} ({} files, {} lines)",
                sync, risk, self.files_changed, self.lines_changed
            ),
            None => format!("{}; risk not assessed", sync),
        }
    }
}

/// Caller switches for finalize.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinalizeOptions {
    /// Skip risk assessment entirely
    pub skip_risk: bool,
    /// Never let risk block the merge
    pub force_pass: bool,
}

impl Executor {
    /// Run only the finalize phase. Every earlier phase must be finished.
    pub async fn finalize_task(
        &self,
        task: &mut Task,
        phase: &Phase,
        state: &mut ExecutionState,
    ) -> Result<(), ExecutorError> {
        if !phase.is_finalize() {
            return Err(ExecutorError::PhaseNotFound {
                task_id: task.id.clone(),
                phase: phase.id.clone(),
            });
        }
        if task.status == TaskStatus::Completed {
            return Err(ResumeError::AlreadyCompleted {
                task_id: task.id.clone(),
            }
            .into());
        }

        let mut plan = self.prepare_plan(&build_plan(&task.id, task.weight), task.weight);
        if let Some(last) = plan.phases.last_mut() {
            last.gate = phase.gate;
        }
        let unfinished: Vec<&str> = plan
            .phases
            .iter()
            .filter(|p| !p.is_finalize() && !state.phase_status(&p.id).is_done())
            .map(|p| p.id.as_str())
            .collect();
        if !unfinished.is_empty() {
            return Err(anyhow::anyhow!(
                "Task {} cannot finalize; unfinished phases: {}",
                task.id,
                unfinished.join(", ")
            )
            .into());
        }

        if !state.phase_status(FINALIZE_PHASE).is_in_flight() {
            state.reset_phase(FINALIZE_PHASE);
        }
        task.clear_blocked();
        let idx = plan.index_of(FINALIZE_PHASE).unwrap_or(plan.phases.len() - 1);
        self.run(task, &plan, state, idx).await
    }

    pub(super) async fn run_finalize(
        &self,
        task: &mut Task,
        plan: &Plan,
        phase: &Phase,
        state: &mut ExecutionState,
        ws: &Workspace,
    ) -> Result<PhaseStep, ExecutorError> {
        if let Some(output) = state.pending_gate_output(&phase.id).map(str::to_string) {
            info!(task = %task.id, "Re-evaluating pending finalize gate");
            let outcome = self.evaluate_gate(task, phase, state, &output, ws).await?;
            return self.settle_gate(task, plan, phase, state, ws, &output, outcome);
        }

        state.start_phase(&phase.id);
        task.current_phase = Some(phase.id.clone());
        task.set_status(TaskStatus::Finalizing);
        self.save(task, state)?;
        self.emit(ExecutionEvent::PhaseStarted {
            task_id: task.id.clone(),
            phase: phase.id.clone(),
            attempt: state.phase(&phase.id).map(|p| p.iterations).unwrap_or(1),
        });

        let target = self.settings.git.target_branch.clone();
        let strategy = self.settings.finalize.sync_strategy;
        self.emit(ExecutionEvent::Finalize {
            task_id: task.id.clone(),
            message: format!("Syncing {} with {} ({})", ws.branch, target, strategy),
        });

        let sync_ws = ws.clone();
        let sync_target = target.clone();
        let synced = self
            .blocking_vcs(&task.id, state, move |vcs| {
                vcs.sync(&sync_ws, &sync_target, strategy)
            })
            .await;
        let sync = match synced {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(SyncError::Conflict {
                target,
                strategy,
                files,
            })) => {
                return Err(self.block_on_conflict(task, state, &phase.id, &target, strategy, files));
            }
            Ok(Err(e)) => {
                let reason = format!("sync with {} failed: {}", target, e);
                return self.handle_failure(task, plan, phase, state, &reason, "");
            }
            Err(e) => {
                let reason = format!("sync with {} did not finish: {}", target, e);
                return self.handle_failure(task, plan, phase, state, &reason, "");
            }
        };
        if self.cancel.is_cancelled() {
            return Err(self.interrupt(task, state, &phase.id));
        }

        let stats = if self.settings.finalize.risk_assessment && !self.finalize.skip_risk {
            self.diff_stats(&task.id, state, ws).await
        } else {
            None
        };
        let report = self.assess(&target, strategy, &sync, stats);
        let output = report.summary();
        info!(task = %task.id, "Finalize: {}", output);
        self.emit(ExecutionEvent::Finalize {
            task_id: task.id.clone(),
            message: output.clone(),
        });
        let needs_review = report.needs_review;
        let risk = report.risk;
        state.finalize = Some(report);
        self.save(task, state)?;

        let outcome = match risk {
            Some(risk) if needs_review && phase.gate == GateKind::Auto => {
                GateOutcome::Decided(GateDecision::reject(format!(
                    "{} risk change needs review before merge (threshold {})",
                    risk, self.settings.finalize.review_threshold
                )))
            }
            _ => self.evaluate_gate(task, phase, state, &output, ws).await?,
        };
        self.settle_gate(task, plan, phase, state, ws, &output, outcome)
    }

    fn assess(
        &self,
        target: &str,
        strategy: SyncStrategy,
        sync: &SyncOutcome,
        stats: Option<DiffStats>,
    ) -> FinalizeReport {
        let risk = stats.as_ref().map(classify_risk);
        let needs_review = !self.finalize.force_pass
            && risk.is_some_and(|r| r >= self.settings.finalize.review_threshold);

        FinalizeReport {
            target: target.to_string(),
            strategy,
            synced: sync.changed,
            ahead: sync.ahead,
            behind: sync.behind,
            risk,
            needs_review,
            files_changed: stats.map(|s| s.files_changed).unwrap_or(0),
            lines_changed: stats.map(|s| s.lines_changed()).unwrap_or(0),
        }
    }

    fn block_on_conflict(
        &self,
        task: &mut Task,
        state: &mut ExecutionState,
        phase_id: &str,
        target: &str,
        strategy: SyncStrategy,
        files: Vec<String>,
    ) -> ExecutorError {
        let message = format!(
            "{} with {} produced conflicts in {} file(s)",
            strategy,
            target,
            files.len()
        );
        warn!(task = %task.id, files = ?files, "{}", message);
        state.fail_phase(phase_id, &message);
        task.mark_blocked(BlockedReason::SyncConflict, message.clone());
        task.set_meta(meta::CONFLICT_FILES, files.join("\n"));
        task.set_meta(meta::SYNC_STRATEGY, strategy.to_string());
        task.set_meta(meta::TARGET_BRANCH, target);

        if let Err(e) = self.save(task, state) {
            return e.into();
        }
        self.emit(ExecutionEvent::TaskBlocked {
            task_id: task.id.clone(),
            reason: message.clone(),
        });
        ExecutorError::TaskBlocked(Box::new(
            BlockedSignal::new(&task.id, BlockedReason::SyncConflict, message)
                .with_conflicts(files, strategy),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(files: usize, insertions: usize, deletions: usize) -> DiffStats {
        DiffStats {
            files_changed: files,
            insertions,
            deletions,
        }
    }

    // =========================================
    // Risk classification tests
    // =========================================

    #[test]
    fn test_classify_risk_thresholds() {
        assert_eq!(classify_risk(&stats(0, 0, 0)), RiskLevel::Low);
        assert_eq!(classify_risk(&stats(5, 60, 40)), RiskLevel::Low);
        assert_eq!(classify_risk(&stats(6, 10, 0)), RiskLevel::Medium);
        assert_eq!(classify_risk(&stats(2, 80, 21)), RiskLevel::Medium);
        assert_eq!(classify_risk(&stats(16, 10, 0)), RiskLevel::High);
        assert_eq!(classify_risk(&stats(3, 400, 101)), RiskLevel::High);
        assert_eq!(classify_risk(&stats(31, 0, 0)), RiskLevel::Critical);
        assert_eq!(classify_risk(&stats(1, 1001, 0)), RiskLevel::Critical);
    }

    #[test]
    fn test_risk_levels_are_ordered() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::High < RiskLevel::Critical);
        assert_eq!("HIGH".parse::<RiskLevel>(), Ok(RiskLevel::High));
        assert!("severe".parse::<RiskLevel>().is_err());
    }

    #[test]
    fn test_report_summary() {
        let mut report = FinalizeReport {
            target: "main".into(),
            strategy: SyncStrategy::Rebase,
            synced: true,
            ahead: 3,
            behind: 2,
            risk: Some(RiskLevel::Low),
            needs_review: false,
            files_changed: 4,
            lines_changed: 80,
        };
        assert_eq!(
            report.summary(),
            "rebase with main (2 behind, 3 ahead); risk low (4 files, 80 lines)"
        );

        report.synced = false;
        report.risk = None;
        assert_eq!(report.summary(), "up to date with main (3 ahead); risk not assessed");
    }

    #[test]
    fn test_report_yaml_uses_lowercase_risk() {
        let report = FinalizeReport {
            target: "main".into(),
            strategy: SyncStrategy::Merge,
            synced: false,
            ahead: 1,
            behind: 0,
            risk: Some(RiskLevel::Critical),
            needs_review: true,
            files_changed: 40,
            lines_changed: 2000,
        };
        let yaml = serde_yaml::to_string(&report).unwrap();
        assert!(yaml.contains("risk: critical"));
        assert!(yaml.contains("strategy: merge"));
    }
}
