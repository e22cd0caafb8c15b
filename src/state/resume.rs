//! Resume validation and resume-phase selection.

use std::time::Duration;

use chrono::Utc;

use crate::errors::ResumeError;
use crate::plan::{PhaseStatus, Plan};
use crate::state::liveness::{ProcessProbe, check_orphaned};
use crate::state::{ExecutionState, RetryMap};
use crate::task::{BlockedReason, Task, TaskStatus};

/// Outcome of checking whether a task may resume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeValidation {
    /// State has to be rewritten (orphan recovery or forced takeover).
    pub requires_state_update: bool,
    /// Why the rewrite is needed.
    pub reason: Option<String>,
}

impl ResumeValidation {
    fn clean() -> Self {
        Self {
            requires_state_update: false,
            reason: None,
        }
    }
}

/// Check that `task` may be resumed.
///
/// Paused, blocked, failed and never-started tasks resume freely. A
/// running or finalizing task resumes only if its executor is orphaned, or
/// when `force` overrides a live one.
pub fn validate_resumable(
    task: &Task,
    state: &ExecutionState,
    force: bool,
    stale_after: Duration,
    probe: &dyn ProcessProbe,
) -> Result<ResumeValidation, ResumeError> {
    match task.status {
        TaskStatus::Completed => Err(ResumeError::AlreadyCompleted {
            task_id: task.id.clone(),
        }),
        TaskStatus::Paused
        | TaskStatus::Blocked
        | TaskStatus::Failed
        | TaskStatus::Created
        | TaskStatus::Planned => Ok(ResumeValidation::clean()),
        TaskStatus::Running | TaskStatus::Finalizing => {
            let check = check_orphaned(task, state, stale_after, probe, Utc::now());
            if check.orphaned {
                return Ok(ResumeValidation {
                    requires_state_update: true,
                    reason: Some(format!("orphaned: {}", check.reason)),
                });
            }
            if force {
                return Ok(ResumeValidation {
                    requires_state_update: true,
                    reason: Some(format!("forced takeover ({})", check.reason)),
                });
            }
            match state.execution.as_ref() {
                Some(info) => Err(ResumeError::StillRunning {
                    task_id: task.id.clone(),
                    pid: info.pid,
                    hostname: info.hostname.clone(),
                }),
                None => Err(ResumeError::NotResumable {
                    task_id: task.id.clone(),
                    status: task.status.to_string(),
                }),
            }
        }
    }
}

/// Apply the rewrite an orphaned or forced resume requires.
///
/// Clears the recorded executor, marks the in-flight phase interrupted, and
/// moves the task to `blocked` so the new run starts from a known state.
pub fn apply_resume_updates(
    task: &mut Task,
    state: &mut ExecutionState,
    validation: &ResumeValidation,
) {
    if !validation.requires_state_update {
        return;
    }
    let reason = validation
        .reason
        .clone()
        .unwrap_or_else(|| "resume takeover".to_string());

    let in_flight = state
        .phases
        .iter()
        .find(|(_, p)| p.status == PhaseStatus::Running)
        .map(|(id, _)| id.clone())
        .or_else(|| state.current_phase.clone());
    if let Some(phase) = in_flight
        && !state.phase_status(&phase).is_done()
    {
        state.interrupt_phase(&phase);
    }

    state.clear_execution();
    let blocked_reason = if reason.starts_with("orphaned") {
        BlockedReason::Interrupted
    } else {
        BlockedReason::ForcedResume
    };
    task.mark_blocked(blocked_reason, reason);
}

/// Pick the phase a resume should start from.
///
/// Priority: a running or interrupted phase, then the retry context's
/// target, then the retry route of a failed current phase, then the first
/// phase that has not completed.
pub fn select_resume_phase(
    plan: &Plan,
    state: &ExecutionState,
    retry: &RetryMap,
) -> Result<String, ResumeError> {
    if let Some(phase) = plan
        .phases
        .iter()
        .find(|p| state.phase_status(&p.id).is_in_flight())
    {
        return Ok(phase.id.clone());
    }

    if let Some(ctx) = state.retry_context.as_ref()
        && plan.contains(&ctx.to_phase)
    {
        return Ok(ctx.to_phase.clone());
    }

    if let Some(current) = state.current_phase.as_deref()
        && state.phase_status(current) == PhaseStatus::Failed
        && let Some(target) = retry.target_for(current, plan)
    {
        return Ok(target.to_string());
    }

    state
        .first_unfinished(plan.phases.iter().map(|p| p.id.as_str()))
        .map(str::to_string)
        .ok_or_else(|| ResumeError::NoResumePhase {
            task_id: plan.task_id.clone(),
        })
}
