use anyhow::anyhow;
use tracing::info;

use crate::errors::ExecutorError;
use crate::orchestrator::Executor;
use crate::plan::build_plan;
use crate::state::ExecutionState;
use crate::task::{Task, TaskStatus};

impl Executor {
    /// Reset the task branch to the checkpoint before `phase_id` and return
    /// that phase and every later one to pending.
    ///
    /// The checkpoint is the previous phase's commit, or the branch base when
    /// rewinding to the first phase. Returns the commit the branch now points at.
    pub fn rewind_to_phase(
        &self,
        task: &mut Task,
        state: &mut ExecutionState,
        phase_id: &str,
    ) -> Result<String, ExecutorError> {
        if task.status.is_active() && state.execution.is_some() {
            return Err(anyhow!(
                "Task {} is {}; interrupt it before rewinding",
                task.id,
                task.status
            )
            .into());
        }

        let plan = self.prepare_plan(&build_plan(&task.id, task.weight), task.weight);
        let idx = plan
            .index_of(phase_id)
            .ok_or_else(|| ExecutorError::PhaseNotFound {
                task_id: task.id.clone(),
                phase: phase_id.to_string(),
            })?;

        let checkpoint = plan.phases[..idx]
            .iter()
            .rev()
            .find_map(|p| state.phase(&p.id).and_then(|s| s.commit_sha.clone()))
            .or_else(|| state.base_commit.clone())
            .ok_or_else(|| anyhow!("No checkpoint recorded before phase {}", phase_id))?;

        let ws = self.vcs.prepare(task, &self.settings.git.target_branch)?;
        self.vcs.rewind(&ws, &checkpoint)?;

        for phase in &plan.phases[idx..] {
            state.reset_phase(&phase.id);
        }
        state.clear_retry_context();
        state.clear_execution();
        state.current_phase = Some(phase_id.to_string());
        state.finalize = None;
        state.completed_at = None;

        task.current_phase = Some(phase_id.to_string());
        task.completed_at = None;
        task.clear_blocked();
        task.set_status(TaskStatus::Paused);
        self.save(task, state)?;

        info!(task = %task.id, phase = phase_id, sha = %checkpoint, "Rewound task");
        Ok(checkpoint)
    }
}
