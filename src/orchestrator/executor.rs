use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{AgentEvent, AgentOutcome, AgentRequest, AgentRunner};
use crate::blocked::BlockedSignal;
use crate::errors::{AgentError, ExecutorError, ResumeError, StorageError};
use crate::events::{EventPublisher, ExecutionEvent};
use crate::gates::{AiReviewer, GateDecision, GateEvaluator, GateInput, GateOutcome};
use crate::orchestrator::finalize::FinalizeOptions;
use crate::plan::{Phase, PhaseStatus, Plan, build_plan};
use crate::prompt::PromptBuilder;
use crate::settings::Settings;
use crate::state::retry::truncate_tail;
use crate::state::{
    ExecutionInfo, ExecutionState, ProcessProbe, RetryContext, TokenUsage, apply_resume_updates,
    select_resume_phase, validate_resumable,
};
use crate::storage::Backend;
use crate::task::{BlockedReason, Task, TaskStatus, meta};
use crate::tracker::{DiffStats, VersionControl, Workspace};

/// How long a cancelled agent gets to exit before its task is aborted.
const CANCEL_GRACE: Duration = Duration::from_secs(10);

/// What the loop does after a phase returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum PhaseStep {
    Next,
    /// Jump back to an earlier phase after a routed failure
    JumpTo(String),
}

enum AgentRun {
    Finished(AgentOutcome),
    Failed(String),
    Cancelled,
}

/// Drives a task through its plan.
///
/// Construct once per run. The cancellation token is shared with whatever
/// handles shutdown signals; cancelling it makes every run operation
/// return `ExecutorError::Interrupted` after persisting state.
pub struct Executor {
    pub(super) backend: Arc<dyn Backend>,
    agent: Arc<dyn AgentRunner>,
    pub(super) vcs: Arc<dyn VersionControl>,
    gates: GateEvaluator,
    pub(super) settings: Settings,
    prompts: PromptBuilder,
    publisher: Option<Arc<dyn EventPublisher>>,
    pub(super) cancel: CancellationToken,
    ignore_blockers: bool,
    pub(super) finalize: FinalizeOptions,
}

impl Executor {
    pub fn new(
        backend: Arc<dyn Backend>,
        agent: Arc<dyn AgentRunner>,
        vcs: Arc<dyn VersionControl>,
        settings: Settings,
    ) -> Self {
        Self {
            backend,
            agent,
            vcs,
            gates: GateEvaluator::new(settings.gates.criteria.clone())
                .with_command_timeout(settings.gates.command_timeout()),
            settings,
            prompts: PromptBuilder::new(),
            publisher: None,
            cancel: CancellationToken::new(),
            ignore_blockers: false,
            finalize: FinalizeOptions::default(),
        }
    }

    pub fn with_reviewer(mut self, reviewer: Arc<dyn AiReviewer>) -> Self {
        self.gates = self.gates.with_reviewer(reviewer);
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_prompts(mut self, prompts: PromptBuilder) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn ignore_blockers(mut self, ignore: bool) -> Self {
        self.ignore_blockers = ignore;
        self
    }

    pub fn with_finalize_options(mut self, options: FinalizeOptions) -> Self {
        self.finalize = options;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run every unfinished phase of `plan`, then finalize.
    ///
    /// Only fresh tasks start here. A task that stopped for any reason goes
    /// back in through `resume_task` or `resume_from_phase`.
    pub async fn execute_task(
        &self,
        task: &mut Task,
        plan: &Plan,
        state: &mut ExecutionState,
    ) -> Result<(), ExecutorError> {
        match task.status {
            TaskStatus::Created | TaskStatus::Planned => {}
            TaskStatus::Completed => {
                return Err(ResumeError::AlreadyCompleted {
                    task_id: task.id.clone(),
                }
                .into());
            }
            status => {
                return Err(ExecutorError::ResumeRequired {
                    task_id: task.id.clone(),
                    status: status.to_string(),
                });
            }
        }
        let plan = self.prepare_plan(plan, task.weight);
        self.run(task, &plan, state, 0).await
    }

    /// Continue execution at `phase_id`.
    ///
    /// An interrupted phase is picked up as it stands: its agent session is
    /// continued, and output parked behind a pending gate is re-evaluated
    /// without re-running the agent. Any other target phase is reset; if it
    /// had already completed, the phases after it are reset as well.
    pub async fn resume_from_phase(
        &self,
        task: &mut Task,
        plan: &Plan,
        state: &mut ExecutionState,
        phase_id: &str,
    ) -> Result<(), ExecutorError> {
        let plan = self.prepare_plan(plan, task.weight);
        let idx = plan
            .index_of(phase_id)
            .ok_or_else(|| ExecutorError::PhaseNotFound {
                task_id: task.id.clone(),
                phase: phase_id.to_string(),
            })?;
        self.check_blockers(task)?;

        if !state.phase_status(phase_id).is_in_flight() {
            let reset_later = state.phase_status(phase_id).is_done();
            state.reset_phase(phase_id);
            if reset_later {
                for phase in &plan.phases[idx + 1..] {
                    state.reset_phase(&phase.id);
                }
            }
        }
        task.clear_blocked();
        info!(task = %task.id, phase = phase_id, "Resuming");
        self.run(task, &plan, state, idx).await
    }

    /// Validate, recover and resume a stopped task from the phase its state selects.
    pub async fn resume_task(
        &self,
        task: &mut Task,
        state: &mut ExecutionState,
        force: bool,
        probe: &dyn ProcessProbe,
    ) -> Result<(), ExecutorError> {
        let validation = validate_resumable(
            task,
            state,
            force,
            self.settings.execution.stale_threshold(),
            probe,
        )?;
        if validation.requires_state_update {
            info!(
                task = %task.id,
                reason = validation.reason.as_deref().unwrap_or(""),
                "Recovering previous execution"
            );
            apply_resume_updates(task, state, &validation);
            self.save(task, state)?;
        }

        let plan = self.prepare_plan(&build_plan(&task.id, task.weight), task.weight);
        let phase = select_resume_phase(&plan, state, &self.settings.retry_map())?;
        self.resume_from_phase(task, &plan, state, &phase).await
    }

    /// Apply configured gates and append the finalize phase.
    pub fn prepare_plan(&self, plan: &Plan, weight: crate::task::Weight) -> Plan {
        self.settings.configure_plan(Plan {
            weight,
            ..plan.clone()
        })
    }

    fn check_blockers(&self, task: &Task) -> Result<(), ExecutorError> {
        if self.ignore_blockers || task.blocked_by.is_empty() {
            return Ok(());
        }
        let mut unresolved = Vec::new();
        for id in &task.blocked_by {
            match self.backend.load_task(id) {
                Ok(blocker) if blocker.status == TaskStatus::Completed => {}
                Ok(_) => unresolved.push(id.clone()),
                Err(e) if e.is_not_found() => unresolved.push(format!("{} (missing)", id)),
                Err(e) => return Err(e.into()),
            }
        }
        if unresolved.is_empty() {
            Ok(())
        } else {
            Err(ExecutorError::BlockersUnresolved {
                task_id: task.id.clone(),
                blockers: unresolved,
            })
        }
    }

    /// The phase loop, starting at `start` of an already prepared plan.
    pub(super) async fn run(
        &self,
        task: &mut Task,
        plan: &Plan,
        state: &mut ExecutionState,
        start: usize,
    ) -> Result<(), ExecutorError> {
        self.check_blockers(task)?;
        self.backend.save_plan(plan)?;

        let target = self.settings.git.target_branch.clone();
        let ws = self.vcs.prepare(task, &target)?;
        task.branch = ws.branch.clone();
        if ws.isolated {
            task.set_meta(meta::WORKTREE_PATH, ws.path.display().to_string());
        }
        if state.base_commit.is_none() {
            state.base_commit = ws.base_commit.clone();
        }

        state.start_execution(ExecutionInfo::current());
        if task.started_at.is_none() {
            task.started_at = Some(Utc::now());
        }
        task.set_status(TaskStatus::Running);
        self.save(task, state)?;
        info!(task = %task.id, branch = %ws.branch, phases = plan.phases.len(), "Starting execution");

        let mut idx = start;
        while let Some(phase) = plan.phases.get(idx) {
            if state.phase_status(&phase.id).is_done() {
                debug!(phase = %phase.id, "Skipping finished phase");
                idx += 1;
                continue;
            }
            if self.cancel.is_cancelled() {
                return Err(self.interrupt(task, state, &phase.id));
            }

            let step = if phase.is_finalize() {
                self.run_finalize(task, plan, phase, state, &ws).await?
            } else {
                self.run_phase(task, plan, phase, state, &ws).await?
            };
            match step {
                PhaseStep::Next => idx += 1,
                PhaseStep::JumpTo(target) => {
                    idx = plan.index_of(&target).unwrap_or(idx + 1);
                }
            }
        }

        self.complete_task(task, state, &ws).await
    }

    async fn run_phase(
        &self,
        task: &mut Task,
        plan: &Plan,
        phase: &Phase,
        state: &mut ExecutionState,
        ws: &Workspace,
    ) -> Result<PhaseStep, ExecutorError> {
        let output = match state.pending_gate_output(&phase.id) {
            Some(output) => {
                info!(phase = %phase.id, "Re-evaluating pending gate with stored output");
                output.to_string()
            }
            None => match self.invoke_agent(task, plan, phase, state, ws).await? {
                AgentRun::Finished(outcome) if outcome.succeeded() => outcome.output,
                AgentRun::Finished(outcome) => {
                    let reason = outcome.failure_summary();
                    return self.handle_failure(task, plan, phase, state, &reason, &outcome.output);
                }
                AgentRun::Failed(reason) => {
                    return self.handle_failure(task, plan, phase, state, &reason, "");
                }
                AgentRun::Cancelled => return Err(self.interrupt(task, state, &phase.id)),
            },
        };

        let outcome = self.evaluate_gate(task, phase, state, &output, ws).await?;
        self.settle_gate(task, plan, phase, state, ws, &output, outcome)
    }

    async fn invoke_agent(
        &self,
        task: &mut Task,
        plan: &Plan,
        phase: &Phase,
        state: &mut ExecutionState,
        ws: &Workspace,
    ) -> Result<AgentRun, ExecutorError> {
        let resume_session = match state.phase_status(&phase.id) {
            PhaseStatus::Interrupted | PhaseStatus::Running => {
                state.session_id(&phase.id).map(str::to_string)
            }
            _ => None,
        };
        state.start_phase(&phase.id);
        task.current_phase = Some(phase.id.clone());
        self.save(task, state)?;

        let attempt = state.phase(&phase.id).map(|p| p.iterations).unwrap_or(1);
        info!(task = %task.id, phase = %phase.id, attempt, "Starting phase");
        self.emit(ExecutionEvent::PhaseStarted {
            task_id: task.id.clone(),
            phase: phase.id.clone(),
            attempt,
        });

        let request = AgentRequest {
            task_id: task.id.clone(),
            phase_id: phase.id.clone(),
            attempt,
            prompt: self.prompts.render(task, plan, phase, state),
            working_dir: ws.path.clone(),
            resume_session,
            timeout: self.settings.agent.phase_timeout(),
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let agent = Arc::clone(&self.agent);
        let token = self.cancel.child_token();
        let mut handle = tokio::spawn(async move { agent.invoke(request, tx, token).await });

        let mut heartbeat = self.heartbeat_ticker();

        let mut streamed = (TokenUsage::default(), 0.0_f64);
        let joined = loop {
            tokio::select! {
                biased;
                Some(event) = rx.recv() => {
                    self.on_agent_event(&task.id, &phase.id, state, event, &mut streamed);
                }
                joined = &mut handle => break joined,
                _ = heartbeat.tick() => self.beat(&task.id, state),
                _ = self.cancel.cancelled() => {
                    match tokio::time::timeout(CANCEL_GRACE, &mut handle).await {
                        Ok(joined) => break joined,
                        Err(_) => {
                            warn!(phase = %phase.id, "Agent ignored cancellation, aborting");
                            handle.abort();
                            break Ok(Err(AgentError::Cancelled));
                        }
                    }
                }
            }
        };
        while let Ok(event) = rx.try_recv() {
            self.on_agent_event(&task.id, &phase.id, state, event, &mut streamed);
        }

        let result = match joined {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(AgentError::Cancelled)) => return Ok(AgentRun::Cancelled),
            Ok(Err(_)) if self.cancel.is_cancelled() => return Ok(AgentRun::Cancelled),
            Ok(Err(e)) => return Ok(AgentRun::Failed(e.to_string())),
            Err(e) => return Ok(AgentRun::Failed(format!("agent task failed: {}", e))),
        };
        if self.cancel.is_cancelled() {
            return Ok(AgentRun::Cancelled);
        }

        // Totals from the final result cover anything the stream missed.
        let missing = result.tokens.saturating_sub(&streamed.0);
        let missing_cost = (result.cost_usd - streamed.1).max(0.0);
        if !missing.is_empty() || missing_cost > 0.0 {
            state.add_usage(&phase.id, missing, missing_cost);
        }
        if let Some(session) = result.session_id.as_deref()
            && state.session_id(&phase.id) != Some(session)
        {
            state.set_session_id(&phase.id, session);
        }
        debug!(
            phase = %phase.id,
            exit_code = result.exit_code,
            tokens = state.phase(&phase.id).map(|p| p.tokens.total()).unwrap_or(0),
            "Agent finished"
        );
        Ok(AgentRun::Finished(result))
    }

    fn on_agent_event(
        &self,
        task_id: &str,
        phase_id: &str,
        state: &mut ExecutionState,
        event: AgentEvent,
        streamed: &mut (TokenUsage, f64),
    ) {
        match event {
            AgentEvent::Text(text) => self.emit(ExecutionEvent::AgentOutput {
                task_id: task_id.to_string(),
                phase: phase_id.to_string(),
                text,
            }),
            AgentEvent::ToolUse { name, description } => self.emit(ExecutionEvent::ToolUse {
                task_id: task_id.to_string(),
                phase: phase_id.to_string(),
                name,
                description,
            }),
            AgentEvent::Usage { tokens, cost_usd } => {
                state.add_usage(phase_id, tokens, cost_usd);
                streamed.0 += tokens;
                streamed.1 += cost_usd;
                self.emit(ExecutionEvent::Usage {
                    task_id: task_id.to_string(),
                    phase: phase_id.to_string(),
                    tokens,
                    cost_usd,
                });
            }
            AgentEvent::Session(id) => {
                state.set_session_id(phase_id, &id);
                if let Err(e) = self.backend.save_state(state) {
                    warn!(task = task_id, "Failed to persist session id: {e}");
                }
            }
        }
    }

    pub(super) async fn evaluate_gate(
        &self,
        task: &Task,
        phase: &Phase,
        state: &mut ExecutionState,
        output: &str,
        ws: &Workspace,
    ) -> Result<GateOutcome, ExecutorError> {
        let input = GateInput {
            task,
            phase_id: &phase.id,
            output,
            working_dir: &ws.path,
        };
        let evaluation = self.gates.evaluate(phase.gate, &input, &self.cancel);
        match self.with_heartbeat(&task.id, state, evaluation).await {
            Ok(outcome) => Ok(outcome),
            Err(_) if self.cancel.is_cancelled() => Ok(GateOutcome::Pending {
                reason: "interrupted".to_string(),
            }),
            Err(e) => {
                warn!(phase = %phase.id, gate = %phase.gate, "Gate evaluation failed: {e:#}");
                Ok(GateOutcome::Decided(GateDecision::reject(format!(
                    "gate evaluation failed: {:#}",
                    e
                ))))
            }
        }
    }

    /// Act on a gate outcome: complete, park, or block the phase.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn settle_gate(
        &self,
        task: &mut Task,
        plan: &Plan,
        phase: &Phase,
        state: &mut ExecutionState,
        ws: &Workspace,
        output: &str,
        outcome: GateOutcome,
    ) -> Result<PhaseStep, ExecutorError> {
        if self.cancel.is_cancelled() {
            return Err(self.interrupt(task, state, &phase.id));
        }

        let decision = match outcome {
            GateOutcome::Pending { reason } => {
                info!(task = %task.id, phase = %phase.id, "Waiting for gate decision");
                state.await_approval(&phase.id, output);
                task.mark_blocked(BlockedReason::AwaitingApproval, reason.clone());
                task.set_meta(meta::GATE_PHASE, phase.id.clone());
                self.save(task, state)?;
                self.emit(ExecutionEvent::TaskBlocked {
                    task_id: task.id.clone(),
                    reason: reason.clone(),
                });
                return Err(ExecutorError::TaskBlocked(Box::new(BlockedSignal::new(
                    &task.id,
                    BlockedReason::AwaitingApproval,
                    reason,
                ))));
            }
            GateOutcome::Decided(decision) => decision,
        };

        state.record_gate(&phase.id, phase.gate, decision.approved, &decision.reason);
        self.emit(ExecutionEvent::GateEvaluated {
            task_id: task.id.clone(),
            phase: phase.id.clone(),
            kind: phase.gate,
            approved: decision.approved,
            reason: decision.reason.clone(),
        });
        task.clear_approval(&phase.id);

        if !decision.approved {
            return Err(self.reject(task, plan, phase, state, output, &decision.reason));
        }

        let commit = match self.vcs.checkpoint(ws, &task.id, &phase.id) {
            Ok(sha) => {
                debug!(phase = %phase.id, %sha, "Checkpoint created");
                Some(sha)
            }
            Err(e) => {
                warn!(task = %task.id, phase = %phase.id, "Checkpoint failed: {e:#}");
                self.emit(ExecutionEvent::Warning {
                    task_id: task.id.clone(),
                    message: format!("checkpoint for {} failed: {:#}", phase.id, e),
                });
                None
            }
        };
        state.complete_phase(&phase.id, commit.clone());
        if state
            .retry_context
            .as_ref()
            .is_some_and(|ctx| ctx.from_phase == phase.id)
        {
            state.clear_retry_context();
        }
        self.save(task, state)?;

        info!(task = %task.id, phase = %phase.id, "Phase completed");
        self.emit(ExecutionEvent::PhaseCompleted {
            task_id: task.id.clone(),
            phase: phase.id.clone(),
            commit,
        });
        Ok(PhaseStep::Next)
    }

    /// Gate rejection: fail the phase, keep the task, block it.
    fn reject(
        &self,
        task: &mut Task,
        plan: &Plan,
        phase: &Phase,
        state: &mut ExecutionState,
        output: &str,
        reason: &str,
    ) -> ExecutorError {
        info!(task = %task.id, phase = %phase.id, "Gate rejected: {}", reason);
        let message = format!("{} gate rejected {}: {}", phase.gate, phase.id, reason);
        state.fail_phase(&phase.id, &message);
        if let Some(target) = self.settings.retry_map().target_for(&phase.id, plan) {
            let attempt = state.increment_retry(&phase.id);
            state.set_retry_context(RetryContext {
                from_phase: phase.id.clone(),
                to_phase: target.to_string(),
                reason: reason.to_string(),
                failure_output: truncate_tail(output, self.settings.execution.retry_output_chars),
                attempt,
                created_at: Utc::now(),
            });
        }
        task.mark_blocked(BlockedReason::GateRejected, message.clone());
        task.set_meta(meta::GATE_PHASE, phase.id.clone());
        task.set_meta(meta::GATE_REJECTION, reason);

        if let Err(e) = self.save(task, state) {
            return e.into();
        }
        self.emit(ExecutionEvent::TaskBlocked {
            task_id: task.id.clone(),
            reason: message.clone(),
        });
        ExecutorError::TaskBlocked(Box::new(BlockedSignal::new(
            &task.id,
            BlockedReason::GateRejected,
            message,
        )))
    }

    /// Agent or sync failure: route back to an earlier phase, or fail the task.
    /// Without auto-retry a routed failure leaves the task blocked until resume.
    pub(super) fn handle_failure(
        &self,
        task: &mut Task,
        plan: &Plan,
        phase: &Phase,
        state: &mut ExecutionState,
        reason: &str,
        output: &str,
    ) -> Result<PhaseStep, ExecutorError> {
        warn!(task = %task.id, phase = %phase.id, "Phase failed: {}", reason);
        state.fail_phase(&phase.id, reason);
        task.set_meta(meta::LAST_ERROR, reason);
        self.emit(ExecutionEvent::PhaseFailed {
            task_id: task.id.clone(),
            phase: phase.id.clone(),
            error: reason.to_string(),
        });

        let execution = &self.settings.execution;
        let target = self
            .settings
            .retry_map()
            .target_for(&phase.id, plan)
            .map(str::to_string);
        if let Some(target) = target
            && state.retry_count(&phase.id) < execution.max_retries
        {
            let attempt = state.increment_retry(&phase.id);
            state.set_retry_context(RetryContext {
                from_phase: phase.id.clone(),
                to_phase: target.clone(),
                reason: reason.to_string(),
                failure_output: truncate_tail(output, execution.retry_output_chars),
                attempt,
                created_at: Utc::now(),
            });
            self.emit(ExecutionEvent::PhaseRetrying {
                task_id: task.id.clone(),
                from: phase.id.clone(),
                to: target.clone(),
                attempt,
            });

            if execution.auto_retry {
                info!(from = %phase.id, to = %target, attempt, "Retrying from earlier phase");
                // target_for never routes forward
                let from_idx = plan.index_of(&target).unwrap_or(0);
                let to_idx = plan.index_of(&phase.id).unwrap_or(from_idx);
                for p in &plan.phases[from_idx..=to_idx] {
                    state.reset_phase(&p.id);
                }
                self.save(task, state)?;
                return Ok(PhaseStep::JumpTo(target));
            }

            let message = format!("{} failed, retry from {} pending: {}", phase.id, target, reason);
            info!(from = %phase.id, to = %target, attempt, "Retry deferred until resume");
            task.current_phase = Some(phase.id.clone());
            task.mark_blocked(BlockedReason::RetryPending, message.clone());
            self.save(task, state)?;
            self.emit(ExecutionEvent::TaskBlocked {
                task_id: task.id.clone(),
                reason: message.clone(),
            });
            return Err(ExecutorError::TaskBlocked(Box::new(BlockedSignal::new(
                &task.id,
                BlockedReason::RetryPending,
                message,
            ))));
        }

        task.set_status(TaskStatus::Failed);
        self.save(task, state)?;
        self.emit(ExecutionEvent::TaskFailed {
            task_id: task.id.clone(),
            error: reason.to_string(),
        });
        Err(ExecutorError::PhaseFailed {
            phase: phase.id.clone(),
            message: reason.to_string(),
        })
    }

    /// Persist an interrupted phase and blocked task. Save failures are only logged.
    pub(super) fn interrupt(
        &self,
        task: &mut Task,
        state: &mut ExecutionState,
        phase_id: &str,
    ) -> ExecutorError {
        info!(task = %task.id, phase = phase_id, "Execution interrupted");
        // A phase that never started stays pending
        let message = if state.phase_status(phase_id) == PhaseStatus::Running {
            state.interrupt_phase(phase_id);
            format!("interrupted during {}", phase_id)
        } else {
            format!("interrupted before {}", phase_id)
        };
        task.current_phase = Some(phase_id.to_string());
        task.mark_blocked(BlockedReason::Interrupted, message);
        if let Err(e) = self.backend.save_state(state) {
            warn!(task = %task.id, "Failed to save state while interrupting: {e}");
        }
        if let Err(e) = self.backend.save_task(task) {
            warn!(task = %task.id, "Failed to save task while interrupting: {e}");
        }
        self.emit(ExecutionEvent::TaskInterrupted {
            task_id: task.id.clone(),
            phase: phase_id.to_string(),
        });
        ExecutorError::Interrupted {
            phase: phase_id.to_string(),
        }
    }

    async fn complete_task(
        &self,
        task: &mut Task,
        state: &mut ExecutionState,
        ws: &Workspace,
    ) -> Result<(), ExecutorError> {
        state.diff_stats = self.diff_stats(&task.id, state, ws).await;
        state.mark_complete();
        task.set_status(TaskStatus::Completed);
        task.completed_at = Some(Utc::now());
        task.current_phase = None;
        task.clear_blocked();
        task.remove_meta(meta::LAST_ERROR);
        self.save(task, state)?;

        if ws.isolated
            && self.settings.git.cleanup_worktree_on_complete
            && let Err(e) = self.vcs.cleanup(ws)
        {
            warn!(task = %task.id, "Worktree cleanup failed: {e:#}");
        }
        info!(task = %task.id, "Task completed");
        self.emit(ExecutionEvent::TaskCompleted {
            task_id: task.id.clone(),
        });
        Ok(())
    }

    /// Diff of the workspace against the target branch, if git can produce one.
    pub(super) async fn diff_stats(
        &self,
        task_id: &str,
        state: &mut ExecutionState,
        ws: &Workspace,
    ) -> Option<DiffStats> {
        let target = self.settings.git.target_branch.clone();
        let ws = ws.clone();
        match self
            .blocking_vcs(task_id, state, move |vcs| vcs.diff_stats(&ws, &target))
            .await
        {
            Ok(Ok(stats)) => Some(stats),
            Ok(Err(e)) => {
                warn!(task = task_id, "Diff stats unavailable: {e:#}");
                None
            }
            Err(e) => {
                warn!(task = task_id, "Diff stats task failed: {e}");
                None
            }
        }
    }

    /// Run a git operation on the blocking pool. The heartbeat keeps beating meanwhile.
    pub(super) async fn blocking_vcs<T, F>(
        &self,
        task_id: &str,
        state: &mut ExecutionState,
        call: F,
    ) -> Result<T, JoinError>
    where
        F: FnOnce(&dyn VersionControl) -> T + Send + 'static,
        T: Send + 'static,
    {
        let vcs = Arc::clone(&self.vcs);
        let handle = tokio::task::spawn_blocking(move || call(vcs.as_ref()));
        self.with_heartbeat(task_id, state, handle).await
    }

    /// Drive `fut` to completion, refreshing the persisted heartbeat every interval.
    pub(super) async fn with_heartbeat<F: Future>(
        &self,
        task_id: &str,
        state: &mut ExecutionState,
        fut: F,
    ) -> F::Output {
        tokio::pin!(fut);
        let mut heartbeat = self.heartbeat_ticker();
        loop {
            tokio::select! {
                biased;
                out = &mut fut => return out,
                _ = heartbeat.tick() => self.beat(task_id, state),
            }
        }
    }

    fn heartbeat_ticker(&self) -> Interval {
        let period = self.settings.execution.heartbeat_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    fn beat(&self, task_id: &str, state: &mut ExecutionState) {
        state.update_heartbeat();
        if let Err(e) = self.backend.save_state(state) {
            warn!(task = task_id, "Heartbeat save failed: {e}");
        }
    }

    pub(super) fn save(&self, task: &Task, state: &ExecutionState) -> Result<(), StorageError> {
        self.backend.save_state(state)?;
        self.backend.save_task(task)
    }

    pub(super) fn emit(&self, event: ExecutionEvent) {
        if let Some(publisher) = &self.publisher {
            publisher.publish(&event);
        }
    }
}
