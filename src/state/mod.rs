//! Execution state: the persisted record of a task's progress through its plan.
//!
//! `ExecutionState` is the source of truth for resume. Every transition that
//! matters for crash recovery is saved before the next side effect starts.

pub mod liveness;
pub mod resume;
pub mod retry;

use std::collections::BTreeMap;
use std::ops::AddAssign;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::orchestrator::finalize::FinalizeReport;
use crate::plan::{GateKind, PhaseStatus};
use crate::tracker::DiffStats;

pub use liveness::{OrphanCheck, ProcessProbe, SystemProbe, check_orphaned};
pub use resume::{
    ResumeValidation, apply_resume_updates, select_resume_phase, validate_resumable,
};
pub use retry::{RetryMap, build_retry_section};

/// Token counts reported by the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
    #[serde(default)]
    pub cache_creation: u64,
    #[serde(default)]
    pub cache_read: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input + self.output + self.cache_creation + self.cache_read
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Per-field difference, floored at zero.
    pub fn saturating_sub(&self, other: &TokenUsage) -> TokenUsage {
        TokenUsage {
            input: self.input.saturating_sub(other.input),
            output: self.output.saturating_sub(other.output),
            cache_creation: self.cache_creation.saturating_sub(other.cache_creation),
            cache_read: self.cache_read.saturating_sub(other.cache_read),
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: TokenUsage) {
        self.input += rhs.input;
        self.output += rhs.output;
        self.cache_creation += rhs.cache_creation;
        self.cache_read += rhs.cache_read;
    }
}

/// Who is executing the task right now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub run_id: Uuid,
    pub pid: u32,
    pub hostname: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl ExecutionInfo {
    /// Execution info for the current process.
    pub fn current() -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            pid: std::process::id(),
            hostname: liveness::current_hostname(),
            started_at: now,
            last_heartbeat: now,
        }
    }
}

/// Progress of a single phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseState {
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub tokens: TokenUsage,
    #[serde(default)]
    pub cost_usd: f64,
    /// Set while a human gate waits on this phase's output.
    #[serde(default)]
    pub awaiting_approval: bool,
    /// Agent output kept so a pending gate can be re-evaluated without re-running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_output: Option<String>,
}

/// Carried from a failed phase back to the phase it retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryContext {
    pub from_phase: String,
    pub to_phase: String,
    pub reason: String,
    #[serde(default)]
    pub failure_output: String,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
}

/// One gate decision, kept for history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateRecord {
    pub phase: String,
    pub kind: GateKind,
    pub approved: bool,
    pub reason: String,
    pub decided_at: DateTime<Utc>,
}

/// Persisted progress of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub task_id: String,
    #[serde(default)]
    pub current_phase: Option<String>,
    #[serde(default)]
    pub phases: BTreeMap<String, PhaseState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_context: Option<RetryContext>,
    #[serde(default)]
    pub retry_counts: BTreeMap<String, u32>,
    #[serde(default)]
    pub gates: Vec<GateRecord>,
    #[serde(default)]
    pub tokens: TokenUsage,
    #[serde(default)]
    pub cost_usd: f64,
    /// Commit the task branch started from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_stats: Option<DiffStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalize: Option<FinalizeReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionState {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            current_phase: None,
            phases: BTreeMap::new(),
            execution: None,
            retry_context: None,
            retry_counts: BTreeMap::new(),
            gates: Vec::new(),
            tokens: TokenUsage::default(),
            cost_usd: 0.0,
            base_commit: None,
            diff_stats: None,
            finalize: None,
            error: None,
            started_at: None,
            updated_at: Utc::now(),
            completed_at: None,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn entry(&mut self, phase_id: &str) -> &mut PhaseState {
        self.phases.entry(phase_id.to_string()).or_default()
    }

    pub fn phase(&self, phase_id: &str) -> Option<&PhaseState> {
        self.phases.get(phase_id)
    }

    /// Status of a phase; phases never touched are `Pending`.
    pub fn phase_status(&self, phase_id: &str) -> PhaseStatus {
        self.phases
            .get(phase_id)
            .map(|p| p.status)
            .unwrap_or_default()
    }

    pub fn start_phase(&mut self, phase_id: &str) {
        let now = Utc::now();
        let phase = self.entry(phase_id);
        phase.status = PhaseStatus::Running;
        phase.started_at = Some(now);
        phase.completed_at = None;
        phase.interrupted_at = None;
        phase.error = None;
        phase.iterations += 1;
        self.current_phase = Some(phase_id.to_string());
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.error = None;
        self.touch();
    }

    pub fn complete_phase(&mut self, phase_id: &str, commit_sha: Option<String>) {
        let phase = self.entry(phase_id);
        phase.status = PhaseStatus::Completed;
        phase.completed_at = Some(Utc::now());
        phase.error = None;
        phase.awaiting_approval = false;
        phase.last_output = None;
        if commit_sha.is_some() {
            phase.commit_sha = commit_sha;
        }
        self.touch();
    }

    pub fn fail_phase(&mut self, phase_id: &str, error: &str) {
        let phase = self.entry(phase_id);
        phase.status = PhaseStatus::Failed;
        phase.error = Some(error.to_string());
        phase.awaiting_approval = false;
        self.current_phase = Some(phase_id.to_string());
        self.error = Some(error.to_string());
        self.touch();
    }

    pub fn interrupt_phase(&mut self, phase_id: &str) {
        let phase = self.entry(phase_id);
        phase.status = PhaseStatus::Interrupted;
        phase.interrupted_at = Some(Utc::now());
        self.current_phase = Some(phase_id.to_string());
        self.touch();
    }

    pub fn skip_phase(&mut self, phase_id: &str, reason: &str) {
        let phase = self.entry(phase_id);
        phase.status = PhaseStatus::Skipped;
        phase.skip_reason = Some(reason.to_string());
        self.touch();
    }

    /// Return a phase to `Pending` so it runs again. Token and cost totals are kept.
    pub fn reset_phase(&mut self, phase_id: &str) {
        let phase = self.entry(phase_id);
        phase.status = PhaseStatus::Pending;
        phase.started_at = None;
        phase.completed_at = None;
        phase.interrupted_at = None;
        phase.error = None;
        phase.commit_sha = None;
        phase.awaiting_approval = false;
        phase.last_output = None;
        self.touch();
    }

    /// Park a phase's output behind a human gate.
    pub fn await_approval(&mut self, phase_id: &str, output: &str) {
        self.interrupt_phase(phase_id);
        let phase = self.entry(phase_id);
        phase.awaiting_approval = true;
        phase.last_output = Some(output.to_string());
    }

    /// Output parked behind a pending gate, if any.
    pub fn pending_gate_output(&self, phase_id: &str) -> Option<&str> {
        self.phases
            .get(phase_id)
            .filter(|p| p.awaiting_approval)
            .and_then(|p| p.last_output.as_deref())
    }

    pub fn session_id(&self, phase_id: &str) -> Option<&str> {
        self.phases.get(phase_id)?.session_id.as_deref()
    }

    pub fn set_session_id(&mut self, phase_id: &str, session_id: &str) {
        self.entry(phase_id).session_id = Some(session_id.to_string());
        self.touch();
    }

    pub fn add_usage(&mut self, phase_id: &str, tokens: TokenUsage, cost_usd: f64) {
        let phase = self.entry(phase_id);
        phase.tokens += tokens;
        phase.cost_usd += cost_usd;
        self.tokens += tokens;
        self.cost_usd += cost_usd;
        self.touch();
    }

    pub fn record_gate(&mut self, phase_id: &str, kind: GateKind, approved: bool, reason: &str) {
        self.gates.push(GateRecord {
            phase: phase_id.to_string(),
            kind,
            approved,
            reason: reason.to_string(),
            decided_at: Utc::now(),
        });
        self.touch();
    }

    pub fn set_retry_context(&mut self, ctx: RetryContext) {
        self.retry_context = Some(ctx);
        self.touch();
    }

    pub fn clear_retry_context(&mut self) {
        self.retry_context = None;
        self.touch();
    }

    pub fn retry_count(&self, phase_id: &str) -> u32 {
        self.retry_counts.get(phase_id).copied().unwrap_or(0)
    }

    pub fn increment_retry(&mut self, phase_id: &str) -> u32 {
        let count = self.retry_counts.entry(phase_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Claim the task for the current process.
    pub fn start_execution(&mut self, info: ExecutionInfo) {
        if self.started_at.is_none() {
            self.started_at = Some(info.started_at);
        }
        self.execution = Some(info);
        self.completed_at = None;
        self.touch();
    }

    pub fn update_heartbeat(&mut self) {
        if let Some(info) = self.execution.as_mut() {
            info.last_heartbeat = Utc::now();
        }
        self.touch();
    }

    pub fn clear_execution(&mut self) {
        self.execution = None;
        self.touch();
    }

    pub fn mark_complete(&mut self) {
        self.completed_at = Some(Utc::now());
        self.current_phase = None;
        self.retry_context = None;
        self.error = None;
        self.execution = None;
        self.touch();
    }

    /// First phase in `order` that has not completed or been skipped.
    pub fn first_unfinished<'a>(&self, order: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
        order
            .into_iter()
            .find(|id| !self.phase_status(id).is_done())
    }

    /// Wall-clock time since the first phase started.
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        let start = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some(end - start)
    }
}
