//! Execution events published while a task runs.
//!
//! Publishing is optional. The orchestrator behaves identically with or
//! without a subscriber attached.

use crate::plan::GateKind;
use crate::state::TokenUsage;

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    PhaseStarted {
        task_id: String,
        phase: String,
        attempt: u32,
    },
    AgentOutput {
        task_id: String,
        phase: String,
        text: String,
    },
    ToolUse {
        task_id: String,
        phase: String,
        name: String,
        description: String,
    },
    Usage {
        task_id: String,
        phase: String,
        tokens: TokenUsage,
        cost_usd: f64,
    },
    GateEvaluated {
        task_id: String,
        phase: String,
        kind: GateKind,
        approved: bool,
        reason: String,
    },
    PhaseCompleted {
        task_id: String,
        phase: String,
        commit: Option<String>,
    },
    PhaseFailed {
        task_id: String,
        phase: String,
        error: String,
    },
    PhaseRetrying {
        task_id: String,
        from: String,
        to: String,
        attempt: u32,
    },
    Warning {
        task_id: String,
        message: String,
    },
    Finalize {
        task_id: String,
        message: String,
    },
    TaskBlocked {
        task_id: String,
        reason: String,
    },
    TaskInterrupted {
        task_id: String,
        phase: String,
    },
    TaskCompleted {
        task_id: String,
    },
    TaskFailed {
        task_id: String,
        error: String,
    },
}

impl ExecutionEvent {
    pub fn task_id(&self) -> &str {
        match self {
            ExecutionEvent::PhaseStarted { task_id, .. }
            | ExecutionEvent::AgentOutput { task_id, .. }
            | ExecutionEvent::ToolUse { task_id, .. }
            | ExecutionEvent::Usage { task_id, .. }
            | ExecutionEvent::GateEvaluated { task_id, .. }
            | ExecutionEvent::PhaseCompleted { task_id, .. }
            | ExecutionEvent::PhaseFailed { task_id, .. }
            | ExecutionEvent::PhaseRetrying { task_id, .. }
            | ExecutionEvent::Warning { task_id, .. }
            | ExecutionEvent::Finalize { task_id, .. }
            | ExecutionEvent::TaskBlocked { task_id, .. }
            | ExecutionEvent::TaskInterrupted { task_id, .. }
            | ExecutionEvent::TaskCompleted { task_id }
            | ExecutionEvent::TaskFailed { task_id, .. } => task_id,
        }
    }
}

/// Receives execution events. Implementations must not block.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: &ExecutionEvent);
}

/// Publisher that records every event, for inspection.
#[derive(Default)]
pub struct RecordingPublisher {
    events: std::sync::Mutex<Vec<ExecutionEvent>>,
}

impl RecordingPublisher {
    pub fn events(&self) -> Vec<ExecutionEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, event: &ExecutionEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
