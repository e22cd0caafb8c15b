//! Agent invocation seam.
//!
//! The orchestrator talks to the coding agent only through [`AgentRunner`].
//! Runners stream [`AgentEvent`]s while they work and must stop promptly
//! when their cancellation token fires.

mod claude;

pub use claude::{ClaudeRunner, StreamCollector};

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::errors::AgentError;
use crate::state::TokenUsage;

/// One agent invocation for one phase.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub task_id: String,
    pub phase_id: String,
    /// Attempt number of this phase, starting at 1
    pub attempt: u32,
    pub prompt: String,
    pub working_dir: PathBuf,
    /// Session to continue, when resuming an interrupted phase
    pub resume_session: Option<String>,
    pub timeout: Option<Duration>,
}

/// Progress reported while the agent runs.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Text(String),
    ToolUse { name: String, description: String },
    /// Incremental usage since the previous event
    Usage { tokens: TokenUsage, cost_usd: f64 },
    Session(String),
}

/// Final result of an invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentOutcome {
    pub exit_code: i32,
    pub output: String,
    pub is_error: bool,
    pub session_id: Option<String>,
    /// Totals for the whole invocation
    pub tokens: TokenUsage,
    pub cost_usd: f64,
}

impl AgentOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.is_error
    }

    /// One-line description of a failed invocation.
    pub fn failure_summary(&self) -> String {
        if self.is_error {
            format!("agent reported an error (exit code {})", self.exit_code)
        } else {
            format!("agent exited with code {}", self.exit_code)
        }
    }
}

#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn invoke(
        &self,
        request: AgentRequest,
        events: UnboundedSender<AgentEvent>,
        cancel: CancellationToken,
    ) -> Result<AgentOutcome, AgentError>;
}
