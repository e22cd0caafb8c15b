//! Gate evaluation: decide whether a finished phase may proceed.
//!
//! | Gate | Decision source |
//! |------|-----------------|
//! | `none` | Always approves |
//! | `auto` | Configured [`AutoCriterion`] checks on the phase output |
//! | `ai` | An [`AiReviewer`] verdict |
//! | `human` | A decision recorded on the task by `taskforge approve/reject` |
//!
//! A human gate with no recorded decision is *pending*: the orchestrator
//! parks the phase output and blocks the task until someone decides.

mod ai;
mod auto;

pub use ai::{AgentReviewer, AiReviewer, build_review_prompt, parse_review_response};
pub use auto::{AutoCriterion, COMPLETION_MARKER, CheckContext, evaluate_criteria};

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use tokio_util::sync::CancellationToken;

use crate::plan::GateKind;
use crate::task::Task;

/// An approve or reject verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    pub approved: bool,
    pub reason: String,
    pub questions: Vec<String>,
}

impl GateDecision {
    pub fn approve(reason: impl Into<String>) -> Self {
        Self {
            approved: true,
            reason: reason.into(),
            questions: Vec::new(),
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: reason.into(),
            questions: Vec::new(),
        }
    }

    pub fn with_questions(mut self, questions: Vec<String>) -> Self {
        self.questions = questions;
        self
    }
}

/// Result of evaluating a gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Decided(GateDecision),
    /// Waiting on a decision from outside the process
    Pending { reason: String },
}

/// What a gate looks at.
#[derive(Debug, Clone, Copy)]
pub struct GateInput<'a> {
    pub task: &'a Task,
    pub phase_id: &'a str,
    pub output: &'a str,
    pub working_dir: &'a Path,
}

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

/// Evaluates the gate attached to a phase.
#[derive(Clone)]
pub struct GateEvaluator {
    criteria: BTreeMap<String, Vec<AutoCriterion>>,
    reviewer: Option<Arc<dyn AiReviewer>>,
    command_timeout: Duration,
}

impl Default for GateEvaluator {
    fn default() -> Self {
        Self::new(BTreeMap::new())
    }
}

impl GateEvaluator {
    pub fn new(criteria: BTreeMap<String, Vec<AutoCriterion>>) -> Self {
        Self {
            criteria,
            reviewer: None,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_reviewer(mut self, reviewer: Arc<dyn AiReviewer>) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    pub async fn evaluate(
        &self,
        kind: GateKind,
        input: &GateInput<'_>,
        cancel: &CancellationToken,
    ) -> Result<GateOutcome> {
        let decision = match kind {
            GateKind::None => GateDecision::approve("no gate"),
            GateKind::Auto => {
                let criteria = self
                    .criteria
                    .get(input.phase_id)
                    .map(Vec::as_slice)
                    .unwrap_or(&[]);
                let check = CheckContext {
                    working_dir: input.working_dir,
                    timeout: self.command_timeout,
                    cancel,
                };
                let (approved, reason) = evaluate_criteria(criteria, input.output, &check).await;
                GateDecision {
                    approved,
                    reason,
                    questions: Vec::new(),
                }
            }
            GateKind::Ai => {
                let Some(reviewer) = self.reviewer.as_ref() else {
                    bail!("phase {} has an ai gate but no reviewer is configured", input.phase_id);
                };
                reviewer.review(input, cancel.clone()).await?
            }
            GateKind::Human => match input.task.approval(input.phase_id) {
                Some(approval) => GateDecision {
                    approved: approval.approved,
                    reason: approval.reason.unwrap_or_else(|| {
                        if approval.approved {
                            "approved by operator".to_string()
                        } else {
                            "rejected by operator".to_string()
                        }
                    }),
                    questions: Vec::new(),
                },
                None => {
                    return Ok(GateOutcome::Pending {
                        reason: format!("awaiting human approval of {}", input.phase_id),
                    });
                }
            },
        };
        Ok(GateOutcome::Decided(decision))
    }
}
