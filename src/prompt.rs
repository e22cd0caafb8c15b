//! Phase prompts sent to the agent.
//!
//! Each phase has built-in instructions. A project can replace them with
//! `.taskforge/prompts/<phase>.md`, which may use these placeholders:
//! `{{TASK_ID}}`, `{{TASK_TITLE}}`, `{{TASK_DESCRIPTION}}`, `{{PHASE}}`,
//! `{{RETRY_CONTEXT}}` and `{{COMPLETION_MARKER}}`.

use std::path::PathBuf;

use tracing::{debug, warn};

use crate::gates::COMPLETION_MARKER;
use crate::plan::{Phase, Plan, display_name};
use crate::state::{ExecutionState, build_retry_section};
use crate::task::Task;

fn phase_instructions(phase_id: &str) -> &'static str {
    match phase_id {
        "spec" => {
            "Write a concise specification for this task: the behaviour to add, the \
             interfaces it touches, edge cases, and how success will be verified. Save it \
             as SPEC.md in the repository root."
        }
        "tests" => {
            "Write failing tests that capture the specified behaviour. Do not implement \
             the feature yet. Make sure the tests compile or load."
        }
        "breakdown" => {
            "Break the work into small ordered steps. Record them as a checklist in \
             PLAN.md and note any risky changes."
        }
        "implement" => {
            "Implement the task. Follow existing code conventions, keep changes focused, \
             and run the test suite until it passes."
        }
        "review" => {
            "Review the changes on this branch as a strict reviewer. Fix correctness \
             problems, missing tests and unclear code directly. Report anything you could \
             not fix."
        }
        "docs" => {
            "Update user-facing documentation, changelogs and code comments affected by \
             this change."
        }
        "validate" => {
            "Run the full build, lint and test suite. Fix any failure. Report the commands \
             you ran and their results."
        }
        _ => "Complete this phase of the task.",
    }
}

/// Renders the prompt for one phase.
#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    overrides_dir: Option<PathBuf>,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look for `<phase>.md` templates in `dir`.
    pub fn with_overrides(mut self, dir: impl Into<PathBuf>) -> Self {
        self.overrides_dir = Some(dir.into());
        self
    }

    pub fn render(&self, task: &Task, plan: &Plan, phase: &Phase, state: &ExecutionState) -> String {
        let retry = state
            .retry_context
            .as_ref()
            .filter(|ctx| ctx.to_phase == phase.id)
            .map(build_retry_section)
            .unwrap_or_default();

        if let Some(template) = self.load_override(&phase.id) {
            return template
                .replace("{{TASK_ID}}", &task.id)
                .replace("{{TASK_TITLE}}", &task.title)
                .replace("{{TASK_DESCRIPTION}}", &task.description)
                .replace("{{PHASE}}", &phase.id)
                .replace("{{RETRY_CONTEXT}}", &retry)
                .replace("{{COMPLETION_MARKER}}", COMPLETION_MARKER);
        }

        let mut prompt = format!(
            "You are working on task {} ({} weight): {}\n\n",
            task.id, task.weight, task.title
        );
        if !task.description.trim().is_empty() {
            prompt.push_str("## TASK DESCRIPTION\n");
            prompt.push_str(task.description.trim());
            prompt.push_str("\n\n");
        }

        prompt.push_str("## PROGRESS\n");
        for p in &plan.phases {
            let mark = if p.id == phase.id {
                "->"
            } else if state.phase_status(&p.id).is_done() {
                "x"
            } else {
                " "
            };
            prompt.push_str(&format!("[{}] {}\n", mark, display_name(&p.id)));
        }
        prompt.push('\n');

        if !retry.is_empty() {
            prompt.push_str(&retry);
            prompt.push('\n');
        }

        prompt.push_str(&format!(
            "## CURRENT PHASE: {}\n{}\n\n",
            phase.name,
            phase_instructions(&phase.id)
        ));
        prompt.push_str(&format!(
            "## RULES\n\
             1. Check existing code before making changes\n\
             2. Only work on this phase; later phases run separately\n\
             3. Do not commit; checkpoints are created for you\n\
             4. When the phase is fully done, output {}\n",
            COMPLETION_MARKER
        ));
        prompt
    }

    fn load_override(&self, phase_id: &str) -> Option<String> {
        let path = self.overrides_dir.as_ref()?.join(format!("{}.md", phase_id));
        if !path.exists() {
            return None;
        }
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                debug!(path = %path.display(), "Using prompt override");
                Some(content)
            }
            Err(e) => {
                warn!(path = %path.display(), "Ignoring unreadable prompt override: {e}");
                None
            }
        }
    }
}
