//! Retry routing: which earlier phase a failed phase sends work back to.

use std::collections::BTreeMap;

use crate::plan::Plan;
use crate::state::RetryContext;

/// Maps a failing phase to the phase that should be re-run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryMap {
    routes: BTreeMap<String, String>,
}

impl Default for RetryMap {
    fn default() -> Self {
        Self::from_pairs([("review", "implement"), ("validate", "implement")])
    }
}

impl RetryMap {
    pub fn new(routes: BTreeMap<String, String>) -> Self {
        Self { routes }
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            routes: pairs
                .into_iter()
                .map(|(from, to)| (from.to_string(), to.to_string()))
                .collect(),
        }
    }

    pub fn routes(&self) -> &BTreeMap<String, String> {
        &self.routes
    }

    /// Retry target for `failed_phase` within `plan`.
    ///
    /// Targets missing from the plan or positioned after the failed phase
    /// are ignored; a retry never jumps forward.
    pub fn target_for<'p>(&self, failed_phase: &str, plan: &'p Plan) -> Option<&'p str> {
        let target = self.routes.get(failed_phase)?;
        let failed_idx = plan.index_of(failed_phase)?;
        let target_idx = plan.index_of(target)?;
        if target_idx > failed_idx {
            tracing::warn!(
                from = failed_phase,
                to = target.as_str(),
                "ignoring forward retry route"
            );
            return None;
        }
        Some(plan.phases[target_idx].id.as_str())
    }
}

/// Keep the last `max_chars` characters of `text`, on a char boundary.
pub fn truncate_tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let skip = count - max_chars;
    let tail: String = text.chars().skip(skip).collect();
    format!("...[truncated]\n{}", tail)
}

/// Prompt section that tells the agent why it is being sent back.
pub fn build_retry_section(ctx: &RetryContext) -> String {
    let mut section = String::from("## Retry Context\n\n");
    section.push_str(&format!(
        "This is retry attempt {}. The `{}` phase failed and sent work back to `{}`.\n\n",
        ctx.attempt, ctx.from_phase, ctx.to_phase
    ));
    section.push_str(&format!("**Reason:** {}\n", ctx.reason));
    if !ctx.failure_output.trim().is_empty() {
        section.push_str("\n**Output from the failed phase:**\n```\n");
        section.push_str(ctx.failure_output.trim_end());
        section.push_str("\n```\n");
    }
    section.push_str("\nAddress these issues before signalling completion.\n");
    section
}
