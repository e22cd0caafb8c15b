//! Plain-text rendering of task listings, status views and operator guidance.
//!
//! Renderers return lines instead of printing so commands decide where
//! output goes.

use console::{StyledObject, style};

use crate::blocked::BlockedContext;
use crate::plan::{PhaseStatus, Plan, display_name};
use crate::state::{ExecutionState, OrphanCheck};
use crate::task::{Task, TaskStatus};

/// First seven characters of a commit id.
pub fn short_sha(sha: &str) -> &str {
    sha.get(..7).unwrap_or(sha)
}

/// Compact token count: `950`, `12.3k`, `1.2M`.
pub fn format_tokens(n: u64) -> String {
    if n < 1_000 {
        n.to_string()
    } else if n < 1_000_000 {
        format!("{:.1}k", n as f64 / 1_000.0)
    } else {
        format!("{:.1}M", n as f64 / 1_000_000.0)
    }
}

pub fn format_duration(d: chrono::Duration) -> String {
    let secs = d.num_seconds().max(0);
    if secs >= 3600 {
        format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

pub fn phase_marker(status: PhaseStatus) -> &'static str {
    match status {
        PhaseStatus::Completed => "[x]",
        PhaseStatus::Skipped => "[-]",
        PhaseStatus::Running => "[->]",
        PhaseStatus::Interrupted => "[||]",
        PhaseStatus::Failed => "[!]",
        PhaseStatus::Pending => "[ ]",
    }
}

/// Color `label` by task status.
pub fn status_style<D>(status: TaskStatus, label: D) -> StyledObject<D> {
    let label = style(label);
    match status {
        TaskStatus::Completed => label.green(),
        TaskStatus::Running | TaskStatus::Finalizing => label.cyan(),
        TaskStatus::Blocked | TaskStatus::Paused => label.yellow(),
        TaskStatus::Failed => label.red(),
        TaskStatus::Created | TaskStatus::Planned => label.dim(),
    }
}

/// Header line for `list`.
pub fn list_header() -> String {
    format!(
        "{:<10} {:<11} {:<8} {:<15} Title",
        "ID", "Status", "Weight", "Phase"
    )
}

/// One row of `list`.
pub fn task_row(task: &Task) -> String {
    let phase = task
        .current_phase
        .as_deref()
        .map(display_name)
        .unwrap_or_else(|| "-".to_string());
    // Pad before styling so escape codes don't break the columns.
    let status = status_style(task.status, format!("{:<11}", task.status.as_str()));
    format!(
        "{:<10} {} {:<8} {:<15} {}",
        task.id,
        status,
        task.weight.as_str(),
        phase,
        task.title
    )
}

/// Everything `show` prints about one task.
pub struct StatusView<'a> {
    pub task: &'a Task,
    pub plan: &'a Plan,
    pub state: &'a ExecutionState,
    pub orphan: Option<&'a OrphanCheck>,
    pub blocked: Option<&'a BlockedContext>,
}

/// Render a status view wrapped to `width` columns.
pub fn render_status(view: &StatusView<'_>, width: usize) -> Vec<String> {
    let task = view.task;
    let state = view.state;
    let mut lines = vec![
        format!("{} {}", style(&task.id).bold(), task.title),
        format!(
            "Status:  {}   Weight: {}",
            status_style(task.status, task.status.as_str()),
            task.weight
        ),
    ];
    if !task.branch.is_empty() {
        lines.push(format!("Branch:  {}", task.branch));
    }
    if !task.blocked_by.is_empty() {
        lines.push(format!("Blocked by: {}", task.blocked_by.join(", ")));
    }
    if let Some(elapsed) = state.elapsed() {
        lines.push(format!("Elapsed: {}", format_duration(elapsed)));
    }
    if !state.tokens.is_empty() {
        lines.push(format!(
            "Usage:   {} tokens, ${:.2}",
            format_tokens(state.tokens.total()),
            state.cost_usd
        ));
    }

    lines.push(String::new());
    lines.push("Phases:".to_string());
    for phase in &view.plan.phases {
        let phase_state = state.phase(&phase.id);
        let status = state.phase_status(&phase.id);
        let mut line = format!(
            "  {} {:<15} {}",
            phase_marker(status),
            display_name(&phase.id),
            style(status.as_str()).dim()
        );
        if let Some(sha) = phase_state.and_then(|p| p.commit_sha.as_deref()) {
            line.push_str(&format!("  {}", short_sha(sha)));
        }
        if phase_state.is_some_and(|p| p.awaiting_approval) {
            line.push_str(&format!("  {}", style("awaiting approval").yellow()));
        }
        lines.push(line);
        if let Some(error) = phase_state.and_then(|p| p.error.as_deref())
            && status == PhaseStatus::Failed
        {
            lines.extend(wrap_indented(error, width, "      "));
        }
    }

    if let Some(ctx) = state.retry_context.as_ref() {
        lines.push(String::new());
        lines.push(format!(
            "Retry:   {} -> {} (attempt {})",
            ctx.from_phase, ctx.to_phase, ctx.attempt
        ));
        lines.extend(wrap_indented(&ctx.reason, width, "         "));
    }

    if let Some(report) = state.finalize.as_ref() {
        lines.push(String::new());
        lines.push(format!("Finalize: {}", report.summary()));
    }

    if let Some(orphan) = view.orphan
        && orphan.orphaned
    {
        lines.push(String::new());
        lines.push(format!(
            "{} executor appears dead: {}",
            style("Orphaned:").red().bold(),
            orphan.reason
        ));
        lines.push(format!("  Run `taskforge resume {}` to recover it.", task.id));
    }

    if let Some(ctx) = view.blocked {
        lines.push(String::new());
        let reason = ctx
            .reason
            .map(|r| r.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        lines.push(format!("{} {}", style("Blocked:").yellow().bold(), reason));
        if let Some(error) = ctx.error.as_deref() {
            lines.extend(wrap_indented(error, width, "  "));
        }
        lines.push(String::new());
        lines.push("Next steps:".to_string());
        lines.extend(render_guidance(ctx, width));
    }
    lines
}

/// Numbered operator steps, wrapped with a hanging indent.
pub fn render_guidance(ctx: &BlockedContext, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    for (i, step) in ctx.guidance().iter().enumerate() {
        let number = format!("  {}. ", i + 1);
        let options = textwrap::Options::new(width.max(20))
            .initial_indent(&number)
            .subsequent_indent("     ");
        lines.extend(
            textwrap::wrap(step, options)
                .into_iter()
                .map(|l| l.into_owned()),
        );
    }
    lines
}

fn wrap_indented(text: &str, width: usize, indent: &str) -> Vec<String> {
    let options = textwrap::Options::new(width.max(20))
        .initial_indent(indent)
        .subsequent_indent(indent);
    textwrap::wrap(text, options)
        .into_iter()
        .map(|l| l.into_owned())
        .collect()
}
