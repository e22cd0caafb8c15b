//! Task inspection and operator decisions: `list`, `show`, `approve`,
//! `reject`, `rewind`.

use anyhow::Result;
use std::path::Path;

use taskforge::plan::Plan;
use taskforge::storage::Backend;
use taskforge::task::Task;

use super::super::Cli;
use super::{Project, open_project, term_width};

pub fn cmd_list(cli: &Cli, project_dir: &Path) -> Result<()> {
    use taskforge::ui::summary::{list_header, task_row};

    let project = open_project(cli, project_dir)?;
    let mut tasks = project.backend.list_tasks()?;
    if tasks.is_empty() {
        println!("No tasks yet. Create one with `taskforge new \"<title>\"`.");
        return Ok(());
    }
    tasks.sort_by(|a, b| a.id.cmp(&b.id));

    println!("{}", list_header());
    for task in &tasks {
        println!("{}", task_row(task));
    }
    Ok(())
}

/// The stored plan, or the one the task's weight and settings produce.
fn load_plan(project: &Project, task: &Task) -> Result<Plan> {
    use taskforge::plan::build_plan;

    match project.backend.load_plan(&task.id) {
        Ok(plan) => Ok(plan),
        Err(e) if e.is_not_found() => Ok(project
            .config
            .settings
            .configure_plan(build_plan(&task.id, task.weight))),
        Err(e) => Err(e.into()),
    }
}

pub fn cmd_show(cli: &Cli, project_dir: &Path, id: &str) -> Result<()> {
    use chrono::Utc;
    use taskforge::blocked::BlockedContext;
    use taskforge::state::{SystemProbe, check_orphaned};
    use taskforge::storage::load_state_or_new;
    use taskforge::task::TaskStatus;
    use taskforge::ui::{StatusView, render_status};

    let project = open_project(cli, project_dir)?;
    let task = project.backend.load_task(id)?;
    let state = load_state_or_new(project.backend.as_ref(), &task.id)?;
    let plan = load_plan(&project, &task)?;

    let orphan = check_orphaned(
        &task,
        &state,
        project.config.settings.execution.stale_threshold(),
        &SystemProbe,
        Utc::now(),
    );
    let blocked = (task.status == TaskStatus::Blocked).then(|| {
        BlockedContext::from_task(
            &task,
            &project.config.settings,
            &project.config.project_dir,
        )
    });

    let view = StatusView {
        task: &task,
        plan: &plan,
        state: &state,
        orphan: Some(&orphan),
        blocked: blocked.as_ref(),
    };
    println!();
    for line in render_status(&view, term_width()) {
        println!("{}", line);
    }
    println!();
    Ok(())
}

/// Record a human gate decision for `phase`.
pub fn cmd_decide(
    cli: &Cli,
    project_dir: &Path,
    id: &str,
    phase: &str,
    approved: bool,
    reason: Option<&str>,
) -> Result<()> {
    use dialoguer::Confirm;
    use taskforge::storage::load_state_or_new;

    let project = open_project(cli, project_dir)?;
    let mut task = project.backend.load_task(id)?;
    let plan = load_plan(&project, &task)?;
    if !plan.contains(phase) {
        anyhow::bail!(
            "{} has no phase '{}'. Phases: {}",
            task.id,
            phase,
            plan.phase_ids().join(", ")
        );
    }
    if !approved && reason.is_none_or(|r| r.trim().is_empty()) {
        anyhow::bail!("A rejection needs a reason");
    }

    let verb = if approved { "Approve" } else { "Reject" };
    if !project.config.yes {
        let confirm = Confirm::new()
            .with_prompt(format!("{} {} of {}?", verb, phase, task.id))
            .default(approved)
            .interact()
            .unwrap_or(false);
        if !confirm {
            println!("{} cancelled", verb);
            return Ok(());
        }
    }

    let state = load_state_or_new(project.backend.as_ref(), &task.id)?;
    let waiting = state.phase(phase).is_some_and(|p| p.awaiting_approval);
    task.record_approval(phase, approved, reason);
    project.backend.save_task(&task)?;

    println!(
        "{} {} of {}",
        if approved { "Approved" } else { "Rejected" },
        phase,
        task.id
    );
    if !waiting {
        println!("{} is not waiting on this gate yet; the decision applies when it is reached.", phase);
    }
    println!("Run `taskforge resume {}` to continue.", task.id);
    Ok(())
}

pub fn cmd_rewind(cli: &Cli, project_dir: &Path, id: &str, phase: &str) -> Result<()> {
    use dialoguer::Confirm;
    use taskforge::storage::load_state_or_new;
    use tokio_util::sync::CancellationToken;

    let project = open_project(cli, project_dir)?;
    let mut task = project.backend.load_task(id)?;
    let mut state = load_state_or_new(project.backend.as_ref(), &task.id)?;

    if !project.config.yes {
        let confirm = Confirm::new()
            .with_prompt(format!(
                "Reset {} to its checkpoint before {}? Later work on the branch is discarded.",
                task.id, phase
            ))
            .default(false)
            .interact()
            .unwrap_or(false);
        if !confirm {
            println!("Rewind cancelled");
            return Ok(());
        }
    }

    let executor = super::run::build_executor(&project, CancellationToken::new());
    let sha = executor.rewind_to_phase(&mut task, &mut state, phase)?;
    println!(
        "Rewound {} to {} ({})",
        task.id,
        phase,
        taskforge::ui::summary::short_sha(&sha)
    );
    println!("Run `taskforge resume {}` to continue.", task.id);
    Ok(())
}
