//! Task execution: `taskforge run`, `taskforge resume`, `taskforge finalize`.
//!
//! A blocked or interrupted run is not a command failure. The command
//! prints what happened and what to do next, then exits 0.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use taskforge::errors::ExecutorError;
use taskforge::orchestrator::{Executor, FinalizeOptions};
use taskforge::storage::Backend;

use super::super::Cli;
use super::{Project, open_project, term_width};

#[derive(Debug, Clone, Default)]
pub struct ResumeOptions {
    pub force: bool,
    pub from: Option<String>,
    pub ignore_blockers: bool,
}

/// Wire the production agent, git workspace, reviewer and console UI.
pub fn build_executor(project: &Project, cancel: CancellationToken) -> Executor {
    use taskforge::agent::{AgentRunner, ClaudeRunner};
    use taskforge::gates::AgentReviewer;
    use taskforge::prompt::PromptBuilder;
    use taskforge::tracker::GitWorkspace;
    use taskforge::ui::ConsolePublisher;

    let config = &project.config;
    let runner: Arc<dyn AgentRunner> = Arc::new(
        ClaudeRunner::new(config.settings.agent.clone()).with_log_dir(config.log_dir.clone()),
    );
    let vcs = Arc::new(GitWorkspace::new(
        config.project_dir.clone(),
        config.settings.git.clone(),
    ));

    Executor::new(
        project.backend.clone(),
        runner.clone(),
        vcs,
        config.settings.clone(),
    )
    .with_reviewer(Arc::new(AgentReviewer::new(runner)))
    .with_publisher(Arc::new(ConsolePublisher::new(config.verbosity)))
    .with_prompts(PromptBuilder::new().with_overrides(config.prompts_dir.clone()))
    .with_cancel_token(cancel)
}

pub async fn cmd_run(
    cli: &Cli,
    project_dir: &Path,
    id: &str,
    ignore_blockers: bool,
    cancel: CancellationToken,
) -> Result<()> {
    use taskforge::plan::build_plan;
    use taskforge::storage::load_state_or_new;
    use taskforge::task::TaskStatus;

    let project = open_project(cli, project_dir)?;
    let mut task = project.backend.load_task(id)?;
    if task.status == TaskStatus::Completed {
        println!("{} is already completed.", task.id);
        return Ok(());
    }
    let mut state = load_state_or_new(project.backend.as_ref(), &task.id)?;
    let plan = build_plan(&task.id, task.weight);

    let executor = build_executor(&project, cancel).ignore_blockers(ignore_blockers);
    let result = executor.execute_task(&mut task, &plan, &mut state).await;
    report_outcome(&project, &task.id, result)
}

pub async fn cmd_resume(
    cli: &Cli,
    project_dir: &Path,
    id: &str,
    options: ResumeOptions,
    cancel: CancellationToken,
) -> Result<()> {
    use taskforge::plan::build_plan;
    use taskforge::state::{SystemProbe, apply_resume_updates, validate_resumable};
    use taskforge::storage::load_state_or_new;

    let project = open_project(cli, project_dir)?;
    let mut task = project.backend.load_task(id)?;
    let mut state = load_state_or_new(project.backend.as_ref(), &task.id)?;
    let executor = build_executor(&project, cancel).ignore_blockers(options.ignore_blockers);

    let result = match options.from.as_deref() {
        None => {
            executor
                .resume_task(&mut task, &mut state, options.force, &SystemProbe)
                .await
        }
        Some(phase) => {
            let validation = validate_resumable(
                &task,
                &state,
                options.force,
                project.config.settings.execution.stale_threshold(),
                &SystemProbe,
            )?;
            if validation.requires_state_update {
                apply_resume_updates(&mut task, &mut state, &validation);
                project.backend.save_state(&state)?;
                project.backend.save_task(&task)?;
            }
            let plan = build_plan(&task.id, task.weight);
            executor
                .resume_from_phase(&mut task, &plan, &mut state, phase)
                .await
        }
    };
    report_outcome(&project, &task.id, result)
}

pub async fn cmd_finalize(
    cli: &Cli,
    project_dir: &Path,
    id: &str,
    options: FinalizeOptions,
    cancel: CancellationToken,
) -> Result<()> {
    use taskforge::plan::{FINALIZE_PHASE, Phase};
    use taskforge::storage::load_state_or_new;

    let project = open_project(cli, project_dir)?;
    let mut task = project.backend.load_task(id)?;
    let mut state = load_state_or_new(project.backend.as_ref(), &task.id)?;

    let mut phase = Phase::new(FINALIZE_PHASE);
    phase.gate = project.config.settings.gates.finalize;
    let executor = build_executor(&project, cancel).with_finalize_options(options);
    let result = executor.finalize_task(&mut task, &phase, &mut state).await;
    report_outcome(&project, &task.id, result)
}

/// Turn an executor result into CLI output. Blocks and interrupts are not errors.
fn report_outcome(project: &Project, id: &str, result: Result<(), ExecutorError>) -> Result<()> {
    use console::style;
    use taskforge::blocked::BlockedContext;
    use taskforge::ui::render_guidance;

    match result {
        Ok(()) => Ok(()),
        Err(ExecutorError::Interrupted { phase }) => {
            println!();
            println!(
                "Progress saved. {} will continue from {} with:",
                id,
                style(&phase).yellow()
            );
            println!("  taskforge resume {}", id);
            Ok(())
        }
        Err(ExecutorError::TaskBlocked(signal)) => {
            let task = project.backend.load_task(&signal.task_id)?;
            let ctx = BlockedContext::from_task(
                &task,
                &project.config.settings,
                &project.config.project_dir,
            );
            println!();
            println!("{}", style("Next steps:").bold());
            for line in render_guidance(&ctx, term_width()) {
                println!("{}", line);
            }
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
