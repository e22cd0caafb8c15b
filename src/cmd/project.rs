//! Project initialization and task creation: `taskforge init`, `taskforge new`.

use anyhow::Result;
use std::path::Path;

use super::super::Cli;
use super::open_project;

pub fn cmd_init(project_dir: &Path) -> Result<()> {
    use taskforge::init::init_project;

    let result = init_project(project_dir)?;

    if result.created {
        println!(
            "Initialized taskforge project at {}",
            result.data_dir.display()
        );
        println!();
        println!("Created directory structure:");
        println!("  .taskforge/");
        println!("  ├── config.toml   # Engine settings");
        println!("  ├── tasks/        # Task, plan and state files");
        println!("  ├── logs/         # Agent transcripts");
        println!("  └── prompts/      # Per-phase prompt overrides (<phase>.md)");
        println!();
        println!("Next steps:");
        println!("  1. Review .taskforge/config.toml (target branch, gates)");
        println!("  2. Run `taskforge new \"<title>\" --weight small` to create a task");
        println!("  3. Run `taskforge run <ID>` to start execution");
    } else {
        println!(
            "taskforge project already initialized at {}",
            result.data_dir.display()
        );
        if result.wrote_config {
            println!("Wrote missing config.toml.");
        }
        println!("Directory structure verified.");
    }

    Ok(())
}

pub fn cmd_new(
    cli: &Cli,
    project_dir: &Path,
    title: &str,
    weight: &str,
    description: Option<&str>,
    blocked_by: &[String],
) -> Result<()> {
    use taskforge::plan::build_plan;
    use taskforge::storage::Backend;
    use taskforge::task::{Task, TaskStatus, Weight};

    let weight: Weight = weight.parse().map_err(anyhow::Error::msg)?;
    if title.trim().is_empty() {
        anyhow::bail!("Task title cannot be empty");
    }
    let project = open_project(cli, project_dir)?;
    let backend = &project.backend;

    let id = backend.next_task_id()?;
    let mut task = Task::new(&id, title.trim(), weight);
    if let Some(description) = description {
        task.description = description.to_string();
    }
    for blocker in blocked_by.iter().map(|b| b.trim()).filter(|b| !b.is_empty()) {
        match backend.load_task(blocker) {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                println!("Warning: blocking task {} does not exist yet", blocker);
            }
            Err(e) => return Err(e.into()),
        }
        task.blocked_by.push(blocker.to_string());
    }

    let plan = project
        .config
        .settings
        .configure_plan(build_plan(&task.id, weight));
    backend.save_plan(&plan)?;
    task.set_status(TaskStatus::Planned);
    backend.save_task(&task)?;

    println!("Created {} ({} weight): {}", task.id, task.weight, task.title);
    println!("  Phases: {}", plan.phase_ids().join(" -> "));
    if !task.blocked_by.is_empty() {
        println!("  Blocked by: {}", task.blocked_by.join(", "));
    }
    println!();
    println!("Run `taskforge run {}` to start.", task.id);
    Ok(())
}
