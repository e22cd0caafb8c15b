//! CLI command implementations.
//!
//! | Module    | Commands handled                               |
//! |-----------|------------------------------------------------|
//! | `project` | `Init`, `New`                                  |
//! | `task`    | `List`, `Show`, `Approve`, `Reject`, `Rewind`  |
//! | `run`     | `Run`, `Resume`, `Finalize`                    |
//! | `config`  | `Config`                                       |

pub mod config;
pub mod project;
pub mod run;
pub mod task;

pub use config::cmd_config;
pub use project::{cmd_init, cmd_new};
pub use run::{ResumeOptions, cmd_finalize, cmd_resume, cmd_run};
pub use task::{cmd_decide, cmd_list, cmd_rewind, cmd_show};

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use taskforge::config::{Config, Verbosity};
use taskforge::storage::FileBackend;

use super::Cli;

/// Resolved project configuration plus its task store.
pub struct Project {
    pub config: Config,
    pub backend: Arc<FileBackend>,
}

/// Open an initialized project, or explain how to initialize it.
pub fn open_project(cli: &Cli, project_dir: &Path) -> Result<Project> {
    let verbosity = Verbosity::from_flags(cli.verbose, cli.quiet);
    if !taskforge::init::is_initialized(project_dir) {
        anyhow::bail!("Project not initialized. Run 'taskforge init' first.");
    }
    let config = Config::new(project_dir.to_path_buf(), verbosity, cli.yes)?;
    config.ensure_directories()?;
    let backend = Arc::new(FileBackend::new(config.tasks_dir.clone()));
    Ok(Project { config, backend })
}

/// Terminal width for wrapped output, capped for readability.
pub fn term_width() -> usize {
    console::Term::stdout()
        .size_checked()
        .map(|(_, cols)| cols as usize)
        .unwrap_or(80)
        .min(100)
}
