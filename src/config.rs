use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::settings::{SETTINGS_FILE, Settings};

/// Name of the per-project data directory.
pub const DATA_DIR: &str = ".taskforge";

/// How much the CLI prints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Verbosity {
    Quiet,
    #[default]
    Normal,
    Verbose,
}

impl Verbosity {
    pub fn from_flags(verbose: bool, quiet: bool) -> Self {
        match (verbose, quiet) {
            (true, _) => Verbosity::Verbose,
            (false, true) => Verbosity::Quiet,
            _ => Verbosity::Normal,
        }
    }

    /// Default tracing filter for this verbosity when `RUST_LOG` is unset.
    pub fn log_filter(&self) -> &'static str {
        match self {
            Verbosity::Quiet => "taskforge=warn",
            Verbosity::Normal => "taskforge=info",
            Verbosity::Verbose => "taskforge=debug",
        }
    }
}

/// Runtime configuration for taskforge.
///
/// Resolves the project layout under `.taskforge/` and carries the layered
/// settings plus CLI-level switches.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub data_dir: PathBuf,
    pub tasks_dir: PathBuf,
    pub log_dir: PathBuf,
    pub prompts_dir: PathBuf,
    pub settings: Settings,
    pub verbosity: Verbosity,
    /// Skip interactive confirmations
    pub yes: bool,
}

impl Config {
    pub fn new(project_dir: PathBuf, verbosity: Verbosity, yes: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let data_dir = project_dir.join(DATA_DIR);
        let settings = Settings::load_or_default(&data_dir)?;

        Ok(Self {
            tasks_dir: data_dir.join("tasks"),
            log_dir: data_dir.join("logs"),
            prompts_dir: data_dir.join("prompts"),
            data_dir,
            project_dir,
            settings,
            verbosity,
            yes,
        })
    }

    pub fn settings_file(&self) -> PathBuf {
        self.data_dir.join(SETTINGS_FILE)
    }

    pub fn is_initialized(&self) -> bool {
        self.data_dir.exists()
    }

    /// Root directory for per-task worktrees.
    pub fn worktree_root(&self) -> PathBuf {
        resolve_under(&self.project_dir, &self.settings.git.worktree_dir)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.tasks_dir).context("Failed to create tasks directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        std::fs::create_dir_all(&self.prompts_dir)
            .context("Failed to create prompts directory")?;
        Ok(())
    }
}

fn resolve_under(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
