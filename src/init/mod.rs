//! Project initialization for `taskforge init`.
//!
//! Creates the `.taskforge/` directory in a project:
//!
//! ```text
//! .taskforge/
//! ├── config.toml      # Engine settings
//! ├── .gitignore       # Keeps runtime data out of commits
//! ├── tasks/           # One directory per task (task, plan, state)
//! ├── logs/            # Agent transcripts and JSON logs
//! └── prompts/         # Optional per-phase prompt overrides
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::DATA_DIR;
use crate::settings::SETTINGS_FILE;

/// Starting `config.toml`. Every value shown is the built-in default.
pub const DEFAULT_CONFIG: &str = r#"# taskforge configuration

[agent]
command = "claude"
skip_permissions = true
# phase_timeout_secs = 1800

[execution]
heartbeat_interval_secs = 30
stale_threshold_secs = 300
max_retries = 5
auto_retry = true

[retry.routes]
review = "implement"
validate = "implement"

[gates]
default = "auto"
finalize = "auto"

# [[gates.overrides]]
# phase = "review"
# gate = "human"
# weights = ["large"]

# [gates.criteria]
# implement = ["has_output", "no_errors", "command:cargo test"]

[git]
target_branch = "main"
branch_prefix = "taskforge/"
worktrees = false

[finalize]
sync_strategy = "merge"
risk_assessment = true
review_threshold = "high"
"#;

/// Result of initializing a project.
#[derive(Debug)]
pub struct InitResult {
    pub data_dir: PathBuf,
    /// False when the directory already existed
    pub created: bool,
    /// True when `config.toml` was written by this call
    pub wrote_config: bool,
}

/// Create or complete the `.taskforge/` layout. Existing files are kept.
pub fn init_project(project_dir: &Path) -> Result<InitResult> {
    let data_dir = data_dir(project_dir);
    let created = !data_dir.exists();

    for sub in ["tasks", "logs", "prompts"] {
        let dir = data_dir.join(sub);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }

    let gitignore = data_dir.join(".gitignore");
    if !gitignore.exists() {
        std::fs::write(&gitignore, "*\n")
            .with_context(|| format!("Failed to create {}", gitignore.display()))?;
    }

    let config_file = data_dir.join(SETTINGS_FILE);
    let wrote_config = write_default_config(&config_file)?;

    Ok(InitResult {
        data_dir,
        created,
        wrote_config,
    })
}

/// Write [`DEFAULT_CONFIG`] unless the file exists. Returns whether it wrote.
pub fn write_default_config(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DEFAULT_CONFIG)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(true)
}

pub fn is_initialized(project_dir: &Path) -> bool {
    data_dir(project_dir).exists()
}

pub fn data_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(DATA_DIR)
}
