//! Engine settings read from `.taskforge/config.toml`.
//!
//! Settings are layered: user config (`~/.config/taskforge/config.toml`),
//! then the project file, then environment overrides. Tables merge key by
//! key, so a project file only needs the values it changes.
//!
//! # Configuration File Format
//!
//! ```toml
//! [agent]
//! command = "claude"
//! skip_permissions = true
//! phase_timeout_secs = 1800
//!
//! [execution]
//! heartbeat_interval_secs = 30
//! stale_threshold_secs = 300
//! max_retries = 5
//!
//! [retry.routes]
//! review = "implement"
//! validate = "implement"
//!
//! [gates]
//! default = "auto"
//! finalize = "auto"
//! command_timeout_secs = 600
//!
//! [[gates.overrides]]
//! phase = "review"
//! gate = "human"
//! weights = ["large"]
//!
//! [gates.criteria]
//! implement = ["has_output", "no_errors", "command:cargo test"]
//!
//! [git]
//! target_branch = "main"
//! branch_prefix = "taskforge/"
//! worktrees = false
//!
//! [finalize]
//! sync_strategy = "merge"
//! review_threshold = "high"
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::gates::AutoCriterion;
use crate::orchestrator::finalize::RiskLevel;
use crate::plan::{GateKind, Plan};
use crate::state::RetryMap;
use crate::task::Weight;

/// Name of the settings file inside the data directory.
pub const SETTINGS_FILE: &str = "config.toml";

/// How a task branch is brought up to date with its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStrategy {
    #[default]
    Merge,
    Rebase,
}

impl fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStrategy::Merge => write!(f, "merge"),
            SyncStrategy::Rebase => write!(f, "rebase"),
        }
    }
}

impl FromStr for SyncStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "merge" => Ok(SyncStrategy::Merge),
            "rebase" => Ok(SyncStrategy::Rebase),
            _ => anyhow::bail!(
                "Invalid sync strategy '{}'. Valid values: merge, rebase",
                s
            ),
        }
    }
}

/// Agent CLI invocation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    /// Agent CLI command (default: "claude")
    #[serde(default = "default_agent_command")]
    pub command: String,
    /// Model passed with `--model`, if set
    #[serde(default)]
    pub model: Option<String>,
    /// Whether to pass `--dangerously-skip-permissions`
    #[serde(default = "default_skip_permissions")]
    pub skip_permissions: bool,
    /// Wall-clock limit for a single phase invocation
    #[serde(default)]
    pub phase_timeout_secs: Option<u64>,
    /// Extra arguments appended to every invocation
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_skip_permissions() -> bool {
    true
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            model: None,
            skip_permissions: default_skip_permissions(),
            phase_timeout_secs: None,
            extra_args: Vec::new(),
        }
    }
}

impl AgentSection {
    pub fn phase_timeout(&self) -> Option<Duration> {
        self.phase_timeout_secs.map(Duration::from_secs)
    }
}

/// Heartbeat, staleness and retry limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSection {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_stale_threshold")]
    pub stale_threshold_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Jump back to the retry target within the same run
    #[serde(default = "default_auto_retry")]
    pub auto_retry: bool,
    /// Characters of failed output carried into the retry prompt
    #[serde(default = "default_retry_output_chars")]
    pub retry_output_chars: usize,
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_stale_threshold() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    5
}

fn default_auto_retry() -> bool {
    true
}

fn default_retry_output_chars() -> usize {
    4000
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            stale_threshold_secs: default_stale_threshold(),
            max_retries: default_max_retries(),
            auto_retry: default_auto_retry(),
            retry_output_chars: default_retry_output_chars(),
        }
    }
}

impl ExecutionSection {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }
}

/// Retry routes from a failing phase to the phase that re-runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_retry_routes")]
    pub routes: BTreeMap<String, String>,
}

fn default_retry_routes() -> BTreeMap<String, String> {
    RetryMap::default().routes().clone()
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            routes: default_retry_routes(),
        }
    }
}

/// Gate override for phases matching a glob pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateOverride {
    /// Glob pattern matched against the phase id
    pub phase: String,
    pub gate: GateKind,
    /// Restrict the override to these weights (all weights when empty)
    #[serde(default)]
    pub weights: Vec<Weight>,
}

/// Gate selection and auto-gate criteria.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatesSection {
    #[serde(default)]
    pub default: GateKind,
    #[serde(default)]
    pub finalize: GateKind,
    /// Later entries win when several match
    #[serde(default)]
    pub overrides: Vec<GateOverride>,
    /// Auto-gate criteria per phase id
    #[serde(default)]
    pub criteria: BTreeMap<String, Vec<AutoCriterion>>,
    /// Limit for each `command:` criterion
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

fn default_command_timeout_secs() -> u64 {
    600
}

impl Default for GatesSection {
    fn default() -> Self {
        Self {
            default: GateKind::Auto,
            finalize: GateKind::Auto,
            overrides: Vec::new(),
            criteria: BTreeMap::new(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl GatesSection {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }
}

/// Branch, worktree and commit settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitSection {
    #[serde(default = "default_target_branch")]
    pub target_branch: String,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    #[serde(default = "default_commit_prefix")]
    pub commit_prefix: String,
    /// Run each task in its own worktree
    #[serde(default)]
    pub worktrees: bool,
    /// Worktree root, relative to the project directory
    #[serde(default = "default_worktree_dir")]
    pub worktree_dir: PathBuf,
    /// Remove the worktree once the task completes
    #[serde(default)]
    pub cleanup_worktree_on_complete: bool,
    /// Fetch the target from `remote` before syncing
    #[serde(default)]
    pub fetch_before_sync: bool,
    #[serde(default = "default_remote")]
    pub remote: String,
}

fn default_target_branch() -> String {
    "main".to_string()
}

fn default_branch_prefix() -> String {
    "taskforge/".to_string()
}

fn default_commit_prefix() -> String {
    "[taskforge]".to_string()
}

fn default_worktree_dir() -> PathBuf {
    PathBuf::from(".taskforge/worktrees")
}

fn default_remote() -> String {
    "origin".to_string()
}

impl Default for GitSection {
    fn default() -> Self {
        Self {
            target_branch: default_target_branch(),
            branch_prefix: default_branch_prefix(),
            commit_prefix: default_commit_prefix(),
            worktrees: false,
            worktree_dir: default_worktree_dir(),
            cleanup_worktree_on_complete: false,
            fetch_before_sync: false,
            remote: default_remote(),
        }
    }
}

impl GitSection {
    pub fn branch_name(&self, task_id: &str) -> String {
        format!("{}{}", self.branch_prefix, task_id)
    }
}

/// Finalize-phase settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeSection {
    #[serde(default)]
    pub sync_strategy: SyncStrategy,
    #[serde(default = "default_risk_assessment")]
    pub risk_assessment: bool,
    /// Risk level at or above which the task needs review before merge
    #[serde(default = "default_review_threshold")]
    pub review_threshold: RiskLevel,
}

fn default_risk_assessment() -> bool {
    true
}

fn default_review_threshold() -> RiskLevel {
    RiskLevel::High
}

impl Default for FinalizeSection {
    fn default() -> Self {
        Self {
            sync_strategy: SyncStrategy::default(),
            risk_assessment: default_risk_assessment(),
            review_threshold: default_review_threshold(),
        }
    }
}

/// Top-level settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub execution: ExecutionSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub gates: GatesSection,
    #[serde(default)]
    pub git: GitSection,
    #[serde(default)]
    pub finalize: FinalizeSection,
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse settings from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config.toml")
    }

    /// Merge user and project files, then apply environment overrides.
    /// Missing files are skipped.
    pub fn load_layered(user_file: Option<&Path>, project_file: &Path) -> Result<Self> {
        let mut merged = toml::Table::new();
        for path in user_file.into_iter().chain(std::iter::once(project_file)) {
            if !path.exists() {
                continue;
            }
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let table: toml::Table = toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            merge_tables(&mut merged, table);
        }
        let mut settings: Settings = toml::Value::Table(merged)
            .try_into()
            .context("Invalid configuration")?;
        settings.apply_env();
        Ok(settings)
    }

    /// Load from the default user location and `data_dir/config.toml`.
    pub fn load_or_default(data_dir: &Path) -> Result<Self> {
        let user_file = user_settings_path();
        Self::load_layered(user_file.as_deref(), &data_dir.join(SETTINGS_FILE))
    }

    /// Save settings to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Environment overrides: `TASKFORGE_AGENT_CMD` (or `CLAUDE_CMD`) and
    /// `TASKFORGE_TARGET_BRANCH`.
    pub fn apply_env(&mut self) {
        if let Some(cmd) = std::env::var("TASKFORGE_AGENT_CMD")
            .ok()
            .or_else(|| std::env::var("CLAUDE_CMD").ok())
            .filter(|c| !c.trim().is_empty())
        {
            self.agent.command = cmd;
        }
        if let Ok(branch) = std::env::var("TASKFORGE_TARGET_BRANCH")
            && !branch.trim().is_empty()
        {
            self.git.target_branch = branch;
        }
    }

    pub fn retry_map(&self) -> RetryMap {
        RetryMap::new(self.retry.routes.clone())
    }

    /// Gate for a phase of a task with `weight`.
    pub fn resolve_gate(&self, phase_id: &str, weight: Weight) -> GateKind {
        if phase_id == crate::plan::FINALIZE_PHASE {
            return self.gates.finalize;
        }
        self.gates
            .overrides
            .iter()
            .rev()
            .filter(|o| o.weights.is_empty() || o.weights.contains(&weight))
            .find(|o| pattern_matches(&o.phase, phase_id))
            .map(|o| o.gate)
            .unwrap_or(self.gates.default)
    }

    /// Apply configured gates to `plan` and append the finalize phase.
    pub fn configure_plan(&self, mut plan: Plan) -> Plan {
        let weight = plan.weight;
        for phase in &mut plan.phases {
            if !phase.is_finalize() {
                phase.gate = self.resolve_gate(&phase.id, weight);
            }
        }
        plan.with_finalize(self.gates.finalize)
    }

    pub fn criteria_for(&self, phase_id: &str) -> &[AutoCriterion] {
        self.gates
            .criteria
            .get(phase_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.agent.command.trim().is_empty() {
            warnings.push("agent.command is empty".to_string());
        }
        if self.execution.heartbeat_interval_secs == 0 {
            warnings.push("execution.heartbeat_interval_secs must be at least 1".to_string());
        }
        if self.execution.stale_threshold_secs <= self.execution.heartbeat_interval_secs {
            warnings.push(format!(
                "execution.stale_threshold_secs ({}) should exceed heartbeat_interval_secs ({})",
                self.execution.stale_threshold_secs, self.execution.heartbeat_interval_secs
            ));
        }
        for o in &self.gates.overrides {
            if glob::Pattern::new(&o.phase).is_err() {
                warnings.push(format!("Invalid phase pattern '{}' in gates.overrides", o.phase));
            }
        }
        for (from, to) in &self.retry.routes {
            if from == to {
                warnings.push(format!("Retry route for '{}' points at itself", from));
            }
        }

        warnings
    }
}

/// Location of the per-user settings file.
pub fn user_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("taskforge").join(SETTINGS_FILE))
}

/// Case-insensitive glob match of a phase id.
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    glob::Pattern::new(&pattern.to_lowercase())
        .map(|p| p.matches(&name.to_lowercase()))
        .unwrap_or(false)
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    // =========================================
    // Parsing tests
    // =========================================

    #[test]
    fn test_parse_empty_uses_defaults() {
        let settings = Settings::parse("").unwrap();
        assert_eq!(settings.agent.command, "claude");
        assert_eq!(settings.execution.heartbeat_interval_secs, 30);
        assert_eq!(settings.execution.stale_threshold_secs, 300);
        assert_eq!(settings.execution.max_retries, 5);
        assert_eq!(settings.git.target_branch, "main");
        assert_eq!(settings.finalize.sync_strategy, SyncStrategy::Merge);
        assert_eq!(settings.finalize.review_threshold, RiskLevel::High);
        assert_eq!(
            settings.retry.routes.get("review").map(String::as_str),
            Some("implement")
        );
    }

    #[test]
    fn test_parse_sections() {
        let content = r#"
[agent]
command = "my-claude"
phase_timeout_secs = 60

[execution]
heartbeat_interval_secs = 5

[finalize]
sync_strategy = "rebase"
review_threshold = "critical"

[gates.criteria]
implement = ["has_output", "contains:DONE"]
"#;
        let settings = Settings::parse(content).unwrap();
        assert_eq!(settings.agent.command, "my-claude");
        assert_eq!(settings.agent.phase_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(settings.execution.heartbeat_interval(), Duration::from_secs(5));
        assert_eq!(settings.finalize.sync_strategy, SyncStrategy::Rebase);
        assert_eq!(settings.finalize.review_threshold, RiskLevel::Critical);
        assert_eq!(settings.criteria_for("implement").len(), 2);
        assert!(settings.criteria_for("spec").is_empty());
    }

    #[test]
    fn test_sync_strategy_from_str() {
        assert_eq!("REBASE".parse::<SyncStrategy>().unwrap(), SyncStrategy::Rebase);
        assert!("squash".parse::<SyncStrategy>().is_err());
    }

    // =========================================
    // Gate resolution tests
    // =========================================

    #[test]
    fn test_resolve_gate_overrides() {
        let content = r#"
[gates]
default = "auto"
finalize = "human"

[[gates.overrides]]
phase = "rev*"
gate = "ai"

[[gates.overrides]]
phase = "review"
gate = "human"
weights = ["large"]
"#;
        let settings = Settings::parse(content).unwrap();
        assert_eq!(settings.resolve_gate("spec", Weight::Large), GateKind::Auto);
        assert_eq!(settings.resolve_gate("review", Weight::Small), GateKind::Ai);
        assert_eq!(settings.resolve_gate("review", Weight::Large), GateKind::Human);
        assert_eq!(settings.resolve_gate("finalize", Weight::Small), GateKind::Human);
    }

    #[test]
    fn test_configure_plan_applies_gates_and_finalize() {
        let mut settings = Settings::default();
        settings.gates.finalize = GateKind::Human;
        settings.gates.overrides.push(GateOverride {
            phase: "review".into(),
            gate: GateKind::Ai,
            weights: Vec::new(),
        });
        let plan = settings.configure_plan(crate::plan::build_plan("TASK-001", Weight::Small));
        let gates: Vec<(&str, GateKind)> =
            plan.phases.iter().map(|p| (p.id.as_str(), p.gate)).collect();
        assert_eq!(
            gates,
            vec![
                ("spec", GateKind::Auto),
                ("implement", GateKind::Auto),
                ("review", GateKind::Ai),
                ("finalize", GateKind::Human),
            ]
        );
    }

    #[test]
    fn test_pattern_matches() {
        assert!(pattern_matches("impl*", "implement"));
        assert!(pattern_matches("REVIEW", "review"));
        assert!(pattern_matches("?pec", "spec"));
        assert!(!pattern_matches("docs", "spec"));
    }

    // =========================================
    // Layering tests
    // =========================================

    #[test]
    fn test_load_layered_project_overrides_user() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let saved = (
            std::env::var("TASKFORGE_AGENT_CMD").ok(),
            std::env::var("CLAUDE_CMD").ok(),
        );
        unsafe {
            std::env::remove_var("TASKFORGE_AGENT_CMD");
            std::env::remove_var("CLAUDE_CMD");
        }

        let dir = tempdir().unwrap();
        let user = dir.path().join("user.toml");
        let project = dir.path().join("project.toml");
        std::fs::write(
            &user,
            "[agent]\ncommand = \"user-claude\"\nmodel = \"opus\"\n[git]\ntarget_branch = \"develop\"\n",
        )
        .unwrap();
        std::fs::write(&project, "[agent]\ncommand = \"project-claude\"\n").unwrap();

        let settings = Settings::load_layered(Some(&user), &project).unwrap();
        assert_eq!(settings.agent.command, "project-claude");
        assert_eq!(settings.agent.model.as_deref(), Some("opus"));
        assert_eq!(settings.git.target_branch, "develop");

        unsafe {
            if let Some(v) = saved.0 {
                std::env::set_var("TASKFORGE_AGENT_CMD", v);
            }
            if let Some(v) = saved.1 {
                std::env::set_var("CLAUDE_CMD", v);
            }
        }
    }

    #[test]
    fn test_env_overrides_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let saved = std::env::var("TASKFORGE_TARGET_BRANCH").ok();
        unsafe { std::env::set_var("TASKFORGE_TARGET_BRANCH", "release") };

        let dir = tempdir().unwrap();
        let project = dir.path().join("config.toml");
        std::fs::write(&project, "[git]\ntarget_branch = \"main\"\n").unwrap();
        let settings = Settings::load_layered(None, &project).unwrap();
        assert_eq!(settings.git.target_branch, "release");

        unsafe {
            match saved {
                Some(v) => std::env::set_var("TASKFORGE_TARGET_BRANCH", v),
                None => std::env::remove_var("TASKFORGE_TARGET_BRANCH"),
            }
        }
    }

    #[test]
    fn test_missing_files_yield_defaults() {
        let dir = tempdir().unwrap();
        let settings =
            Settings::load_layered(None, &dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings.execution.max_retries, 5);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut settings = Settings::default();
        settings.git.worktrees = true;
        settings.finalize.sync_strategy = SyncStrategy::Rebase;
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert!(loaded.git.worktrees);
        assert_eq!(loaded.finalize.sync_strategy, SyncStrategy::Rebase);
    }

    // =========================================
    // Validation tests
    // =========================================

    #[test]
    fn test_validate_defaults_clean() {
        assert!(Settings::default().validate().is_empty());
    }

    #[test]
    fn test_validate_flags_bad_values() {
        let content = r#"
[execution]
heartbeat_interval_secs = 400
stale_threshold_secs = 300

[retry.routes]
review = "review"
"#;
        let warnings = Settings::parse(content).unwrap().validate();
        assert_eq!(warnings.len(), 2);
    }
}
