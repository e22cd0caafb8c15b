//! Task model: the unit of work the engine drives through phases.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Coarse size classification that selects the phase sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Weight {
    Trivial,
    Small,
    #[default]
    Medium,
    Large,
}

impl Weight {
    pub const ALL: [Weight; 4] = [Weight::Trivial, Weight::Small, Weight::Medium, Weight::Large];

    pub fn as_str(&self) -> &'static str {
        match self {
            Weight::Trivial => "trivial",
            Weight::Small => "small",
            Weight::Medium => "medium",
            Weight::Large => "large",
        }
    }

    /// Parse a stored weight label. Unknown labels resolve to `Medium`.
    pub fn from_label(label: &str) -> Weight {
        label.parse().unwrap_or_else(|_| {
            tracing::warn!(weight = label, "unknown task weight, using medium");
            Weight::Medium
        })
    }
}

impl fmt::Display for Weight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Weight {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trivial" => Ok(Weight::Trivial),
            "small" => Ok(Weight::Small),
            "medium" => Ok(Weight::Medium),
            "large" => Ok(Weight::Large),
            other => Err(format!(
                "Invalid weight: '{}'. Valid values: trivial, small, medium, large",
                other
            )),
        }
    }
}

impl<'de> Deserialize<'de> for Weight {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Ok(Weight::from_label(&label))
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Created,
    Planned,
    Running,
    Paused,
    Blocked,
    Failed,
    Finalizing,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Planned => "planned",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Failed => "failed",
            TaskStatus::Finalizing => "finalizing",
            TaskStatus::Completed => "completed",
        }
    }

    /// Statuses in which an executor process is expected to own the task.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::Finalizing)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task is sitting in the `blocked` status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockedReason {
    GateRejected,
    AwaitingApproval,
    SyncConflict,
    Interrupted,
    ForcedResume,
    /// A phase failed and routed back to an earlier one; waiting for resume
    RetryPending,
}

impl BlockedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockedReason::GateRejected => "gate_rejected",
            BlockedReason::AwaitingApproval => "awaiting_approval",
            BlockedReason::SyncConflict => "sync_conflict",
            BlockedReason::Interrupted => "interrupted",
            BlockedReason::ForcedResume => "forced_resume",
            BlockedReason::RetryPending => "retry_pending",
        }
    }
}

impl fmt::Display for BlockedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockedReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gate_rejected" => Ok(BlockedReason::GateRejected),
            "awaiting_approval" => Ok(BlockedReason::AwaitingApproval),
            "sync_conflict" => Ok(BlockedReason::SyncConflict),
            "interrupted" => Ok(BlockedReason::Interrupted),
            "forced_resume" => Ok(BlockedReason::ForcedResume),
            "retry_pending" => Ok(BlockedReason::RetryPending),
            other => Err(format!("unknown blocked reason '{}'", other)),
        }
    }
}

/// Metadata keys the engine reads and writes on a task.
pub mod meta {
    pub const BLOCKED_REASON: &str = "blocked_reason";
    pub const BLOCKED_ERROR: &str = "blocked_error";
    pub const CONFLICT_FILES: &str = "conflict_files";
    pub const SYNC_STRATEGY: &str = "sync_strategy";
    pub const TARGET_BRANCH: &str = "target_branch";
    pub const WORKTREE_PATH: &str = "worktree_path";
    pub const GATE_PHASE: &str = "gate_phase";
    pub const GATE_REJECTION: &str = "gate_rejection";
    pub const LAST_ERROR: &str = "last_error";
    /// Prefix for human gate decisions, suffixed with the phase id.
    pub const APPROVAL_PREFIX: &str = "gate_approval:";
    /// Prefix for the rejection reason that accompanies a human decision.
    pub const APPROVAL_REASON_PREFIX: &str = "gate_approval_reason:";

    /// Keys cleared when a task leaves the blocked state.
    pub const BLOCKED_KEYS: &[&str] = &[
        BLOCKED_REASON,
        BLOCKED_ERROR,
        CONFLICT_FILES,
        SYNC_STRATEGY,
        TARGET_BRANCH,
        GATE_PHASE,
        GATE_REJECTION,
    ];
}

/// A human decision recorded against a gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Approval {
    pub approved: bool,
    pub reason: Option<String>,
}

/// A unit of work driven through a phase plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub weight: Weight,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub current_phase: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>, weight: Weight) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            weight,
            status: TaskStatus::Created,
            blocked_by: Vec::new(),
            branch: String::new(),
            current_phase: None,
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn set_meta(&mut self, key: &str, value: impl Into<String>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    pub fn remove_meta(&mut self, key: &str) -> Option<String> {
        self.metadata.remove(key)
    }

    /// Move the task to `blocked`, recording why.
    pub fn mark_blocked(&mut self, reason: BlockedReason, error: impl Into<String>) {
        self.set_meta(meta::BLOCKED_REASON, reason.as_str());
        self.set_meta(meta::BLOCKED_ERROR, error);
        self.set_status(TaskStatus::Blocked);
    }

    pub fn blocked_reason(&self) -> Option<BlockedReason> {
        self.meta(meta::BLOCKED_REASON).and_then(|r| r.parse().ok())
    }

    pub fn clear_blocked(&mut self) {
        for key in meta::BLOCKED_KEYS {
            self.metadata.remove(*key);
        }
    }

    /// Human decision for `phase`, if one was recorded.
    pub fn approval(&self, phase: &str) -> Option<Approval> {
        let value = self.meta(&format!("{}{}", meta::APPROVAL_PREFIX, phase))?;
        let approved = match value {
            "approved" => true,
            "rejected" => false,
            _ => return None,
        };
        let reason = self
            .meta(&format!("{}{}", meta::APPROVAL_REASON_PREFIX, phase))
            .map(str::to_string);
        Some(Approval { approved, reason })
    }

    pub fn record_approval(&mut self, phase: &str, approved: bool, reason: Option<&str>) {
        let value = if approved { "approved" } else { "rejected" };
        self.set_meta(&format!("{}{}", meta::APPROVAL_PREFIX, phase), value);
        let reason_key = format!("{}{}", meta::APPROVAL_REASON_PREFIX, phase);
        match reason {
            Some(r) => self.set_meta(&reason_key, r),
            None => {
                self.metadata.remove(&reason_key);
            }
        }
        self.touch();
    }

    pub fn clear_approval(&mut self, phase: &str) {
        self.metadata
            .remove(&format!("{}{}", meta::APPROVAL_PREFIX, phase));
        self.metadata
            .remove(&format!("{}{}", meta::APPROVAL_REASON_PREFIX, phase));
    }
}

/// Format a task id from its sequence number: `TASK-001`.
pub fn format_task_id(n: u32) -> String {
    format!("TASK-{:03}", n)
}

/// Sequence number of a `TASK-NNN` id.
pub fn parse_task_number(id: &str) -> Option<u32> {
    id.strip_prefix("TASK-")?.parse().ok()
}
