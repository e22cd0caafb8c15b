//! Phase plans: the ordered phase sequence a task's weight selects.
//!
//! Plans are derived data. They are rebuilt from the task weight whenever
//! needed and persisted only so operators can inspect what ran.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::task::Weight;

/// Id of the synthetic phase that syncs and closes out a task.
pub const FINALIZE_PHASE: &str = "finalize";

const TRIVIAL: &[&str] = &["spec", "implement"];
const SMALL: &[&str] = &["spec", "implement", "review"];
const MEDIUM: &[&str] = &["spec", "tests", "implement", "review", "docs"];
const LARGE: &[&str] = &[
    "spec",
    "tests",
    "breakdown",
    "implement",
    "review",
    "docs",
    "validate",
];

/// Phase ids for a weight.
pub fn phases_for(weight: Weight) -> &'static [&'static str] {
    match weight {
        Weight::Trivial => TRIVIAL,
        Weight::Small => SMALL,
        Weight::Medium => MEDIUM,
        Weight::Large => LARGE,
    }
}

/// Human-readable name for a phase id.
pub fn display_name(id: &str) -> String {
    match id {
        "spec" => "Specification".to_string(),
        "tests" => "Test Authoring".to_string(),
        "breakdown" => "Work Breakdown".to_string(),
        "implement" => "Implementation".to_string(),
        "review" => "Code Review".to_string(),
        "docs" => "Documentation".to_string(),
        "validate" => "Validation".to_string(),
        FINALIZE_PHASE => "Finalize".to_string(),
        other => {
            let mut chars = other.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        }
    }
}

/// Status of one phase within a run.
///
/// `Interrupted` is transient: a phase that was running when its executor
/// stopped. Resume treats it like `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Interrupted,
    Completed,
    Failed,
    Skipped,
}

impl PhaseStatus {
    /// Completed or skipped phases are never re-run by a plain execute.
    pub fn is_done(&self) -> bool {
        matches!(self, PhaseStatus::Completed | PhaseStatus::Skipped)
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, PhaseStatus::Running | PhaseStatus::Interrupted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Running => "running",
            PhaseStatus::Interrupted => "interrupted",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of check applied after a phase finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateKind {
    None,
    #[default]
    Auto,
    Ai,
    Human,
}

impl fmt::Display for GateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateKind::None => write!(f, "none"),
            GateKind::Auto => write!(f, "auto"),
            GateKind::Ai => write!(f, "ai"),
            GateKind::Human => write!(f, "human"),
        }
    }
}

impl FromStr for GateKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(GateKind::None),
            "auto" => Ok(GateKind::Auto),
            "ai" => Ok(GateKind::Ai),
            "human" => Ok(GateKind::Human),
            other => Err(format!(
                "Invalid gate: '{}'. Valid values: none, auto, ai, human",
                other
            )),
        }
    }
}

/// One step of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub gate: GateKind,
}

impl Phase {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: display_name(id),
            gate: GateKind::default(),
        }
    }

    pub fn is_finalize(&self) -> bool {
        self.id == FINALIZE_PHASE
    }
}

/// Ordered phase sequence for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub task_id: String,
    pub weight: Weight,
    pub phases: Vec<Phase>,
}

impl Plan {
    pub fn phase_ids(&self) -> Vec<&str> {
        self.phases.iter().map(|p| p.id.as_str()).collect()
    }

    pub fn index_of(&self, phase_id: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.id == phase_id)
    }

    pub fn get(&self, phase_id: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == phase_id)
    }

    pub fn contains(&self, phase_id: &str) -> bool {
        self.index_of(phase_id).is_some()
    }

    /// Append the finalize phase unless the plan already ends with one.
    pub fn with_finalize(mut self, gate: GateKind) -> Self {
        if !self.phases.iter().any(Phase::is_finalize) {
            let mut phase = Phase::new(FINALIZE_PHASE);
            phase.gate = gate;
            self.phases.push(phase);
        }
        self
    }

    /// A plan containing `phase_id` and everything after it.
    pub fn from_phase(&self, phase_id: &str) -> Option<Plan> {
        let idx = self.index_of(phase_id)?;
        Some(Plan {
            task_id: self.task_id.clone(),
            weight: self.weight,
            phases: self.phases[idx..].to_vec(),
        })
    }
}

/// Build the phase plan for a task weight.
///
/// Pure: the same weight always yields the same sequence. Every phase
/// starts with an `auto` gate; per-phase overrides are applied by the
/// orchestrator from settings.
pub fn build_plan(task_id: &str, weight: Weight) -> Plan {
    Plan {
        task_id: task_id.to_string(),
        weight,
        phases: phases_for(weight).iter().map(|id| Phase::new(id)).collect(),
    }
}

/// Build a plan from a stored weight label, falling back to `medium`.
pub fn build_plan_from_label(task_id: &str, label: &str) -> Plan {
    build_plan(task_id, Weight::from_label(label))
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================
    // Phase table tests
    // =========================================

    #[test]
    fn test_phase_table() {
        assert_eq!(
            build_plan("T", Weight::Trivial).phase_ids(),
            vec!["spec", "implement"]
        );
        assert_eq!(
            build_plan("T", Weight::Small).phase_ids(),
            vec!["spec", "implement", "review"]
        );
        assert_eq!(
            build_plan("T", Weight::Medium).phase_ids(),
            vec!["spec", "tests", "implement", "review", "docs"]
        );
        assert_eq!(
            build_plan("T", Weight::Large).phase_ids(),
            vec![
                "spec",
                "tests",
                "breakdown",
                "implement",
                "review",
                "docs",
                "validate"
            ]
        );
    }

    #[test]
    fn test_build_plan_is_deterministic() {
        for weight in Weight::ALL {
            assert_eq!(build_plan("T", weight), build_plan("T", weight));
        }
    }

    #[test]
    fn test_unknown_label_uses_medium_plan() {
        let plan = build_plan_from_label("T", "gigantic");
        assert_eq!(plan.weight, Weight::Medium);
        assert_eq!(plan.phases.len(), 5);
    }

    #[test]
    fn test_phases_start_with_auto_gate() {
        let plan = build_plan("T", Weight::Small);
        assert!(plan.phases.iter().all(|p| p.gate == GateKind::Auto));
    }

    // =========================================
    // Plan helpers
    // =========================================

    #[test]
    fn test_with_finalize_is_idempotent() {
        let plan = build_plan("T", Weight::Trivial)
            .with_finalize(GateKind::None)
            .with_finalize(GateKind::Human);
        assert_eq!(plan.phase_ids(), vec!["spec", "implement", "finalize"]);
        assert_eq!(plan.get(FINALIZE_PHASE).unwrap().gate, GateKind::None);
    }

    #[test]
    fn test_from_phase_slices_tail() {
        let plan = build_plan("T", Weight::Medium);
        let tail = plan.from_phase("implement").unwrap();
        assert_eq!(tail.phase_ids(), vec!["implement", "review", "docs"]);
        assert!(plan.from_phase("missing").is_none());
    }

    #[test]
    fn test_display_name() {
        assert_eq!(display_name("implement"), "Implementation");
        assert_eq!(display_name("custom"), "Custom");
    }

    #[test]
    fn test_gate_kind_parse() {
        assert_eq!("AI".parse::<GateKind>().unwrap(), GateKind::Ai);
        assert!("robot".parse::<GateKind>().is_err());
        assert_eq!(GateKind::Human.to_string(), "human");
    }
}
