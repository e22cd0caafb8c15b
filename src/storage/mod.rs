//! Persistence for tasks, plans and execution state.
//!
//! | Backend | Use |
//! |---------|-----|
//! | [`FileBackend`] | YAML files under `.taskforge/tasks/<ID>/` |
//! | [`MemoryBackend`] | Tests and embedding |

mod file;
mod memory;

pub use file::FileBackend;
pub use memory::MemoryBackend;

use crate::errors::StorageError;
use crate::plan::Plan;
use crate::state::ExecutionState;
use crate::task::{Task, format_task_id, parse_task_number};

/// Storage seam the orchestrator persists through.
///
/// Every save must be durable once it returns: a crash immediately after
/// must leave either the previous or the new record, never a torn one.
pub trait Backend: Send + Sync {
    fn load_task(&self, id: &str) -> Result<Task, StorageError>;
    fn save_task(&self, task: &Task) -> Result<(), StorageError>;
    fn list_tasks(&self) -> Result<Vec<Task>, StorageError>;

    fn load_state(&self, task_id: &str) -> Result<ExecutionState, StorageError>;
    fn save_state(&self, state: &ExecutionState) -> Result<(), StorageError>;

    fn load_plan(&self, task_id: &str) -> Result<Plan, StorageError>;
    fn save_plan(&self, plan: &Plan) -> Result<(), StorageError>;

    /// Next free `TASK-NNN` id.
    fn next_task_id(&self) -> Result<String, StorageError> {
        let max = self
            .list_tasks()?
            .iter()
            .filter_map(|t| parse_task_number(&t.id))
            .max()
            .unwrap_or(0);
        Ok(format_task_id(max + 1))
    }
}

/// Load state, starting fresh when none has been recorded.
pub fn load_state_or_new(
    backend: &dyn Backend,
    task_id: &str,
) -> Result<ExecutionState, StorageError> {
    match backend.load_state(task_id) {
        Ok(state) => Ok(state),
        Err(e) if e.is_not_found() => Ok(ExecutionState::new(task_id)),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Weight;

    #[test]
    fn test_next_task_id_counts_up() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.next_task_id().unwrap(), "TASK-001");
        backend
            .save_task(&Task::new("TASK-001", "a", Weight::Small))
            .unwrap();
        backend
            .save_task(&Task::new("TASK-007", "b", Weight::Small))
            .unwrap();
        assert_eq!(backend.next_task_id().unwrap(), "TASK-008");
    }

    #[test]
    fn test_load_state_or_new_falls_back() {
        let backend = MemoryBackend::new();
        let state = load_state_or_new(&backend, "TASK-001").unwrap();
        assert_eq!(state.task_id, "TASK-001");
        assert!(state.phases.is_empty());
    }
}
