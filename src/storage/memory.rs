use std::collections::HashMap;
use std::sync::Mutex;

use crate::errors::StorageError;
use crate::plan::Plan;
use crate::state::ExecutionState;
use crate::storage::Backend;
use crate::task::Task;

#[derive(Default)]
struct Records {
    tasks: HashMap<String, Task>,
    states: HashMap<String, ExecutionState>,
    plans: HashMap<String, Plan>,
    state_saves: usize,
}

/// In-process backend holding clones of every record.
#[derive(Default)]
pub struct MemoryBackend {
    records: Mutex<Records>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of state saves so far.
    pub fn state_saves(&self) -> usize {
        self.records.lock().map(|r| r.state_saves).unwrap_or(0)
    }

    fn with<T>(&self, f: impl FnOnce(&mut Records) -> T) -> Result<T, StorageError> {
        let mut records = self.records.lock().map_err(|_| StorageError::LockPoisoned)?;
        Ok(f(&mut records))
    }
}

impl Backend for MemoryBackend {
    fn load_task(&self, id: &str) -> Result<Task, StorageError> {
        self.with(|r| r.tasks.get(id).cloned())?
            .ok_or_else(|| StorageError::TaskNotFound { id: id.to_string() })
    }

    fn save_task(&self, task: &Task) -> Result<(), StorageError> {
        self.with(|r| {
            r.tasks.insert(task.id.clone(), task.clone());
        })
    }

    fn list_tasks(&self) -> Result<Vec<Task>, StorageError> {
        let mut tasks: Vec<Task> = self.with(|r| r.tasks.values().cloned().collect())?;
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    fn load_state(&self, task_id: &str) -> Result<ExecutionState, StorageError> {
        self.with(|r| r.states.get(task_id).cloned())?
            .ok_or_else(|| StorageError::StateNotFound {
                id: task_id.to_string(),
            })
    }

    fn save_state(&self, state: &ExecutionState) -> Result<(), StorageError> {
        self.with(|r| {
            r.state_saves += 1;
            r.states.insert(state.task_id.clone(), state.clone());
        })
    }

    fn load_plan(&self, task_id: &str) -> Result<Plan, StorageError> {
        self.with(|r| r.plans.get(task_id).cloned())?
            .ok_or_else(|| StorageError::PlanNotFound {
                id: task_id.to_string(),
            })
    }

    fn save_plan(&self, plan: &Plan) -> Result<(), StorageError> {
        self.with(|r| {
            r.plans.insert(plan.task_id.clone(), plan.clone());
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Weight;

    #[test]
    fn test_memory_backend_isolates_clones() {
        let backend = MemoryBackend::new();
        let mut task = Task::new("TASK-001", "t", Weight::Small);
        backend.save_task(&task).unwrap();
        task.title = "changed".into();
        assert_eq!(backend.load_task("TASK-001").unwrap().title, "t");
    }

    #[test]
    fn test_memory_backend_counts_state_saves() {
        let backend = MemoryBackend::new();
        let state = ExecutionState::new("TASK-001");
        backend.save_state(&state).unwrap();
        backend.save_state(&state).unwrap();
        assert_eq!(backend.state_saves(), 2);
        assert!(backend.load_state("TASK-002").unwrap_err().is_not_found());
    }
}
