use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::StorageError;
use crate::plan::Plan;
use crate::state::ExecutionState;
use crate::storage::Backend;
use crate::task::{Task, parse_task_number};

const TASK_FILE: &str = "task.yaml";
const STATE_FILE: &str = "state.yaml";
const PLAN_FILE: &str = "plan.yaml";

/// YAML-on-disk backend: one directory per task.
#[derive(Debug, Clone)]
pub struct FileBackend {
    tasks_dir: PathBuf,
}

impl FileBackend {
    pub fn new(tasks_dir: impl Into<PathBuf>) -> Self {
        Self {
            tasks_dir: tasks_dir.into(),
        }
    }

    /// Directory for `id`. Only `TASK-<n>` ids map to a path.
    pub fn task_dir(&self, id: &str) -> Result<PathBuf, StorageError> {
        if parse_task_number(id).is_none() {
            return Err(StorageError::InvalidTaskId { id: id.to_string() });
        }
        Ok(self.tasks_dir.join(id))
    }

    fn read<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, StorageError> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StorageError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_yaml::from_str(&content)
            .map(Some)
            .map_err(|source| StorageError::Parse {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Write to a sibling temp file, fsync, then rename over the target.
    fn write<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), StorageError> {
        let io_err = |source| StorageError::Io {
            path: path.to_path_buf(),
            source,
        };
        let content = serde_yaml::to_string(value).map_err(StorageError::Serialize)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = path.with_extension("yaml.tmp");
        {
            let mut file = fs::File::create(&tmp).map_err(io_err)?;
            file.write_all(content.as_bytes()).map_err(io_err)?;
            file.sync_all().map_err(io_err)?;
        }
        fs::rename(&tmp, path).map_err(io_err)
    }
}

impl Backend for FileBackend {
    fn load_task(&self, id: &str) -> Result<Task, StorageError> {
        self.read(&self.task_dir(id)?.join(TASK_FILE))?
            .ok_or_else(|| StorageError::TaskNotFound { id: id.to_string() })
    }

    fn save_task(&self, task: &Task) -> Result<(), StorageError> {
        self.write(&self.task_dir(&task.id)?.join(TASK_FILE), task)
    }

    fn list_tasks(&self) -> Result<Vec<Task>, StorageError> {
        let entries = match fs::read_dir(&self.tasks_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StorageError::Io {
                    path: self.tasks_dir.clone(),
                    source,
                });
            }
        };

        let mut tasks = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path().join(TASK_FILE);
            if !path.is_file() {
                continue;
            }
            match self.read::<Task>(&path) {
                Ok(Some(task)) => tasks.push(task),
                Ok(None) => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable task"),
            }
        }
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    fn load_state(&self, task_id: &str) -> Result<ExecutionState, StorageError> {
        self.read(&self.task_dir(task_id)?.join(STATE_FILE))?
            .ok_or_else(|| StorageError::StateNotFound {
                id: task_id.to_string(),
            })
    }

    fn save_state(&self, state: &ExecutionState) -> Result<(), StorageError> {
        self.write(&self.task_dir(&state.task_id)?.join(STATE_FILE), state)
    }

    fn load_plan(&self, task_id: &str) -> Result<Plan, StorageError> {
        self.read(&self.task_dir(task_id)?.join(PLAN_FILE))?
            .ok_or_else(|| StorageError::PlanNotFound {
                id: task_id.to_string(),
            })
    }

    fn save_plan(&self, plan: &Plan) -> Result<(), StorageError> {
        self.write(&self.task_dir(&plan.task_id)?.join(PLAN_FILE), plan)
    }
}
