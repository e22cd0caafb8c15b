//! End-to-end engine tests against a real git repository.
//!
//! The agent is scripted: it writes one file per phase into the workspace it
//! is handed, so checkpoints, rewinds and syncs operate on real commits.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use git2::{Repository, RepositoryInitOptions};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use taskforge::agent::{AgentEvent, AgentOutcome, AgentRequest, AgentRunner};
use taskforge::blocked::BlockedContext;
use taskforge::errors::{AgentError, ExecutorError};
use taskforge::orchestrator::Executor;
use taskforge::plan::{PhaseStatus, build_plan};
use taskforge::settings::Settings;
use taskforge::state::{ExecutionState, SystemProbe};
use taskforge::storage::{Backend, MemoryBackend};
use taskforge::task::{BlockedReason, Task, TaskStatus, Weight};
use taskforge::tracker::GitWorkspace;

// =========================================
// Helpers
// =========================================

fn init_repo(dir: &Path) -> Repository {
    let mut opts = RepositoryInitOptions::new();
    opts.initial_head("main");
    let repo = Repository::init_opts(dir, &opts).unwrap();
    {
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
    }
    fs::write(dir.join("README.md"), "# project\n").unwrap();
    let mut index = repo.index().unwrap();
    index.add_path(Path::new("README.md")).unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    {
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = git2::Signature::now("test", "test@test.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
            .unwrap();
    }
    repo
}

/// Commit `files` onto `branch` without touching the working tree.
fn commit_on_branch(dir: &Path, branch: &str, files: &[(&str, &str)]) {
    let repo = Repository::open(dir).unwrap();
    let parent = repo
        .find_branch(branch, git2::BranchType::Local)
        .unwrap()
        .get()
        .peel_to_commit()
        .unwrap();
    let mut builder = repo.treebuilder(Some(&parent.tree().unwrap())).unwrap();
    for (name, content) in files {
        let blob = repo.blob(content.as_bytes()).unwrap();
        builder.insert(name, blob, 0o100644).unwrap();
    }
    let tree = repo.find_tree(builder.write().unwrap()).unwrap();
    let sig = git2::Signature::now("test", "test@test.com").unwrap();
    repo.commit(
        Some(&format!("refs/heads/{}", branch)),
        &sig,
        &sig,
        "upstream change",
        &tree,
        &[&parent],
    )
    .unwrap();
}

fn branch_log(dir: &Path, branch: &str) -> Vec<String> {
    let repo = Repository::open(dir).unwrap();
    let head = repo
        .find_branch(branch, git2::BranchType::Local)
        .unwrap()
        .get()
        .peel_to_commit()
        .unwrap();
    let mut walk = repo.revwalk().unwrap();
    walk.push(head.id()).unwrap();
    walk.map(|oid| {
        repo.find_commit(oid.unwrap())
            .unwrap()
            .summary()
            .unwrap_or("")
            .to_string()
    })
    .collect()
}

/// What the agent does for one phase beyond writing `<phase>.txt`.
#[derive(Clone)]
enum Action {
    /// Write extra files into the workspace
    Write(Vec<(&'static str, &'static str)>),
    /// Commit these files onto the target branch behind the task's back
    Upstream(Vec<(&'static str, &'static str)>),
    /// Trip the run's cancellation token and wait to be cancelled
    Hang,
}

struct FileAgent {
    actions: Mutex<HashMap<&'static str, Vec<Action>>>,
    requests: Mutex<Vec<AgentRequest>>,
    run_token: CancellationToken,
}

impl FileAgent {
    fn new(run_token: CancellationToken) -> Self {
        Self {
            actions: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            run_token,
        }
    }

    fn on(self, phase: &'static str, action: Action) -> Self {
        self.actions
            .lock()
            .unwrap()
            .entry(phase)
            .or_default()
            .push(action);
        self
    }

    fn phases_run(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.phase_id.clone())
            .collect()
    }

    fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentRunner for FileAgent {
    async fn invoke(
        &self,
        request: AgentRequest,
        events: UnboundedSender<AgentEvent>,
        cancel: CancellationToken,
    ) -> Result<AgentOutcome, AgentError> {
        self.requests.lock().unwrap().push(request.clone());
        let session = format!("sess-{}", request.phase_id);
        let _ = events.send(AgentEvent::Session(session.clone()));

        // Actions are consumed so a re-run of the phase behaves normally
        let actions = self
            .actions
            .lock()
            .unwrap()
            .remove(request.phase_id.as_str())
            .unwrap_or_default();
        for action in actions {
            match action {
                Action::Write(files) => {
                    for (name, content) in files {
                        fs::write(request.working_dir.join(name), content).unwrap();
                    }
                }
                Action::Upstream(files) => commit_on_branch(&request.working_dir, "main", &files),
                Action::Hang => {
                    self.run_token.cancel();
                    cancel.cancelled().await;
                    return Err(AgentError::Cancelled);
                }
            }
        }

        fs::write(
            request.working_dir.join(format!("{}.txt", request.phase_id)),
            format!("output of {}\n", request.phase_id),
        )
        .unwrap();
        Ok(AgentOutcome {
            output: format!("{} done", request.phase_id),
            session_id: Some(session),
            ..Default::default()
        })
    }
}

struct Engine {
    dir: TempDir,
    backend: Arc<MemoryBackend>,
    agent: Arc<FileAgent>,
    executor: Executor,
}

fn engine(configure: impl FnOnce(FileAgent) -> FileAgent) -> Engine {
    let dir = TempDir::new().unwrap();
    init_repo(dir.path());
    let backend = Arc::new(MemoryBackend::new());
    let cancel = CancellationToken::new();
    let agent = Arc::new(configure(FileAgent::new(cancel.clone())));
    let settings = Settings::default();
    let vcs = Arc::new(GitWorkspace::new(dir.path(), settings.git.clone()));
    let executor = Executor::new(backend.clone(), agent.clone(), vcs, settings)
        .with_cancel_token(cancel);
    Engine {
        dir,
        backend,
        agent,
        executor,
    }
}

impl Engine {
    /// A fresh executor and agent over the same repository and store.
    fn restart(&mut self) {
        let cancel = CancellationToken::new();
        self.agent = Arc::new(FileAgent::new(cancel.clone()));
        let settings = Settings::default();
        let vcs = Arc::new(GitWorkspace::new(self.dir.path(), settings.git.clone()));
        self.executor = Executor::new(self.backend.clone(), self.agent.clone(), vcs, settings)
            .with_cancel_token(cancel);
    }
}

fn trivial_task() -> (Task, ExecutionState) {
    let task = Task::new("TASK-001", "Fix typo", Weight::Trivial);
    let state = ExecutionState::new(&task.id);
    (task, state)
}

// =========================================
// Full runs
// =========================================

#[tokio::test]
async fn test_trivial_task_checkpoints_every_phase() {
    let e = engine(|a| a);
    let (mut task, mut state) = trivial_task();
    let plan = build_plan(&task.id, task.weight);

    e.executor
        .execute_task(&mut task, &plan, &mut state)
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.branch, "taskforge/TASK-001");
    assert_eq!(e.agent.phases_run(), vec!["spec", "implement"]);

    let log = branch_log(e.dir.path(), "taskforge/TASK-001");
    assert!(log.iter().any(|m| m == "[taskforge] TASK-001: spec - completed"));
    assert!(log.iter().any(|m| m == "[taskforge] TASK-001: implement - completed"));

    let spec_sha = state.phase("spec").unwrap().commit_sha.clone().unwrap();
    let impl_sha = state.phase("implement").unwrap().commit_sha.clone().unwrap();
    assert_ne!(spec_sha, impl_sha);

    let report = state.finalize.as_ref().unwrap();
    assert!(!report.synced);
    assert_eq!(report.files_changed, 2);
    assert_eq!(state.phase_status("finalize"), PhaseStatus::Completed);

    // Persisted copy matches what the caller holds
    let stored = e.backend.load_task("TASK-001").unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert!(e.backend.load_state("TASK-001").unwrap().execution.is_none());
}

#[tokio::test]
async fn test_finalize_merges_upstream_changes() {
    let e = engine(|a| a.on("implement", Action::Upstream(vec![("CHANGELOG.md", "v2\n")])));
    let (mut task, mut state) = trivial_task();
    let plan = build_plan(&task.id, task.weight);

    e.executor
        .execute_task(&mut task, &plan, &mut state)
        .await
        .unwrap();

    let report = state.finalize.as_ref().unwrap();
    assert!(report.synced);
    assert_eq!(report.behind, 1);
    assert!(e.dir.path().join("CHANGELOG.md").exists());
    assert!(
        branch_log(e.dir.path(), "taskforge/TASK-001")
            .iter()
            .any(|m| m.starts_with("Merge main into taskforge/TASK-001"))
    );
}

#[tokio::test]
async fn test_finalize_conflict_blocks_with_files() {
    let e = engine(|a| {
        a.on(
            "implement",
            Action::Write(vec![
                ("a.go", "package a // task\n"),
                ("b.go", "package b // task\n"),
            ]),
        )
        .on(
            "implement",
            Action::Upstream(vec![
                ("a.go", "package a // main\n"),
                ("b.go", "package b // main\n"),
            ]),
        )
    });
    let (mut task, mut state) = trivial_task();
    let plan = build_plan(&task.id, task.weight);

    let err = e
        .executor
        .execute_task(&mut task, &plan, &mut state)
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::TaskBlocked(_)));

    // Implement was checkpointed before the sync failed
    assert!(state.phase("implement").unwrap().commit_sha.is_some());

    let stored = e.backend.load_task("TASK-001").unwrap();
    assert_eq!(stored.status, TaskStatus::Blocked);
    assert_eq!(stored.blocked_reason(), Some(BlockedReason::SyncConflict));

    let ctx = BlockedContext::from_task(&stored, &Settings::default(), e.dir.path());
    assert_eq!(ctx.conflict_files, vec!["a.go", "b.go"]);
    assert_eq!(ctx.target_branch, "main");
    assert_eq!(ctx.branch, "taskforge/TASK-001");
    assert!(ctx.guidance().iter().any(|step| step.contains("a.go")));

    // The merge left the checkout untouched
    assert_eq!(
        fs::read_to_string(e.dir.path().join("a.go")).unwrap(),
        "package a // task\n"
    );
}

// =========================================
// Interruption and recovery
// =========================================

#[tokio::test]
async fn test_cancelled_run_resumes_from_interrupted_phase() {
    let mut e = engine(|a| a.on("implement", Action::Hang));
    let (mut task, mut state) = trivial_task();
    let plan = build_plan(&task.id, task.weight);

    let err = e
        .executor
        .execute_task(&mut task, &plan, &mut state)
        .await
        .unwrap_err();
    assert!(err.is_interrupted());
    assert_eq!(state.phase_status("spec"), PhaseStatus::Completed);
    assert_eq!(state.phase_status("implement"), PhaseStatus::Interrupted);

    // A new process picks the task up from the store
    e.restart();
    let mut task = e.backend.load_task("TASK-001").unwrap();
    let mut state = e.backend.load_state("TASK-001").unwrap();
    e.executor
        .resume_task(&mut task, &mut state, false, &SystemProbe)
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(e.agent.phases_run(), vec!["implement"]);
    let request = &e.agent.requests()[0];
    assert_eq!(request.resume_session.as_deref(), Some("sess-implement"));
    assert!(e.dir.path().join("implement.txt").exists());
}

#[tokio::test]
async fn test_rewind_resets_branch_and_reruns() {
    let mut e = engine(|a| a);
    let (mut task, mut state) = trivial_task();
    let plan = build_plan(&task.id, task.weight);
    e.executor
        .execute_task(&mut task, &plan, &mut state)
        .await
        .unwrap();
    let spec_sha = state.phase("spec").unwrap().commit_sha.clone().unwrap();

    let sha = e
        .executor
        .rewind_to_phase(&mut task, &mut state, "implement")
        .unwrap();
    assert_eq!(sha, spec_sha);
    assert_eq!(task.status, TaskStatus::Paused);
    assert_eq!(state.phase_status("spec"), PhaseStatus::Completed);
    assert_eq!(state.phase_status("implement"), PhaseStatus::Pending);
    assert_eq!(state.phase_status("finalize"), PhaseStatus::Pending);
    assert!(e.dir.path().join("spec.txt").exists());
    assert!(!e.dir.path().join("implement.txt").exists());

    e.restart();
    e.executor
        .resume_task(&mut task, &mut state, false, &SystemProbe)
        .await
        .unwrap();
    assert_eq!(e.agent.phases_run(), vec!["implement"]);
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_completed_task_cannot_resume() {
    let e = engine(|a| a);
    let (mut task, mut state) = trivial_task();
    let plan = build_plan(&task.id, task.weight);
    e.executor
        .execute_task(&mut task, &plan, &mut state)
        .await
        .unwrap();

    let err = e
        .executor
        .resume_task(&mut task, &mut state, false, &SystemProbe)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Task TASK-001 is already completed");
}
