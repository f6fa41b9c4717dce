// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! End-to-end orchestration scenarios.
//!
//! Each test stands up a real orchestrator over a scratch git repository and
//! drives real child processes (this crate's binary in child mode, running
//! the scripted task runner).

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;

use codi_orchestrator::ipc::ToolConfirmation;
use codi_orchestrator::orchestrator::{Orchestrator, OrchestratorEvent};
use codi_orchestrator::permissions::PermissionPrompt;
use codi_orchestrator::types::{
    ChildKind, OrchestratorConfig, ReaderConfig, WorkerConfig, WorkerStatus,
};
use codi_orchestrator::{ConfirmationResult, OrchestratorError};

fn child_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_codi-orchestrator"))
}

fn run_git(dir: &Path, args: &[&str]) {
    let status = std::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .expect("git invocation failed");
    assert!(status.success(), "git {args:?} failed in {dir:?}");
}

fn init_repo(dir: &Path) {
    run_git(dir, &["init", "--initial-branch=main"]);
    std::fs::write(dir.join("README.md"), "# scratch\n").unwrap();
    run_git(dir, &["add", "."]);
    run_git(
        dir,
        &[
            "-c",
            "user.email=test@example.com",
            "-c",
            "user.name=Test",
            "commit",
            "-m",
            "initial",
        ],
    );
}

/// Operator stand-in: answers every prompt with a fixed verdict and records
/// what it was asked.
struct RecordingPrompt {
    answer: ConfirmationResult,
    calls: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingPrompt {
    fn new(answer: ConfirmationResult) -> (Arc<Self>, Arc<Mutex<Vec<(String, String)>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        (
            Arc::new(Self {
                answer,
                calls: Arc::clone(&calls),
            }),
            calls,
        )
    }
}

#[async_trait]
impl PermissionPrompt for RecordingPrompt {
    async fn on_permission_request(
        &self,
        child_id: &str,
        confirmation: &ToolConfirmation,
    ) -> ConfirmationResult {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((child_id.to_string(), confirmation.tool_name.clone()));
        self.answer
    }
}

struct TestEnv {
    _dir: TempDir,
    orchestrator: Orchestrator,
    events: mpsc::Receiver<OrchestratorEvent>,
    worktree_dir: PathBuf,
    socket_path: PathBuf,
}

impl TestEnv {
    async fn new(
        max_workers: usize,
        max_restarts: u32,
        prompt: Arc<dyn PermissionPrompt>,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let repo = dir.path().join("project");
        std::fs::create_dir(&repo).unwrap();
        init_repo(&repo);

        let worktree_dir = dir.path().join("trees");
        let socket_path = dir.path().join("orc.sock");
        let config = OrchestratorConfig {
            socket_path: socket_path.clone(),
            max_workers,
            worktree_dir: Some(worktree_dir.clone()),
            worktree_prefix: "codi-".to_string(),
            base_branch: "main".to_string(),
            cleanup_on_exit: true,
            max_restarts,
            repo_root: repo,
            child_executable: child_binary(),
        };

        let mut orchestrator = Orchestrator::new(config).with_permission_prompt(prompt);
        orchestrator.start().await.expect("orchestrator start failed");
        let events = orchestrator
            .take_event_receiver()
            .expect("event receiver already taken");

        Self {
            _dir: dir,
            orchestrator,
            events,
            worktree_dir,
            socket_path,
        }
    }

    /// Drain whatever events have been emitted so far.
    async fn drain_events(&mut self) -> Vec<OrchestratorEvent> {
        // Let trailing emissions (AllCompleted, late status) land.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Ordered state transitions observed for one child.
fn states_for(events: &[OrchestratorEvent], id: &str) -> Vec<WorkerStatus> {
    events
        .iter()
        .filter_map(|e| match e {
            OrchestratorEvent::WorkerStatus {
                id: event_id,
                state,
                ..
            } if event_id == id => Some(*state),
            _ => None,
        })
        .collect()
}

fn assert_subsequence(haystack: &[WorkerStatus], needle: &[WorkerStatus]) {
    let mut it = haystack.iter();
    for expected in needle {
        assert!(
            it.any(|s| s == expected),
            "expected state sequence {needle:?} within {haystack:?}"
        );
    }
}

// S1 - happy path, single worker.
#[tokio::test]
async fn s1_happy_path_single_worker() {
    let (prompt, calls) = RecordingPrompt::new(ConfirmationResult::Approve);
    let mut env = TestEnv::new(2, 2, prompt).await;

    let id = env
        .orchestrator
        .spawn_worker(WorkerConfig::new(
            "w1",
            r#"say starting; ask write_file {"path":"HELLO.md"}; done wrote HELLO.md"#,
        ))
        .await
        .expect("spawn failed");
    assert_eq!(id, "w1");

    let results = env.orchestrator.wait_all().await;
    assert_eq!(results.len(), 1);
    assert!(results[0].success);
    assert_eq!(results[0].response, "wrote HELLO.md");
    assert_eq!(results[0].tool_call_count, 1);

    // The operator saw exactly one write_file prompt from w1.
    assert_eq!(
        calls.lock().unwrap_or_else(|e| e.into_inner()).clone(),
        vec![("w1".to_string(), "write_file".to_string())]
    );

    let events = env.drain_events().await;
    assert!(matches!(
        events.first(),
        Some(OrchestratorEvent::WorkerStarted { id, .. }) if id == "w1"
    ));
    assert_subsequence(
        &states_for(&events, "w1"),
        &[
            WorkerStatus::Idle,
            WorkerStatus::Thinking,
            WorkerStatus::WaitingPermission,
            WorkerStatus::Thinking,
            WorkerStatus::ExecutingTool,
            WorkerStatus::Thinking,
        ],
    );
    assert!(events.iter().any(|e| matches!(
        e,
        OrchestratorEvent::PermissionRequest { id, confirmation, .. }
            if id == "w1" && confirmation.tool_name == "write_file"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        OrchestratorEvent::WorkerCompleted { id, result, .. } if id == "w1" && result.success
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, OrchestratorEvent::AllCompleted { results } if results.len() == 1)));

    env.orchestrator.stop().await.unwrap();
}

// S2 - capacity rejection.
#[tokio::test]
async fn s2_capacity_rejection() {
    let (prompt, _calls) = RecordingPrompt::new(ConfirmationResult::Approve);
    let mut env = TestEnv::new(1, 2, prompt).await;

    env.orchestrator
        .spawn_worker(WorkerConfig::new("w1", "sleep 20000; done"))
        .await
        .expect("first spawn failed");

    let err = env
        .orchestrator
        .spawn_worker(WorkerConfig::new("w2", "done"))
        .await
        .expect_err("second spawn should exceed capacity");
    assert!(matches!(err, OrchestratorError::CapacityExceeded { .. }));

    let active = env.orchestrator.get_active_workers().await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, "w1");

    env.orchestrator.stop().await.unwrap();
}

// S3 - operator denial.
#[tokio::test]
async fn s3_operator_denial() {
    let (prompt, calls) = RecordingPrompt::new(ConfirmationResult::Deny);
    let mut env = TestEnv::new(2, 2, prompt).await;

    env.orchestrator
        .spawn_worker(WorkerConfig::new(
            "w1",
            r#"ask bash {"cmd":"rm -rf /"}; done"#,
        ))
        .await
        .expect("spawn failed");

    let results = env.orchestrator.wait_all().await;
    assert_eq!(results.len(), 1);
    // The denial is reported in-band by the child.
    assert!(!results[0].success);
    assert!(results[0].response.contains("bash"));

    assert_eq!(
        calls.lock().unwrap_or_else(|e| e.into_inner()).clone(),
        vec![("w1".to_string(), "bash".to_string())]
    );

    let snapshot = env.orchestrator.get_worker("w1").await.unwrap();
    assert_eq!(snapshot.state, WorkerStatus::Complete);

    env.orchestrator.stop().await.unwrap();
}

// S4 - disconnect without restart.
#[tokio::test]
async fn s4_disconnect_without_restart() {
    let (prompt, _calls) = RecordingPrompt::new(ConfirmationResult::Approve);
    let mut env = TestEnv::new(2, 0, prompt).await;

    env.orchestrator
        .spawn_worker(WorkerConfig::new("w1", "sleep 100; die"))
        .await
        .expect("spawn failed");

    let results = env.orchestrator.wait_all().await;
    assert_eq!(results.len(), 1);
    assert!(!results[0].success);
    assert_eq!(results[0].response, "Worker disconnected unexpectedly");

    let snapshot = env.orchestrator.get_worker("w1").await.unwrap();
    assert_eq!(snapshot.state, WorkerStatus::Failed);
    assert_eq!(snapshot.restart_count, 0);
    assert_eq!(
        snapshot.error.as_deref(),
        Some("Worker disconnected unexpectedly")
    );

    let events = env.drain_events().await;
    assert!(events.iter().any(|e| matches!(
        e,
        OrchestratorEvent::WorkerFailed { id, error, .. }
            if id == "w1" && error == "Worker disconnected unexpectedly"
    )));

    // Terminal states are absorbing: nothing changes afterwards.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let snapshot = env.orchestrator.get_worker("w1").await.unwrap();
    assert_eq!(snapshot.state, WorkerStatus::Failed);

    env.orchestrator.stop().await.unwrap();
}

// S5 - disconnect with restart.
#[tokio::test]
async fn s5_disconnect_with_restart() {
    let (prompt, _calls) = RecordingPrompt::new(ConfirmationResult::Approve);
    let mut env = TestEnv::new(2, 1, prompt).await;

    env.orchestrator
        .spawn_worker(WorkerConfig::new("w1", "crash-once; done resumed"))
        .await
        .expect("spawn failed");

    let results = env.orchestrator.wait_all().await;
    assert_eq!(results.len(), 1);
    assert!(results[0].success, "restarted worker should finish: {results:?}");
    assert_eq!(results[0].response, "resumed");

    let snapshot = env.orchestrator.get_worker("w1").await.unwrap();
    assert_eq!(snapshot.state, WorkerStatus::Complete);
    assert_eq!(snapshot.restart_count, 1);

    // The crash must not surface as a failure.
    let events = env.drain_events().await;
    assert!(!events
        .iter()
        .any(|e| matches!(e, OrchestratorEvent::WorkerFailed { id, .. } if id == "w1")));

    // The restarted child went through starting -> idle again.
    let states = states_for(&events, "w1");
    assert!(states.contains(&WorkerStatus::Starting));
    assert!(states.iter().filter(|s| **s == WorkerStatus::Idle).count() >= 2);

    env.orchestrator.stop().await.unwrap();
}

// S6 - graceful shutdown.
#[tokio::test]
async fn s6_graceful_shutdown() {
    let (prompt, _calls) = RecordingPrompt::new(ConfirmationResult::Approve);
    let mut env = TestEnv::new(5, 2, prompt).await;

    for i in 1..=3 {
        env.orchestrator
            .spawn_worker(WorkerConfig::new(
                format!("w{i}"),
                "sleep 60000; done",
            ))
            .await
            .expect("spawn failed");
    }

    // Let the children connect before shutting down.
    tokio::time::sleep(Duration::from_millis(500)).await;

    env.orchestrator.stop().await.unwrap();

    assert!(env.orchestrator.get_active_workers().await.is_empty());
    for snapshot in env.orchestrator.get_workers().await {
        assert_eq!(snapshot.state, WorkerStatus::Cancelled);
    }

    assert!(!env.socket_path.exists(), "socket path should be removed");
    if env.worktree_dir.exists() {
        let leftover: Vec<_> = std::fs::read_dir(&env.worktree_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert!(
            leftover.is_empty(),
            "no workspaces should remain after cleanup: {leftover:?}"
        );
    }
}

// Auto-approve bypass: the operator is never consulted, yet the child is
// approved over the wire.
#[tokio::test]
async fn auto_approve_bypasses_operator() {
    let (prompt, calls) = RecordingPrompt::new(ConfirmationResult::Deny);
    let mut env = TestEnv::new(2, 2, prompt).await;

    env.orchestrator
        .spawn_worker(
            WorkerConfig::new(
                "w1",
                r#"ask write_file {"path":"HELLO.md"}; done wrote it"#,
            )
            .with_auto_approve(vec!["write_file".to_string()]),
        )
        .await
        .expect("spawn failed");

    let results = env.orchestrator.wait_all().await;
    assert_eq!(results.len(), 1);
    assert!(results[0].success, "auto-approved tool should run: {results:?}");

    assert!(
        calls.lock().unwrap_or_else(|e| e.into_inner()).is_empty(),
        "operator must not be consulted for auto-approved tools"
    );

    env.orchestrator.stop().await.unwrap();
}

// Readers: allow-listed tools pass without the operator, everything else is
// auto-denied.
#[tokio::test]
async fn reader_allow_list_enforced() {
    let (prompt, calls) = RecordingPrompt::new(ConfirmationResult::Approve);
    let mut env = TestEnv::new(1, 2, prompt).await;

    env.orchestrator
        .spawn_reader(ReaderConfig::new(
            "r1",
            r#"ask grep {"pattern":"fn main"}; ask write_file {"path":"x"}; done"#,
        ))
        .await
        .expect("reader spawn failed");

    // Readers do not participate in wait_all; watch their snapshot instead.
    let mut state = WorkerStatus::Starting;
    for _ in 0..100 {
        if let Some(snapshot) = env.orchestrator.get_worker("r1").await {
            state = snapshot.state;
            if state.is_terminal() {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(state, WorkerStatus::Complete);

    let snapshot = env.orchestrator.get_worker("r1").await.unwrap();
    assert_eq!(snapshot.kind, ChildKind::Reader);
    let result = snapshot.result.expect("reader should report a result");
    // grep passed, write_file was refused.
    assert!(!result.success);
    assert!(result.response.contains("write_file"));
    assert!(!result.response.contains("grep"));
    assert_eq!(result.tool_call_count, 1);

    assert!(
        calls.lock().unwrap_or_else(|e| e.into_inner()).is_empty(),
        "the operator is never consulted for readers"
    );

    env.orchestrator.stop().await.unwrap();
}

// Approve-always: the first prompt is answered by the operator, subsequent
// requests for the same tool are synthesized.
#[tokio::test]
async fn approve_always_sticks_for_worker() {
    let (prompt, calls) = RecordingPrompt::new(ConfirmationResult::ApproveAlways);
    let mut env = TestEnv::new(2, 2, prompt).await;

    env.orchestrator
        .spawn_worker(WorkerConfig::new(
            "w1",
            r#"ask bash {"cmd":"ls"}; ask bash {"cmd":"ls -la"}; done listed"#,
        ))
        .await
        .expect("spawn failed");

    let results = env.orchestrator.wait_all().await;
    assert!(results[0].success);
    assert_eq!(results[0].tool_call_count, 2);

    // One operator decision covered both calls.
    assert_eq!(calls.lock().unwrap_or_else(|e| e.into_inner()).len(), 1);

    env.orchestrator.stop().await.unwrap();
}

// Worker workspaces are real worktrees of the scratch repo.
#[tokio::test]
async fn worker_runs_in_its_own_worktree() {
    let (prompt, _calls) = RecordingPrompt::new(ConfirmationResult::Approve);
    let mut env = TestEnv::new(2, 2, prompt).await;

    env.orchestrator
        .spawn_worker(WorkerConfig::new("w1", "done ok").with_branch("feat/e2e"))
        .await
        .expect("spawn failed");

    let snapshot = env.orchestrator.get_worker("w1").await.unwrap();
    let workspace = snapshot.workspace.expect("worker should have a workspace");
    assert_eq!(workspace.branch, "codi-feat/e2e");
    assert_eq!(workspace.base, "main");
    assert!(workspace.path.starts_with(&env.worktree_dir));
    assert!(workspace.path.join("README.md").exists());

    env.orchestrator.wait_all().await;
    env.orchestrator.stop().await.unwrap();
    assert!(!workspace.path.exists());
}
