// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Child-mode runtime.
//!
//! A `ChildSession` runs inside a spawned worker or reader process and
//! implements the child side of the orchestration contract: dial the
//! endpoint, handshake, report status and logs, round-trip permission
//! requests, observe cancellation, and report a terminal result.
//!
//! The agent loop itself is not part of this crate; embedders provide it
//! behind the [`TaskRunner`] seam. The bundled [`script::ScriptedRunner`]
//! drives the full protocol from a line-oriented task script and backs the
//! binary's child mode and the integration suite.
//!
//! # Lifecycle
//!
//! 1. Connect to the orchestrator's IPC endpoint
//! 2. Send the handshake
//! 3. Resolve the task (argv, or wire re-issue after a restart)
//! 4. Drive the runner, relaying status/permission traffic
//! 5. Report `task_complete` or `task_error`

pub mod script;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::ipc::{
    ConfirmationResult, IpcClient, IpcClientError, LogLevel, StatusUpdate, ToolConfirmation,
};
use crate::types::{ChildKind, WorkerResult, WorkerStatus};

/// How long a restarted child waits for its task to be re-issued.
const TASK_REISSUE_TIMEOUT: Duration = Duration::from_secs(30);

/// Error type for child-session operations.
#[derive(Debug, thiserror::Error)]
pub enum ChildError {
    #[error("IPC error: {0}")]
    Ipc(#[from] IpcClientError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cancelled")]
    Cancelled,

    #[error("No task provided")]
    NoTask,

    #[error("Task failed: {0}")]
    TaskFailed(String),
}

/// Options for running a child session, mirroring the spawn CLI surface.
#[derive(Debug, Clone)]
pub struct ChildOptions {
    /// IPC endpoint to dial.
    pub socket_path: PathBuf,
    /// Identity to send in the handshake.
    pub child_id: String,
    /// Initial task prompt. When empty the session waits for a wire
    /// re-issue (restart path).
    pub task: String,
    /// Worker or reader mode.
    pub kind: ChildKind,
    /// Optional model override.
    pub model: Option<String>,
    /// Optional provider override.
    pub provider: Option<String>,
    /// Tools pre-approved for this child (the `--auto-approve` set).
    pub auto_approve: Vec<String>,
}

/// Handle the runner uses to talk to the orchestrator.
pub struct ChildContext {
    ipc: Arc<Mutex<IpcClient>>,
    auto_approve: Vec<String>,
    tool_calls: AtomicU32,
    tokens_used: AtomicU64,
    cancel_rx: tokio::sync::watch::Receiver<Option<String>>,
}

impl ChildContext {
    /// Report a lifecycle state.
    pub async fn set_status(&self, status: WorkerStatus) -> Result<(), ChildError> {
        let mut ipc = self.ipc.lock().await;
        ipc.send_status(StatusUpdate::new(status)).await?;
        Ok(())
    }

    /// Report a state together with the tool it concerns.
    pub async fn set_tool_status(
        &self,
        status: WorkerStatus,
        tool: &str,
    ) -> Result<(), ChildError> {
        let mut ipc = self.ipc.lock().await;
        ipc.send_status(StatusUpdate::new(status).with_tool(tool))
            .await?;
        Ok(())
    }

    /// Report progress (0-100).
    pub async fn set_progress(&self, progress: u8) -> Result<(), ChildError> {
        let mut ipc = self.ipc.lock().await;
        let mut update = StatusUpdate::new(WorkerStatus::Thinking);
        update.progress = Some(progress.min(100));
        update.tokens_used = Some(self.tokens_used.load(Ordering::Relaxed));
        ipc.send_status(update).await?;
        Ok(())
    }

    /// Emit a log line to the orchestrator.
    pub async fn log(&self, level: LogLevel, content: &str) -> Result<(), ChildError> {
        let mut ipc = self.ipc.lock().await;
        ipc.send_log(level, content).await?;
        Ok(())
    }

    /// Ask for permission to run a tool.
    ///
    /// Every request crosses the wire; auto-approval (including the
    /// `--auto-approve` set this child was spawned with) is synthesized by
    /// the orchestrator so that routing and state transitions stay uniform.
    pub async fn confirm(
        &self,
        confirmation: ToolConfirmation,
    ) -> Result<ConfirmationResult, ChildError> {
        let mut ipc = self.ipc.lock().await;
        Ok(ipc.request_permission(confirmation).await?)
    }

    /// Tools this child was spawned with pre-approval for.
    pub fn auto_approve(&self) -> &[String] {
        &self.auto_approve
    }

    /// Record an executed tool call for the final result.
    pub fn count_tool_call(&self) {
        self.tool_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Add to the cumulative token count.
    pub fn add_tokens(&self, tokens: u64) {
        self.tokens_used.fetch_add(tokens, Ordering::Relaxed);
    }

    /// Whether the orchestrator asked us to wind down.
    pub fn is_cancelled(&self) -> bool {
        self.cancel_rx.borrow().is_some()
    }

    fn tool_call_count(&self) -> u32 {
        self.tool_calls.load(Ordering::Relaxed)
    }

    fn tokens(&self) -> u64 {
        self.tokens_used.load(Ordering::Relaxed)
    }
}

/// The seam where the embedding application provides its agent loop.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Execute `task`, using `ctx` for status, logs, and permissions.
    ///
    /// The returned result's `duration` and counters are filled in by the
    /// session where zero.
    async fn run(&self, task: &str, ctx: &ChildContext) -> Result<WorkerResult, ChildError>;
}

/// Child session: owns the connection and drives a runner to completion.
pub struct ChildSession;

impl ChildSession {
    /// Run a child to completion. This is the entry point for child/reader
    /// mode in the spawned process.
    pub async fn run(
        options: ChildOptions,
        runner: &dyn TaskRunner,
    ) -> Result<WorkerResult, ChildError> {
        let started = Instant::now();

        let mut ipc = IpcClient::connect(&options.socket_path, &options.child_id).await?;
        ipc.handshake().await?;
        info!(
            "Child {} connected to {:?}",
            options.child_id, options.socket_path
        );

        // A restarted child may be spawned without a task on argv; the
        // orchestrator re-issues it over the wire after the handshake.
        let task = if options.task.is_empty() {
            match ipc.wait_for_task(TASK_REISSUE_TIMEOUT).await {
                Some(task) => task,
                None => {
                    ipc.send_task_error("No task provided", Some("E_NO_TASK".to_string()))
                        .await?;
                    return Err(ChildError::NoTask);
                }
            }
        } else {
            options.task.clone()
        };

        let cancel_rx = ipc.cancel_watch();
        let ipc = Arc::new(Mutex::new(ipc));
        let ctx = ChildContext {
            ipc: Arc::clone(&ipc),
            auto_approve: options.auto_approve.clone(),
            tool_calls: AtomicU32::new(0),
            tokens_used: AtomicU64::new(0),
            cancel_rx: cancel_rx.clone(),
        };

        ctx.set_status(WorkerStatus::Thinking).await?;

        let mut cancel_rx = cancel_rx;
        let outcome = tokio::select! {
            outcome = runner.run(&task, &ctx) => outcome,
            _ = cancel_rx.changed() => Err(ChildError::Cancelled),
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(mut result) => {
                if result.duration_ms == 0 {
                    result.duration_ms = duration_ms;
                }
                if result.tool_call_count == 0 {
                    result.tool_call_count = ctx.tool_call_count();
                }
                if result.tokens_used == 0 {
                    result.tokens_used = ctx.tokens();
                }
                let mut ipc = ipc.lock().await;
                ipc.send_task_complete(result.clone()).await?;
                Ok(result)
            }
            Err(ChildError::Cancelled) => {
                // The orchestrator already moved us to cancelled; any
                // terminal message would be ignored.
                warn!("Child {} cancelled", options.child_id);
                Err(ChildError::Cancelled)
            }
            Err(e) => {
                let mut ipc = ipc.lock().await;
                let _ = ipc.send_task_error(e.to_string(), None).await;
                Err(e)
            }
        }
    }
}
