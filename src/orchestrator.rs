// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The orchestrator facade.
//!
//! Binds the IPC server, workspace manager, child supervisor, and permission
//! arbitrator together behind the public API (`spawn_worker`, `spawn_reader`,
//! `cancel_*`, `wait_all`, `stop`) and emits lifecycle events for a UI.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Orchestrator                            │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │  IPC Server (socket/pipe)                            │   │
//! │  │  ~/.codi/orchestrator.sock or \\.\pipe\...           │   │
//! │  └──────────────────┬───────────────────────────────────┘   │
//! │                     │ server events                          │
//! │  ┌──────────────────▼───────────────────────────────────┐   │
//! │  │  Dispatch core (single task, owns state mutation)    │   │
//! │  │   registry ── pending permissions ── event emission  │   │
//! │  └───────┬──────────────────────────────▲───────────────┘   │
//! │          │ queue                        │ decisions          │
//! │  ┌───────▼──────────┐      ┌───────────┴───────────────┐    │
//! │  │ PermissionBroker │      │ WorkspaceManager (trait)  │    │
//! │  │ (operator queue) │      │  └─ git worktrees         │    │
//! │  └──────────────────┘      └───────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!               │                │
//!               ▼                ▼
//!       ┌────────────┐    ┌────────────┐
//!       │  Worker 1  │    │  Reader 2  │
//!       │ (worktree) │    │ (repo root)│
//!       └────────────┘    └────────────┘
//! ```
//!
//! State mutation is confined to the dispatch core and the public API, both
//! serialized through a single registry lock that is never held across I/O.
//! Queries return owned snapshots.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::ipc::{
    ChildMessage, ConfirmationResult, IpcError, IpcServer, LogLevel, OrchestratorMessage,
    PermissionRequest, ServerEvent, StatusUpdate, ToolConfirmation,
};
use crate::permissions::{
    PendingPermission, PendingPermissions, PermissionBroker, PermissionDecision, PermissionPrompt,
    SessionApprovals,
};
use crate::supervisor::{self, ChildHandle, SpawnSpec};
use crate::types::{
    is_reader_tool, ChildKind, OrchestratorConfig, ReaderConfig, WorkerConfig, WorkerResult,
    WorkerSnapshot, WorkerStatus, Workspace, READER_ALLOWED_TOOLS,
};
use crate::workspace::{GitWorktreeManager, WorkspaceManager};

/// Grace period between the cancel message and SIGTERM.
const CANCEL_GRACE: Duration = Duration::from_secs(1);

/// How long `stop` waits for a child after SIGTERM before force-killing it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Capacity of the public event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Events
// ============================================================================

/// Lifecycle events emitted to subscribers, in per-worker arrival order.
///
/// Reader events use the same variants with `kind == ChildKind::Reader`.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// A worker or reader was spawned.
    WorkerStarted { id: String, kind: ChildKind },
    /// A worker or reader changed state.
    WorkerStatus {
        id: String,
        kind: ChildKind,
        state: WorkerStatus,
        current_tool: Option<String>,
    },
    /// A worker or reader finished successfully.
    WorkerCompleted {
        id: String,
        kind: ChildKind,
        result: WorkerResult,
    },
    /// A worker or reader failed.
    WorkerFailed {
        id: String,
        kind: ChildKind,
        error: String,
    },
    /// A child asked for permission; the operator prompt is in flight.
    PermissionRequest {
        id: String,
        request_id: String,
        confirmation: ToolConfirmation,
    },
    /// Every spawned worker has reached a terminal state.
    AllCompleted { results: Vec<WorkerResult> },
}

// ============================================================================
// Registry
// ============================================================================

/// Registry record for one worker or reader.
struct WorkerEntry {
    id: String,
    kind: ChildKind,
    task: String,
    model: Option<String>,
    provider: Option<String>,
    /// Mutable: `approve-always` decisions append to it.
    auto_approve: Vec<String>,
    workspace: Option<Workspace>,
    state: WorkerStatus,
    handle: Option<ChildHandle>,
    restart_count: u32,
    /// Whether a handshake ever completed; restarts require it.
    reached_idle: bool,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    tokens_used: u64,
    progress: Option<u8>,
    current_tool: Option<String>,
    error: Option<String>,
    result: Option<WorkerResult>,
    log_prefix: String,
}

impl WorkerEntry {
    fn is_active(&self) -> bool {
        self.state.is_active()
    }

    fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id.clone(),
            kind: self.kind,
            task: self.task.clone(),
            state: self.state,
            workspace: self.workspace.clone(),
            restart_count: self.restart_count,
            started_at: self.started_at,
            completed_at: self.completed_at,
            tokens_used: self.tokens_used,
            progress: self.progress,
            current_tool: self.current_tool.clone(),
            error: self.error.clone(),
            result: self.result.clone(),
        }
    }

    /// Result for `wait_all`: the reported result, or one synthesized from
    /// the terminal state.
    fn final_result(&self) -> WorkerResult {
        match (&self.result, &self.error, self.state) {
            (Some(result), _, _) => result.clone(),
            (None, Some(error), _) => WorkerResult::failure(error.clone()),
            (None, None, WorkerStatus::Cancelled) => WorkerResult::failure("Cancelled"),
            (None, None, _) => WorkerResult::failure("No result reported"),
        }
    }
}

struct Shared {
    config: OrchestratorConfig,
    server: Arc<IpcServer>,
    workspaces: Arc<dyn WorkspaceManager>,
    registry: RwLock<HashMap<String, WorkerEntry>>,
    pending: PendingPermissions,
    session_approvals: SessionApprovals,
    broker: PermissionBroker,
    event_tx: mpsc::Sender<OrchestratorEvent>,
    /// Bumped on every terminal transition; `wait_all` subscribes.
    terminal_tx: watch::Sender<u64>,
}

// ============================================================================
// Orchestrator
// ============================================================================

/// The multi-agent orchestrator.
pub struct Orchestrator {
    config: OrchestratorConfig,
    prompt: Option<Arc<dyn PermissionPrompt>>,
    workspaces: Arc<dyn WorkspaceManager>,
    shared: Option<Arc<Shared>>,
    event_rx: Option<mpsc::Receiver<OrchestratorEvent>>,
    dispatch: Option<JoinHandle<()>>,
    stopped: bool,
}

impl Orchestrator {
    /// Create an orchestrator with a git-worktree workspace manager built
    /// from the configuration.
    pub fn new(config: OrchestratorConfig) -> Self {
        let mut manager = GitWorktreeManager::new(&config.repo_root, config.base_branch.clone())
            .with_prefix(config.worktree_prefix.clone());
        if let Some(dir) = &config.worktree_dir {
            manager = manager.with_worktree_dir(dir.clone());
        }
        Self::with_workspace_manager(config, Arc::new(manager))
    }

    /// Create an orchestrator with a custom workspace manager.
    pub fn with_workspace_manager(
        config: OrchestratorConfig,
        workspaces: Arc<dyn WorkspaceManager>,
    ) -> Self {
        Self {
            config,
            prompt: None,
            workspaces,
            shared: None,
            event_rx: None,
            dispatch: None,
            stopped: false,
        }
    }

    /// Install the operator permission collaborator. Without one, every
    /// escalated permission request is denied.
    pub fn with_permission_prompt(mut self, prompt: Arc<dyn PermissionPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    /// Bind the IPC endpoint and start the dispatch core. Idempotent.
    pub async fn start(&mut self) -> OrchestratorResult<()> {
        if self.shared.is_some() {
            return Ok(());
        }

        let mut server = IpcServer::new(&self.config.socket_path);
        server.start().await.map_err(|e| match e {
            IpcError::AddressInUse(path) => OrchestratorError::SocketBindFailed {
                path: path.into(),
                reason: "endpoint occupied by a live listener".to_string(),
            },
            IpcError::BindFailed(reason) => OrchestratorError::SocketBindFailed {
                path: self.config.socket_path.clone(),
                reason,
            },
            other => OrchestratorError::Ipc(other),
        })?;

        let server_rx = match server.take_receiver() {
            Some(rx) => rx,
            None => {
                return Err(OrchestratorError::Ipc(IpcError::NotStarted));
            }
        };

        let pending = PendingPermissions::new();
        let (broker, decision_rx) = PermissionBroker::start(self.prompt.clone(), pending.clone());

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (terminal_tx, _) = watch::channel(0u64);

        let shared = Arc::new(Shared {
            config: self.config.clone(),
            server: Arc::new(server),
            workspaces: Arc::clone(&self.workspaces),
            registry: RwLock::new(HashMap::new()),
            pending,
            session_approvals: SessionApprovals::new(),
            broker,
            event_tx,
            terminal_tx,
        });

        let dispatch_shared = Arc::clone(&shared);
        self.dispatch = Some(tokio::spawn(async move {
            dispatch_loop(dispatch_shared, server_rx, decision_rx).await;
        }));

        self.shared = Some(shared);
        self.event_rx = Some(event_rx);
        info!("Orchestrator started on {:?}", self.config.socket_path);
        Ok(())
    }

    /// Take the event receiver. Can only be called once, after `start`.
    ///
    /// Subscribers should drain promptly; event dispatch shares the channel's
    /// bounded capacity.
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<OrchestratorEvent>> {
        self.event_rx.take()
    }

    fn shared(&self) -> OrchestratorResult<&Arc<Shared>> {
        self.shared
            .as_ref()
            .ok_or(OrchestratorError::Ipc(IpcError::NotStarted))
    }

    /// Spawn a new workspace-isolated worker. Returns its id.
    pub async fn spawn_worker(&self, config: WorkerConfig) -> OrchestratorResult<String> {
        let shared = self.shared()?;
        let id = config.id.clone();

        // Reserve a registry slot under the cap before any I/O.
        {
            let mut registry = shared.registry.write().await;
            if registry.contains_key(&id) {
                return Err(OrchestratorError::WorkerExists(id));
            }
            let active = registry
                .values()
                .filter(|e| e.kind == ChildKind::Worker && e.is_active())
                .count();
            if active >= shared.config.max_workers {
                return Err(OrchestratorError::CapacityExceeded {
                    active,
                    max: shared.config.max_workers,
                });
            }
            registry.insert(
                id.clone(),
                WorkerEntry {
                    id: id.clone(),
                    kind: ChildKind::Worker,
                    task: config.task.clone(),
                    model: config.model.clone(),
                    provider: config.provider.clone(),
                    auto_approve: config.auto_approve.clone(),
                    workspace: None,
                    state: WorkerStatus::Starting,
                    handle: None,
                    restart_count: 0,
                    reached_idle: false,
                    started_at: Utc::now(),
                    completed_at: None,
                    tokens_used: 0,
                    progress: None,
                    current_tool: None,
                    error: None,
                    result: None,
                    log_prefix: supervisor::short_id(&id),
                },
            );
        }

        // Workspace first: the child inherits it as its working directory.
        let workspace = match shared.workspaces.create(config.branch.as_deref()).await {
            Ok(ws) => ws,
            Err(e) => {
                let mut registry = shared.registry.write().await;
                registry.remove(&id);
                return Err(OrchestratorError::WorkspaceUnavailable(e));
            }
        };

        let log_prefix =
            supervisor::log_prefix_for(ChildKind::Worker, &id, Some(&workspace.branch));
        let spec = SpawnSpec {
            executable: shared.config.child_executable.clone(),
            socket_path: shared.config.socket_path.clone(),
            child_id: id.clone(),
            task: config.task.clone(),
            kind: ChildKind::Worker,
            model: config.model.clone(),
            provider: config.provider.clone(),
            auto_approve: config.auto_approve.clone(),
            working_dir: workspace.path.clone(),
            log_prefix: log_prefix.clone(),
        };

        match supervisor::spawn_child(&spec) {
            Ok(handle) => {
                let mut registry = shared.registry.write().await;
                if let Some(entry) = registry.get_mut(&id) {
                    entry.workspace = Some(workspace);
                    entry.handle = Some(handle);
                    entry.log_prefix = log_prefix;
                }
            }
            Err(e) => {
                {
                    let mut registry = shared.registry.write().await;
                    if let Some(entry) = registry.get_mut(&id) {
                        entry.workspace = Some(workspace);
                        entry.state = WorkerStatus::Failed;
                        entry.error = Some(e.to_string());
                        entry.completed_at = Some(Utc::now());
                    }
                }
                emit(
                    shared,
                    OrchestratorEvent::WorkerFailed {
                        id: id.clone(),
                        kind: ChildKind::Worker,
                        error: e.to_string(),
                    },
                )
                .await;
                shared.terminal_tx.send_modify(|g| *g += 1);
                return Err(e);
            }
        }

        emit(
            shared,
            OrchestratorEvent::WorkerStarted {
                id: id.clone(),
                kind: ChildKind::Worker,
            },
        )
        .await;
        Ok(id)
    }

    /// Spawn a reader: no workspace, fixed read-only tool set, exempt from
    /// the worker cap.
    pub async fn spawn_reader(&self, config: ReaderConfig) -> OrchestratorResult<String> {
        let shared = self.shared()?;
        let id = config.id.clone();
        let auto_approve: Vec<String> =
            READER_ALLOWED_TOOLS.iter().map(|t| t.to_string()).collect();
        let log_prefix = supervisor::log_prefix_for(ChildKind::Reader, &id, None);

        {
            let mut registry = shared.registry.write().await;
            if registry.contains_key(&id) {
                return Err(OrchestratorError::WorkerExists(id));
            }
            registry.insert(
                id.clone(),
                WorkerEntry {
                    id: id.clone(),
                    kind: ChildKind::Reader,
                    task: config.task.clone(),
                    model: config.model.clone(),
                    provider: config.provider.clone(),
                    auto_approve: auto_approve.clone(),
                    workspace: None,
                    state: WorkerStatus::Starting,
                    handle: None,
                    restart_count: 0,
                    reached_idle: false,
                    started_at: Utc::now(),
                    completed_at: None,
                    tokens_used: 0,
                    progress: None,
                    current_tool: None,
                    error: None,
                    result: None,
                    log_prefix: log_prefix.clone(),
                },
            );
        }

        let spec = SpawnSpec {
            executable: shared.config.child_executable.clone(),
            socket_path: shared.config.socket_path.clone(),
            child_id: id.clone(),
            task: config.task.clone(),
            kind: ChildKind::Reader,
            model: config.model.clone(),
            provider: config.provider.clone(),
            auto_approve,
            working_dir: shared.config.repo_root.clone(),
            log_prefix,
        };

        match supervisor::spawn_child(&spec) {
            Ok(handle) => {
                let mut registry = shared.registry.write().await;
                if let Some(entry) = registry.get_mut(&id) {
                    entry.handle = Some(handle);
                }
            }
            Err(e) => {
                {
                    let mut registry = shared.registry.write().await;
                    if let Some(entry) = registry.get_mut(&id) {
                        entry.state = WorkerStatus::Failed;
                        entry.error = Some(e.to_string());
                        entry.completed_at = Some(Utc::now());
                    }
                }
                emit(
                    shared,
                    OrchestratorEvent::WorkerFailed {
                        id: id.clone(),
                        kind: ChildKind::Reader,
                        error: e.to_string(),
                    },
                )
                .await;
                return Err(e);
            }
        }

        emit(
            shared,
            OrchestratorEvent::WorkerStarted {
                id: id.clone(),
                kind: ChildKind::Reader,
            },
        )
        .await;
        Ok(id)
    }

    /// Cancel a worker: cancel message, terminal state now, SIGTERM after a
    /// grace period.
    pub async fn cancel_worker(&self, id: &str) -> OrchestratorResult<()> {
        self.cancel(id, ChildKind::Worker).await
    }

    /// Cancel a reader.
    pub async fn cancel_reader(&self, id: &str) -> OrchestratorResult<()> {
        self.cancel(id, ChildKind::Reader).await
    }

    async fn cancel(&self, id: &str, kind: ChildKind) -> OrchestratorResult<()> {
        let shared = self.shared()?;
        {
            let registry = shared.registry.read().await;
            match registry.get(id) {
                Some(entry) if entry.kind == kind => {
                    if entry.state.is_terminal() {
                        return Ok(());
                    }
                }
                _ => return Err(OrchestratorError::WorkerNotFound(id.to_string())),
            }
        }
        cancel_child(shared, id, "Cancelled by operator").await;
        Ok(())
    }

    /// Snapshot of one worker or reader.
    pub async fn get_worker(&self, id: &str) -> Option<WorkerSnapshot> {
        let shared = self.shared.as_ref()?;
        let registry = shared.registry.read().await;
        registry.get(id).map(|e| e.snapshot())
    }

    /// Snapshots of all workers, in spawn order.
    pub async fn get_workers(&self) -> Vec<WorkerSnapshot> {
        self.snapshots(ChildKind::Worker, false).await
    }

    /// Snapshots of all readers, in spawn order.
    pub async fn get_readers(&self) -> Vec<WorkerSnapshot> {
        self.snapshots(ChildKind::Reader, false).await
    }

    /// Snapshots of workers not yet in a terminal state.
    pub async fn get_active_workers(&self) -> Vec<WorkerSnapshot> {
        self.snapshots(ChildKind::Worker, true).await
    }

    /// Snapshots of readers not yet in a terminal state.
    pub async fn get_active_readers(&self) -> Vec<WorkerSnapshot> {
        self.snapshots(ChildKind::Reader, true).await
    }

    /// Number of inbound `log` frames dropped under backpressure.
    pub fn dropped_log_count(&self) -> u64 {
        self.shared
            .as_ref()
            .map(|s| s.server.dropped_logs())
            .unwrap_or(0)
    }

    /// Number of non-terminal workers (readers excluded).
    pub async fn active_worker_count(&self) -> usize {
        match &self.shared {
            Some(shared) => {
                let registry = shared.registry.read().await;
                registry
                    .values()
                    .filter(|e| e.kind == ChildKind::Worker && e.is_active())
                    .count()
            }
            None => 0,
        }
    }

    async fn snapshots(&self, kind: ChildKind, active_only: bool) -> Vec<WorkerSnapshot> {
        let shared = match &self.shared {
            Some(shared) => shared,
            None => return Vec::new(),
        };
        let registry = shared.registry.read().await;
        let mut snapshots: Vec<WorkerSnapshot> = registry
            .values()
            .filter(|e| e.kind == kind && (!active_only || e.is_active()))
            .map(|e| e.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        snapshots
    }

    /// Resolve once every worker reaches a terminal state. Resolves
    /// immediately with an empty list when no worker was ever spawned.
    pub async fn wait_all(&self) -> Vec<WorkerResult> {
        let shared = match &self.shared {
            Some(shared) => shared,
            None => return Vec::new(),
        };
        let mut rx = shared.terminal_tx.subscribe();

        loop {
            if let Some(results) = collect_if_all_terminal(shared).await {
                return results;
            }
            if rx.changed().await.is_err() {
                return Vec::new();
            }
        }
    }

    /// Terminal shutdown: cancel everything, reap children, close the IPC
    /// endpoint, and (if configured) destroy all workspaces. Idempotent.
    pub async fn stop(&mut self) -> OrchestratorResult<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        let shared = match &self.shared {
            Some(shared) => Arc::clone(shared),
            None => return Ok(()),
        };
        info!("Stopping orchestrator");

        // Cancel every non-terminal child.
        let active: Vec<String> = {
            let registry = shared.registry.read().await;
            registry
                .values()
                .filter(|e| e.is_active())
                .map(|e| e.id.clone())
                .collect()
        };
        for id in &active {
            cancel_child(&shared, id, "Orchestrator shutting down").await;
        }

        if !active.is_empty() {
            tokio::time::sleep(CANCEL_GRACE).await;
        }

        // Escalate: SIGTERM, bounded wait, then force-kill survivors.
        let mut handles: Vec<(String, ChildHandle)> = {
            let mut registry = shared.registry.write().await;
            registry
                .values_mut()
                .filter_map(|e| e.handle.take().map(|h| (e.id.clone(), h)))
                .collect()
        };
        for (id, handle) in &mut handles {
            handle.terminate();
            if handle.wait_timeout(SHUTDOWN_GRACE).await.is_none() {
                warn!("Child {} survived SIGTERM, force killing", id);
                handle.kill().await;
                let _ = handle.wait_timeout(Duration::from_secs(1)).await;
            }
        }

        shared.server.stop().await?;

        if let Some(dispatch) = self.dispatch.take() {
            dispatch.abort();
        }

        if shared.config.cleanup_on_exit {
            if let Err(e) = shared.workspaces.cleanup().await {
                warn!("Workspace cleanup failed: {}", e);
            }
        }

        info!("Orchestrator stopped");
        Ok(())
    }
}

// ============================================================================
// Dispatch core
// ============================================================================

async fn dispatch_loop(
    shared: Arc<Shared>,
    mut server_rx: mpsc::Receiver<ServerEvent>,
    mut decision_rx: mpsc::Receiver<PermissionDecision>,
) {
    loop {
        tokio::select! {
            event = server_rx.recv() => match event {
                Some(event) => handle_server_event(&shared, event).await,
                None => break,
            },
            decision = decision_rx.recv() => match decision {
                Some(decision) => handle_decision(&shared, decision).await,
                None => break,
            },
        }
    }
    debug!("Dispatch core stopped");
}

async fn handle_server_event(shared: &Arc<Shared>, event: ServerEvent) {
    match event {
        ServerEvent::Connected { child_id, .. } => {
            handle_connected(shared, &child_id).await;
        }
        ServerEvent::Message { child_id, message } => match message {
            ChildMessage::StatusUpdate(update) => {
                handle_status_update(shared, &child_id, update).await;
            }
            ChildMessage::PermissionRequest(request) => {
                handle_permission_request(shared, &child_id, request).await;
            }
            ChildMessage::Log(log) => {
                handle_log(shared, &child_id, log.level, &log.content).await;
            }
            ChildMessage::TaskComplete(complete) => {
                handle_task_complete(shared, &child_id, complete.result).await;
            }
            ChildMessage::TaskError(task_error) => {
                handle_task_failed(shared, &child_id, task_error.error.message).await;
            }
            ChildMessage::Handshake(_) => {
                // The server already rejects duplicate handshakes.
            }
        },
        ServerEvent::Disconnected { child_id } => {
            handle_disconnect(shared, &child_id).await;
        }
    }
}

async fn handle_connected(shared: &Arc<Shared>, child_id: &str) {
    let (kind, reissue_task) = {
        let mut registry = shared.registry.write().await;
        match registry.get_mut(child_id) {
            None => {
                warn!("Handshake from unknown child {}, closing", child_id);
                drop(registry);
                shared.server.disconnect(child_id).await;
                return;
            }
            Some(entry) if entry.state.is_terminal() => {
                warn!("Handshake from terminated child {}, closing", child_id);
                drop(registry);
                shared.server.disconnect(child_id).await;
                return;
            }
            Some(entry) => {
                entry.state = WorkerStatus::Idle;
                entry.reached_idle = true;
                let reissue = if entry.restart_count > 0 {
                    Some(entry.task.clone())
                } else {
                    None
                };
                (entry.kind, reissue)
            }
        }
    };

    emit(
        shared,
        OrchestratorEvent::WorkerStatus {
            id: child_id.to_string(),
            kind,
            state: WorkerStatus::Idle,
            current_tool: None,
        },
    )
    .await;

    // A restarted child has no argv task; re-issue it over the wire.
    if let Some(task) = reissue_task {
        if let Err(e) = shared
            .server
            .send(child_id, &OrchestratorMessage::task(task))
            .await
        {
            warn!("Failed to re-issue task to {}: {}", child_id, e);
        }
    }
}

async fn handle_status_update(shared: &Arc<Shared>, child_id: &str, update: StatusUpdate) {
    let emit_event = {
        let mut registry = shared.registry.write().await;
        match registry.get_mut(child_id) {
            Some(entry) if entry.state.is_active() => {
                entry.state = update.status;
                entry.current_tool = update.current_tool.clone();
                if let Some(progress) = update.progress {
                    entry.progress = Some(progress);
                }
                if let Some(tokens) = update.tokens_used {
                    entry.tokens_used = tokens;
                }
                if update.status.is_terminal() {
                    entry.completed_at = Some(Utc::now());
                }
                Some((entry.kind, update.status, update.current_tool))
            }
            _ => None,
        }
    };

    if let Some((kind, state, current_tool)) = emit_event {
        emit(
            shared,
            OrchestratorEvent::WorkerStatus {
                id: child_id.to_string(),
                kind,
                state,
                current_tool,
            },
        )
        .await;
        if state.is_terminal() {
            finish_terminal(shared, child_id, kind).await;
        }
    }
}

async fn handle_permission_request(
    shared: &Arc<Shared>,
    child_id: &str,
    request: PermissionRequest,
) {
    let tool_name = request.confirmation.tool_name.clone();

    let routing = {
        let mut registry = shared.registry.write().await;
        match registry.get_mut(child_id) {
            Some(entry) if entry.state.is_active() => {
                entry.state = WorkerStatus::WaitingPermission;
                entry.current_tool = Some(tool_name.clone());
                let auto_approved = entry.auto_approve.iter().any(|t| t == &tool_name);
                Some((entry.kind, auto_approved))
            }
            _ => {
                debug!(
                    "Permission request {} from finished child {}, discarding",
                    request.request_id, child_id
                );
                None
            }
        }
    };

    let Some((kind, auto_approved)) = routing else {
        return;
    };

    emit(
        shared,
        OrchestratorEvent::WorkerStatus {
            id: child_id.to_string(),
            kind,
            state: WorkerStatus::WaitingPermission,
            current_tool: Some(tool_name.clone()),
        },
    )
    .await;
    emit(
        shared,
        OrchestratorEvent::PermissionRequest {
            id: child_id.to_string(),
            request_id: request.request_id.clone(),
            confirmation: request.confirmation.clone(),
        },
    )
    .await;

    match kind {
        ChildKind::Reader => {
            // Readers never reach the operator: allow-listed tools pass,
            // everything else is refused.
            let result = if is_reader_tool(&tool_name) {
                ConfirmationResult::Approve
            } else {
                warn!(
                    "Reader {} asked for non-read-only tool {}, denying",
                    child_id, tool_name
                );
                ConfirmationResult::Deny
            };
            respond(shared, child_id, &request.request_id, result).await;
        }
        ChildKind::Worker => {
            if auto_approved || shared.session_approvals.contains(&tool_name).await {
                respond(shared, child_id, &request.request_id, ConfirmationResult::Approve).await;
            } else {
                shared
                    .pending
                    .insert(&request.request_id, child_id)
                    .await;
                shared
                    .broker
                    .submit(PendingPermission {
                        request_id: request.request_id,
                        child_id: child_id.to_string(),
                        confirmation: request.confirmation,
                    })
                    .await;
            }
        }
    }
}

/// Send a permission response and restore the worker to `thinking`.
async fn respond(shared: &Arc<Shared>, child_id: &str, request_id: &str, result: ConfirmationResult) {
    if let Err(e) = shared
        .server
        .send(
            child_id,
            &OrchestratorMessage::permission_response(request_id, result),
        )
        .await
    {
        warn!("Failed to send permission response to {}: {}", child_id, e);
        return;
    }

    let kind = {
        let mut registry = shared.registry.write().await;
        match registry.get_mut(child_id) {
            Some(entry) if entry.state == WorkerStatus::WaitingPermission => {
                entry.state = WorkerStatus::Thinking;
                entry.current_tool = None;
                Some(entry.kind)
            }
            _ => None,
        }
    };

    if let Some(kind) = kind {
        emit(
            shared,
            OrchestratorEvent::WorkerStatus {
                id: child_id.to_string(),
                kind,
                state: WorkerStatus::Thinking,
                current_tool: None,
            },
        )
        .await;
    }
}

async fn handle_decision(shared: &Arc<Shared>, decision: PermissionDecision) {
    // The child may have finished or disconnected while the operator decided;
    // the late decision is discarded.
    if !shared.pending.remove(&decision.request_id).await {
        debug!("Discarding decision for dropped request {}", decision.request_id);
        return;
    }

    match decision.result {
        ConfirmationResult::ApproveAlways => {
            let mut registry = shared.registry.write().await;
            if let Some(entry) = registry.get_mut(&decision.child_id) {
                if !entry.auto_approve.contains(&decision.tool_name) {
                    entry.auto_approve.push(decision.tool_name.clone());
                }
            }
        }
        ConfirmationResult::ApproveSession => {
            shared.session_approvals.insert(&decision.tool_name).await;
        }
        ConfirmationResult::Approve | ConfirmationResult::Deny => {}
    }

    respond(shared, &decision.child_id, &decision.request_id, decision.result).await;
}

async fn handle_log(shared: &Arc<Shared>, child_id: &str, level: LogLevel, content: &str) {
    let prefix = {
        let registry = shared.registry.read().await;
        registry
            .get(child_id)
            .map(|e| e.log_prefix.clone())
            .unwrap_or_else(|| child_id.to_string())
    };

    match level {
        LogLevel::Error => error!("[{}] {}", prefix, content),
        LogLevel::Warn => warn!("[{}] {}", prefix, content),
        LogLevel::Info => info!("[{}] {}", prefix, content),
        LogLevel::Text | LogLevel::Tool => debug!("[{}] {}", prefix, content),
    }
}

async fn handle_task_complete(shared: &Arc<Shared>, child_id: &str, result: WorkerResult) {
    let emit_event = {
        let mut registry = shared.registry.write().await;
        match registry.get_mut(child_id) {
            Some(entry) if entry.state.is_active() => {
                entry.state = WorkerStatus::Complete;
                entry.result = Some(result.clone());
                entry.tokens_used = result.tokens_used;
                entry.current_tool = None;
                entry.completed_at = Some(Utc::now());
                Some(entry.kind)
            }
            _ => None,
        }
    };

    if let Some(kind) = emit_event {
        emit(
            shared,
            OrchestratorEvent::WorkerCompleted {
                id: child_id.to_string(),
                kind,
                result,
            },
        )
        .await;
        finish_terminal(shared, child_id, kind).await;
    }
}

async fn handle_task_failed(shared: &Arc<Shared>, child_id: &str, message: String) {
    let emit_event = {
        let mut registry = shared.registry.write().await;
        match registry.get_mut(child_id) {
            Some(entry) if entry.state.is_active() => {
                entry.state = WorkerStatus::Failed;
                entry.error = Some(message.clone());
                entry.current_tool = None;
                entry.completed_at = Some(Utc::now());
                Some(entry.kind)
            }
            _ => None,
        }
    };

    if let Some(kind) = emit_event {
        emit(
            shared,
            OrchestratorEvent::WorkerFailed {
                id: child_id.to_string(),
                kind,
                error: message,
            },
        )
        .await;
        finish_terminal(shared, child_id, kind).await;
    }
}

async fn handle_disconnect(shared: &Arc<Shared>, child_id: &str) {
    // Drop any prompts the child was waiting on.
    shared.pending.remove_for_child(child_id).await;

    enum Outcome {
        Ignore,
        Restart {
            kind: ChildKind,
            spec: SpawnSpec,
            restart_count: u32,
            old_handle: Option<ChildHandle>,
        },
        Fail {
            kind: ChildKind,
            old_handle: Option<ChildHandle>,
        },
    }

    let outcome = {
        let mut registry = shared.registry.write().await;
        match registry.get_mut(child_id) {
            None => Outcome::Ignore,
            Some(entry) if entry.state.is_terminal() => {
                // Normal exit after task_complete/task_error; just reap.
                if let Some(mut handle) = entry.handle.take() {
                    tokio::spawn(async move {
                        let _ = handle.wait_timeout(Duration::from_secs(2)).await;
                    });
                }
                Outcome::Ignore
            }
            Some(entry) => {
                if entry.reached_idle && entry.restart_count < shared.config.max_restarts {
                    entry.restart_count += 1;
                    entry.state = WorkerStatus::Starting;
                    entry.current_tool = None;
                    let working_dir = entry
                        .workspace
                        .as_ref()
                        .map(|w| w.path.clone())
                        .unwrap_or_else(|| shared.config.repo_root.clone());
                    Outcome::Restart {
                        kind: entry.kind,
                        spec: SpawnSpec {
                            executable: shared.config.child_executable.clone(),
                            socket_path: shared.config.socket_path.clone(),
                            child_id: entry.id.clone(),
                            task: entry.task.clone(),
                            kind: entry.kind,
                            model: entry.model.clone(),
                            provider: entry.provider.clone(),
                            auto_approve: entry.auto_approve.clone(),
                            working_dir,
                            log_prefix: entry.log_prefix.clone(),
                        },
                        restart_count: entry.restart_count,
                        old_handle: entry.handle.take(),
                    }
                } else {
                    entry.state = WorkerStatus::Failed;
                    entry.error = Some("Worker disconnected unexpectedly".to_string());
                    entry.current_tool = None;
                    entry.completed_at = Some(Utc::now());
                    Outcome::Fail {
                        kind: entry.kind,
                        old_handle: entry.handle.take(),
                    }
                }
            }
        }
    };

    match outcome {
        Outcome::Ignore => {}
        Outcome::Restart {
            kind,
            spec,
            restart_count,
            old_handle,
        } => {
            reap(old_handle);
            info!(
                "Child {} disconnected, restarting (attempt {}/{})",
                child_id, restart_count, shared.config.max_restarts
            );
            emit(
                shared,
                OrchestratorEvent::WorkerStatus {
                    id: child_id.to_string(),
                    kind,
                    state: WorkerStatus::Starting,
                    current_tool: None,
                },
            )
            .await;

            match supervisor::spawn_child(&spec) {
                Ok(handle) => {
                    let mut registry = shared.registry.write().await;
                    match registry.get_mut(child_id) {
                        // Re-check: a cancel may have landed while spawning.
                        Some(entry) if entry.state == WorkerStatus::Starting => {
                            entry.handle = Some(handle);
                        }
                        _ => {
                            let mut handle = handle;
                            tokio::spawn(async move {
                                handle.kill().await;
                            });
                        }
                    }
                }
                Err(e) => {
                    error!("Restart of {} failed: {}", child_id, e);
                    handle_task_failed(shared, child_id, e.to_string()).await;
                }
            }
        }
        Outcome::Fail { kind, old_handle } => {
            reap(old_handle);
            emit(
                shared,
                OrchestratorEvent::WorkerFailed {
                    id: child_id.to_string(),
                    kind,
                    error: "Worker disconnected unexpectedly".to_string(),
                },
            )
            .await;
            finish_terminal(shared, child_id, kind).await;
        }
    }
}

/// Cancel one child: cancel message, immediate terminal state, delayed
/// SIGTERM. Used by `cancel_worker`/`cancel_reader` and `stop`.
async fn cancel_child(shared: &Arc<Shared>, id: &str, reason: &str) {
    if let Err(e) = shared
        .server
        .send(id, &OrchestratorMessage::cancel(reason))
        .await
    {
        debug!("Cancel message to {} not delivered: {}", id, e);
    }

    let kind = {
        let mut registry = shared.registry.write().await;
        match registry.get_mut(id) {
            Some(entry) if entry.state.is_active() => {
                entry.state = WorkerStatus::Cancelled;
                entry.current_tool = None;
                entry.completed_at = Some(Utc::now());
                Some(entry.kind)
            }
            _ => None,
        }
    };

    let Some(kind) = kind else { return };

    emit(
        shared,
        OrchestratorEvent::WorkerStatus {
            id: id.to_string(),
            kind,
            state: WorkerStatus::Cancelled,
            current_tool: None,
        },
    )
    .await;
    finish_terminal(shared, id, kind).await;

    // SIGTERM after the grace period; `stop` force-kills stragglers.
    let shared = Arc::clone(shared);
    let id = id.to_string();
    tokio::spawn(async move {
        tokio::time::sleep(CANCEL_GRACE).await;
        let mut registry = shared.registry.write().await;
        if let Some(entry) = registry.get_mut(&id) {
            if let Some(handle) = entry.handle.as_mut() {
                handle.terminate();
            }
        }
    });
}

/// Bookkeeping common to every terminal transition.
async fn finish_terminal(shared: &Arc<Shared>, child_id: &str, kind: ChildKind) {
    shared.pending.remove_for_child(child_id).await;
    shared.terminal_tx.send_modify(|g| *g += 1);

    // Readers do not participate in wait-all semantics.
    if kind == ChildKind::Worker {
        if let Some(results) = collect_if_all_terminal(shared).await {
            if !results.is_empty() {
                emit(shared, OrchestratorEvent::AllCompleted { results }).await;
            }
        }
    }
}

/// When every spawned worker is terminal, their results in spawn order.
async fn collect_if_all_terminal(shared: &Arc<Shared>) -> Option<Vec<WorkerResult>> {
    let registry = shared.registry.read().await;
    let mut workers: Vec<&WorkerEntry> = registry
        .values()
        .filter(|e| e.kind == ChildKind::Worker)
        .collect();
    if workers.is_empty() {
        return Some(Vec::new());
    }
    if !workers.iter().all(|e| e.state.is_terminal()) {
        return None;
    }
    workers.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
    Some(workers.iter().map(|e| e.final_result()).collect())
}

fn reap(handle: Option<ChildHandle>) {
    if let Some(mut handle) = handle {
        tokio::spawn(async move {
            let _ = handle.wait_timeout(Duration::from_secs(2)).await;
        });
    }
}

async fn emit(shared: &Arc<Shared>, event: OrchestratorEvent) {
    if shared.event_tx.send(event).await.is_err() {
        // Subscriber gone; events are best-effort from here on.
        debug!("Event receiver dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::WorkspaceError;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// Workspace manager backed by plain temp directories, for tests that
    /// exercise orchestration rather than git.
    struct TempWorkspaces {
        root: PathBuf,
        counter: AtomicU32,
        created: std::sync::Mutex<Vec<Workspace>>,
    }

    impl TempWorkspaces {
        fn new(root: PathBuf) -> Self {
            Self {
                root,
                counter: AtomicU32::new(0),
                created: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl WorkspaceManager for TempWorkspaces {
        async fn create(&self, branch: Option<&str>) -> Result<Workspace, WorkspaceError> {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            let branch = format!("codi-{}", branch.map(str::to_string).unwrap_or(n.to_string()));
            let path = self.root.join(&branch);
            std::fs::create_dir_all(&path)?;
            let ws = Workspace {
                path,
                branch,
                base: "main".to_string(),
            };
            self.created
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(ws.clone());
            Ok(ws)
        }

        async fn destroy(&self, workspace: &Workspace) -> Result<(), WorkspaceError> {
            if workspace.path.exists() {
                std::fs::remove_dir_all(&workspace.path)?;
            }
            Ok(())
        }

        async fn cleanup(&self) -> Result<(), WorkspaceError> {
            let all = self
                .created
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            for ws in all {
                self.destroy(&ws).await?;
            }
            Ok(())
        }

        async fn list(&self) -> Vec<Workspace> {
            self.created
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        }
    }

    fn sleeper() -> PathBuf {
        for p in ["/bin/sleep", "/usr/bin/sleep"] {
            if std::path::Path::new(p).exists() {
                return PathBuf::from(p);
            }
        }
        PathBuf::from("sleep")
    }

    async fn test_orchestrator(dir: &TempDir, max_workers: usize) -> Orchestrator {
        let config = OrchestratorConfig {
            socket_path: dir.path().join("orc.sock"),
            max_workers,
            worktree_dir: Some(dir.path().join("trees")),
            worktree_prefix: "codi-".to_string(),
            base_branch: "main".to_string(),
            cleanup_on_exit: true,
            max_restarts: 0,
            repo_root: dir.path().to_path_buf(),
            // `sleep` never handshakes, so spawned entries stay in Starting;
            // that is all these tests need.
            child_executable: sleeper(),
        };
        let workspaces = Arc::new(TempWorkspaces::new(dir.path().join("trees")));
        let mut orchestrator = Orchestrator::with_workspace_manager(config, workspaces);
        orchestrator.start().await.expect("start failed");
        orchestrator
    }

    #[tokio::test]
    async fn test_spawn_before_start_fails() {
        let dir = TempDir::new().unwrap();
        let config = OrchestratorConfig {
            socket_path: dir.path().join("orc.sock"),
            max_workers: 1,
            worktree_dir: None,
            worktree_prefix: "codi-".to_string(),
            base_branch: "main".to_string(),
            cleanup_on_exit: false,
            max_restarts: 0,
            repo_root: dir.path().to_path_buf(),
            child_executable: sleeper(),
        };
        let orchestrator = Orchestrator::with_workspace_manager(
            config,
            Arc::new(TempWorkspaces::new(dir.path().to_path_buf())),
        );

        let result = orchestrator.spawn_worker(WorkerConfig::new("w1", "task")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_capacity_exceeded() {
        let dir = TempDir::new().unwrap();
        let mut orchestrator = test_orchestrator(&dir, 1).await;

        orchestrator
            .spawn_worker(WorkerConfig::new("w1", "task one"))
            .await
            .expect("first spawn failed");

        let err = orchestrator
            .spawn_worker(WorkerConfig::new("w2", "task two"))
            .await
            .expect_err("second spawn should hit the cap");
        assert!(matches!(err, OrchestratorError::CapacityExceeded { active: 1, max: 1 }));

        // Only w1 is active; w2 left no trace.
        let active = orchestrator.get_active_workers().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "w1");
        assert!(orchestrator.get_worker("w2").await.is_none());

        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_readers_exempt_from_cap() {
        let dir = TempDir::new().unwrap();
        let mut orchestrator = test_orchestrator(&dir, 1).await;

        orchestrator
            .spawn_worker(WorkerConfig::new("w1", "task"))
            .await
            .unwrap();
        orchestrator
            .spawn_reader(ReaderConfig::new("r1", "survey the code"))
            .await
            .expect("reader should not count against the cap");
        orchestrator
            .spawn_reader(ReaderConfig::new("r2", "survey more code"))
            .await
            .expect("second reader should also fit");

        assert_eq!(orchestrator.active_worker_count().await, 1);
        assert_eq!(orchestrator.get_readers().await.len(), 2);

        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let dir = TempDir::new().unwrap();
        let mut orchestrator = test_orchestrator(&dir, 4).await;

        orchestrator
            .spawn_worker(WorkerConfig::new("w1", "task"))
            .await
            .unwrap();
        let err = orchestrator
            .spawn_worker(WorkerConfig::new("w1", "task again"))
            .await
            .expect_err("duplicate id should be rejected");
        assert!(matches!(err, OrchestratorError::WorkerExists(_)));

        // Ids are unique across workers and readers.
        let err = orchestrator
            .spawn_reader(ReaderConfig::new("w1", "read"))
            .await
            .expect_err("reader with a worker's id should be rejected");
        assert!(matches!(err, OrchestratorError::WorkerExists(_)));

        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failed_marks_worker_failed() {
        let dir = TempDir::new().unwrap();
        let config = OrchestratorConfig {
            socket_path: dir.path().join("orc.sock"),
            max_workers: 4,
            worktree_dir: Some(dir.path().join("trees")),
            worktree_prefix: "codi-".to_string(),
            base_branch: "main".to_string(),
            cleanup_on_exit: true,
            max_restarts: 0,
            repo_root: dir.path().to_path_buf(),
            child_executable: PathBuf::from("/nonexistent/binary"),
        };
        let workspaces = Arc::new(TempWorkspaces::new(dir.path().join("trees")));
        let mut orchestrator = Orchestrator::with_workspace_manager(config, workspaces);
        orchestrator.start().await.unwrap();

        let err = orchestrator
            .spawn_worker(WorkerConfig::new("w1", "task"))
            .await
            .expect_err("spawn should fail");
        assert!(matches!(err, OrchestratorError::SpawnFailed(_)));

        let snapshot = orchestrator.get_worker("w1").await.expect("entry should exist");
        assert_eq!(snapshot.state, WorkerStatus::Failed);
        assert!(snapshot.error.is_some());

        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_unknown_worker() {
        let dir = TempDir::new().unwrap();
        let mut orchestrator = test_orchestrator(&dir, 1).await;

        let err = orchestrator.cancel_worker("ghost").await;
        assert!(matches!(err, Err(OrchestratorError::WorkerNotFound(_))));

        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_transitions_and_is_absorbing() {
        let dir = TempDir::new().unwrap();
        let mut orchestrator = test_orchestrator(&dir, 1).await;

        orchestrator
            .spawn_worker(WorkerConfig::new("w1", "task"))
            .await
            .unwrap();
        orchestrator.cancel_worker("w1").await.unwrap();

        let snapshot = orchestrator.get_worker("w1").await.unwrap();
        assert_eq!(snapshot.state, WorkerStatus::Cancelled);
        assert!(snapshot.completed_at.is_some());

        // Cancelling again is a no-op, not an error.
        orchestrator.cancel_worker("w1").await.unwrap();
        assert_eq!(orchestrator.active_worker_count().await, 0);

        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_all_empty() {
        let dir = TempDir::new().unwrap();
        let mut orchestrator = test_orchestrator(&dir, 1).await;

        let results = orchestrator.wait_all().await;
        assert!(results.is_empty());

        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_all_resolves_after_cancel() {
        let dir = TempDir::new().unwrap();
        let mut orchestrator = test_orchestrator(&dir, 2).await;

        orchestrator
            .spawn_worker(WorkerConfig::new("w1", "task"))
            .await
            .unwrap();
        orchestrator.cancel_worker("w1").await.unwrap();

        let results = orchestrator.wait_all().await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);

        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let mut orchestrator = test_orchestrator(&dir, 2).await;

        orchestrator
            .spawn_worker(WorkerConfig::new("w1", "task"))
            .await
            .unwrap();
        let workspace = orchestrator
            .get_worker("w1")
            .await
            .unwrap()
            .workspace
            .expect("worker should have a workspace");
        assert!(workspace.path.exists());

        orchestrator.stop().await.unwrap();
        orchestrator.stop().await.unwrap();

        assert!(orchestrator.get_active_workers().await.is_empty());
        assert!(!workspace.path.exists(), "cleanup_on_exit should remove workspaces");
        #[cfg(unix)]
        assert!(!dir.path().join("orc.sock").exists());
    }

    #[tokio::test]
    async fn test_snapshots_are_copies() {
        let dir = TempDir::new().unwrap();
        let mut orchestrator = test_orchestrator(&dir, 2).await;

        orchestrator
            .spawn_worker(WorkerConfig::new("w1", "task"))
            .await
            .unwrap();

        let mut snapshot = orchestrator.get_worker("w1").await.unwrap();
        snapshot.state = WorkerStatus::Failed;

        // Mutating the snapshot does not touch the registry.
        let fresh = orchestrator.get_worker("w1").await.unwrap();
        assert_eq!(fresh.state, WorkerStatus::Starting);

        orchestrator.stop().await.unwrap();
    }
}
