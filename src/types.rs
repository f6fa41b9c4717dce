// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Core types for the multi-agent orchestrator.
//!
//! This module defines the fundamental data structures for worker management,
//! workspace binding, and orchestrator configuration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
#[cfg(windows)]
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Worker Configuration
// ============================================================================

/// Configuration for a worker agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Unique identifier for this worker.
    pub id: String,
    /// Task description for the worker to execute.
    pub task: String,
    /// Branch name for this worker's isolated workspace. A random name is
    /// derived when not set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Optional model override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Optional provider override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Tools to auto-approve without consulting the operator.
    #[serde(default)]
    pub auto_approve: Vec<String>,
}

impl WorkerConfig {
    /// Create a new worker config with minimal required fields.
    pub fn new(id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task: task.into(),
            branch: None,
            model: None,
            provider: None,
            auto_approve: Vec::new(),
        }
    }

    /// Set the branch for this worker's workspace.
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Set the model for this worker.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the provider for this worker.
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Set auto-approved tools.
    pub fn with_auto_approve(mut self, tools: Vec<String>) -> Self {
        self.auto_approve = tools;
        self
    }

    /// Check if a tool should be auto-approved.
    pub fn should_auto_approve(&self, tool_name: &str) -> bool {
        self.auto_approve.iter().any(|t| t == tool_name)
    }
}

/// Configuration for a reader agent.
///
/// Readers run in the main repository directory with a fixed read-only tool
/// set; they have no workspace and do not count against the worker cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Unique identifier for this reader.
    pub id: String,
    /// Task description for the reader to execute.
    pub task: String,
    /// Optional model override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Optional provider override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl ReaderConfig {
    /// Create a new reader config.
    pub fn new(id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task: task.into(),
            model: None,
            provider: None,
        }
    }

    /// Set the model for this reader.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

// ============================================================================
// Worker Status
// ============================================================================

/// Lifecycle state of a worker or reader.
///
/// Terminal states (`Complete`, `Failed`, `Cancelled`) are absorbing: once a
/// worker reaches one, no inbound message changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Process spawned, handshake not yet received.
    Starting,
    /// Connected and waiting for work.
    Idle,
    /// Calling the model.
    Thinking,
    /// Executing a tool.
    ExecutingTool,
    /// Blocked on an operator permission decision.
    WaitingPermission,
    /// Finished successfully.
    Complete,
    /// Finished with an error.
    Failed,
    /// Cancelled by the operator.
    Cancelled,
}

impl WorkerStatus {
    /// Check if this status represents an active (not terminal) state.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Check if this status represents a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Thinking => "thinking",
            Self::ExecutingTool => "executing_tool",
            Self::WaitingPermission => "waiting_permission",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Distinguishes workers (workspace-isolated) from readers (read-only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildKind {
    Worker,
    Reader,
}

// ============================================================================
// Worker Result
// ============================================================================

/// Result from a completed worker or reader.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResult {
    /// Whether the task completed successfully.
    pub success: bool,
    /// Final response text from the agent.
    pub response: String,
    /// Number of tool calls made.
    pub tool_call_count: u32,
    /// Total tokens used.
    pub tokens_used: u64,
    /// Total duration in milliseconds.
    #[serde(rename = "duration")]
    pub duration_ms: u64,
    /// Files changed (if any).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_changed: Vec<String>,
}

impl WorkerResult {
    /// Create a successful result.
    pub fn success(response: impl Into<String>) -> Self {
        Self {
            success: true,
            response: response.into(),
            tool_call_count: 0,
            tokens_used: 0,
            duration_ms: 0,
            files_changed: Vec::new(),
        }
    }

    /// Create a failure result.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            response: error.into(),
            tool_call_count: 0,
            tokens_used: 0,
            duration_ms: 0,
            files_changed: Vec::new(),
        }
    }
}

// ============================================================================
// Workspace
// ============================================================================

/// An isolated working copy of the repository, bound to a per-worker branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    /// Absolute path to the workspace directory.
    pub path: PathBuf,
    /// Branch checked out in this workspace.
    pub branch: String,
    /// Base branch the workspace branch was created from.
    pub base: String,
}

// ============================================================================
// Worker Snapshot
// ============================================================================

/// Copy-on-read view of a worker's registry entry.
///
/// Queries return owned snapshots; the registry itself is never exposed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    /// Worker or reader id.
    pub id: String,
    /// Whether this is a worker or a reader.
    pub kind: ChildKind,
    /// The task prompt.
    pub task: String,
    /// Current lifecycle state.
    pub state: WorkerStatus,
    /// Workspace binding (workers only).
    pub workspace: Option<Workspace>,
    /// Number of restarts performed so far.
    pub restart_count: u32,
    /// When the worker was spawned.
    pub started_at: DateTime<Utc>,
    /// When the worker reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Accumulated token usage.
    pub tokens_used: u64,
    /// Last reported progress (0-100).
    pub progress: Option<u8>,
    /// Tool currently executing or awaiting permission.
    pub current_tool: Option<String>,
    /// Terminal error message, if failed.
    pub error: Option<String>,
    /// Terminal result, if complete.
    pub result: Option<WorkerResult>,
}

// ============================================================================
// Orchestrator Configuration
// ============================================================================

/// Configuration for the orchestrator.
///
/// The operator permission collaborator is not part of this struct; it is
/// installed on the orchestrator directly (see
/// [`crate::permissions::PermissionPrompt`]).
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Path to the IPC endpoint.
    pub socket_path: PathBuf,
    /// Hard cap on concurrent non-terminal workers (readers are not counted).
    pub max_workers: usize,
    /// Directory to create worktrees in. Defaults to a sibling of `repo_root`.
    pub worktree_dir: Option<PathBuf>,
    /// Prefix for worktree branch and directory names.
    pub worktree_prefix: String,
    /// Base branch for creating worker branches.
    pub base_branch: String,
    /// Whether to destroy all workspaces on `stop`.
    pub cleanup_on_exit: bool,
    /// Cap on restart attempts for transiently-failing children.
    pub max_restarts: u32,
    /// Absolute path to the hosting repository.
    pub repo_root: PathBuf,
    /// Absolute path to the executable to spawn for children. Callers resolve
    /// it; the orchestrator does not attempt path heuristics.
    pub child_executable: PathBuf,
}

impl OrchestratorConfig {
    /// Create configuration for a repository with stock defaults.
    pub fn for_repo(repo_root: impl Into<PathBuf>, child_executable: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: default_socket_path(),
            max_workers: 4,
            worktree_dir: None,
            worktree_prefix: "codi-".to_string(),
            base_branch: "main".to_string(),
            cleanup_on_exit: true,
            max_restarts: 2,
            repo_root: repo_root.into(),
            child_executable: child_executable.into(),
        }
    }
}

/// Get the default socket path.
///
/// Returns `<home>/.codi/orchestrator.sock` on Unix and a per-user named pipe
/// on Windows.
pub fn default_socket_path() -> PathBuf {
    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".codi")
            .join("orchestrator.sock")
    }

    #[cfg(windows)]
    {
        let home = dirs::home_dir().unwrap_or_else(std::env::temp_dir);
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        home.to_string_lossy().hash(&mut hasher);
        let hash = hasher.finish();
        PathBuf::from(format!(r"\\.\pipe\codi-orchestrator-{hash:x}"))
    }
}

/// Get the socket path for a specific project.
///
/// Returns `<project_root>/.codi/orchestrator.sock` on Unix and a named pipe
/// derived from the project path on Windows.
pub fn socket_path_for_project(project_root: &Path) -> PathBuf {
    #[cfg(not(windows))]
    {
        project_root.join(".codi").join("orchestrator.sock")
    }

    #[cfg(windows)]
    {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        project_root.to_string_lossy().hash(&mut hasher);
        let hash = hasher.finish();
        PathBuf::from(format!(r"\\.\pipe\codi-orchestrator-{hash:x}"))
    }
}

// ============================================================================
// Read-Only Tools (for reader agents)
// ============================================================================

/// Tools that are safe for read-only reader agents.
pub static READER_ALLOWED_TOOLS: &[&str] = &[
    "read_file",
    "list_directory",
    "glob",
    "grep",
    "find_symbol",
    "find_references",
    "get_dependency_graph",
    "analyze_impact",
];

/// Check if a tool is allowed for read-only agents.
pub fn is_reader_tool(tool_name: &str) -> bool {
    READER_ALLOWED_TOOLS.contains(&tool_name)
}

/// Get the set of reader-allowed tools.
pub fn reader_tools_set() -> HashSet<&'static str> {
    READER_ALLOWED_TOOLS.iter().copied().collect()
}
