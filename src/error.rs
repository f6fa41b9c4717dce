// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the orchestrator.
//!
//! Strongly-typed errors per subsystem using `thiserror`; `anyhow` is used
//! only at the binary boundary. Errors that map to worker lifecycle (operator
//! denial, unexpected disconnect) are reflected as state transitions and
//! events rather than caller-visible `Err`s.

use std::path::PathBuf;

use thiserror::Error;

use crate::ipc::IpcError;
use crate::workspace::WorkspaceError;

/// Errors surfaced by the orchestrator's public API.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Spawn refused because the worker cap is reached.
    #[error("Worker capacity exceeded: {active} active of {max} allowed")]
    CapacityExceeded { active: usize, max: usize },

    /// A worker or reader with this id already exists.
    #[error("Worker already exists: {0}")]
    WorkerExists(String),

    /// No worker or reader with this id.
    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    /// Workspace creation failed.
    #[error("Workspace unavailable: {0}")]
    WorkspaceUnavailable(#[from] WorkspaceError),

    /// Child process could not be launched.
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),

    /// The IPC endpoint could not be bound.
    #[error("Failed to bind socket at {path}: {reason}")]
    SocketBindFailed { path: PathBuf, reason: String },

    /// Malformed frame, missing or duplicate handshake.
    #[error("Protocol violation from {child_id}: {reason}")]
    ProtocolViolation { child_id: String, reason: String },

    /// IPC transport error.
    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    /// Underlying IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for orchestrator operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
