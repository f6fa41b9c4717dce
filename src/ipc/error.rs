// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! IPC error types.

use std::io;
use thiserror::Error;

/// Errors that can occur in the server side of the IPC subsystem.
#[derive(Debug, Error)]
pub enum IpcError {
    /// Failed to bind to the socket/pipe.
    #[error("Failed to bind IPC endpoint: {0}")]
    BindFailed(String),

    /// The endpoint is already occupied by a live listener.
    #[error("IPC endpoint already in use: {0}")]
    AddressInUse(String),

    /// Child is not connected.
    #[error("Child not connected: {0}")]
    ChildNotConnected(String),

    /// Invalid message received.
    #[error("Invalid IPC message: {0}")]
    InvalidMessage(String),

    /// Server has not been started.
    #[error("Server not started")]
    NotStarted,

    /// General transport error.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl IpcError {
    /// Create an IPC error from an IO error with context.
    pub fn from_io_error(context: &str, err: io::Error) -> Self {
        IpcError::Transport(format!("{context}: {err}"))
    }
}

/// Result type for IPC operations.
pub type IpcResult<T> = Result<T, IpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipc_error_display() {
        let err = IpcError::BindFailed("permission denied".to_string());
        assert_eq!(
            err.to_string(),
            "Failed to bind IPC endpoint: permission denied"
        );
    }

    #[test]
    fn test_from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err = IpcError::from_io_error("opening socket", io_err);
        assert!(err.to_string().contains("opening socket"));
        assert!(err.to_string().contains("file not found"));
    }
}
