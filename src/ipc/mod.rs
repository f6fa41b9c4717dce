// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Framed IPC between the orchestrator and its children.
//!
//! Newline-delimited JSON envelopes over a local stream socket (Unix domain
//! socket on POSIX, named pipe on Windows). One server, many client
//! connections, each identified by the `childId` sent in a mandatory
//! handshake.

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transport;

pub use client::{IpcClient, IpcClientError};
pub use error::{IpcError, IpcResult};
pub use protocol::{
    encode, decode, generate_message_id, now_millis,
    Cancel, ChildMessage, ConfirmationResult, Envelope, Handshake, LogLevel, LogMessage,
    OrchestratorMessage, PermissionRequest, PermissionResponse, StatusUpdate, TaskComplete,
    TaskError, TaskFailure, TaskIssue, ToolConfirmation, PROTOCOL_VERSION,
};
pub use server::{IpcServer, ServerEvent};
