// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! IPC protocol for orchestrator-child communication.
//!
//! Newline-delimited JSON over a platform-specific stream transport. Every
//! frame is an envelope `{ id, timestamp, type, payload }` where `timestamp`
//! is milliseconds since the UNIX epoch and `payload` is the type-specific
//! object. Unknown `type` tags fail to decode and are treated as protocol
//! violations by the receiving side.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{WorkerResult, WorkerStatus};

/// Protocol version sent in every handshake. Children speaking a different
/// version are rejected.
pub const PROTOCOL_VERSION: u32 = 1;

// ============================================================================
// Message Envelope
// ============================================================================

/// Generate a unique message ID.
pub fn generate_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current time in milliseconds since the UNIX epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Wire envelope carrying a typed message body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<M> {
    /// Unique message ID generated by the sender.
    pub id: String,
    /// Milliseconds since the UNIX epoch.
    pub timestamp: i64,
    /// Tagged message body, serialized as `type` + `payload`.
    #[serde(flatten)]
    pub body: M,
}

impl<M> Envelope<M> {
    /// Wrap a message body in a fresh envelope.
    pub fn new(body: M) -> Self {
        Self {
            id: generate_message_id(),
            timestamp: now_millis(),
            body,
        }
    }
}

// ============================================================================
// Child -> Orchestrator Messages
// ============================================================================

/// Messages sent from a child to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ChildMessage {
    /// Mandatory first message on any new connection.
    Handshake(Handshake),
    /// Progress/state report.
    StatusUpdate(StatusUpdate),
    /// Request operator approval for a tool operation.
    PermissionRequest(PermissionRequest),
    /// Log output.
    Log(LogMessage),
    /// Task finished successfully.
    TaskComplete(TaskComplete),
    /// Task failed.
    TaskError(TaskError),
}

/// Handshake payload identifying the child.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    /// Identity the orchestrator routes by.
    pub child_id: String,
    /// Protocol version the child speaks.
    pub protocol_version: u32,
    /// Capability strings, reserved for protocol extension.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl Handshake {
    /// Create a handshake for the current protocol version.
    pub fn new(child_id: impl Into<String>) -> Self {
        Self {
            child_id: child_id.into(),
            protocol_version: PROTOCOL_VERSION,
            capabilities: Vec::new(),
        }
    }
}

/// Status update payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    /// Current lifecycle state.
    pub status: WorkerStatus,
    /// Tool currently executing or awaiting permission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_tool: Option<String>,
    /// Progress percentage (0-100).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    /// Cumulative token usage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
}

impl StatusUpdate {
    /// Create a bare status update.
    pub fn new(status: WorkerStatus) -> Self {
        Self {
            status,
            current_tool: None,
            progress: None,
            tokens_used: None,
        }
    }

    /// Attach the currently executing tool.
    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.current_tool = Some(tool.into());
        self
    }
}

/// Tool-call confirmation payload shown to the operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfirmation {
    /// Name of the tool.
    pub tool_name: String,
    /// Tool input arguments (arbitrary JSON; the operator UI renders it).
    pub input: serde_json::Value,
    /// Human-readable description of the operation.
    pub description: String,
}

/// Permission request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    /// Opaque ID for correlating the response.
    pub request_id: String,
    /// What the child wants to do.
    pub confirmation: ToolConfirmation,
}

/// Log levels for child output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Regular text output.
    Text,
    /// Tool execution output.
    Tool,
    /// Informational message.
    Info,
    /// Warning message.
    Warn,
    /// Error message.
    Error,
}

/// Log payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogMessage {
    /// Severity of the line.
    pub level: LogLevel,
    /// The line itself.
    pub content: String,
}

/// Task completion payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskComplete {
    /// Final result.
    pub result: WorkerResult,
}

/// Task failure payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskError {
    /// Error details.
    pub error: TaskFailure,
}

/// Error details inside a `task_error` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailure {
    /// Error message.
    pub message: String,
    /// Machine-readable code, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ChildMessage {
    /// Create a handshake message.
    pub fn handshake(child_id: impl Into<String>) -> Self {
        Self::Handshake(Handshake::new(child_id))
    }

    /// Create a status update message.
    pub fn status(update: StatusUpdate) -> Self {
        Self::StatusUpdate(update)
    }

    /// Create a permission request with a fresh request ID.
    pub fn permission_request(confirmation: ToolConfirmation) -> Self {
        Self::PermissionRequest(PermissionRequest {
            request_id: generate_message_id(),
            confirmation,
        })
    }

    /// Create a log message.
    pub fn log(level: LogLevel, content: impl Into<String>) -> Self {
        Self::Log(LogMessage {
            level,
            content: content.into(),
        })
    }

    /// Create a task complete message.
    pub fn task_complete(result: WorkerResult) -> Self {
        Self::TaskComplete(TaskComplete { result })
    }

    /// Create a task error message.
    pub fn task_error(message: impl Into<String>, code: Option<String>) -> Self {
        Self::TaskError(TaskError {
            error: TaskFailure {
                message: message.into(),
                code,
            },
        })
    }

    /// Check if this is a handshake message.
    pub fn is_handshake(&self) -> bool {
        matches!(self, Self::Handshake(_))
    }

    /// Check if this is a terminal message (complete or error).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TaskComplete(_) | Self::TaskError(_))
    }

    /// Check if this is a log message.
    ///
    /// Log frames are the one message class the server may drop under
    /// backpressure.
    pub fn is_log(&self) -> bool {
        matches!(self, Self::Log(_))
    }
}

// ============================================================================
// Orchestrator -> Child Messages
// ============================================================================

/// Messages sent from the orchestrator to a child.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OrchestratorMessage {
    /// Decision for a pending permission request.
    PermissionResponse(PermissionResponse),
    /// Ask the child to wind down.
    Cancel(Cancel),
    /// Task (re-)issue after a restart handshake.
    Task(TaskIssue),
}

/// Operator decision for a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfirmationResult {
    /// Allow this operation.
    Approve,
    /// Refuse this operation; the tool call fails in-child.
    Deny,
    /// Allow and stop asking for this tool on this worker.
    ApproveAlways,
    /// Allow and stop asking for this tool for the whole session.
    ApproveSession,
}

impl ConfirmationResult {
    /// Whether the decision permits the operation.
    pub fn is_approved(&self) -> bool {
        !matches!(self, Self::Deny)
    }
}

/// Permission response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionResponse {
    /// Request ID being responded to.
    pub request_id: String,
    /// The decision.
    pub result: ConfirmationResult,
}

/// Cancel payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cancel {
    /// Why the child is being cancelled.
    pub reason: String,
}

/// Task payload re-issued to a restarted child.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskIssue {
    /// The task prompt.
    pub task: String,
}

impl OrchestratorMessage {
    /// Create a permission response.
    pub fn permission_response(request_id: impl Into<String>, result: ConfirmationResult) -> Self {
        Self::PermissionResponse(PermissionResponse {
            request_id: request_id.into(),
            result,
        })
    }

    /// Create a cancel message.
    pub fn cancel(reason: impl Into<String>) -> Self {
        Self::Cancel(Cancel {
            reason: reason.into(),
        })
    }

    /// Create a task re-issue message.
    pub fn task(task: impl Into<String>) -> Self {
        Self::Task(TaskIssue { task: task.into() })
    }
}

// ============================================================================
// Serialization
// ============================================================================

/// Encode a message into a newline-terminated JSON frame.
pub fn encode<T: Serialize>(msg: &T) -> Result<String, serde_json::Error> {
    let mut json = serde_json::to_string(msg)?;
    json.push('\n');
    Ok(json)
}

/// Decode a message from a single JSON frame.
pub fn decode<T: DeserializeOwned>(json: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(json.trim())
}
