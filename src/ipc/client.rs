// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! IPC client for child processes.
//!
//! The client dials the orchestrator's endpoint, sends the mandatory
//! handshake, and handles bidirectional traffic: permission round-trips,
//! status/log/terminal reports, inbound cancel and task re-issue.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, error, info, warn};

use super::protocol::{
    decode, encode, ChildMessage, ConfirmationResult, Envelope, LogLevel, OrchestratorMessage,
    StatusUpdate, ToolConfirmation,
};
use super::transport::{self, IpcStream};
use crate::types::WorkerResult;

const CONNECT_RETRY_ATTEMPTS: usize = 10;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const PERMISSION_TIMEOUT: Duration = Duration::from_secs(300);

/// Error type for IPC client operations.
#[derive(Debug, thiserror::Error)]
pub enum IpcClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Permission timeout")]
    PermissionTimeout,

    #[error("Cancelled")]
    Cancelled,
}

/// IPC client for child-orchestrator communication.
pub struct IpcClient {
    /// Path to the IPC endpoint.
    socket_path: PathBuf,
    /// Child ID sent in the handshake.
    child_id: String,
    /// Write half of the stream.
    writer: Option<tokio::io::WriteHalf<IpcStream>>,
    /// Pending permission requests by request ID.
    pending_permissions: Arc<Mutex<HashMap<String, oneshot::Sender<ConfirmationResult>>>>,
    /// Cancel reason, set when the orchestrator asks us to wind down.
    cancel_rx: watch::Receiver<Option<String>>,
    /// Inbound task re-issues (restart path).
    task_rx: mpsc::Receiver<String>,
    /// Tells the reader task to stop on disconnect.
    stop_tx: Option<mpsc::Sender<()>>,
}

impl IpcClient {
    /// Connect to the orchestrator's endpoint, retrying briefly while the
    /// server comes up, and start the background reader.
    pub async fn connect(
        socket_path: impl AsRef<Path>,
        child_id: impl Into<String>,
    ) -> Result<Self, IpcClientError> {
        let socket_path = socket_path.as_ref().to_path_buf();
        let child_id = child_id.into();

        let mut last_error: Option<String> = None;
        let mut stream = None;

        for attempt in 0..CONNECT_RETRY_ATTEMPTS {
            match tokio::time::timeout(CONNECT_TIMEOUT, transport::connect(&socket_path)).await {
                Ok(Ok(conn)) => {
                    stream = Some(conn);
                    break;
                }
                Ok(Err(err)) => {
                    last_error = Some(err.to_string());
                }
                Err(_) => {
                    last_error = Some("connect timeout".to_string());
                }
            }

            if attempt + 1 < CONNECT_RETRY_ATTEMPTS {
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            }
        }

        let stream = stream.ok_or_else(|| {
            IpcClientError::ConnectionFailed(
                last_error.unwrap_or_else(|| "failed to connect".to_string()),
            )
        })?;
        let (read_half, write_half) = tokio::io::split(stream);

        let pending = Arc::new(Mutex::new(HashMap::new()));
        let (cancel_tx, cancel_rx) = watch::channel(None);
        let (task_tx, task_rx) = mpsc::channel(1);
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);

        let reader_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();

            loop {
                tokio::select! {
                    result = reader.read_line(&mut line) => {
                        match result {
                            Ok(0) => {
                                info!("Orchestrator disconnected");
                                break;
                            }
                            Ok(_) => {
                                match decode::<Envelope<OrchestratorMessage>>(&line) {
                                    Ok(envelope) => {
                                        Self::handle_orchestrator_message(
                                            envelope.body,
                                            &reader_pending,
                                            &cancel_tx,
                                            &task_tx,
                                        )
                                        .await;
                                    }
                                    Err(e) => {
                                        warn!("Ignoring malformed frame from orchestrator: {}", e);
                                    }
                                }
                                line.clear();
                            }
                            Err(e) => {
                                error!("Error reading from orchestrator: {}", e);
                                break;
                            }
                        }
                    }
                    _ = stop_rx.recv() => {
                        debug!("Client reader stopped");
                        break;
                    }
                }
            }

            // Fail any permission round-trips still in flight.
            let mut pending = reader_pending.lock().await;
            pending.clear();
        });

        debug!("Connected to orchestrator at {:?}", socket_path);
        Ok(Self {
            socket_path,
            child_id,
            writer: Some(write_half),
            pending_permissions: pending,
            cancel_rx,
            task_rx,
            stop_tx: Some(stop_tx),
        })
    }

    /// Handle a message from the orchestrator.
    async fn handle_orchestrator_message(
        msg: OrchestratorMessage,
        pending: &Arc<Mutex<HashMap<String, oneshot::Sender<ConfirmationResult>>>>,
        cancel_tx: &watch::Sender<Option<String>>,
        task_tx: &mpsc::Sender<String>,
    ) {
        match msg {
            OrchestratorMessage::PermissionResponse(resp) => {
                let mut pending = pending.lock().await;
                if let Some(tx) = pending.remove(&resp.request_id) {
                    let _ = tx.send(resp.result);
                } else {
                    debug!("Response for unknown request {}", resp.request_id);
                }
            }
            OrchestratorMessage::Cancel(cancel) => {
                warn!("Received cancel: {}", cancel.reason);
                let _ = cancel_tx.send(Some(cancel.reason));

                // Deny anything still waiting so tool calls unblock.
                let mut pending = pending.lock().await;
                for (_, tx) in pending.drain() {
                    let _ = tx.send(ConfirmationResult::Deny);
                }
            }
            OrchestratorMessage::Task(issue) => {
                let _ = task_tx.send(issue.task).await;
            }
        }
    }

    /// The child ID this client identifies as.
    pub fn child_id(&self) -> &str {
        &self.child_id
    }

    /// The endpoint this client dialed.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send the mandatory handshake. Must be the first frame on the wire.
    pub async fn handshake(&mut self) -> Result<(), IpcClientError> {
        let msg = ChildMessage::handshake(self.child_id.clone());
        self.send_message(msg).await
    }

    /// Request permission for a tool operation and wait for the decision.
    pub async fn request_permission(
        &mut self,
        confirmation: ToolConfirmation,
    ) -> Result<ConfirmationResult, IpcClientError> {
        if self.is_cancelled() {
            return Err(IpcClientError::Cancelled);
        }

        let msg = ChildMessage::permission_request(confirmation);
        let request_id = match &msg {
            ChildMessage::PermissionRequest(req) => req.request_id.clone(),
            _ => return Err(IpcClientError::ChannelClosed),
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending_permissions.lock().await;
            pending.insert(request_id.clone(), tx);
        }

        if let Err(e) = self.send_message(msg).await {
            let mut pending = self.pending_permissions.lock().await;
            pending.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(PERMISSION_TIMEOUT, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(IpcClientError::ChannelClosed),
            Err(_) => {
                let mut pending = self.pending_permissions.lock().await;
                pending.remove(&request_id);
                Err(IpcClientError::PermissionTimeout)
            }
        }
    }

    /// Send a status update.
    pub async fn send_status(&mut self, update: StatusUpdate) -> Result<(), IpcClientError> {
        self.send_message(ChildMessage::status(update)).await
    }

    /// Send a log line.
    pub async fn send_log(
        &mut self,
        level: LogLevel,
        content: impl Into<String>,
    ) -> Result<(), IpcClientError> {
        self.send_message(ChildMessage::log(level, content)).await
    }

    /// Report successful completion.
    pub async fn send_task_complete(&mut self, result: WorkerResult) -> Result<(), IpcClientError> {
        self.send_message(ChildMessage::task_complete(result)).await
    }

    /// Report task failure.
    pub async fn send_task_error(
        &mut self,
        message: impl Into<String>,
        code: Option<String>,
    ) -> Result<(), IpcClientError> {
        self.send_message(ChildMessage::task_error(message, code)).await
    }

    /// Check if the orchestrator has asked us to wind down.
    pub fn is_cancelled(&self) -> bool {
        self.cancel_rx.borrow().is_some()
    }

    /// Cancel reason, if one was received.
    pub fn cancel_reason(&self) -> Option<String> {
        self.cancel_rx.borrow().clone()
    }

    /// A watch handle that resolves when a cancel arrives.
    pub fn cancel_watch(&self) -> watch::Receiver<Option<String>> {
        self.cancel_rx.clone()
    }

    /// Wait for a task re-issue from the orchestrator, up to `timeout`.
    ///
    /// Used after a restart handshake, where the child has no argv task.
    pub async fn wait_for_task(&mut self, timeout: Duration) -> Option<String> {
        tokio::time::timeout(timeout, self.task_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Disconnect from the orchestrator.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(()).await;
        }
        self.writer = None;
    }

    async fn send_message(&mut self, msg: ChildMessage) -> Result<(), IpcClientError> {
        let writer = self.writer.as_mut().ok_or(IpcClientError::NotConnected)?;
        let encoded = encode(&Envelope::new(msg))?;
        writer.write_all(encoded.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}
