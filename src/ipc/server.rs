// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! IPC server for the orchestrator.
//!
//! The server listens on a platform-specific stream endpoint and routes
//! messages by the `childId` carried in each connection's mandatory
//! handshake, not by connection identity. A child that reconnects after a
//! transient drop resumes routing to the same worker state; a second
//! handshake for a live id closes the older connection.
//!
//! Malformed frames and handshake-less connections are closed immediately.
//! `log` frames are forwarded with `try_send` and counted when dropped;
//! every other message class is forwarded with backpressure.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::error::IpcError;
use super::protocol::{
    decode, encode, ChildMessage, Envelope, Handshake, OrchestratorMessage, PROTOCOL_VERSION,
};
use super::transport::{self, IpcStream};

/// How long a new connection may sit silent before its handshake is due.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the inbound event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events surfaced to the dispatch core.
#[derive(Debug)]
pub enum ServerEvent {
    /// A child completed its handshake.
    Connected {
        child_id: String,
        handshake: Handshake,
    },
    /// A post-handshake message arrived from a child.
    Message {
        child_id: String,
        message: ChildMessage,
    },
    /// A child's connection was lost (EOF, read error, or protocol
    /// violation). Not emitted when a connection is replaced by a newer
    /// handshake for the same id.
    Disconnected { child_id: String },
}

/// A registered child connection.
struct Connection {
    /// Monotonic id distinguishing this connection from a replaced one.
    generation: u64,
    /// Write half, shared with `send`.
    writer: Arc<Mutex<tokio::io::WriteHalf<IpcStream>>>,
    /// Signalled when this connection is replaced or force-closed.
    shutdown: Arc<Notify>,
}

/// IPC server for orchestrator-child communication.
pub struct IpcServer {
    /// Path to the IPC endpoint.
    socket_path: PathBuf,
    /// Connected children by id.
    connections: Arc<RwLock<HashMap<String, Connection>>>,
    /// Sender for inbound events.
    event_tx: mpsc::Sender<ServerEvent>,
    /// Receiver for inbound events (taken once).
    event_rx: Option<mpsc::Receiver<ServerEvent>>,
    /// Accept-loop task (set after start).
    accept_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    /// Connection generation counter.
    generation: Arc<AtomicU64>,
    /// Count of log frames dropped under backpressure.
    dropped_logs: Arc<AtomicU64>,
}

impl IpcServer {
    /// Create a new IPC server bound to nothing yet.
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            connections: Arc::new(RwLock::new(HashMap::new())),
            event_tx: tx,
            event_rx: Some(rx),
            accept_task: std::sync::Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
            dropped_logs: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Get the IPC endpoint path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the endpoint and start accepting connections.
    ///
    /// Idempotent. Fails with [`IpcError::AddressInUse`] when the path is
    /// occupied by a live listener; a stale socket file is removed.
    pub async fn start(&mut self) -> Result<(), IpcError> {
        {
            let task = self.accept_task.lock().unwrap_or_else(|e| e.into_inner());
            if task.is_some() {
                return Ok(());
            }
        }

        if transport::is_live_listener(&self.socket_path).await {
            return Err(IpcError::AddressInUse(
                self.socket_path.to_string_lossy().to_string(),
            ));
        }

        let listener = transport::bind(&self.socket_path)
            .await
            .map_err(|e| IpcError::BindFailed(e.to_string()))?;
        info!("IPC server listening on {:?}", self.socket_path);

        let connections = Arc::clone(&self.connections);
        let event_tx = self.event_tx.clone();
        let generation = Arc::clone(&self.generation);
        let dropped_logs = Arc::clone(&self.dropped_logs);

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(stream) => {
                        debug!("New connection accepted");
                        let connections = Arc::clone(&connections);
                        let event_tx = event_tx.clone();
                        let generation = Arc::clone(&generation);
                        let dropped_logs = Arc::clone(&dropped_logs);
                        tokio::spawn(async move {
                            Self::serve_connection(
                                stream,
                                connections,
                                event_tx,
                                generation,
                                dropped_logs,
                            )
                            .await;
                        });
                    }
                    Err(e) => {
                        error!("Accept failed: {}", e);
                        break;
                    }
                }
            }
        });

        let mut task = self.accept_task.lock().unwrap_or_else(|e| e.into_inner());
        *task = Some(accept_task);
        Ok(())
    }

    /// Take the inbound event receiver. Can only be called once.
    pub fn take_receiver(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.event_rx.take()
    }

    /// Number of log frames dropped because the dispatch core fell behind.
    pub fn dropped_logs(&self) -> u64 {
        self.dropped_logs.load(Ordering::Relaxed)
    }

    /// Drive a single connection: handshake first, then the message loop.
    async fn serve_connection(
        stream: IpcStream,
        connections: Arc<RwLock<HashMap<String, Connection>>>,
        event_tx: mpsc::Sender<ServerEvent>,
        generation: Arc<AtomicU64>,
        dropped_logs: Arc<AtomicU64>,
    ) {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();

        // The first frame must be a handshake; anything else closes the
        // connection.
        let read = tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.read_line(&mut line)).await;
        let handshake = match read {
            Err(_) => {
                warn!("Connection closed: no handshake within timeout");
                return;
            }
            Ok(Err(e)) => {
                warn!("Connection closed: handshake read failed: {}", e);
                return;
            }
            Ok(Ok(0)) => {
                debug!("Connection closed before handshake");
                return;
            }
            Ok(Ok(_)) => match decode::<Envelope<ChildMessage>>(&line) {
                Ok(Envelope {
                    body: ChildMessage::Handshake(hs),
                    ..
                }) => hs,
                Ok(_) => {
                    warn!("Connection closed: first message was not a handshake");
                    return;
                }
                Err(e) => {
                    warn!("Connection closed: malformed handshake frame: {}", e);
                    return;
                }
            },
        };

        if handshake.protocol_version != PROTOCOL_VERSION {
            warn!(
                "Connection closed: child {} speaks protocol {} (expected {})",
                handshake.child_id, handshake.protocol_version, PROTOCOL_VERSION
            );
            return;
        }

        let child_id = handshake.child_id.clone();
        let my_generation = generation.fetch_add(1, Ordering::Relaxed) + 1;
        let shutdown = Arc::new(Notify::new());

        // Register, replacing (and closing) any older connection for this id.
        {
            let mut conns = connections.write().await;
            if let Some(old) = conns.insert(
                child_id.clone(),
                Connection {
                    generation: my_generation,
                    writer: Arc::new(Mutex::new(write_half)),
                    shutdown: Arc::clone(&shutdown),
                },
            ) {
                info!("Replacing live connection for child {}", child_id);
                old.shutdown.notify_one();
            }
        }

        if event_tx
            .send(ServerEvent::Connected {
                child_id: child_id.clone(),
                handshake,
            })
            .await
            .is_err()
        {
            return;
        }

        // Message loop.
        loop {
            line.clear();
            tokio::select! {
                result = reader.read_line(&mut line) => {
                    match result {
                        Ok(0) => {
                            info!("Child {} disconnected", child_id);
                            break;
                        }
                        Ok(_) => match decode::<Envelope<ChildMessage>>(&line) {
                            Ok(Envelope { body: ChildMessage::Handshake(_), .. }) => {
                                warn!("Duplicate handshake from {}, closing connection", child_id);
                                break;
                            }
                            Ok(envelope) => {
                                let message = envelope.body;
                                if message.is_log() {
                                    // Logs are the highest-volume stream and
                                    // may be dropped under backpressure.
                                    let event = ServerEvent::Message {
                                        child_id: child_id.clone(),
                                        message,
                                    };
                                    if event_tx.try_send(event).is_err() {
                                        dropped_logs.fetch_add(1, Ordering::Relaxed);
                                    }
                                } else {
                                    let event = ServerEvent::Message {
                                        child_id: child_id.clone(),
                                        message,
                                    };
                                    if event_tx.send(event).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Err(e) => {
                                warn!("Malformed frame from {}, closing connection: {}", child_id, e);
                                break;
                            }
                        },
                        Err(e) => {
                            error!("Error reading from child {}: {}", child_id, e);
                            break;
                        }
                    }
                }
                _ = shutdown.notified() => {
                    debug!("Connection for {} superseded or closed", child_id);
                    return;
                }
            }
        }

        // Deregister and report the disconnect, unless a newer connection
        // already took over this id.
        let replaced = {
            let mut conns = connections.write().await;
            match conns.get(&child_id) {
                Some(conn) if conn.generation == my_generation => {
                    conns.remove(&child_id);
                    false
                }
                _ => true,
            }
        };

        if !replaced {
            let _ = event_tx
                .send(ServerEvent::Disconnected { child_id })
                .await;
        }
    }

    /// Send a message to the connection bound to `child_id`.
    ///
    /// A failed write is retried once; a second failure drops the message
    /// and leaves the disconnect to the connection's reader task.
    pub async fn send(&self, child_id: &str, msg: &OrchestratorMessage) -> Result<(), IpcError> {
        let writer = {
            let conns = self.connections.read().await;
            let conn = conns
                .get(child_id)
                .ok_or_else(|| IpcError::ChildNotConnected(child_id.to_string()))?;
            Arc::clone(&conn.writer)
        };

        let encoded = encode(&Envelope::new(msg.clone()))
            .map_err(|e| IpcError::InvalidMessage(format!("encode failed: {e}")))?;

        let mut writer = writer.lock().await;
        if let Err(e) = Self::write_frame(&mut writer, &encoded).await {
            warn!("Write to {} failed, retrying once: {}", child_id, e);
            Self::write_frame(&mut writer, &encoded)
                .await
                .map_err(|e| IpcError::from_io_error("sending message", e))?;
        }
        Ok(())
    }

    async fn write_frame(
        writer: &mut tokio::io::WriteHalf<IpcStream>,
        encoded: &str,
    ) -> std::io::Result<()> {
        writer.write_all(encoded.as_bytes()).await?;
        writer.flush().await
    }

    /// Check if a child is connected.
    pub async fn is_connected(&self, child_id: &str) -> bool {
        let conns = self.connections.read().await;
        conns.contains_key(child_id)
    }

    /// Get the ids of connected children.
    pub async fn connected_children(&self) -> Vec<String> {
        let conns = self.connections.read().await;
        conns.keys().cloned().collect()
    }

    /// Force-close a child's connection without emitting a disconnect event.
    pub async fn disconnect(&self, child_id: &str) {
        let mut conns = self.connections.write().await;
        if let Some(conn) = conns.remove(child_id) {
            conn.shutdown.notify_one();
        }
    }

    /// Stop the server: close every connection, stop accepting, and remove
    /// the socket path. Idempotent.
    pub async fn stop(&self) -> Result<(), IpcError> {
        {
            let mut conns = self.connections.write().await;
            for (_, conn) in conns.drain() {
                conn.shutdown.notify_one();
            }
        }

        let task = {
            let mut task = self.accept_task.lock().unwrap_or_else(|e| e.into_inner());
            task.take()
        };
        if let Some(task) = task {
            task.abort();
        }

        transport::cleanup(&self.socket_path)
            .map_err(|e| IpcError::from_io_error("cleaning up socket", e))?;
        info!("IPC server stopped");
        Ok(())
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let task = {
            let mut task = self.accept_task.lock().unwrap_or_else(|e| e.into_inner());
            task.take()
        };
        if let Some(task) = task {
            task.abort();
        }
        let _ = transport::cleanup(&self.socket_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::client::IpcClient;
    use crate::ipc::protocol::{ConfirmationResult, LogLevel};
    use tempfile::tempdir;

    async fn started_server(path: &Path) -> IpcServer {
        let mut server = IpcServer::new(path);
        server.start().await.expect("server start failed");
        server
    }

    #[tokio::test]
    async fn test_server_lifecycle() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");

        let mut server = IpcServer::new(&socket_path);
        #[cfg(not(windows))]
        assert!(!socket_path.exists());

        server.start().await.unwrap();
        #[cfg(not(windows))]
        assert!(socket_path.exists());

        server.stop().await.unwrap();
        #[cfg(not(windows))]
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");

        let mut server = started_server(&socket_path).await;
        server.start().await.expect("second start should be a no-op");
        server.stop().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_bind_conflict_with_live_listener() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");

        let _server = started_server(&socket_path).await;

        let mut second = IpcServer::new(&socket_path);
        let result = second.start().await;
        assert!(matches!(result, Err(IpcError::AddressInUse(_))));
    }

    #[tokio::test]
    async fn test_send_to_nonexistent_child() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");

        let server = started_server(&socket_path).await;
        let msg = OrchestratorMessage::cancel("test");
        let result = server.send("nonexistent", &msg).await;
        assert!(matches!(result, Err(IpcError::ChildNotConnected(_))));
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");

        let server = IpcServer::new(&socket_path);
        assert!(server.stop().await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_handshake_then_message_routing() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");

        let mut server = started_server(&socket_path).await;
        let mut rx = server.take_receiver().expect("receiver already taken");

        let mut client = IpcClient::connect(&socket_path, "w1").await.unwrap();
        client.handshake().await.unwrap();

        match rx.recv().await.expect("connected event missing") {
            ServerEvent::Connected { child_id, handshake } => {
                assert_eq!(child_id, "w1");
                assert_eq!(handshake.protocol_version, PROTOCOL_VERSION);
            }
            other => panic!("expected Connected, got {other:?}"),
        }

        client.send_log(LogLevel::Info, "hello").await.unwrap();
        match rx.recv().await.expect("log event missing") {
            ServerEvent::Message { child_id, message } => {
                assert_eq!(child_id, "w1");
                assert!(message.is_log());
            }
            other => panic!("expected Message, got {other:?}"),
        }

        // Orchestrator -> child direction.
        server
            .send("w1", &OrchestratorMessage::permission_response("r1", ConfirmationResult::Approve))
            .await
            .unwrap();

        client.disconnect().await;
        match rx.recv().await.expect("disconnect event missing") {
            ServerEvent::Disconnected { child_id } => assert_eq!(child_id, "w1"),
            other => panic!("expected Disconnected, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_handshake_first_message_closes_connection() {
        use tokio::io::AsyncWriteExt;

        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");

        let mut server = started_server(&socket_path).await;
        let mut rx = server.take_receiver().unwrap();

        let mut stream = tokio::net::UnixStream::connect(&socket_path).await.unwrap();
        let frame = encode(&Envelope::new(ChildMessage::log(LogLevel::Info, "sneaky"))).unwrap();
        stream.write_all(frame.as_bytes()).await.unwrap();
        stream.flush().await.unwrap();

        // The connection is dropped without ever producing an event.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        assert!(!server.is_connected("w1").await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_malformed_first_frame_closes_connection() {
        use tokio::io::AsyncWriteExt;

        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");

        let mut server = started_server(&socket_path).await;
        let mut rx = server.take_receiver().unwrap();

        let mut stream = tokio::net::UnixStream::connect(&socket_path).await.unwrap();
        stream.write_all(b"this is not json\n").await.unwrap();
        stream.flush().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        assert!(server.connected_children().await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_second_handshake_replaces_connection() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");

        let mut server = started_server(&socket_path).await;
        let mut rx = server.take_receiver().unwrap();

        let _first = {
            let mut c = IpcClient::connect(&socket_path, "w1").await.unwrap();
            c.handshake().await.unwrap();
            c
        };
        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerEvent::Connected { .. }
        ));

        let mut second = IpcClient::connect(&socket_path, "w1").await.unwrap();
        second.handshake().await.unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerEvent::Connected { .. }
        ));

        // Exactly one connection for w1; messages route to the newer one.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.connected_children().await, vec!["w1".to_string()]);

        second.send_log(LogLevel::Info, "from second").await.unwrap();
        match rx.recv().await.unwrap() {
            ServerEvent::Message { child_id, .. } => assert_eq!(child_id, "w1"),
            other => panic!("expected Message, got {other:?}"),
        }

        // Replacing must not have produced a Disconnected for w1.
        assert!(rx.try_recv().is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wrong_protocol_version_rejected() {
        use tokio::io::AsyncWriteExt;

        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");

        let mut server = started_server(&socket_path).await;
        let mut rx = server.take_receiver().unwrap();

        let mut stream = tokio::net::UnixStream::connect(&socket_path).await.unwrap();
        let mut hs = Handshake::new("w1");
        hs.protocol_version = 99;
        let frame = encode(&Envelope::new(ChildMessage::Handshake(hs))).unwrap();
        stream.write_all(frame.as_bytes()).await.unwrap();
        stream.flush().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        assert!(!server.is_connected("w1").await);
    }
}
