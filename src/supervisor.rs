// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Child process supervision.
//!
//! Spawns children running this executable in child/reader mode, wires their
//! stdout/stderr into labeled log streams, and provides graceful (SIGTERM)
//! and forced termination.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::OrchestratorError;
use crate::types::ChildKind;

/// Everything needed to launch one child.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Executable to run (resolved by the caller).
    pub executable: PathBuf,
    /// IPC endpoint the child should dial.
    pub socket_path: PathBuf,
    /// Identity the child sends in its handshake.
    pub child_id: String,
    /// Initial task prompt.
    pub task: String,
    /// Worker or reader mode.
    pub kind: ChildKind,
    /// Optional model override.
    pub model: Option<String>,
    /// Optional provider override.
    pub provider: Option<String>,
    /// Tools pre-approved for this child.
    pub auto_approve: Vec<String>,
    /// Working directory: the workspace (worker) or repo root (reader).
    pub working_dir: PathBuf,
    /// Prefix for re-emitted stdout/stderr lines: the worker's branch or the
    /// reader's short id.
    pub log_prefix: String,
}

/// A supervised child process.
pub struct ChildHandle {
    process: Child,
    log_prefix: String,
}

/// Build the child's command line per the CLI surface contract.
pub fn build_command(spec: &SpawnSpec) -> Command {
    let mut cmd = Command::new(&spec.executable);

    match spec.kind {
        ChildKind::Worker => {
            cmd.arg("--child-mode");
            cmd.env("CODI_CHILD_MODE", "1");
        }
        ChildKind::Reader => {
            cmd.arg("--reader-mode");
            cmd.env("CODI_READER_MODE", "1");
        }
    }

    cmd.arg("--socket-path").arg(spec.socket_path.as_os_str());
    cmd.arg("--child-id").arg(&spec.child_id);
    cmd.arg("--child-task").arg(&spec.task);

    if let Some(model) = &spec.model {
        cmd.arg("--model").arg(model);
    }
    if let Some(provider) = &spec.provider {
        cmd.arg("--provider").arg(provider);
    }
    if !spec.auto_approve.is_empty() {
        cmd.arg("--auto-approve").arg(spec.auto_approve.join(","));
    }

    // Env mirrors let child code bootstrap before arg parsing.
    cmd.env("CODI_SOCKET_PATH", spec.socket_path.as_os_str());
    cmd.env("CODI_CHILD_ID", &spec.child_id);

    cmd.current_dir(&spec.working_dir);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd
}

/// Spawn a child and start pumping its stdout/stderr into the log stream.
pub fn spawn_child(spec: &SpawnSpec) -> Result<ChildHandle, OrchestratorError> {
    let mut cmd = build_command(spec);
    let mut process = cmd
        .spawn()
        .map_err(|e| OrchestratorError::SpawnFailed(format!("{}: {e}", spec.executable.display())))?;

    if let Some(stdout) = process.stdout.take() {
        pump_lines(stdout, spec.log_prefix.clone(), false);
    }
    if let Some(stderr) = process.stderr.take() {
        pump_lines(stderr, spec.log_prefix.clone(), true);
    }

    info!(
        "Spawned {} {} (pid {:?}) in {:?}",
        match spec.kind {
            ChildKind::Worker => "worker",
            ChildKind::Reader => "reader",
        },
        spec.child_id,
        process.id(),
        spec.working_dir
    );

    Ok(ChildHandle {
        process,
        log_prefix: spec.log_prefix.clone(),
    })
}

/// Re-emit a child output stream line-wise with the worker's prefix.
fn pump_lines(
    stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    prefix: String,
    is_stderr: bool,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if is_stderr {
                warn!("[{}] {}", prefix, line);
            } else {
                info!("[{}] {}", prefix, line);
            }
        }
    });
}

impl ChildHandle {
    /// OS process id, if the child is still running.
    pub fn pid(&self) -> Option<u32> {
        self.process.id()
    }

    /// Ask the child to terminate (SIGTERM on Unix; hard kill elsewhere).
    pub fn terminate(&mut self) {
        #[cfg(unix)]
        {
            if let Some(pid) = self.process.id() {
                debug!("[{}] sending SIGTERM to pid {}", self.log_prefix, pid);
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid as i32),
                    nix::sys::signal::Signal::SIGTERM,
                );
            }
        }

        #[cfg(not(unix))]
        {
            let _ = self.process.start_kill();
        }
    }

    /// Force-kill the child.
    pub async fn kill(&mut self) {
        debug!("[{}] force killing", self.log_prefix);
        let _ = self.process.kill().await;
    }

    /// Wait for the child to exit, up to `timeout`. Returns `None` when the
    /// child is still running after the timeout.
    pub async fn wait_timeout(&mut self, timeout: Duration) -> Option<std::process::ExitStatus> {
        match tokio::time::timeout(timeout, self.process.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(_)) | Err(_) => None,
        }
    }
}

/// Short id used to prefix reader log lines.
pub fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}

/// Build a spec's log prefix from its identity.
pub fn log_prefix_for(kind: ChildKind, id: &str, branch: Option<&str>) -> String {
    match (kind, branch) {
        (ChildKind::Worker, Some(branch)) => branch.to_string(),
        _ => short_id(id),
    }
}
