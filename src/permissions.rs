// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Permission arbitration.
//!
//! Serializes `permission_request` messages from all children onto a single
//! operator queue, obtains a decision from the configured collaborator, and
//! hands it back to the dispatch core for routing. Children never talk to
//! the operator directly, and unrelated children keep running while a
//! decision is pending.
//!
//! With no collaborator configured the arbitrator denies (fail-closed).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::ipc::{ConfirmationResult, ToolConfirmation};

/// Operator-in-the-loop collaborator consulted for privileged operations.
///
/// Implementations may consult a terminal, a web UI, or a policy engine.
/// They must resolve to [`ConfirmationResult::Deny`] rather than fail.
#[async_trait]
pub trait PermissionPrompt: Send + Sync {
    async fn on_permission_request(
        &self,
        child_id: &str,
        confirmation: &ToolConfirmation,
    ) -> ConfirmationResult;
}

/// Adapter for plain synchronous decision functions.
pub struct PromptFn<F>(pub F);

#[async_trait]
impl<F> PermissionPrompt for PromptFn<F>
where
    F: Fn(&str, &ToolConfirmation) -> ConfirmationResult + Send + Sync,
{
    async fn on_permission_request(
        &self,
        child_id: &str,
        confirmation: &ToolConfirmation,
    ) -> ConfirmationResult {
        (self.0)(child_id, confirmation)
    }
}

/// A permission request waiting for an operator decision.
#[derive(Debug, Clone)]
pub struct PendingPermission {
    /// Opaque ID supplied by the child.
    pub request_id: String,
    /// The requesting child.
    pub child_id: String,
    /// What the child wants to do.
    pub confirmation: ToolConfirmation,
}

/// Decision produced by the arbitrator for the dispatch core to route.
#[derive(Debug, Clone)]
pub struct PermissionDecision {
    /// The request being answered.
    pub request_id: String,
    /// The child the response goes to.
    pub child_id: String,
    /// The tool the decision covers (for approve-always/approve-session
    /// bookkeeping).
    pub tool_name: String,
    /// The operator's verdict.
    pub result: ConfirmationResult,
}

/// Table of requests that have been received but not yet answered.
///
/// Entries are removed when a response is sent or the child disconnects;
/// a decision for a removed entry is discarded.
#[derive(Clone, Default)]
pub struct PendingPermissions {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl PendingPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pending request.
    pub async fn insert(&self, request_id: &str, child_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.insert(request_id.to_string(), child_id.to_string());
    }

    /// Remove a single request. Returns true when it was still pending.
    pub async fn remove(&self, request_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        inner.remove(request_id).is_some()
    }

    /// Drop every pending request for a child (disconnect or terminal state).
    pub async fn remove_for_child(&self, child_id: &str) -> Vec<String> {
        let mut inner = self.inner.lock().await;
        let ids: Vec<String> = inner
            .iter()
            .filter(|(_, c)| c.as_str() == child_id)
            .map(|(r, _)| r.clone())
            .collect();
        for id in &ids {
            inner.remove(id);
        }
        ids
    }

    /// Check whether a request is still awaiting a decision.
    pub async fn contains(&self, request_id: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.contains_key(request_id)
    }

    /// Number of pending requests.
    pub async fn len(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.len()
    }

    /// Whether the table is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Session-wide set of tools the operator approved with `approve-session`.
#[derive(Clone, Default)]
pub struct SessionApprovals {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl SessionApprovals {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, tool_name: &str) {
        let mut inner = self.inner.lock().await;
        inner.insert(tool_name.to_string());
    }

    pub async fn contains(&self, tool_name: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.contains(tool_name)
    }
}

/// The arbitrator task: one queue, one decision at a time.
pub struct PermissionBroker {
    queue_tx: mpsc::Sender<PendingPermission>,
}

impl PermissionBroker {
    /// Start the broker. Requests pushed via [`PermissionBroker::submit`]
    /// are answered in arrival order on the returned decision channel.
    ///
    /// The broker holds no locks while the operator decides; non-permission
    /// traffic keeps flowing through the dispatch core.
    pub fn start(
        prompt: Option<Arc<dyn PermissionPrompt>>,
        pending: PendingPermissions,
    ) -> (Self, mpsc::Receiver<PermissionDecision>) {
        let (queue_tx, mut queue_rx) = mpsc::channel::<PendingPermission>(64);
        let (decision_tx, decision_rx) = mpsc::channel::<PermissionDecision>(64);

        tokio::spawn(async move {
            while let Some(request) = queue_rx.recv().await {
                // The child may have disconnected or finished while queued.
                if !pending.contains(&request.request_id).await {
                    debug!(
                        "Skipping stale permission request {} from {}",
                        request.request_id, request.child_id
                    );
                    continue;
                }

                let result = match &prompt {
                    Some(prompt) => {
                        prompt
                            .on_permission_request(&request.child_id, &request.confirmation)
                            .await
                    }
                    None => {
                        warn!(
                            "No permission collaborator configured, denying {} for {}",
                            request.confirmation.tool_name, request.child_id
                        );
                        ConfirmationResult::Deny
                    }
                };

                let decision = PermissionDecision {
                    request_id: request.request_id,
                    child_id: request.child_id,
                    tool_name: request.confirmation.tool_name,
                    result,
                };
                if decision_tx.send(decision).await.is_err() {
                    break;
                }
            }
        });

        (Self { queue_tx }, decision_rx)
    }

    /// Enqueue a request for the operator.
    pub async fn submit(&self, request: PendingPermission) {
        if self.queue_tx.send(request).await.is_err() {
            warn!("Permission broker is gone; request dropped");
        }
    }
}
