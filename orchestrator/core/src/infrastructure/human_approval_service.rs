// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Human Approval Service - tier-3 gate for human-in-the-loop governance
//!
//! Holds one pending request per gated decision, hands it to whichever human
//! operator answers first, and reports `TimedOut` when nobody answers within
//! the window. A timeout is never treated as approval.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::agent::{AgentRecord, AgentRole};
use crate::domain::task::TaskId;

#[derive(Debug, Clone)]
pub enum HumanApprovalStatus {
    Approved {
        approver: AgentRecord,
        feedback: Option<String>,
        approved_at: DateTime<Utc>,
    },
    Rejected {
        approver: AgentRecord,
        reason: String,
        rejected_at: DateTime<Utc>,
    },
    TimedOut {
        timeout_at: DateTime<Utc>,
    },
    /// Request was cancelled, e.g. because the task was withdrawn
    Withdrawn {
        withdrawn_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApprovalError {
    #[error("agent '{name}' has role {role}; only human operators may answer tier-3 requests")]
    NotHumanTier { name: String, role: AgentRole },
    #[error("approval request {0} not found or already answered")]
    NotFound(Uuid),
}

#[derive(Debug)]
struct ApprovalRequest {
    id: Uuid,
    task_id: TaskId,
    prompt: String,
    created_at: DateTime<Utc>,
    timeout: Duration,
    response_tx: oneshot::Sender<HumanApprovalStatus>,
}

impl ApprovalRequest {
    fn info(&self) -> PendingApproval {
        PendingApproval {
            id: self.id,
            task_id: self.task_id,
            prompt: self.prompt.clone(),
            created_at: self.created_at,
            timeout_seconds: self.timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    pub id: Uuid,
    pub task_id: TaskId,
    pub prompt: String,
    pub created_at: DateTime<Utc>,
    pub timeout_seconds: u64,
}

/// An opened request. Pass it to [`HumanApprovalService::await_decision`].
#[derive(Debug)]
pub struct ApprovalTicket {
    pub info: PendingApproval,
    timeout: Duration,
    response_rx: oneshot::Receiver<HumanApprovalStatus>,
}

pub struct HumanApprovalService {
    pending_requests: Arc<RwLock<HashMap<Uuid, ApprovalRequest>>>,
}

impl HumanApprovalService {
    pub fn new() -> Self {
        Self { pending_requests: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Open a request and wait for an answer or the timeout.
    pub async fn request_approval(&self, task_id: TaskId, prompt: String, timeout: Duration) -> HumanApprovalStatus {
        let ticket = self.open_request(task_id, prompt, timeout).await;
        self.await_decision(ticket).await
    }

    /// Register a request. It is answerable as soon as this returns, so
    /// announce it to operators only afterwards.
    pub async fn open_request(&self, task_id: TaskId, prompt: String, timeout: Duration) -> ApprovalTicket {
        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        let request =
            ApprovalRequest { id: request_id, task_id, prompt, created_at: Utc::now(), timeout, response_tx: tx };
        let info = request.info();
        self.pending_requests.write().await.insert(request_id, request);

        info!(
            request_id = %request_id,
            task_id = %task_id,
            timeout_seconds = timeout.as_secs(),
            "Human approval requested"
        );
        ApprovalTicket { info, timeout, response_rx: rx }
    }

    /// Wait for the answer to an opened request, or its timeout.
    pub async fn await_decision(&self, ticket: ApprovalTicket) -> HumanApprovalStatus {
        let ApprovalTicket { info, timeout, response_rx: mut rx } = ticket;
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(status)) => status,
            Ok(Err(_)) => HumanApprovalStatus::Withdrawn { withdrawn_at: Utc::now() },
            Err(_) => {
                let removed = self.pending_requests.write().await.remove(&info.id).is_some();
                if removed {
                    warn!(request_id = %info.id, task_id = %info.task_id, "Human approval request timed out");
                    HumanApprovalStatus::TimedOut { timeout_at: Utc::now() }
                } else {
                    // Answered while the timer fired; the answer is already in the channel.
                    rx.await.unwrap_or(HumanApprovalStatus::TimedOut { timeout_at: Utc::now() })
                }
            }
        }
    }

    fn ensure_human(approver: &AgentRecord) -> Result<(), ApprovalError> {
        if approver.role != AgentRole::Human {
            return Err(ApprovalError::NotHumanTier { name: approver.name.clone(), role: approver.role });
        }
        Ok(())
    }

    pub async fn submit_approval(
        &self,
        request_id: Uuid,
        approver: &AgentRecord,
        feedback: Option<String>,
    ) -> Result<(), ApprovalError> {
        Self::ensure_human(approver)?;
        let request = self
            .pending_requests
            .write()
            .await
            .remove(&request_id)
            .ok_or(ApprovalError::NotFound(request_id))?;

        info!(request_id = %request_id, approver = %approver.name, "Human approval granted");
        let _ = request.response_tx.send(HumanApprovalStatus::Approved {
            approver: approver.clone(),
            feedback,
            approved_at: Utc::now(),
        });
        Ok(())
    }

    pub async fn submit_rejection(
        &self,
        request_id: Uuid,
        approver: &AgentRecord,
        reason: String,
    ) -> Result<(), ApprovalError> {
        Self::ensure_human(approver)?;
        let request = self
            .pending_requests
            .write()
            .await
            .remove(&request_id)
            .ok_or(ApprovalError::NotFound(request_id))?;

        info!(request_id = %request_id, approver = %approver.name, reason = %reason, "Human approval refused");
        let _ = request.response_tx.send(HumanApprovalStatus::Rejected {
            approver: approver.clone(),
            reason,
            rejected_at: Utc::now(),
        });
        Ok(())
    }

    pub async fn list_pending_requests(&self) -> Vec<PendingApproval> {
        let mut pending: Vec<_> = self.pending_requests.read().await.values().map(ApprovalRequest::info).collect();
        pending.sort_by_key(|p| p.created_at);
        pending
    }

    pub async fn pending_for_task(&self, task_id: TaskId) -> Option<PendingApproval> {
        self.pending_requests.read().await.values().find(|r| r.task_id == task_id).map(ApprovalRequest::info)
    }

    pub async fn cancel_request(&self, request_id: Uuid) -> Result<(), ApprovalError> {
        let request = self
            .pending_requests
            .write()
            .await
            .remove(&request_id)
            .ok_or(ApprovalError::NotFound(request_id))?;
        debug!(request_id = %request_id, "Human approval request cancelled");
        let _ = request.response_tx.send(HumanApprovalStatus::Withdrawn { withdrawn_at: Utc::now() });
        Ok(())
    }

    /// Withdraw every open request for `task_id`. Returns how many were open.
    pub async fn cancel_for_task(&self, task_id: TaskId) -> usize {
        let mut requests = self.pending_requests.write().await;
        let ids: Vec<Uuid> = requests.values().filter(|r| r.task_id == task_id).map(|r| r.id).collect();
        for id in &ids {
            if let Some(request) = requests.remove(id) {
                let _ = request.response_tx.send(HumanApprovalStatus::Withdrawn { withdrawn_at: Utc::now() });
            }
        }
        ids.len()
    }
}

impl Default for HumanApprovalService {
    fn default() -> Self {
        Self::new()
    }
}
