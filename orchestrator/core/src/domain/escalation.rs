// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Escalation requests raised by governors and the verdicts Prime returns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::agent::AgentId;
use crate::domain::digest::sha256_hex;
use crate::domain::task::TaskPackage;
use crate::domain::worker::{FailureKind, WorkerFailure};

/// One failed attempt in a task's retry history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub attempt: u32,
    pub kind: FailureKind,
    pub reason: String,
    /// Digest of the reason text; equal digests mean the same failure.
    pub digest: String,
    pub at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn from_failure(attempt: u32, failure: &WorkerFailure) -> Self {
        Self {
            attempt,
            kind: failure.kind,
            reason: failure.reason.clone(),
            digest: sha256_hex(failure.reason.as_bytes()),
            at: Utc::now(),
        }
    }

    /// A produced artifact that failed output validation.
    pub fn rejected_output(attempt: u32, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            attempt,
            kind: FailureKind::Systematic,
            digest: sha256_hex(reason.as_bytes()),
            reason,
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum EscalationCause {
    RetriesExhausted,
    OutOfLane { reason: String },
}

#[derive(Debug, Clone)]
pub struct EscalationRequest {
    /// The task with the governor hop already recorded in its path.
    pub task: TaskPackage,
    pub governor: AgentId,
    pub cause: EscalationCause,
    pub failure_history: Vec<FailureRecord>,
}

impl EscalationRequest {
    /// Every attempt failed the same way, or at least one failure was
    /// systematic by the worker's own account.
    pub fn is_systematic(&self) -> bool {
        let Some(first) = self.failure_history.first() else {
            return false;
        };
        let identical = self.failure_history.len() > 1 && self.failure_history.iter().all(|f| f.digest == first.digest);
        identical || self.failure_history.iter().any(|f| f.kind == FailureKind::Systematic)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationVerdict {
    /// Supersede the task with a fresh Prime-originated admission.
    Approve,
    Reject,
    DeferToHuman,
}
