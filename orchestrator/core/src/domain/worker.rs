// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Worker Contract (BC-3 Execution Context)
//!
//! Workers are the only components that do domain work. They receive a task
//! package from their governor and return an artifact or a failure; they
//! never see the audit log, never talk to other workers and never deliver
//! anything themselves.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::domain::digest::digest_of;
use crate::domain::task::{TaskId, TaskPackage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub task_id: TaskId,
    /// Content type label, e.g. `advisory/v1`.
    pub format: String,
    pub content: Value,
    pub produced_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(task_id: TaskId, format: impl Into<String>, content: Value) -> Self {
        Self { task_id, format: format.into(), content, produced_at: Utc::now() }
    }

    /// Digest of the content alone, so it matches what the relay sends.
    pub fn digest(&self) -> String {
        digest_of(&self.content)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Might succeed on another attempt.
    Transient,
    /// Will fail the same way for this input.
    Systematic,
    /// Exceeded the domain's worker time box.
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?} worker failure: {reason}")]
pub struct WorkerFailure {
    pub kind: FailureKind,
    pub reason: String,
}

impl WorkerFailure {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self { kind: FailureKind::Transient, reason: reason.into() }
    }

    pub fn systematic(reason: impl Into<String>) -> Self {
        Self { kind: FailureKind::Systematic, reason: reason.into() }
    }

    pub fn timeout(limit: Duration) -> Self {
        Self { kind: FailureKind::Timeout, reason: format!("no result within {}ms", limit.as_millis()) }
    }
}

#[async_trait]
pub trait WorkerExecutor: Send + Sync {
    async fn execute(&self, task: &TaskPackage) -> Result<Artifact, WorkerFailure>;
}
