// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Work parked while the system is halted, and per-task withdrawal tokens.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::domain::escalation::FailureRecord;
use crate::domain::task::{TaskId, TaskPackage};
use crate::domain::worker::Artifact;

/// Where in the pipeline a held task stopped.
#[derive(Debug, Clone)]
pub enum HeldStage {
    /// Admitted but not yet handed to a governor.
    AwaitingRoute,
    /// Not yet dispatched for the next attempt.
    AwaitingDispatch { failures: Vec<FailureRecord> },
    /// Worker result arrived after the halt; not yet validated.
    AwaitingValidation { artifact: Artifact, failures: Vec<FailureRecord> },
    /// Governor accepted the output; Prime approval pending.
    AwaitingFinalApproval { artifact: Artifact },
    /// Fully approved; not yet handed to the relay.
    AwaitingDelivery { artifact: Artifact },
}

impl HeldStage {
    pub fn label(&self) -> &'static str {
        match self {
            HeldStage::AwaitingRoute => "awaiting-route",
            HeldStage::AwaitingDispatch { .. } => "awaiting-dispatch",
            HeldStage::AwaitingValidation { .. } => "awaiting-validation",
            HeldStage::AwaitingFinalApproval { .. } => "awaiting-final-approval",
            HeldStage::AwaitingDelivery { .. } => "awaiting-delivery",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HeldTask {
    pub task: TaskPackage,
    pub stage: HeldStage,
    pub held_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct HeldQueue {
    items: Mutex<Vec<HeldTask>>,
}

impl HeldQueue {
    pub fn push(&self, task: TaskPackage, stage: HeldStage) {
        self.items.lock().push(HeldTask { task, stage, held_at: Utc::now() });
    }

    pub fn drain(&self) -> Vec<HeldTask> {
        std::mem::take(&mut *self.items.lock())
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One cancellation token per live task, shared by Prime and governors.
#[derive(Default)]
pub struct CancellationRegistry {
    tokens: DashMap<TaskId, CancellationToken>,
}

impl CancellationRegistry {
    /// Start tracking an admitted task.
    pub fn register(&self, task_id: TaskId) {
        self.tokens.entry(task_id).or_default();
    }

    pub fn token(&self, task_id: TaskId) -> CancellationToken {
        self.tokens.entry(task_id).or_default().clone()
    }

    /// Returns false when the task is not live, and tracks nothing new.
    pub fn cancel(&self, task_id: TaskId) -> bool {
        match self.tokens.get(&task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_cancelled(&self, task_id: TaskId) -> bool {
        self.tokens.get(&task_id).is_some_and(|t| t.is_cancelled())
    }

    pub fn forget(&self, task_id: TaskId) {
        self.tokens.remove(&task_id);
    }

    pub fn tracked(&self) -> usize {
        self.tokens.len()
    }
}
