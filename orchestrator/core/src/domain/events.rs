// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::agent::AgentId;
use crate::domain::anomaly::AnomalyKind;
use crate::domain::audit::SequenceNumber;
use crate::domain::relay::TargetSystemRef;
use crate::domain::task::{DomainName, Requirements, TaskId};

/// Governance lifecycle events published on the event bus.
///
/// Events are notifications for observers (CLI streaming, dashboards). The
/// audit log remains the record; nothing reads events to make a decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GovernanceEvent {
    TaskAdmitted {
        task_id: TaskId,
        domain: DomainName,
        requires: Requirements,
        admitted_at: DateTime<Utc>,
    },
    EscalationRaised {
        task_id: TaskId,
        domain: DomainName,
        cause: String,
        attempts: usize,
        raised_at: DateTime<Utc>,
    },
    /// Published once the request is open, so `request_id` can be answered
    /// straight away.
    HumanApprovalRequested {
        task_id: TaskId,
        request_id: Uuid,
        prompt: String,
        requested_at: DateTime<Utc>,
    },
    TaskDelivered {
        task_id: TaskId,
        target: TargetSystemRef,
        external_ref: String,
        delivered_at: DateTime<Utc>,
    },
    TaskConcluded {
        task_id: TaskId,
        outcome: String,
        concluded_at: DateTime<Utc>,
    },
    AnomalyDetected {
        kind: AnomalyKind,
        task_id: Option<TaskId>,
        agent_id: AgentId,
        sequence: SequenceNumber,
        detected_at: DateTime<Utc>,
    },
    DomainDegraded {
        domain: DomainName,
        reason: String,
        degraded_at: DateTime<Utc>,
    },
    DomainRestored {
        domain: DomainName,
        approver: AgentId,
        restored_at: DateTime<Utc>,
    },
    SystemHalted {
        reason: String,
        task_id: Option<TaskId>,
        halted_at: DateTime<Utc>,
    },
    SystemResumed {
        approver: AgentId,
        reason: String,
        resumed_at: DateTime<Utc>,
    },
}

impl GovernanceEvent {
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            GovernanceEvent::TaskAdmitted { task_id, .. }
            | GovernanceEvent::EscalationRaised { task_id, .. }
            | GovernanceEvent::HumanApprovalRequested { task_id, .. }
            | GovernanceEvent::TaskDelivered { task_id, .. }
            | GovernanceEvent::TaskConcluded { task_id, .. } => Some(*task_id),
            GovernanceEvent::AnomalyDetected { task_id, .. } | GovernanceEvent::SystemHalted { task_id, .. } => *task_id,
            GovernanceEvent::DomainDegraded { .. }
            | GovernanceEvent::DomainRestored { .. }
            | GovernanceEvent::SystemResumed { .. } => None,
        }
    }
}
