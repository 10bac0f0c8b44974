// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Audit Entries (BC-6 Audit Context)
//!
//! The audit log is the system of record. Components build an [`AuditRecord`]
//! and hand it to an [`crate::domain::repository::AuditLog`], which assigns the
//! next [`SequenceNumber`] and returns the sealed [`AuditEntry`].
//!
//! Sequence numbers start at 1 and are strictly increasing within one log.
//! Entries are never updated or deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::domain::agent::{AgentId, AgentRole};
use crate::domain::task::{ApprovalTier, DomainName, Requirements, TaskId, TaskPackage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    pub const FIRST: SequenceNumber = SequenceNumber(1);

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn prev(self) -> Option<Self> {
        (self.0 > 1).then(|| Self(self.0 - 1))
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Decision vocabulary. One entry records exactly one decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Decision {
    Admit,
    Route,
    ValidateAccept,
    ValidateReject,
    Dispatch,
    Produce,
    Fail,
    Retry,
    OutputAccept,
    OutputReject,
    Escalate,
    Approve,
    Reject,
    DeferToHuman,
    ApproveTier2,
    ApproveTier3,
    HumanReject,
    HumanTimeout,
    Deliver,
    DeliveryFailed,
    Hold,
    Discard,
    Cancel,
    Takeover,
    Retire,
    Anomaly,
    Halt,
    Resume,
    /// A human cleared a governor's degraded flag.
    Restore,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Admit => "admit",
            Decision::Route => "route",
            Decision::ValidateAccept => "validate-accept",
            Decision::ValidateReject => "validate-reject",
            Decision::Dispatch => "dispatch",
            Decision::Produce => "produce",
            Decision::Fail => "fail",
            Decision::Retry => "retry",
            Decision::OutputAccept => "output-accept",
            Decision::OutputReject => "output-reject",
            Decision::Escalate => "escalate",
            Decision::Approve => "approve",
            Decision::Reject => "reject",
            Decision::DeferToHuman => "defer-to-human",
            Decision::ApproveTier2 => "approve-tier2",
            Decision::ApproveTier3 => "approve-tier3",
            Decision::HumanReject => "human-reject",
            Decision::HumanTimeout => "human-timeout",
            Decision::Deliver => "deliver",
            Decision::DeliveryFailed => "delivery-failed",
            Decision::Hold => "hold",
            Decision::Discard => "discard",
            Decision::Cancel => "cancel",
            Decision::Takeover => "takeover",
            Decision::Retire => "retire",
            Decision::Anomaly => "anomaly",
            Decision::Halt => "halt",
            Decision::Resume => "resume",
            Decision::Restore => "restore",
        }
    }

    /// Decisions that put an artifact (or its approval) into circulation.
    /// STOP-RESET-REALIGN quarantines these when they follow a halt trigger.
    pub fn circulates_artifact(&self) -> bool {
        matches!(
            self,
            Decision::Produce
                | Decision::OutputAccept
                | Decision::ApproveTier2
                | Decision::ApproveTier3
                | Decision::Deliver
        )
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationFlag {
    OutOfLane,
    ConstraintTamper,
    ConstraintUnsatisfiable,
    WorkerFailure,
    WorkerTimeout,
    OutputRejected,
    SchemaMismatch,
    Integrity,
    PendingHumanTimeout,
    EscalationSkip,
    PrivilegeViolation,
    RoutingLoop,
    GateBypass,
    DomainDegraded,
    Quarantined,
}

/// A sealed, sequenced audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence: SequenceNumber,
    pub timestamp: DateTime<Utc>,
    pub agent_id: AgentId,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<DomainName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_digest: Option<String>,
    pub rationale: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub violation_flags: BTreeSet<ViolationFlag>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub escalation_path: Vec<AgentRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires: Option<Requirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<ApprovalTier>,
    /// Earlier entry this one answers, e.g. the anomalous entry behind a halt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_sequence: Option<SequenceNumber>,
    /// Agent this entry is about when it differs from the author.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_agent: Option<AgentId>,
}

impl AuditEntry {
    pub fn has_flag(&self, flag: ViolationFlag) -> bool {
        self.violation_flags.contains(&flag)
    }
}

/// An audit entry awaiting its sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub agent_id: AgentId,
    pub decision: Decision,
    pub task_id: Option<TaskId>,
    pub domain: Option<DomainName>,
    pub input_digest: Option<String>,
    pub output_digest: Option<String>,
    pub rationale: String,
    pub violation_flags: BTreeSet<ViolationFlag>,
    pub escalation_path: Vec<AgentRole>,
    pub requires: Option<Requirements>,
    pub tier: Option<ApprovalTier>,
    pub related_sequence: Option<SequenceNumber>,
    pub related_agent: Option<AgentId>,
}

impl AuditRecord {
    /// Entry not tied to a task (halt, resume, rejected admissions).
    pub fn new(agent_id: AgentId, decision: Decision) -> Self {
        Self {
            timestamp: Utc::now(),
            agent_id,
            decision,
            task_id: None,
            domain: None,
            input_digest: None,
            output_digest: None,
            rationale: String::new(),
            violation_flags: BTreeSet::new(),
            escalation_path: Vec::new(),
            requires: None,
            tier: None,
            related_sequence: None,
            related_agent: None,
        }
    }

    /// Entry about `task`, carrying its current path and tier.
    pub fn for_task(task: &TaskPackage, agent_id: AgentId, decision: Decision) -> Self {
        let mut record = Self::new(agent_id, decision);
        record.task_id = Some(task.task_id);
        record.domain = Some(task.domain.clone());
        record.escalation_path = task.escalation_path().to_vec();
        record.tier = Some(task.tier());
        record
    }

    pub fn rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = rationale.into();
        self
    }

    pub fn input_digest(mut self, digest: impl Into<String>) -> Self {
        self.input_digest = Some(digest.into());
        self
    }

    pub fn output_digest(mut self, digest: impl Into<String>) -> Self {
        self.output_digest = Some(digest.into());
        self
    }

    pub fn flag(mut self, flag: ViolationFlag) -> Self {
        self.violation_flags.insert(flag);
        self
    }

    pub fn requires(mut self, requires: Requirements) -> Self {
        self.requires = Some(requires);
        self
    }

    pub fn task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn domain(mut self, domain: DomainName) -> Self {
        self.domain = Some(domain);
        self
    }

    pub fn related(mut self, sequence: Option<SequenceNumber>, agent: Option<AgentId>) -> Self {
        self.related_sequence = sequence;
        self.related_agent = agent;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn sequenced(self, sequence: SequenceNumber) -> AuditEntry {
        AuditEntry {
            sequence,
            timestamp: self.timestamp,
            agent_id: self.agent_id,
            decision: self.decision,
            task_id: self.task_id,
            domain: self.domain,
            input_digest: self.input_digest,
            output_digest: self.output_digest,
            rationale: self.rationale,
            violation_flags: self.violation_flags,
            escalation_path: self.escalation_path,
            requires: self.requires,
            tier: self.tier,
            related_sequence: self.related_sequence,
            related_agent: self.related_agent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_wire_names() {
        assert_eq!(serde_json::to_string(&Decision::ApproveTier3).unwrap(), "\"approve-tier3\"");
        assert_eq!(serde_json::to_string(&Decision::DeferToHuman).unwrap(), "\"defer-to-human\"");
        assert_eq!(Decision::DeliveryFailed.as_str(), "delivery-failed");
    }

    #[test]
    fn test_flag_wire_names() {
        assert_eq!(serde_json::to_string(&ViolationFlag::OutOfLane).unwrap(), "\"out_of_lane\"");
        assert_eq!(
            serde_json::to_string(&ViolationFlag::PendingHumanTimeout).unwrap(),
            "\"pending_human_timeout\""
        );
    }

    #[test]
    fn test_entry_json_is_compact_and_round_trips() {
        let agent = AgentId::named("prime:prime");
        let entry = AuditRecord::new(agent, Decision::Halt)
            .rationale("privilege violation")
            .related(Some(SequenceNumber(7)), None)
            .sequenced(SequenceNumber(8));

        let raw = serde_json::to_string(&entry).unwrap();
        assert!(!raw.contains("violation_flags"));
        assert!(!raw.contains("task_id"));
        let back: AuditEntry = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_sequence_prev_stops_at_first() {
        assert_eq!(SequenceNumber::FIRST.prev(), None);
        assert_eq!(SequenceNumber(5).prev(), Some(SequenceNumber(4)));
    }
}
