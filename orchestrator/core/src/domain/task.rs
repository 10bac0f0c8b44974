// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Task Aggregate (BC-1 Task Routing Context)
//!
//! A task enters the control plane as an untrusted [`TaskCandidate`] and, once
//! admitted by the Prime router, becomes a [`TaskPackage`]: the unit that
//! flows through governors, workers, approval gates and the relay.
//!
//! ## Mutability
//!
//! The admitted fields (`origin`, `domain`, `intent`, `priority`, `payload`,
//! `constraints`, `deliver_to`, `flags`) are fixed at admission and sealed by
//! the admission digest. Governors recompute the digest before dispatch, so an
//! edited package is rejected deterministically.
//!
//! Only three things move after admission, and only through methods on the
//! package:
//!
//! | Field | Direction | Method |
//! |-------|-----------|--------|
//! | `tier` | forward only | [`TaskPackage::advance_tier`] |
//! | `escalation_path` | append only | [`TaskPackage::record_hop`] |
//! | `requires` | upgrade only | [`TaskPackage::upgrade_requirements`] |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::agent::AgentRole;
use crate::domain::digest::digest_of;
use crate::domain::relay::TargetSystemRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lowercase domain label such as `codex`, `ingestion` or `sync`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DomainName(String);

impl DomainName {
    pub fn parse(raw: &str) -> Result<Self, SchemaError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(SchemaError::EmptyDomain);
        }
        let valid = trimmed
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if !valid {
            return Err(SchemaError::InvalidDomain(raw.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// For names written into the source, which are known to be valid.
    pub(crate) fn from_static(name: &'static str) -> Self {
        Self(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DomainName {
    type Error = SchemaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DomainName> for String {
    fn from(value: DomainName) -> Self {
        value.0
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Operator,
    Prime,
    Governor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Analysis,
    Creation,
    Update,
    Ingestion,
    Sync,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Analysis => "analysis",
            Intent::Creation => "creation",
            Intent::Update => "update",
            Intent::Ingestion => "ingestion",
            Intent::Sync => "sync",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Approval gates a task must clear before it may leave the system.
///
/// The flags are closed upward: human approval implies Prime approval, which
/// implies governor review. [`Requirements::closed`] enforces that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub governor_review: bool,
    #[serde(default)]
    pub prime_approval: bool,
    #[serde(default)]
    pub human_approval: bool,
}

impl Requirements {
    pub fn governor_only() -> Self {
        Self { governor_review: true, ..Self::default() }
    }

    pub fn closed(mut self) -> Self {
        if self.human_approval {
            self.prime_approval = true;
        }
        if self.prime_approval {
            self.governor_review = true;
        }
        self
    }

    /// Union of two requirement sets. Never clears a flag.
    pub fn union(self, other: Requirements) -> Self {
        Self {
            governor_review: self.governor_review || other.governor_review,
            prime_approval: self.prime_approval || other.prime_approval,
            human_approval: self.human_approval || other.human_approval,
        }
        .closed()
    }

    /// Lowest approval tier that satisfies these requirements.
    pub fn required_tier(&self) -> ApprovalTier {
        if self.human_approval {
            ApprovalTier::HumanApproved
        } else if self.prime_approval {
            ApprovalTier::PrimeApproved
        } else if self.governor_review {
            ApprovalTier::GovernorReviewed
        } else {
            ApprovalTier::Worker
        }
    }
}

/// Approval tiers 0 through 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(into = "u8", try_from = "u8")]
pub enum ApprovalTier {
    #[default]
    Worker = 0,
    GovernorReviewed = 1,
    PrimeApproved = 2,
    HumanApproved = 3,
}

impl From<ApprovalTier> for u8 {
    fn from(tier: ApprovalTier) -> Self {
        tier as u8
    }
}

impl TryFrom<u8> for ApprovalTier {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ApprovalTier::Worker),
            1 => Ok(ApprovalTier::GovernorReviewed),
            2 => Ok(ApprovalTier::PrimeApproved),
            3 => Ok(ApprovalTier::HumanApproved),
            other => Err(format!("approval tier {other} is out of range 0..=3")),
        }
    }
}

impl fmt::Display for ApprovalTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier-{}", *self as u8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskFlags {
    /// The task's effect cannot be undone once delivered.
    #[serde(default)]
    pub irreversible: bool,
    /// The output is shown to clients.
    #[serde(default)]
    pub client_visible: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("domain must not be empty")]
    EmptyDomain,
    #[error("domain '{0}' must be lowercase ascii letters, digits, '-' or '_'")]
    InvalidDomain(String),
    #[error("payload must be a JSON object")]
    PayloadNotObject,
    #[error("constraint '{0}' is not a valid constraint label")]
    InvalidConstraint(String),
    #[error("constraint '{0}' is listed more than once")]
    DuplicateConstraint(String),
    #[error("delivery target '{0}' is not a valid target reference")]
    InvalidTarget(String),
    #[error("malformed task candidate: {0}")]
    Malformed(String),
}

fn default_payload() -> Value {
    Value::Object(Default::default())
}

fn default_origin() -> Origin {
    Origin::Operator
}

/// Untrusted task description as submitted by an operator or client.
///
/// Clients cannot supply `requires`, `tier` or `escalation_path`: unknown
/// fields are a schema error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskCandidate {
    #[serde(default = "default_origin")]
    pub origin: Origin,
    pub domain: String,
    pub intent: Intent,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_payload")]
    pub payload: Value,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub deliver_to: Option<String>,
    #[serde(default)]
    pub flags: TaskFlags,
}

impl TaskCandidate {
    pub fn new(domain: impl Into<String>, intent: Intent, priority: Priority) -> Self {
        Self {
            origin: Origin::Operator,
            domain: domain.into(),
            intent,
            priority,
            payload: default_payload(),
            constraints: Vec::new(),
            deliver_to: None,
            flags: TaskFlags::default(),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraints.push(constraint.into());
        self
    }

    pub fn deliver_to(mut self, target: impl Into<String>) -> Self {
        self.deliver_to = Some(target.into());
        self
    }

    pub fn with_flags(mut self, flags: TaskFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn from_json(raw: &str) -> Result<Self, SchemaError> {
        serde_json::from_str(raw).map_err(|e| SchemaError::Malformed(e.to_string()))
    }

    /// Structural checks performed before any policy is consulted.
    pub fn check_schema(&self) -> Result<CheckedCandidate, SchemaError> {
        let domain = DomainName::parse(&self.domain)?;
        if !self.payload.is_object() {
            return Err(SchemaError::PayloadNotObject);
        }

        let mut constraints = BTreeSet::new();
        for raw in &self.constraints {
            let label = raw.trim();
            let valid = !label.is_empty()
                && label.chars().all(|c| {
                    c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_' | ':')
                });
            if !valid {
                return Err(SchemaError::InvalidConstraint(raw.clone()));
            }
            if !constraints.insert(label.to_string()) {
                return Err(SchemaError::DuplicateConstraint(label.to_string()));
            }
        }

        let deliver_to = self
            .deliver_to
            .as_deref()
            .map(|raw| TargetSystemRef::parse(raw).map_err(|_| SchemaError::InvalidTarget(raw.to_string())))
            .transpose()?;

        Ok(CheckedCandidate { domain, constraints, deliver_to })
    }
}

/// Output of [`TaskCandidate::check_schema`].
#[derive(Debug, Clone)]
pub struct CheckedCandidate {
    pub domain: DomainName,
    pub constraints: BTreeSet<String>,
    pub deliver_to: Option<TargetSystemRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TierError {
    #[error("approval tier cannot move backwards from {from} to {to}")]
    Regression { from: ApprovalTier, to: ApprovalTier },
}

/// An admitted unit of work.
#[derive(Debug, Clone, Serialize)]
pub struct TaskPackage {
    pub task_id: TaskId,
    pub created_at: DateTime<Utc>,
    pub origin: Origin,
    pub domain: DomainName,
    pub intent: Intent,
    pub priority: Priority,
    pub payload: Value,
    pub constraints: BTreeSet<String>,
    pub deliver_to: Option<TargetSystemRef>,
    pub flags: TaskFlags,
    /// Task this one re-admits after an approved escalation.
    pub supersedes: Option<TaskId>,
    requires: Requirements,
    tier: ApprovalTier,
    escalation_path: Vec<AgentRole>,
    admission_digest: String,
}

#[derive(Serialize)]
struct AdmittedFields<'a> {
    task_id: &'a TaskId,
    created_at: &'a DateTime<Utc>,
    origin: Origin,
    domain: &'a DomainName,
    intent: Intent,
    priority: Priority,
    payload: &'a Value,
    constraints: &'a BTreeSet<String>,
    deliver_to: &'a Option<TargetSystemRef>,
    flags: &'a TaskFlags,
    supersedes: &'a Option<TaskId>,
}

impl TaskPackage {
    pub fn admit(candidate: TaskCandidate, checked: CheckedCandidate, requires: Requirements) -> Self {
        let mut package = Self {
            task_id: TaskId::new(),
            created_at: Utc::now(),
            origin: candidate.origin,
            domain: checked.domain,
            intent: candidate.intent,
            priority: candidate.priority,
            payload: candidate.payload,
            constraints: checked.constraints,
            deliver_to: checked.deliver_to,
            flags: candidate.flags,
            supersedes: None,
            requires: requires.closed(),
            tier: ApprovalTier::Worker,
            escalation_path: Vec::new(),
            admission_digest: String::new(),
        };
        package.admission_digest = package.compute_digest();
        package
    }

    /// Fresh Prime-originated package carrying the same work as `self`.
    ///
    /// The new package starts at tier 0 with an empty escalation path and
    /// keeps every requirement the original had accumulated.
    pub fn supersede(&self) -> Self {
        let mut package = Self {
            task_id: TaskId::new(),
            created_at: Utc::now(),
            origin: Origin::Prime,
            domain: self.domain.clone(),
            intent: self.intent,
            priority: self.priority,
            payload: self.payload.clone(),
            constraints: self.constraints.clone(),
            deliver_to: self.deliver_to.clone(),
            flags: self.flags,
            supersedes: Some(self.task_id),
            requires: self.requires,
            tier: ApprovalTier::Worker,
            escalation_path: Vec::new(),
            admission_digest: String::new(),
        };
        package.admission_digest = package.compute_digest();
        package
    }

    fn compute_digest(&self) -> String {
        digest_of(&AdmittedFields {
            task_id: &self.task_id,
            created_at: &self.created_at,
            origin: self.origin,
            domain: &self.domain,
            intent: self.intent,
            priority: self.priority,
            payload: &self.payload,
            constraints: &self.constraints,
            deliver_to: &self.deliver_to,
            flags: &self.flags,
            supersedes: &self.supersedes,
        })
    }

    pub fn requires(&self) -> Requirements {
        self.requires
    }

    pub fn tier(&self) -> ApprovalTier {
        self.tier
    }

    pub fn escalation_path(&self) -> &[AgentRole] {
        &self.escalation_path
    }

    pub fn admission_digest(&self) -> &str {
        &self.admission_digest
    }

    /// True when the admitted fields still hash to the admission digest.
    pub fn verify_integrity(&self) -> bool {
        self.compute_digest() == self.admission_digest
    }

    pub fn is_external(&self) -> bool {
        self.deliver_to.is_some()
    }

    pub fn gate_satisfied(&self) -> bool {
        self.tier >= self.requires.required_tier()
    }

    pub fn advance_tier(&mut self, to: ApprovalTier) -> Result<(), TierError> {
        if to < self.tier {
            return Err(TierError::Regression { from: self.tier, to });
        }
        self.tier = to;
        Ok(())
    }

    /// Append an escalation hop. Only upward escalations are recorded here.
    pub fn record_hop(&mut self, role: AgentRole) {
        self.escalation_path.push(role);
    }

    pub fn upgrade_requirements(&mut self, extra: Requirements) {
        self.requires = self.requires.union(extra);
    }
}
