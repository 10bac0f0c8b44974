// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Anomaly Detection (BC-5 Supervision Context)
//!
//! [`AnomalyDetector`] is a pure state machine over the audit stream. It is
//! fed entries in sequence order and reports each anomaly at most once per
//! task. It performs no I/O; the supervisor monitor decides what to do with
//! its findings.
//!
//! | Kind | Trigger | Halts |
//! |------|---------|-------|
//! | `EscalationSkip` | retry count reaches the bound, or work continues past it without an escalate | yes |
//! | `PrivilegeViolation` | decision outside the author's role whitelist, or unregistered author | yes |
//! | `RoutingLoop` | a role appears twice in a task's escalation path | yes |
//! | `GateBypass` | delivery of a human-gated task with no tier-3 approval on record | yes |
//! | `PendingHumanTimeout` | tier-3 approval window expired | no |
//! | `DomainDegraded` | Prime took over a governor's domain | no |

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::domain::agent::{AgentId, AgentRegistry, AgentRole};
use crate::domain::audit::{AuditEntry, Decision, SequenceNumber, ViolationFlag};
use crate::domain::policy::PolicyStore;
use crate::domain::task::{DomainName, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    EscalationSkip,
    PrivilegeViolation,
    RoutingLoop,
    GateBypass,
    PendingHumanTimeout,
    DomainDegraded,
}

impl AnomalyKind {
    pub fn halts(&self) -> bool {
        !matches!(self, AnomalyKind::PendingHumanTimeout | AnomalyKind::DomainDegraded)
    }

    pub fn flag(&self) -> ViolationFlag {
        match self {
            AnomalyKind::EscalationSkip => ViolationFlag::EscalationSkip,
            AnomalyKind::PrivilegeViolation => ViolationFlag::PrivilegeViolation,
            AnomalyKind::RoutingLoop => ViolationFlag::RoutingLoop,
            AnomalyKind::GateBypass => ViolationFlag::GateBypass,
            AnomalyKind::PendingHumanTimeout => ViolationFlag::PendingHumanTimeout,
            AnomalyKind::DomainDegraded => ViolationFlag::DomainDegraded,
        }
    }

    pub fn from_flag(flag: ViolationFlag) -> Option<Self> {
        match flag {
            ViolationFlag::EscalationSkip => Some(AnomalyKind::EscalationSkip),
            ViolationFlag::PrivilegeViolation => Some(AnomalyKind::PrivilegeViolation),
            ViolationFlag::RoutingLoop => Some(AnomalyKind::RoutingLoop),
            ViolationFlag::GateBypass => Some(AnomalyKind::GateBypass),
            ViolationFlag::PendingHumanTimeout => Some(AnomalyKind::PendingHumanTimeout),
            ViolationFlag::DomainDegraded => Some(AnomalyKind::DomainDegraded),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::EscalationSkip => "escalation_skip",
            AnomalyKind::PrivilegeViolation => "privilege_violation",
            AnomalyKind::RoutingLoop => "routing_loop",
            AnomalyKind::GateBypass => "gate_bypass",
            AnomalyKind::PendingHumanTimeout => "pending_human_timeout",
            AnomalyKind::DomainDegraded => "domain_degraded",
        }
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub task_id: Option<TaskId>,
    pub domain: Option<DomainName>,
    /// Author of the offending entry.
    pub agent_id: AgentId,
    /// Sequence of the offending entry.
    pub sequence: SequenceNumber,
    pub detail: String,
}

#[derive(Debug, Clone, Copy)]
pub struct DetectorConfig {
    /// Tasks tracked at once; the oldest is forgotten first.
    pub task_window: usize,
    /// Recent decisions remembered per agent.
    pub agent_window: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self { task_window: 4096, agent_window: 64 }
    }
}

#[derive(Debug, Default)]
struct TaskTrace {
    domain: Option<DomainName>,
    requires_human: bool,
    human_approved: bool,
    retries: HashMap<AgentId, u32>,
    failures: u32,
    escalated: bool,
    reported: BTreeSet<AnomalyKind>,
}

pub struct AnomalyDetector {
    policy: Arc<PolicyStore>,
    config: DetectorConfig,
    tasks: HashMap<TaskId, TaskTrace>,
    order: VecDeque<TaskId>,
    agents: HashMap<AgentId, VecDeque<(SequenceNumber, Decision)>>,
}

impl AnomalyDetector {
    pub fn new(policy: Arc<PolicyStore>, config: DetectorConfig) -> Self {
        Self { policy, config, tasks: HashMap::new(), order: VecDeque::new(), agents: HashMap::new() }
    }

    /// Recent `(sequence, decision)` pairs authored by `agent_id`.
    pub fn recent(&self, agent_id: AgentId) -> Vec<(SequenceNumber, Decision)> {
        self.agents.get(&agent_id).map(|w| w.iter().copied().collect()).unwrap_or_default()
    }

    pub fn tracked_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn observe(&mut self, entry: &AuditEntry, registry: &AgentRegistry) -> Vec<Anomaly> {
        let mut found = Vec::new();
        self.remember_agent(entry);

        let author = registry.get(entry.agent_id);
        let privilege = match &author {
            None => Some(format!("entry {} authored by unregistered agent {}", entry.sequence, entry.agent_id)),
            Some(record) if !record.role.permits(entry.decision) => Some(format!(
                "{} agent '{}' recorded '{}', which its role does not permit",
                record.role, record.name, entry.decision
            )),
            // A governor refusing foreign work is staying in its lane.
            Some(record)
                if record.role.is_domain_scoped()
                    && entry.domain.is_some()
                    && record.domain != entry.domain
                    && !entry.has_flag(ViolationFlag::OutOfLane) =>
            {
                Some(format!(
                    "{} agent '{}' acted on domain '{}' outside its lane",
                    record.role,
                    record.name,
                    entry.domain.as_ref().map(|d| d.as_str()).unwrap_or_default()
                ))
            }
            _ => None,
        };

        let Some(task_id) = entry.task_id else {
            if let Some(detail) = privilege {
                found.push(self.anomaly(AnomalyKind::PrivilegeViolation, entry, detail));
            }
            return found;
        };

        let bound = entry.domain.as_ref().map_or(crate::domain::policy::DEFAULT_MAX_ATTEMPTS, |d| self.policy.max_attempts(d));
        let is_human = author.as_ref().is_some_and(|a| a.role == AgentRole::Human);
        let mut candidates: Vec<(AnomalyKind, String)> = Vec::new();

        if let Some(detail) = privilege {
            candidates.push((AnomalyKind::PrivilegeViolation, detail));
        }
        if let Some(role) = first_revisit(&entry.escalation_path) {
            candidates.push((
                AnomalyKind::RoutingLoop,
                format!("role '{role}' appears twice in escalation path {:?}", entry.escalation_path),
            ));
        }

        let trace = self.track(task_id);
        if trace.domain.is_none() {
            trace.domain = entry.domain.clone();
        }
        match entry.decision {
            Decision::Admit => {
                trace.requires_human = entry.requires.is_some_and(|r| r.human_approval);
            }
            Decision::ApproveTier3 if is_human => trace.human_approved = true,
            Decision::Fail | Decision::OutputReject => {
                trace.failures += 1;
                if trace.failures > bound && !trace.escalated {
                    candidates.push((
                        AnomalyKind::EscalationSkip,
                        format!("{} failed attempts against a bound of {bound} with no escalation", trace.failures),
                    ));
                }
            }
            Decision::Retry => {
                let count = trace.retries.entry(entry.agent_id).or_insert(0);
                *count += 1;
                if *count >= bound {
                    candidates.push((
                        AnomalyKind::EscalationSkip,
                        format!("retry {} issued against a bound of {bound} attempts", *count),
                    ));
                }
            }
            Decision::Dispatch => {
                if trace.failures >= bound && !trace.escalated {
                    candidates.push((
                        AnomalyKind::EscalationSkip,
                        format!("dispatch after {} failed attempts without escalation", trace.failures),
                    ));
                }
            }
            Decision::Escalate => trace.escalated = true,
            Decision::Deliver => {
                if trace.requires_human && !trace.human_approved {
                    candidates.push((
                        AnomalyKind::GateBypass,
                        "delivery of a human-gated task without a recorded tier-3 approval".to_string(),
                    ));
                }
            }
            Decision::HumanTimeout => {
                candidates.push((AnomalyKind::PendingHumanTimeout, "tier-3 approval window expired".to_string()));
            }
            Decision::Takeover => {
                candidates.push((
                    AnomalyKind::DomainDegraded,
                    format!("prime took over a degraded governor: {}", entry.rationale),
                ));
            }
            _ => {}
        }

        let fresh: Vec<_> = candidates
            .into_iter()
            .filter(|(kind, _)| trace.reported.insert(*kind))
            .collect();
        for (kind, detail) in fresh {
            found.push(self.anomaly(kind, entry, detail));
        }

        if entry.decision == Decision::Retire {
            self.tasks.remove(&task_id);
            self.order.retain(|id| *id != task_id);
        }
        found
    }

    fn anomaly(&self, kind: AnomalyKind, entry: &AuditEntry, detail: String) -> Anomaly {
        Anomaly {
            kind,
            task_id: entry.task_id,
            domain: entry.domain.clone(),
            agent_id: entry.agent_id,
            sequence: entry.sequence,
            detail,
        }
    }

    fn track(&mut self, task_id: TaskId) -> &mut TaskTrace {
        if !self.tasks.contains_key(&task_id) {
            self.order.push_back(task_id);
            while self.order.len() > self.config.task_window {
                if let Some(evicted) = self.order.pop_front() {
                    self.tasks.remove(&evicted);
                }
            }
        }
        self.tasks.entry(task_id).or_default()
    }

    fn remember_agent(&mut self, entry: &AuditEntry) {
        let window = self.agents.entry(entry.agent_id).or_default();
        window.push_back((entry.sequence, entry.decision));
        while window.len() > self.config.agent_window {
            window.pop_front();
        }
    }
}

fn first_revisit(path: &[AgentRole]) -> Option<AgentRole> {
    let mut seen = BTreeSet::new();
    path.iter().copied().find(|role| !seen.insert(*role))
}
