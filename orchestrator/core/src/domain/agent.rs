// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Roles and Registry (BC-2 Agent Context)
//!
//! Every actor that writes to the audit log is an agent with exactly one
//! role. The role fixes two things:
//!
//! - its capability set, checked by the component acting for it
//! - its decision whitelist, checked by the supervisor against the audit log
//!
//! | Role | Domain-scoped | May decide |
//! |------|---------------|------------|
//! | Prime | no | admit, route, escalation review, tier-2 approval, retire |
//! | Governor | yes | validate, dispatch, retry, output verdicts, escalate |
//! | Worker | yes | produce, fail |
//! | Relay | optional | deliver, delivery-failed |
//! | Supervisor | no | anomaly, halt |
//! | Human | no | tier-3 approval, human reject, resume |

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::audit::Decision;
use crate::domain::task::DomainName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Stable id derived from a name, so a restarted process re-registers
    /// the same agents under the same ids.
    pub fn named(name: &str) -> Self {
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for AgentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Prime,
    Governor,
    Worker,
    Relay,
    Supervisor,
    Human,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Admit,
    Route,
    ReviewEscalation,
    FinalApprove,
    Validate,
    Dispatch,
    Execute,
    Deliver,
    Monitor,
    Halt,
    HumanApprove,
    Resume,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Prime => "prime",
            AgentRole::Governor => "governor",
            AgentRole::Worker => "worker",
            AgentRole::Relay => "relay",
            AgentRole::Supervisor => "supervisor",
            AgentRole::Human => "human",
        }
    }

    pub fn capabilities(&self) -> &'static [Capability] {
        use Capability::*;
        match self {
            AgentRole::Prime => &[Admit, Route, ReviewEscalation, FinalApprove],
            AgentRole::Governor => &[Validate, Dispatch],
            AgentRole::Worker => &[Execute],
            AgentRole::Relay => &[Deliver],
            AgentRole::Supervisor => &[Monitor, Halt],
            AgentRole::Human => &[HumanApprove, Resume],
        }
    }

    /// Whether an agent of this role may author an audit entry with `decision`.
    pub fn permits(&self, decision: Decision) -> bool {
        use Decision::*;
        match self {
            AgentRole::Prime => matches!(
                decision,
                Admit
                    | Route
                    | Approve
                    | Reject
                    | DeferToHuman
                    | ApproveTier2
                    | HumanTimeout
                    | Hold
                    | Cancel
                    | Takeover
                    | Retire
            ),
            AgentRole::Governor => matches!(
                decision,
                ValidateAccept | ValidateReject | Dispatch | Retry | OutputAccept | OutputReject | Escalate | Hold | Discard
            ),
            AgentRole::Worker => matches!(decision, Produce | Fail),
            AgentRole::Relay => matches!(decision, Deliver | DeliveryFailed),
            AgentRole::Supervisor => matches!(decision, Anomaly | Halt),
            AgentRole::Human => matches!(decision, ApproveTier3 | HumanReject | Resume | Restore),
        }
    }

    pub fn is_domain_scoped(&self) -> bool {
        matches!(self, AgentRole::Governor | AgentRole::Worker)
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub name: String,
    pub role: AgentRole,
    pub domain: Option<DomainName>,
    pub capabilities: BTreeSet<Capability>,
}

impl AgentRecord {
    pub fn new(name: impl Into<String>, role: AgentRole, domain: Option<DomainName>) -> Self {
        let name = name.into();
        let key = match &domain {
            Some(domain) => format!("{}:{}:{}", role.as_str(), domain, name),
            None => format!("{}:{}", role.as_str(), name),
        };
        Self {
            id: AgentId::named(&key),
            name,
            role,
            domain,
            capabilities: role.capabilities().iter().copied().collect(),
        }
    }

    pub fn prime(name: impl Into<String>) -> Self {
        Self::new(name, AgentRole::Prime, None)
    }

    pub fn governor(name: impl Into<String>, domain: DomainName) -> Self {
        Self::new(name, AgentRole::Governor, Some(domain))
    }

    pub fn worker(name: impl Into<String>, domain: DomainName) -> Self {
        Self::new(name, AgentRole::Worker, Some(domain))
    }

    pub fn relay(name: impl Into<String>) -> Self {
        Self::new(name, AgentRole::Relay, None)
    }

    pub fn supervisor(name: impl Into<String>) -> Self {
        Self::new(name, AgentRole::Supervisor, None)
    }

    pub fn human(name: impl Into<String>) -> Self {
        Self::new(name, AgentRole::Human, None)
    }

    pub fn can(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Anything acting as an agent exposes its registry record.
pub trait Agent: Send + Sync {
    fn record(&self) -> &AgentRecord;

    fn agent_id(&self) -> AgentId {
        self.record().id
    }

    fn role(&self) -> AgentRole {
        self.record().role
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("{role} agent '{name}' must be bound to a domain")]
    DomainRequired { role: AgentRole, name: String },
    #[error("{role} agent '{name}' cannot be bound to a domain")]
    DomainForbidden { role: AgentRole, name: String },
    #[error("agent {0} is registered with a different role")]
    RoleConflict(AgentId),
}

/// Agent directory consulted by the supervisor's privilege check.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<AgentId, AgentRecord>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent. Re-registering the same record is a no-op.
    pub fn register(&self, record: AgentRecord) -> Result<(), RegistryError> {
        match (record.role.is_domain_scoped(), record.domain.is_some()) {
            (true, false) => {
                return Err(RegistryError::DomainRequired { role: record.role, name: record.name });
            }
            (false, true) if record.role != AgentRole::Relay => {
                return Err(RegistryError::DomainForbidden { role: record.role, name: record.name });
            }
            _ => {}
        }

        let mut agents = self.agents.write();
        if let Some(existing) = agents.get(&record.id) {
            if existing.role != record.role {
                return Err(RegistryError::RoleConflict(record.id));
            }
        }
        agents.insert(record.id, record);
        Ok(())
    }

    pub fn get(&self, id: AgentId) -> Option<AgentRecord> {
        self.agents.read().get(&id).cloned()
    }

    pub fn list(&self) -> Vec<AgentRecord> {
        let mut agents: Vec<_> = self.agents.read().values().cloned().collect();
        agents.sort_by(|a, b| a.role.cmp(&b.role).then_with(|| a.name.cmp(&b.name)));
        agents
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_ids_are_stable() {
        let a = AgentRecord::governor("codex-governor", DomainName::parse("codex").unwrap());
        let b = AgentRecord::governor("codex-governor", DomainName::parse("codex").unwrap());
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, AgentRecord::prime("codex-governor").id);
    }

    #[test]
    fn test_decision_whitelists() {
        assert!(AgentRole::Governor.permits(Decision::Escalate));
        assert!(!AgentRole::Governor.permits(Decision::ApproveTier2));
        assert!(!AgentRole::Worker.permits(Decision::Deliver));
        assert!(AgentRole::Human.permits(Decision::ApproveTier3));
        assert!(!AgentRole::Prime.permits(Decision::ApproveTier3));
        assert!(!AgentRole::Prime.permits(Decision::Resume));
        assert!(AgentRole::Human.permits(Decision::Restore));
        assert!(!AgentRole::Governor.permits(Decision::Restore));
    }

    #[test]
    fn test_registry_scoping_rules() {
        let registry = AgentRegistry::new();
        let unscoped_worker = AgentRecord::new("w", AgentRole::Worker, None);
        assert!(matches!(
            registry.register(unscoped_worker),
            Err(RegistryError::DomainRequired { .. })
        ));

        let scoped_prime = AgentRecord::new("p", AgentRole::Prime, Some(DomainName::parse("codex").unwrap()));
        assert!(matches!(
            registry.register(scoped_prime),
            Err(RegistryError::DomainForbidden { .. })
        ));

        let human = AgentRecord::human("operator");
        registry.register(human.clone()).unwrap();
        registry.register(human.clone()).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(human.id).unwrap().role, AgentRole::Human);
    }

    #[test]
    fn test_capabilities_follow_role() {
        let human = AgentRecord::human("operator");
        assert!(human.can(Capability::Resume));
        assert!(!AgentRecord::prime("prime").can(Capability::Resume));
    }
}
