// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Control plane assembly.
//!
//! Wires Prime, one governor per domain, the relay, the supervisor and the
//! shared services around a single [`SystemStateHandle`] and audit log, and
//! registers every agent so the supervisor can check authorship.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::application::audit_digest::AuditDigest;
use crate::application::governor::{GovernorEngine, OutputValidator};
use crate::application::held::CancellationRegistry;
use crate::application::relay_transport::RelayTransport;
use crate::application::router::{
    RestoreError, ResumeError, ResumeReport, SharedServices, SubmitError, TaskOutcome, TaskRouter,
};
use crate::application::supervisor_monitor::{Halter, MonitorConfig, SupervisorMonitor};
use crate::domain::agent::{Agent, AgentId, AgentRecord, AgentRegistry, RegistryError};
use crate::domain::anomaly::DetectorConfig;
use crate::domain::audit::{AuditEntry, SequenceNumber};
use crate::domain::governance_config::{GovernanceConfigManifest, RelayAdapterConfig, WorkerConfig};
use crate::domain::policy::{PolicyError, PolicyStore};
use crate::domain::relay::{RelayAdapter, TargetSystemRef, TransportError};
use crate::domain::repository::{AuditLog, AuditQueryError};
use crate::domain::system_state::{HaltRequest, HaltTransition, SystemState, SystemStateHandle};
use crate::domain::task::{DomainName, TaskCandidate, TaskId};
use crate::domain::worker::WorkerExecutor;
use crate::infrastructure::advisory_worker::AdvisoryWorker;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::human_approval_service::HumanApprovalService;
use crate::infrastructure::relay_adapters::{MemoryRelayAdapter, OutboxRelayAdapter};

#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    AuditQuery(#[from] AuditQueryError),
    #[error("domain '{0}' has no worker")]
    MissingWorker(DomainName),
}

pub struct ControlPlaneBuilder {
    policy: PolicyStore,
    audit: Arc<dyn AuditLog>,
    state: SystemStateHandle,
    workers: HashMap<DomainName, Arc<dyn WorkerExecutor>>,
    validators: HashMap<DomainName, Arc<dyn OutputValidator>>,
    relay_targets: Vec<(TargetSystemRef, Option<Value>, Arc<dyn RelayAdapter>)>,
    monitor: MonitorConfig,
}

impl ControlPlaneBuilder {
    pub fn new(policy: PolicyStore, audit: Arc<dyn AuditLog>) -> Self {
        Self {
            policy,
            audit,
            state: SystemStateHandle::default(),
            workers: HashMap::new(),
            validators: HashMap::new(),
            relay_targets: Vec::new(),
            monitor: MonitorConfig::default(),
        }
    }

    /// Start from a replayed state instead of `RUNNING`.
    pub fn with_state(mut self, state: SystemState) -> Self {
        self.state = SystemStateHandle::new(state);
        self
    }

    pub fn with_worker(mut self, domain: DomainName, worker: Arc<dyn WorkerExecutor>) -> Self {
        self.workers.insert(domain, worker);
        self
    }

    /// Replace the policy-derived output check for one domain.
    pub fn with_validator(mut self, domain: DomainName, validator: Arc<dyn OutputValidator>) -> Self {
        self.validators.insert(domain, validator);
        self
    }

    pub fn with_relay_target(
        mut self,
        target: TargetSystemRef,
        schema: Option<Value>,
        adapter: Arc<dyn RelayAdapter>,
    ) -> Self {
        self.relay_targets.push((target, schema, adapter));
        self
    }

    pub fn with_monitor_config(mut self, config: MonitorConfig) -> Self {
        self.monitor = config;
        self
    }

    pub fn build(mut self) -> Result<ControlPlane, ControlPlaneError> {
        let policy = Arc::new(self.policy);
        let registry = Arc::new(AgentRegistry::new());
        let events = Arc::new(EventBus::with_default_capacity());
        let supervisor = AgentRecord::supervisor("supervisor");
        let halter = Arc::new(Halter::new(supervisor.clone(), self.state.clone(), self.audit.clone(), events.clone()));

        let services = SharedServices {
            policy: policy.clone(),
            audit: self.audit.clone(),
            state: self.state.clone(),
            halter: halter.clone(),
            registry: registry.clone(),
            approvals: Arc::new(HumanApprovalService::new()),
            events: events.clone(),
            cancellations: Arc::new(CancellationRegistry::default()),
        };

        let mut governors = HashMap::new();
        for domain_policy in policy.domains() {
            let domain = domain_policy.name.clone();
            let worker = self.workers.remove(&domain).ok_or_else(|| ControlPlaneError::MissingWorker(domain.clone()))?;
            let mut governor = GovernorEngine::new(
                domain.clone(),
                worker,
                policy.clone(),
                self.audit.clone(),
                self.state.clone(),
                services.cancellations.clone(),
            )?;
            if let Some(validator) = self.validators.remove(&domain) {
                governor = governor.with_validator(validator);
            }
            registry.register(governor.record().clone())?;
            registry.register(governor.worker_record().clone())?;
            governors.insert(domain, Arc::new(governor));
        }

        let mut relay = RelayTransport::new(self.audit.clone());
        for (target, schema, adapter) in self.relay_targets {
            relay = relay.with_target(target, schema.as_ref(), adapter)?;
        }
        registry.register(relay.record().clone())?;
        registry.register(supervisor.clone())?;

        let prime = AgentRecord::prime("prime");
        registry.register(prime.clone())?;

        let monitor = SupervisorMonitor::new(
            supervisor,
            self.audit.clone(),
            registry.clone(),
            policy.clone(),
            halter,
            events,
            self.monitor,
        );
        let router = TaskRouter::new(prime, services.clone(), governors, Arc::new(relay));

        info!(domains = router.domains().count(), agents = registry.len(), "Control plane assembled");
        Ok(ControlPlane { router: Arc::new(router), supervisor: Arc::new(monitor), services })
    }
}

pub struct ControlPlane {
    router: Arc<TaskRouter>,
    supervisor: Arc<SupervisorMonitor>,
    services: SharedServices,
}

impl ControlPlane {
    pub fn builder(policy: PolicyStore, audit: Arc<dyn AuditLog>) -> ControlPlaneBuilder {
        ControlPlaneBuilder::new(policy, audit)
    }

    /// Build from a manifest, replaying any outstanding halt from `audit`.
    pub async fn from_manifest(
        manifest: &GovernanceConfigManifest,
        audit: Arc<dyn AuditLog>,
    ) -> Result<Self, ControlPlaneError> {
        let history = audit.range(SequenceNumber::FIRST, None).await?;
        let state = SystemState::replay(&history);

        let supervisor = &manifest.spec.supervisor;
        let mut builder = ControlPlaneBuilder::new(manifest.to_policy_store()?, audit)
            .with_state(state)
            .with_monitor_config(MonitorConfig {
                scan_interval: supervisor.scan_interval,
                detector: DetectorConfig { task_window: supervisor.task_window, agent_window: supervisor.agent_window },
            });

        for domain in &manifest.spec.domains {
            let worker: Arc<dyn WorkerExecutor> = match &domain.worker {
                WorkerConfig::Advisory { persona, role, criteria } => {
                    Arc::new(AdvisoryWorker::new(persona.clone(), role.clone()).with_criteria(criteria.clone()))
                }
            };
            builder = builder.with_worker(domain.name.clone(), worker);
        }
        for target in &manifest.spec.relay_targets {
            let adapter: Arc<dyn RelayAdapter> = match &target.adapter {
                RelayAdapterConfig::Outbox { path } => Arc::new(OutboxRelayAdapter::new(path.clone())),
                RelayAdapterConfig::Memory => Arc::new(MemoryRelayAdapter::new()),
            };
            builder = builder.with_relay_target(target.name.clone(), target.schema.clone(), adapter);
        }
        builder.build()
    }

    pub fn router(&self) -> &Arc<TaskRouter> {
        &self.router
    }

    pub fn supervisor(&self) -> &Arc<SupervisorMonitor> {
        &self.supervisor
    }

    pub fn state(&self) -> &SystemStateHandle {
        &self.services.state
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.services.events
    }

    pub fn approvals(&self) -> &Arc<HumanApprovalService> {
        &self.services.approvals
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.services.registry
    }

    pub fn audit(&self) -> &Arc<dyn AuditLog> {
        &self.services.audit
    }

    pub fn policy(&self) -> &Arc<PolicyStore> {
        &self.services.policy
    }

    /// Start periodic supervisor scans.
    pub fn spawn_supervisor(&self) -> tokio::task::JoinHandle<()> {
        self.supervisor.clone().start()
    }

    pub async fn submit(&self, candidate: TaskCandidate) -> Result<TaskOutcome, SubmitError> {
        self.router.submit(candidate).await
    }

    pub async fn resume(&self, reason: &str, approver: &AgentRecord) -> Result<ResumeReport, ResumeError> {
        self.router.resume(reason, approver).await
    }

    /// Hand a degraded domain back to its governor once the cause is fixed.
    pub async fn restore_domain(
        &self,
        domain: &DomainName,
        reason: &str,
        approver: &AgentRecord,
    ) -> Result<(), RestoreError> {
        self.router.restore_domain(domain, reason, approver).await?;
        self.supervisor.clear_degraded(domain);
        Ok(())
    }

    /// Operator-initiated halt, recorded under the supervisor's identity.
    pub async fn halt(&self, reason: &str) -> HaltTransition {
        self.services
            .halter
            .halt(HaltRequest { reason: reason.to_string(), anomaly: None, task_id: None, agent_id: None, trigger: None })
            .await
    }

    pub async fn task_history(&self, task_id: TaskId) -> Result<Vec<AuditEntry>, AuditQueryError> {
        self.services.audit.by_task(task_id).await
    }

    pub async fn agent_activity(&self, agent_id: AgentId, limit: usize) -> Result<Vec<AuditEntry>, AuditQueryError> {
        self.services.audit.by_agent(agent_id, limit).await
    }

    pub async fn audit_range(
        &self,
        from: SequenceNumber,
        to: Option<SequenceNumber>,
    ) -> Result<Vec<AuditEntry>, AuditQueryError> {
        self.services.audit.range(from, to).await
    }

    pub async fn digest(&self, window_days: u32) -> Result<AuditDigest, AuditQueryError> {
        AuditDigest::generate(self.services.audit.as_ref(), window_days, chrono::Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::audit::{AuditRecord, Decision};
    use crate::domain::governance_config::GovernanceConfigManifest;
    use crate::domain::task::{Intent, Priority};
    use crate::infrastructure::audit_log::InMemoryAuditLog;

    #[tokio::test]
    async fn test_default_manifest_builds_and_runs() {
        let audit = Arc::new(InMemoryAuditLog::new());
        let plane = ControlPlane::from_manifest(&GovernanceConfigManifest::default(), audit.clone()).await.unwrap();

        let outcome = plane
            .submit(TaskCandidate::new("codex", Intent::Analysis, Priority::Normal).with_payload(serde_json::json!({"topic": "retention"})))
            .await
            .unwrap();
        assert!(matches!(outcome, TaskOutcome::Approved { .. }));

        let report = plane.supervisor().scan_once().await.unwrap();
        assert!(report.anomalies.is_empty(), "unexpected anomalies: {:?}", report.anomalies);
        assert!(!plane.state().is_halted());
    }

    #[tokio::test]
    async fn test_outstanding_halt_is_replayed() {
        let audit = Arc::new(InMemoryAuditLog::new());
        audit
            .append(AuditRecord::new(AgentId::named("supervisor"), Decision::Halt).rationale("operator stop"))
            .await
            .unwrap();

        let plane = ControlPlane::from_manifest(&GovernanceConfigManifest::default(), audit).await.unwrap();
        assert!(plane.state().is_halted());
    }

    #[tokio::test]
    async fn test_missing_worker_is_an_error() {
        let codex = DomainName::parse("codex").unwrap();
        let policy = PolicyStore::new().with_domain(crate::domain::policy::DomainPolicy::new(codex)).unwrap();
        let result = ControlPlane::builder(policy, Arc::new(InMemoryAuditLog::new())).build();
        assert!(matches!(result, Err(ControlPlaneError::MissingWorker(_))));
    }
}
