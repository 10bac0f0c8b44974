// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Task Router (Prime)
//!
//! The single routing and approval authority. Prime admits candidates,
//! routes them to the governor of their domain, reviews escalations, grants
//! tier-2 approval, forwards tier-3 gates to a human, and drives REALIGN
//! after a human-approved resume.
//!
//! ## Pipeline
//!
//! ```text
//! admit ─► route ─► governor ─► final approve ─┬─► retire (approved)
//!                      │             │         └─► relay ─► retire (delivered)
//!                      ▼             ▼
//!               review escalation   human gate (tier 3)
//!               ├─ approve ─► supersede ─► admit (origin = prime)
//!               ├─ reject ──► retire
//!               └─ defer ───► human gate
//! ```
//!
//! ## One decision per gate
//!
//! Escalation review and final approval for a task are serialized through a
//! per-task ledger. A second call for the same task returns the recorded
//! decision instead of deciding again.
//!
//! ## Prime faults
//!
//! Prime never proceeds past a failed audit write. The failure halts the
//! system and only a human resume re-arms it.

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::application::governor::{DispatchOutcome, GovernorEngine, GovernorError};
use crate::application::held::{CancellationRegistry, HeldQueue, HeldStage, HeldTask};
use crate::application::relay_transport::RelayTransport;
use crate::application::supervisor_monitor::Halter;
use crate::domain::agent::{Agent, AgentRecord, AgentRegistry, AgentRole, RegistryError};
use crate::domain::audit::{AuditEntry, AuditRecord, Decision, SequenceNumber, ViolationFlag};
use crate::domain::escalation::{EscalationCause, EscalationRequest, EscalationVerdict};
use crate::domain::events::GovernanceEvent;
use crate::domain::policy::PolicyStore;
use crate::domain::recovery::{plan_reset, ResetPlan};
use crate::domain::relay::{DeliveryReceipt, TransportError};
use crate::domain::repository::{AuditLog, AuditQueryError, AuditWriteError};
use crate::domain::system_state::{DispatchPermit, HaltRequest, HaltedError, SystemState, SystemStateHandle};
use crate::domain::task::{
    ApprovalTier, DomainName, Origin, Priority, SchemaError, TaskCandidate, TaskId, TaskPackage, TierError,
};
use crate::domain::worker::Artifact;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::human_approval_service::{HumanApprovalService, HumanApprovalStatus};

/// Rationale prefix of `retire` entries; the outcome label follows it.
pub const RETIRED_PREFIX: &str = "retired: ";

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("no governor is registered for domain '{0}'")]
    DomainUnknown(String),
    #[error("delivery target '{0}' is not registered")]
    UnknownTarget(String),
    #[error(transparent)]
    Halted(#[from] HaltedError),
    #[error(transparent)]
    AuditWrite(#[from] AuditWriteError),
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Halted(#[from] HaltedError),
    #[error("no governor is registered for domain '{0}'")]
    DomainUnknown(DomainName),
    #[error(transparent)]
    Governor(#[from] GovernorError),
    #[error(transparent)]
    Tier(#[from] TierError),
    #[error(transparent)]
    AuditWrite(#[from] AuditWriteError),
    #[error("task {0} is not live")]
    UnknownTask(TaskId),
}

#[derive(Debug, Error)]
pub enum ResumeError {
    #[error("agent '{name}' has role {role}; only a human operator may resume")]
    NotHumanTier { name: String, role: AgentRole },
    #[error("system is not halted")]
    NotHalted,
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    AuditQuery(#[from] AuditQueryError),
    #[error(transparent)]
    AuditWrite(#[from] AuditWriteError),
}

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("agent '{name}' has role {role}; only a human operator may restore a domain")]
    NotHumanTier { name: String, role: AgentRole },
    #[error("no governor is registered for domain '{0}'")]
    DomainUnknown(DomainName),
    #[error("domain '{0}' is not degraded")]
    NotDegraded(DomainName),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    AuditWrite(#[from] AuditWriteError),
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Route(#[from] RouteError),
}

/// Result of the tier-2/tier-3 gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalDecision {
    Approved,
    Rejected { reason: String },
    /// No human answered in time. The task stays pending; nothing is approved.
    PendingHumanTimeout,
    /// The operator cancelled the task while the request was open.
    Withdrawn,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Delivered { receipt: DeliveryReceipt },
    /// Approved with no external delivery.
    Approved { artifact_digest: String },
    Rejected { reason: String },
    Superseded { by: TaskId, outcome: Box<TaskOutcome> },
    PendingHumanTimeout,
    Held,
    Cancelled,
    DeliveryFailed { reason: String },
    TakenOver { reason: String },
}

impl TaskOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TaskOutcome::Delivered { .. } => "delivered",
            TaskOutcome::Approved { .. } => "approved",
            TaskOutcome::Rejected { .. } => "rejected",
            TaskOutcome::Superseded { .. } => "superseded",
            TaskOutcome::PendingHumanTimeout => "pending-human-timeout",
            TaskOutcome::Held => "held",
            TaskOutcome::Cancelled => "cancelled",
            TaskOutcome::DeliveryFailed { .. } => "delivery-failed",
            TaskOutcome::TakenOver { .. } => "taken-over",
        }
    }

    /// Outcome of the last task in a supersede chain.
    pub fn terminal(&self) -> &TaskOutcome {
        match self {
            TaskOutcome::Superseded { outcome, .. } => outcome.terminal(),
            other => other,
        }
    }
}

#[derive(Debug)]
pub struct ResumeReport {
    pub approver: AgentRecord,
    pub plan: ResetPlan,
    pub requeued: Vec<TaskId>,
    pub discarded: Vec<TaskId>,
    /// One handle per requeued task, resolving to its outcome.
    pub continuations: Vec<tokio::task::JoinHandle<Result<TaskOutcome, RouteError>>>,
}

#[derive(Debug, Default)]
struct GateLedger {
    escalation: Option<EscalationVerdict>,
    final_decision: Option<FinalDecision>,
}

/// Collaborators shared by Prime, the governors and the supervisor.
#[derive(Clone)]
pub struct SharedServices {
    pub policy: Arc<PolicyStore>,
    pub audit: Arc<dyn AuditLog>,
    pub state: SystemStateHandle,
    pub halter: Arc<Halter>,
    pub registry: Arc<AgentRegistry>,
    pub approvals: Arc<HumanApprovalService>,
    pub events: Arc<EventBus>,
    pub cancellations: Arc<CancellationRegistry>,
}

pub struct TaskRouter {
    record: AgentRecord,
    services: SharedServices,
    governors: HashMap<DomainName, Arc<GovernorEngine>>,
    relay: Arc<RelayTransport>,
    gates: DashMap<TaskId, Arc<tokio::sync::Mutex<GateLedger>>>,
    held: HeldQueue,
}

impl Agent for TaskRouter {
    fn record(&self) -> &AgentRecord {
        &self.record
    }
}

impl TaskRouter {
    pub fn new(
        record: AgentRecord,
        services: SharedServices,
        governors: HashMap<DomainName, Arc<GovernorEngine>>,
        relay: Arc<RelayTransport>,
    ) -> Self {
        Self { record, services, governors, relay, gates: DashMap::new(), held: HeldQueue::default() }
    }

    pub fn governor(&self, domain: &DomainName) -> Option<&Arc<GovernorEngine>> {
        self.governors.get(domain)
    }

    pub fn domains(&self) -> impl Iterator<Item = &DomainName> {
        self.governors.keys()
    }

    pub fn held_count(&self) -> usize {
        self.held.len() + self.governors.values().map(|g| g.held_count()).sum::<usize>()
    }

    /// Append on Prime's behalf. A failed write is a Prime fault and halts.
    async fn log(&self, record: AuditRecord) -> Result<AuditEntry, AuditWriteError> {
        let task_id = record.task_id;
        let result = self.services.audit.append(record).await;
        self.checked(task_id, result).await
    }

    /// Same as [`Self::log`], releasing the permit before any halt so the
    /// halter can take the write guard.
    async fn log_dispatch(&self, permit: DispatchPermit, record: AuditRecord) -> Result<AuditEntry, AuditWriteError> {
        let task_id = record.task_id;
        let result = self.services.audit.append(record).await;
        drop(permit);
        self.checked(task_id, result).await
    }

    async fn checked(
        &self,
        task_id: Option<TaskId>,
        result: Result<AuditEntry, AuditWriteError>,
    ) -> Result<AuditEntry, AuditWriteError> {
        let e = match result {
            Ok(entry) => return Ok(entry),
            Err(e) => e,
        };
        error!(error = %e, task_id = ?task_id, "Prime could not write to the audit log");
        self.services
            .halter
            .halt(HaltRequest {
                reason: format!("prime audit write failed: {e}"),
                anomaly: None,
                task_id,
                agent_id: Some(self.record.id),
                trigger: None,
            })
            .await;
        Err(e)
    }

    fn gate(&self, task_id: TaskId) -> Arc<tokio::sync::Mutex<GateLedger>> {
        self.gates.entry(task_id).or_default().clone()
    }

    async fn reject_candidate(&self, candidate: &TaskCandidate, reason: String) -> Result<(), AuditWriteError> {
        warn!(domain = %candidate.domain, reason = %reason, "Admission rejected");
        let mut record = AuditRecord::new(self.record.id, Decision::Reject).rationale(format!("admission: {reason}"));
        if let Ok(domain) = DomainName::parse(&candidate.domain) {
            record = record.domain(domain);
        }
        self.log(record).await.map(|_| ())
    }

    /// Validate a candidate, compute its requirements and admit it.
    pub async fn admit(&self, candidate: TaskCandidate) -> Result<TaskPackage, AdmissionError> {
        if let SystemState::Halted(halt) = self.services.state.snapshot() {
            debug!(domain = %candidate.domain, "Admission refused while halted");
            return Err(HaltedError::from(&halt).into());
        }

        let checked = match candidate.check_schema() {
            Ok(checked) => checked,
            Err(e) => {
                self.reject_candidate(&candidate, e.to_string()).await?;
                return Err(e.into());
            }
        };
        if !self.governors.contains_key(&checked.domain) {
            self.reject_candidate(&candidate, format!("unknown domain '{}'", checked.domain)).await?;
            return Err(AdmissionError::DomainUnknown(checked.domain.to_string()));
        }
        if let Some(target) = checked.deliver_to.as_ref().filter(|t| !self.relay.knows(t)) {
            self.reject_candidate(&candidate, format!("unknown delivery target '{target}'")).await?;
            return Err(AdmissionError::UnknownTarget(target.to_string()));
        }

        let permit = self.services.state.begin_dispatch().await?;
        let requires = self.services.policy.requirements_for(
            &checked.domain,
            candidate.intent,
            candidate.priority,
            &candidate.flags,
            checked.deliver_to.is_some(),
        );
        let task = TaskPackage::admit(candidate, checked, requires);
        self.log_dispatch(
            permit,
            AuditRecord::for_task(&task, self.record.id, Decision::Admit)
                .requires(task.requires())
                .input_digest(task.admission_digest())
                .rationale(format!("{} {} task admitted at {} priority", task.domain, task.intent, task.priority.as_str())),
        )
        .await?;
        self.services.cancellations.register(task.task_id);

        metrics::counter!("codex_tasks_admitted_total", "domain" => task.domain.to_string()).increment(1);
        self.services.events.publish(GovernanceEvent::TaskAdmitted {
            task_id: task.task_id,
            domain: task.domain.clone(),
            requires: task.requires(),
            admitted_at: task.created_at,
        });
        info!(task_id = %task.task_id, domain = %task.domain, requires = ?task.requires(), "Task admitted");
        Ok(task)
    }

    /// Hand an admitted task to its domain's governor.
    pub async fn route(&self, task: &TaskPackage) -> Result<DispatchOutcome, RouteError> {
        let governor = self
            .governors
            .get(&task.domain)
            .cloned()
            .ok_or_else(|| RouteError::DomainUnknown(task.domain.clone()))?;

        let permit = self.services.state.begin_dispatch().await?;
        self.log_dispatch(
            permit,
            AuditRecord::for_task(task, self.record.id, Decision::Route)
                .input_digest(task.admission_digest())
                .rationale(format!("routed to governor '{}'", governor.record().name)),
        )
        .await?;
        debug!(task_id = %task.task_id, domain = %task.domain, "Task routed");

        governor.process(task).await.map_err(RouteError::from)
    }

    /// Admit then run to a terminal outcome.
    pub async fn submit(&self, candidate: TaskCandidate) -> Result<TaskOutcome, SubmitError> {
        let task = self.admit(candidate).await?;
        Ok(self.run(task).await?)
    }

    /// Drive an admitted task through the pipeline.
    pub fn run(&self, task: TaskPackage) -> BoxFuture<'_, Result<TaskOutcome, RouteError>> {
        Box::pin(async move {
            match self.route(&task).await {
                Ok(outcome) => self.after_dispatch(task, outcome).await,
                Err(RouteError::Governor(err)) => self.governor_failed(&task, err).await,
                Err(RouteError::Halted(_)) => self.hold(task, HeldStage::AwaitingRoute).await,
                Err(other) => {
                    self.forget(task.task_id);
                    Err(other)
                }
            }
        })
    }

    async fn after_dispatch(&self, task: TaskPackage, outcome: DispatchOutcome) -> Result<TaskOutcome, RouteError> {
        match outcome {
            DispatchOutcome::Completed { artifact, attempts } => {
                debug!(task_id = %task.task_id, attempts, "Governor completed task");
                self.approve_and_deliver(task, artifact).await
            }
            DispatchOutcome::Escalated(request) => self.handle_escalation(*request).await,
            DispatchOutcome::Held => Ok(TaskOutcome::Held),
            DispatchOutcome::Cancelled => self.conclude(&task, TaskOutcome::Cancelled).await,
        }
    }

    /// Validation refusals end the task. Anything else is a governor fault:
    /// Prime takes the task over and the domain is reported degraded.
    async fn governor_failed(&self, task: &TaskPackage, err: GovernorError) -> Result<TaskOutcome, RouteError> {
        if err.is_rejection() {
            return self.conclude(task, TaskOutcome::Rejected { reason: err.to_string() }).await;
        }

        let reason = format!("governor for '{}' failed: {err}", task.domain);
        self.log(
            AuditRecord::for_task(task, self.record.id, Decision::Takeover)
                .rationale(reason.clone())
                .flag(ViolationFlag::DomainDegraded),
        )
        .await?;
        self.services.events.publish(GovernanceEvent::DomainDegraded {
            domain: task.domain.clone(),
            reason: reason.clone(),
            degraded_at: chrono::Utc::now(),
        });
        warn!(task_id = %task.task_id, domain = %task.domain, error = %err, "Prime took over task from degraded governor");
        self.conclude(task, TaskOutcome::TakenOver { reason }).await
    }

    async fn handle_escalation(&self, request: EscalationRequest) -> Result<TaskOutcome, RouteError> {
        let mut task = request.task.clone();
        self.services.events.publish(GovernanceEvent::EscalationRaised {
            task_id: task.task_id,
            domain: task.domain.clone(),
            cause: match &request.cause {
                EscalationCause::RetriesExhausted => "retries_exhausted".to_string(),
                EscalationCause::OutOfLane { reason } => format!("out_of_lane: {reason}"),
            },
            attempts: request.failure_history.len(),
            raised_at: chrono::Utc::now(),
        });

        match self.review_escalation(&mut task, &request).await? {
            EscalationVerdict::Approve => self.supersede(&task).await,
            EscalationVerdict::Reject => {
                let reason = format!("escalation rejected after {} attempt(s)", request.failure_history.len());
                self.conclude(&task, TaskOutcome::Rejected { reason }).await
            }
            EscalationVerdict::DeferToHuman => {
                let prompt = format!(
                    "Task {} in '{}' escalated after {} failed attempt(s). Approve a fresh attempt?",
                    task.task_id,
                    task.domain,
                    request.failure_history.len()
                );
                match self.ask_human(&task, prompt, None).await? {
                    FinalDecision::Approved => self.supersede(&task).await,
                    FinalDecision::Rejected { reason } => self.conclude(&task, TaskOutcome::Rejected { reason }).await,
                    FinalDecision::PendingHumanTimeout => Ok(self.left_pending(&task)),
                    FinalDecision::Withdrawn => self.conclude(&task, TaskOutcome::Cancelled).await,
                }
            }
        }
    }

    /// Decide an escalation. At most one verdict is recorded per task.
    pub async fn review_escalation(
        &self,
        task: &mut TaskPackage,
        request: &EscalationRequest,
    ) -> Result<EscalationVerdict, RouteError> {
        let gate = self.gate(task.task_id);
        let mut ledger = gate.lock().await;
        if let Some(verdict) = ledger.escalation {
            return Ok(verdict);
        }

        let (verdict, rationale) = if let EscalationCause::OutOfLane { reason } = &request.cause {
            (EscalationVerdict::Reject, format!("out-of-lane requests are not re-routed: {reason}"))
        } else if task.origin == Origin::Prime && task.supersedes.is_some() {
            (EscalationVerdict::Reject, "superseding task escalated again".to_string())
        } else if task.requires().human_approval || task.priority == Priority::Critical {
            (EscalationVerdict::DeferToHuman, "human-gated task; deferring escalation to a human".to_string())
        } else if request.is_systematic() {
            (EscalationVerdict::Reject, "failures are systematic; a fresh attempt would fail the same way".to_string())
        } else {
            (EscalationVerdict::Approve, "transient failures; superseding with a fresh admission".to_string())
        };

        let decision = match verdict {
            EscalationVerdict::Approve => Decision::Approve,
            EscalationVerdict::Reject => Decision::Reject,
            EscalationVerdict::DeferToHuman => {
                task.record_hop(AgentRole::Prime);
                Decision::DeferToHuman
            }
        };
        self.log(
            AuditRecord::for_task(task, self.record.id, decision)
                .rationale(rationale)
                .related(None, Some(request.governor)),
        )
        .await?;

        info!(task_id = %task.task_id, verdict = ?verdict, "Escalation reviewed");
        ledger.escalation = Some(verdict);
        Ok(verdict)
    }

    async fn supersede(&self, task: &TaskPackage) -> Result<TaskOutcome, RouteError> {
        let successor = task.supersede();
        let permit = self.services.state.begin_dispatch().await?;
        self.log_dispatch(
            permit,
            AuditRecord::for_task(&successor, self.record.id, Decision::Admit)
                .requires(successor.requires())
                .input_digest(successor.admission_digest())
                .rationale(format!("supersedes task {}", task.task_id)),
        )
        .await?;
        self.services.cancellations.register(successor.task_id);
        self.log(
            AuditRecord::for_task(task, self.record.id, Decision::Retire)
                .rationale(format!("superseded by task {}", successor.task_id)),
        )
        .await?;
        self.forget(task.task_id);

        info!(task_id = %task.task_id, successor = %successor.task_id, "Task superseded");
        let by = successor.task_id;
        let outcome = self.run(successor).await?;
        Ok(TaskOutcome::Superseded { by, outcome: Box::new(outcome) })
    }

    /// Tier-2 approval, and the tier-3 human gate when the task requires it.
    pub async fn final_approve(&self, task: &mut TaskPackage, artifact: &Artifact) -> Result<FinalDecision, RouteError> {
        let gate = self.gate(task.task_id);
        let mut ledger = gate.lock().await;
        if let Some(decision) = &ledger.final_decision {
            return Ok(decision.clone());
        }

        let digest = artifact.digest();
        let refusal = if artifact.task_id != task.task_id {
            Some(format!("artifact belongs to task {}", artifact.task_id))
        } else if !task.verify_integrity() {
            Some("task was altered after admission".to_string())
        } else {
            None
        };
        if let Some(reason) = refusal {
            self.log(
                AuditRecord::for_task(task, self.record.id, Decision::Reject)
                    .output_digest(digest)
                    .rationale(reason.clone())
                    .flag(ViolationFlag::ConstraintTamper),
            )
            .await?;
            let decision = FinalDecision::Rejected { reason };
            ledger.final_decision = Some(decision.clone());
            return Ok(decision);
        }

        task.advance_tier(ApprovalTier::GovernorReviewed)?;
        task.advance_tier(ApprovalTier::PrimeApproved)?;
        self.log(
            AuditRecord::for_task(task, self.record.id, Decision::ApproveTier2)
                .output_digest(digest.clone())
                .rationale("governor-accepted output approved by prime"),
        )
        .await?;

        let decision = if task.requires().human_approval {
            let prompt = format!(
                "Task {} ({} {}) needs tier-3 approval of output {}",
                task.task_id, task.domain, task.intent, digest
            );
            let decision = self.ask_human(task, prompt, Some(&digest)).await?;
            if decision == FinalDecision::Approved {
                task.advance_tier(ApprovalTier::HumanApproved)?;
            }
            decision
        } else {
            FinalDecision::Approved
        };

        ledger.final_decision = Some(decision.clone());
        Ok(decision)
    }

    /// Wait for a human decision and record it under the human's identity.
    async fn ask_human(&self, task: &TaskPackage, prompt: String, digest: Option<&str>) -> Result<FinalDecision, RouteError> {
        let timeout = self.services.policy.human_approval_timeout();
        // Escalation deferrals are already logged by the review.
        if let Some(digest) = digest {
            self.log(
                AuditRecord::for_task(task, self.record.id, Decision::DeferToHuman)
                    .output_digest(digest)
                    .rationale(format!("awaiting human decision for up to {}s", timeout.as_secs())),
            )
            .await?;
        }
        let ticket = self.services.approvals.open_request(task.task_id, prompt.clone(), timeout).await;
        self.services.events.publish(GovernanceEvent::HumanApprovalRequested {
            task_id: task.task_id,
            request_id: ticket.info.id,
            prompt,
            requested_at: ticket.info.created_at,
        });

        let status = self.services.approvals.await_decision(ticket).await;
        let with_digest = |record: AuditRecord| match digest {
            Some(d) => record.output_digest(d),
            None => record,
        };

        match status {
            HumanApprovalStatus::Approved { approver, feedback, .. } => {
                self.register_approver(&approver);
                self.log(with_digest(
                    AuditRecord::for_task(task, approver.id, Decision::ApproveTier3)
                        .rationale(feedback.unwrap_or_else(|| format!("approved by {}", approver.name))),
                ))
                .await?;
                info!(task_id = %task.task_id, approver = %approver.name, "Human approval recorded");
                Ok(FinalDecision::Approved)
            }
            HumanApprovalStatus::Rejected { approver, reason, .. } => {
                self.register_approver(&approver);
                self.log(with_digest(
                    AuditRecord::for_task(task, approver.id, Decision::HumanReject).rationale(reason.clone()),
                ))
                .await?;
                info!(task_id = %task.task_id, approver = %approver.name, "Human rejection recorded");
                Ok(FinalDecision::Rejected { reason })
            }
            HumanApprovalStatus::TimedOut { .. } => {
                self.log(
                    AuditRecord::for_task(task, self.record.id, Decision::HumanTimeout)
                        .rationale(format!("no human decision within {}s; task stays pending", timeout.as_secs()))
                        .flag(ViolationFlag::PendingHumanTimeout),
                )
                .await?;
                warn!(task_id = %task.task_id, "Human approval timed out");
                Ok(FinalDecision::PendingHumanTimeout)
            }
            HumanApprovalStatus::Withdrawn { .. } => {
                debug!(task_id = %task.task_id, "Approval request withdrawn by cancellation");
                Ok(FinalDecision::Withdrawn)
            }
        }
    }

    fn register_approver(&self, approver: &AgentRecord) {
        if let Err(e) = self.services.registry.register(approver.clone()) {
            warn!(approver = %approver.name, error = %e, "Approver could not be registered");
        }
    }

    async fn approve_and_deliver(&self, mut task: TaskPackage, artifact: Artifact) -> Result<TaskOutcome, RouteError> {
        if self.services.cancellations.is_cancelled(task.task_id) {
            return self.conclude(&task, TaskOutcome::Cancelled).await;
        }
        if self.services.state.is_halted() {
            return self.hold(task, HeldStage::AwaitingFinalApproval { artifact }).await;
        }

        match self.final_approve(&mut task, &artifact).await? {
            FinalDecision::Approved => {}
            FinalDecision::Rejected { reason } => return self.conclude(&task, TaskOutcome::Rejected { reason }).await,
            FinalDecision::PendingHumanTimeout => return Ok(self.left_pending(&task)),
            FinalDecision::Withdrawn => return self.conclude(&task, TaskOutcome::Cancelled).await,
        }

        if task.deliver_to.is_none() {
            let outcome = TaskOutcome::Approved { artifact_digest: artifact.digest() };
            return self.conclude(&task, outcome).await;
        }
        self.deliver(task, artifact).await
    }

    async fn deliver(&self, task: TaskPackage, artifact: Artifact) -> Result<TaskOutcome, RouteError> {
        if self.services.state.is_halted() {
            return self.hold(task, HeldStage::AwaitingDelivery { artifact }).await;
        }
        match self.relay.deliver(&task, &artifact).await {
            Ok(receipt) => {
                self.services.events.publish(GovernanceEvent::TaskDelivered {
                    task_id: task.task_id,
                    target: receipt.target.clone(),
                    external_ref: receipt.external_ref.clone(),
                    delivered_at: receipt.delivered_at,
                });
                self.conclude(&task, TaskOutcome::Delivered { receipt }).await
            }
            Err(TransportError::AuditWrite(reason)) => {
                error!(task_id = %task.task_id, reason = %reason, "Relay could not record delivery");
                Err(RouteError::AuditWrite(AuditWriteError::Unavailable(reason)))
            }
            Err(e) => self.conclude(&task, TaskOutcome::DeliveryFailed { reason: e.to_string() }).await,
        }
    }

    async fn hold(&self, task: TaskPackage, stage: HeldStage) -> Result<TaskOutcome, RouteError> {
        self.log(
            AuditRecord::for_task(&task, self.record.id, Decision::Hold)
                .rationale(format!("system halted; held {}", stage.label())),
        )
        .await?;
        info!(task_id = %task.task_id, stage = stage.label(), "Task held until resume");
        self.held.push(task, stage);
        Ok(TaskOutcome::Held)
    }

    /// Retire a task on a terminal outcome.
    async fn conclude(&self, task: &TaskPackage, outcome: TaskOutcome) -> Result<TaskOutcome, RouteError> {
        self.log(
            AuditRecord::for_task(task, self.record.id, Decision::Retire).rationale(format!("{RETIRED_PREFIX}{}", outcome.label())),
        )
        .await?;
        self.forget(task.task_id);
        self.services.events.publish(GovernanceEvent::TaskConcluded {
            task_id: task.task_id,
            outcome: outcome.label().to_string(),
            concluded_at: chrono::Utc::now(),
        });
        info!(task_id = %task.task_id, outcome = outcome.label(), "Task concluded");
        Ok(outcome)
    }

    /// Nothing can answer a timed-out request, so the task stops being live.
    fn left_pending(&self, task: &TaskPackage) -> TaskOutcome {
        self.forget(task.task_id);
        TaskOutcome::PendingHumanTimeout
    }

    fn forget(&self, task_id: TaskId) {
        self.services.cancellations.forget(task_id);
        self.gates.remove(&task_id);
    }

    /// Tasks with a live cancellation token or gate ledger.
    pub fn tracked_tasks(&self) -> (usize, usize) {
        (self.services.cancellations.tracked(), self.gates.len())
    }

    /// Operator withdrawal. In-flight work finishes and is discarded; an open
    /// human request is withdrawn.
    pub async fn cancel(&self, task_id: TaskId, reason: &str) -> Result<(), RouteError> {
        if !self.services.cancellations.cancel(task_id) {
            return Err(RouteError::UnknownTask(task_id));
        }
        self.log(
            AuditRecord::new(self.record.id, Decision::Cancel)
                .task(task_id)
                .rationale(format!("withdrawn by operator: {reason}")),
        )
        .await?;
        let withdrawn = self.services.approvals.cancel_for_task(task_id).await;
        info!(task_id = %task_id, withdrawn_approvals = withdrawn, "Task cancelled");
        Ok(())
    }

    /// RESET and REALIGN after a halt. Only a human may call this.
    ///
    /// Quarantined tasks are retired and their held work dropped. Everything
    /// else that was held continues from where it stopped.
    pub async fn resume(self: &Arc<Self>, reason: &str, approver: &AgentRecord) -> Result<ResumeReport, ResumeError> {
        if approver.role != AgentRole::Human {
            return Err(ResumeError::NotHumanTier { name: approver.name.clone(), role: approver.role });
        }
        let SystemState::Halted(halt) = self.services.state.snapshot() else {
            return Err(ResumeError::NotHalted);
        };
        self.services.registry.register(approver.clone())?;

        let entries = match halt.trigger {
            Some(trigger) => self.services.audit.range(trigger, None).await?,
            None => Vec::new(),
        };
        let plan = plan_reset(&entries, halt.trigger, halt.task_id);
        let trigger_label = halt.trigger.map_or_else(|| "prime fault".to_string(), |s: SequenceNumber| s.to_string());
        for task_id in &plan.quarantined_tasks {
            self.log(
                AuditRecord::new(self.record.id, Decision::Retire)
                    .task(*task_id)
                    .flag(ViolationFlag::Quarantined)
                    .rationale(format!("quarantined by reset after {trigger_label}")),
            )
            .await?;
            self.forget(*task_id);
        }

        self.log(
            AuditRecord::new(approver.id, Decision::Resume)
                .rationale(reason.to_string())
                .related(halt.trigger, halt.agent_id),
        )
        .await?;
        self.services.state.resume().await.map_err(|_| ResumeError::NotHalted)?;
        self.services.events.publish(GovernanceEvent::SystemResumed {
            approver: approver.id,
            reason: reason.to_string(),
            resumed_at: chrono::Utc::now(),
        });
        info!(approver = %approver.name, quarantined = plan.quarantined_tasks.len(), "System resumed");

        let mut held: Vec<HeldTask> = self.held.drain();
        for governor in self.governors.values() {
            held.extend(governor.release_held());
        }

        let mut report = ResumeReport {
            approver: approver.clone(),
            plan,
            requeued: Vec::new(),
            discarded: Vec::new(),
            continuations: Vec::new(),
        };
        for item in held {
            let task_id = item.task.task_id;
            if report.plan.quarantines(task_id) {
                debug!(task_id = %task_id, stage = item.stage.label(), "Held work dropped by reset");
                self.forget(task_id);
                report.discarded.push(task_id);
                continue;
            }
            let router = Arc::clone(self);
            report.requeued.push(task_id);
            report.continuations.push(tokio::spawn(async move { router.continue_held(item).await }));
        }
        Ok(report)
    }

    /// Put a degraded governor back in charge of its domain. Only a human
    /// may call this, and the `restore` entry must land before the flag is
    /// cleared, so a store that is still failing leaves the domain degraded.
    pub async fn restore_domain(
        &self,
        domain: &DomainName,
        reason: &str,
        approver: &AgentRecord,
    ) -> Result<(), RestoreError> {
        if approver.role != AgentRole::Human {
            return Err(RestoreError::NotHumanTier { name: approver.name.clone(), role: approver.role });
        }
        let governor = self.governors.get(domain).ok_or_else(|| RestoreError::DomainUnknown(domain.clone()))?;
        if !governor.is_degraded() {
            return Err(RestoreError::NotDegraded(domain.clone()));
        }
        self.services.registry.register(approver.clone())?;

        self.log(AuditRecord::new(approver.id, Decision::Restore).domain(domain.clone()).rationale(reason.to_string()))
            .await?;
        governor.restore();
        self.services.events.publish(GovernanceEvent::DomainRestored {
            domain: domain.clone(),
            approver: approver.id,
            restored_at: chrono::Utc::now(),
        });
        info!(domain = %domain, approver = %approver.name, "Domain restored");
        Ok(())
    }

    async fn continue_held(&self, held: HeldTask) -> Result<TaskOutcome, RouteError> {
        let HeldTask { task, stage, .. } = held;
        debug!(task_id = %task.task_id, stage = stage.label(), "Continuing held task");
        let (failures, pending) = match stage {
            HeldStage::AwaitingRoute => return self.run(task).await,
            HeldStage::AwaitingFinalApproval { artifact } => return self.approve_and_deliver(task, artifact).await,
            HeldStage::AwaitingDelivery { artifact } => return self.deliver(task, artifact).await,
            HeldStage::AwaitingDispatch { failures } => (failures, None),
            HeldStage::AwaitingValidation { artifact, failures } => (failures, Some(artifact)),
        };

        let governor = self
            .governors
            .get(&task.domain)
            .cloned()
            .ok_or_else(|| RouteError::DomainUnknown(task.domain.clone()))?;
        match governor.resume_held(&task, failures, pending).await {
            Ok(outcome) => self.after_dispatch(task, outcome).await,
            Err(err) => self.governor_failed(&task, err).await,
        }
    }
}
