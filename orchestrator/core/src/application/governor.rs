// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Governor Engine (BC-3 Execution Context)
//!
//! One governor per domain. It owns the lane check, the bounded retry loop
//! around its worker, and output validation. It never routes across domains
//! and never approves beyond tier 1; anything it cannot settle goes back to
//! Prime as an [`EscalationRequest`].
//!
//! ## Attempt loop
//!
//! ```text
//! validate ─► dispatch ─► worker ─► validate output ─► Completed
//!                ▲           │             │
//!                └─ retry ◄──┴── failed ◄──┘   (attempt < N)
//!                                  └──────────► escalate (attempt = N)
//! ```
//!
//! Each `dispatch` entry is written under a [`DispatchPermit`] so no dispatch
//! is recorded after a halt. A worker that finishes after a halt has its
//! result held, never forwarded.
//!
//! [`DispatchPermit`]: crate::domain::system_state::DispatchPermit

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::application::held::{CancellationRegistry, HeldQueue, HeldStage, HeldTask};
use crate::domain::agent::{Agent, AgentRecord, AgentRole};
use crate::domain::audit::{AuditEntry, AuditRecord, Decision, ViolationFlag};
use crate::domain::escalation::{EscalationCause, EscalationRequest, FailureRecord};
use crate::domain::policy::{ConstraintLane, DomainPolicy, PolicyError, PolicyStore};
use crate::domain::repository::{AuditLog, AuditWriteError};
use crate::domain::system_state::SystemStateHandle;
use crate::domain::task::{DomainName, TaskId, TaskPackage};
use crate::domain::worker::{Artifact, FailureKind, WorkerExecutor, WorkerFailure};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputVerdict {
    Accepted,
    Rejected(String),
}

/// Output safety check applied before an artifact leaves the governor.
pub trait OutputValidator: Send + Sync {
    fn check(&self, task: &TaskPackage, artifact: &Artifact) -> OutputVerdict;
}

/// Applies a domain's [`crate::domain::policy::OutputRules`].
pub struct PolicyOutputValidator {
    policy: DomainPolicy,
}

impl PolicyOutputValidator {
    pub fn new(policy: DomainPolicy) -> Self {
        Self { policy }
    }
}

impl OutputValidator for PolicyOutputValidator {
    fn check(&self, task: &TaskPackage, artifact: &Artifact) -> OutputVerdict {
        if artifact.task_id != task.task_id {
            return OutputVerdict::Rejected(format!("artifact belongs to task {}", artifact.task_id));
        }
        let rules = &self.policy.output;
        if !rules.required_fields.is_empty() {
            let Some(content) = artifact.content.as_object() else {
                return OutputVerdict::Rejected("artifact content is not a JSON object".to_string());
            };
            if let Some(missing) = rules.required_fields.iter().find(|f| !content.contains_key(f.as_str())) {
                return OutputVerdict::Rejected(format!("artifact is missing required field '{missing}'"));
            }
        }

        let serialized = artifact.content.to_string();
        if let Some(max) = rules.max_bytes {
            if serialized.len() > max {
                return OutputVerdict::Rejected(format!("artifact is {} bytes, limit is {max}", serialized.len()));
            }
        }
        if let Some(pattern) = self.policy.forbidden_patterns().iter().find(|re| re.is_match(&serialized)) {
            return OutputVerdict::Rejected(format!("artifact matches forbidden pattern '{}'", pattern.as_str()));
        }
        OutputVerdict::Accepted
    }
}

#[derive(Debug)]
pub enum DispatchOutcome {
    Completed { artifact: Artifact, attempts: u32 },
    Escalated(Box<EscalationRequest>),
    /// Parked because the system halted; resumed by REALIGN.
    Held,
    /// Withdrawn by an operator.
    Cancelled,
}

#[derive(Debug, Error)]
pub enum GovernorError {
    #[error("task {task_id} is outside the '{domain}' lane: {reason}")]
    OutOfLane { task_id: TaskId, domain: DomainName, reason: String },
    #[error("constraint '{constraint}' cannot be satisfied in domain '{domain}'")]
    ConstraintUnsatisfiable { domain: DomainName, constraint: String },
    #[error("task {0} was altered after admission")]
    Tampered(TaskId),
    #[error("governor for '{domain}' is degraded and refuses new work")]
    Degraded { domain: DomainName },
    #[error(transparent)]
    AuditWrite(#[from] AuditWriteError),
}

impl GovernorError {
    pub fn violation_flag(&self) -> Option<ViolationFlag> {
        match self {
            GovernorError::OutOfLane { .. } => Some(ViolationFlag::OutOfLane),
            GovernorError::ConstraintUnsatisfiable { .. } => Some(ViolationFlag::ConstraintUnsatisfiable),
            GovernorError::Tampered(_) => Some(ViolationFlag::ConstraintTamper),
            GovernorError::Degraded { .. } | GovernorError::AuditWrite(_) => None,
        }
    }

    /// Deterministic validation refusals, as opposed to governor faults.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            GovernorError::OutOfLane { .. } | GovernorError::ConstraintUnsatisfiable { .. } | GovernorError::Tampered(_)
        )
    }
}

pub struct GovernorEngine {
    record: AgentRecord,
    worker_record: AgentRecord,
    domain: DomainName,
    policy: Arc<PolicyStore>,
    validator: Arc<dyn OutputValidator>,
    worker: Arc<dyn WorkerExecutor>,
    audit: Arc<dyn AuditLog>,
    state: SystemStateHandle,
    cancellations: Arc<CancellationRegistry>,
    limiter: Semaphore,
    held: HeldQueue,
    degraded: AtomicBool,
}

impl Agent for GovernorEngine {
    fn record(&self) -> &AgentRecord {
        &self.record
    }
}

impl GovernorEngine {
    pub fn new(
        domain: DomainName,
        worker: Arc<dyn WorkerExecutor>,
        policy: Arc<PolicyStore>,
        audit: Arc<dyn AuditLog>,
        state: SystemStateHandle,
        cancellations: Arc<CancellationRegistry>,
    ) -> Result<Self, PolicyError> {
        let domain_policy = policy.domain(&domain).cloned().ok_or_else(|| PolicyError::UnknownDomain(domain.clone()))?;
        Ok(Self {
            record: AgentRecord::governor(format!("{domain}-governor"), domain.clone()),
            worker_record: AgentRecord::worker(format!("{domain}-worker"), domain.clone()),
            limiter: Semaphore::new(domain_policy.max_concurrency),
            validator: Arc::new(PolicyOutputValidator::new(domain_policy)),
            domain,
            policy,
            worker,
            audit,
            state,
            cancellations,
            held: HeldQueue::default(),
            degraded: AtomicBool::new(false),
        })
    }

    pub fn with_validator(mut self, validator: Arc<dyn OutputValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn domain(&self) -> &DomainName {
        &self.domain
    }

    pub fn worker_record(&self) -> &AgentRecord {
        &self.worker_record
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Clear the degraded flag once the audit store is healthy again.
    pub fn restore(&self) {
        if self.degraded.swap(false, Ordering::SeqCst) {
            info!(domain = %self.domain, "Governor restored");
        }
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    pub fn release_held(&self) -> Vec<HeldTask> {
        self.held.drain()
    }

    fn ensure_healthy(&self) -> Result<(), GovernorError> {
        if self.is_degraded() {
            return Err(GovernorError::Degraded { domain: self.domain.clone() });
        }
        Ok(())
    }

    async fn log(&self, record: AuditRecord) -> Result<AuditEntry, GovernorError> {
        self.audit.append(record).await.map_err(|e| {
            self.degraded.store(true, Ordering::SeqCst);
            error!(domain = %self.domain, error = %e, "Audit write failed; governor degraded");
            GovernorError::AuditWrite(e)
        })
    }

    fn check_lane(&self, task: &TaskPackage) -> Result<(), GovernorError> {
        if task.domain != self.domain {
            return Err(GovernorError::OutOfLane {
                task_id: task.task_id,
                domain: self.domain.clone(),
                reason: format!("task belongs to domain '{}'", task.domain),
            });
        }
        if !task.verify_integrity() {
            return Err(GovernorError::Tampered(task.task_id));
        }
        for constraint in &task.constraints {
            match self.policy.constraint_lane(&self.domain, constraint) {
                ConstraintLane::InDomain => {}
                ConstraintLane::OtherDomain(owner) => {
                    return Err(GovernorError::OutOfLane {
                        task_id: task.task_id,
                        domain: self.domain.clone(),
                        reason: format!("constraint '{constraint}' belongs to domain '{owner}'"),
                    });
                }
                ConstraintLane::Unknown => {
                    return Err(GovernorError::ConstraintUnsatisfiable {
                        domain: self.domain.clone(),
                        constraint: constraint.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Lane, constraint and integrity check. Writes exactly one entry.
    pub async fn validate(&self, task: &TaskPackage) -> Result<(), GovernorError> {
        self.ensure_healthy()?;
        let base = AuditRecord::for_task(task, self.record.id, Decision::ValidateAccept).input_digest(task.admission_digest());

        match self.check_lane(task) {
            Ok(()) => {
                self.log(base.rationale("domain, constraints and admission digest verified")).await?;
                debug!(task_id = %task.task_id, domain = %self.domain, "Task validated");
                Ok(())
            }
            Err(err) => {
                let mut record = base.rationale(err.to_string());
                record.decision = Decision::ValidateReject;
                if let Some(flag) = err.violation_flag() {
                    record = record.flag(flag);
                }
                self.log(record).await?;
                warn!(task_id = %task.task_id, domain = %self.domain, error = %err, "Task failed validation");
                Err(err)
            }
        }
    }

    /// Validate, then dispatch. Out-of-lane tasks are escalated to Prime
    /// instead of being returned as errors.
    pub async fn process(&self, task: &TaskPackage) -> Result<DispatchOutcome, GovernorError> {
        match self.validate(task).await {
            Ok(()) => self.dispatch(task).await,
            Err(GovernorError::OutOfLane { reason, .. }) => {
                let request = self.escalate(task, Vec::new(), EscalationCause::OutOfLane { reason }).await?;
                Ok(DispatchOutcome::Escalated(Box::new(request)))
            }
            Err(other) => Err(other),
        }
    }

    /// Run the bounded attempt loop for a validated task.
    pub async fn dispatch(&self, task: &TaskPackage) -> Result<DispatchOutcome, GovernorError> {
        self.ensure_healthy()?;
        self.drive(task, Vec::new(), None).await
    }

    /// Continue a task that was held at dispatch or validation.
    pub async fn resume_held(
        &self,
        task: &TaskPackage,
        failures: Vec<FailureRecord>,
        pending: Option<Artifact>,
    ) -> Result<DispatchOutcome, GovernorError> {
        self.ensure_healthy()?;
        self.drive(task, failures, pending).await
    }

    async fn drive(
        &self,
        task: &TaskPackage,
        mut failures: Vec<FailureRecord>,
        mut pending: Option<Artifact>,
    ) -> Result<DispatchOutcome, GovernorError> {
        let max_attempts = self.policy.max_attempts(&self.domain);
        let shared = Arc::new(task.clone());
        let token = self.cancellations.token(task.task_id);

        loop {
            let attempt = failures.len() as u32 + 1;
            let result = match pending.take() {
                Some(artifact) => Ok(artifact),
                None => {
                    if token.is_cancelled() {
                        return self.discard(task, None, "withdrawn before dispatch").await;
                    }
                    let result = {
                        let _slot = self
                            .limiter
                            .acquire()
                            .await
                            .map_err(|_| GovernorError::Degraded { domain: self.domain.clone() })?;
                        if !self.open_dispatch(task, attempt, max_attempts).await? {
                            return self.hold(task, HeldStage::AwaitingDispatch { failures }).await;
                        }
                        self.invoke_worker(shared.clone()).await
                    };
                    self.record_worker_result(task, &result).await?;
                    if token.is_cancelled() {
                        return self.discard(task, result.as_ref().ok(), "withdrawn while the worker was running").await;
                    }
                    result
                }
            };

            match result {
                Ok(artifact) => {
                    if self.state.is_halted() {
                        return self.hold(task, HeldStage::AwaitingValidation { artifact, failures }).await;
                    }
                    match self.validate_output(task, &artifact).await? {
                        OutputVerdict::Accepted => {
                            info!(task_id = %task.task_id, domain = %self.domain, attempt, "Output accepted");
                            return Ok(DispatchOutcome::Completed { artifact, attempts: attempt });
                        }
                        OutputVerdict::Rejected(reason) => {
                            failures.push(FailureRecord::rejected_output(attempt, reason));
                        }
                    }
                }
                Err(failure) => failures.push(FailureRecord::from_failure(attempt, &failure)),
            }

            if failures.len() as u32 >= max_attempts {
                let request = self.escalate(task, failures, EscalationCause::RetriesExhausted).await?;
                return Ok(DispatchOutcome::Escalated(Box::new(request)));
            }

            let last = failures.last().map(|f| f.reason.as_str()).unwrap_or_default();
            self.log(
                AuditRecord::for_task(task, self.record.id, Decision::Retry)
                    .rationale(format!("attempt {attempt}/{max_attempts} failed: {last}")),
            )
            .await?;
            debug!(task_id = %task.task_id, attempt, max_attempts, "Retrying task");
        }
    }

    /// Write the dispatch entry under a permit. `false` means halted.
    async fn open_dispatch(&self, task: &TaskPackage, attempt: u32, max_attempts: u32) -> Result<bool, GovernorError> {
        let permit = match self.state.begin_dispatch().await {
            Ok(permit) => permit,
            Err(halted) => {
                debug!(task_id = %task.task_id, reason = %halted.reason, "Dispatch refused: system halted");
                return Ok(false);
            }
        };
        self.log(
            AuditRecord::for_task(task, self.record.id, Decision::Dispatch)
                .input_digest(task.admission_digest())
                .rationale(format!("attempt {attempt}/{max_attempts}")),
        )
        .await?;
        drop(permit);
        metrics::counter!("codex_dispatch_attempts_total", "domain" => self.domain.to_string()).increment(1);
        Ok(true)
    }

    async fn invoke_worker(&self, task: Arc<TaskPackage>) -> Result<Artifact, WorkerFailure> {
        let limit = self
            .policy
            .domain(&self.domain)
            .map_or(crate::domain::policy::DEFAULT_WORKER_TIMEOUT, |p| p.worker_timeout);
        let worker = self.worker.clone();
        let job = {
            let task = task.clone();
            tokio::spawn(async move { worker.execute(&task).await })
        };

        // On timeout the join handle is dropped, which detaches the worker;
        // whatever it produces later is never read.
        match tokio::time::timeout(limit, job).await {
            Ok(Ok(Ok(artifact))) if artifact.task_id == task.task_id => Ok(artifact),
            Ok(Ok(Ok(_))) => Err(WorkerFailure::systematic("worker returned an artifact for a different task")),
            Ok(Ok(Err(failure))) => Err(failure),
            Ok(Err(join_error)) => Err(WorkerFailure::systematic(format!("worker task aborted: {join_error}"))),
            Err(_) => {
                warn!(task_id = %task.task_id, domain = %self.domain, "Worker exceeded its time box");
                Err(WorkerFailure::timeout(limit))
            }
        }
    }

    async fn record_worker_result(
        &self,
        task: &TaskPackage,
        result: &Result<Artifact, WorkerFailure>,
    ) -> Result<(), GovernorError> {
        let record = match result {
            Ok(artifact) => AuditRecord::for_task(task, self.worker_record.id, Decision::Produce)
                .output_digest(artifact.digest())
                .rationale(format!("{} artifact", artifact.format)),
            Err(failure) => {
                let flag = if failure.kind == FailureKind::Timeout {
                    ViolationFlag::WorkerTimeout
                } else {
                    ViolationFlag::WorkerFailure
                };
                AuditRecord::for_task(task, self.worker_record.id, Decision::Fail)
                    .rationale(failure.to_string())
                    .flag(flag)
            }
        };
        self.log(record).await.map(|_| ())
    }

    /// Apply the output rules and record the verdict.
    pub async fn validate_output(&self, task: &TaskPackage, artifact: &Artifact) -> Result<OutputVerdict, GovernorError> {
        let verdict = self.validator.check(task, artifact);
        let record = match &verdict {
            OutputVerdict::Accepted => AuditRecord::for_task(task, self.record.id, Decision::OutputAccept)
                .output_digest(artifact.digest())
                .rationale("output satisfies domain rules"),
            OutputVerdict::Rejected(reason) => AuditRecord::for_task(task, self.record.id, Decision::OutputReject)
                .output_digest(artifact.digest())
                .rationale(reason.clone())
                .flag(ViolationFlag::OutputRejected),
        };
        self.log(record).await?;
        Ok(verdict)
    }

    async fn escalate(
        &self,
        task: &TaskPackage,
        failures: Vec<FailureRecord>,
        cause: EscalationCause,
    ) -> Result<EscalationRequest, GovernorError> {
        let mut escalated = task.clone();
        escalated.record_hop(AgentRole::Governor);

        let mut record = AuditRecord::for_task(&escalated, self.record.id, Decision::Escalate);
        record = match &cause {
            EscalationCause::RetriesExhausted => {
                record.rationale(format!("{} attempts failed; escalating to prime", failures.len()))
            }
            // The validate-reject entry already carries the out-of-lane flag.
            EscalationCause::OutOfLane { reason } => record.rationale(format!("out of lane: {reason}")),
        };
        self.log(record).await?;

        metrics::counter!("codex_escalations_total", "domain" => self.domain.to_string()).increment(1);
        warn!(task_id = %task.task_id, domain = %self.domain, attempts = failures.len(), "Task escalated");
        Ok(EscalationRequest { task: escalated, governor: self.record.id, cause, failure_history: failures })
    }

    async fn hold(&self, task: &TaskPackage, stage: HeldStage) -> Result<DispatchOutcome, GovernorError> {
        self.log(
            AuditRecord::for_task(task, self.record.id, Decision::Hold)
                .rationale(format!("system halted; held {}", stage.label())),
        )
        .await?;
        info!(task_id = %task.task_id, stage = stage.label(), "Task held until resume");
        self.held.push(task.clone(), stage);
        Ok(DispatchOutcome::Held)
    }

    async fn discard(
        &self,
        task: &TaskPackage,
        artifact: Option<&Artifact>,
        reason: &str,
    ) -> Result<DispatchOutcome, GovernorError> {
        let mut record = AuditRecord::for_task(task, self.record.id, Decision::Discard).rationale(reason);
        if let Some(artifact) = artifact {
            record = record.output_digest(artifact.digest());
        }
        self.log(record).await?;
        info!(task_id = %task.task_id, reason, "Task discarded");
        Ok(DispatchOutcome::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::policy::OutputRules;
    use crate::domain::system_state::HaltRequest;
    use crate::domain::task::{Intent, Priority, Requirements, TaskCandidate};
    use crate::infrastructure::audit_log::InMemoryAuditLog;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// Fails the first `failures` calls, then succeeds.
    struct ScriptedWorker {
        failures: u32,
        calls: AtomicU32,
        content: serde_json::Value,
    }

    #[async_trait]
    impl WorkerExecutor for ScriptedWorker {
        async fn execute(&self, task: &TaskPackage) -> Result<Artifact, WorkerFailure> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(WorkerFailure::transient(format!("upstream unavailable (call {call})")));
            }
            Ok(Artifact::new(task.task_id, "advisory/v1", self.content.clone()))
        }
    }

    struct SlowWorker(Duration);

    #[async_trait]
    impl WorkerExecutor for SlowWorker {
        async fn execute(&self, task: &TaskPackage) -> Result<Artifact, WorkerFailure> {
            tokio::time::sleep(self.0).await;
            Ok(Artifact::new(task.task_id, "advisory/v1", json!({"summary": "late", "advice": "late"})))
        }
    }

    struct Fixture {
        governor: GovernorEngine,
        audit: Arc<InMemoryAuditLog>,
        state: SystemStateHandle,
        worker_calls: Option<Arc<ScriptedWorker>>,
    }

    fn codex() -> DomainName {
        DomainName::parse("codex").unwrap()
    }

    fn policy(timeout: Duration) -> Arc<PolicyStore> {
        let rules = OutputRules {
            required_fields: vec!["summary".into(), "advice".into()],
            forbidden_patterns: vec!["(?i)password".into()],
            max_bytes: None,
        };
        Arc::new(
            PolicyStore::new()
                .with_domain(
                    DomainPolicy::new(codex())
                        .worker_timeout(timeout)
                        .output_rules(rules)
                        .unwrap(),
                )
                .unwrap()
                .with_domain(DomainPolicy::new(DomainName::parse("ingestion").unwrap()))
                .unwrap(),
        )
    }

    fn fixture_with(worker: Arc<dyn WorkerExecutor>, timeout: Duration) -> Fixture {
        let audit = Arc::new(InMemoryAuditLog::new());
        let state = SystemStateHandle::default();
        let governor = GovernorEngine::new(
            codex(),
            worker,
            policy(timeout),
            audit.clone(),
            state.clone(),
            Arc::new(CancellationRegistry::default()),
        )
        .unwrap();
        Fixture { governor, audit, state, worker_calls: None }
    }

    fn fixture(failures: u32, content: serde_json::Value) -> Fixture {
        let worker = Arc::new(ScriptedWorker { failures, calls: AtomicU32::new(0), content });
        let mut fx = fixture_with(worker.clone(), Duration::from_secs(5));
        fx.worker_calls = Some(worker);
        fx
    }

    fn task_in(domain: &str, constraints: &[&str]) -> TaskPackage {
        let mut candidate = TaskCandidate::new(domain, Intent::Analysis, Priority::Normal).with_payload(json!({"topic": "x"}));
        for c in constraints {
            candidate = candidate.with_constraint(*c);
        }
        let checked = candidate.check_schema().unwrap();
        TaskPackage::admit(candidate, checked, Requirements::governor_only())
    }

    fn good() -> serde_json::Value {
        json!({"summary": "fine", "advice": "ship it"})
    }

    fn decisions(audit: &InMemoryAuditLog) -> Vec<Decision> {
        audit.snapshot().iter().map(|e| e.decision).collect()
    }

    #[tokio::test]
    async fn test_out_of_lane_rejected_immediately() {
        let fx = fixture(0, good());
        let task = task_in("ingestion", &[]);

        let err = fx.governor.validate(&task).await.unwrap_err();
        assert!(matches!(err, GovernorError::OutOfLane { .. }));

        let entries = fx.audit.snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].decision, Decision::ValidateReject);
        assert!(entries[0].has_flag(ViolationFlag::OutOfLane));
        assert_eq!(fx.worker_calls.unwrap().calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_foreign_and_unknown_constraints() {
        let fx = fixture(0, good());
        let foreign = task_in("codex", &["ingestion.source"]);
        assert!(matches!(fx.governor.validate(&foreign).await, Err(GovernorError::OutOfLane { .. })));

        let unknown = task_in("codex", &["finance.budget"]);
        assert!(matches!(
            fx.governor.validate(&unknown).await,
            Err(GovernorError::ConstraintUnsatisfiable { .. })
        ));
    }

    #[tokio::test]
    async fn test_tampered_task_rejected() {
        let fx = fixture(0, good());
        let mut task = task_in("codex", &["codex.tone"]);
        task.constraints.clear();

        assert!(matches!(fx.governor.validate(&task).await, Err(GovernorError::Tampered(_))));
        assert!(fx.audit.snapshot()[0].has_flag(ViolationFlag::ConstraintTamper));
    }

    #[tokio::test]
    async fn test_retries_then_completes() {
        let fx = fixture(2, good());
        let task = task_in("codex", &[]);

        let outcome = fx.governor.process(&task).await.unwrap();
        let DispatchOutcome::Completed { attempts, .. } = outcome else { panic!("expected completion") };
        assert_eq!(attempts, 3);
        assert_eq!(
            decisions(&fx.audit),
            vec![
                Decision::ValidateAccept,
                Decision::Dispatch,
                Decision::Fail,
                Decision::Retry,
                Decision::Dispatch,
                Decision::Fail,
                Decision::Retry,
                Decision::Dispatch,
                Decision::Produce,
                Decision::OutputAccept,
            ]
        );
    }

    #[tokio::test]
    async fn test_escalates_exactly_once_at_bound() {
        let fx = fixture(u32::MAX, good());
        let task = task_in("codex", &[]);

        let outcome = fx.governor.process(&task).await.unwrap();
        let DispatchOutcome::Escalated(request) = outcome else { panic!("expected escalation") };
        assert_eq!(request.failure_history.len(), 3);
        assert_eq!(request.task.escalation_path(), &[AgentRole::Governor]);

        let all = decisions(&fx.audit);
        assert_eq!(all.iter().filter(|d| **d == Decision::Escalate).count(), 1);
        assert_eq!(all.iter().filter(|d| **d == Decision::Dispatch).count(), 3);
        assert_eq!(all.iter().filter(|d| **d == Decision::Retry).count(), 2);
        assert_eq!(*all.last().unwrap(), Decision::Escalate);
    }

    #[tokio::test]
    async fn test_unsafe_output_counts_as_failure() {
        let fx = fixture(0, json!({"summary": "the password is hunter2", "advice": "x"}));
        let task = task_in("codex", &[]);

        let outcome = fx.governor.process(&task).await.unwrap();
        let DispatchOutcome::Escalated(request) = outcome else { panic!("expected escalation") };
        assert!(request.is_systematic());
        assert_eq!(
            decisions(&fx.audit).iter().filter(|d| **d == Decision::OutputReject).count(),
            3
        );
    }

    #[tokio::test]
    async fn test_worker_timeout_is_a_failed_attempt() {
        let fx = fixture_with(Arc::new(SlowWorker(Duration::from_secs(5))), Duration::from_millis(20));
        let task = task_in("codex", &[]);

        let outcome = fx.governor.process(&task).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Escalated(_)));
        let timeouts = fx
            .audit
            .snapshot()
            .iter()
            .filter(|e| e.has_flag(ViolationFlag::WorkerTimeout))
            .count();
        assert_eq!(timeouts, 3);
    }

    #[tokio::test]
    async fn test_result_after_halt_is_held() {
        let fx = fixture_with(Arc::new(SlowWorker(Duration::from_millis(60))), Duration::from_secs(5));
        let governor = Arc::new(fx.governor);
        let task = task_in("codex", &[]);

        let running = {
            let governor = governor.clone();
            let task = task.clone();
            tokio::spawn(async move { governor.process(&task).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        fx.state
            .halt(HaltRequest { reason: "test".into(), anomaly: None, task_id: None, agent_id: None, trigger: None })
            .await;

        let outcome = running.await.unwrap().unwrap();
        assert!(matches!(outcome, DispatchOutcome::Held));
        assert_eq!(governor.held_count(), 1);

        let all = decisions(&fx.audit);
        assert!(all.contains(&Decision::Produce));
        assert!(!all.contains(&Decision::OutputAccept));
        assert_eq!(*all.last().unwrap(), Decision::Hold);

        let held = governor.release_held();
        assert!(matches!(held[0].stage, HeldStage::AwaitingValidation { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_task_is_discarded() {
        let fx = fixture(0, good());
        let task = task_in("codex", &[]);
        fx.governor.cancellations.register(task.task_id);
        fx.governor.cancellations.cancel(task.task_id);

        let outcome = fx.governor.dispatch(&task).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Cancelled));
        assert_eq!(decisions(&fx.audit), vec![Decision::Discard]);
    }
}
