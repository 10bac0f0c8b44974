// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! End-to-end tests for the control plane: tiered approval, bounded retries
//! with a single escalation, lane enforcement and halt/resume admission.

use async_trait::async_trait;
use codex_core::application::control_plane::ControlPlane;
use codex_core::application::router::{AdmissionError, SubmitError, TaskOutcome};
use codex_core::domain::agent::{Agent, AgentRecord};
use codex_core::domain::audit::{AuditEntry, Decision, ViolationFlag};
use codex_core::domain::events::GovernanceEvent;
use codex_core::domain::governance_config::GovernanceConfigManifest;
use codex_core::domain::policy::{DomainPolicy, PolicyStore};
use codex_core::domain::relay::TargetSystemRef;
use codex_core::domain::task::{DomainName, Intent, Priority, TaskCandidate, TaskPackage};
use codex_core::domain::worker::{Artifact, WorkerExecutor, WorkerFailure};
use codex_core::infrastructure::audit_log::InMemoryAuditLog;
use codex_core::infrastructure::relay_adapters::MemoryRelayAdapter;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Answers every task with a well-formed advisory artifact.
#[derive(Default)]
struct CountingWorker {
    calls: AtomicU32,
}

#[async_trait]
impl WorkerExecutor for CountingWorker {
    async fn execute(&self, task: &TaskPackage) -> Result<Artifact, WorkerFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Artifact::new(task.task_id, "advisory/v1", json!({"summary": "reviewed", "advice": task.payload.clone()})))
    }
}

/// Fails every call with a transient error.
#[derive(Default)]
struct FailingWorker {
    calls: AtomicU32,
}

#[async_trait]
impl WorkerExecutor for FailingWorker {
    async fn execute(&self, _task: &TaskPackage) -> Result<Artifact, WorkerFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(WorkerFailure::transient("upstream knowledge base unavailable"))
    }
}

fn domain(name: &str) -> DomainName {
    DomainName::parse(name).unwrap()
}

fn decisions(entries: &[AuditEntry]) -> Vec<Decision> {
    entries.iter().map(|e| e.decision).collect()
}

struct Harness {
    plane: ControlPlane,
    audit: Arc<InMemoryAuditLog>,
    relay: Arc<MemoryRelayAdapter>,
}

fn harness(codex_worker: Arc<dyn WorkerExecutor>, ops_worker: Arc<dyn WorkerExecutor>, human_timeout: Duration) -> Harness {
    let policy = PolicyStore::new()
        .with_domain(DomainPolicy::new(domain("codex")).max_attempts(3).allow_constraint("charter.*"))
        .unwrap()
        .with_domain(DomainPolicy::new(domain("ops")).allow_constraint("runbook.*"))
        .unwrap()
        .with_human_approval_timeout(human_timeout);
    let audit = Arc::new(InMemoryAuditLog::new());
    let relay = Arc::new(MemoryRelayAdapter::new());

    let plane = ControlPlane::builder(policy, audit.clone())
        .with_worker(domain("codex"), codex_worker)
        .with_worker(domain("ops"), ops_worker)
        .with_relay_target(TargetSystemRef::parse("crm").unwrap(), None, relay.clone())
        .build()
        .unwrap();
    Harness { plane, audit, relay }
}

#[tokio::test]
async fn test_critical_creation_blocks_on_human_before_relay() {
    let h = harness(Arc::new(CountingWorker::default()), Arc::new(CountingWorker::default()), Duration::from_secs(10));
    let mut events = h.plane.events().subscribe();

    let candidate = TaskCandidate::new("codex", Intent::Creation, Priority::Critical)
        .with_payload(json!({"draft": "charter amendment"}))
        .deliver_to("crm");
    let task = h.plane.router().admit(candidate).await.unwrap();
    assert!(task.requires().human_approval);

    let router = h.plane.router().clone();
    let run = tokio::spawn(async move { router.run(task).await });

    loop {
        if let GovernanceEvent::HumanApprovalRequested { .. } = events.recv().await.unwrap() {
            break;
        }
    }
    assert!(h.relay.delivered().is_empty(), "relay was called before the human gate");

    let pending = h.plane.approvals().list_pending_requests().await;
    assert_eq!(pending.len(), 1);
    let alice = AgentRecord::human("alice");
    h.plane.approvals().submit_approval(pending[0].id, &alice, None).await.unwrap();

    let outcome = run.await.unwrap().unwrap();
    assert!(matches!(outcome, TaskOutcome::Delivered { .. }), "got {outcome:?}");
    assert_eq!(h.relay.delivered().len(), 1);

    let trail = h.audit.snapshot();
    let tier3 = trail.iter().position(|e| e.decision == Decision::ApproveTier3).unwrap();
    let deliver = trail.iter().position(|e| e.decision == Decision::Deliver).unwrap();
    assert!(tier3 < deliver);
    assert_eq!(trail[tier3].agent_id, alice.id);

    let report = h.plane.supervisor().scan_once().await.unwrap();
    assert!(report.anomalies.is_empty(), "unexpected anomalies: {:?}", report.anomalies);
}

#[tokio::test]
async fn test_exhausted_retries_escalate_exactly_once() {
    let failing = Arc::new(FailingWorker::default());
    let h = harness(failing.clone(), Arc::new(CountingWorker::default()), Duration::from_secs(1));

    let task = h
        .plane
        .router()
        .admit(TaskCandidate::new("codex", Intent::Analysis, Priority::Normal).with_payload(json!({"topic": "quorum"})))
        .await
        .unwrap();
    let original = task.task_id;
    let outcome = h.plane.router().run(task).await.unwrap();

    // Prime supersedes once; the successor fails again and is rejected.
    let TaskOutcome::Superseded { by, outcome } = outcome else {
        panic!("expected a superseded outcome, got {outcome:?}");
    };
    assert!(matches!(*outcome, TaskOutcome::Rejected { .. }));

    let history = h.plane.task_history(original).await.unwrap();
    let escalations = history.iter().filter(|e| e.decision == Decision::Escalate).count();
    assert_eq!(escalations, 1);
    assert_eq!(history.iter().filter(|e| e.decision == Decision::Fail).count(), 3);
    assert_eq!(history.iter().filter(|e| e.decision == Decision::Retry).count(), 2);

    let successor = h.plane.task_history(by).await.unwrap();
    assert_eq!(successor.iter().filter(|e| e.decision == Decision::Escalate).count(), 1);
    assert_eq!(failing.calls.load(Ordering::SeqCst), 6);

    let report = h.plane.supervisor().scan_once().await.unwrap();
    assert!(!report.halted);
    assert!(!h.plane.state().is_halted());
}

#[tokio::test]
async fn test_governor_refuses_foreign_domain_without_invoking_worker() {
    let codex_worker = Arc::new(CountingWorker::default());
    let ops_worker = Arc::new(CountingWorker::default());
    let h = harness(codex_worker.clone(), ops_worker.clone(), Duration::from_secs(1));

    let task = h
        .plane
        .router()
        .admit(TaskCandidate::new("ops", Intent::Analysis, Priority::Low))
        .await
        .unwrap();
    let codex = h.plane.router().governor(&domain("codex")).unwrap().clone();
    let before = h.audit.snapshot().len();

    let err = codex.validate(&task).await.unwrap_err();
    assert!(err.to_string().contains("outside the 'codex' lane"));
    assert_eq!(codex_worker.calls.load(Ordering::SeqCst), 0);
    assert_eq!(ops_worker.calls.load(Ordering::SeqCst), 0);

    let written = &h.audit.snapshot()[before..];
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].decision, Decision::ValidateReject);
    assert_eq!(written[0].agent_id, codex.agent_id());
    assert_eq!(written[0].violation_flags.iter().copied().collect::<Vec<_>>(), vec![ViolationFlag::OutOfLane]);

    let report = h.plane.supervisor().scan_once().await.unwrap();
    assert!(!report.halted, "a lane refusal is not a privilege violation");
}

#[tokio::test]
async fn test_foreign_constraint_is_flagged_out_of_lane_once() {
    let codex_worker = Arc::new(CountingWorker::default());
    let h = harness(codex_worker.clone(), Arc::new(CountingWorker::default()), Duration::from_secs(1));

    let candidate = TaskCandidate::new("codex", Intent::Analysis, Priority::Normal)
        .with_payload(json!({"topic": "restart the ingest"}))
        .with_constraint("runbook.restart");
    let outcome = h.plane.submit(candidate).await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Rejected { .. }), "got {outcome:?}");
    assert_eq!(codex_worker.calls.load(Ordering::SeqCst), 0);

    let trail = h.audit.snapshot();
    let flagged: Vec<_> = trail.iter().filter(|e| e.has_flag(ViolationFlag::OutOfLane)).collect();
    assert_eq!(flagged.len(), 1);
    assert_eq!(flagged[0].decision, Decision::ValidateReject);
    let escalate = trail.iter().find(|e| e.decision == Decision::Escalate).unwrap();
    assert!(escalate.violation_flags.is_empty());
    assert!(escalate.rationale.starts_with("out of lane"));

    let report = h.plane.supervisor().scan_once().await.unwrap();
    assert!(!report.halted);
    assert!(!h.plane.state().is_halted());
}

#[tokio::test]
async fn test_halted_admission_succeeds_after_human_resume() {
    let h = harness(Arc::new(CountingWorker::default()), Arc::new(CountingWorker::default()), Duration::from_secs(1));
    let candidate = TaskCandidate::new("codex", Intent::Analysis, Priority::Normal).with_payload(json!({"topic": "tenure"}));

    let first = h.plane.router().admit(candidate.clone()).await.unwrap();
    h.plane.halt("operator stop").await;
    let before = h.audit.snapshot().len();

    let err = h.plane.router().admit(candidate.clone()).await.unwrap_err();
    assert!(matches!(err, AdmissionError::Halted(_)));
    assert_eq!(h.audit.snapshot().len(), before, "a refused admission writes nothing");

    let prime = AgentRecord::prime("impostor");
    assert!(h.plane.resume("not allowed", &prime).await.is_err());

    let report = h.plane.resume("operator cleared the stop", &AgentRecord::human("alice")).await.unwrap();
    assert!(report.requeued.is_empty());
    assert!(!h.plane.state().is_halted());

    let second = h.plane.router().admit(candidate).await.unwrap();
    assert_ne!(first.task_id, second.task_id);
}

#[tokio::test]
async fn test_no_dispatch_after_halt() {
    let worker = Arc::new(CountingWorker::default());
    let h = harness(worker.clone(), Arc::new(CountingWorker::default()), Duration::from_secs(1));

    let task = h
        .plane
        .router()
        .admit(TaskCandidate::new("codex", Intent::Analysis, Priority::Normal).with_payload(json!({"topic": "x"})))
        .await
        .unwrap();
    let task_id = task.task_id;
    h.plane.halt("operator stop").await;

    let outcome = h.plane.router().run(task).await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Held));
    assert_eq!(worker.calls.load(Ordering::SeqCst), 0);

    let history = h.plane.task_history(task_id).await.unwrap();
    assert_eq!(decisions(&history), vec![Decision::Admit, Decision::Hold]);

    let report = h.plane.resume("resume", &AgentRecord::human("alice")).await.unwrap();
    assert_eq!(report.requeued, vec![task_id]);
    for handle in report.continuations {
        let outcome = handle.await.unwrap().unwrap();
        assert!(matches!(outcome, TaskOutcome::Approved { .. }), "got {outcome:?}");
    }
    assert_eq!(worker.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_submit_rejects_unknown_domain_with_audit_entry() {
    let h = harness(Arc::new(CountingWorker::default()), Arc::new(CountingWorker::default()), Duration::from_secs(1));

    let err = h.plane.submit(TaskCandidate::new("finance", Intent::Analysis, Priority::Normal)).await.unwrap_err();
    assert!(matches!(err, SubmitError::Admission(AdmissionError::DomainUnknown(_))));

    let trail = h.audit.snapshot();
    assert_eq!(trail.len(), 1);
    assert_eq!(trail[0].decision, Decision::Reject);
    assert_eq!(trail[0].agent_id, h.plane.router().agent_id());
}

#[tokio::test]
async fn test_default_manifest_plane_routes_advisory_work() {
    let audit = Arc::new(InMemoryAuditLog::new());
    let plane = ControlPlane::from_manifest(&GovernanceConfigManifest::default(), audit.clone()).await.unwrap();

    let outcome = plane
        .submit(TaskCandidate::new("codex", Intent::Analysis, Priority::Normal).with_payload(json!({"topic": "retention", "notes": "tighten clause 4"})))
        .await
        .unwrap();
    assert!(matches!(outcome, TaskOutcome::Approved { .. }));

    let digest = plane.digest(1).await.unwrap();
    assert_eq!(digest.tasks_considered, 1);
    assert_eq!(digest.domains["codex"].outcomes["approved"], 1);
}
