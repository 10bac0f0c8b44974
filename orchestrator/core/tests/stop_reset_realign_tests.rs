// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! STOP-RESET-REALIGN tests.
//!
//! A supervisor halt stops all dispatch, the reset quarantines whatever was
//! produced after the triggering entry, and a human resume re-queues the
//! remaining held work. Also covers Prime taking over from a governor whose
//! audit writes fail.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use codex_core::application::control_plane::ControlPlane;
use codex_core::application::router::{RestoreError, TaskOutcome};
use codex_core::domain::agent::{AgentId, AgentRecord};
use codex_core::domain::anomaly::AnomalyKind;
use codex_core::domain::audit::{AuditEntry, AuditRecord, Decision, SequenceNumber, ViolationFlag};
use codex_core::domain::policy::{DomainPolicy, PolicyStore};
use codex_core::domain::repository::{AuditLog, AuditQueryError, AuditWriteError};
use codex_core::domain::system_state::SystemState;
use codex_core::domain::task::{DomainName, Intent, Priority, TaskCandidate, TaskId, TaskPackage};
use codex_core::domain::worker::{Artifact, WorkerExecutor, WorkerFailure};
use codex_core::infrastructure::audit_log::InMemoryAuditLog;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Blocks its first call until released; later calls answer at once.
#[derive(Default)]
struct GatedWorker {
    calls: AtomicU32,
    started: Notify,
    release: Notify,
}

#[async_trait]
impl WorkerExecutor for GatedWorker {
    async fn execute(&self, task: &TaskPackage) -> Result<Artifact, WorkerFailure> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            self.started.notify_one();
            self.release.notified().await;
        }
        Ok(Artifact::new(task.task_id, "advisory/v1", json!({"summary": "reviewed", "advice": "none"})))
    }
}

/// Audit log that refuses every append authored by one agent until repaired.
struct RefusingAuditLog {
    inner: InMemoryAuditLog,
    refuse: AgentId,
    broken: AtomicBool,
}

impl RefusingAuditLog {
    fn new(refuse: AgentId) -> Self {
        Self { inner: InMemoryAuditLog::new(), refuse, broken: AtomicBool::new(true) }
    }

    fn repair(&self) {
        self.broken.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl AuditLog for RefusingAuditLog {
    async fn append(&self, record: AuditRecord) -> Result<AuditEntry, AuditWriteError> {
        if record.agent_id == self.refuse && self.broken.load(Ordering::SeqCst) {
            return Err(AuditWriteError::Io("disk quota exceeded".to_string()));
        }
        self.inner.append(record).await
    }

    async fn by_task(&self, task_id: TaskId) -> Result<Vec<AuditEntry>, AuditQueryError> {
        self.inner.by_task(task_id).await
    }

    async fn by_agent(&self, agent_id: AgentId, limit: usize) -> Result<Vec<AuditEntry>, AuditQueryError> {
        self.inner.by_agent(agent_id, limit).await
    }

    async fn range(&self, from: SequenceNumber, to: Option<SequenceNumber>) -> Result<Vec<AuditEntry>, AuditQueryError> {
        self.inner.range(from, to).await
    }

    async fn between(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<AuditEntry>, AuditQueryError> {
        self.inner.between(since, until).await
    }

    async fn latest_sequence(&self) -> Result<Option<SequenceNumber>, AuditQueryError> {
        self.inner.latest_sequence().await
    }
}

fn codex() -> DomainName {
    DomainName::parse("codex").unwrap()
}

fn policy() -> PolicyStore {
    PolicyStore::new().with_domain(DomainPolicy::new(codex())).unwrap()
}

fn candidate(topic: &str) -> TaskCandidate {
    TaskCandidate::new("codex", Intent::Analysis, Priority::Normal).with_payload(json!({ "topic": topic }))
}

#[tokio::test]
async fn test_supervisor_halt_quarantines_post_trigger_output() {
    let worker = Arc::new(GatedWorker::default());
    let audit = Arc::new(InMemoryAuditLog::new());
    let plane = Arc::new(
        ControlPlane::builder(policy(), audit.clone())
            .with_worker(codex(), worker.clone())
            .build()
            .unwrap(),
    );

    let running = {
        let plane = plane.clone();
        tokio::spawn(async move { plane.submit(candidate("retention")).await })
    };
    worker.started.notified().await;

    // An unregistered agent writes into the log while the worker runs.
    let foreign_task = TaskId::new();
    let rogue = audit
        .append(AuditRecord::new(AgentId::new(), Decision::Deliver).task(foreign_task).domain(codex()))
        .await
        .unwrap();

    let report = plane.supervisor().scan_once().await.unwrap();
    assert!(report.halted);
    assert_eq!(report.anomalies.len(), 1);
    assert_eq!(report.anomalies[0].kind, AnomalyKind::PrivilegeViolation);
    let SystemState::Halted(halt) = plane.state().snapshot() else {
        panic!("system should be halted");
    };
    assert_eq!(halt.trigger, Some(rogue.sequence));

    worker.release.notify_one();
    let outcome = running.await.unwrap().unwrap();
    assert!(matches!(outcome, TaskOutcome::Held), "got {outcome:?}");

    let halts = audit.snapshot().iter().filter(|e| e.decision == Decision::Halt).count();
    assert_eq!(halts, 1);

    let report = plane.resume("rogue writer revoked", &AgentRecord::human("alice")).await.unwrap();
    assert!(report.plan.quarantines(foreign_task));
    assert_eq!(report.discarded.len(), 1);
    assert!(report.requeued.is_empty());
    let held_task = report.discarded[0];
    assert!(report.plan.quarantines(held_task));
    assert_eq!(report.plan.last_known_good, rogue.sequence.prev());

    let quarantined: Vec<TaskId> = audit
        .snapshot()
        .iter()
        .filter(|e| e.decision == Decision::Retire && e.has_flag(ViolationFlag::Quarantined))
        .filter_map(|e| e.task_id)
        .collect();
    assert_eq!(quarantined.len(), 2);
    assert!(quarantined.contains(&foreign_task));
    assert!(quarantined.contains(&held_task));

    assert!(!plane.state().is_halted());
    let after = plane.supervisor().scan_once().await.unwrap();
    assert!(after.anomalies.is_empty(), "unexpected anomalies: {:?}", after.anomalies);

    let fresh = plane.submit(candidate("retention")).await.unwrap();
    assert!(matches!(fresh, TaskOutcome::Approved { .. }));
}

#[tokio::test]
async fn test_operator_halt_holds_result_and_resume_realigns() {
    let worker = Arc::new(GatedWorker::default());
    let audit = Arc::new(InMemoryAuditLog::new());
    let plane = Arc::new(
        ControlPlane::builder(policy(), audit.clone())
            .with_worker(codex(), worker.clone())
            .build()
            .unwrap(),
    );

    let running = {
        let plane = plane.clone();
        tokio::spawn(async move { plane.submit(candidate("quorum")).await })
    };
    worker.started.notified().await;
    plane.halt("operator stop").await;
    worker.release.notify_one();

    let outcome = running.await.unwrap().unwrap();
    assert!(matches!(outcome, TaskOutcome::Held));
    assert_eq!(plane.router().held_count(), 1);

    let trail = audit.snapshot();
    let halt_at = trail.iter().position(|e| e.decision == Decision::Halt).unwrap();
    assert!(
        !trail[halt_at..].iter().any(|e| e.decision == Decision::OutputAccept),
        "nothing may be accepted after the halt"
    );

    let report = plane.resume("operator cleared", &AgentRecord::human("alice")).await.unwrap();
    assert!(report.plan.quarantined_tasks.is_empty());
    assert_eq!(report.requeued.len(), 1);
    for handle in report.continuations {
        let outcome = handle.await.unwrap().unwrap();
        assert!(matches!(outcome, TaskOutcome::Approved { .. }), "got {outcome:?}");
    }
    assert_eq!(worker.calls.load(Ordering::SeqCst), 1, "held output is validated, not recomputed");
    assert_eq!(plane.router().held_count(), 0);
}

#[tokio::test]
async fn test_halt_while_halted_records_once() {
    let audit = Arc::new(InMemoryAuditLog::new());
    let plane = ControlPlane::builder(policy(), audit.clone())
        .with_worker(codex(), Arc::new(GatedWorker::default()))
        .build()
        .unwrap();

    plane.halt("first").await;
    plane.halt("second").await;
    let halts: Vec<_> = audit.snapshot().into_iter().filter(|e| e.decision == Decision::Halt).collect();
    assert_eq!(halts.len(), 1);
    assert_eq!(halts[0].rationale, "first");
}

#[tokio::test]
async fn test_failing_governor_audit_is_taken_over_by_prime() {
    let governor_id = AgentRecord::governor("codex-governor", codex()).id;
    let audit = Arc::new(RefusingAuditLog::new(governor_id));
    let worker = Arc::new(GatedWorker::default());
    let plane = ControlPlane::builder(policy(), audit.clone())
        .with_worker(codex(), worker.clone())
        .build()
        .unwrap();

    let outcome = plane.submit(candidate("tenure")).await.unwrap();
    assert!(matches!(outcome, TaskOutcome::TakenOver { .. }), "got {outcome:?}");
    assert!(plane.router().governor(&codex()).unwrap().is_degraded());

    let trail = audit.inner.snapshot();
    assert!(trail.iter().all(|e| e.agent_id != governor_id));
    let takeover = trail.iter().find(|e| e.decision == Decision::Takeover).unwrap();
    assert!(takeover.has_flag(ViolationFlag::DomainDegraded));

    let report = plane.supervisor().scan_once().await.unwrap();
    assert!(!report.halted, "a degraded domain does not halt the system");
    assert!(plane.supervisor().degraded_domains().contains(&codex()));

    // The degraded governor refuses further work without touching the log.
    let again = plane.submit(candidate("tenure")).await.unwrap();
    assert!(matches!(again, TaskOutcome::TakenOver { .. }));

    audit.repair();
    let operator = AgentRecord::human("alice");
    plane.restore_domain(&codex(), "store repaired", &operator).await.unwrap();
    assert!(!plane.router().governor(&codex()).unwrap().is_degraded());
    assert!(plane.supervisor().degraded_domains().is_empty());

    worker.release.notify_one();
    let restored = plane.submit(candidate("tenure")).await.unwrap();
    assert!(matches!(restored, TaskOutcome::Approved { .. }), "got {restored:?}");

    let trail = audit.inner.snapshot();
    let restore = trail.iter().find(|e| e.decision == Decision::Restore).unwrap();
    assert_eq!(restore.agent_id, operator.id);
    assert_eq!(restore.domain, Some(codex()));
    assert!(trail.iter().any(|e| e.agent_id == governor_id && e.decision == Decision::OutputAccept));

    // The second takeover is reported, then the restore entry clears it.
    let report = plane.supervisor().scan_once().await.unwrap();
    assert!(report.anomalies.iter().all(|a| a.kind == AnomalyKind::DomainDegraded), "got {:?}", report.anomalies);
    assert!(!report.halted);
    assert!(plane.supervisor().degraded_domains().is_empty());
}

#[tokio::test]
async fn test_restore_domain_requires_human_and_degraded_domain() {
    let plane = ControlPlane::builder(policy(), Arc::new(InMemoryAuditLog::new()))
        .with_worker(codex(), Arc::new(GatedWorker::default()))
        .build()
        .unwrap();

    let prime = AgentRecord::prime("prime");
    let err = plane.restore_domain(&codex(), "retry", &prime).await.unwrap_err();
    assert!(matches!(err, RestoreError::NotHumanTier { .. }), "got {err:?}");

    let operator = AgentRecord::human("alice");
    let err = plane.restore_domain(&codex(), "retry", &operator).await.unwrap_err();
    assert!(matches!(err, RestoreError::NotDegraded(_)), "got {err:?}");

    let ops = DomainName::parse("ops").unwrap();
    let err = plane.restore_domain(&ops, "retry", &operator).await.unwrap_err();
    assert!(matches!(err, RestoreError::DomainUnknown(_)), "got {err:?}");
}
