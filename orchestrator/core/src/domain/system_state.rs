// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # System State (BC-5 Supervision Context)
//!
//! Global `RUNNING` / `HALTED` switch shared by every component.
//!
//! ## Linearization
//!
//! Dispatching components hold a [`DispatchPermit`] (a read guard) while they
//! write their `admit`, `route` or `dispatch` entry. Halting takes the write
//! guard. Tokio's `RwLock` is fair, so once a halt is queued no new permit is
//! granted, and every dispatch entry written under a permit is sequenced
//! before the halt entry.
//!
//! Only the supervisor's halter and a human-approved resume change state;
//! both transitions are crate-private.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, OwnedRwLockReadGuard, RwLock};

use crate::domain::agent::AgentId;
use crate::domain::anomaly::AnomalyKind;
use crate::domain::audit::{AuditEntry, Decision, SequenceNumber};
use crate::domain::task::TaskId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaltRecord {
    pub reason: String,
    pub anomaly: Option<AnomalyKind>,
    pub task_id: Option<TaskId>,
    pub agent_id: Option<AgentId>,
    /// Sequence of the entry that triggered the halt.
    pub trigger: Option<SequenceNumber>,
    pub halted_at: DateTime<Utc>,
}

/// What the halter asks for; the state stamps `halted_at` under the lock.
#[derive(Debug, Clone, PartialEq)]
pub struct HaltRequest {
    pub reason: String,
    pub anomaly: Option<AnomalyKind>,
    pub task_id: Option<TaskId>,
    pub agent_id: Option<AgentId>,
    pub trigger: Option<SequenceNumber>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum SystemState {
    Running,
    Halted(HaltRecord),
}

impl SystemState {
    pub fn is_halted(&self) -> bool {
        matches!(self, SystemState::Halted(_))
    }

    /// Rebuild the state from the audit trail: the last `halt` or `resume`
    /// entry wins.
    pub fn replay<'a>(entries: impl IntoIterator<Item = &'a AuditEntry>) -> Self {
        entries.into_iter().fold(SystemState::Running, |state, entry| match entry.decision {
            Decision::Halt => SystemState::Halted(HaltRecord {
                reason: entry.rationale.clone(),
                anomaly: entry.violation_flags.iter().find_map(|f| AnomalyKind::from_flag(*f)),
                task_id: entry.task_id,
                agent_id: entry.related_agent,
                trigger: entry.related_sequence,
                halted_at: entry.timestamp,
            }),
            Decision::Resume => SystemState::Running,
            _ => state,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("system halted since {since}: {reason}")]
pub struct HaltedError {
    pub reason: String,
    pub since: DateTime<Utc>,
}

impl From<&HaltRecord> for HaltedError {
    fn from(record: &HaltRecord) -> Self {
        Self { reason: record.reason.clone(), since: record.halted_at }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HaltTransition {
    Transitioned(HaltRecord),
    AlreadyHalted(HaltRecord),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("system is not halted")]
pub struct NotHalted;

/// Held while writing a dispatch-class audit entry. Blocks halting until
/// dropped.
pub struct DispatchPermit {
    _guard: OwnedRwLockReadGuard<SystemState>,
}

#[derive(Clone)]
pub struct SystemStateHandle {
    inner: Arc<RwLock<SystemState>>,
    watch: Arc<watch::Sender<SystemState>>,
}

impl Default for SystemStateHandle {
    fn default() -> Self {
        Self::new(SystemState::Running)
    }
}

impl std::fmt::Debug for SystemStateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemStateHandle").field("state", &*self.watch.borrow()).finish()
    }
}

impl SystemStateHandle {
    pub fn new(initial: SystemState) -> Self {
        let (tx, _rx) = watch::channel(initial.clone());
        Self { inner: Arc::new(RwLock::new(initial)), watch: Arc::new(tx) }
    }

    pub async fn begin_dispatch(&self) -> Result<DispatchPermit, HaltedError> {
        let guard = self.inner.clone().read_owned().await;
        match &*guard {
            SystemState::Running => Ok(DispatchPermit { _guard: guard }),
            SystemState::Halted(record) => Err(HaltedError::from(record)),
        }
    }

    pub fn snapshot(&self) -> SystemState {
        self.watch.borrow().clone()
    }

    pub fn is_halted(&self) -> bool {
        self.watch.borrow().is_halted()
    }

    pub fn subscribe(&self) -> watch::Receiver<SystemState> {
        self.watch.subscribe()
    }

    pub(crate) async fn halt(&self, request: HaltRequest) -> HaltTransition {
        let mut guard = self.inner.write().await;
        if let SystemState::Halted(existing) = &*guard {
            return HaltTransition::AlreadyHalted(existing.clone());
        }
        let record = HaltRecord {
            reason: request.reason,
            anomaly: request.anomaly,
            task_id: request.task_id,
            agent_id: request.agent_id,
            trigger: request.trigger,
            halted_at: Utc::now(),
        };
        *guard = SystemState::Halted(record.clone());
        self.watch.send_replace(guard.clone());
        HaltTransition::Transitioned(record)
    }

    pub(crate) async fn resume(&self) -> Result<HaltRecord, NotHalted> {
        let mut guard = self.inner.write().await;
        let SystemState::Halted(record) = &*guard else {
            return Err(NotHalted);
        };
        let record = record.clone();
        *guard = SystemState::Running;
        self.watch.send_replace(SystemState::Running);
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::audit::AuditRecord;
    use std::time::Duration;

    fn request(reason: &str) -> HaltRequest {
        HaltRequest { reason: reason.into(), anomaly: None, task_id: None, agent_id: None, trigger: None }
    }

    #[tokio::test]
    async fn test_halt_is_idempotent() {
        let state = SystemStateHandle::default();
        let first = state.halt(request("privilege")).await;
        let second = state.halt(request("gate bypass")).await;

        let HaltTransition::Transitioned(record) = first else { panic!("first halt must transition") };
        assert_eq!(second, HaltTransition::AlreadyHalted(record.clone()));
        assert_eq!(record.reason, "privilege");
        assert!(state.is_halted());
    }

    #[tokio::test]
    async fn test_dispatch_refused_while_halted() {
        let state = SystemStateHandle::default();
        assert!(state.begin_dispatch().await.is_ok());
        state.halt(request("routing loop")).await;
        let err = state.begin_dispatch().await.err().unwrap();
        assert_eq!(err.reason, "routing loop");

        state.resume().await.unwrap();
        assert!(state.begin_dispatch().await.is_ok());
        assert_eq!(state.resume().await, Err(NotHalted));
    }

    #[tokio::test]
    async fn test_halt_waits_for_open_permits() {
        let state = SystemStateHandle::default();
        let permit = state.begin_dispatch().await.unwrap();

        let halting = {
            let state = state.clone();
            tokio::spawn(async move { state.halt(request("anomaly")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!state.is_halted(), "halt must wait for the in-flight dispatch entry");

        drop(permit);
        halting.await.unwrap();
        assert!(state.is_halted());
    }

    #[test]
    fn test_replay_uses_last_transition() {
        let supervisor = AgentId::named("supervisor:supervisor");
        let human = AgentId::named("human:operator");
        let halt = AuditRecord::new(supervisor, Decision::Halt)
            .rationale("gate bypass")
            .related(Some(SequenceNumber(3)), None)
            .sequenced(SequenceNumber(4));
        let resume = AuditRecord::new(human, Decision::Resume).sequenced(SequenceNumber(5));

        let halted = SystemState::replay([&halt]);
        let SystemState::Halted(record) = halted else { panic!("expected halted") };
        assert_eq!(record.trigger, Some(SequenceNumber(3)));

        assert_eq!(SystemState::replay([&halt, &resume]), SystemState::Running);
    }
}
