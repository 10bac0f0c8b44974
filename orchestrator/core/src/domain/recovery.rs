// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # STOP-RESET-REALIGN Planning
//!
//! After a halt, the resume path needs to know which work can no longer be
//! trusted. [`plan_reset`] answers that from the audit trail alone: any task
//! that put an artifact into circulation at or after the halt trigger is
//! quarantined, together with the task that triggered the halt.
//!
//! Everything sequenced before the trigger is the last known good state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::domain::audit::{AuditEntry, Decision, SequenceNumber};
use crate::domain::task::TaskId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantinedArtifact {
    pub task_id: TaskId,
    pub sequence: SequenceNumber,
    pub decision: Decision,
    pub digest: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResetPlan {
    pub trigger: Option<SequenceNumber>,
    pub last_known_good: Option<SequenceNumber>,
    pub quarantined_tasks: BTreeSet<TaskId>,
    pub quarantined_artifacts: Vec<QuarantinedArtifact>,
}

impl ResetPlan {
    pub fn quarantines(&self, task_id: TaskId) -> bool {
        self.quarantined_tasks.contains(&task_id)
    }
}

/// Build the reset plan for a halt triggered at `trigger`.
///
/// `entries` may contain anything; only those at or after the trigger are
/// considered. A halt with no trigger (a Prime fault) quarantines only the
/// triggering task, if any.
pub fn plan_reset(entries: &[AuditEntry], trigger: Option<SequenceNumber>, triggering_task: Option<TaskId>) -> ResetPlan {
    let mut plan = ResetPlan {
        trigger,
        last_known_good: trigger.and_then(SequenceNumber::prev),
        ..ResetPlan::default()
    };

    if let Some(task_id) = triggering_task {
        plan.quarantined_tasks.insert(task_id);
    }

    let Some(trigger) = trigger else {
        return plan;
    };

    for entry in entries.iter().filter(|e| e.sequence >= trigger && e.decision.circulates_artifact()) {
        let Some(task_id) = entry.task_id else { continue };
        plan.quarantined_tasks.insert(task_id);
        plan.quarantined_artifacts.push(QuarantinedArtifact {
            task_id,
            sequence: entry.sequence,
            decision: entry.decision,
            digest: entry.output_digest.clone(),
        });
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::AgentId;
    use crate::domain::audit::AuditRecord;

    fn entry(seq: u64, task: TaskId, decision: Decision) -> AuditEntry {
        AuditRecord::new(AgentId::new(), decision)
            .task(task)
            .output_digest(format!("d{seq}"))
            .sequenced(SequenceNumber(seq))
    }

    #[test]
    fn test_only_post_trigger_artifacts_are_quarantined() {
        let early = TaskId::new();
        let late = TaskId::new();
        let waiting = TaskId::new();
        let entries = vec![
            entry(1, early, Decision::Produce),
            entry(2, early, Decision::OutputAccept),
            entry(3, late, Decision::Dispatch),
            entry(4, waiting, Decision::Dispatch),
            entry(5, late, Decision::Produce),
            entry(6, waiting, Decision::Hold),
        ];

        let plan = plan_reset(&entries, Some(SequenceNumber(4)), None);
        assert_eq!(plan.last_known_good, Some(SequenceNumber(3)));
        assert!(plan.quarantines(late));
        assert!(!plan.quarantines(early));
        assert!(!plan.quarantines(waiting));
        assert_eq!(plan.quarantined_artifacts.len(), 1);
        assert_eq!(plan.quarantined_artifacts[0].digest.as_deref(), Some("d5"));
    }

    #[test]
    fn test_triggering_task_always_quarantined() {
        let culprit = TaskId::new();
        let plan = plan_reset(&[], None, Some(culprit));
        assert!(plan.quarantines(culprit));
        assert_eq!(plan.last_known_good, None);
    }
}
