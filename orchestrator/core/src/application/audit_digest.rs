// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Audit digest: a periodic governance summary computed from the audit log.
//!
//! The digest is read-only. It never writes to the log and holds no state
//! between runs.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::application::router::RETIRED_PREFIX;
use crate::domain::audit::{AuditEntry, Decision};
use crate::domain::repository::{AuditLog, AuditQueryError};
use crate::domain::task::TaskId;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DomainSummary {
    pub admitted: usize,
    pub escalated: usize,
    pub delivered: usize,
    /// Terminal outcome label to count, taken from `retire` entries.
    pub outcomes: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditDigest {
    pub window_days: u32,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub entries_considered: usize,
    pub tasks_considered: usize,
    pub decision_counts: BTreeMap<Decision, usize>,
    pub domains: BTreeMap<String, DomainSummary>,
    /// Anomaly kind (by violation flag) to count, across anomaly and halt entries.
    pub anomalies: BTreeMap<String, usize>,
    pub halts: usize,
    pub average_dispatch_attempts: Option<f64>,
}

impl AuditDigest {
    /// Summarize `entries` whose timestamps fall in `[since, until)`.
    pub fn from_entries(entries: &[AuditEntry], window_days: u32, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        let mut digest = AuditDigest {
            window_days,
            since,
            until,
            entries_considered: 0,
            tasks_considered: 0,
            decision_counts: BTreeMap::new(),
            domains: BTreeMap::new(),
            anomalies: BTreeMap::new(),
            halts: 0,
            average_dispatch_attempts: None,
        };
        let mut tasks: BTreeSet<TaskId> = BTreeSet::new();
        let mut dispatches: BTreeMap<TaskId, usize> = BTreeMap::new();

        for entry in entries.iter().filter(|e| e.timestamp >= since && e.timestamp < until) {
            digest.entries_considered += 1;
            *digest.decision_counts.entry(entry.decision).or_insert(0) += 1;
            if let Some(task_id) = entry.task_id {
                tasks.insert(task_id);
            }

            match entry.decision {
                Decision::Anomaly | Decision::Halt => {
                    if entry.decision == Decision::Halt {
                        digest.halts += 1;
                    }
                    for flag in &entry.violation_flags {
                        let key = serde_json::to_value(flag)
                            .ok()
                            .and_then(|v| v.as_str().map(str::to_string))
                            .unwrap_or_else(|| format!("{flag:?}"));
                        *digest.anomalies.entry(key).or_insert(0) += 1;
                    }
                }
                Decision::Dispatch => {
                    if let Some(task_id) = entry.task_id {
                        *dispatches.entry(task_id).or_insert(0) += 1;
                    }
                }
                _ => {}
            }

            let Some(domain) = &entry.domain else { continue };
            let summary = digest.domains.entry(domain.to_string()).or_default();
            match entry.decision {
                Decision::Admit => summary.admitted += 1,
                Decision::Escalate => summary.escalated += 1,
                Decision::Deliver => summary.delivered += 1,
                Decision::Retire => {
                    let label = entry.rationale.strip_prefix(RETIRED_PREFIX).unwrap_or("quarantined");
                    *summary.outcomes.entry(label.to_string()).or_insert(0) += 1;
                }
                _ => {}
            }
        }

        digest.tasks_considered = tasks.len();
        if !dispatches.is_empty() {
            let total: usize = dispatches.values().sum();
            digest.average_dispatch_attempts = Some(total as f64 / dispatches.len() as f64);
        }
        digest
    }

    /// Digest of the last `window_days` days ending at `now`.
    pub async fn generate(audit: &dyn AuditLog, window_days: u32, now: DateTime<Utc>) -> Result<Self, AuditQueryError> {
        let since = now - Duration::days(i64::from(window_days));
        let entries = audit.between(since, now).await?;
        Ok(Self::from_entries(&entries, window_days, since, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::AgentId;
    use crate::domain::audit::{AuditRecord, ViolationFlag};
    use crate::domain::task::DomainName;
    use crate::infrastructure::audit_log::InMemoryAuditLog;

    #[tokio::test]
    async fn test_digest_counts_window() {
        let audit = InMemoryAuditLog::new();
        let prime = AgentId::named("prime");
        let codex = DomainName::parse("codex").unwrap();
        let a = TaskId::new();
        let b = TaskId::new();
        let now = Utc::now();

        let old = now - Duration::days(30);
        audit.append(AuditRecord::new(prime, Decision::Admit).task(a).domain(codex.clone()).at(old)).await.unwrap();

        for (task, dispatches) in [(a, 1), (b, 3)] {
            audit.append(AuditRecord::new(prime, Decision::Admit).task(task).domain(codex.clone())).await.unwrap();
            for _ in 0..dispatches {
                audit.append(AuditRecord::new(prime, Decision::Dispatch).task(task).domain(codex.clone())).await.unwrap();
            }
        }
        audit
            .append(
                AuditRecord::new(prime, Decision::Retire)
                    .task(a)
                    .domain(codex.clone())
                    .rationale(format!("{RETIRED_PREFIX}approved")),
            )
            .await
            .unwrap();
        audit
            .append(AuditRecord::new(prime, Decision::Halt).flag(ViolationFlag::GateBypass))
            .await
            .unwrap();

        let digest = AuditDigest::generate(&audit, 7, now + Duration::seconds(5)).await.unwrap();
        assert_eq!(digest.tasks_considered, 2);
        assert_eq!(digest.decision_counts[&Decision::Admit], 2);
        assert_eq!(digest.halts, 1);
        assert_eq!(digest.anomalies["gate_bypass"], 1);
        assert_eq!(digest.average_dispatch_attempts, Some(2.0));

        let codex_summary = &digest.domains["codex"];
        assert_eq!(codex_summary.admitted, 2);
        assert_eq!(codex_summary.outcomes["approved"], 1);
    }

    #[test]
    fn test_empty_window() {
        let now = Utc::now();
        let digest = AuditDigest::from_entries(&[], 7, now - Duration::days(7), now);
        assert_eq!(digest.entries_considered, 0);
        assert!(digest.average_dispatch_attempts.is_none());
    }
}
