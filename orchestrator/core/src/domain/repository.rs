// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Audit Log Repository Interface
//!
//! Persistence contract for the audit trail. The trait lives in the domain
//! layer; implementations live in `crate::infrastructure`.
//!
//! | Implementation | Durability | Use |
//! |----------------|------------|-----|
//! | `InMemoryAuditLog` | process lifetime | tests, embedded runs |
//! | `JsonlAuditLog` | fsync per entry | CLI, single-node deployments |
//!
//! `append` must not return until the entry is durable in the backend's
//! sense. A failed append leaves no entry behind and consumes no sequence
//! number.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::agent::AgentId;
use crate::domain::audit::{AuditEntry, AuditRecord, SequenceNumber};
use crate::domain::task::TaskId;

#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Assign the next sequence number and persist the entry.
    async fn append(&self, record: AuditRecord) -> Result<AuditEntry, AuditWriteError>;

    /// Every entry for `task_id`, oldest first.
    async fn by_task(&self, task_id: TaskId) -> Result<Vec<AuditEntry>, AuditQueryError>;

    /// The most recent `limit` entries authored by `agent_id`, oldest first.
    async fn by_agent(&self, agent_id: AgentId, limit: usize) -> Result<Vec<AuditEntry>, AuditQueryError>;

    /// Entries with `from <= sequence`, and `sequence < to` when `to` is given.
    async fn range(
        &self,
        from: SequenceNumber,
        to: Option<SequenceNumber>,
    ) -> Result<Vec<AuditEntry>, AuditQueryError>;

    /// Entries whose timestamp falls in `[since, until)`.
    async fn between(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<AuditEntry>, AuditQueryError> {
        let all = self.range(SequenceNumber::FIRST, None).await?;
        Ok(all
            .into_iter()
            .filter(|e| e.timestamp >= since && e.timestamp < until)
            .collect())
    }

    async fn latest_sequence(&self) -> Result<Option<SequenceNumber>, AuditQueryError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuditWriteError {
    #[error("audit store I/O error: {0}")]
    Io(String),
    #[error("audit entry could not be encoded: {0}")]
    Encoding(String),
    #[error("audit store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuditQueryError {
    #[error("audit store I/O error: {0}")]
    Io(String),
    #[error("audit store is corrupt at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },
    #[error("audit store unavailable: {0}")]
    Unavailable(String),
}
