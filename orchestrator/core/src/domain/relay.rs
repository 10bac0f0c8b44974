// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Relay Contracts (BC-4 Relay Context)
//!
//! Outbound delivery to external systems. The relay transport in
//! `crate::application::relay_transport` owns schema validation, digests and
//! audit; adapters implementing [`RelayAdapter`] only move bytes and report
//! what the external system received.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

use crate::domain::task::{ApprovalTier, TaskId};

/// Name of an external target such as `chat-workspace` or `records-store`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TargetSystemRef(String);

impl TargetSystemRef {
    pub fn parse(raw: &str) -> Result<Self, TransportError> {
        let trimmed = raw.trim();
        let valid = !trimmed.is_empty()
            && trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
        if !valid {
            return Err(TransportError::UnknownTarget(raw.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TargetSystemRef {
    type Error = TransportError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TargetSystemRef> for String {
    fn from(value: TargetSystemRef) -> Self {
        value.0
    }
}

impl fmt::Display for TargetSystemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What an adapter reports back after a transfer.
#[derive(Debug, Clone)]
pub struct AdapterAck {
    /// The payload as the external system stored it.
    pub echoed_payload: Value,
    /// Identifier the external system assigned (message id, record key, path).
    pub external_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryReceipt {
    pub task_id: TaskId,
    pub target: TargetSystemRef,
    pub external_ref: String,
    pub payload_digest: String,
    pub delivered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("unknown delivery target '{0}'")]
    UnknownTarget(String),
    #[error("payload for '{target}' does not match its schema: {}", errors.join("; "))]
    SchemaMismatch { target: String, errors: Vec<String> },
    #[error("integrity check failed: sent {expected}, target holds {actual}")]
    Integrity { expected: String, actual: String },
    #[error("target schema is invalid: {0}")]
    InvalidSchema(String),
    #[error("task is at {actual} but delivery requires {required}")]
    Unapproved { required: ApprovalTier, actual: ApprovalTier },
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("audit write failed during delivery: {0}")]
    AuditWrite(String),
}

/// Transport to one kind of external system.
#[async_trait]
pub trait RelayAdapter: Send + Sync {
    async fn send(&self, target: &TargetSystemRef, payload: &Value) -> Result<AdapterAck, TransportError>;
}
