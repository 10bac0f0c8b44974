// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Relay adapters for external targets.
//!
//! - [`MemoryRelayAdapter`] keeps deliveries in process memory.
//! - [`OutboxRelayAdapter`] writes one JSON file per delivery and echoes back
//!   what it reads from disk, so the relay's integrity check covers the
//!   storage round trip.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::path::PathBuf;
use tracing::debug;
use uuid::Uuid;

use crate::domain::relay::{AdapterAck, RelayAdapter, TargetSystemRef, TransportError};

#[derive(Default)]
pub struct MemoryRelayAdapter {
    delivered: Mutex<Vec<(TargetSystemRef, Value)>>,
}

impl MemoryRelayAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<(TargetSystemRef, Value)> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl RelayAdapter for MemoryRelayAdapter {
    async fn send(&self, target: &TargetSystemRef, payload: &Value) -> Result<AdapterAck, TransportError> {
        let mut delivered = self.delivered.lock();
        delivered.push((target.clone(), payload.clone()));
        Ok(AdapterAck { echoed_payload: payload.clone(), external_ref: format!("memory:{}", delivered.len()) })
    }
}

pub struct OutboxRelayAdapter {
    root: PathBuf,
}

impl OutboxRelayAdapter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl RelayAdapter for OutboxRelayAdapter {
    async fn send(&self, target: &TargetSystemRef, payload: &Value) -> Result<AdapterAck, TransportError> {
        let dir = self.root.join(target.as_str().replace('/', "_"));
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| TransportError::Delivery(format!("cannot create outbox {}: {e}", dir.display())))?;

        let path = dir.join(format!("{}.json", Uuid::new_v4()));
        let body = serde_json::to_vec_pretty(payload).map_err(|e| TransportError::Delivery(e.to_string()))?;
        tokio::fs::write(&path, &body)
            .await
            .map_err(|e| TransportError::Delivery(format!("cannot write {}: {e}", path.display())))?;

        let stored = tokio::fs::read(&path)
            .await
            .map_err(|e| TransportError::Delivery(format!("cannot read back {}: {e}", path.display())))?;
        let echoed_payload: Value =
            serde_json::from_slice(&stored).map_err(|e| TransportError::Delivery(e.to_string()))?;

        debug!(target = %target, path = %path.display(), "Outbox delivery written");
        Ok(AdapterAck { echoed_payload, external_ref: path.display().to_string() })
    }
}
