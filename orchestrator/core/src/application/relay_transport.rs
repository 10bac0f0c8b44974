// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Relay Transport (BC-4 Relay Context)
//!
//! The single outbound path. Delivery requires the task's approval gate to be
//! satisfied, a registered target, a payload matching the target's schema, and
//! a post-send echo whose digest equals the digest of what was sent.
//!
//! | Failure | Audit decision | Flag |
//! |---------|----------------|------|
//! | gate not met | `delivery-failed` | `gate_bypass` |
//! | schema mismatch | `delivery-failed` | `schema_mismatch` |
//! | echo digest differs | `delivery-failed` | `integrity` |
//! | adapter error | `delivery-failed` | none |
//!
//! Nothing is retried here. A failed delivery returns to Prime.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::domain::agent::{Agent, AgentRecord};
use crate::domain::audit::{AuditRecord, Decision, ViolationFlag};
use crate::domain::digest::digest_of;
use crate::domain::relay::{DeliveryReceipt, RelayAdapter, TargetSystemRef, TransportError};
use crate::domain::repository::AuditLog;
use crate::domain::task::TaskPackage;
use crate::domain::worker::Artifact;

struct RelayTarget {
    schema: Option<jsonschema::Validator>,
    adapter: Arc<dyn RelayAdapter>,
}

pub struct RelayTransport {
    record: AgentRecord,
    targets: HashMap<TargetSystemRef, RelayTarget>,
    audit: Arc<dyn AuditLog>,
}

impl Agent for RelayTransport {
    fn record(&self) -> &AgentRecord {
        &self.record
    }
}

impl RelayTransport {
    pub fn new(audit: Arc<dyn AuditLog>) -> Self {
        Self { record: AgentRecord::relay("relay"), targets: HashMap::new(), audit }
    }

    /// Register a target. `schema` is a JSON Schema document for payloads.
    pub fn with_target(
        mut self,
        target: TargetSystemRef,
        schema: Option<&Value>,
        adapter: Arc<dyn RelayAdapter>,
    ) -> Result<Self, TransportError> {
        let schema = schema
            .map(|s| jsonschema::validator_for(s).map_err(|e| TransportError::InvalidSchema(format!("{target}: {e}"))))
            .transpose()?;
        self.targets.insert(target, RelayTarget { schema, adapter });
        Ok(self)
    }

    pub fn knows(&self, target: &TargetSystemRef) -> bool {
        self.targets.contains_key(target)
    }

    pub fn targets(&self) -> impl Iterator<Item = &TargetSystemRef> {
        self.targets.keys()
    }

    /// Validate, send, verify and record one delivery.
    pub async fn deliver(&self, task: &TaskPackage, artifact: &Artifact) -> Result<DeliveryReceipt, TransportError> {
        let sent_digest = digest_of(&artifact.content);

        if !task.gate_satisfied() {
            let err = TransportError::Unapproved { required: task.requires().required_tier(), actual: task.tier() };
            return Err(self.refuse(task, &sent_digest, err, Some(ViolationFlag::GateBypass)).await);
        }
        let Some(target) = task.deliver_to.as_ref() else {
            let err = TransportError::UnknownTarget("<none>".to_string());
            return Err(self.refuse(task, &sent_digest, err, None).await);
        };
        let Some(entry) = self.targets.get(target) else {
            let err = TransportError::UnknownTarget(target.to_string());
            return Err(self.refuse(task, &sent_digest, err, None).await);
        };

        if let Some(schema) = &entry.schema {
            let errors: Vec<String> = schema.iter_errors(&artifact.content).map(|e| e.to_string()).collect();
            if !errors.is_empty() {
                let err = TransportError::SchemaMismatch { target: target.to_string(), errors };
                return Err(self.refuse(task, &sent_digest, err, Some(ViolationFlag::SchemaMismatch)).await);
            }
        }

        let ack = match entry.adapter.send(target, &artifact.content).await {
            Ok(ack) => ack,
            Err(err) => return Err(self.refuse(task, &sent_digest, err, None).await),
        };

        let echoed_digest = digest_of(&ack.echoed_payload);
        if echoed_digest != sent_digest {
            let err = TransportError::Integrity { expected: sent_digest.clone(), actual: echoed_digest };
            return Err(self.refuse(task, &sent_digest, err, Some(ViolationFlag::Integrity)).await);
        }

        let receipt = DeliveryReceipt {
            task_id: task.task_id,
            target: target.clone(),
            external_ref: ack.external_ref,
            payload_digest: sent_digest,
            delivered_at: chrono::Utc::now(),
        };
        self.audit
            .append(
                AuditRecord::for_task(task, self.record.id, Decision::Deliver)
                    .output_digest(receipt.payload_digest.clone())
                    .rationale(format!("delivered to {} as {}", receipt.target, receipt.external_ref)),
            )
            .await
            .map_err(|e| {
                error!(task_id = %task.task_id, error = %e, "Delivery succeeded but was not recorded");
                TransportError::AuditWrite(e.to_string())
            })?;

        metrics::counter!("codex_deliveries_total", "outcome" => "delivered").increment(1);
        info!(task_id = %task.task_id, target = %receipt.target, external_ref = %receipt.external_ref, "Artifact delivered");
        Ok(receipt)
    }

    async fn refuse(
        &self,
        task: &TaskPackage,
        digest: &str,
        err: TransportError,
        flag: Option<ViolationFlag>,
    ) -> TransportError {
        metrics::counter!("codex_deliveries_total", "outcome" => "failed").increment(1);
        warn!(task_id = %task.task_id, error = %err, "Delivery refused");

        let mut record = AuditRecord::for_task(task, self.record.id, Decision::DeliveryFailed)
            .output_digest(digest)
            .rationale(err.to_string());
        if let Some(flag) = flag {
            record = record.flag(flag);
        }
        match self.audit.append(record).await {
            Ok(_) => err,
            Err(audit_err) => TransportError::AuditWrite(audit_err.to_string()),
        }
    }
}
