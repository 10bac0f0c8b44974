// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Supervisor Monitor - out-of-band anomaly scanning over the audit log
//!
//! The supervisor only reads the audit log and writes `anomaly` and `halt`
//! entries. It never routes, dispatches or approves.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Feeds the audit stream through [`AnomalyDetector`] and acts
//!   on what it reports
//! - **Halting kinds:** escalation skip, privilege violation, routing loop,
//!   gate bypass. Everything else is recorded and published only.

use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::agent::{Agent, AgentRecord, AgentRegistry};
use crate::domain::anomaly::{Anomaly, AnomalyDetector, AnomalyKind, DetectorConfig};
use crate::domain::audit::{AuditRecord, Decision, SequenceNumber};
use crate::domain::events::GovernanceEvent;
use crate::domain::policy::PolicyStore;
use crate::domain::repository::{AuditLog, AuditQueryError};
use crate::domain::system_state::{HaltRequest, HaltTransition, SystemStateHandle};
use crate::domain::task::DomainName;
use crate::infrastructure::event_bus::EventBus;

/// The only path into the halted state.
///
/// The `halt` entry is written once, on the transition, stamped with the
/// transition time. A failed write leaves the system halted.
pub struct Halter {
    record: AgentRecord,
    state: SystemStateHandle,
    audit: Arc<dyn AuditLog>,
    events: Arc<EventBus>,
}

impl Halter {
    pub fn new(record: AgentRecord, state: SystemStateHandle, audit: Arc<dyn AuditLog>, events: Arc<EventBus>) -> Self {
        Self { record, state, audit, events }
    }

    pub fn state(&self) -> &SystemStateHandle {
        &self.state
    }

    pub async fn halt(&self, request: HaltRequest) -> HaltTransition {
        let transition = self.state.halt(request).await;
        let HaltTransition::Transitioned(halt) = &transition else {
            debug!("Halt requested while already halted");
            return transition;
        };

        let mut entry = AuditRecord::new(self.record.id, Decision::Halt)
            .rationale(halt.reason.clone())
            .related(halt.trigger, halt.agent_id)
            .at(halt.halted_at);
        if let Some(kind) = halt.anomaly {
            entry = entry.flag(kind.flag());
        }
        if let Some(task_id) = halt.task_id {
            entry = entry.task(task_id);
        }
        if let Err(e) = self.audit.append(entry).await {
            error!(error = %e, "Halt entry could not be written; system stays halted");
        }

        metrics::counter!("codex_halts_total").increment(1);
        self.events.publish(GovernanceEvent::SystemHalted {
            reason: halt.reason.clone(),
            task_id: halt.task_id,
            halted_at: halt.halted_at,
        });
        error!(reason = %halt.reason, trigger = ?halt.trigger, "System halted");
        transition
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub scan_interval: Duration,
    pub detector: DetectorConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { scan_interval: Duration::from_secs(2), detector: DetectorConfig::default() }
    }
}

#[derive(Debug, Default)]
pub struct ScanReport {
    pub scanned: usize,
    pub anomalies: Vec<Anomaly>,
    pub halted: bool,
}

struct ScanState {
    cursor: SequenceNumber,
    detector: AnomalyDetector,
}

pub struct SupervisorMonitor {
    record: AgentRecord,
    audit: Arc<dyn AuditLog>,
    registry: Arc<AgentRegistry>,
    halter: Arc<Halter>,
    events: Arc<EventBus>,
    config: MonitorConfig,
    scan: Mutex<ScanState>,
    degraded: RwLock<BTreeSet<DomainName>>,
    shutdown_token: CancellationToken,
}

impl Agent for SupervisorMonitor {
    fn record(&self) -> &AgentRecord {
        &self.record
    }
}

impl SupervisorMonitor {
    pub fn new(
        record: AgentRecord,
        audit: Arc<dyn AuditLog>,
        registry: Arc<AgentRegistry>,
        policy: Arc<PolicyStore>,
        halter: Arc<Halter>,
        events: Arc<EventBus>,
        config: MonitorConfig,
    ) -> Self {
        let detector = AnomalyDetector::new(policy, config.detector.clone());
        Self {
            record,
            audit,
            registry,
            halter,
            events,
            config,
            scan: Mutex::new(ScanState { cursor: SequenceNumber::FIRST, detector }),
            degraded: RwLock::new(BTreeSet::new()),
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Domains Prime has taken over since this monitor started, less those a
    /// human has restored since.
    pub fn degraded_domains(&self) -> BTreeSet<DomainName> {
        self.degraded.read().clone()
    }

    pub fn clear_degraded(&self, domain: &DomainName) -> bool {
        let cleared = self.degraded.write().remove(domain);
        if cleared {
            info!(domain = %domain, "Domain no longer degraded");
        }
        cleared
    }

    /// Feed existing entries to the detector without acting on them, so a
    /// restarted process does not re-report anomalies already handled.
    pub async fn warm_up(&self) -> Result<usize, AuditQueryError> {
        let mut scan = self.scan.lock().await;
        let entries = self.audit.range(scan.cursor, None).await?;
        for entry in &entries {
            scan.cursor = entry.sequence.next();
            scan.detector.observe(entry, &self.registry);
        }
        debug!(entries = entries.len(), "Supervisor warmed up");
        Ok(entries.len())
    }

    /// Read every entry written since the last scan and act on anomalies.
    pub async fn scan_once(&self) -> Result<ScanReport, AuditQueryError> {
        let mut scan = self.scan.lock().await;
        let entries = self.audit.range(scan.cursor, None).await?;
        let mut report = ScanReport::default();

        for entry in &entries {
            scan.cursor = entry.sequence.next();
            report.scanned += 1;
            let anomalies = scan.detector.observe(entry, &self.registry);
            if entry.decision == Decision::Restore && anomalies.is_empty() {
                if let Some(domain) = &entry.domain {
                    self.clear_degraded(domain);
                }
            }
            for anomaly in anomalies {
                report.halted |= self.handle(&anomaly).await;
                report.anomalies.push(anomaly);
            }
        }
        Ok(report)
    }

    /// Returns true when this anomaly moved the system into the halted state.
    async fn handle(&self, anomaly: &Anomaly) -> bool {
        metrics::counter!("codex_anomalies_total", "kind" => anomaly.kind.as_str()).increment(1);
        self.events.publish(GovernanceEvent::AnomalyDetected {
            kind: anomaly.kind,
            task_id: anomaly.task_id,
            agent_id: anomaly.agent_id,
            sequence: anomaly.sequence,
            detected_at: chrono::Utc::now(),
        });

        if anomaly.kind.halts() {
            let request = HaltRequest {
                reason: format!("{}: {}", anomaly.kind, anomaly.detail),
                anomaly: Some(anomaly.kind),
                task_id: anomaly.task_id,
                agent_id: Some(anomaly.agent_id),
                trigger: Some(anomaly.sequence),
            };
            return matches!(self.halter.halt(request).await, HaltTransition::Transitioned(_));
        }

        if anomaly.kind == AnomalyKind::DomainDegraded {
            if let Some(domain) = &anomaly.domain {
                self.degraded.write().insert(domain.clone());
            }
        }

        let mut entry = AuditRecord::new(self.record.id, Decision::Anomaly)
            .rationale(anomaly.detail.clone())
            .flag(anomaly.kind.flag())
            .related(Some(anomaly.sequence), Some(anomaly.agent_id));
        if let Some(task_id) = anomaly.task_id {
            entry = entry.task(task_id);
        }
        if let Some(domain) = &anomaly.domain {
            entry = entry.domain(domain.clone());
        }
        if let Err(e) = self.audit.append(entry).await {
            error!(error = %e, kind = %anomaly.kind, "Anomaly entry could not be written");
        }
        warn!(kind = %anomaly.kind, task_id = ?anomaly.task_id, detail = %anomaly.detail, "Anomaly recorded");
        false
    }

    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        info!(interval_ms = self.config.scan_interval.as_millis() as u64, "Starting supervisor monitor");
        let mut tick = interval(self.config.scan_interval);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match self.scan_once().await {
                        Ok(report) if !report.anomalies.is_empty() => {
                            info!(scanned = report.scanned, anomalies = report.anomalies.len(), halted = report.halted, "Supervisor scan completed");
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Supervisor scan failed: {}", e),
                    }
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Supervisor monitor shutting down");
                    break;
                }
            }
        }
    }
}
