// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Embedded control plane
//!
//! Builds the control plane in-process over the JSONL audit log named by the
//! configuration. The supervisor is warmed up on existing history so entries
//! handled by an earlier run are not reported again.

use anyhow::{Context, Result};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use codex_core::application::control_plane::ControlPlane;
use codex_core::application::supervisor_monitor::ScanReport;
use codex_core::domain::governance_config::GovernanceConfigManifest;
use codex_core::infrastructure::audit_log::JsonlAuditLog;

/// Flags shared by every command.
#[derive(Debug, Clone, Default)]
pub struct GlobalArgs {
    pub config: Option<PathBuf>,
    pub audit_log: Option<PathBuf>,
}

pub struct EmbeddedControlPlane {
    plane: ControlPlane,
    config: GovernanceConfigManifest,
}

impl EmbeddedControlPlane {
    pub async fn new(args: &GlobalArgs) -> Result<Self> {
        let mut config =
            GovernanceConfigManifest::load_or_default(args.config.clone()).context("Failed to load configuration")?;
        if let Some(path) = &args.audit_log {
            config.spec.audit.path = path.clone();
        }
        config.validate().context("Configuration validation failed")?;

        let audit_path = &config.spec.audit.path;
        let audit = Arc::new(
            JsonlAuditLog::open(audit_path)
                .await
                .with_context(|| format!("Failed to open audit log {}", audit_path.display()))?,
        );
        let plane = ControlPlane::from_manifest(&config, audit)
            .await
            .context("Failed to assemble control plane")?;

        let replayed = plane.supervisor().warm_up().await.context("Failed to read audit log")?;
        debug!(entries = replayed, "Supervisor warmed up on existing audit history");
        info!(audit_log = %audit_path.display(), halted = plane.state().is_halted(), "Control plane ready");

        Ok(Self { plane, config })
    }

    pub fn plane(&self) -> &ControlPlane {
        &self.plane
    }

    pub fn config(&self) -> &GovernanceConfigManifest {
        &self.config
    }

    /// Scan entries written by this command and report what the supervisor
    /// found.
    pub async fn supervise(&self) -> Result<ScanReport> {
        let report = self.plane.supervisor().scan_once().await.context("Supervisor scan failed")?;
        for anomaly in &report.anomalies {
            eprintln!(
                "{} {} at entry {}: {}",
                "anomaly".red().bold(),
                anomaly.kind.as_str().red(),
                anomaly.sequence,
                anomaly.detail
            );
        }
        if report.halted {
            eprintln!("{}", "System HALTED by supervisor. Resume with `codex system resume`.".red().bold());
        }
        Ok(report)
    }
}
