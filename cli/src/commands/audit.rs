// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Audit log queries
//!
//! Commands: range, agent, digest

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use codex_core::application::audit_digest::AuditDigest;
use codex_core::domain::agent::AgentId;
use codex_core::domain::audit::{AuditEntry, Decision, SequenceNumber};

use crate::embedded::{EmbeddedControlPlane, GlobalArgs};

#[derive(Subcommand)]
pub enum AuditCommand {
    /// Entries by sequence number
    Range {
        /// First sequence number (inclusive)
        #[arg(long, default_value = "1")]
        from: u64,

        /// Last sequence number (exclusive)
        #[arg(long)]
        to: Option<u64>,

        /// Print raw JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Most recent entries authored by one agent
    Agent {
        /// Agent id or registered agent name
        #[arg(value_name = "AGENT")]
        agent: String,

        /// Maximum number of entries
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Governance digest over a time window
    Digest {
        /// Window length in days
        #[arg(long, default_value = "7")]
        window_days: u32,

        /// Also write the digest as JSON to this file
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
}

pub async fn handle_command(command: AuditCommand, args: GlobalArgs) -> Result<()> {
    let embedded = EmbeddedControlPlane::new(&args).await?;
    match command {
        AuditCommand::Range { from, to, json } => range(&embedded, from, to, json).await,
        AuditCommand::Agent { agent, limit } => agent_activity(&embedded, &agent, limit).await,
        AuditCommand::Digest { window_days, output } => digest(&embedded, window_days, output).await,
    }
}

async fn range(embedded: &EmbeddedControlPlane, from: u64, to: Option<u64>, json: bool) -> Result<()> {
    let entries = embedded
        .plane()
        .audit_range(SequenceNumber(from.max(1)), to.map(SequenceNumber))
        .await
        .context("Failed to read audit log")?;

    if json {
        for entry in &entries {
            println!("{}", serde_json::to_string(entry)?);
        }
        return Ok(());
    }
    if entries.is_empty() {
        println!("{}", "No entries in range".dimmed());
    }
    for entry in &entries {
        print_entry(entry);
    }
    Ok(())
}

async fn agent_activity(embedded: &EmbeddedControlPlane, agent: &str, limit: usize) -> Result<()> {
    let agent_id = match agent.parse::<AgentId>() {
        Ok(id) => id,
        Err(_) => embedded
            .plane()
            .registry()
            .list()
            .into_iter()
            .find(|record| record.name == agent)
            .map(|record| record.id)
            .with_context(|| format!("'{agent}' is neither an agent id nor a registered agent name"))?,
    };

    let entries = embedded
        .plane()
        .agent_activity(agent_id, limit)
        .await
        .context("Failed to read audit log")?;
    println!("{} {} ({} entries)", "Agent".bold(), agent_id, entries.len());
    for entry in &entries {
        print_entry(entry);
    }
    Ok(())
}

async fn digest(embedded: &EmbeddedControlPlane, window_days: u32, output: Option<PathBuf>) -> Result<()> {
    let digest = embedded.plane().digest(window_days).await.context("Failed to compute digest")?;
    print_digest(&digest);

    if let Some(path) = output {
        let body = serde_json::to_string_pretty(&digest)?;
        std::fs::write(&path, body).with_context(|| format!("Failed to write digest to {:?}", path))?;
        println!("{}", format!("✓ Digest written: {}", path.display()).green());
    }
    Ok(())
}

fn print_digest(digest: &AuditDigest) {
    println!(
        "{} last {} day(s): {} → {}",
        "Governance digest".bold(),
        digest.window_days,
        digest.since.format("%Y-%m-%d %H:%M"),
        digest.until.format("%Y-%m-%d %H:%M")
    );
    println!("  Entries: {}", digest.entries_considered);
    println!("  Tasks:   {}", digest.tasks_considered);
    match digest.average_dispatch_attempts {
        Some(avg) => println!("  Avg dispatch attempts: {avg:.2}"),
        None => println!("  Avg dispatch attempts: {}", "n/a".dimmed()),
    }
    let halts = if digest.halts > 0 { digest.halts.to_string().red() } else { digest.halts.to_string().green() };
    println!("  Halts:   {}", halts);
    println!();

    println!("{}", "Decisions:".bold());
    for (decision, count) in &digest.decision_counts {
        println!("  {:<18} {}", decision.as_str(), count);
    }
    println!();

    println!("{}", "Domains:".bold());
    for (name, summary) in &digest.domains {
        println!(
            "  {} admitted {}, escalated {}, delivered {}",
            name.bold(),
            summary.admitted,
            summary.escalated,
            summary.delivered
        );
        for (outcome, count) in &summary.outcomes {
            println!("    {:<24} {}", outcome, count);
        }
    }

    if !digest.anomalies.is_empty() {
        println!();
        println!("{}", "Anomalies:".bold());
        for (kind, count) in &digest.anomalies {
            println!("  {:<24} {}", kind.yellow(), count);
        }
    }
}

/// One-line rendering of an audit entry.
pub fn print_entry(entry: &AuditEntry) {
    let decision = match entry.decision {
        Decision::Halt | Decision::Anomaly | Decision::Takeover => entry.decision.as_str().red().bold(),
        Decision::Reject
        | Decision::ValidateReject
        | Decision::OutputReject
        | Decision::Fail
        | Decision::HumanReject
        | Decision::HumanTimeout
        | Decision::DeliveryFailed => entry.decision.as_str().yellow(),
        Decision::ApproveTier2 | Decision::ApproveTier3 | Decision::Deliver | Decision::Resume => {
            entry.decision.as_str().green()
        }
        _ => entry.decision.as_str().normal(),
    };

    let task = entry.task_id.map(|t| t.to_string()).unwrap_or_else(|| "-".to_string());
    let domain = entry.domain.as_ref().map(|d| d.as_str()).unwrap_or("-");
    println!(
        "{:>6} {} {:<16} {} {:<10} {}",
        entry.sequence.to_string().dimmed(),
        entry.timestamp.format("%H:%M:%S%.3f"),
        decision,
        task.dimmed(),
        domain,
        entry.rationale
    );
    if !entry.violation_flags.is_empty() {
        let flags: Vec<String> = entry
            .violation_flags
            .iter()
            .filter_map(|f| serde_json::to_value(f).ok())
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        println!("{:>6} flags: {}", "", flags.join(", ").red());
    }
}
