// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! System state commands
//!
//! Commands: status, halt, resume

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;

use codex_core::domain::agent::AgentRecord;
use codex_core::domain::system_state::{HaltTransition, SystemState};

use crate::embedded::{EmbeddedControlPlane, GlobalArgs};

#[derive(Subcommand)]
pub enum SystemCommand {
    /// Show whether the system is running or halted
    Status,

    /// Stop all dispatch until a human resumes
    Halt {
        /// Reason recorded in the audit log
        #[arg(long)]
        reason: String,
    },

    /// Reset and resume after a halt (human operators only)
    Resume {
        /// Reason recorded in the audit log
        #[arg(long)]
        reason: String,

        /// Name of the approving human operator
        #[arg(long, value_name = "NAME")]
        approver: String,
    },
}

pub async fn handle_command(command: SystemCommand, args: GlobalArgs) -> Result<()> {
    let embedded = EmbeddedControlPlane::new(&args).await?;
    match command {
        SystemCommand::Status => status(&embedded).await,
        SystemCommand::Halt { reason } => halt(&embedded, &reason).await,
        SystemCommand::Resume { reason, approver } => resume(&embedded, &reason, &approver).await,
    }
}

async fn status(embedded: &EmbeddedControlPlane) -> Result<()> {
    let plane = embedded.plane();
    match plane.state().snapshot() {
        SystemState::Running => println!("{} {}", "System:".bold(), "RUNNING".green().bold()),
        SystemState::Halted(halt) => {
            println!("{} {}", "System:".bold(), "HALTED".red().bold());
            println!("  Reason:  {}", halt.reason);
            println!("  Since:   {}", halt.halted_at.to_rfc3339());
            if let Some(kind) = halt.anomaly {
                println!("  Anomaly: {}", kind.as_str().red());
            }
            if let Some(trigger) = halt.trigger {
                println!("  Trigger: entry {}", trigger);
            }
            if let Some(task_id) = halt.task_id {
                println!("  Task:    {}", task_id);
            }
        }
    }

    let latest = plane.audit().latest_sequence().await.context("Failed to read audit log")?;
    println!(
        "{} {}",
        "Audit log:".bold(),
        match latest {
            Some(seq) => format!("{} entries in {}", seq, embedded.config().spec.audit.path.display()),
            None => format!("empty ({})", embedded.config().spec.audit.path.display()),
        }
    );

    println!("{}", "Domains:".bold());
    let mut domains: Vec<_> = plane.router().domains().cloned().collect();
    domains.sort();
    for domain in domains {
        let policy = plane.policy().domain(&domain);
        println!(
            "  {} (max attempts {}, concurrency {})",
            domain.as_str().bold(),
            policy.map_or(0, |p| p.max_attempts),
            policy.map_or(0, |p| p.max_concurrency)
        );
    }
    Ok(())
}

async fn halt(embedded: &EmbeddedControlPlane, reason: &str) -> Result<()> {
    match embedded.plane().halt(reason).await {
        HaltTransition::Transitioned(_) => {
            println!("{}", "✓ System halted. No task will be dispatched until a human resumes.".red().bold());
        }
        HaltTransition::AlreadyHalted(existing) => {
            println!("{} {}", "System was already halted:".yellow(), existing.reason);
        }
    }
    Ok(())
}

async fn resume(embedded: &EmbeddedControlPlane, reason: &str, approver: &str) -> Result<()> {
    let approver = AgentRecord::human(approver);
    let report = embedded.plane().resume(reason, &approver).await.context("Resume refused")?;

    println!("{}", format!("✓ System resumed by {}", report.approver.name).green().bold());
    if let Some(last_good) = report.plan.last_known_good {
        println!("  Last known good entry: {}", last_good);
    }
    if report.plan.quarantined_tasks.is_empty() {
        println!("  Quarantined: {}", "none".dimmed());
    } else {
        println!("  Quarantined tasks:");
        for task_id in &report.plan.quarantined_tasks {
            println!("    {}", task_id.to_string().yellow());
        }
        for artifact in &report.plan.quarantined_artifacts {
            println!(
                "    entry {} {} {}",
                artifact.sequence,
                artifact.decision.as_str(),
                artifact.digest.as_deref().unwrap_or("-").dimmed()
            );
        }
    }
    println!("  Requeued: {}  Discarded: {}", report.requeued.len(), report.discarded.len());

    for (task_id, handle) in report.requeued.iter().zip(report.continuations) {
        match handle.await {
            Ok(Ok(outcome)) => println!("    {} {}", task_id, outcome.terminal().label()),
            Ok(Err(e)) => println!("    {} {}", task_id, e.to_string().red()),
            Err(e) => println!("    {} {}", task_id, format!("continuation aborted: {e}").red()),
        }
    }
    embedded.supervise().await?;
    Ok(())
}
