// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Task commands
//!
//! Commands: submit, history

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use codex_core::application::router::{SubmitError, TaskOutcome};
use codex_core::domain::agent::AgentRecord;
use codex_core::domain::events::GovernanceEvent;
use codex_core::domain::task::{TaskCandidate, TaskId};
use codex_core::infrastructure::event_bus::{EventBusError, EventReceiver};
use codex_core::infrastructure::human_approval_service::HumanApprovalService;

use crate::commands::audit::print_entry;
use crate::embedded::{EmbeddedControlPlane, GlobalArgs};

#[derive(Subcommand)]
pub enum TaskCommand {
    /// Admit a task and run it to a terminal outcome
    Submit {
        /// Owning domain
        #[arg(value_name = "DOMAIN")]
        domain: String,

        /// analysis, creation, update, ingestion or sync
        #[arg(short, long, default_value = "analysis")]
        intent: String,

        /// low, normal, high or critical
        #[arg(short, long, default_value = "normal")]
        priority: String,

        /// Payload (JSON string or @file.json)
        #[arg(long, value_name = "PAYLOAD")]
        payload: Option<String>,

        /// Constraint label (repeatable)
        #[arg(long = "constraint", value_name = "LABEL")]
        constraints: Vec<String>,

        /// Relay target for the approved artifact
        #[arg(long, value_name = "TARGET")]
        deliver_to: Option<String>,

        /// The effect cannot be undone once delivered
        #[arg(long)]
        irreversible: bool,

        /// The artifact is shown to a client
        #[arg(long)]
        client_visible: bool,

        /// Answer tier-3 approval requests as this human operator
        #[arg(long, value_name = "NAME")]
        approve_as: Option<String>,
    },

    /// Show the audit trail of a task
    History {
        /// Task ID
        #[arg(value_name = "TASK_ID")]
        task_id: TaskId,
    },
}

pub async fn handle_command(command: TaskCommand, args: GlobalArgs) -> Result<()> {
    let embedded = EmbeddedControlPlane::new(&args).await?;
    match command {
        TaskCommand::Submit {
            domain,
            intent,
            priority,
            payload,
            constraints,
            deliver_to,
            irreversible,
            client_visible,
            approve_as,
        } => {
            let payload = match payload {
                Some(raw) => parse_payload(&raw)?,
                None => json!({}),
            };
            let candidate = build_candidate(json!({
                "domain": domain,
                "intent": intent,
                "priority": priority,
                "payload": payload,
                "constraints": constraints,
                "deliver_to": deliver_to,
                "flags": { "irreversible": irreversible, "client_visible": client_visible },
            }))?;
            submit(&embedded, candidate, approve_as).await
        }
        TaskCommand::History { task_id } => history(&embedded, task_id).await,
    }
}

/// Accept inline JSON or `@path` to a JSON file.
fn parse_payload(raw: &str) -> Result<Value> {
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("Failed to read payload file {path}"))?,
        None => raw.to_string(),
    };
    serde_json::from_str(&text).context("Payload is not valid JSON")
}

fn build_candidate(raw: Value) -> Result<TaskCandidate> {
    TaskCandidate::from_json(&raw.to_string()).context("Invalid task")
}

async fn submit(embedded: &EmbeddedControlPlane, candidate: TaskCandidate, approve_as: Option<String>) -> Result<()> {
    let plane = embedded.plane();
    let approver = approve_as.map(AgentRecord::human);
    let responder = tokio::spawn(respond_to_approvals(
        plane.events().subscribe(),
        plane.approvals().clone(),
        approver,
    ));
    let monitor = plane.spawn_supervisor();

    let result = plane.submit(candidate).await;

    plane.supervisor().shutdown_token().cancel();
    let _ = monitor.await;
    responder.abort();
    embedded.supervise().await?;

    match result {
        Ok(outcome) => {
            print_outcome(&outcome);
            Ok(())
        }
        Err(SubmitError::Admission(e)) => Err(anyhow::Error::new(e).context("Task was not admitted")),
        Err(SubmitError::Route(e)) => Err(anyhow::Error::new(e).context("Task failed in the pipeline")),
    }
}

/// Report admissions and answer tier-3 requests raised by this process as
/// `approver`. Without an approver the request runs into its timeout.
async fn respond_to_approvals(
    mut events: EventReceiver,
    approvals: Arc<HumanApprovalService>,
    approver: Option<AgentRecord>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(EventBusError::Lagged(_)) => continue,
            Err(_) => break,
        };
        let (task_id, request_id, prompt) = match event {
            GovernanceEvent::TaskAdmitted { task_id, domain, requires, .. } => {
                println!("{} {} in '{}' (gate {})", "admitted".bold(), task_id, domain, requires.required_tier());
                continue;
            }
            GovernanceEvent::HumanApprovalRequested { task_id, request_id, prompt, .. } => (task_id, request_id, prompt),
            _ => continue,
        };
        println!("{} {}", "human approval required:".yellow().bold(), prompt);

        let Some(approver) = &approver else {
            println!("{}", "  no --approve-as given; waiting for the approval window to expire".dimmed());
            continue;
        };
        match approvals
            .submit_approval(request_id, approver, Some(format!("approved by {} from the CLI", approver.name)))
            .await
        {
            Ok(()) => info!(task_id = %task_id, approver = %approver.name, "Approval submitted"),
            Err(e) => warn!(task_id = %task_id, error = %e, "Approval could not be submitted"),
        }
    }
}

fn print_outcome(outcome: &TaskOutcome) {
    let successors = successors(outcome);
    if !successors.is_empty() {
        let ids: Vec<String> = successors.iter().map(TaskId::to_string).collect();
        println!("{} {}", "superseded by".dimmed(), ids.join(" → "));
    }

    match outcome.terminal() {
        TaskOutcome::Delivered { receipt } => {
            println!("{}", "✓ Delivered".green().bold());
            println!("  Target:  {}", receipt.target);
            println!("  Ref:     {}", receipt.external_ref);
            println!("  Digest:  {}", receipt.payload_digest);
        }
        TaskOutcome::Approved { artifact_digest } => {
            println!("{}", "✓ Approved".green().bold());
            println!("  Artifact digest: {}", artifact_digest);
        }
        TaskOutcome::Rejected { reason } => println!("{} {}", "✗ Rejected:".red().bold(), reason),
        TaskOutcome::PendingHumanTimeout => {
            println!("{}", "… Pending: no human decision within the approval window".yellow().bold())
        }
        TaskOutcome::Held => {
            println!("{}", "‖ Held: the system halted mid-flight; resubmit after `codex system resume`".yellow().bold())
        }
        TaskOutcome::Cancelled => println!("{}", "✗ Cancelled".yellow()),
        TaskOutcome::DeliveryFailed { reason } => println!("{} {}", "✗ Delivery failed:".red().bold(), reason),
        TaskOutcome::TakenOver { reason } => println!("{} {}", "! Taken over by Prime:".red().bold(), reason),
        TaskOutcome::Superseded { .. } => {}
    }
}

fn successors(outcome: &TaskOutcome) -> Vec<TaskId> {
    let mut ids = Vec::new();
    let mut current = outcome;
    while let TaskOutcome::Superseded { by, outcome } = current {
        ids.push(*by);
        current = outcome;
    }
    ids
}

async fn history(embedded: &EmbeddedControlPlane, task_id: TaskId) -> Result<()> {
    let entries = embedded.plane().task_history(task_id).await.context("Failed to read audit log")?;
    if entries.is_empty() {
        println!("{}", format!("No audit entries for task {task_id}").yellow());
        return Ok(());
    }
    println!("{} {} ({} entries)", "Task".bold(), task_id, entries.len());
    for entry in &entries {
        print_entry(entry);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use codex_core::application::control_plane::ControlPlane;
    use codex_core::domain::policy::{DomainPolicy, PolicyStore};
    use codex_core::domain::task::{DomainName, Intent, Priority};
    use codex_core::infrastructure::advisory_worker::AdvisoryWorker;
    use codex_core::infrastructure::audit_log::InMemoryAuditLog;
    use std::time::Duration;

    #[test]
    fn test_parse_inline_payload() {
        let value = parse_payload(r#"{"topic": "retention"}"#).unwrap();
        assert_eq!(value["topic"], "retention");
        assert!(parse_payload("not json").is_err());
    }

    #[test]
    fn test_parse_payload_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.json");
        std::fs::write(&path, r#"{"draft": 1}"#).unwrap();
        let value = parse_payload(&format!("@{}", path.display())).unwrap();
        assert_eq!(value["draft"], 1);
    }

    #[test]
    fn test_build_candidate_from_flags() {
        let candidate = build_candidate(json!({
            "domain": "codex",
            "intent": "creation",
            "priority": "critical",
            "payload": {},
            "constraints": ["charter.tenure"],
            "deliver_to": null,
            "flags": { "irreversible": true, "client_visible": false },
        }))
        .unwrap();
        assert_eq!(candidate.intent, Intent::Creation);
        assert_eq!(candidate.priority, Priority::Critical);
        assert!(candidate.flags.irreversible);
        assert_eq!(candidate.constraints, vec!["charter.tenure".to_string()]);
    }

    #[test]
    fn test_build_candidate_rejects_unknown_intent() {
        let result = build_candidate(json!({ "domain": "codex", "intent": "demolition" }));
        assert!(result.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_responder_answers_every_tier3_request() {
        let codex = DomainName::parse("codex").unwrap();
        let policy = PolicyStore::new()
            .with_domain(DomainPolicy::new(codex.clone()))
            .unwrap()
            .with_human_approval_timeout(Duration::from_secs(5));
        let plane = ControlPlane::builder(policy, Arc::new(InMemoryAuditLog::new()))
            .with_worker(codex, Arc::new(AdvisoryWorker::new("Steward", "advisor")))
            .build()
            .unwrap();
        let responder = tokio::spawn(respond_to_approvals(
            plane.events().subscribe(),
            plane.approvals().clone(),
            Some(AgentRecord::human("alice")),
        ));

        for round in 0..16 {
            let candidate = TaskCandidate::new("codex", Intent::Creation, Priority::Critical)
                .with_payload(json!({ "topic": format!("amendment {round}") }));
            let outcome = plane.submit(candidate).await.unwrap();
            assert!(matches!(outcome, TaskOutcome::Approved { .. }), "round {round}: {outcome:?}");
        }
        assert!(plane.approvals().list_pending_requests().await.is_empty());
        responder.abort();
    }
}
