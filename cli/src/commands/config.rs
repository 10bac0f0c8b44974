// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use codex_core::domain::governance_config::{GovernanceConfigManifest, RelayAdapterConfig, WorkerConfig};

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./codex-config.yaml)
        #[arg(short, long, default_value = "./codex-config.yaml")]
        output: PathBuf,

        /// Include a second domain, approval rules and relay targets
        #[arg(long)]
        examples: bool,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, examples } => generate(output, examples).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config =
        GovernanceConfigManifest::load_or_default(config_override.clone()).context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        match &config_override {
            Some(path) => println!("  1. --config flag: {}", path.display()),
            None => println!("  1. --config flag: {}", "(not set)".dimmed()),
        }
        println!(
            "  2. CODEX_CONFIG_PATH: {}",
            std::env::var("CODEX_CONFIG_PATH").unwrap_or_else(|_| "(not set)".to_string()).dimmed()
        );
        println!("  3. ./codex-config.yaml");
        println!("  4. ~/.codex/config.yaml");
        println!("  5. /etc/codex/config.yaml");
        println!();
    }

    println!("{} {}", "Current configuration:".bold(), config.metadata.name);
    println!();

    println!("{}", "Domains:".bold());
    for domain in &config.spec.domains {
        println!("  {}", domain.name.as_str().bold());
        println!(
            "    Attempts: {}  Concurrency: {}  Worker timeout: {}",
            domain.max_attempts,
            domain.max_concurrency,
            humantime::format_duration(domain.worker_timeout)
        );
        match &domain.worker {
            WorkerConfig::Advisory { persona, role, criteria } => {
                println!("    Worker: {} ({}), {} criteria", persona, role, criteria.len());
            }
        }
        if !domain.allowed_constraints.is_empty() {
            println!("    Constraints: {}", domain.allowed_constraints.join(", "));
        }
    }
    println!();

    println!("{}", "Approval rules:".bold());
    if config.spec.approval_rules.is_empty() {
        println!("  {}", "(built-in defaults)".dimmed());
    }
    for rule in &config.spec.approval_rules {
        println!(
            "  domain={} intent={} min_priority={} → {}",
            rule.domain.as_ref().map(|d| d.as_str()).unwrap_or("*"),
            rule.intent.map(|i| i.as_str()).unwrap_or("*"),
            rule.min_priority.map(|p| p.as_str()).unwrap_or("*"),
            rule.grants.closed().required_tier()
        );
    }
    println!(
        "  Human approval timeout: {}",
        humantime::format_duration(config.spec.human_approval_timeout)
    );
    println!();

    println!("{}", "Relay targets:".bold());
    if config.spec.relay_targets.is_empty() {
        println!("  {}", "(none)".dimmed());
    }
    for target in &config.spec.relay_targets {
        let adapter = match &target.adapter {
            RelayAdapterConfig::Outbox { path } => format!("outbox {}", path.display()),
            RelayAdapterConfig::Memory => "memory".to_string(),
        };
        let schema = if target.schema.is_some() { ", schema enforced" } else { "" };
        println!("  {} → {}{}", target.name.as_str().bold(), adapter, schema);
    }
    println!();

    println!("{}", "Supervisor:".bold());
    println!(
        "  Scan interval: {}  Task window: {}  Agent window: {}",
        humantime::format_duration(config.spec.supervisor.scan_interval),
        config.spec.supervisor.task_window,
        config.spec.supervisor.agent_window
    );
    println!("{} {}", "Audit log:".bold(), config.spec.audit.path.display());

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = GovernanceConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;
    config.to_policy_store().context("Policy rules are inconsistent")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: PathBuf, with_examples: bool) -> Result<()> {
    let sample = if with_examples {
        include_str!("../../templates/config-with-examples.yaml")
    } else {
        include_str!("../../templates/config-minimal.yaml")
    };

    std::fs::write(&output, sample).with_context(|| format!("Failed to write config to {:?}", output))?;

    println!("{}", format!("✓ Configuration generated: {}", output.display()).green());

    Ok(())
}
