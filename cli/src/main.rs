// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Codex Governance CLI
//!
//! The `codex` binary is the operator surface of the governance control plane.
//! Every command assembles the control plane in-process over the durable audit
//! log, so an outstanding halt recorded by an earlier run is honoured.
//!
//! ## Commands
//!
//! - `codex task submit|history` - Submit work and inspect its audit trail
//! - `codex audit range|agent|digest` - Query the audit log
//! - `codex system status|halt|resume` - STOP and RESET/REALIGN
//! - `codex config show|validate|generate` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};

use codex_core::domain::governance_config::GovernanceConfigManifest;
use codex_orchestrator::commands::{self, AuditCommand, ConfigCommand, SystemCommand, TaskCommand};
use codex_orchestrator::embedded::GlobalArgs;

/// Codex - governance control plane for multi-agent work
#[derive(Parser)]
#[command(name = "codex")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(short, long, global = true, env = "CODEX_CONFIG_PATH", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the JSONL audit log (overrides spec.audit.path)
    #[arg(long, global = true, env = "CODEX_AUDIT_PATH", value_name = "FILE")]
    audit_log: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "CODEX_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit tasks and inspect their history
    #[command(name = "task")]
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },

    /// Query the audit log
    #[command(name = "audit")]
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },

    /// System state: status, halt, resume
    #[command(name = "system")]
    System {
        #[command(subcommand)]
        command: SystemCommand,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.config.as_deref())?;

    let args = GlobalArgs { config: cli.config, audit_log: cli.audit_log };
    match cli.command {
        Some(Commands::Task { command }) => commands::task::handle_command(command, args).await,
        Some(Commands::Audit { command }) => commands::audit::handle_command(command, args).await,
        Some(Commands::System { command }) => commands::system::handle_command(command, args).await,
        Some(Commands::Config { command }) => commands::config::handle_command(command, args.config).await,
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// Initialize tracing subscriber for logging.
///
/// `RUST_LOG` wins over `--log-level`. The output format comes from
/// `spec.observability.logging.format` when a configuration is found.
fn init_logging(level: &str, config: Option<&Path>) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let json = config
        .map(Path::to_path_buf)
        .or_else(GovernanceConfigManifest::discover_config)
        .and_then(|path| GovernanceConfigManifest::from_yaml_file(path).ok())
        .and_then(|manifest| manifest.spec.observability)
        .is_some_and(|o| o.logging.format.eq_ignore_ascii_case("json"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }

    Ok(())
}
