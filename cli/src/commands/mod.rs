// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the Codex CLI

pub mod audit;
pub mod config;
pub mod system;
pub mod task;

pub use self::audit::AuditCommand;
pub use self::config::ConfigCommand;
pub use self::system::SystemCommand;
pub use self::task::TaskCommand;
