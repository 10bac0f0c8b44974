// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Codex governance core
//!
//! A control plane that routes advisory work through Prime, per-domain
//! governors and workers, with every decision written to an append-only
//! audit log that a supervisor watches for lane violations.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Domain model, application services and infrastructure adapters

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
