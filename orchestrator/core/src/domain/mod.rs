// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain Layer
//!
//! Pure governance types and rules: tasks, agents, audit entries, policy,
//! system state and anomaly detection. Nothing here performs I/O except the
//! configuration loader.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Entities, value objects and repository contracts

pub mod agent;
pub mod anomaly;
pub mod audit;
pub mod digest;
pub mod escalation;
pub mod events;
pub mod governance_config;
pub mod policy;
pub mod recovery;
pub mod relay;
pub mod repository;
pub mod system_state;
pub mod task;
pub mod worker;
