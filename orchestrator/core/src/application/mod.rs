// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Application Layer
//!
//! Services that move a task through the hierarchy: Prime's router, the
//! per-domain governors, the relay transport and the supervisor monitor,
//! assembled by [`control_plane::ControlPlane`].
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Orchestrates domain rules against the audit log and workers

pub mod audit_digest;
pub mod control_plane;
pub mod governor;
pub mod held;
pub mod relay_transport;
pub mod router;
pub mod supervisor_monitor;

pub use audit_digest::AuditDigest;
pub use control_plane::{ControlPlane, ControlPlaneBuilder, ControlPlaneError};
pub use governor::{GovernorEngine, GovernorError, OutputValidator, OutputVerdict};
pub use relay_transport::RelayTransport;
pub use router::{SharedServices, TaskOutcome, TaskRouter};
pub use supervisor_monitor::{Halter, MonitorConfig, SupervisorMonitor};
