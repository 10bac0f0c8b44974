// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod advisory_worker;
pub mod audit_log;
pub mod event_bus;
pub mod human_approval_service;
pub mod relay_adapters;

pub use audit_log::{InMemoryAuditLog, JsonlAuditLog};
pub use event_bus::EventBus;
pub use human_approval_service::{ApprovalError, HumanApprovalService, HumanApprovalStatus, PendingApproval};
