// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Governance Policy
//!
//! Read-only policy consulted at admission, validation and review time:
//!
//! - per-domain bounds (retry bound, concurrency, worker time box)
//! - which constraint labels each domain owns
//! - output safety rules applied by governors before accepting an artifact
//! - approval rules mapping `(domain, intent, priority)` to [`Requirements`]
//!
//! The store is immutable once built and shared behind an `Arc`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::domain::task::{DomainName, Intent, Priority, Requirements, TaskFlags};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;
pub const DEFAULT_WORKER_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HUMAN_APPROVAL_TIMEOUT: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("domain '{0}' is declared more than once")]
    DuplicateDomain(DomainName),
    #[error("domain '{0}' has no policy")]
    UnknownDomain(DomainName),
    #[error("invalid bound for domain '{domain}': {reason}")]
    InvalidBound { domain: DomainName, reason: String },
    #[error("invalid output pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Output safety rules a governor applies before accepting an artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRules {
    /// Top-level keys the artifact content must carry.
    #[serde(default)]
    pub required_fields: Vec<String>,
    /// Regexes that must not match anywhere in the serialized content.
    #[serde(default)]
    pub forbidden_patterns: Vec<String>,
    #[serde(default)]
    pub max_bytes: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct DomainPolicy {
    pub name: DomainName,
    pub max_attempts: u32,
    pub max_concurrency: usize,
    pub worker_timeout: Duration,
    /// Constraint patterns owned by this domain: exact, `*`, or `prefix.*`.
    pub allowed_constraints: Vec<String>,
    pub output: OutputRules,
    forbidden: Vec<Regex>,
}

impl DomainPolicy {
    pub fn new(name: DomainName) -> Self {
        Self {
            allowed_constraints: vec![format!("{}.*", name)],
            name,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            worker_timeout: DEFAULT_WORKER_TIMEOUT,
            output: OutputRules::default(),
            forbidden: Vec::new(),
        }
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn worker_timeout(mut self, timeout: Duration) -> Self {
        self.worker_timeout = timeout;
        self
    }

    pub fn allow_constraint(mut self, pattern: impl Into<String>) -> Self {
        self.allowed_constraints.push(pattern.into());
        self
    }

    pub fn output_rules(mut self, rules: OutputRules) -> Result<Self, PolicyError> {
        self.forbidden = rules
            .forbidden_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| PolicyError::InvalidPattern { pattern: pattern.clone(), source })
            })
            .collect::<Result<_, _>>()?;
        self.output = rules;
        Ok(self)
    }

    pub fn forbidden_patterns(&self) -> &[Regex] {
        &self.forbidden
    }

    pub fn owns_constraint(&self, constraint: &str) -> bool {
        self.allowed_constraints.iter().any(|p| matches_pattern(p, constraint))
    }

    fn validate(&self) -> Result<(), PolicyError> {
        let invalid = |reason: &str| PolicyError::InvalidBound { domain: self.name.clone(), reason: reason.into() };
        if self.max_attempts == 0 {
            return Err(invalid("max_attempts must be at least 1"));
        }
        if self.max_concurrency == 0 {
            return Err(invalid("max_concurrency must be at least 1"));
        }
        if self.worker_timeout.is_zero() {
            return Err(invalid("worker_timeout must be positive"));
        }
        Ok(())
    }
}

/// Maps matching tasks to extra approval requirements.
///
/// Every `Some` selector must match. `min_priority` matches that priority and
/// anything above it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRule {
    #[serde(default)]
    pub domain: Option<DomainName>,
    #[serde(default)]
    pub intent: Option<Intent>,
    #[serde(default)]
    pub min_priority: Option<Priority>,
    pub grants: Requirements,
}

impl ApprovalRule {
    pub fn matches(&self, domain: &DomainName, intent: Intent, priority: Priority) -> bool {
        self.domain.as_ref().is_none_or(|d| d == domain)
            && self.intent.is_none_or(|i| i == intent)
            && self.min_priority.is_none_or(|p| priority >= p)
    }

    /// Built-in rules used when configuration declares none.
    pub fn defaults() -> Vec<ApprovalRule> {
        let prime = Requirements { prime_approval: true, ..Default::default() };
        let human = Requirements { human_approval: true, ..Default::default() };
        vec![
            ApprovalRule { domain: None, intent: Some(Intent::Creation), min_priority: None, grants: prime },
            ApprovalRule { domain: None, intent: Some(Intent::Update), min_priority: None, grants: prime },
            ApprovalRule { domain: None, intent: None, min_priority: Some(Priority::High), grants: prime },
            ApprovalRule { domain: None, intent: None, min_priority: Some(Priority::Critical), grants: human },
            ApprovalRule { domain: None, intent: Some(Intent::Sync), min_priority: None, grants: human },
        ]
    }
}

/// Which lane a constraint label belongs to, from one domain's viewpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstraintLane {
    InDomain,
    OtherDomain(DomainName),
    Unknown,
}

#[derive(Debug, Clone)]
pub struct PolicyStore {
    domains: BTreeMap<DomainName, DomainPolicy>,
    rules: Vec<ApprovalRule>,
    human_approval_timeout: Duration,
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self {
            domains: BTreeMap::new(),
            rules: ApprovalRule::defaults(),
            human_approval_timeout: DEFAULT_HUMAN_APPROVAL_TIMEOUT,
        }
    }
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_domain(mut self, policy: DomainPolicy) -> Result<Self, PolicyError> {
        policy.validate()?;
        if self.domains.contains_key(&policy.name) {
            return Err(PolicyError::DuplicateDomain(policy.name));
        }
        self.domains.insert(policy.name.clone(), policy);
        Ok(self)
    }

    /// Replace the approval rules. An empty list falls back to the defaults.
    pub fn with_rules(mut self, rules: Vec<ApprovalRule>) -> Self {
        self.rules = if rules.is_empty() { ApprovalRule::defaults() } else { rules };
        self
    }

    pub fn with_human_approval_timeout(mut self, timeout: Duration) -> Self {
        self.human_approval_timeout = timeout;
        self
    }

    pub fn domain(&self, name: &DomainName) -> Option<&DomainPolicy> {
        self.domains.get(name)
    }

    pub fn domains(&self) -> impl Iterator<Item = &DomainPolicy> {
        self.domains.values()
    }

    pub fn rules(&self) -> &[ApprovalRule] {
        &self.rules
    }

    pub fn human_approval_timeout(&self) -> Duration {
        self.human_approval_timeout
    }

    pub fn max_attempts(&self, domain: &DomainName) -> u32 {
        self.domain(domain).map_or(DEFAULT_MAX_ATTEMPTS, |p| p.max_attempts)
    }

    /// Requirements for a newly admitted task.
    ///
    /// Every task is governor-reviewed. Matching rules add to that; flagged
    /// tasks and tasks with an external delivery target need a human.
    pub fn requirements_for(
        &self,
        domain: &DomainName,
        intent: Intent,
        priority: Priority,
        flags: &TaskFlags,
        external: bool,
    ) -> Requirements {
        let mut requires = self
            .rules
            .iter()
            .filter(|rule| rule.matches(domain, intent, priority))
            .fold(Requirements::governor_only(), |acc, rule| acc.union(rule.grants));

        if flags.irreversible || flags.client_visible || external {
            requires = requires.union(Requirements { human_approval: true, ..Default::default() });
        }
        requires.closed()
    }

    pub fn constraint_lane(&self, domain: &DomainName, constraint: &str) -> ConstraintLane {
        if self.domain(domain).is_some_and(|p| p.owns_constraint(constraint)) {
            return ConstraintLane::InDomain;
        }
        self.domains
            .values()
            .find(|p| &p.name != domain && p.owns_constraint(constraint))
            .map_or(ConstraintLane::Unknown, |p| ConstraintLane::OtherDomain(p.name.clone()))
    }
}

fn matches_pattern(pattern: &str, value: &str) -> bool {
    if pattern == "*" || pattern == value {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return value
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.'));
    }
    false
}
