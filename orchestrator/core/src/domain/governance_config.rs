// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Governance Configuration Types
//
// Defines the configuration schema for a Codex control plane, including:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Per-domain bounds, constraint ownership, output rules and worker binding
// - Approval rules mapping (domain, intent, priority) to required tiers
// - Supervisor cadence and detection windows
// - Relay targets with optional JSON Schemas
// - Audit store location and observability settings

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::policy::{
    ApprovalRule, DomainPolicy, OutputRules, PolicyError, PolicyStore, DEFAULT_HUMAN_APPROVAL_TIMEOUT,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_CONCURRENCY, DEFAULT_WORKER_TIMEOUT,
};
use crate::domain::relay::TargetSystemRef;
use crate::domain::task::DomainName;

pub const API_VERSION: &str = "codex.governance/v1";
pub const KIND: &str = "GovernanceConfig";

/// Top-level Kubernetes-style governance manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceConfigManifest {
    /// API version (must be "codex.governance/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "GovernanceConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: GovernanceSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceSpec {
    pub domains: Vec<DomainConfig>,

    /// Empty means the built-in rules apply
    #[serde(default)]
    pub approval_rules: Vec<ApprovalRule>,

    #[serde(with = "humantime_serde", default = "default_human_approval_timeout")]
    pub human_approval_timeout: Duration,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub relay_targets: Vec<RelayTargetConfig>,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    pub name: DomainName,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(with = "humantime_serde", default = "default_worker_timeout")]
    pub worker_timeout: Duration,

    /// Extra constraint patterns; `<name>.*` is always owned
    #[serde(default)]
    pub allowed_constraints: Vec<String>,

    #[serde(default)]
    pub output: OutputRules,

    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionWeight {
    pub key: String,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerConfig {
    /// Persona-driven advisory worker
    Advisory {
        persona: String,
        role: String,
        #[serde(default = "default_criteria")]
        criteria: Vec<CriterionWeight>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(with = "humantime_serde", default = "default_scan_interval")]
    pub scan_interval: Duration,

    #[serde(default = "default_task_window")]
    pub task_window: usize,

    #[serde(default = "default_agent_window")]
    pub agent_window: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayTargetConfig {
    pub name: TargetSystemRef,

    pub adapter: RelayAdapterConfig,

    /// JSON Schema the delivered payload must satisfy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelayAdapterConfig {
    /// One JSON file per delivery under `path`
    Outbox { path: PathBuf },
    /// Held in process memory
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_human_approval_timeout() -> Duration {
    DEFAULT_HUMAN_APPROVAL_TIMEOUT
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

fn default_worker_timeout() -> Duration {
    DEFAULT_WORKER_TIMEOUT
}

fn default_scan_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_task_window() -> usize {
    4096
}

fn default_agent_window() -> usize {
    64
}

fn default_audit_path() -> PathBuf {
    PathBuf::from("./codex-audit.jsonl")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

pub fn default_criteria() -> Vec<CriterionWeight> {
    [("charter_alignment", 0.3), ("clarity", 0.2), ("actionability", 0.3), ("compliance", 0.2)]
        .into_iter()
        .map(|(key, weight)| CriterionWeight { key: key.to_string(), weight })
        .collect()
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            scan_interval: default_scan_interval(),
            task_window: default_task_window(),
            agent_window: default_agent_window(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { path: default_audit_path() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), format: default_log_format() }
    }
}

impl Default for GovernanceSpec {
    fn default() -> Self {
        Self {
            domains: vec![DomainConfig {
                name: DomainName::from_static("codex"),
                max_attempts: default_max_attempts(),
                max_concurrency: default_max_concurrency(),
                worker_timeout: default_worker_timeout(),
                allowed_constraints: vec!["charter.*".to_string()],
                output: OutputRules {
                    required_fields: vec!["summary".to_string(), "advice".to_string()],
                    forbidden_patterns: vec![],
                    max_bytes: Some(64 * 1024),
                },
                worker: WorkerConfig::Advisory {
                    persona: "Codex Steward".to_string(),
                    role: "governance advisor".to_string(),
                    criteria: default_criteria(),
                },
            }],
            approval_rules: vec![],
            human_approval_timeout: default_human_approval_timeout(),
            supervisor: SupervisorConfig::default(),
            relay_targets: vec![],
            audit: AuditConfig::default(),
            observability: None,
        }
    }
}

impl Default for GovernanceConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "codex-control-plane".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata { name: hostname, version: Some("1.0.0".to_string()), labels: None },
            spec: GovernanceSpec::default(),
        }
    }
}

impl GovernanceConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. CODEX_CONFIG_PATH environment variable
    /// 2. ./codex-config.yaml (working directory)
    /// 3. ~/.codex/config.yaml (user home)
    /// 4. /etc/codex/config.yaml (system)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("CODEX_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./codex-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".codex").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/codex/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("CODEX_MAX_ATTEMPTS") {
            match val.parse::<u32>() {
                Ok(n) if n > 0 => {
                    tracing::info!("Environment override: CODEX_MAX_ATTEMPTS={}", n);
                    for domain in &mut self.spec.domains {
                        domain.max_attempts = n;
                    }
                }
                _ => tracing::warn!(
                    "Invalid value for CODEX_MAX_ATTEMPTS: '{}'. Expected a positive integer. Ignoring.",
                    val
                ),
            }
        }

        if let Ok(val) = std::env::var("CODEX_HUMAN_APPROVAL_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(secs) => {
                    tracing::info!("Environment override: CODEX_HUMAN_APPROVAL_TIMEOUT_SECS={}", secs);
                    self.spec.human_approval_timeout = Duration::from_secs(secs);
                }
                Err(_) => tracing::warn!(
                    "Invalid value for CODEX_HUMAN_APPROVAL_TIMEOUT_SECS: '{}'. Ignoring.",
                    val
                ),
            }
        }

        if let Ok(val) = std::env::var("CODEX_AUDIT_PATH") {
            tracing::info!("Environment override: CODEX_AUDIT_PATH={}", val);
            self.spec.audit.path = PathBuf::from(val);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!("Invalid apiVersion: '{}'. Must be '{}'", self.api_version, API_VERSION);
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        if self.spec.domains.is_empty() {
            anyhow::bail!("spec.domains must declare at least one domain");
        }

        for domain in &self.spec.domains {
            let WorkerConfig::Advisory { persona, criteria, .. } = &domain.worker;
            if persona.is_empty() {
                anyhow::bail!("Worker persona cannot be empty for domain: {}", domain.name);
            }
            if criteria.iter().any(|c| c.key.is_empty() || c.weight < 0.0) {
                anyhow::bail!("Evaluation criteria need a key and a non-negative weight in domain: {}", domain.name);
            }
        }

        let mut targets = BTreeSet::new();
        for target in &self.spec.relay_targets {
            if !targets.insert(&target.name) {
                anyhow::bail!("Relay target '{}' is declared more than once", target.name);
            }
        }

        if self.spec.supervisor.scan_interval.is_zero() {
            anyhow::bail!("spec.supervisor.scan_interval must be positive");
        }

        self.to_policy_store()?;
        Ok(())
    }

    /// Build the runtime policy store.
    pub fn to_policy_store(&self) -> Result<PolicyStore, PolicyError> {
        let mut store = PolicyStore::new()
            .with_rules(self.spec.approval_rules.clone())
            .with_human_approval_timeout(self.spec.human_approval_timeout);
        for domain in &self.spec.domains {
            let mut policy = DomainPolicy::new(domain.name.clone())
                .max_attempts(domain.max_attempts)
                .max_concurrency(domain.max_concurrency)
                .worker_timeout(domain.worker_timeout)
                .output_rules(domain.output.clone())?;
            for pattern in &domain.allowed_constraints {
                policy = policy.allow_constraint(pattern.clone());
            }
            store = store.with_domain(policy)?;
        }
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::{Intent, Priority, TaskFlags};

    #[test]
    fn test_default_manifest() {
        let manifest = GovernanceConfigManifest::default();
        assert_eq!(manifest.api_version, API_VERSION);
        assert_eq!(manifest.kind, KIND);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
apiVersion: codex.governance/v1
kind: GovernanceConfig
metadata:
  name: test-plane
spec:
  human_approval_timeout: 90s
  domains:
    - name: codex
      max_attempts: 2
      worker_timeout: 5s
      allowed_constraints: ["charter.*"]
      output:
        required_fields: [summary]
        forbidden_patterns: ["(?i)password"]
      worker:
        kind: advisory
        persona: Steward
        role: advisor
    - name: ingestion
      worker:
        kind: advisory
        persona: Archivist
        role: curator
  approval_rules:
    - intent: sync
      grants: { human_approval: true }
  relay_targets:
    - name: chat-workspace
      adapter: { kind: memory }
      schema:
        type: object
        required: [summary]
"#;
        let manifest = GovernanceConfigManifest::from_yaml_str(yaml).unwrap();
        manifest.validate().unwrap();
        assert_eq!(manifest.spec.human_approval_timeout, Duration::from_secs(90));
        assert_eq!(manifest.spec.domains[1].max_attempts, DEFAULT_MAX_ATTEMPTS);

        let store = manifest.to_policy_store().unwrap();
        let codex = DomainName::parse("codex").unwrap();
        assert_eq!(store.max_attempts(&codex), 2);
        assert_eq!(store.domain(&codex).unwrap().worker_timeout, Duration::from_secs(5));
        assert_eq!(store.rules().len(), 1);

        let ingestion = DomainName::parse("ingestion").unwrap();
        let r = store.requirements_for(&ingestion, Intent::Sync, Priority::Low, &TaskFlags::default(), false);
        assert!(r.human_approval);
    }

    #[test]
    fn test_validation() {
        let mut manifest = GovernanceConfigManifest::default();
        manifest.api_version = "v0".to_string();
        assert!(manifest.validate().is_err());

        let mut manifest = GovernanceConfigManifest::default();
        manifest.spec.domains.clear();
        assert!(manifest.validate().is_err());

        let mut manifest = GovernanceConfigManifest::default();
        manifest.spec.domains[0].max_attempts = 0;
        assert!(manifest.validate().is_err());

        let mut manifest = GovernanceConfigManifest::default();
        let dup = manifest.spec.domains[0].clone();
        manifest.spec.domains.push(dup);
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_unknown_worker_kind_is_rejected() {
        let yaml = r#"
apiVersion: codex.governance/v1
kind: GovernanceConfig
metadata: { name: x }
spec:
  domains:
    - name: codex
      worker: { kind: shell, command: "rm -rf /" }
"#;
        assert!(GovernanceConfigManifest::from_yaml_str(yaml).is_err());
    }
}
