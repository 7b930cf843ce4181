// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Coordinator Configuration Types
//
// Defines the configuration schema for a Concord coordination runtime:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Event bus history and observer capacities
// - Validation cache sizing
// - Context expiry sweeping
// - Orchestrator concurrency, timeouts and failure policy

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::workflow::FailurePolicy;

pub const API_VERSION: &str = "concord/v1";
pub const KIND: &str = "CoordinatorConfig";

/// Top-level Kubernetes-style coordinator configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// API version (must be "concord/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "CoordinatorConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: CoordinatorSpec,
}

/// Manifest metadata (Kubernetes-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorSpec {
    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub validation: ValidationConfig,

    #[serde(default)]
    pub context: ContextConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusConfig {
    /// Number of publish records retained in the history ring buffer
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Buffer of the coordination notice broadcast channel
    #[serde(default = "default_notice_capacity")]
    pub notice_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            notice_capacity: default_notice_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationConfig {
    /// Maximum entries in the validation result LRU cache
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            cache_capacity: default_cache_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextConfig {
    /// Interval of the background expiry sweeper
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// TTL applied to slices created without one (none = never expire)
    #[serde(default, with = "humantime_serde")]
    pub default_ttl: Option<Duration>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            sweep_interval: default_sweep_interval(),
            default_ttl: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorConfig {
    /// Upper bound on nodes running at once (a workflow may lower it)
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Timeout applied to phases that do not declare one
    #[serde(default = "default_node_timeout", with = "humantime_serde")]
    pub node_timeout: Duration,

    /// Timeout applied to consensus gates that do not declare one
    #[serde(default = "default_consensus_timeout", with = "humantime_serde")]
    pub consensus_timeout: Duration,

    /// Policy applied to workflows that do not declare one
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            node_timeout: default_node_timeout(),
            consensus_timeout: default_consensus_timeout(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

fn default_history_capacity() -> usize {
    256
}

fn default_notice_capacity() -> usize {
    1024
}

fn default_cache_capacity() -> usize {
    1024
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_concurrency() -> usize {
    4
}

fn default_node_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_consensus_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "default-coordinator".to_string(),
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: CoordinatorSpec::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        std::fs::write(path, self.to_yaml_string()?)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Discover configuration file using precedence order:
    /// `CONCORD_CONFIG_PATH`, `./concord-config.yaml`,
    /// `~/.concord/config.yaml`, `/etc/concord/config.yaml`.
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("CONCORD_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./concord-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".concord").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        #[cfg(unix)]
        let system_config = PathBuf::from("/etc/concord/config.yaml");
        #[cfg(windows)]
        let system_config = PathBuf::from("C:\\ProgramData\\Concord\\config.yaml");

        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load from an explicit path (failing if it is missing), else from the
    /// discovered path, else defaults. Environment overrides apply last.
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path).map_err(|e| {
                anyhow::anyhow!("Failed to load config at {:?}: {}", path, e)
            })?;
            config.apply_env_overrides();
            return Ok(config);
        }

        let mut config = match Self::discover_config() {
            Some(config_path) => {
                tracing::info!("Loading configuration from discovered path: {:?}", config_path);
                Self::from_yaml_file(config_path)?
            }
            None => {
                tracing::debug!("No configuration file found in standard locations, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `CONCORD_MAX_CONCURRENCY`, `CONCORD_NODE_TIMEOUT_MS` and
    /// `CONCORD_HISTORY_CAPACITY`. Unparseable values are logged and ignored.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("CONCORD_MAX_CONCURRENCY") {
            match val.parse::<usize>() {
                Ok(n) => self.spec.orchestrator.max_concurrency = n,
                Err(e) => tracing::warn!("Ignoring CONCORD_MAX_CONCURRENCY={}: {}", val, e),
            }
        }

        if let Some(val) = lookup("CONCORD_NODE_TIMEOUT_MS") {
            match val.parse::<u64>() {
                Ok(ms) => self.spec.orchestrator.node_timeout = Duration::from_millis(ms),
                Err(e) => tracing::warn!("Ignoring CONCORD_NODE_TIMEOUT_MS={}: {}", val, e),
            }
        }

        if let Some(val) = lookup("CONCORD_HISTORY_CAPACITY") {
            match val.parse::<usize>() {
                Ok(n) => self.spec.bus.history_capacity = n,
                Err(e) => tracing::warn!("Ignoring CONCORD_HISTORY_CAPACITY={}: {}", val, e),
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let spec = &self.spec;
        if spec.bus.history_capacity == 0 {
            anyhow::bail!("spec.bus.historyCapacity must be at least 1");
        }
        if spec.bus.notice_capacity == 0 {
            anyhow::bail!("spec.bus.noticeCapacity must be at least 1");
        }
        if spec.validation.cache_capacity == 0 {
            anyhow::bail!("spec.validation.cacheCapacity must be at least 1");
        }
        if spec.context.sweep_interval.is_zero() {
            anyhow::bail!("spec.context.sweepInterval must be greater than zero");
        }
        if spec.orchestrator.max_concurrency == 0 {
            anyhow::bail!("spec.orchestrator.maxConcurrency must be at least 1");
        }
        if spec.orchestrator.node_timeout.is_zero() {
            anyhow::bail!("spec.orchestrator.nodeTimeout must be greater than zero");
        }

        Ok(())
    }
}
