/// Configuration management for the Itinera orchestration core.
/// Handles loading, parsing, and validation of itinera.toml.
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::event_bus::EventBusConfig;
use crate::policy::{AdmissionConfig, ComplianceConfig};
use crate::queue_manager::{builtin_queues, QueueConfig};
use crate::state_manager::StateManagerConfig;
use crate::state_types::{builtin_namespaces, NamespaceConfig};
use crate::workflow::WorkflowConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

/// Top-level configuration for the orchestration core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Configuration file version (for future migrations)
    #[serde(default = "default_version")]
    pub version: String,

    /// Event bus settings
    #[serde(default)]
    pub bus: EventBusConfig,

    /// State manager settings
    #[serde(default)]
    pub state: StateManagerConfig,

    /// Extra or overriding namespace definitions
    #[serde(default)]
    pub namespaces: NamespacesConfig,

    /// Queue manager settings
    #[serde(default)]
    pub queues: QueuesConfig,

    /// Policy settings
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Workflow orchestrator settings
    #[serde(default)]
    pub workflow: WorkflowConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            bus: EventBusConfig::default(),
            state: StateManagerConfig::default(),
            namespaces: NamespacesConfig::default(),
            queues: QueuesConfig::default(),
            policy: PolicyConfig::default(),
            workflow: WorkflowConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Queue manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueuesConfig {
    /// Extra or overriding queue definitions; built-in queues are always
    /// present unless overridden here
    #[serde(default)]
    pub queues: HashMap<String, QueueConfig>,
}

impl QueuesConfig {
    /// Effective queue set: built-ins overlaid with configured overrides.
    pub fn effective_queues(&self) -> Vec<(String, QueueConfig)> {
        let mut queues: HashMap<String, QueueConfig> = builtin_queues()
            .into_iter()
            .map(|(name, config)| (name.to_string(), config))
            .collect();
        for (name, config) in &self.queues {
            queues.insert(name.clone(), config.clone());
        }
        let mut list: Vec<(String, QueueConfig)> = queues.into_iter().collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }
}

/// Policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PolicyConfig {
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub compliance: ComplianceConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (tracing env-filter syntax)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit one-line-per-event format instead of the pretty format
    #[serde(default)]
    pub compact: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            compact: false,
        }
    }
}

/// Extra namespaces declared in configuration, merged over the built-ins.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NamespacesConfig {
    #[serde(default)]
    pub namespaces: HashMap<String, NamespaceConfig>,
}

impl NamespacesConfig {
    pub fn effective_namespaces(&self) -> Vec<(String, NamespaceConfig)> {
        let mut namespaces: HashMap<String, NamespaceConfig> = builtin_namespaces()
            .into_iter()
            .map(|(name, config)| (name.to_string(), config))
            .collect();
        for (name, config) in &self.namespaces {
            namespaces.insert(name.clone(), config.clone());
        }
        let mut list: Vec<(String, NamespaceConfig)> = namespaces.into_iter().collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }
}

impl CoreConfig {
    /// Load configuration from a TOML file, falling back to defaults when
    /// the file does not exist.
    pub fn load(path: &Path) -> Result<Self, String> {
        if !path.exists() {
            info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        let config: CoreConfig =
            toml::from_str(&raw).map_err(|e| format!("failed to parse {}: {}", path.display(), e))?;
        config.validate()?;
        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Sanity-check the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.bus.max_retries > 10 {
            return Err("bus.max_retries must be at most 10".to_string());
        }
        if self.bus.history_capacity == 0 {
            return Err("bus.history_capacity must be positive".to_string());
        }
        for (name, queue) in &self.queues.queues {
            if queue.max_size == 0 {
                return Err(format!("queue {} max_size must be positive", name));
            }
            if queue.concurrency == 0 {
                return Err(format!("queue {} concurrency must be positive", name));
            }
            if queue.batch_size == 0 {
                return Err(format!("queue {} batch_size must be positive", name));
            }
        }
        if self.policy.circuit_breaker.error_rate_threshold <= 0.0
            || self.policy.circuit_breaker.error_rate_threshold >= 1.0
        {
            return Err("circuit_breaker.error_rate_threshold must be in (0, 1)".to_string());
        }
        if self.policy.admission.max_requests == 0 {
            warn!("admission.max_requests is zero; every request will be rate limited");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        CoreConfig::default().validate().unwrap();
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = CoreConfig::load(Path::new("/nonexistent/itinera.toml")).unwrap();
        assert_eq!(config.version, "1.0");
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_partial_toml() {
        let raw = r#"
            version = "1.0"

            [bus]
            max_retries = 5

            [queues.queues.search-requests]
            max_size = 64
            rate_per_second = 2

            [policy.admission]
            max_requests = 10
        "#;
        let config: CoreConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.bus.max_retries, 5);
        assert_eq!(config.policy.admission.max_requests, 10);
        let queues = config.queues.effective_queues();
        let search = queues
            .iter()
            .find(|(name, _)| name == "search-requests")
            .unwrap();
        assert_eq!(search.1.max_size, 64);
        assert_eq!(search.1.rate_per_second, Some(2));
        config.validate().unwrap();
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = CoreConfig::default();
        config.bus.max_retries = 50;
        assert!(config.validate().is_err());

        let mut config = CoreConfig::default();
        config
            .queues
            .queues
            .insert("broken".to_string(), QueueConfig {
                max_size: 0,
                ..Default::default()
            });
        assert!(config.validate().is_err());

        let mut config = CoreConfig::default();
        config.policy.circuit_breaker.error_rate_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_queues_keep_builtins() {
        let config = QueuesConfig::default();
        let queues = config.effective_queues();
        assert!(queues.iter().any(|(name, _)| name == "booking-requests"));
        assert!(queues.iter().any(|(name, _)| name == "telemetry-events"));
    }

    #[test]
    fn test_effective_namespaces_merge() {
        let mut config = NamespacesConfig::default();
        config.namespaces.insert(
            "search-cache".to_string(),
            NamespaceConfig {
                max_size: 7,
                ..Default::default()
            },
        );
        let namespaces = config.effective_namespaces();
        let cache = namespaces
            .iter()
            .find(|(name, _)| name == "search-cache")
            .unwrap();
        assert_eq!(cache.1.max_size, 7);
        assert!(namespaces.iter().any(|(name, _)| name == "booking-data"));
    }
}
