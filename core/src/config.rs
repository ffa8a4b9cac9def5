//! Mesh configuration
//!
//! Settings for the endpoint protocol timers, proxy defaults, the probe
//! scheduler and storage. Stored as JSON; every field has a default so
//! partial files load.

use crate::probe::coherence::CoherenceSpecification;
use crate::proxy::policy::PolicyRegistry;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Invalid JSON: {0}")]
    Json(String),

    #[error("Invalid resend delay: must be > 0")]
    InvalidResendDelay,

    #[error("Invalid random variation: must be in [0, 1), got {0}")]
    InvalidRandomVariation(f64),

    #[error("Unknown proxy policy: {0}")]
    UnknownPolicy(String),

    #[error("Invalid coherence specification: {0}")]
    InvalidCoherence(String),

    #[error("Invalid worker thread count: must be > 0")]
    InvalidWorkerThreads,
}

// ============================================================================
// SECTIONS
// ============================================================================

/// Ping-pong endpoint timers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Delay before acknowledging received content when there is nothing to send
    pub respond_no_message_ms: u64,
    /// Delay before a queued outgoing batch is flushed
    pub respond_with_message_ms: u64,
    /// Round-trip timeout before unacknowledged messages are re-sent
    pub resend_ms: u64,
    /// Consecutive retransmissions without progress before giving up
    pub max_resends: u32,
    /// Jitter fraction applied to every timer
    pub random_variation: f64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            respond_no_message_ms: 200,
            respond_with_message_ms: 10,
            resend_ms: 2000,
            max_resends: 5,
            random_variation: 0.05,
        }
    }
}

impl EndpointConfig {
    pub fn respond_no_message(&self) -> Duration {
        Duration::from_millis(self.respond_no_message_ms)
    }

    pub fn respond_with_message(&self) -> Duration {
        Duration::from_millis(self.respond_with_message_ms)
    }

    pub fn resend(&self) -> Duration {
        Duration::from_millis(self.resend_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Policy for ordinary mesh bases, by registry name
    pub default_policy: String,
    /// Completion estimate when the caller gives none; also the default wait
    pub default_rpc_wait_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            default_policy: "nice-and-trusting".to_string(),
            default_rpc_wait_ms: 5000,
        }
    }
}

impl ProxyConfig {
    pub fn default_rpc_wait(&self) -> Duration {
        Duration::from_millis(self.default_rpc_wait_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub worker_threads: usize,
    /// Coherence for shadows created without an explicit one
    pub default_coherence: CoherenceSpecification,
    /// Policy used by shadow mesh bases
    pub shadow_policy: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            default_coherence: CoherenceSpecification::default_adaptive(),
            shadow_policy: "shadow".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// sled directory; `None` keeps everything in memory
    pub path: Option<String>,
}

// ============================================================================
// MESH CONFIG
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub endpoint: EndpointConfig,
    pub proxy: ProxyConfig,
    pub probe: ProbeConfig,
    pub storage: StorageConfig,
    /// Log filter used by the CLI when RUST_LOG is unset
    pub log_level: Option<String>,
}

impl MeshConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.resend_ms == 0 {
            return Err(ConfigError::InvalidResendDelay);
        }
        let variation = self.endpoint.random_variation;
        if !(0.0..1.0).contains(&variation) {
            return Err(ConfigError::InvalidRandomVariation(variation));
        }

        let registry = PolicyRegistry::builtin();
        for name in [&self.proxy.default_policy, &self.probe.shadow_policy] {
            if !registry.contains(name) {
                return Err(ConfigError::UnknownPolicy(name.clone()));
            }
        }

        self.probe
            .default_coherence
            .validate()
            .map_err(ConfigError::InvalidCoherence)?;

        if self.probe.worker_threads == 0 {
            return Err(ConfigError::InvalidWorkerThreads);
        }
        Ok(())
    }

    /// Load and validate a JSON config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: MeshConfig =
            serde_json::from_str(&content).map_err(|e| ConfigError::Json(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }
        let content =
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::Json(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = MeshConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.endpoint.resend(), Duration::from_millis(2000));
        assert_eq!(config.proxy.default_policy, "nice-and-trusting");
        assert_eq!(config.probe.shadow_policy, "shadow");
    }

    #[test]
    fn test_validation_failures() {
        let mut config = MeshConfig::default();
        config.endpoint.resend_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidResendDelay)));

        let mut config = MeshConfig::default();
        config.endpoint.random_variation = 1.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRandomVariation(_))
        ));

        let mut config = MeshConfig::default();
        config.proxy.default_policy = "paranoid".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::UnknownPolicy(_))));

        let mut config = MeshConfig::default();
        config.probe.default_coherence = CoherenceSpecification::periodic(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidCoherence(_))
        ));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: MeshConfig =
            serde_json::from_str(r#"{ "endpoint": { "resend_ms": 500 } }"#).unwrap();
        assert_eq!(config.endpoint.resend_ms, 500);
        assert_eq!(config.endpoint.max_resends, 5);
        assert_eq!(config.proxy, ProxyConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = MeshConfig::default();
        config.storage.path = Some("/tmp/meshgrid".to_string());
        config.probe.default_coherence = CoherenceSpecification::periodic(3000);
        config.save(&path).unwrap();

        let loaded = MeshConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
