// Configuration management for the meshgrid CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/meshgrid/config.json
// - Linux: ~/.config/meshgrid/config.json
// - Windows: %APPDATA%\meshgrid\config.json

use anyhow::{Context, Result};
use meshgrid_core::{CoherenceSpecification, MeshConfig};
use std::path::{Path, PathBuf};

/// The core configuration plus where it lives on disk
#[derive(Debug, Clone)]
pub struct Config {
    pub mesh: MeshConfig,
    path: PathBuf,
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("meshgrid");
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("meshgrid");
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;
        Ok(data_dir)
    }

    /// Load config from the default location, creating it on first use
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_dir()?.join("config.json"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let mesh = MeshConfig::load(path)
                .with_context(|| format!("Failed to load config file {}", path.display()))?;
            Ok(Self {
                mesh,
                path: path.to_path_buf(),
            })
        } else {
            let config = Self {
                mesh: MeshConfig::default(),
                path: path.to_path_buf(),
            };
            config.save()?;
            Ok(config)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self) -> Result<()> {
        self.mesh
            .save(&self.path)
            .with_context(|| format!("Failed to write config file {}", self.path.display()))
    }

    /// The sled directory, defaulting to the data directory
    pub fn storage_path(&self) -> Result<String> {
        match &self.mesh.storage.path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::data_dir()?.join("store").to_string_lossy().into_owned()),
        }
    }

    /// The core configuration with the storage path filled in
    pub fn resolved(&self) -> Result<MeshConfig> {
        let mut mesh = self.mesh.clone();
        mesh.storage.path = Some(self.storage_path()?);
        Ok(mesh)
    }

    /// Set a config value and save
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut mesh = self.mesh.clone();
        match key {
            "storage_path" => {
                mesh.storage.path = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "log_level" => {
                mesh.log_level = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "default_policy" => mesh.proxy.default_policy = value.to_string(),
            "shadow_policy" => mesh.probe.shadow_policy = value.to_string(),
            "rpc_wait_ms" => {
                mesh.proxy.default_rpc_wait_ms = value.parse().context("Invalid number")?;
            }
            "resend_ms" => {
                mesh.endpoint.resend_ms = value.parse().context("Invalid number")?;
            }
            "max_resends" => {
                mesh.endpoint.max_resends = value.parse().context("Invalid number")?;
            }
            "worker_threads" => {
                mesh.probe.worker_threads = value.parse().context("Invalid number")?;
            }
            "default_coherence" => mesh.probe.default_coherence = parse_coherence(value)?,
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        mesh.validate().context("Invalid configuration")?;
        self.mesh = mesh;
        self.save()
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let mesh = &self.mesh;
        vec![
            (
                "storage_path".to_string(),
                mesh.storage.path.clone().unwrap_or_else(|| "(auto)".to_string()),
            ),
            (
                "log_level".to_string(),
                mesh.log_level.clone().unwrap_or_else(|| "warn".to_string()),
            ),
            ("default_policy".to_string(), mesh.proxy.default_policy.clone()),
            ("shadow_policy".to_string(), mesh.probe.shadow_policy.clone()),
            ("rpc_wait_ms".to_string(), mesh.proxy.default_rpc_wait_ms.to_string()),
            ("resend_ms".to_string(), mesh.endpoint.resend_ms.to_string()),
            ("max_resends".to_string(), mesh.endpoint.max_resends.to_string()),
            ("worker_threads".to_string(), mesh.probe.worker_threads.to_string()),
            ("default_coherence".to_string(), mesh.probe.default_coherence.to_string()),
        ]
    }
}

/// `one-time`, `periodic:<ms>`, `adaptive` or `adaptive:<current>:<max>:<fallback>:<factor>`
pub fn parse_coherence(value: &str) -> Result<CoherenceSpecification> {
    value
        .parse::<CoherenceSpecification>()
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("Invalid coherence: {}", value))
}
