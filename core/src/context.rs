//! Runtime context
//!
//! Everything a mesh base or the probe manager needs from its surroundings,
//! passed explicitly instead of looked up in process-wide registries.

use crate::comm::{LocalNetwork, Transport};
use crate::config::{ConfigError, MeshConfig};
use crate::probe::adapter::ProbeDirectory;
use crate::proxy::PolicyRegistry;
use crate::scheduler::Scheduler;
use crate::store::{MemoryStorage, SledStorage, StorageBackend, StoreError};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct MeshContext {
    pub config: MeshConfig,
    pub storage: Arc<dyn StorageBackend>,
    pub transport: Arc<dyn Transport>,
    /// Set when the transport is an in-process network, so data-source
    /// resolvers can be registered on it
    pub network: Option<Arc<LocalNetwork>>,
    pub policies: PolicyRegistry,
    pub probes: ProbeDirectory,
    pub scheduler: Scheduler,
}

impl MeshContext {
    pub fn new(
        config: MeshConfig,
        storage: Arc<dyn StorageBackend>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            storage,
            transport,
            network: None,
            policies: PolicyRegistry::builtin(),
            probes: ProbeDirectory::builtin(),
            scheduler: Scheduler::new(),
        })
    }

    /// In-process network plus the store named by the configuration
    pub fn local(config: MeshConfig) -> Result<Self, ContextError> {
        let storage: Arc<dyn StorageBackend> = match &config.storage.path {
            Some(path) => {
                info!("Opening store at {}", path);
                Arc::new(SledStorage::open(path)?)
            }
            None => Arc::new(MemoryStorage::new()),
        };
        Self::on_network(config, storage, LocalNetwork::new()).map_err(ContextError::from)
    }

    /// Share `network` with other contexts, e.g. to simulate several processes
    pub fn on_network(
        config: MeshConfig,
        storage: Arc<dyn StorageBackend>,
        network: Arc<LocalNetwork>,
    ) -> Result<Self, ConfigError> {
        let mut ctx = Self::new(config, storage, network.clone())?;
        ctx.network = Some(network);
        Ok(ctx)
    }

    pub fn with_probes(mut self, probes: ProbeDirectory) -> Self {
        self.probes = probes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = MeshConfig::default();
        config.endpoint.resend_ms = 0;
        let result = MeshContext::new(config, Arc::new(MemoryStorage::new()), LocalNetwork::new());
        assert!(matches!(result, Err(ConfigError::InvalidResendDelay)));
    }

    #[test]
    fn test_local_context_uses_memory_store() {
        let ctx = MeshContext::local(MeshConfig::default()).unwrap();
        assert!(ctx.network.is_some());
        assert!(ctx.storage.scan_prefix(b"").unwrap().is_empty());
    }

    #[test]
    fn test_local_context_opens_sled() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MeshConfig::default();
        config.storage.path = Some(dir.path().join("db").to_string_lossy().into_owned());
        let ctx = MeshContext::local(config).unwrap();
        ctx.storage.put(b"k", b"v").unwrap();
        assert_eq!(ctx.storage.get(b"k").unwrap(), Some(b"v".to_vec()));
    }
}
