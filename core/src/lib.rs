// meshgrid: replicated mesh objects with proxies, ping-pong endpoints and
// probe-fed shadow mesh bases
//
// A mesh base owns replicas of mesh objects. For every partner it talks to,
// it keeps one proxy, which batches protocol operations onto a message
// endpoint. Shadows are mesh bases filled by probes reading external data
// sources on a schedule.

pub mod comm;
pub mod config;
pub mod context;
pub mod identifier;
pub mod listener;
pub mod mesh;
pub mod message;
pub mod probe;
pub mod proxy;
pub mod scheduler;
pub mod store;

use parking_lot::RwLock;
use std::collections::HashMap;

pub use comm::{LocalNetwork, MessageEndpoint, Transport, TransportError};
pub use config::{ConfigError, MeshConfig};
pub use context::{ContextError, MeshContext};
pub use identifier::{AccessPath, IdentifierError, MeshBaseId, MeshObjectId};
pub use listener::ListenerSet;
pub use mesh::{
    AccessError, MeshBase, MeshBaseError, MeshBaseOptions, MeshObject, PropertyValue, Transaction,
    TransactionError,
};
pub use message::{Operation, ProtocolMessage};
pub use probe::{
    CoherenceSpecification, Probe, ProbeDirectory, ProbeError, ProbeManager, ProbeOutput,
    ProbeUpdateSpecification, UpdateOutcome,
};
pub use proxy::{PolicyRegistry, ProxyInfo, ProxyListener};
pub use store::{MemoryStorage, SledStorage, StorageBackend, StoreError};

// ============================================================================
// MESH GRID
// ============================================================================

/// One process worth of mesh bases sharing a context and a probe manager
pub struct MeshGrid {
    ctx: MeshContext,
    probes: ProbeManager,
    mesh_bases: RwLock<HashMap<MeshBaseId, MeshBase>>,
}

impl MeshGrid {
    /// In-process network and the store named by `config`
    pub fn new(config: MeshConfig) -> Result<Self, ContextError> {
        Ok(Self::with_context(MeshContext::local(config)?))
    }

    pub fn with_context(ctx: MeshContext) -> Self {
        Self {
            probes: ProbeManager::new(ctx.clone()),
            ctx,
            mesh_bases: RwLock::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &MeshContext {
        &self.ctx
    }

    pub fn probes(&self) -> &ProbeManager {
        &self.probes
    }

    /// The local mesh base `id`, spawned on first use
    pub fn mesh_base(&self, id: &MeshBaseId) -> Result<MeshBase, MeshBaseError> {
        if let Some(existing) = self.mesh_bases.read().get(id).filter(|m| m.is_alive()) {
            return Ok(existing.clone());
        }
        let mut mesh_bases = self.mesh_bases.write();
        if let Some(existing) = mesh_bases.get(id).filter(|m| m.is_alive()) {
            return Ok(existing.clone());
        }
        let mesh_base = MeshBase::spawn(id.clone(), &self.ctx, MeshBaseOptions::default())?;
        mesh_bases.insert(id.clone(), mesh_base.clone());
        Ok(mesh_base)
    }

    /// Start probe scheduling; returns how many schedules were restored
    pub fn start(&self) -> Result<usize, ProbeError> {
        self.probes.start()
    }

    /// Save every proxy, stop all mesh bases and the probe manager
    pub async fn shutdown(&self) {
        let mesh_bases: Vec<MeshBase> = self.mesh_bases.write().drain().map(|(_, m)| m).collect();
        for mesh_base in mesh_bases {
            mesh_base.shutdown().await;
        }
        self.probes.stop().await;
        if let Err(e) = self.ctx.storage.flush() {
            tracing::warn!("Failed to flush store: {}", e);
        }
    }
}
