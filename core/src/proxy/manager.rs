//! Proxy manager
//!
//! Owns every proxy of one mesh base, keyed by partner. Proxies are created
//! on first use, restored from the store when a persisted record exists and
//! written back by [`ProxyManager::save_all`].

use super::event::ProxyListeners;
use super::externalized::ExternalizedProxy;
use super::policy::{PolicyRegistry, ProxyPolicy};
use super::proxy::{Proxy, ProxyDeps, ProxyState, ReplicaHost};
use crate::comm::{EndpointDeps, EndpointState, MessageEndpoint};
use crate::identifier::MeshBaseId;
use crate::store::{StorageBackend, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error, Clone)]
pub enum ProxyError {
    #[error("A mesh base cannot be its own partner: {0}")]
    SelfPartner(MeshBaseId),
    #[error("Unknown proxy policy: {0}")]
    UnknownPolicy(String),
    #[error("Record belongs to {found}, expected {expected}")]
    ForeignRecord { expected: MeshBaseId, found: MeshBaseId },
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("No proxy for {0}")]
    NotFound(MeshBaseId),
    #[error("Proxy to {0} is dead")]
    Dead(MeshBaseId),
}

/// Snapshot of one proxy for inspection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyInfo {
    pub partner: MeshBaseId,
    pub policy: String,
    pub state: ProxyState,
    pub endpoint_state: EndpointState,
    pub last_sent_token: u64,
    pub last_received_token: u64,
    pub unacknowledged: usize,
    pub pending: usize,
    pub time_created: u64,
    pub time_updated: u64,
}

/// Builds proxies for one mesh base
#[derive(Clone)]
pub struct ProxyFactory {
    own: MeshBaseId,
    policy: String,
    registry: PolicyRegistry,
    endpoint_deps: EndpointDeps,
    proxy_deps: ProxyDeps,
    listeners: Arc<ProxyListeners>,
}

impl ProxyFactory {
    pub fn new(
        own: MeshBaseId,
        policy: impl Into<String>,
        registry: PolicyRegistry,
        endpoint_deps: EndpointDeps,
        proxy_deps: ProxyDeps,
        listeners: Arc<ProxyListeners>,
    ) -> Result<Self, ProxyError> {
        let policy = policy.into();
        if !registry.contains(&policy) {
            return Err(ProxyError::UnknownPolicy(policy));
        }
        Ok(Self {
            own,
            policy,
            registry,
            endpoint_deps,
            proxy_deps,
            listeners,
        })
    }

    fn policy(&self, name: &str) -> Result<Arc<dyn ProxyPolicy>, ProxyError> {
        self.registry
            .create(name)
            .ok_or_else(|| ProxyError::UnknownPolicy(name.to_string()))
    }

    pub fn create(&self, partner: &MeshBaseId) -> Result<Proxy, ProxyError> {
        if partner == &self.own {
            return Err(ProxyError::SelfPartner(partner.clone()));
        }
        let endpoint = MessageEndpoint::new(
            self.own.clone(),
            partner.clone(),
            self.endpoint_deps.clone(),
        );
        Ok(Proxy::new(
            self.own.clone(),
            partner.clone(),
            self.policy(&self.policy)?,
            endpoint,
            self.listeners.clone(),
            self.proxy_deps.clone(),
        ))
    }

    pub fn restore(&self, record: ExternalizedProxy) -> Result<Proxy, ProxyError> {
        if record.own != self.own {
            return Err(ProxyError::ForeignRecord {
                expected: self.own.clone(),
                found: record.own,
            });
        }
        let policy = self.policy(&record.policy)?;
        let endpoint = MessageEndpoint::restore(
            self.own.clone(),
            record.partner.clone(),
            record.endpoint.clone(),
            self.endpoint_deps.clone(),
        );
        Ok(Proxy::restore(
            record,
            policy,
            endpoint,
            self.listeners.clone(),
            self.proxy_deps.clone(),
        ))
    }
}

pub struct ProxyManager {
    own: MeshBaseId,
    factory: ProxyFactory,
    proxies: BTreeMap<MeshBaseId, Proxy>,
    /// Gracefully dying proxies, saved again once drained
    draining: BTreeSet<MeshBaseId>,
    storage: Arc<dyn StorageBackend>,
}

impl ProxyManager {
    pub fn new(factory: ProxyFactory, storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            own: factory.own.clone(),
            factory,
            proxies: BTreeMap::new(),
            draining: BTreeSet::new(),
            storage,
        }
    }

    /// The proxy for `partner`, restoring or creating it if needed
    pub async fn obtain(&mut self, partner: &MeshBaseId) -> Result<&mut Proxy, ProxyError> {
        if !self.proxies.contains_key(partner) {
            let proxy = match ExternalizedProxy::load(self.storage.as_ref(), &self.own, partner)? {
                Some(record) => {
                    debug!("Restoring proxy {} -> {}", self.own, partner);
                    self.factory.restore(record)?
                }
                None => {
                    debug!("Creating proxy {} -> {}", self.own, partner);
                    self.factory.create(partner)?
                }
            };
            self.proxies.insert(partner.clone(), proxy);
            if let Some(proxy) = self.proxies.get_mut(partner) {
                proxy.start().await;
            }
        }
        let proxy = self
            .proxies
            .get_mut(partner)
            .ok_or_else(|| ProxyError::NotFound(partner.clone()))?;
        if proxy.state() == ProxyState::Dead {
            return Err(ProxyError::Dead(partner.clone()));
        }
        Ok(proxy)
    }

    /// Restore every persisted proxy of this mesh base. Returns how many.
    pub async fn restore_all(&mut self) -> Result<usize, ProxyError> {
        let mut restored = 0;
        for record in ExternalizedProxy::load_all_for(self.storage.as_ref(), &self.own)? {
            if self.proxies.contains_key(&record.partner) {
                continue;
            }
            let partner = record.partner.clone();
            let mut proxy = self.factory.restore(record)?;
            proxy.start().await;
            self.proxies.insert(partner, proxy);
            restored += 1;
        }
        if restored > 0 {
            info!("Restored {} proxies of {}", restored, self.own);
        }
        Ok(restored)
    }

    pub fn find(&self, partner: &MeshBaseId) -> Option<&Proxy> {
        self.proxies.get(partner)
    }

    pub fn find_mut(&mut self, partner: &MeshBaseId) -> Option<&mut Proxy> {
        self.proxies.get_mut(partner)
    }

    pub fn proxies(&self) -> impl Iterator<Item = &Proxy> {
        self.proxies.values()
    }

    pub fn proxies_mut(&mut self) -> impl Iterator<Item = &mut Proxy> {
        self.proxies.values_mut()
    }

    pub fn partners(&self) -> Vec<MeshBaseId> {
        self.proxies.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    /// Kill the proxy to `partner`. A permanent removal also deletes its
    /// record; a graceful one keeps the proxy until its endpoint drained.
    pub async fn remove(
        &mut self,
        partner: &MeshBaseId,
        permanent: bool,
        host: &mut dyn ReplicaHost,
    ) -> Result<(), ProxyError> {
        let proxy = self
            .proxies
            .get_mut(partner)
            .ok_or_else(|| ProxyError::NotFound(partner.clone()))?;
        proxy.die(permanent, host).await;
        let dead = proxy.handle_endpoint_events(host) || proxy.state() == ProxyState::Dead;
        if permanent {
            ExternalizedProxy::delete(self.storage.as_ref(), &self.own, partner)?;
        } else {
            proxy.externalize().save(self.storage.as_ref())?;
        }
        if dead {
            self.proxies.remove(partner);
        } else if !permanent {
            self.draining.insert(partner.clone());
        }
        Ok(())
    }

    /// Drop a proxy whose death completed
    pub fn finish_dying(&mut self, partner: &MeshBaseId) -> Option<Proxy> {
        let proxy = self.proxies.remove(partner)?;
        debug!("Proxy {} -> {} removed", self.own, partner);
        if self.draining.remove(partner) {
            if let Err(e) = proxy.externalize().save(self.storage.as_ref()) {
                warn!("Failed to save drained proxy {} -> {}: {}", self.own, partner, e);
            }
        } else if proxy.endpoint().state() == EndpointState::Halted {
            // a restored record would only halt again
            if let Err(e) = ExternalizedProxy::delete(self.storage.as_ref(), &self.own, partner) {
                warn!("Failed to delete halted proxy {} -> {}: {}", self.own, partner, e);
            }
        }
        Some(proxy)
    }

    /// Flush and persist every live proxy. Returns how many were saved.
    pub async fn save_all(&mut self) -> usize {
        let mut saved = 0;
        for proxy in self.proxies.values_mut() {
            if proxy.state() == ProxyState::Dead {
                continue;
            }
            proxy.flush().await;
            match proxy.externalize().save(self.storage.as_ref()) {
                Ok(()) => saved += 1,
                Err(e) => warn!("Failed to save proxy {} -> {}: {}", self.own, proxy.partner(), e),
            }
        }
        if let Err(e) = self.storage.flush() {
            warn!("Failed to flush proxy store: {}", e);
        }
        saved
    }

    pub fn info(&self) -> Vec<ProxyInfo> {
        self.proxies
            .values()
            .map(|proxy| {
                let endpoint = proxy.endpoint();
                ProxyInfo {
                    partner: proxy.partner().clone(),
                    policy: proxy.policy_name().to_string(),
                    state: proxy.state(),
                    endpoint_state: endpoint.state(),
                    last_sent_token: endpoint.last_sent_token(),
                    last_received_token: endpoint.last_received_token(),
                    unacknowledged: endpoint.unacknowledged_len(),
                    pending: endpoint.pending_len(),
                    time_created: proxy.time_created(),
                    time_updated: proxy.time_updated(),
                }
            })
            .collect()
    }
}
