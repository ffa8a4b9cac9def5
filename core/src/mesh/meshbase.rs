//! Mesh base
//!
//! A mesh base owns its replicas, its proxies and the completion registry.
//! [`MeshBase`] is a cheap handle; the state lives in one task that runs a
//! `tokio::select!` loop over commands from handles, frames from the
//! transport and timer events from endpoints and proxies. Replica content is
//! shared with handles behind a lock so reads never wait for the loop.
//!
//! Everything that talks to a partner is fire-and-estimate: the loop registers
//! a completion key, asks the responsible proxy and hands the caller a
//! receiver. The caller decides how long to wait.

use super::object::{now_millis, Change, MeshObject};
use super::synchronizer::{AccessError, Completion, PendingKey, Synchronizer};
use super::transaction::{apply_changes, validate_local, CommittedTransaction, ReplicaMap, Transaction, TransactionError};
use crate::comm::{Delivery, EndpointDeps, Frame, TimerEvent, TimerKind, Transport, TransportError};
use crate::context::MeshContext;
use crate::identifier::{AccessPath, MeshBaseId, MeshObjectId};
use crate::message::ProtocolMessage;
use crate::probe::adapter::ProbeError;
use crate::probe::coherence::CoherenceSpecification;
use crate::proxy::{
    group_by_proxy, LocalEffect, Proxy, ProxyDeps, ProxyError, ProxyFactory, ProxyInfo, ProxyListener,
    ProxyListeners, ProxyManager, ReplicaHost,
};
use async_trait::async_trait;
use parking_lot::{RwLock, RwLockReadGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the command queue of one mesh base
const COMMAND_QUEUE: usize = 256;

#[derive(Debug, Error)]
pub enum MeshBaseError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),
    #[error("Mesh base stopped: {0}")]
    Stopped(MeshBaseId),
}

/// Hooks a shadow mesh base uses to reach whatever feeds it
#[async_trait]
pub trait ShadowControl: Send + Sync {
    /// Re-read the data source of `shadow` now. Returns whether content changed.
    async fn refresh(&self, shadow: &MeshBaseId) -> Result<bool, ProbeError>;

    /// A lock holder changed content; write it through to the source
    async fn write_back(&self, shadow: &MeshBaseId, changes: Vec<Change>) -> Result<(), ProbeError>;

    /// A partner asked for this freshness
    fn adopt_coherence(&self, shadow: &MeshBaseId, coherence: CoherenceSpecification);
}

/// How to spawn a mesh base
#[derive(Clone, Default)]
pub struct MeshBaseOptions {
    /// Proxy policy; the configured default when `None`
    pub policy: Option<String>,
    /// Whether the data source accepts writes
    pub writable: bool,
    pub shadow_control: Option<Weak<dyn ShadowControl>>,
    /// Stay off the transport until [`MeshBase::attach`]
    pub detached: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ownership {
    ObtainLock,
    PushLock,
    ObtainHome,
    PushHome,
    ForceLock,
    Cancel,
    Resynchronize,
    Freshen,
}

impl Ownership {
    /// What the caller waits for, if anything
    fn key(self, id: &MeshObjectId) -> Option<PendingKey> {
        match self {
            Ownership::ObtainLock | Ownership::ForceLock => Some(PendingKey::Lock(id.clone())),
            Ownership::ObtainHome => Some(PendingKey::Home(id.clone())),
            Ownership::Resynchronize | Ownership::Freshen => Some(PendingKey::Resync(id.clone())),
            Ownership::PushLock | Ownership::PushHome | Ownership::Cancel => None,
        }
    }

    /// The proxy in charge of `replica`; `None` when this replica already
    /// has the role
    fn responsible(self, replica: &MeshObject) -> Option<MeshBaseId> {
        let info = &replica.replica;
        match self {
            Ownership::ObtainLock | Ownership::ForceLock => info.lock_proxy.clone(),
            Ownership::ObtainHome | Ownership::Resynchronize | Ownership::Freshen => info.home_proxy.clone(),
            Ownership::Cancel => info.home_proxy.clone().or_else(|| info.lock_proxy.clone()),
            Ownership::PushLock | Ownership::PushHome => None,
        }
    }

    fn dispatch(
        self,
        proxy: &mut Proxy,
        objects: &[MeshObjectId],
        wait: Option<Duration>,
        host: &mut dyn ReplicaHost,
    ) -> Duration {
        match self {
            Ownership::ObtainLock => proxy.try_obtain_locks(objects, wait, host),
            Ownership::PushLock => proxy.try_push_locks(objects, wait, host),
            Ownership::ObtainHome => proxy.try_obtain_home_replicas(objects, wait, host),
            Ownership::PushHome => proxy.try_push_home_replicas(objects, wait, host),
            Ownership::ForceLock => proxy.force_obtain_locks(objects, wait, host),
            Ownership::Cancel => proxy.cancel_replicas(objects, wait, host),
            Ownership::Resynchronize => proxy.try_resynchronize_replicas(objects, wait, host),
            Ownership::Freshen => proxy.freshen(objects, wait, host),
        }
    }
}

enum Command {
    Commit {
        changes: Vec<Change>,
        /// Source updates of a shadow bypass lock checks
        checked: bool,
        reply: oneshot::Sender<Result<(), TransactionError>>,
    },
    Access {
        path: AccessPath,
        coherence: Option<CoherenceSpecification>,
        wait: Option<Duration>,
        reply: oneshot::Sender<oneshot::Receiver<Completion>>,
    },
    Ownership {
        kind: Ownership,
        objects: Vec<MeshObjectId>,
        partner: Option<MeshBaseId>,
        wait: Option<Duration>,
        reply: oneshot::Sender<Vec<oneshot::Receiver<Completion>>>,
    },
    /// A shadow refresh finished; ship the objects
    Convey {
        partner: MeshBaseId,
        objects: Vec<MeshObjectId>,
    },
    SaveProxies {
        reply: oneshot::Sender<usize>,
    },
    ProxyInfo {
        reply: oneshot::Sender<Vec<ProxyInfo>>,
    },
    KillProxy {
        partner: MeshBaseId,
        permanent: bool,
        reply: oneshot::Sender<Result<(), ProxyError>>,
    },
    Shutdown {
        reply: oneshot::Sender<usize>,
    },
    Attach {
        inbox: mpsc::UnboundedReceiver<Delivery>,
        reply: oneshot::Sender<()>,
    },
    Die,
}

fn ready(result: Completion) -> oneshot::Receiver<Completion> {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(result);
    rx
}

// ============================================================================
// HANDLE
// ============================================================================

/// Handle to a running mesh base
#[derive(Clone)]
pub struct MeshBase {
    id: MeshBaseId,
    replicas: Arc<RwLock<ReplicaMap>>,
    writable: Arc<AtomicBool>,
    listeners: Arc<ProxyListeners>,
    commands: mpsc::Sender<Command>,
    transport: Arc<dyn Transport>,
    task: Arc<JoinHandle<()>>,
    default_wait: Duration,
}

impl MeshBase {
    /// Spawn a mesh base on the current runtime and attach it to the
    /// transport, unless the options keep it detached
    pub fn spawn(id: MeshBaseId, ctx: &MeshContext, options: MeshBaseOptions) -> Result<Self, MeshBaseError> {
        let (timers_tx, timers_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let listeners = Arc::new(ProxyListeners::new());
        let policy = options
            .policy
            .clone()
            .unwrap_or_else(|| ctx.config.proxy.default_policy.clone());

        let factory = ProxyFactory::new(
            id.clone(),
            policy,
            ctx.policies.clone(),
            EndpointDeps {
                transport: ctx.transport.clone(),
                timers: timers_tx.clone(),
                scheduler: ctx.scheduler.clone(),
                config: ctx.config.endpoint.clone(),
            },
            ProxyDeps {
                scheduler: ctx.scheduler.clone(),
                timers: timers_tx,
                config: ctx.config.proxy.clone(),
                flush_delay: ctx.config.endpoint.respond_with_message(),
            },
            listeners.clone(),
        )?;
        let inbox = if options.detached {
            None
        } else {
            Some(ctx.transport.attach(&id)?)
        };

        let mut replicas = ReplicaMap::new();
        let home = MeshObject::new(MeshObjectId::home(&id), now_millis());
        replicas.insert(home.identifier.clone(), home);
        let replicas = Arc::new(RwLock::new(replicas));
        let writable = Arc::new(AtomicBool::new(options.writable));

        let actor = MeshBaseActor {
            core: MeshCore {
                id: id.clone(),
                replicas: replicas.clone(),
                synchronizer: Synchronizer::new(),
                writable: writable.clone(),
                shadow_control: options.shadow_control,
                commands: commands_tx.downgrade(),
                committed: Vec::new(),
                refreshes: Vec::new(),
                writes: Vec::new(),
            },
            proxies: ProxyManager::new(factory, ctx.storage.clone()),
            transport: ctx.transport.clone(),
            commands: commands_rx,
            inbox,
            timers: timers_rx,
        };
        let task = tokio::spawn(actor.run());
        info!("Mesh base {} started", id);

        Ok(Self {
            id,
            replicas,
            writable,
            listeners,
            commands: commands_tx,
            transport: ctx.transport.clone(),
            task: Arc::new(task),
            default_wait: ctx.config.proxy.default_rpc_wait(),
        })
    }

    pub fn id(&self) -> &MeshBaseId {
        &self.id
    }

    pub fn home_object_id(&self) -> MeshObjectId {
        MeshObjectId::home(&self.id)
    }

    /// Current local replica, without contacting anyone
    pub fn get(&self, id: &MeshObjectId) -> Option<MeshObject> {
        self.replicas.read().get(id).cloned()
    }

    pub fn replica_ids(&self) -> Vec<MeshObjectId> {
        self.replicas.read().keys().cloned().collect()
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.read().len()
    }

    pub fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Relaxed)
    }

    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::Relaxed);
    }

    /// Subscribe to events of every proxy of this mesh base
    pub fn proxy_listeners(&self) -> &ProxyListeners {
        &self.listeners
    }

    pub fn add_proxy_listener(&self, listener: Arc<dyn ProxyListener>) {
        self.listeners.add_direct(listener);
    }

    async fn send<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, AccessError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| AccessError::MeshBaseDead)?;
        rx.await.map_err(|_| AccessError::MeshBaseDead)
    }

    /// Run a transaction. `build` sees the committed state; its changes are
    /// re-validated and applied by the mesh base, then every proxy is told.
    pub async fn execute<T>(
        &self,
        build: impl FnOnce(&mut Transaction<'_>) -> Result<T, TransactionError>,
    ) -> Result<T, TransactionError> {
        let (value, changes) = {
            let replicas = self.replicas.read();
            let mut tx = Transaction::new(&self.id, &replicas, now_millis());
            let value = build(&mut tx)?;
            (value, tx.into_changes())
        };
        self.commit(changes, true).await?;
        Ok(value)
    }

    /// Apply changes read from a data source, regardless of lock ownership
    pub(crate) async fn commit_from_source(&self, changes: Vec<Change>) -> Result<(), TransactionError> {
        self.commit(changes, false).await
    }

    async fn commit(&self, changes: Vec<Change>, checked: bool) -> Result<(), TransactionError> {
        if changes.is_empty() {
            return Ok(());
        }
        self.send(|reply| Command::Commit {
            changes,
            checked,
            reply,
        })
        .await
        .map_err(|_| TransactionError::MeshBaseDead)?
    }

    /// The replica `path` leads to, obtaining it from the partner if needed.
    /// Concurrent requests for the same object share one request.
    pub async fn access_locally(
        &self,
        path: &AccessPath,
        coherence: Option<CoherenceSpecification>,
        wait: Option<Duration>,
    ) -> Result<MeshObject, AccessError> {
        let target = path.target();
        if let Some(replica) = self.get(&target) {
            return Ok(replica);
        }
        let completion = self
            .send(|reply| Command::Access {
                path: path.clone(),
                coherence,
                wait,
                reply,
            })
            .await?;
        self.await_completions(vec![completion], wait).await?;
        self.get(&target).ok_or(AccessError::NotFound(target))
    }

    async fn ownership(
        &self,
        kind: Ownership,
        objects: &[MeshObjectId],
        partner: Option<&MeshBaseId>,
        wait: Option<Duration>,
    ) -> Result<(), AccessError> {
        let receivers = self
            .send(|reply| Command::Ownership {
                kind,
                objects: objects.to_vec(),
                partner: partner.cloned(),
                wait,
                reply,
            })
            .await?;
        self.await_completions(receivers, wait).await
    }

    async fn await_completions(
        &self,
        receivers: Vec<oneshot::Receiver<Completion>>,
        wait: Option<Duration>,
    ) -> Result<(), AccessError> {
        if receivers.is_empty() {
            return Ok(());
        }
        let wait = wait.unwrap_or(self.default_wait);
        let results = tokio::time::timeout(wait, futures::future::join_all(receivers))
            .await
            .map_err(|_| AccessError::Timeout)?;
        for result in results {
            result.map_err(|_| AccessError::MeshBaseDead)??;
        }
        Ok(())
    }

    /// Obtain the lock of each object from whoever holds it
    pub async fn obtain_lock(&self, objects: &[MeshObjectId], wait: Option<Duration>) -> Result<(), AccessError> {
        self.ownership(Ownership::ObtainLock, objects, None, wait).await
    }

    /// Hand the locks we hold to `partner`
    pub async fn push_lock(&self, objects: &[MeshObjectId], partner: &MeshBaseId) -> Result<(), AccessError> {
        self.ownership(Ownership::PushLock, objects, Some(partner), None).await
    }

    pub async fn obtain_home(&self, objects: &[MeshObjectId], wait: Option<Duration>) -> Result<(), AccessError> {
        self.ownership(Ownership::ObtainHome, objects, None, wait).await
    }

    pub async fn push_home(&self, objects: &[MeshObjectId], partner: &MeshBaseId) -> Result<(), AccessError> {
        self.ownership(Ownership::PushHome, objects, Some(partner), None).await
    }

    /// Take the locks without negotiation
    pub async fn force_obtain_lock(&self, objects: &[MeshObjectId]) -> Result<(), AccessError> {
        self.ownership(Ownership::ForceLock, objects, None, None).await
    }

    /// Drop local replicas and end their leases
    pub async fn cancel_replica(&self, objects: &[MeshObjectId]) -> Result<(), AccessError> {
        self.ownership(Ownership::Cancel, objects, None, None).await
    }

    /// Re-fetch the authoritative state of each object
    pub async fn resynchronize(&self, objects: &[MeshObjectId], wait: Option<Duration>) -> Result<(), AccessError> {
        self.ownership(Ownership::Resynchronize, objects, None, wait).await
    }

    /// Ask the home side to refresh from its source, then re-fetch
    pub async fn freshen(&self, objects: &[MeshObjectId], wait: Option<Duration>) -> Result<(), AccessError> {
        self.ownership(Ownership::Freshen, objects, None, wait).await
    }

    /// Persist every live proxy. Returns how many were saved.
    pub async fn save_proxies(&self) -> Result<usize, AccessError> {
        self.send(|reply| Command::SaveProxies { reply }).await
    }

    pub async fn proxy_info(&self) -> Result<Vec<ProxyInfo>, AccessError> {
        self.send(|reply| Command::ProxyInfo { reply }).await
    }

    pub async fn kill_proxy(&self, partner: &MeshBaseId, permanent: bool) -> Result<(), ProxyError> {
        self.send(|reply| Command::KillProxy {
            partner: partner.clone(),
            permanent,
            reply,
        })
        .await
        .map_err(|_| ProxyError::NotFound(partner.clone()))?
    }

    /// Save all proxies and stop. Returns how many proxies were saved.
    pub async fn shutdown(&self) -> usize {
        self.send(|reply| Command::Shutdown { reply })
            .await
            .unwrap_or(0)
    }

    /// Start receiving frames for a mesh base spawned detached
    pub async fn attach(&self) -> Result<(), MeshBaseError> {
        let inbox = self.transport.attach(&self.id)?;
        if self.send(|reply| Command::Attach { inbox, reply }).await.is_err() {
            self.transport.detach(&self.id);
            return Err(MeshBaseError::Stopped(self.id.clone()));
        }
        debug!("Mesh base {} attached", self.id);
        Ok(())
    }

    /// Stop at once without saving
    pub async fn die(&self) {
        if self.commands.send(Command::Die).await.is_err() {
            debug!("Mesh base {} already stopped", self.id);
        }
    }
}

// ============================================================================
// LOOP
// ============================================================================

/// The side of the mesh base proxies act upon
struct MeshCore {
    id: MeshBaseId,
    replicas: Arc<RwLock<ReplicaMap>>,
    synchronizer: Synchronizer,
    writable: Arc<AtomicBool>,
    shadow_control: Option<Weak<dyn ShadowControl>>,
    commands: mpsc::WeakSender<Command>,
    /// Commits not yet handed to the proxies
    committed: Vec<CommittedTransaction>,
    /// Shadow refreshes requested by partners
    refreshes: Vec<(MeshBaseId, Vec<MeshObjectId>)>,
    /// Partner changes to write through to the data source
    writes: Vec<Vec<Change>>,
}

impl MeshCore {
    fn control(&self) -> Option<Arc<dyn ShadowControl>> {
        self.shadow_control.as_ref().and_then(Weak::upgrade)
    }

    fn with_replica(&self, id: &MeshObjectId, update: impl FnOnce(&mut MeshObject)) {
        match self.replicas.write().get_mut(id) {
            Some(replica) => update(replica),
            None => debug!("{}: no replica of {}", self.id, id),
        }
    }
}

impl ReplicaHost for MeshCore {
    fn replicas(&self) -> RwLockReadGuard<'_, ReplicaMap> {
        self.replicas.read()
    }

    fn writable(&self) -> bool {
        self.writable.load(Ordering::Relaxed)
    }

    fn is_pending(&self, key: &PendingKey) -> bool {
        self.synchronizer.is_pending(key)
    }

    fn apply(&mut self, partner: &MeshBaseId, effect: LocalEffect) {
        let now = now_millis();
        match effect {
            LocalEffect::AcceptReplicas(payloads) => {
                let ids: Vec<MeshObjectId> = payloads.iter().map(|p| p.identifier.clone()).collect();
                let changes = payloads.into_iter().map(Change::Created).collect();
                let committed = {
                    let mut replicas = self.replicas.write();
                    let committed = apply_changes(&mut replicas, changes, Some(partner), now);
                    for id in &ids {
                        if let Some(replica) = replicas.get_mut(id) {
                            replica.replica.proxies.insert(partner.clone());
                        }
                    }
                    committed
                };
                debug!("{}: accepted {} replicas from {}", self.id, ids.len(), partner);
                self.committed.push(committed);
            }
            LocalEffect::AddPartner(ids) => {
                for id in ids {
                    self.with_replica(&id, |r| {
                        r.replica.proxies.insert(partner.clone());
                    });
                }
            }
            LocalEffect::RemovePartner(ids) => {
                for id in ids {
                    self.with_replica(&id, |r| {
                        r.replica.proxies.remove(partner);
                    });
                }
            }
            LocalEffect::RemoveReplicas(ids) => {
                let mut replicas = self.replicas.write();
                for id in ids {
                    replicas.remove(&id);
                }
            }
            LocalEffect::GiveLock { object, epoch } => self.with_replica(&object, |r| {
                r.replica.lock_proxy = Some(partner.clone());
                r.replica.lock_epoch = r.replica.lock_epoch.max(epoch);
                r.replica.proxies.insert(partner.clone());
            }),
            LocalEffect::TakeLock { object, epoch } => self.with_replica(&object, |r| {
                r.replica.lock_proxy = None;
                r.replica.lock_epoch = r.replica.lock_epoch.max(epoch);
            }),
            LocalEffect::GiveHome(object) => self.with_replica(&object, |r| {
                r.replica.home_proxy = Some(partner.clone());
                r.replica.proxies.insert(partner.clone());
            }),
            LocalEffect::TakeHome(object) => self.with_replica(&object, |r| {
                r.replica.home_proxy = None;
            }),
            LocalEffect::ApplyChanges(changes) => {
                let committed = apply_changes(&mut self.replicas.write(), changes, Some(partner), now);
                if self.shadow_control.is_some() && !committed.changes.is_empty() {
                    self.writes.push(committed.changes.clone());
                }
                self.committed.push(committed);
            }
            LocalEffect::Refresh(ids) => self.refreshes.push((partner.clone(), ids)),
            LocalEffect::AdoptCoherence(coherence) => match self.control() {
                Some(control) => control.adopt_coherence(&self.id, coherence),
                None => debug!("{}: no data source to apply {} to", self.id, coherence),
            },
            LocalEffect::Complete { key, result } => {
                self.synchronizer.complete(&key, result);
            }
            LocalEffect::FailPending(reason) => {
                let failed = self.synchronizer.fail_partner(
                    partner,
                    AccessError::ProxyFailed {
                        partner: partner.clone(),
                        reason,
                    },
                );
                if failed > 0 {
                    warn!("{}: failed {} requests waiting on {}", self.id, failed, partner);
                }
            }
            LocalEffect::ResynchronizeFailed { objects, reason } => {
                debug!("{}: {} objects not resynchronized: {}", self.id, objects.len(), reason);
            }
        }
    }
}

struct MeshBaseActor {
    core: MeshCore,
    proxies: ProxyManager,
    transport: Arc<dyn Transport>,
    commands: mpsc::Receiver<Command>,
    /// `None` while detached
    inbox: Option<mpsc::UnboundedReceiver<Delivery>>,
    timers: mpsc::UnboundedReceiver<TimerEvent>,
}

async fn next_delivery(inbox: &mut Option<mpsc::UnboundedReceiver<Delivery>>) -> Option<Delivery> {
    match inbox {
        Some(inbox) => inbox.recv().await,
        None => std::future::pending().await,
    }
}

impl MeshBaseActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    None => {
                        debug!("{}: all handles dropped", self.core.id);
                        self.stop();
                        break;
                    }
                },
                Some(delivery) = next_delivery(&mut self.inbox) => self.handle_delivery(delivery).await,
                Some(timer) = self.timers.recv() => self.handle_timer(timer).await,
            }
        }
        info!("Mesh base {} stopped", self.core.id);
    }

    /// Returns false when the loop should end
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Commit {
                changes,
                checked,
                reply,
            } => {
                let result = self.commit(changes, checked).await;
                let _ = reply.send(result);
            }
            Command::Access {
                path,
                coherence,
                wait,
                reply,
            } => {
                let completion = self.access(path, coherence, wait).await;
                let _ = reply.send(completion);
            }
            Command::Ownership {
                kind,
                objects,
                partner,
                wait,
                reply,
            } => {
                let receivers = self.ownership(kind, objects, partner, wait).await;
                let _ = reply.send(receivers);
            }
            Command::Convey { partner, objects } => {
                if let Some(proxy) = self.proxies.find_mut(&partner) {
                    proxy.convey(&objects, &mut self.core);
                    self.settle(&partner).await;
                }
            }
            Command::SaveProxies { reply } => {
                let _ = reply.send(self.proxies.save_all().await);
            }
            Command::ProxyInfo { reply } => {
                let _ = reply.send(self.proxies.info());
            }
            Command::KillProxy {
                partner,
                permanent,
                reply,
            } => {
                let result = self.proxies.remove(&partner, permanent, &mut self.core).await;
                self.propagate().await;
                let _ = reply.send(result);
            }
            Command::Shutdown { reply } => {
                let saved = self.proxies.save_all().await;
                self.stop();
                let _ = reply.send(saved);
                return false;
            }
            Command::Attach { inbox, reply } => {
                self.inbox = Some(inbox);
                let _ = reply.send(());
            }
            Command::Die => {
                self.stop();
                return false;
            }
        }
        true
    }

    fn stop(&mut self) {
        for proxy in self.proxies.proxies_mut() {
            proxy.stop();
        }
        if self.inbox.take().is_some() {
            self.transport.detach(&self.core.id);
        }
        self.core.synchronizer.fail_all(AccessError::MeshBaseDead);
    }

    async fn commit(&mut self, changes: Vec<Change>, checked: bool) -> Result<(), TransactionError> {
        let committed = {
            let mut replicas = self.core.replicas.write();
            if checked {
                validate_local(&replicas, &changes)?;
            }
            apply_changes(&mut replicas, changes, None, now_millis())
        };
        debug!("{}: committed {} changes", self.core.id, committed.changes.len());
        self.core.committed.push(committed);
        self.propagate().await;
        Ok(())
    }

    async fn access(
        &mut self,
        path: AccessPath,
        coherence: Option<CoherenceSpecification>,
        wait: Option<Duration>,
    ) -> oneshot::Receiver<Completion> {
        let target = path.target();
        if self.core.replicas.read().contains_key(&target) {
            return ready(Ok(()));
        }
        let partner = path.mesh_base.clone();
        if partner == self.core.id {
            return ready(Err(AccessError::NotFound(target)));
        }

        let key = PendingKey::Replica(target);
        let (completion, first) = self.core.synchronizer.register(key.clone(), &partner);
        if first {
            match self.proxies.obtain(&partner).await {
                Ok(proxy) => {
                    let estimate = proxy.obtain_replicas(&[path], coherence.as_ref(), wait, &mut self.core);
                    debug!("{}: obtaining from {}, expect {:?}", self.core.id, partner, estimate);
                }
                Err(e) => {
                    self.core.synchronizer.complete(
                        &key,
                        Err(AccessError::ProxyFailed {
                            partner: partner.clone(),
                            reason: e.to_string(),
                        }),
                    );
                }
            }
            self.settle(&partner).await;
        }
        completion
    }

    async fn ownership(
        &mut self,
        kind: Ownership,
        objects: Vec<MeshObjectId>,
        partner: Option<MeshBaseId>,
        wait: Option<Duration>,
    ) -> Vec<oneshot::Receiver<Completion>> {
        let mut receivers = Vec::new();
        let mut routed = Vec::new();
        {
            let replicas = self.core.replicas.read();
            for id in objects {
                let Some(replica) = replicas.get(&id) else {
                    receivers.push(ready(Err(AccessError::NotFound(id))));
                    continue;
                };
                match partner.clone().or_else(|| kind.responsible(replica)) {
                    Some(proxy) if proxy != self.core.id => routed.push((proxy, id)),
                    _ if kind == Ownership::Cancel => {
                        receivers.push(ready(Err(AccessError::Denied(format!(
                            "{} is the home replica of {}",
                            self.core.id, id
                        )))));
                    }
                    // this replica has the role already
                    _ => receivers.push(ready(Ok(()))),
                }
            }
        }

        for batch in group_by_proxy(routed) {
            let mut fresh = Vec::new();
            for id in &batch.objects {
                match kind.key(id) {
                    Some(key) => {
                        let (rx, first) = self.core.synchronizer.register(key, &batch.proxy);
                        receivers.push(rx);
                        if first {
                            fresh.push(id.clone());
                        }
                    }
                    None => fresh.push(id.clone()),
                }
            }
            if fresh.is_empty() {
                continue;
            }
            match self.proxies.obtain(&batch.proxy).await {
                Ok(proxy) => {
                    let estimate = kind.dispatch(proxy, &fresh, wait, &mut self.core);
                    debug!(
                        "{}: {:?} of {} objects via {}, expect {:?}",
                        self.core.id,
                        kind,
                        fresh.len(),
                        batch.proxy,
                        estimate
                    );
                }
                Err(e) => {
                    for id in &fresh {
                        if let Some(key) = kind.key(id) {
                            self.core.synchronizer.complete(
                                &key,
                                Err(AccessError::ProxyFailed {
                                    partner: batch.proxy.clone(),
                                    reason: e.to_string(),
                                }),
                            );
                        }
                    }
                }
            }
            self.settle(&batch.proxy).await;
        }
        receivers
    }

    async fn handle_delivery(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Frame(frame) => self.handle_frame(frame).await,
            Delivery::Rejected { to, error } => {
                let Some(proxy) = self.proxies.find_mut(&to) else {
                    debug!("{}: rejection from {} without a proxy", self.core.id, to);
                    return;
                };
                proxy.transport_rejected(error);
                self.settle(&to).await;
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) {
        let message = match ProtocolMessage::from_bytes(&frame.bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!("{}: undecodable frame from {}: {}", self.core.id, frame.from, e);
                return;
            }
        };
        if message.receiver != self.core.id {
            warn!(
                "{}: frame from {} addressed to {}",
                self.core.id, message.sender, message.receiver
            );
            return;
        }
        let partner = message.sender.clone();
        match self.proxies.obtain(&partner).await {
            Ok(proxy) => proxy.incoming_message(message, &mut self.core).await,
            Err(e) => {
                warn!("{}: no proxy for {}: {}", self.core.id, partner, e);
                return;
            }
        }
        self.settle(&partner).await;
    }

    async fn handle_timer(&mut self, timer: TimerEvent) {
        let Some(proxy) = self.proxies.find_mut(&timer.partner) else {
            return;
        };
        match timer.kind {
            TimerKind::Flush => proxy.on_flush_timer(timer.generation).await,
            kind => proxy.on_endpoint_timer(kind, timer.generation).await,
        }
        self.settle(&timer.partner).await;
    }

    /// Follow-up work after a proxy acted
    async fn settle(&mut self, partner: &MeshBaseId) {
        if let Some(proxy) = self.proxies.find_mut(partner) {
            if proxy.handle_endpoint_events(&mut self.core) {
                self.proxies.finish_dying(partner);
            }
        }
        self.propagate().await;
        self.start_source_work();
    }

    /// Hand every pending commit to every proxy
    async fn propagate(&mut self) {
        while !self.core.committed.is_empty() {
            let committed = std::mem::take(&mut self.core.committed);
            for transaction in &committed {
                if transaction.changes.is_empty() {
                    continue;
                }
                for proxy in self.proxies.proxies_mut() {
                    proxy.transaction_committed(transaction, &mut self.core);
                }
            }
        }
    }

    /// Data source access is slow, so it happens off the loop
    fn start_source_work(&mut self) {
        let shadow = self.core.id.clone();
        for changes in std::mem::take(&mut self.core.writes) {
            let Some(control) = self.core.control() else {
                break;
            };
            let shadow = shadow.clone();
            tokio::spawn(async move {
                let count = changes.len();
                match control.write_back(&shadow, changes).await {
                    Ok(()) => debug!("{}: wrote {} changes to the source", shadow, count),
                    Err(e) => warn!("{}: write-back failed: {}", shadow, e),
                }
            });
        }
        for (partner, objects) in std::mem::take(&mut self.core.refreshes) {
            let Some(commands) = self.core.commands.upgrade() else {
                return;
            };
            let shadow = self.core.id.clone();
            let control = self.core.control();
            tokio::spawn(async move {
                if let Some(control) = control {
                    if let Err(e) = control.refresh(&shadow).await {
                        warn!("{}: refresh for {} failed: {}", shadow, partner, e);
                    }
                }
                let _ = commands.send(Command::Convey { partner, objects }).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalNetwork;
    use crate::config::MeshConfig;
    use crate::mesh::object::PropertyValue;
    use crate::store::MemoryStorage;

    fn base(name: &str) -> MeshBaseId {
        MeshBaseId::new(name).unwrap()
    }

    fn context() -> MeshContext {
        MeshContext::new(
            MeshConfig::default(),
            Arc::new(MemoryStorage::new()),
            LocalNetwork::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_execute_creates_and_updates() {
        let ctx = context();
        let a = MeshBase::spawn(base("local:a"), &ctx, MeshBaseOptions::default()).unwrap();
        assert_eq!(a.replica_count(), 1);

        let id = a
            .execute(|tx| {
                let id = tx.create_object("item")?;
                tx.set_property(&id, "title", "hello")?;
                Ok(id)
            })
            .await
            .unwrap();
        let item = a.get(&id).unwrap();
        assert_eq!(item.property("title"), Some(&PropertyValue::from("hello")));

        let err = a
            .execute(|tx| tx.create_object("item").map(|_| ()))
            .await
            .unwrap_err();
        assert_eq!(err, TransactionError::AlreadyExists(id));
    }

    #[tokio::test]
    async fn test_access_replicates_from_partner() {
        let ctx = context();
        let a = MeshBase::spawn(base("local:a"), &ctx, MeshBaseOptions::default()).unwrap();
        let b = MeshBase::spawn(base("local:b"), &ctx, MeshBaseOptions::default()).unwrap();
        let item = b
            .execute(|tx| {
                let id = tx.create_object("item")?;
                tx.set_property(&id, "n", 1i64)?;
                Ok(id)
            })
            .await
            .unwrap();

        let path = AccessPath::to_object(b.id().clone(), item.clone());
        let replica = a.access_locally(&path, None, None).await.unwrap();
        assert_eq!(replica.property("n"), Some(&PropertyValue::Integer(1)));
        assert_eq!(replica.replica.home_proxy, Some(b.id().clone()));
        assert!(!replica.holds_lock());

        // writes at the origin reach the replica
        b.execute(|tx| tx.set_property(&item, "n", 2i64)).await.unwrap();
        for _ in 0..50 {
            if a.get(&item).and_then(|r| r.property("n").cloned()) == Some(PropertyValue::Integer(2)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(
            a.get(&item).unwrap().property("n"),
            Some(&PropertyValue::Integer(2))
        );
    }

    #[tokio::test]
    async fn test_missing_object_fails_access() {
        let ctx = context();
        let a = MeshBase::spawn(base("local:a"), &ctx, MeshBaseOptions::default()).unwrap();
        let _b = MeshBase::spawn(base("local:b"), &ctx, MeshBaseOptions::default()).unwrap();
        let ghost = MeshObjectId::new(base("local:b"), "ghost");
        let result = a
            .access_locally(&AccessPath::to_object(base("local:b"), ghost.clone()), None, None)
            .await;
        assert_eq!(result.unwrap_err(), AccessError::NotFound(ghost));
    }

    #[tokio::test]
    async fn test_detached_until_attached() {
        let network = LocalNetwork::new();
        let ctx = MeshContext::on_network(MeshConfig::default(), Arc::new(MemoryStorage::new()), network.clone())
            .unwrap();
        let options = MeshBaseOptions {
            detached: true,
            ..MeshBaseOptions::default()
        };
        let b = MeshBase::spawn(base("local:b"), &ctx, options).unwrap();
        let item = b.execute(|tx| tx.create_object("item")).await.unwrap();
        assert!(!network.is_attached(b.id()));

        b.attach().await.unwrap();
        assert!(network.is_attached(b.id()));
        assert!(matches!(b.attach().await, Err(MeshBaseError::Transport(_))));

        let a = MeshBase::spawn(base("local:a"), &ctx, MeshBaseOptions::default()).unwrap();
        let path = AccessPath::to_object(b.id().clone(), item.clone());
        assert!(a.access_locally(&path, None, None).await.is_ok());

        b.die().await;
        for _ in 0..50 {
            if !network.is_attached(b.id()) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!network.is_attached(b.id()));
    }

    #[tokio::test]
    async fn test_lock_moves_and_writes_follow() {
        let ctx = context();
        let a = MeshBase::spawn(base("local:a"), &ctx, MeshBaseOptions::default()).unwrap();
        let b = MeshBase::spawn(base("local:b"), &ctx, MeshBaseOptions::default()).unwrap();
        let item = b.execute(|tx| tx.create_object("item")).await.unwrap();
        a.access_locally(&AccessPath::to_object(b.id().clone(), item.clone()), None, None)
            .await
            .unwrap();

        assert_eq!(
            a.execute(|tx| tx.set_property(&item, "k", "v")).await,
            Err(TransactionError::NotLockOwner(item.clone()))
        );
        a.obtain_lock(&[item.clone()], None).await.unwrap();
        assert!(a.get(&item).unwrap().holds_lock());
        assert_eq!(b.get(&item).unwrap().replica.lock_proxy, Some(a.id().clone()));
        a.execute(|tx| tx.set_property(&item, "k", "v")).await.unwrap();
    }

    #[tokio::test]
    async fn test_dead_mesh_base_rejects_calls() {
        let ctx = context();
        let a = MeshBase::spawn(base("local:a"), &ctx, MeshBaseOptions::default()).unwrap();
        assert_eq!(a.shutdown().await, 0);
        let result = a
            .access_locally(&AccessPath::to_home(base("local:b")), None, None)
            .await;
        assert_eq!(result.unwrap_err(), AccessError::MeshBaseDead);
    }
}
