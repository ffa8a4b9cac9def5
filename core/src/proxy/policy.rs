//! Proxy policies
//!
//! A policy turns a request or an incoming message into
//! [`ProxyProcessingInstructions`]; `None` means nothing to do. Policies are
//! stateless and looked up by name in a [`PolicyRegistry`].
//!
//! Lock transfers carry a fencing epoch. A forced acquisition takes the
//! lock at `epoch + 1`; a replica that holds the lock yields to a force only
//! if `(incoming epoch, sender)` orders above `(own epoch, own id)`,
//! otherwise it re-asserts its own claim so the other side yields.

use super::instructions::{LocalEffect, ProxyProcessingInstructions};
use crate::identifier::{AccessPath, MeshBaseId, MeshObjectId};
use crate::mesh::synchronizer::{AccessError, PendingKey};
use crate::mesh::transaction::{CommittedTransaction, ReplicaMap};
use crate::message::{Operation, OwnershipTransfer};
use crate::probe::coherence::CoherenceSpecification;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

type Instructions = ProxyProcessingInstructions;

/// What a policy sees when deciding
pub struct PolicyContext<'a> {
    pub own: &'a MeshBaseId,
    pub partner: &'a MeshBaseId,
    pub replicas: &'a ReplicaMap,
    /// The mesh base can accept writes on behalf of its data source
    pub writable: bool,
}

pub trait ProxyPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn obtain_replicas(
        &self,
        ctx: &PolicyContext<'_>,
        paths: &[AccessPath],
        coherence: Option<&CoherenceSpecification>,
    ) -> Option<Instructions>;

    fn try_obtain_locks(&self, ctx: &PolicyContext<'_>, objects: &[MeshObjectId]) -> Option<Instructions>;

    fn try_push_locks(&self, ctx: &PolicyContext<'_>, objects: &[MeshObjectId]) -> Option<Instructions>;

    fn try_obtain_home_replicas(
        &self,
        ctx: &PolicyContext<'_>,
        objects: &[MeshObjectId],
    ) -> Option<Instructions>;

    fn try_push_home_replicas(
        &self,
        ctx: &PolicyContext<'_>,
        objects: &[MeshObjectId],
    ) -> Option<Instructions>;

    fn force_obtain_locks(&self, ctx: &PolicyContext<'_>, objects: &[MeshObjectId]) -> Option<Instructions>;

    fn try_resynchronize_replicas(
        &self,
        ctx: &PolicyContext<'_>,
        objects: &[MeshObjectId],
    ) -> Option<Instructions>;

    fn cancel_replicas(&self, ctx: &PolicyContext<'_>, objects: &[MeshObjectId]) -> Option<Instructions>;

    fn freshen(&self, ctx: &PolicyContext<'_>, objects: &[MeshObjectId]) -> Option<Instructions>;

    fn transaction_committed(
        &self,
        ctx: &PolicyContext<'_>,
        transaction: &CommittedTransaction,
    ) -> Option<Instructions>;

    fn incoming_operations(&self, ctx: &PolicyContext<'_>, operations: Vec<Operation>) -> Option<Instructions>;

    /// The proxy is going away; `permanent` means the relationship ends
    fn dying(&self, ctx: &PolicyContext<'_>, permanent: bool) -> Option<Instructions>;
}

// ============================================================================
// NICE AND TRUSTING
// ============================================================================

/// Grants every request and merges incoming data without validation
#[derive(Debug, Default, Clone, Copy)]
pub struct NiceAndTrustingPolicy;

impl NiceAndTrustingPolicy {
    /// Handle one incoming operation
    pub fn incoming_operation(
        &self,
        ctx: &PolicyContext<'_>,
        operation: Operation,
        out: &mut Instructions,
    ) {
        match operation {
            Operation::ObtainReplicas { paths, coherence } => {
                let targets: Vec<MeshObjectId> = paths.iter().map(AccessPath::target).collect();
                convey_or_missing(ctx, &targets, true, out);
                if let Some(coherence) = coherence {
                    out.effect(LocalEffect::AdoptCoherence(coherence));
                }
            }
            Operation::ConveyReplicas(payloads) => {
                let ids: Vec<MeshObjectId> =
                    payloads.iter().map(|p| p.identifier.clone()).collect();
                out.effect(LocalEffect::AcceptReplicas(payloads));
                for id in ids {
                    out.complete(PendingKey::Replica(id.clone()), Ok(()));
                    out.complete(PendingKey::Resync(id), Ok(()));
                }
            }
            Operation::Missing(ids) => {
                for id in &ids {
                    out.complete(
                        PendingKey::Replica(id.clone()),
                        Err(AccessError::NotFound(id.clone())),
                    );
                }
                out.effect(LocalEffect::ResynchronizeFailed {
                    objects: ids,
                    reason: format!("unknown at {}", ctx.partner),
                });
            }
            Operation::RequestLock(ids) => self.grant_locks(ctx, &ids, out),
            Operation::PushLock(transfers) => {
                for transfer in transfers {
                    if !ctx.replicas.contains_key(&transfer.object) {
                        debug!("Lock pushed for unknown {}", transfer.object);
                        continue;
                    }
                    out.effect(LocalEffect::TakeLock {
                        object: transfer.object.clone(),
                        epoch: transfer.epoch,
                    });
                    out.complete(PendingKey::Lock(transfer.object), Ok(()));
                }
            }
            Operation::ForceObtainLock(transfers) => {
                let mut reassert = Vec::new();
                for transfer in transfers {
                    let Some(replica) = ctx.replicas.get(&transfer.object) else {
                        continue;
                    };
                    if replica.holds_lock() {
                        let incoming = (transfer.epoch, ctx.partner);
                        let ours = (replica.replica.lock_epoch, ctx.own);
                        if incoming > ours {
                            debug!(
                                "Yielding lock on {} to {} at epoch {}",
                                transfer.object, ctx.partner, transfer.epoch
                            );
                            out.effect(LocalEffect::GiveLock {
                                object: transfer.object.clone(),
                                epoch: transfer.epoch,
                            });
                            out.complete(
                                PendingKey::Lock(transfer.object),
                                Err(AccessError::Denied(format!("lock forced by {}", ctx.partner))),
                            );
                        } else {
                            debug!(
                                "Keeping lock on {} at epoch {} against {}",
                                transfer.object, replica.replica.lock_epoch, ctx.partner
                            );
                            reassert.push(OwnershipTransfer {
                                object: transfer.object,
                                is_new_proxy: false,
                                epoch: replica.replica.lock_epoch,
                            });
                        }
                    } else {
                        out.effect(LocalEffect::GiveLock {
                            object: transfer.object.clone(),
                            epoch: transfer.epoch.max(replica.replica.lock_epoch),
                        });
                        out.complete(
                            PendingKey::Lock(transfer.object),
                            Err(AccessError::Denied(format!("lock forced by {}", ctx.partner))),
                        );
                    }
                }
                out.send(Operation::ForceObtainLock(reassert));
            }
            Operation::PushHome(transfers) => {
                for transfer in transfers {
                    if !ctx.replicas.contains_key(&transfer.object) {
                        debug!("Home pushed for unknown {}", transfer.object);
                        continue;
                    }
                    out.effect(LocalEffect::TakeHome(transfer.object.clone()));
                    out.complete(PendingKey::Home(transfer.object), Ok(()));
                }
            }
            Operation::RequestHome(ids) => self.grant_home(ctx, &ids, out),
            Operation::CancelLease(ids) => {
                out.effect(LocalEffect::RemovePartner(ids));
            }
            Operation::Resynchronize(ids) | Operation::Freshen(ids) => {
                convey_or_missing(ctx, &ids, false, out);
            }
            Operation::TransactionDelta(changes) => {
                out.effect(LocalEffect::ApplyChanges(changes));
            }
            Operation::Denied { objects, reason } => {
                for id in objects {
                    out.complete(PendingKey::Lock(id.clone()), Err(AccessError::Denied(reason.clone())));
                    out.complete(PendingKey::Home(id), Err(AccessError::Denied(reason.clone())));
                }
            }
        }
    }

    fn grant_locks(&self, ctx: &PolicyContext<'_>, ids: &[MeshObjectId], out: &mut Instructions) {
        let mut denied = Vec::new();
        let mut conveyed = Vec::new();
        let mut transfers = Vec::new();
        for id in ids {
            match ctx.replicas.get(id) {
                Some(replica) if replica.holds_lock() => {
                    let epoch = replica.replica.lock_epoch + 1;
                    let is_new_proxy = !replica.replicates_with(ctx.partner);
                    if is_new_proxy {
                        let mut payload = replica.to_payload();
                        payload.lock_epoch = epoch;
                        conveyed.push(payload);
                    }
                    out.effect(LocalEffect::GiveLock {
                        object: id.clone(),
                        epoch,
                    });
                    transfers.push(OwnershipTransfer {
                        object: id.clone(),
                        is_new_proxy,
                        epoch,
                    });
                }
                _ => denied.push(id.clone()),
            }
        }
        out.send(Operation::ConveyReplicas(conveyed));
        out.send(Operation::PushLock(transfers));
        out.send(Operation::Denied {
            objects: denied,
            reason: format!("{} does not hold the lock", ctx.own),
        });
    }

    fn grant_home(&self, ctx: &PolicyContext<'_>, ids: &[MeshObjectId], out: &mut Instructions) {
        let mut denied = Vec::new();
        let mut conveyed = Vec::new();
        let mut transfers = Vec::new();
        for id in ids {
            match ctx.replicas.get(id) {
                Some(replica) if replica.is_home_replica() => {
                    let is_new_proxy = !replica.replicates_with(ctx.partner);
                    if is_new_proxy {
                        conveyed.push(replica.to_payload());
                    }
                    out.effect(LocalEffect::GiveHome(id.clone()));
                    transfers.push(OwnershipTransfer {
                        object: id.clone(),
                        is_new_proxy,
                        epoch: replica.replica.lock_epoch,
                    });
                }
                _ => denied.push(id.clone()),
            }
        }
        out.send(Operation::ConveyReplicas(conveyed));
        out.send(Operation::PushHome(transfers));
        out.send(Operation::Denied {
            objects: denied,
            reason: format!("{} is not the home replica", ctx.own),
        });
    }
}

/// Convey the replicas we have, report the rest as missing
fn convey_or_missing(
    ctx: &PolicyContext<'_>,
    ids: &[MeshObjectId],
    add_partner: bool,
    out: &mut Instructions,
) {
    let mut payloads = Vec::new();
    let mut missing = Vec::new();
    let mut served = Vec::new();
    for id in ids {
        match ctx.replicas.get(id) {
            Some(replica) => {
                payloads.push(replica.to_payload());
                served.push(id.clone());
            }
            None => missing.push(id.clone()),
        }
    }
    if add_partner && !served.is_empty() {
        out.effect(LocalEffect::AddPartner(served));
    }
    out.send(Operation::ConveyReplicas(payloads));
    out.send(Operation::Missing(missing));
}

impl ProxyPolicy for NiceAndTrustingPolicy {
    fn name(&self) -> &'static str {
        "nice-and-trusting"
    }

    fn obtain_replicas(
        &self,
        _ctx: &PolicyContext<'_>,
        paths: &[AccessPath],
        coherence: Option<&CoherenceSpecification>,
    ) -> Option<Instructions> {
        let mut out = Instructions::new();
        out.send(Operation::ObtainReplicas {
            paths: paths.to_vec(),
            coherence: coherence.cloned(),
        });
        out.into_option()
    }

    fn try_obtain_locks(&self, ctx: &PolicyContext<'_>, objects: &[MeshObjectId]) -> Option<Instructions> {
        let mut out = Instructions::new();
        let mut requested = Vec::new();
        for id in objects {
            match ctx.replicas.get(id) {
                None => {
                    out.complete(PendingKey::Lock(id.clone()), Err(AccessError::NotFound(id.clone())));
                }
                Some(replica) if replica.holds_lock() => {
                    out.complete(PendingKey::Lock(id.clone()), Ok(()));
                }
                Some(_) => requested.push(id.clone()),
            }
        }
        out.send(Operation::RequestLock(requested));
        out.into_option()
    }

    fn try_push_locks(&self, ctx: &PolicyContext<'_>, objects: &[MeshObjectId]) -> Option<Instructions> {
        let mut out = Instructions::new();
        self.grant_locks(ctx, objects, &mut out);
        // nobody asked, so nothing to deny
        out.outgoing
            .retain(|op| !matches!(op, Operation::Denied { .. }));
        out.into_option()
    }

    fn try_obtain_home_replicas(
        &self,
        ctx: &PolicyContext<'_>,
        objects: &[MeshObjectId],
    ) -> Option<Instructions> {
        let mut out = Instructions::new();
        let mut requested = Vec::new();
        for id in objects {
            match ctx.replicas.get(id) {
                None => {
                    out.complete(PendingKey::Home(id.clone()), Err(AccessError::NotFound(id.clone())));
                }
                Some(replica) if replica.is_home_replica() => {
                    out.complete(PendingKey::Home(id.clone()), Ok(()));
                }
                Some(_) => requested.push(id.clone()),
            }
        }
        out.send(Operation::RequestHome(requested));
        out.into_option()
    }

    fn try_push_home_replicas(
        &self,
        ctx: &PolicyContext<'_>,
        objects: &[MeshObjectId],
    ) -> Option<Instructions> {
        let mut out = Instructions::new();
        self.grant_home(ctx, objects, &mut out);
        out.outgoing
            .retain(|op| !matches!(op, Operation::Denied { .. }));
        out.into_option()
    }

    fn force_obtain_locks(&self, ctx: &PolicyContext<'_>, objects: &[MeshObjectId]) -> Option<Instructions> {
        let mut out = Instructions::new();
        let mut transfers = Vec::new();
        for id in objects {
            let Some(replica) = ctx.replicas.get(id) else {
                out.complete(PendingKey::Lock(id.clone()), Err(AccessError::NotFound(id.clone())));
                continue;
            };
            if !replica.holds_lock() {
                let epoch = replica.replica.lock_epoch + 1;
                out.effect(LocalEffect::TakeLock {
                    object: id.clone(),
                    epoch,
                });
                transfers.push(OwnershipTransfer {
                    object: id.clone(),
                    is_new_proxy: false,
                    epoch,
                });
            }
            out.complete(PendingKey::Lock(id.clone()), Ok(()));
        }
        out.send(Operation::ForceObtainLock(transfers));
        out.into_option()
    }

    fn try_resynchronize_replicas(
        &self,
        _ctx: &PolicyContext<'_>,
        objects: &[MeshObjectId],
    ) -> Option<Instructions> {
        let mut out = Instructions::new();
        out.send(Operation::Resynchronize(objects.to_vec()));
        out.into_option()
    }

    fn cancel_replicas(&self, _ctx: &PolicyContext<'_>, objects: &[MeshObjectId]) -> Option<Instructions> {
        let mut out = Instructions::new();
        if !objects.is_empty() {
            out.effect(LocalEffect::RemoveReplicas(objects.to_vec()));
        }
        out.send(Operation::CancelLease(objects.to_vec()));
        out.into_option()
    }

    fn freshen(&self, _ctx: &PolicyContext<'_>, objects: &[MeshObjectId]) -> Option<Instructions> {
        let mut out = Instructions::new();
        out.send(Operation::Freshen(objects.to_vec()));
        out.into_option()
    }

    fn transaction_committed(
        &self,
        ctx: &PolicyContext<'_>,
        transaction: &CommittedTransaction,
    ) -> Option<Instructions> {
        let mut out = Instructions::new();
        out.send(Operation::TransactionDelta(transaction.changes_for(ctx.partner)));
        out.into_option()
    }

    fn incoming_operations(&self, ctx: &PolicyContext<'_>, operations: Vec<Operation>) -> Option<Instructions> {
        let mut out = Instructions::new();
        for operation in operations {
            self.incoming_operation(ctx, operation, &mut out);
        }
        out.into_option()
    }

    fn dying(&self, ctx: &PolicyContext<'_>, permanent: bool) -> Option<Instructions> {
        if !permanent {
            return None;
        }
        let shared: Vec<MeshObjectId> = ctx
            .replicas
            .values()
            .filter(|r| r.replicates_with(ctx.partner))
            .map(|r| r.identifier.clone())
            .collect();
        let mut out = Instructions::new();
        if !shared.is_empty() {
            out.effect(LocalEffect::RemovePartner(shared.clone()));
        }
        out.send(Operation::CancelLease(shared));
        out.into_option()
    }
}

// ============================================================================
// SHADOW
// ============================================================================

/// Policy of shadow mesh bases. A shadow never initiates requests, keeps
/// home status, grants the lock only when its data source is writable and
/// re-reads its source when asked to freshen.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShadowPolicy {
    inner: NiceAndTrustingPolicy,
}

impl ShadowPolicy {
    fn refuse(objects: &[MeshObjectId], key: fn(MeshObjectId) -> PendingKey, what: &str) -> Option<Instructions> {
        let mut out = Instructions::new();
        for id in objects {
            out.complete(
                key(id.clone()),
                Err(AccessError::Denied(format!("shadows do not request {}", what))),
            );
        }
        out.into_option()
    }
}

impl ProxyPolicy for ShadowPolicy {
    fn name(&self) -> &'static str {
        "shadow"
    }

    fn obtain_replicas(
        &self,
        _ctx: &PolicyContext<'_>,
        paths: &[AccessPath],
        _coherence: Option<&CoherenceSpecification>,
    ) -> Option<Instructions> {
        let targets: Vec<MeshObjectId> = paths.iter().map(AccessPath::target).collect();
        Self::refuse(&targets, PendingKey::Replica, "replicas")
    }

    fn try_obtain_locks(&self, _ctx: &PolicyContext<'_>, objects: &[MeshObjectId]) -> Option<Instructions> {
        Self::refuse(objects, PendingKey::Lock, "locks")
    }

    fn try_push_locks(&self, ctx: &PolicyContext<'_>, objects: &[MeshObjectId]) -> Option<Instructions> {
        self.inner.try_push_locks(ctx, objects)
    }

    fn try_obtain_home_replicas(
        &self,
        _ctx: &PolicyContext<'_>,
        objects: &[MeshObjectId],
    ) -> Option<Instructions> {
        Self::refuse(objects, PendingKey::Home, "home replicas")
    }

    fn try_push_home_replicas(
        &self,
        _ctx: &PolicyContext<'_>,
        objects: &[MeshObjectId],
    ) -> Option<Instructions> {
        debug!("Shadow keeps home status of {} objects", objects.len());
        None
    }

    fn force_obtain_locks(&self, ctx: &PolicyContext<'_>, objects: &[MeshObjectId]) -> Option<Instructions> {
        self.inner.force_obtain_locks(ctx, objects)
    }

    fn try_resynchronize_replicas(
        &self,
        _ctx: &PolicyContext<'_>,
        objects: &[MeshObjectId],
    ) -> Option<Instructions> {
        Self::refuse(objects, PendingKey::Resync, "resynchronization")
    }

    fn cancel_replicas(&self, ctx: &PolicyContext<'_>, objects: &[MeshObjectId]) -> Option<Instructions> {
        self.inner.cancel_replicas(ctx, objects)
    }

    fn freshen(&self, _ctx: &PolicyContext<'_>, objects: &[MeshObjectId]) -> Option<Instructions> {
        Self::refuse(objects, PendingKey::Resync, "freshening")
    }

    fn transaction_committed(
        &self,
        ctx: &PolicyContext<'_>,
        transaction: &CommittedTransaction,
    ) -> Option<Instructions> {
        self.inner.transaction_committed(ctx, transaction)
    }

    fn incoming_operations(&self, ctx: &PolicyContext<'_>, operations: Vec<Operation>) -> Option<Instructions> {
        let mut out = Instructions::new();
        for operation in operations {
            match operation {
                Operation::RequestHome(ids) => {
                    out.send(Operation::Denied {
                        objects: ids,
                        reason: format!("shadow {} keeps home status", ctx.own),
                    });
                }
                Operation::PushHome(transfers) => {
                    debug!(
                        "Shadow {} ignores {} home transfers from {}",
                        ctx.own,
                        transfers.len(),
                        ctx.partner
                    );
                }
                Operation::RequestLock(ids) if !ctx.writable => {
                    out.send(Operation::Denied {
                        objects: ids,
                        reason: format!("data source of {} is read-only", ctx.own),
                    });
                }
                Operation::Freshen(ids) => {
                    out.effect(LocalEffect::Refresh(ids));
                }
                other => self.inner.incoming_operation(ctx, other, &mut out),
            }
        }
        out.into_option()
    }

    fn dying(&self, ctx: &PolicyContext<'_>, permanent: bool) -> Option<Instructions> {
        self.inner.dying(ctx, permanent)
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

type PolicyConstructor = fn() -> Arc<dyn ProxyPolicy>;

/// Static name → constructor table
#[derive(Clone)]
pub struct PolicyRegistry {
    entries: BTreeMap<&'static str, PolicyConstructor>,
}

impl PolicyRegistry {
    pub fn builtin() -> Self {
        let mut entries: BTreeMap<&'static str, PolicyConstructor> = BTreeMap::new();
        entries.insert("nice-and-trusting", || Arc::new(NiceAndTrustingPolicy));
        entries.insert("shadow", || Arc::new(ShadowPolicy::default()));
        Self { entries }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn create(&self, name: &str) -> Option<Arc<dyn ProxyPolicy>> {
        self.entries.get(name).map(|constructor| constructor())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.keys().copied().collect()
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
