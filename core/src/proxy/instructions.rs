//! Proxy processing instructions
//!
//! What a policy decides for one request or one incoming message: local
//! side effects to perform now plus operations to append to the outgoing
//! batch. Instructions are never persisted.

use crate::identifier::{MeshBaseId, MeshObjectId};
use crate::mesh::object::{Change, ReplicaPayload};
use crate::mesh::synchronizer::{Completion, PendingKey};
use crate::message::Operation;
use crate::probe::coherence::CoherenceSpecification;
use std::collections::BTreeMap;

/// A local side effect, applied by the mesh base that owns the proxy
#[derive(Debug, Clone, PartialEq)]
pub enum LocalEffect {
    /// Create or refresh replicas conveyed by the partner
    AcceptReplicas(Vec<ReplicaPayload>),
    /// The partner now replicates these objects too
    AddPartner(Vec<MeshObjectId>),
    /// The partner no longer replicates these objects
    RemovePartner(Vec<MeshObjectId>),
    RemoveReplicas(Vec<MeshObjectId>),
    /// Lock moves to the partner
    GiveLock { object: MeshObjectId, epoch: u64 },
    /// Lock moves here
    TakeLock { object: MeshObjectId, epoch: u64 },
    GiveHome(MeshObjectId),
    TakeHome(MeshObjectId),
    /// Changes committed by the partner
    ApplyChanges(Vec<Change>),
    /// Re-read the data source, then convey these objects to the partner
    Refresh(Vec<MeshObjectId>),
    /// The partner wants the data kept this fresh
    AdoptCoherence(CoherenceSpecification),
    Complete { key: PendingKey, result: Completion },
    /// Fail everything waiting on the partner
    FailPending(String),
    /// Objects the partner could not resynchronize
    ResynchronizeFailed {
        objects: Vec<MeshObjectId>,
        reason: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProxyProcessingInstructions {
    pub effects: Vec<LocalEffect>,
    pub outgoing: Vec<Operation>,
}

impl ProxyProcessingInstructions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn effect(&mut self, effect: LocalEffect) -> &mut Self {
        self.effects.push(effect);
        self
    }

    pub fn complete(&mut self, key: PendingKey, result: Completion) -> &mut Self {
        self.effect(LocalEffect::Complete { key, result })
    }

    /// Append an operation; empty operation lists are dropped
    pub fn send(&mut self, operation: Operation) -> &mut Self {
        if !operation_is_empty(&operation) {
            self.outgoing.push(operation);
        }
        self
    }

    pub fn merge(&mut self, other: ProxyProcessingInstructions) {
        self.effects.extend(other.effects);
        self.outgoing.extend(other.outgoing);
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty() && self.outgoing.is_empty()
    }

    /// `None` when there is nothing to do
    pub fn into_option(self) -> Option<Self> {
        if self.is_empty() {
            None
        } else {
            Some(self)
        }
    }
}

fn operation_is_empty(operation: &Operation) -> bool {
    match operation {
        Operation::ObtainReplicas { paths, .. } => paths.is_empty(),
        Operation::PushLock(t) | Operation::PushHome(t) | Operation::ForceObtainLock(t) => {
            t.is_empty()
        }
        Operation::CancelLease(ids)
        | Operation::Resynchronize(ids)
        | Operation::Freshen(ids)
        | Operation::RequestLock(ids)
        | Operation::RequestHome(ids)
        | Operation::Missing(ids) => ids.is_empty(),
        Operation::TransactionDelta(changes) => changes.is_empty(),
        Operation::ConveyReplicas(payloads) => payloads.is_empty(),
        Operation::Denied { objects, .. } => objects.is_empty(),
    }
}

/// Object ids bound for one proxy in one cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResynchronizeInstructions {
    pub proxy: MeshBaseId,
    pub objects: Vec<MeshObjectId>,
}

/// Group `(proxy, object)` pairs into one batch per proxy, keeping order
pub fn group_by_proxy(
    items: impl IntoIterator<Item = (MeshBaseId, MeshObjectId)>,
) -> Vec<ResynchronizeInstructions> {
    let mut grouped: BTreeMap<MeshBaseId, Vec<MeshObjectId>> = BTreeMap::new();
    for (proxy, object) in items {
        let objects = grouped.entry(proxy).or_default();
        if !objects.contains(&object) {
            objects.push(object);
        }
    }
    grouped
        .into_iter()
        .map(|(proxy, objects)| ResynchronizeInstructions { proxy, objects })
        .collect()
}
