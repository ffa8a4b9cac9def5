//! Transactions
//!
//! All changes to replica content go through a transaction. Local writes
//! require the replica to hold the lock; changes received from a partner are
//! applied as a transaction originating from that partner. Every committed
//! transaction is handed to each proxy of the mesh base, which decides
//! whether to propagate it.

use super::object::{Change, MeshObject, PropertyValue, ReplicaPayload};
use crate::identifier::{MeshBaseId, MeshObjectId};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::debug;

pub type ReplicaMap = BTreeMap<MeshObjectId, MeshObject>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Replica of {0} does not hold the lock")]
    NotLockOwner(MeshObjectId),
    #[error("Unknown object: {0}")]
    UnknownObject(MeshObjectId),
    #[error("Object already exists: {0}")]
    AlreadyExists(MeshObjectId),
    #[error("Mesh base is dead")]
    MeshBaseDead,
    #[error("Transaction aborted: {0}")]
    Aborted(String),
}

/// A transaction under construction. Reads see the committed state.
pub struct Transaction<'a> {
    mesh_base: &'a MeshBaseId,
    replicas: &'a ReplicaMap,
    now: u64,
    created: BTreeSet<MeshObjectId>,
    deleted: BTreeSet<MeshObjectId>,
    changes: Vec<Change>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(mesh_base: &'a MeshBaseId, replicas: &'a ReplicaMap, now: u64) -> Self {
        Self {
            mesh_base,
            replicas,
            now,
            created: BTreeSet::new(),
            deleted: BTreeSet::new(),
            changes: Vec::new(),
        }
    }

    pub fn mesh_base(&self) -> &MeshBaseId {
        self.mesh_base
    }

    pub fn get(&self, id: &MeshObjectId) -> Option<&MeshObject> {
        if self.deleted.contains(id) {
            return None;
        }
        self.replicas.get(id)
    }

    /// Create an object owned by this mesh base
    pub fn create_object(&mut self, local: &str) -> Result<MeshObjectId, TransactionError> {
        let id = MeshObjectId::new(self.mesh_base.clone(), local);
        let exists = self.created.contains(&id)
            || (self.replicas.contains_key(&id) && !self.deleted.contains(&id));
        if exists {
            return Err(TransactionError::AlreadyExists(id));
        }
        self.created.insert(id.clone());
        self.deleted.remove(&id);
        self.changes.push(Change::Created(ReplicaPayload {
            identifier: id.clone(),
            properties: Default::default(),
            time_created: self.now,
            time_updated: self.now,
            time_expires: None,
            lock_epoch: 0,
        }));
        Ok(id)
    }

    pub fn set_property(
        &mut self,
        id: &MeshObjectId,
        name: &str,
        value: impl Into<PropertyValue>,
    ) -> Result<(), TransactionError> {
        self.check_writable(id)?;
        self.changes.push(Change::PropertySet {
            object: id.clone(),
            name: name.to_string(),
            value: Some(value.into()),
            time_updated: self.now,
        });
        Ok(())
    }

    pub fn remove_property(&mut self, id: &MeshObjectId, name: &str) -> Result<(), TransactionError> {
        self.check_writable(id)?;
        self.changes.push(Change::PropertySet {
            object: id.clone(),
            name: name.to_string(),
            value: None,
            time_updated: self.now,
        });
        Ok(())
    }

    pub fn delete_object(&mut self, id: &MeshObjectId) -> Result<(), TransactionError> {
        self.check_writable(id)?;
        self.created.remove(id);
        self.deleted.insert(id.clone());
        self.changes.push(Change::Deleted { object: id.clone() });
        Ok(())
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub(crate) fn into_changes(self) -> Vec<Change> {
        self.changes
    }

    fn check_writable(&self, id: &MeshObjectId) -> Result<(), TransactionError> {
        if self.created.contains(id) {
            return Ok(());
        }
        if self.deleted.contains(id) {
            return Err(TransactionError::UnknownObject(id.clone()));
        }
        match self.replicas.get(id) {
            Some(replica) if replica.holds_lock() => Ok(()),
            Some(_) => Err(TransactionError::NotLockOwner(id.clone())),
            None => Err(TransactionError::UnknownObject(id.clone())),
        }
    }
}

/// A transaction after commit, as proxies see it
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedTransaction {
    /// Partner the changes came from; `None` for local transactions
    pub origin: Option<MeshBaseId>,
    pub changes: Vec<Change>,
    /// Partners each touched object replicates with, taken before deletions
    pub audiences: BTreeMap<MeshObjectId, BTreeSet<MeshBaseId>>,
}

impl CommittedTransaction {
    /// Changes a given partner should hear about
    pub fn changes_for(&self, partner: &MeshBaseId) -> Vec<Change> {
        if self.origin.as_ref() == Some(partner) {
            return Vec::new();
        }
        self.changes
            .iter()
            .filter(|change| {
                self.audiences
                    .get(change.object())
                    .map(|audience| audience.contains(partner))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }
}

/// Re-check a local transaction against the current state before applying
pub fn validate_local(replicas: &ReplicaMap, changes: &[Change]) -> Result<(), TransactionError> {
    let mut created = BTreeSet::new();
    let mut deleted = BTreeSet::new();
    for change in changes {
        let id = change.object();
        match change {
            Change::Created(_) => {
                if replicas.contains_key(id) && !deleted.contains(id) {
                    return Err(TransactionError::AlreadyExists(id.clone()));
                }
                deleted.remove(id);
                created.insert(id.clone());
            }
            Change::PropertySet { .. } | Change::Deleted { .. } => {
                if !created.contains(id) {
                    match replicas.get(id) {
                        Some(replica) if replica.holds_lock() && !deleted.contains(id) => {}
                        Some(replica) if !replica.holds_lock() => {
                            return Err(TransactionError::NotLockOwner(id.clone()))
                        }
                        _ => return Err(TransactionError::UnknownObject(id.clone())),
                    }
                }
                if matches!(change, Change::Deleted { .. }) {
                    created.remove(id);
                    deleted.insert(id.clone());
                }
            }
        }
    }
    Ok(())
}

/// Apply changes and describe the commit. `origin` is the partner the
/// changes came from, if any.
pub fn apply_changes(
    replicas: &mut ReplicaMap,
    changes: Vec<Change>,
    origin: Option<&MeshBaseId>,
    now: u64,
) -> CommittedTransaction {
    let mut audiences = BTreeMap::new();
    let mut applied = Vec::with_capacity(changes.len());

    for change in changes {
        let id = change.object().clone();
        let took_effect = match &change {
            Change::Created(payload) => match (replicas.contains_key(&id), origin) {
                (true, Some(_)) => {
                    if let Some(existing) = replicas.get_mut(&id) {
                        existing.refresh_from(payload, now);
                    }
                    true
                }
                (true, None) => false,
                (false, Some(partner)) => {
                    replicas.insert(id.clone(), MeshObject::from_payload(payload.clone(), partner, now));
                    true
                }
                (false, None) => {
                    let mut object = MeshObject::new(id.clone(), now);
                    object.properties = payload.properties.clone();
                    object.time_created = payload.time_created;
                    replicas.insert(id.clone(), object);
                    true
                }
            },
            Change::PropertySet {
                name,
                value,
                time_updated,
                ..
            } => match replicas.get_mut(&id) {
                Some(replica) => {
                    match value {
                        Some(value) => {
                            replica.properties.insert(name.clone(), value.clone());
                        }
                        None => {
                            replica.properties.remove(name);
                        }
                    }
                    replica.time_updated = *time_updated;
                    true
                }
                None => false,
            },
            Change::Deleted { .. } => {
                if let Some(removed) = replicas.get(&id) {
                    audiences
                        .entry(id.clone())
                        .or_insert_with(BTreeSet::new)
                        .extend(removed.replica.proxies.iter().cloned());
                }
                replicas.remove(&id).is_some()
            }
        };

        if !took_effect {
            debug!("Change to {} had no effect", id);
            continue;
        }
        if let Some(replica) = replicas.get(&id) {
            audiences
                .entry(id.clone())
                .or_insert_with(BTreeSet::new)
                .extend(replica.replica.proxies.iter().cloned());
        }
        applied.push(change);
    }

    CommittedTransaction {
        origin: origin.cloned(),
        changes: applied,
        audiences,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(name: &str) -> MeshBaseId {
        MeshBaseId::new(name).unwrap()
    }

    fn leased(owner: &MeshBaseId, local: &str) -> MeshObject {
        let origin = MeshObject::new(MeshObjectId::new(owner.clone(), local), 1);
        MeshObject::from_payload(origin.to_payload(), owner, 2)
    }

    #[test]
    fn test_create_and_set() {
        let a = base("local:a");
        let replicas = ReplicaMap::new();
        let mut tx = Transaction::new(&a, &replicas, 10);
        let id = tx.create_object("x").unwrap();
        tx.set_property(&id, "title", "hello").unwrap();
        assert_eq!(tx.changes().len(), 2);
        assert_eq!(tx.create_object("x"), Err(TransactionError::AlreadyExists(id)));
    }

    #[test]
    fn test_write_requires_lock() {
        let a = base("local:a");
        let b = base("local:b");
        let mut replicas = ReplicaMap::new();
        let replica = leased(&b, "y");
        let id = replica.identifier.clone();
        replicas.insert(id.clone(), replica);

        let mut tx = Transaction::new(&a, &replicas, 10);
        assert_eq!(
            tx.set_property(&id, "k", 1i64),
            Err(TransactionError::NotLockOwner(id.clone()))
        );
        let missing = MeshObjectId::new(a.clone(), "nope");
        assert_eq!(
            tx.delete_object(&missing),
            Err(TransactionError::UnknownObject(missing))
        );
    }

    #[test]
    fn test_validate_catches_lost_lock() {
        let a = base("local:a");
        let b = base("local:b");
        let mut replicas = ReplicaMap::new();
        let obj = MeshObject::new(MeshObjectId::new(a.clone(), "x"), 1);
        let id = obj.identifier.clone();
        replicas.insert(id.clone(), obj);

        let changes = {
            let mut tx = Transaction::new(&a, &replicas, 5);
            tx.set_property(&id, "k", "v").unwrap();
            tx.into_changes()
        };
        assert!(validate_local(&replicas, &changes).is_ok());

        // lock given away before commit: the second writer must retry
        if let Some(replica) = replicas.get_mut(&id) {
            replica.replica.lock_proxy = Some(b);
        }
        assert_eq!(
            validate_local(&replicas, &changes),
            Err(TransactionError::NotLockOwner(id))
        );
    }

    #[test]
    fn test_apply_tracks_audience_and_origin() {
        let a = base("local:a");
        let b = base("local:b");
        let c = base("local:c");
        let mut replicas = ReplicaMap::new();
        let mut obj = MeshObject::new(MeshObjectId::new(a.clone(), "x"), 1);
        obj.replica.proxies.insert(b.clone());
        obj.replica.proxies.insert(c.clone());
        let id = obj.identifier.clone();
        replicas.insert(id.clone(), obj);

        let committed = apply_changes(
            &mut replicas,
            vec![Change::PropertySet {
                object: id.clone(),
                name: "k".to_string(),
                value: Some(PropertyValue::Integer(3)),
                time_updated: 9,
            }],
            Some(&b),
            10,
        );
        assert_eq!(replicas[&id].property("k"), Some(&PropertyValue::Integer(3)));
        assert!(committed.changes_for(&b).is_empty());
        assert_eq!(committed.changes_for(&c).len(), 1);

        let committed = apply_changes(
            &mut replicas,
            vec![Change::Deleted { object: id.clone() }],
            None,
            11,
        );
        assert!(replicas.is_empty());
        assert_eq!(committed.changes_for(&b).len(), 1);
    }

    #[test]
    fn test_apply_created_from_partner_is_leased() {
        let a = base("local:a");
        let b = base("local:b");
        let mut replicas = ReplicaMap::new();
        let payload = MeshObject::new(MeshObjectId::new(b.clone(), "z"), 1).to_payload();
        let committed = apply_changes(&mut replicas, vec![Change::Created(payload.clone())], Some(&b), 3);
        let replica = &replicas[&payload.identifier];
        assert_eq!(replica.replica.home_proxy, Some(b.clone()));
        assert_eq!(committed.changes.len(), 1);
        assert!(committed.changes_for(&a).is_empty());
    }
}
