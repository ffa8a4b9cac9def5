//! Mesh object replicas
//!
//! Every mesh base holds its own replica of an object. Ownership is tracked
//! per replica by proxy identifiers only: `home_proxy` points toward the
//! authoritative origin and `lock_proxy` toward the current write permission.
//! `None` in either slot means this replica itself holds that role.

use crate::identifier::{MeshBaseId, MeshObjectId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A property value carried by a mesh object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Null => write!(f, "null"),
            PropertyValue::Bool(v) => write!(f, "{}", v),
            PropertyValue::Integer(v) => write!(f, "{}", v),
            PropertyValue::Float(v) => write!(f, "{}", v),
            PropertyValue::Text(v) => write!(f, "{:?}", v),
            PropertyValue::Blob(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Text(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::Text(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Integer(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<serde_json::Value> for PropertyValue {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => PropertyValue::Null,
            serde_json::Value::Bool(b) => PropertyValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => PropertyValue::Integer(i),
                None => PropertyValue::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => PropertyValue::Text(s),
            // Nested structures are kept in their JSON text form
            other => PropertyValue::Text(other.to_string()),
        }
    }
}

pub type Properties = BTreeMap<String, PropertyValue>;

/// Ownership state of one replica
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    /// Proxy toward the home replica; `None` if this replica is home
    pub home_proxy: Option<MeshBaseId>,
    /// Proxy toward the lock holder; `None` if this replica holds the lock
    pub lock_proxy: Option<MeshBaseId>,
    /// Every partner this replica is replicated with
    pub proxies: BTreeSet<MeshBaseId>,
    /// Fencing epoch of the most recent lock transfer
    pub lock_epoch: u64,
}

impl ReplicaInfo {
    /// A replica that is both home and lock holder
    pub fn authoritative() -> Self {
        Self::default()
    }

    /// A replica obtained from `partner`, which remains home and lock holder
    pub fn leased_from(partner: &MeshBaseId, lock_epoch: u64) -> Self {
        let mut proxies = BTreeSet::new();
        proxies.insert(partner.clone());
        Self {
            home_proxy: Some(partner.clone()),
            lock_proxy: Some(partner.clone()),
            proxies,
            lock_epoch,
        }
    }
}

/// A local replica of a mesh object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshObject {
    pub identifier: MeshObjectId,
    pub properties: Properties,
    /// Milliseconds since the Unix epoch
    pub time_created: u64,
    pub time_updated: u64,
    pub time_read: u64,
    /// `None` = never expires
    pub time_expires: Option<u64>,
    pub replica: ReplicaInfo,
}

impl MeshObject {
    /// A new authoritative object
    pub fn new(identifier: MeshObjectId, now: u64) -> Self {
        Self {
            identifier,
            properties: Properties::new(),
            time_created: now,
            time_updated: now,
            time_read: now,
            time_expires: None,
            replica: ReplicaInfo::authoritative(),
        }
    }

    /// A replica built from state conveyed by `sender`
    pub fn from_payload(payload: ReplicaPayload, sender: &MeshBaseId, now: u64) -> Self {
        Self {
            identifier: payload.identifier,
            properties: payload.properties,
            time_created: payload.time_created,
            time_updated: payload.time_updated,
            time_read: now,
            time_expires: payload.time_expires,
            replica: ReplicaInfo::leased_from(sender, payload.lock_epoch),
        }
    }

    pub fn is_home_replica(&self) -> bool {
        self.replica.home_proxy.is_none()
    }

    pub fn holds_lock(&self) -> bool {
        self.replica.lock_proxy.is_none()
    }

    /// Whether this replica is replicated with `partner`
    pub fn replicates_with(&self, partner: &MeshBaseId) -> bool {
        self.replica.proxies.contains(partner)
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    /// State to convey to a partner
    pub fn to_payload(&self) -> ReplicaPayload {
        ReplicaPayload {
            identifier: self.identifier.clone(),
            properties: self.properties.clone(),
            time_created: self.time_created,
            time_updated: self.time_updated,
            time_expires: self.time_expires,
            lock_epoch: self.replica.lock_epoch,
        }
    }

    /// Overwrite content with conveyed state, keeping ownership information
    pub fn refresh_from(&mut self, payload: &ReplicaPayload, now: u64) {
        self.properties = payload.properties.clone();
        self.time_updated = payload.time_updated;
        self.time_expires = payload.time_expires;
        self.time_read = now;
        self.replica.lock_epoch = self.replica.lock_epoch.max(payload.lock_epoch);
    }
}

/// Replica state as it travels between mesh bases
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaPayload {
    pub identifier: MeshObjectId,
    pub properties: Properties,
    pub time_created: u64,
    pub time_updated: u64,
    pub time_expires: Option<u64>,
    pub lock_epoch: u64,
}

/// One change recorded by a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    Created(ReplicaPayload),
    PropertySet {
        object: MeshObjectId,
        name: String,
        /// `None` removes the property
        value: Option<PropertyValue>,
        time_updated: u64,
    },
    Deleted {
        object: MeshObjectId,
    },
}

impl Change {
    /// The object this change affects
    pub fn object(&self) -> &MeshObjectId {
        match self {
            Change::Created(payload) => &payload.identifier,
            Change::PropertySet { object, .. } => object,
            Change::Deleted { object } => object,
        }
    }
}

/// Current time in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(name: &str) -> MeshBaseId {
        MeshBaseId::new(name).unwrap()
    }

    #[test]
    fn test_new_object_is_authoritative() {
        let obj = MeshObject::new(MeshObjectId::new(base("local:a"), "x"), 10);
        assert!(obj.is_home_replica());
        assert!(obj.holds_lock());
        assert!(obj.replica.proxies.is_empty());
    }

    #[test]
    fn test_replica_from_payload_points_to_sender() {
        let mut origin = MeshObject::new(MeshObjectId::new(base("local:a"), "x"), 10);
        origin
            .properties
            .insert("title".to_string(), PropertyValue::from("hello"));
        origin.replica.lock_epoch = 3;

        let sender = base("local:a");
        let replica = MeshObject::from_payload(origin.to_payload(), &sender, 20);
        assert!(!replica.is_home_replica());
        assert!(!replica.holds_lock());
        assert!(replica.replicates_with(&sender));
        assert_eq!(replica.replica.lock_epoch, 3);
        assert_eq!(replica.time_read, 20);
        assert_eq!(replica.property("title"), Some(&PropertyValue::from("hello")));
    }

    #[test]
    fn test_property_value_from_json() {
        assert_eq!(
            PropertyValue::from(serde_json::json!(42)),
            PropertyValue::Integer(42)
        );
        assert_eq!(
            PropertyValue::from(serde_json::json!(1.5)),
            PropertyValue::Float(1.5)
        );
        assert_eq!(
            PropertyValue::from(serde_json::json!([1, 2])),
            PropertyValue::Text("[1,2]".to_string())
        );
    }

    #[test]
    fn test_refresh_keeps_ownership() {
        let sender = base("local:a");
        let mut replica = MeshObject::from_payload(
            MeshObject::new(MeshObjectId::new(sender.clone(), "x"), 1).to_payload(),
            &sender,
            2,
        );
        let mut newer = MeshObject::new(MeshObjectId::new(sender.clone(), "x"), 1);
        newer.time_updated = 50;
        newer
            .properties
            .insert("n".to_string(), PropertyValue::Integer(7));
        replica.refresh_from(&newer.to_payload(), 60);
        assert_eq!(replica.time_updated, 50);
        assert_eq!(replica.replica.home_proxy, Some(sender));
        assert_eq!(replica.property("n"), Some(&PropertyValue::Integer(7)));
    }
}
