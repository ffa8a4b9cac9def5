// Persisted form of a proxy

use crate::comm::ExternalizedEndpoint;
use crate::identifier::MeshBaseId;
use crate::probe::coherence::CoherenceSpecification;
use crate::store::{get_record, put_record, scan_records, StorageBackend, StoreError};
use serde::{Deserialize, Serialize};

pub const PROXY_PREFIX: &str = "proxy_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalizedProxy {
    pub own: MeshBaseId,
    pub partner: MeshBaseId,
    /// Policy name, resolved through the policy registry on restore
    pub policy: String,
    pub time_created: u64,
    pub time_updated: u64,
    pub time_read: u64,
    pub time_expires: Option<u64>,
    /// Freshness requested from the partner, if any
    pub coherence: Option<CoherenceSpecification>,
    pub endpoint: ExternalizedEndpoint,
}

impl ExternalizedProxy {
    pub fn storage_key(own: &MeshBaseId, partner: &MeshBaseId) -> String {
        format!("{}{}_{}", PROXY_PREFIX, own.storage_key(), partner.storage_key())
    }

    fn own_prefix(own: &MeshBaseId) -> String {
        format!("{}{}_", PROXY_PREFIX, own.storage_key())
    }

    pub fn save(&self, store: &dyn StorageBackend) -> Result<(), StoreError> {
        put_record(store, &Self::storage_key(&self.own, &self.partner), self)
    }

    pub fn load(
        store: &dyn StorageBackend,
        own: &MeshBaseId,
        partner: &MeshBaseId,
    ) -> Result<Option<Self>, StoreError> {
        get_record(store, &Self::storage_key(own, partner))
    }

    /// Every proxy persisted by the mesh base `own`
    pub fn load_all_for(store: &dyn StorageBackend, own: &MeshBaseId) -> Result<Vec<Self>, StoreError> {
        Ok(scan_records(store, &Self::own_prefix(own))?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    pub fn load_all(store: &dyn StorageBackend) -> Result<Vec<Self>, StoreError> {
        Ok(scan_records(store, PROXY_PREFIX)?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    pub fn delete(store: &dyn StorageBackend, own: &MeshBaseId, partner: &MeshBaseId) -> Result<(), StoreError> {
        store.remove(Self::storage_key(own, partner).as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStorage;

    fn record(own: &str, partner: &str) -> ExternalizedProxy {
        ExternalizedProxy {
            own: MeshBaseId::new(own).unwrap(),
            partner: MeshBaseId::new(partner).unwrap(),
            policy: "nice-and-trusting".to_string(),
            time_created: 1,
            time_updated: 2,
            time_read: 3,
            time_expires: None,
            coherence: Some(CoherenceSpecification::periodic(3000)),
            endpoint: ExternalizedEndpoint {
                last_sent_token: 4,
                last_received_token: 7,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_save_load_delete() {
        let store = MemoryStorage::new();
        let a = record("local:a", "local:b");
        a.save(&store).unwrap();

        let loaded = ExternalizedProxy::load(&store, &a.own, &a.partner)
            .unwrap()
            .unwrap();
        assert_eq!(loaded, a);

        ExternalizedProxy::delete(&store, &a.own, &a.partner).unwrap();
        assert!(ExternalizedProxy::load(&store, &a.own, &a.partner)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_load_all_for_scopes_by_owner() {
        let store = MemoryStorage::new();
        record("local:a", "local:b").save(&store).unwrap();
        record("local:a", "local:c").save(&store).unwrap();
        // "local:ab" must not match the "local:a" prefix
        record("local:ab", "local:c").save(&store).unwrap();

        let own = MeshBaseId::new("local:a").unwrap();
        assert_eq!(ExternalizedProxy::load_all_for(&store, &own).unwrap().len(), 2);
        assert_eq!(ExternalizedProxy::load_all(&store).unwrap().len(), 3);
    }
}
