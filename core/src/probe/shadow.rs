//! Shadow mesh base
//!
//! A mesh base whose content comes only from probe runs. Each run's output
//! is diffed against the current replicas and committed as one source
//! update, so partners receive an ordinary transaction delta.

use super::adapter::{Probe, ProbeError, ProbeOutput};
use crate::identifier::{MeshBaseId, MeshObjectId};
use crate::listener::ListenerSet;
use crate::mesh::object::{now_millis, Change, Properties, ReplicaPayload};
use crate::mesh::MeshBase;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// Progress of shadow updates
#[cfg_attr(test, mockall::automock)]
pub trait ShadowListener: Send + Sync {
    fn update_starting(&self, shadow: &MeshBaseId);

    /// A run was requested while another one was in progress
    fn update_skipped(&self, shadow: &MeshBaseId);

    fn update_finished_successfully(&self, shadow: &MeshBaseId, changed: bool);

    fn update_finished_unsuccessfully(&self, shadow: &MeshBaseId, error: &ProbeError);
}

pub type ShadowListeners = ListenerSet<dyn ShadowListener>;

pub struct ShadowMeshBase {
    mesh_base: MeshBase,
    probe: Arc<dyn Probe>,
    /// Held for the duration of a probe run
    run_lock: Mutex<()>,
}

impl ShadowMeshBase {
    pub fn new(mesh_base: MeshBase, probe: Arc<dyn Probe>) -> Self {
        Self {
            mesh_base,
            probe,
            run_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &MeshBaseId {
        self.mesh_base.id()
    }

    pub fn mesh_base(&self) -> &MeshBase {
        &self.mesh_base
    }

    pub fn probe(&self) -> &Arc<dyn Probe> {
        &self.probe
    }

    pub fn is_updating(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    pub(crate) fn try_begin_run(&self) -> Option<MutexGuard<'_, ()>> {
        self.run_lock.try_lock().ok()
    }

    pub(crate) async fn begin_run(&self) -> MutexGuard<'_, ()> {
        self.run_lock.lock().await
    }

    /// Changes that turn the current content into `output`
    pub fn diff(&self, output: &ProbeOutput, now: u64) -> Vec<Change> {
        let id = self.id();
        let mut changes = Vec::new();

        let home = MeshObjectId::home(id);
        let current = self
            .mesh_base
            .get(&home)
            .map(|replica| replica.properties)
            .unwrap_or_default();
        diff_properties(&home, &current, &output.home, now, &mut changes);

        let existing: Vec<MeshObjectId> = self
            .mesh_base
            .replica_ids()
            .into_iter()
            .filter(|object| &object.mesh_base == id && !object.is_home_object())
            .collect();

        for (local, properties) in &output.objects {
            let object = MeshObjectId::new(id.clone(), local.clone());
            match self.mesh_base.get(&object) {
                Some(replica) => {
                    diff_properties(&object, &replica.properties, properties, now, &mut changes)
                }
                None => changes.push(Change::Created(ReplicaPayload {
                    identifier: object,
                    properties: properties.clone(),
                    time_created: now,
                    time_updated: now,
                    time_expires: None,
                    lock_epoch: 0,
                })),
            }
        }

        for object in existing {
            if !output.objects.contains_key(&object.local) {
                changes.push(Change::Deleted { object });
            }
        }
        changes
    }

    /// Commit `output` as the new content. Returns whether anything changed.
    pub async fn apply_output(&self, output: &ProbeOutput) -> Result<bool, ProbeError> {
        let changes = self.diff(output, now_millis());
        if changes.is_empty() {
            return Ok(false);
        }
        self.mesh_base
            .commit_from_source(changes)
            .await
            .map_err(|e| ProbeError::Adapter(format!("commit to {} failed: {}", self.id(), e)))?;
        Ok(true)
    }
}

fn diff_properties(
    object: &MeshObjectId,
    current: &Properties,
    wanted: &Properties,
    now: u64,
    changes: &mut Vec<Change>,
) {
    for (name, value) in wanted {
        if current.get(name) != Some(value) {
            changes.push(Change::PropertySet {
                object: object.clone(),
                name: name.clone(),
                value: Some(value.clone()),
                time_updated: now,
            });
        }
    }
    for name in current.keys().filter(|name| !wanted.contains_key(*name)) {
        changes.push(Change::PropertySet {
            object: object.clone(),
            name: name.clone(),
            value: None,
            time_updated: now,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalNetwork;
    use crate::config::MeshConfig;
    use crate::context::MeshContext;
    use crate::mesh::{MeshBaseOptions, PropertyValue};
    use crate::probe::adapter::JsonFileProbe;
    use crate::store::MemoryStorage;

    fn shadow() -> ShadowMeshBase {
        let ctx = MeshContext::new(
            MeshConfig::default(),
            Arc::new(MemoryStorage::new()),
            LocalNetwork::new(),
        )
        .unwrap();
        let id = MeshBaseId::new("file:///tmp/feed.json").unwrap();
        let mesh_base = MeshBase::spawn(id, &ctx, MeshBaseOptions::default()).unwrap();
        ShadowMeshBase::new(mesh_base, Arc::new(JsonFileProbe::new()))
    }

    #[tokio::test]
    async fn test_apply_output_tracks_source() {
        let shadow = shadow();
        let first = JsonFileProbe::parse(
            r#"{"home": {"title": "Feed"}, "objects": {"a": {"n": 1}, "b": {"n": 2}}}"#,
        )
        .unwrap();
        assert!(shadow.apply_output(&first).await.unwrap());
        assert!(!shadow.apply_output(&first).await.unwrap());

        let a = MeshObjectId::new(shadow.id().clone(), "a");
        let b = MeshObjectId::new(shadow.id().clone(), "b");
        assert_eq!(
            shadow.mesh_base().get(&a).unwrap().property("n"),
            Some(&PropertyValue::Integer(1))
        );

        let second =
            JsonFileProbe::parse(r#"{"home": {}, "objects": {"a": {"n": 3, "m": true}}}"#).unwrap();
        assert!(shadow.apply_output(&second).await.unwrap());
        let replica = shadow.mesh_base().get(&a).unwrap();
        assert_eq!(replica.property("n"), Some(&PropertyValue::Integer(3)));
        assert_eq!(replica.property("m"), Some(&PropertyValue::Bool(true)));
        assert!(shadow.mesh_base().get(&b).is_none());
        let home = shadow.mesh_base().get(&MeshObjectId::home(shadow.id())).unwrap();
        assert!(home.property("title").is_none());
    }

    #[tokio::test]
    async fn test_run_lock_reports_update_in_progress() {
        let shadow = shadow();
        assert!(!shadow.is_updating());
        let guard = shadow.begin_run().await;
        assert!(shadow.is_updating());
        assert!(shadow.try_begin_run().is_none());
        drop(guard);
        assert!(shadow.try_begin_run().is_some());
    }

    #[test]
    fn test_listener_mock_receives_events() {
        let id = MeshBaseId::new("file:///tmp/feed.json").unwrap();
        let mut mock = MockShadowListener::new();
        mock.expect_update_starting().times(1).return_const(());
        mock.expect_update_finished_unsuccessfully()
            .withf(|_, error| matches!(error, ProbeError::Io(_)))
            .times(1)
            .return_const(());

        let listeners = ShadowListeners::new();
        listeners.add_direct(Arc::new(mock));
        listeners.fire(|l| l.update_starting(&id));
        listeners.fire(|l| l.update_finished_unsuccessfully(&id, &ProbeError::Io("gone".into())));
    }
}
