// Integration test: a data source that cannot be read
//
// The requester gets a definite failure and drops its proxy toward the
// source instead of retransmitting forever. Once the source is readable
// again, the same requester gets through.

use meshgrid_core::mesh::MeshBase;
use meshgrid_core::probe::MemoryProbe;
use meshgrid_core::{
    AccessError, AccessPath, LocalNetwork, MeshBaseId, MeshBaseOptions, MeshConfig, MeshContext, MeshObjectId,
    MemoryStorage, ProbeDirectory, ProbeError, ProbeManager, ProbeOutput, PropertyValue,
};
use std::sync::Arc;
use std::time::Duration;

fn source() -> MeshBaseId {
    MeshBaseId::new("memory:broken").unwrap()
}

fn setup(probe: Arc<MemoryProbe>) -> (Arc<LocalNetwork>, ProbeManager, MeshBase) {
    let network = LocalNetwork::new();
    let mut probes = ProbeDirectory::new();
    probes.register_id(source(), probe);
    let ctx = MeshContext::on_network(MeshConfig::default(), Arc::new(MemoryStorage::new()), network.clone())
        .unwrap()
        .with_probes(probes);
    let manager = ProbeManager::new(ctx.clone());
    manager.start().unwrap();
    let requester = MeshBase::spawn(MeshBaseId::new("local:requester").unwrap(), &ctx, MeshBaseOptions::default())
        .unwrap();
    (network, manager, requester)
}

#[tokio::test(start_paused = true)]
async fn test_failing_probe_fails_access_without_retries() {
    let probe = Arc::new(MemoryProbe::failing(ProbeError::Io("disk gone".to_string())));
    let (network, manager, requester) = setup(probe.clone());

    let result = requester
        .access_locally(&AccessPath::to_home(source()), None, None)
        .await;
    match result {
        Err(AccessError::ProxyFailed { partner, .. }) => assert_eq!(partner, source()),
        other => panic!("expected a proxy failure, got {:?}", other),
    }
    assert!(manager.shadow(&source()).is_none());

    let sent = network.frames_sent_by(requester.id());
    let reads = probe.reads();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(network.frames_sent_by(requester.id()), sent);
    assert_eq!(probe.reads(), reads);
    assert!(!network.is_attached(&source()));

    let info = requester.proxy_info().await.unwrap();
    assert!(info.iter().all(|p| p.partner != source()));
    manager.die().await;
}

#[tokio::test(start_paused = true)]
async fn test_same_requester_gets_through_after_recovery() {
    let probe = Arc::new(MemoryProbe::failing(ProbeError::Io("disk gone".to_string())));
    let (_network, manager, requester) = setup(probe.clone());
    let path = AccessPath::to_home(source());

    assert!(matches!(
        requester.access_locally(&path, None, None).await,
        Err(AccessError::ProxyFailed { .. })
    ));
    let reads = probe.reads();

    probe.set_output(ProbeOutput::default().object("entry", [("n", PropertyValue::Integer(7))]));
    let home = requester.access_locally(&path, None, None).await.unwrap();
    assert_eq!(home.identifier, MeshObjectId::home(&source()));
    assert_eq!(probe.reads(), reads + 1);
    assert!(manager.shadow(&source()).is_some());

    let info = requester.proxy_info().await.unwrap();
    assert!(info.iter().any(|p| p.partner == source()));
    manager.die().await;
}

#[tokio::test(start_paused = true)]
async fn test_source_recovers_for_a_new_request() {
    let probe = Arc::new(MemoryProbe::failing(ProbeError::Io("disk gone".to_string())));
    let (_network, manager, requester) = setup(probe.clone());

    assert!(requester
        .access_locally(&AccessPath::to_home(source()), None, None)
        .await
        .is_err());
    let schedule = manager.schedule(&source()).unwrap();
    assert!(!schedule.last_run_successful);
    assert_eq!(schedule.probe_run_counter, 1);

    // a new requester triggers a fresh materialization once the source is back
    probe.set_output(ProbeOutput::default().object("entry", [("n", PropertyValue::Integer(1))]));
    let other = MeshBase::spawn(
        MeshBaseId::new("local:other").unwrap(),
        manager.context(),
        MeshBaseOptions::default(),
    )
    .unwrap();
    other
        .access_locally(&AccessPath::to_home(source()), None, None)
        .await
        .unwrap();
    assert!(manager.shadow(&source()).is_some());
    manager.die().await;
}
