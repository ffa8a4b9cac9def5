// Integration test: replication between mesh bases on one in-process network
//
// Covers first-time replication, delta propagation, lock negotiation,
// concurrent forced locks, loss recovery through retransmission and shadows
// reached through the data-source resolver.

use meshgrid_core::mesh::MeshBase;
use meshgrid_core::probe::MemoryProbe;
use meshgrid_core::{
    AccessPath, LocalNetwork, MeshBaseId, MeshBaseOptions, MeshConfig, MeshContext, MeshObjectId,
    MemoryStorage, ProbeDirectory, ProbeManager, ProbeOutput, PropertyValue,
};
use std::sync::Arc;
use std::time::Duration;

fn id(name: &str) -> MeshBaseId {
    MeshBaseId::new(name).unwrap()
}

fn context(network: &Arc<LocalNetwork>) -> MeshContext {
    MeshContext::on_network(MeshConfig::default(), Arc::new(MemoryStorage::new()), network.clone()).unwrap()
}

fn spawn(name: &str, network: &Arc<LocalNetwork>) -> MeshBase {
    MeshBase::spawn(id(name), &context(network), MeshBaseOptions::default()).unwrap()
}

/// Poll until `check` holds or six simulated seconds pass
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

fn integer(mesh_base: &MeshBase, object: &MeshObjectId, name: &str) -> Option<i64> {
    match mesh_base.get(object)?.property(name) {
        Some(PropertyValue::Integer(n)) => Some(*n),
        _ => None,
    }
}

#[tokio::test(start_paused = true)]
async fn test_replica_follows_origin() {
    tracing_subscriber::fmt().with_env_filter("debug").try_init().ok();

    let network = LocalNetwork::new();
    let a = spawn("local:a", &network);
    let b = spawn("local:b", &network);

    let item = b
        .execute(|tx| {
            let item = tx.create_object("item")?;
            tx.set_property(&item, "n", 1i64)?;
            Ok(item)
        })
        .await
        .unwrap();

    let path = AccessPath::to_object(b.id().clone(), item.clone());
    let replica = a.access_locally(&path, None, None).await.unwrap();
    assert_eq!(replica.property("n"), Some(&PropertyValue::Integer(1)));

    for n in 2..=4i64 {
        b.execute(|tx| tx.set_property(&item, "n", n)).await.unwrap();
    }
    assert!(eventually(|| integer(&a, &item, "n") == Some(4)).await);

    // deletion at the origin removes the replica
    b.execute(|tx| tx.delete_object(&item)).await.unwrap();
    assert!(eventually(|| a.get(&item).is_none()).await);
}

#[tokio::test(start_paused = true)]
async fn test_send_tokens_increase() {
    let network = LocalNetwork::new();
    let a = spawn("local:a", &network);
    let b = spawn("local:b", &network);
    let item = b.execute(|tx| tx.create_object("item")).await.unwrap();
    a.access_locally(&AccessPath::to_object(b.id().clone(), item.clone()), None, None)
        .await
        .unwrap();

    let mut last = 0;
    for n in 0..3i64 {
        b.execute(|tx| tx.set_property(&item, "n", n)).await.unwrap();
        assert!(eventually(|| integer(&a, &item, "n") == Some(n)).await);
        let info = b.proxy_info().await.unwrap();
        let toward_a = info.iter().find(|p| &p.partner == a.id()).unwrap();
        assert!(toward_a.last_sent_token > last);
        last = toward_a.last_sent_token;
    }
}

#[tokio::test(start_paused = true)]
async fn test_lock_negotiation_round_trip() {
    let network = LocalNetwork::new();
    let a = spawn("local:a", &network);
    let b = spawn("local:b", &network);
    let item = b.execute(|tx| tx.create_object("item")).await.unwrap();
    a.access_locally(&AccessPath::to_object(b.id().clone(), item.clone()), None, None)
        .await
        .unwrap();

    a.obtain_lock(&[item.clone()], None).await.unwrap();
    a.execute(|tx| tx.set_property(&item, "writer", "a")).await.unwrap();
    assert!(eventually(|| {
        b.get(&item).and_then(|r| r.property("writer").cloned()) == Some(PropertyValue::from("a"))
    })
    .await);

    a.push_lock(&[item.clone()], b.id()).await.unwrap();
    assert!(eventually(|| b.get(&item).map(|r| r.holds_lock()).unwrap_or(false)).await);
    assert!(!a.get(&item).unwrap().holds_lock());
    b.execute(|tx| tx.set_property(&item, "writer", "b")).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_force_leaves_one_holder() {
    let network = LocalNetwork::new();
    let a = spawn("local:a", &network);
    let b = spawn("local:b", &network);
    let item = b.execute(|tx| tx.create_object("item")).await.unwrap();
    a.access_locally(&AccessPath::to_object(b.id().clone(), item.clone()), None, None)
        .await
        .unwrap();
    a.obtain_lock(&[item.clone()], None).await.unwrap();

    let contested = [item.clone()];
    let (_, _) = tokio::join!(a.force_obtain_lock(&contested), b.force_obtain_lock(&contested));
    tokio::time::sleep(Duration::from_secs(3)).await;

    let holders = [&a, &b]
        .iter()
        .filter(|m| m.get(&item).map(|r| r.holds_lock()).unwrap_or(false))
        .count();
    assert_eq!(holders, 1);
}

#[tokio::test(start_paused = true)]
async fn test_lost_frame_is_retransmitted() {
    let network = LocalNetwork::new();
    let a = spawn("local:a", &network);
    let b = spawn("local:b", &network);
    let item = b.execute(|tx| tx.create_object("item")).await.unwrap();
    a.access_locally(&AccessPath::to_object(b.id().clone(), item.clone()), None, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    network.drop_next(1);
    b.execute(|tx| tx.set_property(&item, "n", 9i64)).await.unwrap();
    assert!(eventually(|| integer(&a, &item, "n") == Some(9)).await);
}

#[tokio::test(start_paused = true)]
async fn test_shadow_reached_through_resolver() {
    let network = LocalNetwork::new();
    let source = id("memory:feed");
    let probe = Arc::new(MemoryProbe::new(
        ProbeOutput::default().object("entry", [("n", PropertyValue::Integer(1))]),
    ));
    let mut probes = ProbeDirectory::new();
    probes.register_id(source.clone(), probe.clone());
    let manager = ProbeManager::new(context(&network).with_probes(probes));

    let a = spawn("local:a", &network);
    let entry = MeshObjectId::new(source.clone(), "entry");
    let replica = a
        .access_locally(&AccessPath::to_object(source.clone(), entry.clone()), None, None)
        .await
        .unwrap();
    assert_eq!(replica.property("n"), Some(&PropertyValue::Integer(1)));
    assert_eq!(probe.reads(), 1);
    assert!(manager.shadow(&source).is_some());

    // a new source state reaches the replica after freshen
    probe.set_output(ProbeOutput::default().object("entry", [("n", PropertyValue::Integer(2))]));
    a.freshen(&[entry.clone()], None).await.unwrap();
    assert!(eventually(|| integer(&a, &entry, "n") == Some(2)).await);
    assert_eq!(probe.reads(), 2);
    manager.die().await;
}
