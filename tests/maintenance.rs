#[path = "common/mod.rs"]
mod common;

use bytes::Bytes;
use tokio::time::Duration;

use common::{CallKind, NetworkRegistry, TestNode};
use kdht::{DhtConfig, DhtError, Kuid};

/// A node at `make_id(0x100)` that knows four peers at `make_id(1..=4)`.
async fn neighbourhood(registry: &NetworkRegistry, config: DhtConfig) -> (TestNode, Vec<TestNode>) {
    let local = TestNode::new(registry, 0x100, config.clone());
    let peers: Vec<TestNode> = (1..=4).map(|i| TestNode::new(registry, i, config.clone())).collect();
    for peer in &peers {
        local.node.observe_contact(peer.contact()).await.unwrap();
    }
    (local, peers)
}

#[tokio::test]
async fn sync_stores_without_pinging_when_local_node_is_closest() {
    let registry = NetworkRegistry::default();
    let (local, peers) = neighbourhood(&registry, DhtConfig::default()).await;

    let key = local.id().clone();
    local
        .node
        .handle_store(peers[0].contact(), key.clone(), Bytes::from_static(b"mine"))
        .await
        .unwrap();
    local.network.clear_calls();

    let outcome = local.node.sync().await.unwrap();
    assert_eq!(outcome.examined, 1);
    assert_eq!(outcome.stored, 1);
    assert_eq!(outcome.pings, 0);
    assert!(local.network.calls_of(CallKind::Ping).is_empty());
    assert_eq!(local.network.calls_of(CallKind::Store).len(), peers.len());
    for peer in &peers {
        assert_eq!(peer.node.telemetry_snapshot().await.stored_keys, 1);
    }
}

#[tokio::test]
async fn sync_defers_to_a_closer_node_that_answers() {
    let registry = NetworkRegistry::default();
    let (local, peers) = neighbourhood(&registry, DhtConfig::default()).await;

    // Every peer is closer to this key than the local node.
    let key = peers[0].id().clone();
    local
        .node
        .handle_store(peers[0].contact(), key, Bytes::from_static(b"theirs"))
        .await
        .unwrap();
    local.network.clear_calls();

    let outcome = local.node.sync().await.unwrap();
    assert_eq!(outcome.deferred, 1);
    assert_eq!(outcome.stored, 0);
    assert_eq!(outcome.pings, peers.len());
    assert!(local.network.calls_of(CallKind::Store).is_empty());
}

#[tokio::test]
async fn sync_stores_when_every_closer_node_fails() {
    let registry = NetworkRegistry::default();
    let (local, peers) = neighbourhood(&registry, DhtConfig::default()).await;

    let key = peers[0].id().clone();
    local
        .node
        .handle_store(peers[0].contact(), key, Bytes::from_static(b"orphan"))
        .await
        .unwrap();
    for peer in &peers {
        local.network.set_failure(peer.address(), true);
    }
    local.network.clear_calls();

    let outcome = local.node.sync().await.unwrap();
    assert_eq!(outcome.deferred, 0);
    assert_eq!(outcome.stored, 1);
    assert_eq!(local.network.calls_of(CallKind::Ping).len(), peers.len());
    assert_eq!(local.network.calls_of(CallKind::Store).len(), peers.len());
}

#[tokio::test]
async fn sync_skips_keys_owned_by_others() {
    let registry = NetworkRegistry::default();
    let mut config = DhtConfig::default();
    config.routing.k = 2;
    let (local, peers) = neighbourhood(&registry, config).await;

    local
        .node
        .handle_store(peers[0].contact(), peers[0].id().clone(), Bytes::from_static(b"x"))
        .await
        .unwrap();
    local.network.clear_calls();

    let outcome = local.node.sync().await.unwrap();
    assert_eq!(outcome.not_responsible, 1);
    assert!(local.network.calls().is_empty());
}

fn id_with_first_byte(byte: u8) -> Kuid {
    let mut bytes = [0u8; 20];
    bytes[0] = byte;
    Kuid::from_bytes(bytes.to_vec())
}

#[tokio::test]
async fn refresh_looks_up_far_buckets_and_pings_stale_neighbours() {
    let registry = NetworkRegistry::default();
    let mut config = DhtConfig::default();
    config.routing.k = 2;
    config.maintenance.bucket_timeout_ms = 0;
    config.maintenance.contact_timeout_ms = 0;
    config.maintenance.ping_fraction = 1.0;

    let local = TestNode::with_id(&registry, id_with_first_byte(0x00), 1, config.clone());
    let peers: Vec<TestNode> = [0x80, 0x40, 0xC0]
        .into_iter()
        .enumerate()
        .map(|(i, byte)| TestNode::with_id(&registry, id_with_first_byte(byte), 10 + i as u32, config.clone()))
        .collect();
    for peer in &peers {
        local.node.observe_contact(peer.contact()).await.unwrap();
    }

    // One split: the 0x40 peer shares the local half, the others the far one.
    let buckets = local.node.routing().buckets().await;
    assert_eq!(buckets.len(), 2);
    let far = buckets.iter().filter(|b| !b.covers(local.id())).count();
    assert_eq!(far, 1);

    local.network.clear_calls();
    let outcome = local.node.refresh().await.unwrap();
    assert_eq!(outcome.lookups, 1);
    assert_eq!(outcome.failed_lookups, 0);
    assert_eq!(outcome.pings, 1);
    assert_eq!(outcome.failed_pings, 0);

    let pinged: Vec<_> = local
        .network
        .calls_of(CallKind::Ping)
        .into_iter()
        .map(|call| call.to)
        .collect();
    assert_eq!(pinged, vec![peers[1].address()]);
    assert!(!local.network.calls_of(CallKind::FindNode).is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_refresh_drops_its_lookups_and_pings() {
    let registry = NetworkRegistry::default();
    let mut config = DhtConfig::default();
    config.routing.k = 2;
    config.maintenance.bucket_timeout_ms = 0;
    config.maintenance.contact_timeout_ms = 0;
    config.maintenance.ping_fraction = 1.0;

    let local = TestNode::with_id(&registry, id_with_first_byte(0x00), 1, config.clone());
    for (i, byte) in [0x80u8, 0x40, 0xC0].into_iter().enumerate() {
        let peer = TestNode::with_id(&registry, id_with_first_byte(byte), 10 + i as u32, config.clone());
        local.node.observe_contact(peer.contact()).await.unwrap();
    }
    local.network.clear_calls();
    local.network.set_delay(CallKind::FindNode, Duration::from_secs(10));
    local.network.set_delay(CallKind::Ping, Duration::from_secs(10));

    let op = local.node.spawn_refresh();
    tokio::time::sleep(Duration::from_millis(100)).await;
    op.cancel();

    assert!(matches!(op.join().await, Err(DhtError::Cancelled)));
    let cancelled = local.network.cancelled();
    assert!(cancelled.iter().any(|call| call.kind == CallKind::FindNode));
    assert!(cancelled.iter().any(|call| call.kind == CallKind::Ping));
    assert_eq!(cancelled.len(), local.network.calls().len(), "every request was still in flight");
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_sync_drops_its_pings() {
    let registry = NetworkRegistry::default();
    let (local, peers) = neighbourhood(&registry, DhtConfig::default()).await;

    let key = peers[0].id().clone();
    local
        .node
        .handle_store(peers[0].contact(), key, Bytes::from_static(b"theirs"))
        .await
        .unwrap();
    local.network.clear_calls();
    local.network.set_delay(CallKind::Ping, Duration::from_secs(10));

    let op = local.node.spawn_sync();
    tokio::time::sleep(Duration::from_millis(100)).await;
    op.cancel();

    assert!(matches!(op.join().await, Err(DhtError::Cancelled)));
    let cancelled = local.network.cancelled();
    assert_eq!(cancelled.len(), peers.len());
    assert!(cancelled.iter().all(|call| call.kind == CallKind::Ping));
    assert!(local.network.calls_of(CallKind::Store).is_empty());
}

#[tokio::test(start_paused = true)]
async fn maintenance_loop_runs_until_cancelled() {
    let registry = NetworkRegistry::default();
    let mut config = DhtConfig::default();
    config.routing.k = 2;
    config.maintenance.interval_ms = 1_000;
    config.maintenance.bucket_timeout_ms = 0;

    let local = TestNode::with_id(&registry, id_with_first_byte(0x00), 1, config.clone());
    for (i, byte) in [0x80u8, 0x40, 0xC0].into_iter().enumerate() {
        let peer = TestNode::with_id(&registry, id_with_first_byte(byte), 10 + i as u32, config.clone());
        local.node.observe_contact(peer.contact()).await.unwrap();
    }
    local.network.clear_calls();

    let op = local.node.spawn_maintenance();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(local.network.calls().is_empty(), "the first round waits one interval");

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert!(!local.network.calls_of(CallKind::FindNode).is_empty());

    op.cancel();
    assert!(matches!(op.join().await, Err(DhtError::Cancelled)));
}
