//! Peering lifecycle tests: isolation, teardown, degraded recovery.

mod common;

use common::{CONVERGE, TestMesh, eventually, key, source, spec_in, tunnel_type};
use crd_replicator::conditions::ConditionReason;
use crd_replicator::PeerPhase;
use crd_replicator::PeeringDescriptor;
use crd_replicator::store::{Fault, MemoryObjectApi};
use crd_replicator::watch::WatchScope;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// A permanently failing peer does not hold back a healthy one.
#[tokio::test]
async fn test_peer_isolation() {
    let mesh = TestMesh::new(&["cluster-2", "cluster-3"]).await;
    mesh.peer("cluster-3").set_fault(Some(Fault::Unavailable));

    mesh.create_local(source("tun-a", "cluster-3", json!({"podCIDR": "10.0.0.0/16"})))
        .await;
    mesh.create_local(source("tun-b", "cluster-2", json!({"podCIDR": "10.1.0.0/16"})))
        .await;
    mesh.create_local(source("tun-c", "cluster-3", json!({"podCIDR": "10.2.0.0/16"})))
        .await;
    mesh.create_local(source("tun-d", "cluster-2", json!({"podCIDR": "10.3.0.0/16"})))
        .await;

    assert!(
        eventually(CONVERGE, || {
            mesh.has_mirror("cluster-2", "tun-b") && mesh.has_mirror("cluster-2", "tun-d")
        })
        .await,
        "healthy peer should converge"
    );
    assert!(mesh.peer("cluster-3").objects(&tunnel_type()).is_empty());
    assert_eq!(mesh.engine.peer_phase("cluster-2"), Some(PeerPhase::Active));

    mesh.shutdown().await;
}

/// After removal returns, nothing is written to the removed peer.
#[tokio::test]
async fn test_teardown_stops_all_writes() {
    let mesh = TestMesh::new(&["cluster-2"]).await;
    let peer = mesh.peer("cluster-2");

    mesh.create_local(source("tun-a", "cluster-2", json!({"podCIDR": "10.0.0.0/16"})))
        .await;
    assert!(eventually(CONVERGE, || mesh.has_mirror("cluster-2", "tun-a")).await);

    assert!(mesh.engine.remove_peering("cluster-2").await.unwrap());
    assert_eq!(mesh.engine.peer_phase("cluster-2"), None);
    assert!(
        mesh.engine
            .active_watches()
            .iter()
            .all(|k| k.endpoint != "cluster-2"),
        "every watch of the peer is cancelled"
    );

    let writes = peer.write_count();
    mesh.create_local(source("tun-b", "cluster-2", json!({"podCIDR": "10.1.0.0/16"})))
        .await;
    mesh.delete_local("tun-a").await;
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(peer.write_count(), writes, "no write after teardown");
    assert!(mesh.has_mirror("cluster-2", "tun-a"), "teardown does not delete mirrors");

    // Removing twice is a no-op.
    assert!(!mesh.engine.remove_peering("cluster-2").await.unwrap());

    mesh.shutdown().await;
}

/// Teardown while the peer is mid-write still returns and leaves the peer
/// untouched afterwards.
#[tokio::test]
async fn test_teardown_of_slow_peer() {
    let mesh = TestMesh::new(&["cluster-2"]).await;
    let peer = mesh.peer("cluster-2");
    peer.set_latency(Some(Duration::from_millis(300)));

    for i in 0..5 {
        mesh.create_local(source(
            &format!("tun-{}", i),
            "cluster-2",
            json!({"podCIDR": format!("10.{}.0.0/16", i)}),
        ))
        .await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(mesh.engine.remove_peering("cluster-2").await.unwrap());
    let writes = peer.write_count();
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(peer.write_count(), writes);

    mesh.shutdown().await;
}

/// A peer whose credentials are revoked degrades, then recovers and catches
/// up once they work again.
#[tokio::test]
async fn test_degraded_recovery() {
    let mesh = TestMesh::new(&["cluster-2", "cluster-3"]).await;
    let peer = mesh.peer("cluster-2");

    peer.set_fault(Some(Fault::Unusable));
    assert!(
        eventually(CONVERGE, || mesh.engine.peer_phase("cluster-2") == Some(PeerPhase::Degraded))
            .await,
        "revoked peer should degrade"
    );
    assert_eq!(mesh.engine.peer_phase("cluster-3"), Some(PeerPhase::Active));

    mesh.create_local(source("tun-a", "cluster-2", json!({"podCIDR": "10.0.0.0/16"})))
        .await;
    mesh.create_local(source("tun-b", "cluster-3", json!({"podCIDR": "10.1.0.0/16"})))
        .await;
    assert!(
        eventually(CONVERGE, || mesh.has_mirror("cluster-3", "tun-b")).await,
        "other peers keep replicating"
    );

    peer.set_fault(None);
    assert!(
        eventually(CONVERGE, || spec_in(peer, "tun-a") == Some(json!({"podCIDR": "10.0.0.0/16"})))
            .await,
        "recovered peer should be backfilled"
    );
    assert!(
        eventually(CONVERGE, || mesh.engine.peer_phase("cluster-2") == Some(PeerPhase::Active)).await
    );

    mesh.shutdown().await;
}

/// A peer that cannot be connected to starts Degraded and activates once it
/// becomes reachable.
#[tokio::test]
async fn test_unreachable_peer_retries() {
    let mesh = TestMesh::new(&[]).await;

    let phase = mesh.peer_with("cluster-5").await;
    assert_eq!(phase, Some(PeerPhase::Degraded));
    let summary = mesh
        .engine
        .peers()
        .into_iter()
        .find(|p| p.cluster_id == "cluster-5")
        .unwrap();
    assert!(summary.message.is_some());

    let store = MemoryObjectApi::new("cluster-5");
    mesh.connector.insert("cluster-5", Arc::new(store.clone()));
    assert!(
        eventually(CONVERGE, || mesh.engine.peer_phase("cluster-5") == Some(PeerPhase::Active)).await,
        "reconnect timer should activate the peer"
    );

    mesh.shutdown().await;
}

/// A descriptor with `desired: false` behaves like removal.
#[tokio::test]
async fn test_undesired_peering_is_torn_down() {
    let mesh = TestMesh::new(&["cluster-2"]).await;

    let mut descriptor = PeeringDescriptor::new("cluster-2");
    descriptor.desired = false;
    assert_eq!(mesh.engine.apply_peering(descriptor).await.unwrap(), None);
    assert_eq!(mesh.engine.peer_phase("cluster-2"), None);

    assert_eq!(mesh.peer_with("cluster-2").await, Some(PeerPhase::Active));

    mesh.shutdown().await;
}

/// Re-applying an unchanged descriptor keeps the live watches.
#[tokio::test]
async fn test_reapply_is_a_noop() {
    let mesh = TestMesh::new(&["cluster-2"]).await;
    let before = mesh.engine.active_watches();

    assert_eq!(mesh.peer_with("cluster-2").await, Some(PeerPhase::Active));
    assert_eq!(mesh.engine.active_watches(), before);

    let scopes: Vec<WatchScope> = before
        .iter()
        .filter(|k| k.endpoint == "cluster-2")
        .map(|k| k.scope)
        .collect();
    assert_eq!(scopes, vec![WatchScope::Outbound, WatchScope::Remote]);

    mesh.shutdown().await;
}

/// Add and remove of the same peer issued back to back are applied in
/// order.
#[tokio::test]
async fn test_concurrent_add_and_remove_serialize() {
    let mesh = TestMesh::new(&[]).await;
    let store = MemoryObjectApi::new("cluster-2");
    mesh.connector.insert("cluster-2", Arc::new(store));

    let engine = mesh.engine.clone();
    let add = tokio::spawn(async move { engine.apply_peering(PeeringDescriptor::new("cluster-2")).await });
    tokio::task::yield_now().await;
    let removed = mesh.engine.remove_peering("cluster-2").await.unwrap();
    let added = add.await.unwrap().unwrap();

    match added {
        // Remove ran after the add completed.
        Some(PeerPhase::Active) if removed => {
            assert_eq!(mesh.engine.peer_phase("cluster-2"), None);
        }
        // Remove ran first and found nothing; the add stands.
        Some(PeerPhase::Active) => {
            assert_eq!(mesh.engine.peer_phase("cluster-2"), Some(PeerPhase::Active));
        }
        other => panic!("unexpected phase {:?}", other),
    }
    if mesh.engine.peer_phase("cluster-2").is_none() {
        assert!(
            mesh.engine
                .active_watches()
                .iter()
                .all(|k| k.endpoint != "cluster-2")
        );
    }

    mesh.shutdown().await;
}

/// A peer that never answers in time is cut off by the call timeout and its
/// sources are recorded as failing, while another peer converges.
#[tokio::test]
async fn test_stuck_peer_is_bounded_by_call_timeout() {
    let mesh = TestMesh::new(&["cluster-2", "cluster-3"]).await;
    mesh.peer("cluster-3").set_latency(Some(Duration::from_secs(3)));

    mesh.create_local(source("tun-a", "cluster-3", json!({"podCIDR": "10.0.0.0/16"})))
        .await;
    mesh.create_local(source("tun-b", "cluster-2", json!({"podCIDR": "10.1.0.0/16"})))
        .await;

    assert!(
        eventually(CONVERGE, || mesh.has_mirror("cluster-2", "tun-b")).await,
        "healthy peer should converge"
    );
    assert!(
        eventually(Duration::from_secs(20), || {
            mesh.engine.conditions().iter().any(|c| {
                c.key == key("tun-a")
                    && c.cluster.as_deref() == Some("cluster-3")
                    && c.reason == ConditionReason::UpsertFailed
            })
        })
        .await,
        "timed out upserts should be recorded"
    );
    assert!(!mesh.has_mirror("cluster-3", "tun-a"));

    mesh.peer("cluster-3").set_latency(None);
    mesh.shutdown().await;
}

/// Error responses from a live server do not degrade the peer.
#[tokio::test]
async fn test_unavailable_peer_stays_active() {
    let mesh = TestMesh::new(&["cluster-2"]).await;
    mesh.peer("cluster-2").set_fault(Some(Fault::Unavailable));

    // Many times the unreachable threshold of failed watch attempts.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(mesh.engine.peer_phase("cluster-2"), Some(PeerPhase::Active));

    mesh.peer("cluster-2").set_fault(None);
    mesh.shutdown().await;
}

/// A peer that stops answering altogether degrades once the threshold of
/// unanswered watch attempts is reached.
#[tokio::test]
async fn test_silent_peer_degrades() {
    let mesh = TestMesh::new(&["cluster-2", "cluster-3"]).await;
    mesh.peer("cluster-2").set_fault(Some(Fault::Unreachable));

    assert!(
        eventually(CONVERGE, || mesh.engine.peer_phase("cluster-2") == Some(PeerPhase::Degraded))
            .await,
        "silent peer should degrade"
    );
    assert_eq!(mesh.engine.peer_phase("cluster-3"), Some(PeerPhase::Active));

    mesh.peer("cluster-2").set_fault(None);
    assert!(
        eventually(CONVERGE, || mesh.engine.peer_phase("cluster-2") == Some(PeerPhase::Active)).await
    );

    mesh.shutdown().await;
}
