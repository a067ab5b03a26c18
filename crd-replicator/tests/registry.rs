//! Resource type registration tests.

mod common;

use common::{CONVERGE, LOCAL, TestMesh, eventually, key, network_type, object, source, tunnel_type};
use crd_replicator::object::{DESTINATION_LABEL, LOCAL_ORIGIN_LABEL};
use crd_replicator::store::ObjectApi;
use crd_replicator::watch::{WatchKey, WatchScope};
use serde_json::json;
use std::time::Duration;

/// Unregistering a type cancels its watches before it leaves the registry,
/// and its sources are no longer replicated.
#[tokio::test]
async fn test_unregister_type_cancels_watches() {
    let mesh = TestMesh::new(&["cluster-2"]).await;
    let resource = tunnel_type().id();
    assert!(
        mesh.engine
            .active_watches()
            .contains(&WatchKey::new(WatchScope::Local, LOCAL, &resource))
    );

    assert!(mesh.engine.unregister_type(&tunnel_type()).await.unwrap());
    assert!(mesh.engine.registered_types().is_empty());
    assert!(
        mesh.engine
            .active_watches()
            .iter()
            .all(|k| k.resource != resource),
        "every watch of the type is cancelled"
    );

    mesh.create_local(source("tun-a", "cluster-2", json!({"podCIDR": "10.0.0.0/16"})))
        .await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!mesh.has_mirror("cluster-2", "tun-a"));

    // Unknown types unregister as a no-op.
    assert!(!mesh.engine.unregister_type(&tunnel_type()).await.unwrap());

    mesh.shutdown().await;
}

/// Registering twice is a no-op.
#[tokio::test]
async fn test_register_is_idempotent() {
    let mesh = TestMesh::new(&["cluster-2"]).await;
    let before = mesh.engine.active_watches();

    assert!(!mesh.engine.register_type(tunnel_type()).await.unwrap());
    assert_eq!(mesh.engine.registered_types(), vec![tunnel_type()]);
    assert_eq!(mesh.engine.active_watches(), before);

    mesh.shutdown().await;
}

/// A type registered at runtime gets watches on every active peer and
/// replicates immediately.
#[tokio::test]
async fn test_runtime_registration() {
    let mesh = TestMesh::new(&["cluster-2", "cluster-3"]).await;
    let rt = network_type();

    assert!(mesh.engine.register_type(rt.clone()).await.unwrap());
    let keys = mesh.engine.active_watches();
    for peer in ["cluster-2", "cluster-3"] {
        assert!(keys.contains(&WatchKey::new(WatchScope::Outbound, peer, rt.id())));
        assert!(keys.contains(&WatchKey::new(WatchScope::Remote, peer, rt.id())));
    }
    assert!(keys.contains(&WatchKey::new(WatchScope::Local, LOCAL, rt.id())));

    let config = object(
        &rt,
        "net-a",
        &[(LOCAL_ORIGIN_LABEL, "true"), (DESTINATION_LABEL, "cluster-3")],
        json!({"mtu": 1450}),
    );
    mesh.local.create(&rt, &config).await.unwrap();

    let peer = mesh.peer("cluster-3");
    assert!(eventually(CONVERGE, || peer.object(&rt, &key("net-a")).is_some()).await);
    assert!(peer.objects(&tunnel_type()).is_empty());

    mesh.shutdown().await;
}

/// Descriptors that cannot address an API are rejected.
#[tokio::test]
async fn test_invalid_type_is_rejected() {
    let mesh = TestMesh::new(&[]).await;
    let mut rt = network_type();
    rt.plural.clear();

    assert!(mesh.engine.register_type(rt).await.is_err());
    assert_eq!(mesh.engine.registered_types(), vec![tunnel_type()]);

    mesh.shutdown().await;
}
