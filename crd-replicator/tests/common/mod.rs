//! Common test utilities for replication tests.
//!
//! A [`TestMesh`] runs one engine against an in-memory local store and a set
//! of in-memory peers reachable through a static connector.

use crd_replicator::connector::StaticPeerConnector;
use crd_replicator::object::{DESTINATION_LABEL, LOCAL_ORIGIN_LABEL, ObjectKey, spec_of, status_of};
use crd_replicator::store::{MemoryObjectApi, ObjectApi};
use crd_replicator::{
    PeerPhase, PeeringDescriptor, ReplicationEngine, ReplicatorConfig, ResourceTypeDescriptor,
};
use kube::api::{DynamicObject, ObjectMeta, TypeMeta};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Identifier of the cluster the engine runs in.
pub const LOCAL: &str = "cluster-1";

/// Namespace of every test object.
pub const NAMESPACE: &str = "default";

/// How long to wait for convergence.
pub const CONVERGE: Duration = Duration::from_secs(10);

/// The kind replicated by most tests.
pub fn tunnel_type() -> ResourceTypeDescriptor {
    ResourceTypeDescriptor::namespaced(
        "net.example.io",
        "v1alpha1",
        "TunnelEndpoint",
        "tunnelendpoints",
    )
}

/// A second kind, registered at runtime by some tests.
#[allow(dead_code)]
pub fn network_type() -> ResourceTypeDescriptor {
    ResourceTypeDescriptor::namespaced(
        "net.example.io",
        "v1alpha1",
        "NetworkConfig",
        "networkconfigs",
    )
}

/// Fast timings so tests converge quickly.
pub fn test_config() -> ReplicatorConfig {
    ReplicatorConfig::builder()
        .cluster_id(LOCAL)
        .resync_interval_seconds(1)
        .call_timeout_seconds(2)
        .retry(3, 10, 50)
        .status_retry(5, 10)
        .degraded_retry_seconds(1)
        .unreachable_threshold(2)
        .resource(tunnel_type())
        .build()
}

/// Key of a test object.
pub fn key(name: &str) -> ObjectKey {
    ObjectKey::new(Some(NAMESPACE), name)
}

/// Build an object of `rt` with the given labels and spec.
pub fn object(
    rt: &ResourceTypeDescriptor,
    name: &str,
    labels: &[(&str, &str)],
    spec: Value,
) -> DynamicObject {
    let labels: BTreeMap<String, String> = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    DynamicObject {
        types: Some(TypeMeta {
            api_version: rt.api_version(),
            kind: rt.kind.clone(),
        }),
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        data: serde_json::json!({ "spec": spec }),
    }
}

/// A local-origin source targeting `destination`.
pub fn source(name: &str, destination: &str, spec: Value) -> DynamicObject {
    object(
        &tunnel_type(),
        name,
        &[(LOCAL_ORIGIN_LABEL, "true"), (DESTINATION_LABEL, destination)],
        spec,
    )
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}

/// Spec of an object in `store`, if it exists.
#[allow(dead_code)]
pub fn spec_in(store: &MemoryObjectApi, name: &str) -> Option<Value> {
    store
        .object(&tunnel_type(), &key(name))
        .and_then(|obj| spec_of(&obj).cloned())
}

/// Status of an object in `store`, if it has one.
#[allow(dead_code)]
pub fn status_in(store: &MemoryObjectApi, name: &str) -> Option<Value> {
    store
        .object(&tunnel_type(), &key(name))
        .and_then(|obj| status_of(&obj).cloned())
}

/// An engine, its local store and its simulated peers.
#[allow(dead_code)]
pub struct TestMesh {
    /// Engine under test.
    pub engine: ReplicationEngine,
    /// Local store.
    pub local: MemoryObjectApi,
    /// Simulated peers by cluster identifier.
    pub peers: HashMap<String, MemoryObjectApi>,
    /// Connector resolving the peers.
    pub connector: Arc<StaticPeerConnector>,
}

#[allow(dead_code)]
impl TestMesh {
    /// Start an engine with the default test config and peer with every
    /// cluster in `peer_ids`.
    pub async fn new(peer_ids: &[&str]) -> Self {
        Self::with_config(test_config(), peer_ids).await
    }

    /// Start an engine with `config` and peer with every cluster in
    /// `peer_ids`.
    pub async fn with_config(config: ReplicatorConfig, peer_ids: &[&str]) -> Self {
        let local = MemoryObjectApi::new(LOCAL);
        let connector = Arc::new(StaticPeerConnector::new());
        let mut peers = HashMap::new();
        for id in peer_ids {
            let store = MemoryObjectApi::new(*id);
            connector.insert(*id, Arc::new(store.clone()));
            peers.insert(id.to_string(), store);
        }

        let engine = ReplicationEngine::builder(config)
            .local(Arc::new(local.clone()))
            .connector(connector.clone())
            .start()
            .await
            .expect("Failed to start engine");

        let mesh = Self {
            engine,
            local,
            peers,
            connector,
        };
        for id in peer_ids {
            let phase = mesh.peer_with(id).await;
            assert_eq!(phase, Some(PeerPhase::Active), "peer {} should activate", id);
        }
        mesh
    }

    /// Apply a desired peering with `cluster_id`.
    pub async fn peer_with(&self, cluster_id: &str) -> Option<PeerPhase> {
        self.engine
            .apply_peering(PeeringDescriptor::new(cluster_id))
            .await
            .expect("Failed to apply peering")
    }

    /// Store of a simulated peer.
    pub fn peer(&self, cluster_id: &str) -> &MemoryObjectApi {
        &self.peers[cluster_id]
    }

    /// Create an object in the local store.
    pub async fn create_local(&self, obj: DynamicObject) -> DynamicObject {
        self.local
            .create(&tunnel_type(), &obj)
            .await
            .expect("Failed to create local object")
    }

    /// Replace an object in the local store, ignoring its resource version.
    pub async fn replace_local(&self, mut obj: DynamicObject) -> DynamicObject {
        obj.metadata.resource_version = None;
        self.local
            .replace(&tunnel_type(), &obj)
            .await
            .expect("Failed to replace local object")
    }

    /// Delete an object from the local store.
    pub async fn delete_local(&self, name: &str) {
        self.local
            .delete(&tunnel_type(), &key(name))
            .await
            .expect("Failed to delete local object");
    }

    /// Whether `cluster_id` holds an object named `name`.
    pub fn has_mirror(&self, cluster_id: &str, name: &str) -> bool {
        self.peer(cluster_id)
            .object(&tunnel_type(), &key(name))
            .is_some()
    }

    /// Stop the engine.
    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
    }
}
