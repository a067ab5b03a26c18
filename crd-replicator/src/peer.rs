//! Remote Endpoint Registry.
//!
//! A [`RemoteEndpoint`] wraps one peer's object API with per-call deadlines and
//! a write gate. The [`EndpointRegistry`] tracks every known peer and its
//! lifecycle phase; it is mutated only by the peering reconciler and read by
//! everyone else.

use crate::error::{ReplicatorError, ReplicatorResult};
use crate::object::ObjectKey;
use crate::resource::ResourceTypeDescriptor;
use crate::retry::with_timeout;
use crate::store::{ApiFuture, EventStream, ObjectApi};
use chrono::{DateTime, Utc};
use kube::api::DynamicObject;
use parking_lot::RwLock;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;

/// Lifecycle phase of a peer. A peer with no entry is absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum PeerPhase {
    /// Descriptor seen, handle being provisioned.
    #[default]
    Pending,
    /// Handle usable, watches running.
    Active,
    /// Handle unusable, watches cancelled, reconnect timer armed.
    Degraded,
    /// Watches being cancelled before removal.
    TearingDown,
}

impl fmt::Display for PeerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerPhase::Pending => "Pending",
            PeerPhase::Active => "Active",
            PeerPhase::Degraded => "Degraded",
            PeerPhase::TearingDown => "TearingDown",
        };
        f.write_str(s)
    }
}

/// What the engine needs to know about a peering relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeeringDescriptor {
    /// Name of the descriptor object, used for status reporting.
    pub name: String,
    /// Identifier of the peer cluster.
    pub cluster_id: String,
    /// API server URL of the peer, if known.
    pub api_url: Option<String>,
    /// Secret holding the peer's kubeconfig.
    pub credentials_secret: Option<String>,
    /// `false` is treated exactly like removal.
    pub desired: bool,
}

impl PeeringDescriptor {
    /// A desired peering whose descriptor is named after the cluster.
    pub fn new(cluster_id: impl Into<String>) -> Self {
        let cluster_id = cluster_id.into();
        Self {
            name: cluster_id.clone(),
            cluster_id,
            api_url: None,
            credentials_secret: None,
            desired: true,
        }
    }

    /// Whether switching from `self` to `other` requires a new handle.
    pub fn endpoint_changed(&self, other: &PeeringDescriptor) -> bool {
        self.api_url != other.api_url || self.credentials_secret != other.credentials_secret
    }
}

/// Handle to one peer's object API.
///
/// Every call is bounded by the call timeout. After [`RemoteEndpoint::close`]
/// returns, no call is in flight and every further call fails with
/// [`ReplicatorError::PeerNotActive`].
pub struct RemoteEndpoint {
    cluster_id: String,
    api: Arc<dyn ObjectApi>,
    open: tokio::sync::RwLock<bool>,
    call_timeout: Duration,
}

impl RemoteEndpoint {
    /// Wrap a peer's object API.
    pub fn new(cluster_id: impl Into<String>, api: Arc<dyn ObjectApi>, call_timeout: Duration) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            api,
            open: tokio::sync::RwLock::new(true),
            call_timeout,
        }
    }

    /// Peer identifier.
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    async fn gated<T>(&self, operation: &str, call: ApiFuture<'_, T>) -> ReplicatorResult<T> {
        let open = self.open.read().await;
        if !*open {
            return Err(ReplicatorError::PeerNotActive(self.cluster_id.clone()));
        }
        with_timeout(self.call_timeout, operation, call).await
    }

    /// List objects by label selector.
    pub async fn list(
        &self,
        rt: &ResourceTypeDescriptor,
        namespace: Option<&str>,
        selector: &str,
    ) -> ReplicatorResult<Vec<DynamicObject>> {
        self.gated("list", self.api.list(rt, namespace, selector)).await
    }

    /// Fetch one object.
    pub async fn get(
        &self,
        rt: &ResourceTypeDescriptor,
        key: &ObjectKey,
    ) -> ReplicatorResult<Option<DynamicObject>> {
        self.gated("get", self.api.get(rt, key)).await
    }

    /// Create an object.
    pub async fn create(
        &self,
        rt: &ResourceTypeDescriptor,
        obj: &DynamicObject,
    ) -> ReplicatorResult<DynamicObject> {
        self.gated("create", self.api.create(rt, obj)).await
    }

    /// Replace an object.
    pub async fn replace(
        &self,
        rt: &ResourceTypeDescriptor,
        obj: &DynamicObject,
    ) -> ReplicatorResult<DynamicObject> {
        self.gated("replace", self.api.replace(rt, obj)).await
    }

    /// Delete an object.
    pub async fn delete(&self, rt: &ResourceTypeDescriptor, key: &ObjectKey) -> ReplicatorResult<()> {
        self.gated("delete", self.api.delete(rt, key)).await
    }

    /// Open a watch. The stream is not gated: cancelling its subscription
    /// drops it.
    pub fn watch(
        &self,
        rt: &ResourceTypeDescriptor,
        namespace: Option<&str>,
        selector: &str,
    ) -> EventStream {
        self.api.watch(rt, namespace, selector)
    }

    /// Release the handle. Waits for in-flight calls.
    pub async fn close(&self) {
        *self.open.write().await = false;
    }

    /// Whether the handle still accepts calls.
    pub fn is_open(&self) -> bool {
        self.open.try_read().map(|open| *open).unwrap_or(true)
    }
}

impl fmt::Debug for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteEndpoint")
            .field("cluster_id", &self.cluster_id)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

/// Read-only view of a registry entry.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSummary {
    /// Peer identifier.
    pub cluster_id: String,
    /// Descriptor name.
    pub descriptor: String,
    /// Current phase.
    pub phase: PeerPhase,
    /// Last phase change.
    pub since: DateTime<Utc>,
    /// Last error, for degraded peers.
    pub message: Option<String>,
}

struct EndpointEntry {
    descriptor: PeeringDescriptor,
    phase: PeerPhase,
    endpoint: Option<Arc<RemoteEndpoint>>,
    reconnect: Option<AbortHandle>,
    since: DateTime<Utc>,
    message: Option<String>,
}

impl EndpointEntry {
    fn summary(&self) -> PeerSummary {
        PeerSummary {
            cluster_id: self.descriptor.cluster_id.clone(),
            descriptor: self.descriptor.name.clone(),
            phase: self.phase,
            since: self.since,
            message: self.message.clone(),
        }
    }
}

/// Every known peer, keyed by cluster identifier.
#[derive(Default)]
pub struct EndpointRegistry {
    entries: RwLock<BTreeMap<String, EndpointEntry>>,
}

impl EndpointRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Phase of a peer, `None` if absent.
    pub fn phase(&self, cluster_id: &str) -> Option<PeerPhase> {
        self.entries.read().get(cluster_id).map(|e| e.phase)
    }

    /// Last descriptor applied for a peer.
    pub fn descriptor(&self, cluster_id: &str) -> Option<PeeringDescriptor> {
        self.entries.read().get(cluster_id).map(|e| e.descriptor.clone())
    }

    /// Handle of an Active peer.
    pub fn active(&self, cluster_id: &str) -> Option<Arc<RemoteEndpoint>> {
        self.entries
            .read()
            .get(cluster_id)
            .filter(|e| e.phase == PeerPhase::Active)
            .and_then(|e| e.endpoint.clone())
    }

    /// Handles of every Active peer.
    pub fn active_endpoints(&self) -> Vec<Arc<RemoteEndpoint>> {
        self.entries
            .read()
            .values()
            .filter(|e| e.phase == PeerPhase::Active)
            .filter_map(|e| e.endpoint.clone())
            .collect()
    }

    /// Identifiers of every known peer.
    pub fn cluster_ids(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Summary of one peer.
    pub fn summary(&self, cluster_id: &str) -> Option<PeerSummary> {
        self.entries.read().get(cluster_id).map(EndpointEntry::summary)
    }

    /// Summaries of every peer.
    pub fn summaries(&self) -> Vec<PeerSummary> {
        self.entries.read().values().map(EndpointEntry::summary).collect()
    }

    /// Insert or update a peer's descriptor, keeping its phase. New entries
    /// start Pending.
    pub(crate) fn upsert(&self, descriptor: PeeringDescriptor) {
        let mut entries = self.entries.write();
        match entries.get_mut(&descriptor.cluster_id) {
            Some(entry) => entry.descriptor = descriptor,
            None => {
                entries.insert(
                    descriptor.cluster_id.clone(),
                    EndpointEntry {
                        descriptor,
                        phase: PeerPhase::Pending,
                        endpoint: None,
                        reconnect: None,
                        since: Utc::now(),
                        message: None,
                    },
                );
            }
        }
    }

    /// Move a peer to `phase`. Returns `false` for an absent peer.
    pub(crate) fn set_phase(&self, cluster_id: &str, phase: PeerPhase, message: Option<String>) -> bool {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(cluster_id) else {
            return false;
        };
        if entry.phase != phase {
            entry.phase = phase;
            entry.since = Utc::now();
        }
        entry.message = message;
        true
    }

    /// Install a live handle and mark the peer Active.
    pub(crate) fn activate(&self, cluster_id: &str, endpoint: Arc<RemoteEndpoint>) -> bool {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(cluster_id) else {
            return false;
        };
        if let Some(timer) = entry.reconnect.take() {
            timer.abort();
        }
        entry.endpoint = Some(endpoint);
        entry.phase = PeerPhase::Active;
        entry.since = Utc::now();
        entry.message = None;
        true
    }

    /// Detach a peer's handle, leaving the entry in place.
    pub(crate) fn take_endpoint(&self, cluster_id: &str) -> Option<Arc<RemoteEndpoint>> {
        self.entries
            .write()
            .get_mut(cluster_id)
            .and_then(|e| e.endpoint.take())
    }

    /// Arm a reconnect timer, replacing any previous one.
    pub(crate) fn set_reconnect(&self, cluster_id: &str, timer: AbortHandle) {
        let mut entries = self.entries.write();
        match entries.get_mut(cluster_id) {
            Some(entry) => {
                if let Some(old) = entry.reconnect.replace(timer) {
                    old.abort();
                }
            }
            None => timer.abort(),
        }
    }

    /// Remove a peer, disarming its timer. Returns its handle if it had one.
    pub(crate) fn remove(&self, cluster_id: &str) -> Option<Arc<RemoteEndpoint>> {
        let entry = self.entries.write().remove(cluster_id)?;
        if let Some(timer) = entry.reconnect {
            timer.abort();
        }
        entry.endpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Fault, MemoryObjectApi};

    fn rt() -> ResourceTypeDescriptor {
        ResourceTypeDescriptor::namespaced("net.example.io", "v1alpha1", "TunnelEndpoint", "tunnelendpoints")
    }

    #[tokio::test]
    async fn closed_endpoint_rejects_calls() {
        let store = MemoryObjectApi::new("c1");
        let endpoint = RemoteEndpoint::new("c1", Arc::new(store), Duration::from_secs(1));
        assert!(endpoint.list(&rt(), None, "").await.unwrap().is_empty());

        endpoint.close().await;
        assert!(!endpoint.is_open());
        let err = endpoint.list(&rt(), None, "").await.unwrap_err();
        assert!(matches!(err, ReplicatorError::PeerNotActive(_)));
    }

    #[tokio::test]
    async fn slow_peer_times_out() {
        let store = MemoryObjectApi::new("c1");
        store.set_latency(Some(Duration::from_millis(200)));
        let endpoint = RemoteEndpoint::new("c1", Arc::new(store.clone()), Duration::from_millis(20));
        let err = endpoint.get(&rt(), &ObjectKey::new(Some("default"), "x")).await.unwrap_err();
        assert!(matches!(err, ReplicatorError::Timeout { .. }));

        store.set_latency(None);
        store.set_fault(Some(Fault::Unusable));
        let err = endpoint.list(&rt(), None, "").await.unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::PeerUnusable);
    }

    #[tokio::test]
    async fn registry_tracks_phases() {
        let registry = EndpointRegistry::new();
        registry.upsert(PeeringDescriptor::new("c1"));
        assert_eq!(registry.phase("c1"), Some(PeerPhase::Pending));
        assert!(registry.active("c1").is_none());

        let endpoint = Arc::new(RemoteEndpoint::new(
            "c1",
            Arc::new(MemoryObjectApi::new("c1")),
            Duration::from_secs(1),
        ));
        assert!(registry.activate("c1", endpoint));
        assert!(registry.active("c1").is_some());
        assert_eq!(registry.active_endpoints().len(), 1);

        assert!(registry.set_phase("c1", PeerPhase::Degraded, Some("revoked".into())));
        assert!(registry.active("c1").is_none());
        assert_eq!(registry.summary("c1").unwrap().message.as_deref(), Some("revoked"));

        assert!(registry.remove("c1").is_some());
        assert_eq!(registry.phase("c1"), None);
        assert!(!registry.set_phase("c1", PeerPhase::Active, None));
    }

    #[test]
    fn endpoint_change_detection() {
        let a = PeeringDescriptor::new("c1");
        let mut b = a.clone();
        b.name = "renamed".into();
        assert!(!a.endpoint_changed(&b));
        b.api_url = Some("https://c1.example:6443".into());
        assert!(a.endpoint_changed(&b));
    }
}
