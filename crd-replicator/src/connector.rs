//! Turning a peering descriptor into an object API handle.
//!
//! Credentials are obtained by an external collaborator; the engine only reads
//! the resulting kubeconfig.

use crate::error::ReplicatorError;
use crate::peer::PeeringDescriptor;
use crate::store::{ApiFuture, KubeObjectApi, ObjectApi};
use k8s_openapi::api::core::v1::Secret;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Secret key holding the peer kubeconfig.
pub const KUBECONFIG_KEY: &str = "kubeconfig";

/// Produces an authenticated object API for a peer.
pub trait PeerConnector: Send + Sync {
    /// Connect to the peer described by `descriptor`. Failures that retrying
    /// later could fix are reported as [`ReplicatorError::PeerUnusable`].
    fn connect<'a>(&'a self, descriptor: &'a PeeringDescriptor) -> ApiFuture<'a, Arc<dyn ObjectApi>>;
}

fn unusable(descriptor: &PeeringDescriptor, reason: impl Into<String>) -> ReplicatorError {
    ReplicatorError::PeerUnusable {
        cluster: descriptor.cluster_id.clone(),
        reason: reason.into(),
    }
}

/// Connects with a kubeconfig stored in a Secret of the peer namespace.
pub struct KubePeerConnector {
    client: Client,
    namespace: String,
}

impl KubePeerConnector {
    /// Read credential secrets from `namespace` using `client`.
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    async fn kubeconfig(&self, descriptor: &PeeringDescriptor) -> Result<Kubeconfig, ReplicatorError> {
        let secret_name = descriptor
            .credentials_secret
            .as_deref()
            .ok_or_else(|| unusable(descriptor, "descriptor names no credentials secret"))?;

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let secret = secrets.get_opt(secret_name).await?.ok_or_else(|| {
            unusable(
                descriptor,
                format!("secret {}/{} not found", self.namespace, secret_name),
            )
        })?;

        let raw = secret
            .data
            .as_ref()
            .and_then(|data| data.get(KUBECONFIG_KEY))
            .ok_or_else(|| {
                unusable(
                    descriptor,
                    format!("secret {} has no '{}' key", secret_name, KUBECONFIG_KEY),
                )
            })?;
        let text = std::str::from_utf8(&raw.0)
            .map_err(|e| unusable(descriptor, format!("kubeconfig is not UTF-8: {}", e)))?;

        Kubeconfig::from_yaml(text)
            .map_err(|e| unusable(descriptor, format!("invalid kubeconfig: {}", e)))
    }
}

impl PeerConnector for KubePeerConnector {
    fn connect<'a>(&'a self, descriptor: &'a PeeringDescriptor) -> ApiFuture<'a, Arc<dyn ObjectApi>> {
        Box::pin(async move {
            let kubeconfig = self.kubeconfig(descriptor).await?;
            let mut config =
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| unusable(descriptor, format!("kubeconfig rejected: {}", e)))?;

            if let Some(url) = &descriptor.api_url {
                config.cluster_url = url
                    .parse()
                    .map_err(|e| unusable(descriptor, format!("invalid apiUrl {}: {}", url, e)))?;
            }

            let client = Client::try_from(config)
                .map_err(|e| unusable(descriptor, format!("cannot build client: {}", e)))?;

            // Probe so that unreachable peers go Degraded instead of Active.
            client
                .apiserver_version()
                .await
                .map_err(|e| unusable(descriptor, format!("API server unreachable: {}", e)))?;

            tracing::info!(
                cluster = %descriptor.cluster_id,
                "Connected to peer API server"
            );
            Ok(Arc::new(KubeObjectApi::new(client)) as Arc<dyn ObjectApi>)
        })
    }
}

/// Connector over a fixed table of handles, for simulated peers.
#[derive(Default)]
pub struct StaticPeerConnector {
    handles: RwLock<HashMap<String, Arc<dyn ObjectApi>>>,
}

impl StaticPeerConnector {
    /// Create an empty connector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `cluster_id` reachable through `api`.
    pub fn insert(&self, cluster_id: impl Into<String>, api: Arc<dyn ObjectApi>) {
        self.handles.write().insert(cluster_id.into(), api);
    }

    /// Make `cluster_id` unreachable.
    pub fn remove(&self, cluster_id: &str) {
        self.handles.write().remove(cluster_id);
    }
}

impl PeerConnector for StaticPeerConnector {
    fn connect<'a>(&'a self, descriptor: &'a PeeringDescriptor) -> ApiFuture<'a, Arc<dyn ObjectApi>> {
        let handle = self.handles.read().get(&descriptor.cluster_id).cloned();
        Box::pin(async move { handle.ok_or_else(|| unusable(descriptor, "no handle for this cluster")) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryObjectApi;

    #[tokio::test]
    async fn static_connector_resolves_known_clusters() {
        let connector = StaticPeerConnector::new();
        connector.insert("c1", Arc::new(MemoryObjectApi::new("c1")));

        assert!(connector.connect(&PeeringDescriptor::new("c1")).await.is_ok());
        let err = match connector.connect(&PeeringDescriptor::new("c2")).await {
            Ok(_) => panic!("unknown cluster must not connect"),
            Err(e) => e,
        };
        assert_eq!(err.class(), crate::error::ErrorClass::PeerUnusable);

        connector.remove("c1");
        assert!(connector.connect(&PeeringDescriptor::new("c1")).await.is_err());
    }
}
