//! PeerCluster Custom Resource Definition.
//!
//! The peering descriptor: which remote cluster to replicate to and where its
//! credentials live. An external discovery/authentication component creates
//! these; the engine consumes them and reports the peer phase back.

use crate::peer::{PeerPhase, PeeringDescriptor};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// PeerCluster is the Schema for the peerclusters API.
///
/// # Example
///
/// ```yaml
/// apiVersion: replication.peering.io/v1alpha1
/// kind: PeerCluster
/// metadata:
///   name: cluster-2
/// spec:
///   clusterId: cluster-2
///   apiUrl: https://cluster-2.example:6443
///   credentialsSecret: cluster-2-kubeconfig
/// ```
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "replication.peering.io",
    version = "v1alpha1",
    kind = "PeerCluster",
    plural = "peerclusters",
    shortname = "pc",
    namespaced,
    status = "PeerClusterStatus",
    printcolumn = r#"{"name":"Cluster", "type":"string", "jsonPath":".spec.clusterId"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Watches", "type":"integer", "jsonPath":".status.activeWatches"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PeerClusterSpec {
    /// Identifier of the remote cluster. Matches the destination marker of
    /// objects replicated to it.
    pub cluster_id: String,

    /// API server URL. Overrides the server of the stored kubeconfig.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    /// Secret in the same namespace whose `kubeconfig` key authenticates to
    /// the remote cluster.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials_secret: Option<String>,

    /// `false` tears the peering down while keeping the descriptor.
    #[serde(default = "default_true")]
    pub desired: bool,
}

fn default_true() -> bool {
    true
}

/// Status of a PeerCluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PeerClusterStatus {
    /// Lifecycle phase of the peering.
    #[serde(default)]
    pub phase: PeerPhase,

    /// Human-readable message about the current state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last time the phase was reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// Outbound and remote watches open against the peer.
    #[serde(default)]
    pub active_watches: u32,
}

impl From<&PeerCluster> for PeeringDescriptor {
    fn from(pc: &PeerCluster) -> Self {
        Self {
            name: pc.name_any(),
            cluster_id: pc.spec.cluster_id.clone(),
            api_url: pc.spec.api_url.clone(),
            credentials_secret: pc.spec.credentials_secret.clone(),
            desired: pc.spec.desired,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn spec_defaults_to_desired() {
        let spec: PeerClusterSpec =
            serde_json::from_value(serde_json::json!({"clusterId": "cluster-2"})).unwrap();
        assert!(spec.desired);

        let pc = PeerCluster::new("peer-2", spec);
        let descriptor = PeeringDescriptor::from(&pc);
        assert_eq!(descriptor.name, "peer-2");
        assert_eq!(descriptor.cluster_id, "cluster-2");
    }

    #[test]
    fn crd_metadata() {
        let crd = PeerCluster::crd();
        assert_eq!(crd.spec.group, "replication.peering.io");
        assert_eq!(crd.spec.names.kind, "PeerCluster");
        assert_eq!(crd.spec.scope, "Namespaced");
    }
}
