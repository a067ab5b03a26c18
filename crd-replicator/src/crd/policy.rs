//! ReplicationPolicy Custom Resource Definition.

use crate::resource::ResourceTypeDescriptor;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// ReplicationPolicy lists resource kinds eligible for replication.
///
/// The kinds of every policy are registered together; a kind that no policy
/// (and no static configuration) lists any more is unregistered.
///
/// # Example
///
/// ```yaml
/// apiVersion: replication.peering.io/v1alpha1
/// kind: ReplicationPolicy
/// metadata:
///   name: networking
/// spec:
///   resources:
///     - group: net.example.io
///       version: v1alpha1
///       kind: TunnelEndpoint
///       plural: tunnelendpoints
/// ```
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "replication.peering.io",
    version = "v1alpha1",
    kind = "ReplicationPolicy",
    plural = "replicationpolicies",
    shortname = "rp",
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationPolicySpec {
    /// Kinds to replicate.
    #[serde(default)]
    pub resources: Vec<ResourceTypeDescriptor>,
}
