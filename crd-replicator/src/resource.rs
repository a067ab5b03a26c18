//! Resource Type Registry.
//!
//! The registry holds the set of object kinds eligible for replication. It is
//! shared between workers and only ever locked for map manipulation.

use kube::api::{ApiResource, GroupVersionKind};
use parking_lot::RwLock;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Scope of a resource kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ResourceScope {
    /// Objects live inside a namespace.
    #[default]
    Namespaced,
    /// Objects are cluster-wide.
    Cluster,
}

/// Identifies a replicable resource kind.
///
/// # Example
///
/// ```yaml
/// group: net.example.io
/// version: v1alpha1
/// kind: TunnelEndpoint
/// plural: tunnelendpoints
/// scope: Namespaced
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTypeDescriptor {
    /// API group (empty for the core group).
    #[serde(default)]
    pub group: String,

    /// API version.
    pub version: String,

    /// Kind.
    pub kind: String,

    /// Plural resource name used in API paths.
    pub plural: String,

    /// Namespaced or cluster-wide.
    #[serde(default)]
    pub scope: ResourceScope,
}

impl ResourceTypeDescriptor {
    /// Describe a namespaced kind.
    pub fn namespaced(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
        plural: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
            plural: plural.into(),
            scope: ResourceScope::Namespaced,
        }
    }

    /// Describe a cluster-scoped kind.
    pub fn cluster_scoped(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
        plural: impl Into<String>,
    ) -> Self {
        Self {
            scope: ResourceScope::Cluster,
            ..Self::namespaced(group, version, kind, plural)
        }
    }

    /// Stable identifier, `group/version/kind`.
    pub fn id(&self) -> String {
        format!("{}/{}/{}", self.group, self.version, self.kind)
    }

    /// `apiVersion` string as it appears on objects.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Whether objects of this kind live in a namespace.
    pub fn is_namespaced(&self) -> bool {
        self.scope == ResourceScope::Namespaced
    }

    /// Group-version-kind for the dynamic API.
    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }

    /// Dynamic API resource for this kind.
    pub fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk_with_plural(&self.gvk(), &self.plural)
    }

    /// Check that the descriptor can address an API.
    pub fn validate(&self) -> Result<(), String> {
        if self.version.is_empty() {
            return Err(format!("resource {} has no version", self.kind));
        }
        if self.kind.is_empty() {
            return Err("resource kind is required".to_string());
        }
        if self.plural.is_empty() {
            return Err(format!("resource {} has no plural name", self.kind));
        }
        Ok(())
    }
}

impl fmt::Display for ResourceTypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

/// Set of kinds currently eligible for replication.
///
/// Registration is idempotent and unknown kinds unregister as a no-op. Watch
/// cancellation on unregister is orchestrated by the peering reconciler, which
/// calls [`ResourceTypeRegistry::remove`] only after every matching watch has
/// stopped.
#[derive(Debug, Default)]
pub struct ResourceTypeRegistry {
    types: RwLock<BTreeMap<String, ResourceTypeDescriptor>>,
}

impl ResourceTypeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a kind eligible. Returns `false` if it already was.
    pub fn register(&self, descriptor: ResourceTypeDescriptor) -> bool {
        let mut types = self.types.write();
        let id = descriptor.id();
        if types.contains_key(&id) {
            return false;
        }
        types.insert(id, descriptor);
        true
    }

    /// Mark a kind ineligible. Returns `false` if it was not registered.
    pub fn remove(&self, descriptor: &ResourceTypeDescriptor) -> bool {
        self.types.write().remove(&descriptor.id()).is_some()
    }

    /// Whether a kind is registered.
    pub fn is_registered(&self, descriptor: &ResourceTypeDescriptor) -> bool {
        self.types.read().contains_key(&descriptor.id())
    }

    /// Look a kind up by its identifier.
    pub fn get(&self, id: &str) -> Option<ResourceTypeDescriptor> {
        self.types.read().get(id).cloned()
    }

    /// Current set of registered kinds, ordered by identifier.
    pub fn list_registered(&self) -> Vec<ResourceTypeDescriptor> {
        self.types.read().values().cloned().collect()
    }

    /// Number of registered kinds.
    pub fn len(&self) -> usize {
        self.types.read().len()
    }

    /// Whether no kind is registered.
    pub fn is_empty(&self) -> bool {
        self.types.read().is_empty()
    }
}
