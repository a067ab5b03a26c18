//! `ReplicationPolicy` reconciliation.
//!
//! Every policy's kinds, together with the kinds pinned by configuration,
//! form the set of registered types. [`PolicySet`] computes how that set
//! changes as policies come and go; [`watch_policies`] applies the changes to
//! the engine.

use crate::crd::ReplicationPolicy;
use crate::engine::ReplicationEngine;
use crate::error::ReplicatorResult;
use crate::resource::ResourceTypeDescriptor;
use futures::StreamExt;
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher::{self, Config, watcher};
use kube::{Api, Client, ResourceExt};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, error, info, warn};

/// Change to the registered set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypeDiff {
    /// Kinds that became eligible.
    pub register: Vec<ResourceTypeDescriptor>,
    /// Kinds no longer listed anywhere.
    pub unregister: Vec<ResourceTypeDescriptor>,
}

impl TypeDiff {
    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.register.is_empty() && self.unregister.is_empty()
    }
}

/// Kinds listed by each policy, plus the pinned ones.
#[derive(Debug, Clone, Default)]
pub struct PolicySet {
    pinned: Vec<ResourceTypeDescriptor>,
    policies: BTreeMap<String, Vec<ResourceTypeDescriptor>>,
}

impl PolicySet {
    /// Start with the kinds that stay registered regardless of policies.
    pub fn new(pinned: Vec<ResourceTypeDescriptor>) -> Self {
        Self {
            pinned,
            policies: BTreeMap::new(),
        }
    }

    /// Union of every listed kind, ordered by identifier.
    pub fn effective_types(&self) -> Vec<ResourceTypeDescriptor> {
        let mut types: BTreeMap<String, ResourceTypeDescriptor> = BTreeMap::new();
        for rt in self.pinned.iter().chain(self.policies.values().flatten()) {
            types.entry(rt.id()).or_insert_with(|| rt.clone());
        }
        types.into_values().collect()
    }

    /// Record the kinds of a created or updated policy. Invalid descriptors
    /// are skipped.
    pub fn apply(&mut self, name: &str, resources: Vec<ResourceTypeDescriptor>) -> TypeDiff {
        let resources = resources
            .into_iter()
            .filter(|rt| match rt.validate() {
                Ok(()) => true,
                Err(reason) => {
                    warn!(policy = %name, kind = %rt, reason = %reason, "Skipping invalid resource type");
                    false
                }
            })
            .collect();
        self.update(|policies| {
            policies.insert(name.to_string(), resources);
        })
    }

    /// Forget a policy.
    pub fn remove(&mut self, name: &str) -> TypeDiff {
        self.update(|policies| {
            policies.remove(name);
        })
    }

    /// Forget every policy not in `names`.
    pub fn retain(&mut self, names: &HashSet<String>) -> TypeDiff {
        self.update(|policies| policies.retain(|name, _| names.contains(name)))
    }

    fn update(&mut self, change: impl FnOnce(&mut BTreeMap<String, Vec<ResourceTypeDescriptor>>)) -> TypeDiff {
        let before = self.effective_types();
        change(&mut self.policies);
        let after = self.effective_types();

        let before_ids: HashSet<String> = before.iter().map(ResourceTypeDescriptor::id).collect();
        let after_ids: HashSet<String> = after.iter().map(ResourceTypeDescriptor::id).collect();
        TypeDiff {
            register: after
                .into_iter()
                .filter(|rt| !before_ids.contains(&rt.id()))
                .collect(),
            unregister: before
                .into_iter()
                .filter(|rt| !after_ids.contains(&rt.id()))
                .collect(),
        }
    }
}

async fn apply_diff(engine: &ReplicationEngine, diff: TypeDiff) -> ReplicatorResult<()> {
    for rt in diff.unregister {
        engine.unregister_type(&rt).await?;
    }
    for rt in diff.register {
        if let Err(e) = engine.register_type(rt.clone()).await {
            error!(kind = %rt, error = %e, "Failed to register resource type");
        }
    }
    Ok(())
}

/// Keep the registered types in line with `ReplicationPolicy` objects.
pub async fn watch_policies(client: Client, engine: ReplicationEngine) -> ReplicatorResult<()> {
    let api: Api<ReplicationPolicy> = Api::all(client);
    let mut stream = watcher(api, Config::default()).default_backoff().boxed();
    let mut policies = PolicySet::new(engine.config().resources.clone());
    let mut seen: HashSet<String> = HashSet::new();

    info!("ReplicationPolicy watcher started");

    while let Some(event) = stream.next().await {
        let diff = match event {
            Ok(watcher::Event::Apply(policy)) => {
                policies.apply(&policy.name_any(), policy.spec.resources.clone())
            }
            Ok(watcher::Event::InitApply(policy)) => {
                seen.insert(policy.name_any());
                policies.apply(&policy.name_any(), policy.spec.resources.clone())
            }
            Ok(watcher::Event::Delete(policy)) => {
                info!(policy = %policy.name_any(), "ReplicationPolicy deleted");
                policies.remove(&policy.name_any())
            }
            Ok(watcher::Event::Init) => {
                seen.clear();
                TypeDiff::default()
            }
            Ok(watcher::Event::InitDone) => {
                debug!("ReplicationPolicy watcher initialization complete");
                policies.retain(&seen)
            }
            Err(e) => {
                error!(error = %e, "ReplicationPolicy watch error");
                TypeDiff::default()
            }
        };

        if !diff.is_empty() {
            apply_diff(&engine, diff).await?;
        }
    }

    warn!("ReplicationPolicy watcher stream ended");
    Ok(())
}
