//! Replication controllers.
//!
//! - [`local`]: Local Watch Manager, one watch per registered type on the
//!   local store plus one outbound writer per (peer, type)
//! - [`outbox`]: coalescing per-(peer, type) queues feeding the writers
//! - [`remote`]: Remote Watch Manager, one watch per (peer, type) pulling
//!   mirror status back
//! - [`peering`]: Peering Lifecycle Reconciler, the single serialized loop
//!   owning peer state transitions and watch start/stop
//! - [`policy`]: folds `ReplicationPolicy` objects into the type registry

pub mod local;
pub mod outbox;
pub mod peering;
pub mod policy;
pub mod remote;

pub use outbox::{MirrorOp, Outbox, Outboxes};
pub use peering::{
    DescriptorIndex, KubePhaseReporter, PeeringReconciler, PhaseReport, PhaseReporter, ReconcilerCommand,
    watch_peer_clusters,
};
pub use policy::{PolicySet, TypeDiff, watch_policies};

use crate::conditions::ReplicationConditions;
use crate::config::ReplicatorConfig;
use crate::peer::{EndpointRegistry, RemoteEndpoint};
use crate::resource::ResourceTypeRegistry;
use crate::retry::RetryPolicy;
use crate::store::ObjectApi;
use crate::watch::WatchTable;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Shared state of one engine. Workers hold it behind an `Arc`.
pub struct EngineContext {
    /// Engine configuration.
    pub config: ReplicatorConfig,
    /// Local object API.
    pub local: Arc<dyn ObjectApi>,
    /// Registered resource types.
    pub registry: ResourceTypeRegistry,
    /// Known peers.
    pub peers: EndpointRegistry,
    /// Live subscriptions.
    pub watches: WatchTable,
    /// Per-object failure conditions.
    pub conditions: ReplicationConditions,
    /// Queues feeding the outbound writers.
    pub outboxes: Outboxes,
    /// Backoff for transient errors.
    pub retry: RetryPolicy,
    /// Channel into the peering reconciler.
    pub commands: mpsc::UnboundedSender<ReconcilerCommand>,
}

impl EngineContext {
    /// Identifier of the local cluster.
    pub fn cluster_id(&self) -> &str {
        &self.config.cluster_id
    }

    /// Namespace scope for local objects and their mirrors.
    pub fn namespace(&self) -> Option<&str> {
        self.config.namespace.as_deref()
    }

    /// Tell the reconciler a peer handle looks unusable. Never blocks.
    ///
    /// Reports naming a handle that has since been replaced are ignored.
    pub fn report_unusable(&self, endpoint: &Arc<RemoteEndpoint>, reason: String) {
        let sent = self.commands.send(ReconcilerCommand::PeerUnusable {
            endpoint: endpoint.clone(),
            reason,
        });
        if sent.is_err() {
            debug!(
                cluster = %endpoint.cluster_id(),
                "Reconciler stopped, dropping unusable report"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryObjectApi;
    use std::time::Duration;

    #[test]
    fn unusable_report_after_reconciler_stopped_is_dropped() {
        let (commands, rx) = mpsc::unbounded_channel();
        let ctx = EngineContext {
            retry: RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(1)),
            config: ReplicatorConfig::builder().cluster_id("c1").build(),
            local: Arc::new(MemoryObjectApi::new("c1")),
            registry: ResourceTypeRegistry::new(),
            peers: EndpointRegistry::new(),
            watches: WatchTable::new(),
            conditions: ReplicationConditions::new(),
            outboxes: Outboxes::default(),
            commands,
        };
        let endpoint = Arc::new(RemoteEndpoint::new(
            "c2",
            Arc::new(MemoryObjectApi::new("c2")),
            Duration::from_secs(1),
        ));
        drop(rx);

        ctx.report_unusable(&endpoint, "revoked".to_string());
        assert!(ctx.commands.is_closed());
    }
}
