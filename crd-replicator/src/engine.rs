//! The replication engine.
//!
//! [`ReplicationEngine`] wires the registries, the watch table and the
//! peering reconciler together and is the handle the rest of the process
//! talks to. Every mutating call is forwarded to the reconciler loop and
//! completes once the reconciler has applied it.

use crate::conditions::{ReplicationCondition, ReplicationConditions};
use crate::config::ReplicatorConfig;
use crate::connector::PeerConnector;
use crate::controller::{EngineContext, Outboxes, PeeringReconciler, PhaseReporter, ReconcilerCommand};
use crate::error::{ReplicatorError, ReplicatorResult};
use crate::peer::{EndpointRegistry, PeerPhase, PeerSummary, PeeringDescriptor};
use crate::resource::{ResourceTypeDescriptor, ResourceTypeRegistry};
use crate::retry::RetryPolicy;
use crate::store::ObjectApi;
use crate::watch::{WatchKey, WatchTable};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

/// Running replication engine. Cheap to clone.
#[derive(Clone)]
pub struct ReplicationEngine {
    ctx: Arc<EngineContext>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

/// Builder for [`ReplicationEngine`].
pub struct EngineBuilder {
    config: ReplicatorConfig,
    local: Option<Arc<dyn ObjectApi>>,
    connector: Option<Arc<dyn PeerConnector>>,
    reporter: Option<Arc<dyn PhaseReporter>>,
}

impl EngineBuilder {
    /// Object API of the local cluster.
    pub fn local(mut self, api: Arc<dyn ObjectApi>) -> Self {
        self.local = Some(api);
        self
    }

    /// How peers are connected to.
    pub fn connector(mut self, connector: Arc<dyn PeerConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Where phase transitions are reported.
    pub fn reporter(mut self, reporter: Arc<dyn PhaseReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Validate the configuration, start the reconciler and register the
    /// configured resource types.
    pub async fn start(self) -> ReplicatorResult<ReplicationEngine> {
        self.config.check()?;
        let local = self
            .local
            .ok_or_else(|| ReplicatorError::InvalidConfig("local object API is required".into()))?;
        let connector = self
            .connector
            .ok_or_else(|| ReplicatorError::InvalidConfig("peer connector is required".into()))?;

        let (commands, rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(EngineContext {
            retry: RetryPolicy::from(&self.config.retry),
            config: self.config,
            local,
            registry: ResourceTypeRegistry::new(),
            peers: EndpointRegistry::new(),
            watches: WatchTable::new(),
            conditions: ReplicationConditions::new(),
            outboxes: Outboxes::default(),
            commands,
        });

        let reconciler = PeeringReconciler::new(ctx.clone(), connector, self.reporter, rx);
        let task = tokio::spawn(reconciler.run());
        let engine = ReplicationEngine {
            ctx,
            task: Arc::new(Mutex::new(Some(task))),
        };

        for rt in engine.ctx.config.resources.clone() {
            engine.register_type(rt).await?;
        }

        info!(
            cluster = %engine.cluster_id(),
            types = engine.ctx.registry.len(),
            "Replication engine started"
        );
        Ok(engine)
    }
}

impl ReplicationEngine {
    /// Start building an engine.
    pub fn builder(config: ReplicatorConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            local: None,
            connector: None,
            reporter: None,
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> ReconcilerCommand,
    ) -> ReplicatorResult<T> {
        let (reply, rx) = oneshot::channel();
        self.ctx
            .commands
            .send(command(reply))
            .map_err(|_| ReplicatorError::Cancelled)?;
        rx.await.map_err(|_| ReplicatorError::Cancelled)
    }

    /// Make a type eligible. Returns `false` if it already was.
    pub async fn register_type(&self, descriptor: ResourceTypeDescriptor) -> ReplicatorResult<bool> {
        self.request(|reply| ReconcilerCommand::RegisterType { descriptor, reply })
            .await?
    }

    /// Cancel every watch of a type, then make it ineligible. Unknown types
    /// are a no-op returning `false`.
    pub async fn unregister_type(&self, descriptor: &ResourceTypeDescriptor) -> ReplicatorResult<bool> {
        let descriptor = descriptor.clone();
        self.request(|reply| ReconcilerCommand::UnregisterType { descriptor, reply })
            .await
    }

    /// Registered types.
    pub fn registered_types(&self) -> Vec<ResourceTypeDescriptor> {
        self.ctx.registry.list_registered()
    }

    /// Create, update or disable a peering. Returns the resulting phase, or
    /// `None` when the peering is not desired.
    pub async fn apply_peering(&self, descriptor: PeeringDescriptor) -> ReplicatorResult<Option<PeerPhase>> {
        self.request(|reply| ReconcilerCommand::ApplyPeering { descriptor, reply })
            .await?
    }

    /// Tear a peering down. Once this returns, no write to or from the peer
    /// is in flight. Returns `false` for an unknown peer.
    pub async fn remove_peering(&self, cluster_id: &str) -> ReplicatorResult<bool> {
        let cluster_id = cluster_id.to_string();
        self.request(|reply| ReconcilerCommand::RemovePeering { cluster_id, reply })
            .await
    }

    /// Phase of a peer, `None` if absent.
    pub fn peer_phase(&self, cluster_id: &str) -> Option<PeerPhase> {
        self.ctx.peers.phase(cluster_id)
    }

    /// Every known peer.
    pub fn peers(&self) -> Vec<PeerSummary> {
        self.ctx.peers.summaries()
    }

    /// Outstanding per-object failures.
    pub fn conditions(&self) -> Vec<ReplicationCondition> {
        self.ctx.conditions.list()
    }

    /// Keys of every live subscription.
    pub fn active_watches(&self) -> Vec<WatchKey> {
        self.ctx.watches.keys()
    }

    /// Identifier of the local cluster.
    pub fn cluster_id(&self) -> &str {
        self.ctx.cluster_id()
    }

    /// Engine configuration.
    pub fn config(&self) -> &ReplicatorConfig {
        &self.ctx.config
    }

    /// Cancel every subscription, release every peer handle and stop the
    /// reconciler. Later calls fail with [`ReplicatorError::Cancelled`].
    pub async fn shutdown(&self) {
        let _ = self
            .request(|reply| ReconcilerCommand::Shutdown { reply })
            .await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::StaticPeerConnector;
    use crate::store::MemoryObjectApi;

    fn config() -> ReplicatorConfig {
        ReplicatorConfig::builder().cluster_id("cluster-1").build()
    }

    #[tokio::test]
    async fn start_requires_local_api() {
        let result = ReplicationEngine::builder(config())
            .connector(Arc::new(StaticPeerConnector::new()))
            .start()
            .await;
        assert!(matches!(result, Err(ReplicatorError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn calls_after_shutdown_are_cancelled() {
        let engine = ReplicationEngine::builder(config())
            .local(Arc::new(MemoryObjectApi::new("cluster-1")))
            .connector(Arc::new(StaticPeerConnector::new()))
            .start()
            .await
            .unwrap();

        engine.shutdown().await;
        let err = engine
            .apply_peering(PeeringDescriptor::new("cluster-2"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicatorError::Cancelled));
    }

    #[tokio::test]
    async fn rejects_peering_with_itself() {
        let engine = ReplicationEngine::builder(config())
            .local(Arc::new(MemoryObjectApi::new("cluster-1")))
            .connector(Arc::new(StaticPeerConnector::new()))
            .start()
            .await
            .unwrap();

        let err = engine
            .apply_peering(PeeringDescriptor::new("cluster-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicatorError::InvalidConfig(_)));
        assert!(engine.peers().is_empty());
        engine.shutdown().await;
    }
}
