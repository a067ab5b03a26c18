//! Peering Lifecycle Reconciler.
//!
//! A single serialized loop owns every peer state transition and is the only
//! place that starts or cancels subscriptions. Commands arrive on one channel
//! from the engine API, the descriptor watcher, workers reporting an unusable
//! peer and reconnect timers, so an add and a remove of the same peer are
//! applied strictly one after the other.

use super::{EngineContext, local, remote};
use crate::connector::PeerConnector;
use crate::crd::PeerCluster;
use crate::engine::ReplicationEngine;
use crate::error::{ErrorClass, ReplicatorError, ReplicatorResult};
use crate::peer::{PeerPhase, PeeringDescriptor, RemoteEndpoint};
use crate::resource::ResourceTypeDescriptor;
use crate::retry::with_timeout;
use crate::store::ApiFuture;
use crate::watch::{WatchKey, WatchScope};
use futures::StreamExt;
use kube::api::{Patch, PatchParams};
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher::{self, Config, watcher};
use kube::{Api, Client, ResourceExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Requests handled by the reconciler loop.
#[derive(Debug)]
pub enum ReconcilerCommand {
    /// Create, update or disable a peering.
    ApplyPeering {
        /// Desired peering.
        descriptor: PeeringDescriptor,
        /// Resulting phase.
        reply: oneshot::Sender<ReplicatorResult<Option<PeerPhase>>>,
    },
    /// Tear a peering down and forget it.
    RemovePeering {
        /// Peer identifier.
        cluster_id: String,
        /// Whether the peer existed.
        reply: oneshot::Sender<bool>,
    },
    /// A worker saw the peer's handle fail.
    PeerUnusable {
        /// Handle that failed.
        endpoint: Arc<RemoteEndpoint>,
        /// What failed.
        reason: String,
    },
    /// Reconnect timer of a Degraded peer fired.
    Reconnect {
        /// Peer identifier.
        cluster_id: String,
    },
    /// Make a type eligible for replication.
    RegisterType {
        /// Kind to register.
        descriptor: ResourceTypeDescriptor,
        /// Whether the kind was new.
        reply: oneshot::Sender<ReplicatorResult<bool>>,
    },
    /// Cancel every watch of a type, then make it ineligible.
    UnregisterType {
        /// Kind to unregister.
        descriptor: ResourceTypeDescriptor,
        /// Whether the kind was registered.
        reply: oneshot::Sender<bool>,
    },
    /// Cancel everything and stop the loop.
    Shutdown {
        /// Signalled once everything is stopped.
        reply: oneshot::Sender<()>,
    },
}

/// A phase transition, as reported back to the peering descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseReport {
    /// Descriptor object name.
    pub descriptor: String,
    /// Peer identifier.
    pub cluster_id: String,
    /// New phase.
    pub phase: PeerPhase,
    /// Reason for the transition, if any.
    pub message: Option<String>,
    /// Outbound and remote subscriptions open against the peer.
    pub active_watches: u32,
}

/// Sink for phase transitions. Reporting is best effort.
pub trait PhaseReporter: Send + Sync {
    /// Publish one transition.
    fn report<'a>(&'a self, report: &'a PhaseReport) -> ApiFuture<'a, ()>;
}

/// Patches transitions into the status of `PeerCluster` objects.
#[derive(Clone)]
pub struct KubePhaseReporter {
    client: Client,
    namespace: String,
}

impl KubePhaseReporter {
    /// Report into descriptors of `namespace`.
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

impl PhaseReporter for KubePhaseReporter {
    fn report<'a>(&'a self, report: &'a PhaseReport) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            let api: Api<PeerCluster> = Api::namespaced(self.client.clone(), &self.namespace);
            let patch = serde_json::json!({
                "status": {
                    "phase": report.phase,
                    "message": report.message,
                    "lastTransitionTime": chrono::Utc::now().to_rfc3339(),
                    "activeWatches": report.active_watches,
                }
            });

            match api
                .patch_status(&report.descriptor, &PatchParams::default(), &Patch::Merge(&patch))
                .await
            {
                Ok(_) => Ok(()),
                Err(kube::Error::Api(err)) if err.code == 404 => {
                    debug!(descriptor = %report.descriptor, "Descriptor gone, status not reported");
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        })
    }
}

/// The reconciler loop. Construct with [`PeeringReconciler::new`] and drive
/// with [`PeeringReconciler::run`].
pub struct PeeringReconciler {
    ctx: Arc<EngineContext>,
    connector: Arc<dyn PeerConnector>,
    reporter: Option<Arc<dyn PhaseReporter>>,
    commands: mpsc::UnboundedReceiver<ReconcilerCommand>,
}

impl PeeringReconciler {
    /// Create a reconciler reading from `commands`.
    pub fn new(
        ctx: Arc<EngineContext>,
        connector: Arc<dyn PeerConnector>,
        reporter: Option<Arc<dyn PhaseReporter>>,
        commands: mpsc::UnboundedReceiver<ReconcilerCommand>,
    ) -> Self {
        Self {
            ctx,
            connector,
            reporter,
            commands,
        }
    }

    /// Process commands until shutdown.
    pub async fn run(mut self) {
        info!(cluster = %self.ctx.cluster_id(), "Peering reconciler started");

        while let Some(command) = self.commands.recv().await {
            match command {
                ReconcilerCommand::ApplyPeering { descriptor, reply } => {
                    let result = self.apply(descriptor).await;
                    let _ = reply.send(result);
                }
                ReconcilerCommand::RemovePeering { cluster_id, reply } => {
                    let removed = self.teardown(&cluster_id).await;
                    let _ = reply.send(removed);
                }
                ReconcilerCommand::PeerUnusable { endpoint, reason } => {
                    self.degrade(&endpoint, reason).await;
                }
                ReconcilerCommand::Reconnect { cluster_id } => {
                    self.reconnect(&cluster_id).await;
                }
                ReconcilerCommand::RegisterType { descriptor, reply } => {
                    let result = self.register_type(descriptor);
                    let _ = reply.send(result);
                }
                ReconcilerCommand::UnregisterType { descriptor, reply } => {
                    let removed = self.unregister_type(&descriptor).await;
                    let _ = reply.send(removed);
                }
                ReconcilerCommand::Shutdown { reply } => {
                    self.shutdown().await;
                    let _ = reply.send(());
                    break;
                }
            }
        }

        info!(cluster = %self.ctx.cluster_id(), "Peering reconciler stopped");
    }

    async fn apply(&self, descriptor: PeeringDescriptor) -> ReplicatorResult<Option<PeerPhase>> {
        let cluster_id = descriptor.cluster_id.clone();
        if cluster_id.is_empty() {
            return Err(ReplicatorError::InvalidConfig(format!(
                "peering {} has no cluster id",
                descriptor.name
            )));
        }
        if cluster_id == self.ctx.cluster_id() {
            return Err(ReplicatorError::InvalidConfig(format!(
                "peering {} names the local cluster",
                descriptor.name
            )));
        }

        if !descriptor.desired {
            if self.teardown(&cluster_id).await {
                info!(cluster = %cluster_id, "Peering disabled");
            }
            self.report(&descriptor, PeerPhase::Pending, Some("peering not desired".into()))
                .await;
            return Ok(None);
        }

        match self.ctx.peers.descriptor(&cluster_id) {
            Some(current) if current.endpoint_changed(&descriptor) => {
                info!(cluster = %cluster_id, "Peer endpoint changed, reconnecting");
                self.teardown(&cluster_id).await;
            }
            Some(_) => {
                self.ctx.peers.upsert(descriptor);
                return Ok(self.ctx.peers.phase(&cluster_id));
            }
            None => {}
        }

        self.ctx.peers.upsert(descriptor.clone());
        self.report(&descriptor, PeerPhase::Pending, None).await;
        Ok(Some(self.activate(&descriptor).await))
    }

    async fn activate(&self, descriptor: &PeeringDescriptor) -> PeerPhase {
        let cluster_id = &descriptor.cluster_id;
        let connected = with_timeout(
            self.ctx.config.call_timeout(),
            "connect",
            self.connector.connect(descriptor),
        )
        .await;

        let api = match connected {
            Ok(api) => api,
            Err(e) => {
                warn!(cluster = %cluster_id, error = %e, "Peer unusable");
                self.enter_degraded(descriptor, e.to_string()).await;
                return PeerPhase::Degraded;
            }
        };

        let endpoint = Arc::new(RemoteEndpoint::new(
            cluster_id.clone(),
            api,
            self.ctx.config.call_timeout(),
        ));
        if !self.ctx.peers.activate(cluster_id, endpoint.clone()) {
            endpoint.close().await;
            return PeerPhase::Pending;
        }

        for rt in self.ctx.registry.list_registered() {
            self.start_peer_watches(&endpoint, &rt);
        }

        info!(cluster = %cluster_id, "Peer active");
        self.report(descriptor, PeerPhase::Active, None).await;
        PeerPhase::Active
    }

    async fn enter_degraded(&self, descriptor: &PeeringDescriptor, reason: String) {
        let cluster_id = descriptor.cluster_id.clone();
        if !self
            .ctx
            .peers
            .set_phase(&cluster_id, PeerPhase::Degraded, Some(reason.clone()))
        {
            return;
        }

        let delay = self.ctx.config.degraded_retry();
        let commands = self.ctx.commands.clone();
        let id = cluster_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(ReconcilerCommand::Reconnect { cluster_id: id });
        });
        self.ctx.peers.set_reconnect(&cluster_id, timer.abort_handle());

        debug!(cluster = %cluster_id, retry_in = ?delay, "Reconnect armed");
        self.report(descriptor, PeerPhase::Degraded, Some(reason)).await;
    }

    fn start_peer_watches(&self, endpoint: &Arc<RemoteEndpoint>, rt: &ResourceTypeDescriptor) {
        let cluster_id = endpoint.cluster_id();
        let resource = rt.id();

        let outbound = WatchKey::new(WatchScope::Outbound, cluster_id, &resource);
        if !self.ctx.watches.is_active(&outbound) {
            let outbox = self.ctx.outboxes.open(cluster_id, &resource);
            let (ctx, peer, kind) = (self.ctx.clone(), endpoint.clone(), rt.clone());
            let started = self.ctx.watches.start(outbound, move |cancel| {
                local::run_outbound(ctx, peer, kind, outbox, cancel)
            });
            if let Err(e) = started {
                error!(cluster = %cluster_id, kind = %rt, error = %e, "Outbound writer not started");
            }
        }

        let inbound = WatchKey::new(WatchScope::Remote, cluster_id, &resource);
        if !self.ctx.watches.is_active(&inbound) {
            let (ctx, peer, kind) = (self.ctx.clone(), endpoint.clone(), rt.clone());
            let started = self.ctx.watches.start(inbound, move |cancel| {
                remote::run_remote_watch(ctx, peer, kind, cancel)
            });
            if let Err(e) = started {
                error!(cluster = %cluster_id, kind = %rt, error = %e, "Remote watch not started");
            }
        }
    }

    /// Cancel every subscription of a peer and release its handle. Returns
    /// once no worker can touch the peer any more.
    async fn stop_peer(&self, cluster_id: &str) -> usize {
        let cancelled = self
            .ctx
            .watches
            .cancel_where(|key| key.scope != WatchScope::Local && key.endpoint == cluster_id)
            .await;
        self.ctx.outboxes.close_cluster(cluster_id);
        if let Some(endpoint) = self.ctx.peers.take_endpoint(cluster_id) {
            endpoint.close().await;
        }
        cancelled
    }

    async fn degrade(&self, endpoint: &Arc<RemoteEndpoint>, reason: String) {
        let cluster_id = endpoint.cluster_id().to_string();
        let current = self.ctx.peers.active(&cluster_id);
        if !current.is_some_and(|active| Arc::ptr_eq(&active, endpoint)) {
            debug!(cluster = %cluster_id, "Ignoring report for a replaced handle");
            return;
        }

        warn!(cluster = %cluster_id, reason = %reason, "Peer degraded");
        let cancelled = self.stop_peer(&cluster_id).await;
        debug!(cluster = %cluster_id, cancelled, "Peer watches cancelled");

        if let Some(descriptor) = self.ctx.peers.descriptor(&cluster_id) {
            self.enter_degraded(&descriptor, reason).await;
        }
    }

    async fn reconnect(&self, cluster_id: &str) {
        if self.ctx.peers.phase(cluster_id) != Some(PeerPhase::Degraded) {
            return;
        }
        let Some(descriptor) = self.ctx.peers.descriptor(cluster_id) else {
            return;
        };
        info!(cluster = %cluster_id, "Reconnecting to peer");
        self.activate(&descriptor).await;
    }

    async fn teardown(&self, cluster_id: &str) -> bool {
        let Some(descriptor) = self.ctx.peers.descriptor(cluster_id) else {
            return false;
        };

        self.ctx
            .peers
            .set_phase(cluster_id, PeerPhase::TearingDown, None);
        self.report(&descriptor, PeerPhase::TearingDown, None).await;

        let cancelled = self.stop_peer(cluster_id).await;
        if let Some(endpoint) = self.ctx.peers.remove(cluster_id) {
            endpoint.close().await;
        }
        self.ctx.conditions.clear_cluster(cluster_id);

        info!(cluster = %cluster_id, cancelled, "Peer removed");
        true
    }

    fn register_type(&self, rt: ResourceTypeDescriptor) -> ReplicatorResult<bool> {
        rt.validate().map_err(ReplicatorError::InvalidConfig)?;
        if !self.ctx.registry.register(rt.clone()) {
            return Ok(false);
        }

        let resource = rt.id();
        for endpoint in self.ctx.peers.active_endpoints() {
            self.start_peer_watches(&endpoint, &rt);
        }

        let key = WatchKey::new(WatchScope::Local, self.ctx.cluster_id(), &resource);
        let (ctx, local_rt) = (self.ctx.clone(), rt.clone());
        self.ctx
            .watches
            .start(key, move |cancel| local::run_local_watch(ctx, local_rt, cancel))?;

        info!(kind = %rt, "Resource type registered");
        Ok(true)
    }

    async fn unregister_type(&self, rt: &ResourceTypeDescriptor) -> bool {
        let resource = rt.id();
        if !self.ctx.registry.is_registered(rt) {
            return false;
        }

        let cancelled = self
            .ctx
            .watches
            .cancel_where(|key| key.resource == resource)
            .await;
        self.ctx.outboxes.close_resource(&resource);
        self.ctx.registry.remove(rt);
        self.ctx.conditions.clear_resource(&resource);

        info!(kind = %rt, cancelled, "Resource type unregistered");
        true
    }

    async fn shutdown(&self) {
        let cancelled = self.ctx.watches.cancel_all().await;
        for cluster_id in self.ctx.peers.cluster_ids() {
            if let Some(endpoint) = self.ctx.peers.remove(&cluster_id) {
                endpoint.close().await;
            }
        }
        self.ctx.outboxes.clear();
        info!(cancelled, "Replication stopped");
    }

    async fn report(&self, descriptor: &PeeringDescriptor, phase: PeerPhase, message: Option<String>) {
        let Some(reporter) = &self.reporter else {
            return;
        };
        let cluster_id = descriptor.cluster_id.as_str();
        let active_watches = self
            .ctx
            .watches
            .keys()
            .iter()
            .filter(|key| key.scope != WatchScope::Local && key.endpoint == cluster_id)
            .count() as u32;
        let report = PhaseReport {
            descriptor: descriptor.name.clone(),
            cluster_id: cluster_id.to_string(),
            phase,
            message,
            active_watches,
        };

        let result = with_timeout(self.ctx.config.call_timeout(), "report", reporter.report(&report)).await;
        if let Err(e) = result {
            warn!(cluster = %cluster_id, phase = %phase, error = %e, "Failed to report peer phase");
        }
    }
}

/// Cluster each `PeerCluster` descriptor currently names, by descriptor name.
///
/// An edited `clusterId` leaves the old cluster without a descriptor, which
/// counts as removal unless another descriptor still names it.
#[derive(Debug, Default)]
pub struct DescriptorIndex {
    clusters: HashMap<String, String>,
}

impl DescriptorIndex {
    /// Record that descriptor `name` names `cluster_id`. Returns the cluster
    /// the descriptor named before if no descriptor names it anymore.
    pub fn observe(&mut self, name: &str, cluster_id: &str) -> Option<String> {
        let previous = self
            .clusters
            .insert(name.to_string(), cluster_id.to_string())?;
        (previous != cluster_id && !self.names(&previous)).then_some(previous)
    }

    /// Forget descriptor `name`. Returns the cluster it named if no other
    /// descriptor names it.
    pub fn forget(&mut self, name: &str, cluster_id: &str) -> Option<String> {
        let named = self
            .clusters
            .remove(name)
            .unwrap_or_else(|| cluster_id.to_string());
        (!self.names(&named)).then_some(named)
    }

    /// Whether any descriptor names `cluster_id`.
    pub fn names(&self, cluster_id: &str) -> bool {
        self.clusters.values().any(|c| c == cluster_id)
    }

    /// Forget every descriptor.
    pub fn clear(&mut self) {
        self.clusters.clear();
    }
}

/// Feed `PeerCluster` descriptors of `namespace` into the engine.
///
/// Descriptors deleted while the watch was down are removed once the initial
/// listing completes.
pub async fn watch_peer_clusters(
    client: Client,
    namespace: String,
    engine: ReplicationEngine,
) -> ReplicatorResult<()> {
    let api: Api<PeerCluster> = Api::namespaced(client, &namespace);
    let mut stream = watcher(api, Config::default()).default_backoff().boxed();
    let mut index = DescriptorIndex::default();

    info!(namespace = %namespace, "PeerCluster watcher started");

    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Apply(pc)) | Ok(watcher::Event::InitApply(pc)) => {
                if let Some(stale) = index.observe(&pc.name_any(), &pc.spec.cluster_id) {
                    info!(
                        cluster = %stale,
                        now = %pc.spec.cluster_id,
                        "PeerCluster retargeted, removing previous peer"
                    );
                    engine.remove_peering(&stale).await?;
                }
                apply_descriptor(&engine, &pc).await?;
            }
            Ok(watcher::Event::Delete(pc)) => {
                let Some(cluster_id) = index.forget(&pc.name_any(), &pc.spec.cluster_id) else {
                    debug!(cluster = %pc.spec.cluster_id, "Deleted PeerCluster shares its cluster");
                    continue;
                };
                if engine.remove_peering(&cluster_id).await? {
                    info!(cluster = %cluster_id, "PeerCluster deleted");
                }
            }
            Ok(watcher::Event::Init) => {
                index.clear();
            }
            Ok(watcher::Event::InitDone) => {
                for summary in engine.peers() {
                    if !index.names(&summary.cluster_id) {
                        info!(cluster = %summary.cluster_id, "PeerCluster vanished while unwatched");
                        engine.remove_peering(&summary.cluster_id).await?;
                    }
                }
                debug!("PeerCluster watcher initialization complete");
            }
            Err(e) => {
                error!(error = %e, "PeerCluster watch error");
            }
        }
    }

    warn!("PeerCluster watcher stream ended");
    Ok(())
}

async fn apply_descriptor(engine: &ReplicationEngine, pc: &PeerCluster) -> ReplicatorResult<()> {
    let descriptor = PeeringDescriptor::from(pc);
    match engine.apply_peering(descriptor).await {
        Ok(phase) => {
            debug!(cluster = %pc.spec.cluster_id, phase = ?phase, "PeerCluster applied");
            Ok(())
        }
        Err(e) if e.class() == ErrorClass::Cancelled => Err(e),
        Err(e) => {
            warn!(cluster = %pc.spec.cluster_id, error = %e, "PeerCluster rejected");
            Ok(())
        }
    }
}
