//! Local Watch Manager.
//!
//! One watch per registered type follows the local replication sources and
//! routes [`MirrorOp`]s to per-(peer, type) outbound writers. Each writer is
//! the only component that writes mirrors of its type to its peer, so a slow
//! or failing peer only delays its own queue.

use super::{EngineContext, MirrorOp, Outbox};
use crate::conditions::ConditionReason;
use crate::error::{ErrorClass, ReplicatorError};
use crate::object::{
    ObjectKey, build_mirror, destination, destination_selector, is_local_origin, is_mirror_of,
    local_origin_selector, mirror_selector, mirror_update,
};
use crate::peer::RemoteEndpoint;
use crate::resource::ResourceTypeDescriptor;
use crate::retry::{retry, with_timeout};
use crate::store::WatchEvent;
use crate::watch::CancelSignal;
use futures::StreamExt;
use kube::api::DynamicObject;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Follow local sources of one type until cancelled.
///
/// The watch is re-established with backoff when it fails. Every resync
/// interval the sources are re-listed and re-routed, and every writer of the
/// type is asked to prune orphaned mirrors.
pub async fn run_local_watch(
    ctx: Arc<EngineContext>,
    rt: ResourceTypeDescriptor,
    cancel: CancelSignal,
) {
    let selector = local_origin_selector();
    let period = ctx.config.resync_interval();
    let mut resync = tokio::time::interval_at(Instant::now() + period, period);
    resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut router = Router::new(ctx.clone(), rt.clone());
    let mut failures = 0u32;

    info!(kind = %rt, namespace = ?ctx.namespace(), "Local watch started");

    loop {
        let mut events = ctx.local.watch(&rt, ctx.namespace(), &selector);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(kind = %rt, "Local watch cancelled");
                    return;
                }
                _ = resync.tick() => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        _ = router.resync() => {}
                    }
                }
                event = events.next() => match event {
                    Some(Ok(WatchEvent::Applied(obj))) => {
                        failures = 0;
                        router.applied(&obj);
                    }
                    Some(Ok(WatchEvent::Deleted(obj))) => router.deleted(&obj),
                    Some(Ok(WatchEvent::Ready)) => {
                        failures = 0;
                        debug!(kind = %rt, tracked = router.placements.len(), "Local watch synced");
                    }
                    Some(Err(e)) => {
                        failures += 1;
                        warn!(kind = %rt, error = %e, failures, "Local watch failed");
                        break;
                    }
                    None => {
                        debug!(kind = %rt, "Local watch stream ended");
                        break;
                    }
                },
            }
        }

        let delay = ctx.retry.backoff(failures.max(1));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Turns local events into mirror operations.
struct Router {
    ctx: Arc<EngineContext>,
    rt: ResourceTypeDescriptor,
    resource: String,
    /// Last destination seen per source, so retargets and deletes reach the
    /// previous peer.
    placements: HashMap<ObjectKey, String>,
    /// Peers skipped by the running resync pass because their writer has not
    /// finished the previous one.
    busy: HashSet<String>,
}

impl Router {
    fn new(ctx: Arc<EngineContext>, rt: ResourceTypeDescriptor) -> Self {
        Self {
            resource: rt.id(),
            ctx,
            rt,
            placements: HashMap::new(),
            busy: HashSet::new(),
        }
    }

    fn send(&self, cluster_id: &str, op: MirrorOp) {
        if !self.ctx.outboxes.send(cluster_id, &self.resource, op) {
            debug!(
                kind = %self.rt,
                cluster = %cluster_id,
                "Peer not active; backfill will catch up"
            );
        }
    }

    fn applied(&mut self, obj: &DynamicObject) {
        let key = match ObjectKey::of(&self.rt, obj) {
            Ok(key) => key,
            Err(e) => {
                warn!(kind = %self.rt, error = %e, "Skipping unaddressable object");
                return;
            }
        };
        if !is_local_origin(obj) {
            return;
        }

        let target = match destination(&self.rt, obj, self.ctx.cluster_id()) {
            Ok(target) => {
                self.ctx.conditions.clear_reason(
                    &self.resource,
                    &key,
                    None,
                    ConditionReason::MalformedMarker,
                );
                target
            }
            Err(e) => {
                warn!(kind = %self.rt, name = %key, error = %e, "Malformed destination marker");
                self.ctx.conditions.record(
                    &self.resource,
                    &key,
                    None,
                    ConditionReason::MalformedMarker,
                    e.to_string(),
                );
                None
            }
        };

        let previous = match &target {
            Some(cluster) => self.placements.insert(key.clone(), cluster.clone()),
            None => self.placements.remove(&key),
        };
        if let Some(previous) = previous.filter(|p| Some(p) != target.as_ref()) {
            info!(
                kind = %self.rt,
                name = %key,
                from = %previous,
                to = ?target,
                "Source retargeted, removing previous mirror"
            );
            self.send(&previous, MirrorOp::Delete(key.clone()));
        }

        let Some(target) = target else {
            debug!(kind = %self.rt, name = %key, "No destination yet");
            return;
        };
        if self.busy.contains(&target) {
            return;
        }
        match build_mirror(&self.rt, obj, self.ctx.cluster_id()) {
            Ok(mirror) => self.send(&target, MirrorOp::Upsert { key, mirror }),
            Err(e) => warn!(kind = %self.rt, name = %key, error = %e, "Cannot build mirror"),
        }
    }

    fn deleted(&mut self, obj: &DynamicObject) {
        let Ok(key) = ObjectKey::of(&self.rt, obj) else {
            return;
        };

        let mut targets = BTreeSet::new();
        if let Some(previous) = self.placements.remove(&key) {
            targets.insert(previous);
        }
        if let Ok(Some(cluster)) = destination(&self.rt, obj, self.ctx.cluster_id()) {
            targets.insert(cluster);
        }
        self.ctx.conditions.clear(&self.resource, &key, None);

        for cluster in targets {
            debug!(kind = %self.rt, name = %key, cluster = %cluster, "Source deleted");
            self.send(&cluster, MirrorOp::Delete(key.clone()));
        }
    }

    async fn resync(&mut self) {
        let listed = with_timeout(
            self.ctx.config.call_timeout(),
            "list",
            self.ctx
                .local
                .list(&self.rt, self.ctx.namespace(), &local_origin_selector()),
        )
        .await;

        let sources = match listed {
            Ok(sources) => sources,
            Err(e) => {
                warn!(kind = %self.rt, error = %e, "Resync listing failed");
                return;
            }
        };

        let live: HashSet<ObjectKey> = sources
            .iter()
            .filter_map(|obj| ObjectKey::of(&self.rt, obj).ok())
            .collect();
        let missed: Vec<(ObjectKey, String)> = self
            .placements
            .iter()
            .filter(|(key, _)| !live.contains(*key))
            .map(|(key, cluster)| (key.clone(), cluster.clone()))
            .collect();
        for (key, cluster) in missed {
            self.placements.remove(&key);
            self.send(&cluster, MirrorOp::Delete(key));
        }

        self.busy = self.ctx.outboxes.busy_peers(&self.resource);
        if !self.busy.is_empty() {
            debug!(kind = %self.rt, peers = ?self.busy, "Writers still behind, skipping their resync");
        }
        for obj in &sources {
            self.applied(obj);
        }
        self.busy.clear();
        self.ctx.outboxes.prune_all(&self.resource);
        debug!(kind = %self.rt, sources = sources.len(), "Resync complete");
    }
}

/// Apply queued mirror operations of one type to one peer until cancelled.
///
/// Before draining its outbox the writer backfills every source already
/// targeting the peer and prunes orphaned mirrors.
pub async fn run_outbound(
    ctx: Arc<EngineContext>,
    endpoint: Arc<RemoteEndpoint>,
    rt: ResourceTypeDescriptor,
    outbox: Arc<Outbox>,
    cancel: CancelSignal,
) {
    let writer = Writer {
        resource: rt.id(),
        ctx,
        endpoint,
        rt,
    };
    debug!(cluster = %writer.cluster(), kind = %writer.rt, "Outbound writer started");

    tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        _ = writer.backfill() => {}
    }

    loop {
        let op = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            op = outbox.next() => op,
        };
        let Some(op) = op else { break };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = writer.apply(op) => {}
        }
    }

    debug!(cluster = %writer.cluster(), kind = %writer.rt, "Outbound writer stopped");
}

enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
    Collision,
}

struct Writer {
    ctx: Arc<EngineContext>,
    endpoint: Arc<RemoteEndpoint>,
    rt: ResourceTypeDescriptor,
    resource: String,
}

impl Writer {
    fn cluster(&self) -> &str {
        self.endpoint.cluster_id()
    }

    async fn apply(&self, op: MirrorOp) {
        match op {
            MirrorOp::Upsert { mirror, .. } => self.upsert(&mirror).await,
            MirrorOp::Delete(key) => self.delete(&key).await,
            MirrorOp::Prune => self.prune().await,
        }
    }

    async fn backfill(&self) {
        let listed = with_timeout(
            self.ctx.config.call_timeout(),
            "list",
            self.ctx.local.list(
                &self.rt,
                self.ctx.namespace(),
                &destination_selector(self.cluster()),
            ),
        )
        .await;

        match listed {
            Ok(sources) => {
                info!(
                    cluster = %self.cluster(),
                    kind = %self.rt,
                    sources = sources.len(),
                    "Backfilling peer"
                );
                for source in sources {
                    if !self.targets_peer(Some(&source)) {
                        continue;
                    }
                    match build_mirror(&self.rt, &source, self.ctx.cluster_id()) {
                        Ok(mirror) => self.upsert(&mirror).await,
                        Err(e) => warn!(kind = %self.rt, error = %e, "Cannot build mirror"),
                    }
                }
            }
            Err(e) => warn!(
                cluster = %self.cluster(),
                kind = %self.rt,
                error = %e,
                "Backfill listing failed; the next resync retries"
            ),
        }

        self.prune().await;
    }

    fn targets_peer(&self, source: Option<&DynamicObject>) -> bool {
        source.is_some_and(|s| {
            is_local_origin(s)
                && matches!(
                    destination(&self.rt, s, self.ctx.cluster_id()),
                    Ok(Some(cluster)) if cluster == self.cluster()
                )
        })
    }

    fn failed(&self, key: &ObjectKey, reason: ConditionReason, e: ReplicatorError) {
        match e.class() {
            ErrorClass::Cancelled => {
                debug!(cluster = %self.cluster(), name = %key, "Peer closed, dropping operation");
                return;
            }
            ErrorClass::PeerUnusable => {
                warn!(cluster = %self.cluster(), kind = %self.rt, name = %key, error = %e, "Peer unusable");
                self.ctx.report_unusable(&self.endpoint, e.to_string());
            }
            _ => {
                error!(
                    cluster = %self.cluster(),
                    kind = %self.rt,
                    name = %key,
                    reason = %reason,
                    error = %e,
                    "Mirror operation failed after retries"
                );
            }
        }
        self.ctx
            .conditions
            .record(&self.resource, key, Some(self.cluster()), reason, e.to_string());
    }

    async fn upsert(&self, mirror: &DynamicObject) {
        let key = match ObjectKey::of(&self.rt, mirror) {
            Ok(key) => key,
            Err(e) => {
                warn!(kind = %self.rt, error = %e, "Skipping unaddressable mirror");
                return;
            }
        };

        let key_ref = &key;
        let result = retry(
            &self.ctx.retry,
            "upsert",
            |e| e.is_transient() || e.is_conflict(),
            move || self.upsert_once(mirror, key_ref),
        )
        .await;

        match result {
            Ok(UpsertOutcome::Collision) => {
                warn!(
                    cluster = %self.cluster(),
                    kind = %self.rt,
                    name = %key,
                    "Peer holds a foreign object with this name; not replicating"
                );
                self.ctx.conditions.record(
                    &self.resource,
                    &key,
                    Some(self.cluster()),
                    ConditionReason::MirrorCollision,
                    format!("{} exists on {} and is not a mirror", key, self.cluster()),
                );
            }
            Ok(outcome) => {
                self.ctx
                    .conditions
                    .clear(&self.resource, &key, Some(self.cluster()));
                match outcome {
                    UpsertOutcome::Created => {
                        info!(cluster = %self.cluster(), kind = %self.rt, name = %key, "Mirror created")
                    }
                    UpsertOutcome::Updated => {
                        debug!(cluster = %self.cluster(), kind = %self.rt, name = %key, "Mirror updated")
                    }
                    _ => {}
                }
            }
            Err(e) => self.failed(&key, ConditionReason::UpsertFailed, e),
        }
    }

    async fn upsert_once(
        &self,
        mirror: &DynamicObject,
        key: &ObjectKey,
    ) -> Result<UpsertOutcome, ReplicatorError> {
        match self.endpoint.get(&self.rt, key).await? {
            None => {
                self.endpoint.create(&self.rt, mirror).await?;
                Ok(UpsertOutcome::Created)
            }
            Some(existing) if !is_mirror_of(&existing, self.ctx.cluster_id()) => {
                Ok(UpsertOutcome::Collision)
            }
            Some(existing) => match mirror_update(&existing, mirror) {
                None => Ok(UpsertOutcome::Unchanged),
                Some(updated) => {
                    self.endpoint.replace(&self.rt, &updated).await?;
                    Ok(UpsertOutcome::Updated)
                }
            },
        }
    }

    async fn delete(&self, key: &ObjectKey) {
        let result = retry(
            &self.ctx.retry,
            "delete",
            ReplicatorError::is_transient,
            move || self.delete_once(key),
        )
        .await;

        match result {
            Ok(deleted) => {
                self.ctx
                    .conditions
                    .clear(&self.resource, key, Some(self.cluster()));
                if deleted {
                    info!(cluster = %self.cluster(), kind = %self.rt, name = %key, "Mirror deleted");
                }
            }
            Err(e) => self.failed(key, ConditionReason::DeleteFailed, e),
        }
    }

    /// Delete our mirror. Absence and foreign objects count as done.
    async fn delete_once(&self, key: &ObjectKey) -> Result<bool, ReplicatorError> {
        match self.endpoint.get(&self.rt, key).await? {
            None => Ok(false),
            Some(existing) if !is_mirror_of(&existing, self.ctx.cluster_id()) => {
                debug!(cluster = %self.cluster(), name = %key, "Leaving foreign object in place");
                Ok(false)
            }
            Some(_) => match self.endpoint.delete(&self.rt, key).await {
                Ok(()) => Ok(true),
                Err(e) if e.is_not_found() => Ok(false),
                Err(e) => Err(e),
            },
        }
    }

    /// Delete mirrors whose source is gone or no longer targets this peer.
    async fn prune(&self) {
        let selector = mirror_selector(self.ctx.cluster_id());
        let selector = selector.as_str();
        let listed = retry(
            &self.ctx.retry,
            "list",
            ReplicatorError::is_transient,
            move || self.endpoint.list(&self.rt, self.ctx.namespace(), selector),
        )
        .await;

        let mirrors = match listed {
            Ok(mirrors) => mirrors,
            Err(e) => {
                if e.class() == ErrorClass::PeerUnusable {
                    self.ctx.report_unusable(&self.endpoint, e.to_string());
                }
                warn!(cluster = %self.cluster(), kind = %self.rt, error = %e, "Cannot list mirrors");
                return;
            }
        };

        for mirror in mirrors {
            let Ok(key) = ObjectKey::of(&self.rt, &mirror) else {
                continue;
            };
            let source = with_timeout(
                self.ctx.config.call_timeout(),
                "get",
                self.ctx.local.get(&self.rt, &key),
            )
            .await;
            match source {
                Ok(source) if self.targets_peer(source.as_ref()) => {}
                Ok(_) => {
                    info!(cluster = %self.cluster(), kind = %self.rt, name = %key, "Collecting orphaned mirror");
                    self.delete(&key).await;
                }
                Err(e) => {
                    warn!(kind = %self.rt, name = %key, error = %e, "Cannot read source of mirror");
                }
            }
        }
    }
}
