//! Remote Watch Manager.
//!
//! One watch per (peer, type) follows the mirrors this cluster created on the
//! peer and copies their status back onto the local sources. Only the status
//! subresource of the local object is ever written here.

use super::EngineContext;
use crate::conditions::ConditionReason;
use crate::error::{ErrorClass, ReplicatorResult};
use crate::object::{ObjectKey, destination, is_local_origin, merge_patch, mirror_selector, status_of};
use crate::peer::RemoteEndpoint;
use crate::resource::ResourceTypeDescriptor;
use crate::retry::with_timeout;
use crate::store::WatchEvent;
use crate::watch::CancelSignal;
use futures::StreamExt;
use kube::api::DynamicObject;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Follow our mirrors of one type on one peer until cancelled.
///
/// The peer is reported unusable on an authentication failure, or once
/// `unreachableThreshold` watch attempts in a row get no answer from it.
/// Error responses such as throttling or 503 are only retried with backoff.
/// A resync tick re-lists the mirrors so missed status changes heal.
pub async fn run_remote_watch(
    ctx: Arc<EngineContext>,
    endpoint: Arc<RemoteEndpoint>,
    rt: ResourceTypeDescriptor,
    cancel: CancelSignal,
) {
    let selector = mirror_selector(ctx.cluster_id());
    let cluster = endpoint.cluster_id().to_string();
    let period = ctx.config.resync_interval();
    let mut resync = tokio::time::interval_at(Instant::now() + period, period);
    resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures = 0u32;
    let mut unanswered = 0u32;

    info!(cluster = %cluster, kind = %rt, "Remote watch started");

    loop {
        let mut events = endpoint.watch(&rt, ctx.namespace(), &selector);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(cluster = %cluster, kind = %rt, "Remote watch cancelled");
                    return;
                }
                _ = resync.tick() => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        _ = resync_statuses(&ctx, &endpoint, &rt, &selector) => {}
                    }
                }
                event = events.next() => match event {
                    Some(Ok(WatchEvent::Applied(mirror))) => {
                        failures = 0;
                        unanswered = 0;
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return,
                            _ = sync_status(&ctx, &endpoint, &rt, &mirror) => {}
                        }
                    }
                    Some(Ok(WatchEvent::Deleted(mirror))) => {
                        // Absence never propagates towards the source.
                        debug!(
                            cluster = %cluster,
                            kind = %rt,
                            name = ?mirror.metadata.name,
                            "Mirror deleted on peer"
                        );
                    }
                    Some(Ok(WatchEvent::Ready)) => {
                        failures = 0;
                        unanswered = 0;
                        debug!(cluster = %cluster, kind = %rt, "Remote watch synced");
                    }
                    Some(Err(e)) => {
                        failures += 1;
                        if e.is_unreachable() {
                            unanswered += 1;
                        }
                        warn!(
                            cluster = %cluster,
                            kind = %rt,
                            error = %e,
                            failures,
                            unanswered,
                            "Remote watch failed"
                        );
                        if e.class() == ErrorClass::PeerUnusable
                            || unanswered >= ctx.config.unreachable_threshold
                        {
                            ctx.report_unusable(&endpoint, e.to_string());
                        }
                        break;
                    }
                    None => {
                        debug!(cluster = %cluster, kind = %rt, "Remote watch stream ended");
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

async fn resync_statuses(
    ctx: &EngineContext,
    endpoint: &RemoteEndpoint,
    rt: &ResourceTypeDescriptor,
    selector: &str,
) {
    match endpoint.list(rt, ctx.namespace(), selector).await {
        Ok(mirrors) => {
            for mirror in &mirrors {
                sync_status(ctx, endpoint, rt, mirror).await;
            }
        }
        Err(e) => warn!(
            cluster = %endpoint.cluster_id(),
            kind = %rt,
            error = %e,
            "Cannot list mirrors for status resync"
        ),
    }
}

/// Copy a mirror's status onto its local source.
async fn sync_status(
    ctx: &EngineContext,
    endpoint: &RemoteEndpoint,
    rt: &ResourceTypeDescriptor,
    mirror: &DynamicObject,
) {
    // A mirror without status never clears the local one.
    let Some(remote_status) = status_of(mirror) else {
        return;
    };
    let key = match ObjectKey::of(rt, mirror) {
        Ok(key) => key,
        Err(e) => {
            warn!(kind = %rt, error = %e, "Skipping unaddressable mirror");
            return;
        }
    };

    let cluster = endpoint.cluster_id();
    let resource = rt.id();
    let local = ctx.local.as_ref();
    let local_id = ctx.cluster_id();
    let timeout = ctx.config.call_timeout();
    let key_ref = &key;

    let result = retry_on_conflict(
        ctx.config.status_retry.max_attempts,
        Duration::from_millis(ctx.config.status_retry.backoff_ms),
        move || with_timeout(timeout, "get", local.get(rt, key_ref)),
        |current: Option<DynamicObject>| {
            status_write(rt, current, key_ref, cluster, local_id, remote_status)
        },
        move |(resource_version, patch): (String, Value)| async move {
            with_timeout(
                timeout,
                "patch_status",
                local.patch_status(rt, key_ref, &resource_version, &patch),
            )
            .await
            .map(|_| ())
        },
    )
    .await;

    match result {
        Ok(true) => {
            ctx.conditions.clear_reason(
                &resource,
                &key,
                Some(cluster),
                ConditionReason::StatusSyncFailed,
            );
            debug!(cluster = %cluster, kind = %rt, name = %key, "Status pulled back");
        }
        Ok(false) => {}
        Err(e) if e.class() == ErrorClass::Cancelled => {}
        Err(e) => {
            warn!(
                cluster = %cluster,
                kind = %rt,
                name = %key,
                error = %e,
                "Status write failed after retries"
            );
            ctx.conditions.record(
                &resource,
                &key,
                Some(cluster),
                ConditionReason::StatusSyncFailed,
                e.to_string(),
            );
        }
    }
}

/// Decide the status write for the current local object: its resource
/// version and a merge patch, or `None` when nothing should be written.
fn status_write(
    rt: &ResourceTypeDescriptor,
    local: Option<DynamicObject>,
    key: &ObjectKey,
    cluster: &str,
    local_id: &str,
    remote_status: &Value,
) -> Option<(String, Value)> {
    let Some(local) = local else {
        debug!(kind = %rt, name = %key, "Source gone, dropping mirror status");
        return None;
    };
    let targets_peer = is_local_origin(&local)
        && matches!(destination(rt, &local, local_id), Ok(Some(d)) if d == cluster);
    if !targets_peer {
        debug!(kind = %rt, name = %key, cluster = %cluster, "Source no longer targets this peer");
        return None;
    }

    let current = status_of(&local);
    if current == Some(remote_status) {
        return None;
    }
    let resource_version = local.metadata.resource_version.clone()?;
    Some((resource_version, merge_patch(current, remote_status)))
}

/// Bounded read-modify-write loop.
///
/// `read` fetches the current state, `mutate` derives the write from it (or
/// `None` when nothing needs writing) and `write` applies it. A conflict or a
/// transient failure restarts from `read` after a fixed `backoff`, up to
/// `attempts` times; the last error is returned. `Ok(true)` means a write
/// happened.
async fn retry_on_conflict<I, O, R, RFut, W, WFut>(
    attempts: u32,
    backoff: Duration,
    mut read: R,
    mutate: impl Fn(I) -> Option<O>,
    mut write: W,
) -> ReplicatorResult<bool>
where
    R: FnMut() -> RFut,
    RFut: Future<Output = ReplicatorResult<I>>,
    W: FnMut(O) -> WFut,
    WFut: Future<Output = ReplicatorResult<()>>,
{
    let mut attempt = 1;
    loop {
        let outcome = match read().await {
            Ok(current) => match mutate(current) {
                Some(next) => write(next).await.map(|()| true),
                None => return Ok(false),
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok(written) => return Ok(written),
            Err(e) if attempt < attempts && (e.is_conflict() || e.is_transient()) => {
                debug!(attempt, error = %e, "Status write raced, retrying");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
