//! In-memory object API.
//!
//! Behaves like a single API server for the operations the engine uses:
//! resource versions are bumped on every write, stale writes conflict, status
//! is only writable through [`ObjectApi::patch_status`], and every change is
//! fanned out to open watches in write order. Faults and latency can be
//! injected to simulate broken or slow peers.

use super::{ApiFuture, EventStream, ObjectApi, WatchEvent};
use crate::error::{ReplicatorError, ReplicatorResult};
use crate::object::{ObjectKey, apply_merge_patch, payload_of, selector_matches, status_of};
use crate::resource::ResourceTypeDescriptor;
use futures::StreamExt;
use futures::stream;
use kube::api::DynamicObject;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

const EVENT_BUFFER: usize = 1024;

/// A fault injected into every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Credentials revoked or endpoint gone; calls fail as peer-unusable.
    Unusable,
    /// Server unavailable; calls fail as transient.
    Unavailable,
    /// Nothing answers; calls fail as unreachable.
    Unreachable,
}

#[derive(Debug, Clone)]
enum StoreEvent {
    Change {
        type_id: String,
        event: WatchEvent,
        previous: Option<DynamicObject>,
    },
    Disrupted,
}

#[derive(Default)]
struct StoreState {
    objects: BTreeMap<(String, ObjectKey), DynamicObject>,
    revision: u64,
}

#[derive(Default)]
struct FaultPlan {
    always: Option<Fault>,
    transient_budget: u32,
    status_conflicts: u32,
    latency: Option<Duration>,
}

struct Inner {
    name: String,
    state: Mutex<StoreState>,
    faults: Mutex<FaultPlan>,
    events: broadcast::Sender<StoreEvent>,
    writes: AtomicU64,
    creates: AtomicU64,
}

/// In-process object store standing in for a cluster API.
#[derive(Clone)]
pub struct MemoryObjectApi {
    inner: Arc<Inner>,
}

impl MemoryObjectApi {
    /// Create an empty store. `name` is used in error messages.
    pub fn new(name: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(StoreState::default()),
                faults: Mutex::new(FaultPlan::default()),
                events,
                writes: AtomicU64::new(0),
                creates: AtomicU64::new(0),
            }),
        }
    }

    /// Store name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Make every call fail with `fault` (or clear it with `None`).
    ///
    /// Open watches are disrupted and end with an error.
    pub fn set_fault(&self, fault: Option<Fault>) {
        self.inner.faults.lock().always = fault;
        if fault.is_some() {
            let _ = self.inner.events.send(StoreEvent::Disrupted);
        }
    }

    /// Fail the next `count` calls with a transient error.
    pub fn fail_next(&self, count: u32) {
        self.inner.faults.lock().transient_budget = count;
    }

    /// Reject the next `count` status writes with a conflict, as if another
    /// writer got there first.
    pub fn conflict_next_status_writes(&self, count: u32) {
        self.inner.faults.lock().status_conflicts = count;
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.inner.faults.lock().latency = latency;
    }

    /// Number of successful writes of any kind.
    pub fn write_count(&self) -> u64 {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// Number of successful creates.
    pub fn create_count(&self) -> u64 {
        self.inner.creates.load(Ordering::SeqCst)
    }

    /// Snapshot of every object of a kind.
    pub fn objects(&self, rt: &ResourceTypeDescriptor) -> Vec<DynamicObject> {
        let type_id = rt.id();
        self.inner
            .state
            .lock()
            .objects
            .iter()
            .filter(|((t, _), _)| *t == type_id)
            .map(|(_, obj)| obj.clone())
            .collect()
    }

    /// Snapshot of one object.
    pub fn object(&self, rt: &ResourceTypeDescriptor, key: &ObjectKey) -> Option<DynamicObject> {
        self.inner
            .state
            .lock()
            .objects
            .get(&(rt.id(), key.clone()))
            .cloned()
    }

    async fn admit(&self, operation: &str) -> ReplicatorResult<()> {
        let latency = self.inner.faults.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut faults = self.inner.faults.lock();
        match faults.always {
            Some(Fault::Unusable) => {
                return Err(ReplicatorError::PeerUnusable {
                    cluster: self.inner.name.clone(),
                    reason: format!("{} rejected: credentials revoked", operation),
                });
            }
            Some(Fault::Unavailable) => {
                return Err(ReplicatorError::Transient(format!(
                    "{} on {}: service unavailable",
                    operation, self.inner.name
                )));
            }
            Some(Fault::Unreachable) => {
                return Err(ReplicatorError::Unreachable(format!(
                    "{} on {}: connection refused",
                    operation, self.inner.name
                )));
            }
            None => {}
        }
        if faults.transient_budget > 0 {
            faults.transient_budget -= 1;
            return Err(ReplicatorError::Transient(format!(
                "{} on {}: injected failure",
                operation, self.inner.name
            )));
        }
        Ok(())
    }

    fn immediate_fault(&self) -> Option<ReplicatorError> {
        match self.inner.faults.lock().always {
            Some(Fault::Unusable) => Some(ReplicatorError::PeerUnusable {
                cluster: self.inner.name.clone(),
                reason: "watch rejected: credentials revoked".to_string(),
            }),
            Some(Fault::Unavailable) => Some(ReplicatorError::Transient(format!(
                "watch on {}: service unavailable",
                self.inner.name
            ))),
            Some(Fault::Unreachable) => Some(ReplicatorError::Unreachable(format!(
                "watch on {}: connection refused",
                self.inner.name
            ))),
            None => None,
        }
    }

    fn stamp(state: &mut StoreState, obj: &mut DynamicObject) {
        state.revision += 1;
        obj.metadata.resource_version = Some(state.revision.to_string());
    }

    fn publish(&self, type_id: &str, event: WatchEvent, previous: Option<DynamicObject>) {
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        // No receivers is fine: nobody is watching.
        let _ = self.inner.events.send(StoreEvent::Change {
            type_id: type_id.to_string(),
            event,
            previous,
        });
    }
}

fn matches(
    rt: &ResourceTypeDescriptor,
    obj: &DynamicObject,
    namespace: Option<&str>,
    selector: &str,
) -> bool {
    if let Some(ns) = namespace {
        if rt.is_namespaced() && obj.metadata.namespace.as_deref() != Some(ns) {
            return false;
        }
    }
    selector_matches(selector, &obj.metadata.labels.clone().unwrap_or_default())
}

/// Project a store change onto one watch. An update that moves an object out
/// of the selection is seen as a delete, as an API server would report it.
fn project(
    rt: &ResourceTypeDescriptor,
    namespace: Option<&str>,
    selector: &str,
    event: WatchEvent,
    previous: Option<&DynamicObject>,
) -> Option<WatchEvent> {
    match event {
        WatchEvent::Applied(obj) => {
            if matches(rt, &obj, namespace, selector) {
                Some(WatchEvent::Applied(obj))
            } else if previous.is_some_and(|p| matches(rt, p, namespace, selector)) {
                Some(WatchEvent::Deleted(obj))
            } else {
                None
            }
        }
        WatchEvent::Deleted(obj) => {
            matches(rt, &obj, namespace, selector).then_some(WatchEvent::Deleted(obj))
        }
        WatchEvent::Ready => None,
    }
}

impl ObjectApi for MemoryObjectApi {
    fn list<'a>(
        &'a self,
        rt: &'a ResourceTypeDescriptor,
        namespace: Option<&'a str>,
        selector: &'a str,
    ) -> ApiFuture<'a, Vec<DynamicObject>> {
        Box::pin(async move {
            self.admit("list").await?;
            Ok(self
                .objects(rt)
                .into_iter()
                .filter(|obj| matches(rt, obj, namespace, selector))
                .collect())
        })
    }

    fn watch(
        &self,
        rt: &ResourceTypeDescriptor,
        namespace: Option<&str>,
        selector: &str,
    ) -> EventStream {
        if let Some(err) = self.immediate_fault() {
            return stream::once(futures::future::ready(Err(err))).boxed();
        }

        let rt = rt.clone();
        let namespace = namespace.map(str::to_string);
        let selector = selector.to_string();
        let type_id = rt.id();

        // Subscribe under the state lock so no write slips between the
        // snapshot and the live feed.
        let (snapshot, rx) = {
            let state = self.inner.state.lock();
            let rx = self.inner.events.subscribe();
            let snapshot: Vec<_> = state
                .objects
                .iter()
                .filter(|((t, _), obj)| {
                    *t == type_id && matches(&rt, obj, namespace.as_deref(), &selector)
                })
                .map(|(_, obj)| Ok(WatchEvent::Applied(obj.clone())))
                .collect();
            (snapshot, rx)
        };

        let store_name = self.inner.name.clone();
        let live = stream::unfold(Some(rx), move |rx| {
            let rt = rt.clone();
            let type_id = type_id.clone();
            let namespace = namespace.clone();
            let selector = selector.clone();
            let store_name = store_name.clone();
            async move {
                let mut rx = rx?;
                loop {
                    match rx.recv().await {
                        Ok(StoreEvent::Change {
                            type_id: t,
                            event,
                            previous,
                        }) => {
                            if t != type_id {
                                continue;
                            }
                            let projected = project(
                                &rt,
                                namespace.as_deref(),
                                &selector,
                                event,
                                previous.as_ref(),
                            );
                            if let Some(event) = projected {
                                return Some((Ok(event), Some(rx)));
                            }
                        }
                        Ok(StoreEvent::Disrupted) => {
                            let err = ReplicatorError::Transient(format!(
                                "watch on {} disrupted",
                                store_name
                            ));
                            return Some((Err(err), None));
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            let err = ReplicatorError::Transient(format!(
                                "watch on {} lagged by {} events",
                                store_name, n
                            ));
                            return Some((Err(err), None));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        stream::iter(snapshot)
            .chain(stream::once(futures::future::ready(Ok(WatchEvent::Ready))))
            .chain(live)
            .boxed()
    }

    fn get<'a>(
        &'a self,
        rt: &'a ResourceTypeDescriptor,
        key: &'a ObjectKey,
    ) -> ApiFuture<'a, Option<DynamicObject>> {
        Box::pin(async move {
            self.admit("get").await?;
            Ok(self.object(rt, key))
        })
    }

    fn create<'a>(
        &'a self,
        rt: &'a ResourceTypeDescriptor,
        obj: &'a DynamicObject,
    ) -> ApiFuture<'a, DynamicObject> {
        Box::pin(async move {
            self.admit("create").await?;
            let key = ObjectKey::of(rt, obj)?;
            let type_id = rt.id();

            let mut state = self.inner.state.lock();
            let slot = (type_id.clone(), key.clone());
            if state.objects.contains_key(&slot) {
                return Err(ReplicatorError::AlreadyExists {
                    kind: rt.kind.clone(),
                    name: key.to_string(),
                });
            }

            let mut created = obj.clone();
            created.data = Value::Object(payload_of(obj));
            created.metadata.generation = Some(1);
            Self::stamp(&mut state, &mut created);
            created.metadata.uid = Some(format!(
                "{}-{}",
                key.name,
                created.metadata.resource_version.clone().unwrap_or_default()
            ));
            state.objects.insert(slot, created.clone());

            self.inner.creates.fetch_add(1, Ordering::SeqCst);
            self.publish(&type_id, WatchEvent::Applied(created.clone()), None);
            Ok(created)
        })
    }

    fn replace<'a>(
        &'a self,
        rt: &'a ResourceTypeDescriptor,
        obj: &'a DynamicObject,
    ) -> ApiFuture<'a, DynamicObject> {
        Box::pin(async move {
            self.admit("replace").await?;
            let key = ObjectKey::of(rt, obj)?;
            let type_id = rt.id();

            let mut state = self.inner.state.lock();
            let slot = (type_id.clone(), key.clone());
            let current = state
                .objects
                .get(&slot)
                .cloned()
                .ok_or_else(|| ReplicatorError::NotFound {
                    kind: rt.kind.clone(),
                    name: key.name.clone(),
                    namespace: key.namespace.clone().unwrap_or_default(),
                })?;

            if let Some(rv) = obj.metadata.resource_version.as_deref() {
                if current.metadata.resource_version.as_deref() != Some(rv) {
                    return Err(ReplicatorError::Conflict {
                        kind: rt.kind.clone(),
                        name: key.to_string(),
                        reason: format!("resource version {} is stale", rv),
                    });
                }
            }

            let mut data = payload_of(obj);
            let payload_changed = data != payload_of(&current);
            if let Some(status) = status_of(&current) {
                data.insert("status".to_string(), status.clone());
            }

            let mut replaced = current.clone();
            replaced.metadata.labels = obj.metadata.labels.clone();
            replaced.metadata.annotations = obj.metadata.annotations.clone();
            replaced.data = Value::Object(data);
            if payload_changed {
                replaced.metadata.generation = Some(current.metadata.generation.unwrap_or(1) + 1);
            }
            Self::stamp(&mut state, &mut replaced);
            state.objects.insert(slot, replaced.clone());

            self.publish(&type_id, WatchEvent::Applied(replaced.clone()), Some(current));
            Ok(replaced)
        })
    }

    fn patch_status<'a>(
        &'a self,
        rt: &'a ResourceTypeDescriptor,
        key: &'a ObjectKey,
        resource_version: &'a str,
        status_patch: &'a Value,
    ) -> ApiFuture<'a, DynamicObject> {
        Box::pin(async move {
            self.admit("patch_status").await?;
            let type_id = rt.id();

            {
                let mut faults = self.inner.faults.lock();
                if faults.status_conflicts > 0 {
                    faults.status_conflicts -= 1;
                    return Err(ReplicatorError::Conflict {
                        kind: rt.kind.clone(),
                        name: key.to_string(),
                        reason: "injected concurrent status write".to_string(),
                    });
                }
            }

            let mut state = self.inner.state.lock();
            let slot = (type_id.clone(), key.clone());
            let current = state
                .objects
                .get(&slot)
                .cloned()
                .ok_or_else(|| ReplicatorError::NotFound {
                    kind: rt.kind.clone(),
                    name: key.name.clone(),
                    namespace: key.namespace.clone().unwrap_or_default(),
                })?;

            if current.metadata.resource_version.as_deref() != Some(resource_version) {
                return Err(ReplicatorError::Conflict {
                    kind: rt.kind.clone(),
                    name: key.to_string(),
                    reason: format!("resource version {} is stale", resource_version),
                });
            }

            let mut patched = current.clone();
            let mut status = status_of(&patched).cloned().unwrap_or(Value::Null);
            apply_merge_patch(&mut status, status_patch);
            if let Value::Object(map) = &mut patched.data {
                map.insert("status".to_string(), status);
            } else {
                patched.data = serde_json::json!({ "status": status });
            }
            Self::stamp(&mut state, &mut patched);
            state.objects.insert(slot, patched.clone());

            self.publish(&type_id, WatchEvent::Applied(patched.clone()), Some(current));
            Ok(patched)
        })
    }

    fn delete<'a>(
        &'a self,
        rt: &'a ResourceTypeDescriptor,
        key: &'a ObjectKey,
    ) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            self.admit("delete").await?;
            let type_id = rt.id();

            let mut state = self.inner.state.lock();
            let removed = state
                .objects
                .remove(&(type_id.clone(), key.clone()))
                .ok_or_else(|| ReplicatorError::NotFound {
                    kind: rt.kind.clone(),
                    name: key.name.clone(),
                    namespace: key.namespace.clone().unwrap_or_default(),
                })?;

            self.publish(&type_id, WatchEvent::Deleted(removed), None);
            Ok(())
        })
    }
}
