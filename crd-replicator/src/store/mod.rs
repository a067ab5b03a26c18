//! Object API abstraction.
//!
//! Both the local cluster and every peer are reached through [`ObjectApi`].
//! Two backends exist:
//!
//! - [`KubeObjectApi`]: the Kubernetes dynamic API and runtime watcher
//! - [`MemoryObjectApi`]: an in-process store with fault injection, used for
//!   simulated peers and tests

mod cluster;
mod memory;

pub use cluster::KubeObjectApi;
pub use memory::{Fault, MemoryObjectApi};

use crate::error::ReplicatorResult;
use crate::object::ObjectKey;
use crate::resource::ResourceTypeDescriptor;
use futures::stream::BoxStream;
use kube::api::DynamicObject;
use std::future::Future;
use std::pin::Pin;

/// Type alias for object API futures.
pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = ReplicatorResult<T>> + Send + 'a>>;

/// Stream of watch events.
pub type EventStream = BoxStream<'static, ReplicatorResult<WatchEvent>>;

/// A change delivered by a watch.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// The object was added or modified (including initial listing).
    Applied(DynamicObject),
    /// The object was deleted. Carries its last known state.
    Deleted(DynamicObject),
    /// The stream has (re)established and delivered its initial listing.
    Ready,
}

/// Operations the engine needs from a cluster's object API.
///
/// All operations are namespace-scoped when the kind is namespaced. Writes use
/// the resource version carried by the object (or passed explicitly) for
/// optimistic concurrency.
pub trait ObjectApi: Send + Sync {
    /// List objects matching a label selector. `namespace: None` lists across
    /// all namespaces.
    fn list<'a>(
        &'a self,
        rt: &'a ResourceTypeDescriptor,
        namespace: Option<&'a str>,
        selector: &'a str,
    ) -> ApiFuture<'a, Vec<DynamicObject>>;

    /// Open a long-lived watch filtered by a label selector.
    ///
    /// The stream starts with the current matching objects, then a
    /// [`WatchEvent::Ready`], then live changes. Errors are yielded in-band; the
    /// stream may end, in which case the caller re-watches.
    fn watch(
        &self,
        rt: &ResourceTypeDescriptor,
        namespace: Option<&str>,
        selector: &str,
    ) -> EventStream;

    /// Fetch one object.
    fn get<'a>(
        &'a self,
        rt: &'a ResourceTypeDescriptor,
        key: &'a ObjectKey,
    ) -> ApiFuture<'a, Option<DynamicObject>>;

    /// Create an object. Status is ignored.
    fn create<'a>(
        &'a self,
        rt: &'a ResourceTypeDescriptor,
        obj: &'a DynamicObject,
    ) -> ApiFuture<'a, DynamicObject>;

    /// Replace an object's payload and metadata. Status is ignored.
    fn replace<'a>(
        &'a self,
        rt: &'a ResourceTypeDescriptor,
        obj: &'a DynamicObject,
    ) -> ApiFuture<'a, DynamicObject>;

    /// Apply an RFC 7386 merge patch to the status subresource, guarded by
    /// `resource_version`. Only the status changes.
    fn patch_status<'a>(
        &'a self,
        rt: &'a ResourceTypeDescriptor,
        key: &'a ObjectKey,
        resource_version: &'a str,
        status_patch: &'a serde_json::Value,
    ) -> ApiFuture<'a, DynamicObject>;

    /// Delete an object.
    fn delete<'a>(
        &'a self,
        rt: &'a ResourceTypeDescriptor,
        key: &'a ObjectKey,
    ) -> ApiFuture<'a, ()>;
}
