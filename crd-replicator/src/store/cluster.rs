//! Object API backed by a Kubernetes API server.

use super::{ApiFuture, EventStream, ObjectApi, WatchEvent};
use crate::error::{ReplicatorError, ReplicatorResult};
use crate::object::ObjectKey;
use crate::resource::ResourceTypeDescriptor;
use futures::StreamExt;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher::{self, watcher};
use kube::Client;

/// Dynamic-object access to one Kubernetes cluster.
#[derive(Clone)]
pub struct KubeObjectApi {
    client: Client,
}

impl KubeObjectApi {
    /// Wrap an authenticated client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, rt: &ResourceTypeDescriptor, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = rt.api_resource();
        match namespace {
            Some(ns) if rt.is_namespaced() => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }
}

fn translate(event: Result<watcher::Event<DynamicObject>, watcher::Error>) -> Option<ReplicatorResult<WatchEvent>> {
    match event {
        Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
            Some(Ok(WatchEvent::Applied(obj)))
        }
        Ok(watcher::Event::Delete(obj)) => Some(Ok(WatchEvent::Deleted(obj))),
        Ok(watcher::Event::Init) => None,
        Ok(watcher::Event::InitDone) => Some(Ok(WatchEvent::Ready)),
        Err(e) => Some(Err(ReplicatorError::from(e))),
    }
}

impl ObjectApi for KubeObjectApi {
    fn list<'a>(
        &'a self,
        rt: &'a ResourceTypeDescriptor,
        namespace: Option<&'a str>,
        selector: &'a str,
    ) -> ApiFuture<'a, Vec<DynamicObject>> {
        Box::pin(async move {
            let list = self
                .api(rt, namespace)
                .list(&ListParams::default().labels(selector))
                .await?;
            Ok(list.items)
        })
    }

    fn watch(
        &self,
        rt: &ResourceTypeDescriptor,
        namespace: Option<&str>,
        selector: &str,
    ) -> EventStream {
        let config = watcher::Config::default().labels(selector);
        watcher(self.api(rt, namespace), config)
            .default_backoff()
            .filter_map(|event| futures::future::ready(translate(event)))
            .boxed()
    }

    fn get<'a>(
        &'a self,
        rt: &'a ResourceTypeDescriptor,
        key: &'a ObjectKey,
    ) -> ApiFuture<'a, Option<DynamicObject>> {
        Box::pin(async move {
            let obj = self
                .api(rt, key.namespace.as_deref())
                .get_opt(&key.name)
                .await?;
            Ok(obj)
        })
    }

    fn create<'a>(
        &'a self,
        rt: &'a ResourceTypeDescriptor,
        obj: &'a DynamicObject,
    ) -> ApiFuture<'a, DynamicObject> {
        Box::pin(async move {
            let created = self
                .api(rt, obj.metadata.namespace.as_deref())
                .create(&PostParams::default(), obj)
                .await?;
            Ok(created)
        })
    }

    fn replace<'a>(
        &'a self,
        rt: &'a ResourceTypeDescriptor,
        obj: &'a DynamicObject,
    ) -> ApiFuture<'a, DynamicObject> {
        Box::pin(async move {
            let name = obj.metadata.name.as_deref().ok_or_else(|| {
                ReplicatorError::MalformedObject {
                    kind: rt.kind.clone(),
                    name: "<unnamed>".to_string(),
                    reason: "cannot replace an object without a name".to_string(),
                }
            })?;
            let replaced = self
                .api(rt, obj.metadata.namespace.as_deref())
                .replace(name, &PostParams::default(), obj)
                .await?;
            Ok(replaced)
        })
    }

    fn patch_status<'a>(
        &'a self,
        rt: &'a ResourceTypeDescriptor,
        key: &'a ObjectKey,
        resource_version: &'a str,
        status_patch: &'a serde_json::Value,
    ) -> ApiFuture<'a, DynamicObject> {
        Box::pin(async move {
            // A resourceVersion inside a merge patch makes the API server
            // reject the write with 409 if the object moved on.
            let patch = serde_json::json!({
                "metadata": { "resourceVersion": resource_version },
                "status": status_patch,
            });
            let patched = self
                .api(rt, key.namespace.as_deref())
                .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            Ok(patched)
        })
    }

    fn delete<'a>(
        &'a self,
        rt: &'a ResourceTypeDescriptor,
        key: &'a ObjectKey,
    ) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            self.api(rt, key.namespace.as_deref())
                .delete(&key.name, &DeleteParams::default())
                .await?;
            Ok(())
        })
    }
}
