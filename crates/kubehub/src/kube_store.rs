//! [`ResourceStore`] over a real cluster using `kube` dynamic objects.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, Preconditions},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use serde_json::Value as Json;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use keel_core::{Delta, DeltaKind, Error, LabelSelector, ObjectRef, Resource, Result, TypeRef};

use crate::{PatchTarget, ResourceStore};

/// Cluster-backed store with a discovery cache keyed by group/version/kind.
pub struct KubeStore {
    client: Client,
    resources: RwLock<HashMap<TypeRef, (ApiResource, bool)>>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            resources: RwLock::new(HashMap::new()),
        }
    }

    /// Connect using the ambient kubeconfig or in-cluster service account.
    pub async fn try_default() -> anyhow::Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    async fn find_api_resource(&self, type_ref: &TypeRef) -> Result<(ApiResource, bool)> {
        if let Some(hit) = self.resources.read().await.get(type_ref) {
            return Ok(hit.clone());
        }
        let gvk = GroupVersionKind {
            group: type_ref.group().to_string(),
            version: type_ref.version().to_string(),
            kind: type_ref.kind.clone(),
        };
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| map_kube_error(&type_ref.to_string(), e))?;
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    self.resources
                        .write()
                        .await
                        .insert(type_ref.clone(), (ar.clone(), namespaced));
                    debug!(gvk = %type_ref, namespaced, "discovered api resource");
                    return Ok((ar, namespaced));
                }
            }
        }
        // Missing CRDs are usually installed by an earlier manifest; retry later.
        Err(Error::transient(format!("GVK not served: {type_ref}")))
    }

    async fn api(&self, type_ref: &TypeRef, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let (ar, namespaced) = self.find_api_resource(type_ref).await?;
        Ok(if namespaced {
            match namespace {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
                None => Api::all_with(self.client.clone(), &ar),
            }
        } else {
            Api::all_with(self.client.clone(), &ar)
        })
    }
}

/// Classify a kube error into the Keel taxonomy.
fn map_kube_error(object: &str, e: kube::Error) -> Error {
    match e {
        kube::Error::Api(resp) => match resp.code {
            404 => Error::not_found(object),
            409 => Error::conflict(object, resp.message),
            429 | 500..=599 => Error::transient(format!("{object}: {}", resp.message)),
            _ => Error::rejected(object, format!("{} ({})", resp.message, resp.reason)),
        },
        other => Error::transient(format!("{object}: {other}")),
    }
}

fn to_dynamic(res: &Resource) -> Result<DynamicObject> {
    Ok(serde_json::from_value(res.to_json()?)?)
}

/// List and watch responses omit apiVersion/kind on items; restore them.
fn from_dynamic(type_ref: &TypeRef, obj: &DynamicObject) -> Result<Resource> {
    let mut value = serde_json::to_value(obj)?;
    if let Some(map) = value.as_object_mut() {
        map.insert("apiVersion".into(), Json::String(type_ref.api_version.clone()));
        map.insert("kind".into(), Json::String(type_ref.kind.clone()));
        if let Some(meta) = map.get_mut("metadata").and_then(Json::as_object_mut) {
            meta.remove("managedFields");
        }
    }
    Ok(serde_json::from_value(value)?)
}

fn deltas_from(type_ref: &TypeRef, ev: Event<DynamicObject>) -> Vec<Delta> {
    let convert = |obj: &DynamicObject, kind: DeltaKind| match from_dynamic(type_ref, obj) {
        Ok(object) => Some(Delta { kind, object }),
        Err(e) => {
            warn!(error = %e, "dropping undecodable watch object");
            None
        }
    };
    match ev {
        Event::Applied(o) => convert(&o, DeltaKind::Applied).into_iter().collect(),
        Event::Deleted(o) => convert(&o, DeltaKind::Deleted).into_iter().collect(),
        Event::Restarted(list) => {
            debug!(count = list.len(), "watch restart");
            list.iter()
                .filter_map(|o| convert(o, DeltaKind::Applied))
                .collect()
        }
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get(&self, obj: &ObjectRef) -> Result<Resource> {
        let type_ref = obj.type_ref();
        let api = self.api(&type_ref, obj.namespace.as_deref()).await?;
        let found = api
            .get(&obj.name)
            .await
            .map_err(|e| map_kube_error(&obj.to_string(), e))?;
        from_dynamic(&type_ref, &found)
    }

    async fn list(
        &self,
        type_ref: &TypeRef,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<Resource>> {
        let api = self.api(type_ref, namespace).await?;
        let mut lp = ListParams::default();
        if !selector.is_empty() {
            lp = lp.labels(&selector.to_string());
        }
        let items = api
            .list(&lp)
            .await
            .map_err(|e| map_kube_error(&type_ref.to_string(), e))?;
        items.iter().map(|o| from_dynamic(type_ref, o)).collect()
    }

    async fn watch(
        &self,
        type_ref: &TypeRef,
        namespace: Option<&str>,
    ) -> Result<BoxStream<'static, Delta>> {
        let api = self.api(type_ref, namespace).await?;
        info!(gvk = %type_ref, ns = ?namespace, "watcher started");
        let type_ref = type_ref.clone();
        let stream = watcher::watcher(api, watcher::Config::default())
            .filter_map(move |ev| {
                let out = match ev {
                    Ok(ev) => Some(stream::iter(deltas_from(&type_ref, ev))),
                    Err(e) => {
                        warn!(error = %e, "watch error; stream will retry");
                        None
                    }
                };
                futures::future::ready(out)
            })
            .flatten();
        Ok(stream.boxed())
    }

    async fn create(&self, res: &Resource) -> Result<Resource> {
        let type_ref = res.type_ref();
        let api = self.api(&type_ref, res.metadata.namespace.as_deref()).await?;
        let created = api
            .create(&PostParams::default(), &to_dynamic(res)?)
            .await
            .map_err(|e| map_kube_error(&res.object_ref().to_string(), e))?;
        from_dynamic(&type_ref, &created)
    }

    async fn update(&self, res: &Resource) -> Result<Resource> {
        let type_ref = res.type_ref();
        let api = self.api(&type_ref, res.metadata.namespace.as_deref()).await?;
        let replaced = api
            .replace(&res.metadata.name, &PostParams::default(), &to_dynamic(res)?)
            .await
            .map_err(|e| map_kube_error(&res.object_ref().to_string(), e))?;
        from_dynamic(&type_ref, &replaced)
    }

    async fn patch(
        &self,
        obj: &ObjectRef,
        patch: &Json,
        expected_version: Option<&str>,
        target: PatchTarget,
    ) -> Result<Resource> {
        let type_ref = obj.type_ref();
        let api = self.api(&type_ref, obj.namespace.as_deref()).await?;
        let mut body = patch.clone();
        if let (Some(rv), Some(map)) = (expected_version, body.as_object_mut()) {
            let meta = map
                .entry("metadata")
                .or_insert_with(|| Json::Object(serde_json::Map::new()));
            if let Some(meta) = meta.as_object_mut() {
                meta.insert("resourceVersion".into(), Json::String(rv.to_string()));
            }
        }
        let pp = PatchParams::default();
        let result = match target {
            PatchTarget::Main => api.patch(&obj.name, &pp, &Patch::Merge(&body)).await,
            PatchTarget::Status => api.patch_status(&obj.name, &pp, &Patch::Merge(&body)).await,
        };
        let patched = result.map_err(|e| map_kube_error(&obj.to_string(), e))?;
        from_dynamic(&type_ref, &patched)
    }

    async fn replace_status(
        &self,
        obj: &ObjectRef,
        status: &Json,
        expected_version: Option<&str>,
    ) -> Result<Resource> {
        let type_ref = obj.type_ref();
        let api = self.api(&type_ref, obj.namespace.as_deref()).await?;
        // status PUTs on custom resources must carry a version
        let version = match expected_version {
            Some(rv) => rv.to_string(),
            None => api
                .get(&obj.name)
                .await
                .map_err(|e| map_kube_error(&obj.to_string(), e))?
                .metadata
                .resource_version
                .unwrap_or_default(),
        };
        let mut metadata = serde_json::Map::new();
        metadata.insert("name".into(), Json::String(obj.name.clone()));
        if let Some(ns) = &obj.namespace {
            metadata.insert("namespace".into(), Json::String(ns.clone()));
        }
        metadata.insert("resourceVersion".into(), Json::String(version));
        let body = serde_json::json!({
            "apiVersion": obj.api_version,
            "kind": obj.kind,
            "metadata": metadata,
            "status": status,
        });
        let replaced = api
            .replace_status(&obj.name, &PostParams::default(), serde_json::to_vec(&body)?)
            .await
            .map_err(|e| map_kube_error(&obj.to_string(), e))?;
        from_dynamic(&type_ref, &replaced)
    }

    async fn delete(&self, obj: &ObjectRef, expected_version: Option<&str>) -> Result<()> {
        let api = self.api(&obj.type_ref(), obj.namespace.as_deref()).await?;
        let dp = DeleteParams {
            preconditions: expected_version.map(|rv| Preconditions {
                resource_version: Some(rv.to_string()),
                uid: None,
            }),
            ..DeleteParams::default()
        };
        api.delete(&obj.name, &dp)
            .await
            .map_err(|e| map_kube_error(&obj.to_string(), e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_err(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "boom".into(),
            reason: "Reason".into(),
            code,
        })
    }

    #[test]
    fn kube_errors_map_to_taxonomy() {
        assert!(map_kube_error("x", api_err(404)).is_not_found());
        assert!(map_kube_error("x", api_err(409)).is_conflict());
        assert_eq!(map_kube_error("x", api_err(503)).reason(), "TransientClusterError");
        assert_eq!(map_kube_error("x", api_err(429)).reason(), "TransientClusterError");
        let forbidden = map_kube_error("x", api_err(403));
        assert_eq!(forbidden.reason(), "Rejected");
        assert!(!forbidden.is_retryable());
    }

    #[test]
    fn dynamic_items_regain_type_info() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "metadata": { "name": "a", "namespace": "ns", "managedFields": [{}] },
            "data": { "k": "v" }
        }))
        .unwrap();
        let res = from_dynamic(&TypeRef::new("v1", "ConfigMap"), &obj).unwrap();
        assert_eq!(res.kind, "ConfigMap");
        assert_eq!(res.api_version, "v1");
        assert!(!res.metadata.extra.contains_key("managedFields"));
        assert_eq!(res.body["data"]["k"], "v");
    }
}
