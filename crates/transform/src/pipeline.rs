//! The transform pipeline: raw release documents in, ordered manifest items out.
//!
//! Stages run per document in a fixed order: namespace injection, token
//! substitution, label/annotation injection, resource overlay. Any stage
//! failure aborts the whole transform with the stage named in the error.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use metrics::{counter, histogram};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tracing::debug;

use keel_core::hash::content_hash;
use keel_core::{labels, ComponentKind, ComponentSpec, Error, ManifestItem, Result};

use crate::defaults::{default_order, default_readiness, is_cluster_scoped};
use crate::source::{ManifestSource, Release};
use crate::yaml::manifest_id;

static TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{(NAMESPACE|VERSION|IMAGE:([A-Za-z0-9_.\-]+))\}").expect("static regex")
});

/// Per-container requests/limits override.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceOverride {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

/// Everything the pipeline needs besides the raw documents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformConfig {
    pub component: String,
    pub kind: ComponentKind,
    pub namespace: String,
    pub version: String,
    pub images: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// Keyed by container name; `*` applies to every container first
    pub resources: BTreeMap<String, ResourceOverride>,
}

impl TransformConfig {
    /// Build the config for one component from its (defaulted) spec and release.
    ///
    /// Images from `spec.config.images` override the release's image table.
    pub fn for_component(component: &str, spec: &ComponentSpec, release: &Release) -> Result<Self> {
        fn section<T: serde::de::DeserializeOwned + Default>(
            spec: &ComponentSpec,
            key: &str,
        ) -> Result<T> {
            match spec.config.get(key) {
                Some(v) => serde_json::from_value(v.clone())
                    .map_err(|e| Error::transform("config", format!("config.{key}: {e}"))),
                None => Ok(T::default()),
            }
        }
        let mut images = release.images.clone();
        images.extend(section::<BTreeMap<String, String>>(spec, "images")?);
        Ok(Self {
            component: component.to_string(),
            kind: spec.kind.clone(),
            namespace: spec.target_namespace.clone(),
            version: release.version.clone(),
            images,
            labels: section(spec, "labels")?,
            annotations: section(spec, "annotations")?,
            resources: section(spec, "resources")?,
        })
    }
}

/// Transform raw documents into manifest items sorted by ordering hint.
///
/// The sort is stable, so items with equal hints keep their document order.
pub fn transform(documents: &[Json], cfg: &TransformConfig) -> Result<Vec<ManifestItem>> {
    let t0 = Instant::now();
    let mut items = Vec::with_capacity(documents.len());
    let mut seen = BTreeSet::new();
    for raw in documents {
        let mut doc = raw.clone();
        inject_namespace(&mut doc, &cfg.namespace)?;
        substitute(&mut doc, cfg)?;
        inject_metadata(&mut doc, cfg)?;
        overlay_resources(&mut doc, &cfg.resources)?;

        let id = manifest_id(&doc)?;
        if !seen.insert(id.clone()) {
            return Err(Error::transform("identity", format!("duplicate manifest {id}")));
        }
        let order = match explicit_order(&doc)? {
            Some(order) => order,
            None => default_order(&id.kind),
        };
        let readiness = default_readiness(&id.kind);
        items.push(ManifestItem {
            id,
            order,
            payload: doc,
            readiness,
        });
    }
    items.sort_by_key(|i| i.order);
    counter!("transform_documents_total", items.len() as u64);
    histogram!("transform_ms", t0.elapsed().as_secs_f64() * 1000.0);
    debug!(component = %cfg.component, kind = %cfg.kind, items = items.len(), "transformed release");
    Ok(items)
}

/// Output of [`render`]: the desired bundle for one component.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    pub items: Vec<ManifestItem>,
    pub hash: String,
    pub config: TransformConfig,
}

/// Load the release for `spec`, transform it and hash the result.
pub fn render(source: &dyn ManifestSource, component: &str, spec: &ComponentSpec) -> Result<Rendered> {
    let release = source.release(&spec.kind, &spec.version)?;
    let config = TransformConfig::for_component(component, spec, &release)?;
    let items = transform(&release.documents, &config)?;
    let hash = content_hash(&items, &config)?;
    Ok(Rendered {
        items,
        hash,
        config,
    })
}

fn metadata_mut<'a>(doc: &'a mut Json, stage: &str) -> Result<&'a mut Map<String, Json>> {
    let obj = doc
        .as_object_mut()
        .ok_or_else(|| Error::transform(stage, "document is not a mapping"))?;
    obj.entry("metadata")
        .or_insert_with(|| Json::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| Error::transform(stage, "metadata is not a mapping"))
}

fn set_service_namespace(service: Option<&mut Json>, namespace: &str) {
    if let Some(Json::Object(svc)) = service {
        svc.insert("namespace".into(), Json::String(namespace.to_string()));
    }
}

fn inject_namespace(doc: &mut Json, namespace: &str) -> Result<()> {
    let kind = doc
        .get("kind")
        .and_then(Json::as_str)
        .unwrap_or_default()
        .to_string();
    let meta = metadata_mut(doc, "namespace")?;
    let ns = Json::String(namespace.to_string());
    if kind == "Namespace" {
        meta.insert("name".into(), ns);
    } else if is_cluster_scoped(&kind) {
        meta.remove("namespace");
    } else {
        meta.insert("namespace".into(), ns);
    }

    match kind.as_str() {
        "RoleBinding" | "ClusterRoleBinding" => {
            if let Some(Json::Array(subjects)) = doc.get_mut("subjects") {
                for subject in subjects.iter_mut().filter_map(Json::as_object_mut) {
                    if subject.get("kind").and_then(Json::as_str) == Some("ServiceAccount") {
                        subject.insert("namespace".into(), Json::String(namespace.to_string()));
                    }
                }
            }
        }
        "MutatingWebhookConfiguration" | "ValidatingWebhookConfiguration" => {
            if let Some(Json::Array(hooks)) = doc.get_mut("webhooks") {
                for hook in hooks.iter_mut() {
                    set_service_namespace(hook.pointer_mut("/clientConfig/service"), namespace);
                }
            }
        }
        "CustomResourceDefinition" => set_service_namespace(
            doc.pointer_mut("/spec/conversion/webhook/clientConfig/service"),
            namespace,
        ),
        _ => {}
    }
    Ok(())
}

fn substitute(doc: &mut Json, cfg: &TransformConfig) -> Result<()> {
    fn walk(v: &mut Json, cfg: &TransformConfig) -> Result<()> {
        match v {
            Json::String(s) if s.contains("${") => {
                let mut missing = None;
                let replaced = TOKEN.replace_all(s, |caps: &Captures<'_>| match caps.get(2) {
                    Some(image) => match cfg.images.get(image.as_str()) {
                        Some(reference) => reference.clone(),
                        None => {
                            missing.get_or_insert_with(|| image.as_str().to_string());
                            String::new()
                        }
                    },
                    None if &caps[1] == "NAMESPACE" => cfg.namespace.clone(),
                    None => cfg.version.clone(),
                });
                if let Some(image) = missing {
                    return Err(Error::transform(
                        "substitute",
                        format!("no image named {image:?} for {}@{}", cfg.kind, cfg.version),
                    ));
                }
                *s = replaced.into_owned();
            }
            Json::Object(map) => {
                for vv in map.values_mut() {
                    walk(vv, cfg)?;
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter_mut() {
                    walk(vv, cfg)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
    walk(doc, cfg)
}

fn merge_string_map(
    meta: &mut Map<String, Json>,
    key: &str,
    entries: impl IntoIterator<Item = (String, String)>,
) -> Result<()> {
    let target = meta
        .entry(key)
        .or_insert_with(|| Json::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| Error::transform("labels", format!("metadata.{key} is not a mapping")))?;
    for (k, v) in entries {
        target.insert(k, Json::String(v));
    }
    Ok(())
}

fn inject_metadata(doc: &mut Json, cfg: &TransformConfig) -> Result<()> {
    let meta = metadata_mut(doc, "labels")?;
    // managed labels are applied last so user labels cannot shadow them
    let managed = [
        (labels::MANAGED_BY, labels::MANAGED_BY_VALUE.to_string()),
        (labels::PART_OF, cfg.kind.to_string()),
        (labels::COMPONENT, cfg.component.clone()),
        (labels::COMPONENT_KIND, cfg.kind.to_string()),
        (labels::VERSION, cfg.version.clone()),
    ];
    let user = cfg.labels.iter().map(|(k, v)| (k.clone(), v.clone()));
    let managed = managed.into_iter().map(|(k, v)| (k.to_string(), v));
    merge_string_map(meta, "labels", user.chain(managed))?;

    let release = (
        labels::RELEASE.to_string(),
        format!("{}@{}", cfg.kind, cfg.version),
    );
    let user = cfg.annotations.iter().map(|(k, v)| (k.clone(), v.clone()));
    merge_string_map(meta, "annotations", user.chain(std::iter::once(release)))
}

fn pod_spec_pointer(kind: &str) -> Option<&'static str> {
    match kind {
        "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet" | "Job" => Some("/spec/template/spec"),
        "CronJob" => Some("/spec/jobTemplate/spec/template/spec"),
        _ => None,
    }
}

fn overlay_resources(doc: &mut Json, overrides: &BTreeMap<String, ResourceOverride>) -> Result<()> {
    if overrides.is_empty() {
        return Ok(());
    }
    let Some(pointer) = doc
        .get("kind")
        .and_then(Json::as_str)
        .and_then(pod_spec_pointer)
    else {
        return Ok(());
    };
    let Some(Json::Array(containers)) = doc
        .pointer_mut(pointer)
        .and_then(|spec| spec.get_mut("containers"))
    else {
        return Ok(());
    };
    for container in containers.iter_mut() {
        let container = container
            .as_object_mut()
            .ok_or_else(|| Error::transform("resources", "container is not a mapping"))?;
        let name = container
            .get("name")
            .and_then(Json::as_str)
            .unwrap_or_default()
            .to_string();
        let applicable = [overrides.get("*"), overrides.get(&name)];
        for ov in applicable.into_iter().flatten() {
            let resources = container
                .entry("resources")
                .or_insert_with(|| Json::Object(Map::new()))
                .as_object_mut()
                .ok_or_else(|| {
                    Error::transform("resources", format!("container {name}: resources is not a mapping"))
                })?;
            for (section, values) in [("requests", &ov.requests), ("limits", &ov.limits)] {
                if values.is_empty() {
                    continue;
                }
                let target = resources
                    .entry(section)
                    .or_insert_with(|| Json::Object(Map::new()))
                    .as_object_mut()
                    .ok_or_else(|| {
                        Error::transform("resources", format!("container {name}: {section} is not a mapping"))
                    })?;
                for (k, v) in values {
                    target.insert(k.clone(), Json::String(v.clone()));
                }
            }
        }
    }
    Ok(())
}

fn explicit_order(doc: &Json) -> Result<Option<i32>> {
    let Some(raw) = doc
        .pointer("/metadata/annotations")
        .and_then(|a| a.get(labels::APPLY_ORDER))
    else {
        return Ok(None);
    };
    let parsed = match raw {
        Json::String(s) => s.trim().parse::<i32>().ok(),
        Json::Number(n) => n.as_i64().and_then(|n| i32::try_from(n).ok()),
        _ => None,
    };
    parsed
        .map(Some)
        .ok_or_else(|| Error::transform("order", format!("invalid {} value {raw}", labels::APPLY_ORDER)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StaticSource;
    use keel_core::ReadinessProbe;
    use serde_json::json;

    fn cfg() -> TransformConfig {
        TransformConfig {
            component: "pipeline".into(),
            kind: "pipeline".into(),
            namespace: "ci".into(),
            version: "v1.2.0".into(),
            images: [("controller".to_string(), "reg/ctrl:v1.2.0".to_string())].into(),
            ..Default::default()
        }
    }

    fn deployment() -> Json {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "ctrl", "namespace": "upstream"},
            "spec": {"template": {"spec": {"containers": [
                {"name": "controller", "image": "${IMAGE:controller}", "args": ["--ns=${NAMESPACE}", "--v=${VERSION}", "${HOME}"]},
                {"name": "sidecar", "image": "reg/side:1", "resources": {"limits": {"cpu": "1"}}}
            ]}}}
        })
    }

    #[test]
    fn stages_apply_in_order() {
        let mut c = cfg();
        c.labels.insert("team".into(), "ci".into());
        c.labels.insert(labels::MANAGED_BY.into(), "someone-else".into());
        let items = transform(&[deployment()], &c).unwrap();
        let doc = &items[0].payload;
        assert_eq!(items[0].id.namespace.as_deref(), Some("ci"));
        assert_eq!(doc["metadata"]["namespace"], "ci");
        let ctr = &doc["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(ctr["image"], "reg/ctrl:v1.2.0");
        assert_eq!(ctr["args"], json!(["--ns=ci", "--v=v1.2.0", "${HOME}"]));
        let l = &doc["metadata"]["labels"];
        assert_eq!(l["team"], "ci");
        assert_eq!(l[labels::MANAGED_BY], "keel");
        assert_eq!(l[labels::COMPONENT], "pipeline");
        assert_eq!(doc["metadata"]["annotations"][labels::RELEASE], "pipeline@v1.2.0");
        assert_eq!(items[0].readiness, ReadinessProbe::DeploymentAvailable);
    }

    #[test]
    fn unresolved_image_fails_the_substitute_stage() {
        let mut c = cfg();
        c.images.clear();
        match transform(&[deployment()], &c).unwrap_err() {
            Error::ManifestTransform { stage, message } => {
                assert_eq!(stage, "substitute");
                assert!(message.contains("controller"), "{message}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn resource_overlay_wildcard_then_named() {
        let mut c = cfg();
        c.resources.insert(
            "*".into(),
            ResourceOverride {
                limits: [("cpu".to_string(), "2".to_string()), ("memory".to_string(), "1Gi".to_string())].into(),
                ..Default::default()
            },
        );
        c.resources.insert(
            "controller".into(),
            ResourceOverride {
                limits: [("cpu".to_string(), "500m".to_string())].into(),
                requests: [("cpu".to_string(), "100m".to_string())].into(),
            },
        );
        let items = transform(&[deployment()], &c).unwrap();
        let ctrs = &items[0].payload["spec"]["template"]["spec"]["containers"];
        assert_eq!(ctrs[0]["resources"]["limits"], json!({"cpu": "500m", "memory": "1Gi"}));
        assert_eq!(ctrs[0]["resources"]["requests"], json!({"cpu": "100m"}));
        assert_eq!(ctrs[1]["resources"]["limits"], json!({"cpu": "2", "memory": "1Gi"}));
    }

    #[test]
    fn namespace_rewrites_bindings_webhooks_and_cluster_scope() {
        let docs = vec![
            json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "upstream"}}),
            json!({"apiVersion": "rbac.authorization.k8s.io/v1", "kind": "ClusterRoleBinding",
                   "metadata": {"name": "b", "namespace": "bogus"},
                   "subjects": [{"kind": "ServiceAccount", "name": "sa", "namespace": "upstream"},
                                {"kind": "User", "name": "alice"}]}),
            json!({"apiVersion": "admissionregistration.k8s.io/v1", "kind": "ValidatingWebhookConfiguration",
                   "metadata": {"name": "w"},
                   "webhooks": [{"name": "w", "clientConfig": {"service": {"name": "svc", "namespace": "upstream"}}}]}),
        ];
        let items = transform(&docs, &cfg()).unwrap();
        let by_kind = |k: &str| items.iter().find(|i| i.id.kind == k).unwrap();
        assert_eq!(by_kind("Namespace").id.name, "ci");
        let crb = by_kind("ClusterRoleBinding");
        assert_eq!(crb.id.namespace, None);
        assert_eq!(crb.payload["subjects"][0]["namespace"], "ci");
        assert!(crb.payload["subjects"][1].get("namespace").is_none());
        let hook = by_kind("ValidatingWebhookConfiguration");
        assert_eq!(hook.payload["webhooks"][0]["clientConfig"]["service"]["namespace"], "ci");
    }

    #[test]
    fn ordering_hints_sort_stably() {
        let docs = vec![
            json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "b"}}),
            json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a"}}),
            json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "first",
                   "annotations": {"keel.dev/apply-order": "-500"}}}),
            json!({"apiVersion": "apiextensions.k8s.io/v1", "kind": "CustomResourceDefinition", "metadata": {"name": "x.y"}}),
        ];
        let items = transform(&docs, &cfg()).unwrap();
        let names: Vec<&str> = items.iter().map(|i| i.id.name.as_str()).collect();
        assert_eq!(names, ["first", "x.y", "b", "a"]);
    }

    #[test]
    fn bad_order_annotation_and_duplicates_rejected() {
        let bad = json!({"apiVersion": "v1", "kind": "ConfigMap",
                         "metadata": {"name": "a", "annotations": {"keel.dev/apply-order": "soon"}}});
        assert!(matches!(
            transform(&[bad], &cfg()),
            Err(Error::ManifestTransform { ref stage, .. }) if stage == "order"
        ));
        let cm = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a"}});
        assert!(matches!(
            transform(&[cm.clone(), cm], &cfg()),
            Err(Error::ManifestTransform { ref stage, .. }) if stage == "identity"
        ));
    }

    #[test]
    fn render_is_deterministic_and_config_sensitive() {
        let source = StaticSource::builtin().unwrap();
        let spec = ComponentSpec {
            kind: "pipeline".into(),
            version: "v0.9.0".into(),
            target_namespace: "ci".into(),
            config: Default::default(),
        };
        let a = render(&source, "pipeline", &spec).unwrap();
        let b = render(&source, "pipeline", &spec).unwrap();
        assert_eq!(a, b);
        assert!(a.hash.starts_with("sha256:"));
        assert_eq!(a.items[0].id.kind, "Namespace");
        assert_eq!(a.items.last().unwrap().id.kind, "ValidatingWebhookConfiguration");

        let mut spec2 = spec.clone();
        spec2.config.insert("images".into(), json!({"controller": "mirror/ctrl:v0.9.0"}));
        let c = render(&source, "pipeline", &spec2).unwrap();
        assert_ne!(a.hash, c.hash);

        let mut spec3 = spec;
        spec3.version = "v0.10.0".into();
        assert_ne!(a.hash, render(&source, "pipeline", &spec3).unwrap().hash);
    }
}
