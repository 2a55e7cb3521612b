//! Shared harness: an in-memory cluster, a workload simulator and a small
//! release table for `pipeline` and `triggers`.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use keel_apply::RolloutPolicy;
use keel_core::{
    labels, Backoff, Component, ComponentSpec, InstallerSet, Object, ObjectKey, ObjectRef,
    Resource, TypeRef,
};
use keel_kubehub::{typed, MemoryStore, ResourceStore, Simulator};
use keel_persist::SqliteLedger;
use keel_reconcile::{
    reconcile_component, Action, Context, KindRegistry, OperatorConfig, StandardComponent,
};
use keel_transform::StaticSource;

/// Namespace the Component and Stack records live in.
pub const NS: &str = "keel";
/// Namespace components install into.
pub const TARGET: &str = "ci";

pub const PIPELINE: &str = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: pipeline-config
data:
  mode: standard
---
apiVersion: v1
kind: ServiceAccount
metadata:
  name: pipeline-controller
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: pipeline-controller
spec:
  replicas: 1
  template:
    spec:
      serviceAccountName: pipeline-controller
      containers:
        - name: controller
          image: ${IMAGE:controller}
"#;

pub const PIPELINE_EXTRA: &str = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: pipeline-extra
data:
  feature: enabled
"#;

pub const TRIGGERS: &str = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: triggers-config
data:
  mode: standard
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: triggers-controller
spec:
  replicas: 1
  template:
    spec:
      containers:
        - name: controller
          image: ${IMAGE:controller}
"#;

pub fn source() -> StaticSource {
    let v2 = format!("{PIPELINE}---{PIPELINE_EXTRA}");
    StaticSource::new()
        .with_yaml("pipeline", "v1.0", PIPELINE, &[("controller", "registry.local/pipeline:1.0")])
        .and_then(|s| s.with_yaml("pipeline", "v1.1", PIPELINE, &[("controller", "registry.local/pipeline:1.1")]))
        .and_then(|s| s.with_yaml("pipeline", "v2.0", &v2, &[("controller", "registry.local/pipeline:2.0")]))
        .and_then(|s| s.with_yaml("triggers", "v1.0", TRIGGERS, &[("controller", "registry.local/triggers:1.0")]))
        .unwrap()
}

pub fn kinds() -> KindRegistry {
    KindRegistry::new()
        .with(StandardComponent::new("pipeline", TARGET))
        .with(StandardComponent::new("triggers", TARGET).requires(&["pipeline"]))
}

pub fn config(threshold: Option<u32>) -> OperatorConfig {
    OperatorConfig {
        not_ready_poll: Duration::from_millis(20),
        requeue_backoff: Backoff::new(Duration::from_millis(5), Duration::from_millis(100)),
        rollout: RolloutPolicy {
            failure_threshold: threshold,
            item_backoff: Backoff::immediate(),
        },
        ..Default::default()
    }
}

pub struct Env {
    pub store: Arc<MemoryStore>,
    pub sim: Simulator,
    pub ledger: Arc<SqliteLedger>,
    pub ctx: Context,
}

pub fn env(threshold: Option<u32>) -> Env {
    let store = Arc::new(MemoryStore::new());
    let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
    let ctx = Context::builder(store.clone())
        .kinds(kinds())
        .source(Arc::new(source()))
        .ledger(ledger.clone())
        .config(config(threshold))
        .build()
        .unwrap();
    Env {
        sim: Simulator::new(store.clone()),
        store,
        ledger,
        ctx,
    }
}

pub fn component(name: &str, kind: &str, version: &str) -> Component {
    Component::new(
        name,
        Some(NS),
        ComponentSpec {
            kind: kind.into(),
            version: version.into(),
            target_namespace: TARGET.into(),
            config: Default::default(),
        },
    )
}

impl Env {
    pub async fn create(&self, c: &Component) -> ObjectKey {
        typed::create(&*self.store, c).await.unwrap().key()
    }

    pub async fn fetch(&self, key: &ObjectKey) -> Option<Component> {
        typed::get(&*self.store, key).await.unwrap()
    }

    pub async fn must(&self, key: &ObjectKey) -> Component {
        self.fetch(key).await.expect("component exists")
    }

    /// Change the stored spec the way a user edit would.
    pub async fn edit(&self, key: &ObjectKey, f: impl FnOnce(&mut ComponentSpec)) {
        let mut c = self.must(key).await;
        f(&mut c.spec);
        typed::update(&*self.store, &c).await.unwrap();
    }

    /// One reconcile pass followed by the cluster catching up.
    pub async fn pass(&self, key: &ObjectKey) -> Action {
        let action = reconcile_component(&self.ctx, key).await.unwrap();
        self.sim.settle().await.unwrap();
        action
    }

    pub async fn drive_until(
        &self,
        key: &ObjectKey,
        passes: usize,
        done: impl Fn(&Component) -> bool,
    ) -> Component {
        for _ in 0..passes {
            self.pass(key).await;
            if let Some(c) = self.fetch(key).await {
                if done(&c) {
                    return c;
                }
            }
        }
        panic!("{key} did not converge in {passes} passes: {:?}", self.fetch(key).await);
    }

    pub async fn sets(&self, key: &ObjectKey) -> Vec<InstallerSet> {
        let c = self.must(key).await;
        self.ctx.installer_sets.list_for(&c).await.unwrap()
    }

    pub async fn live(&self, obj: &ObjectRef) -> Option<Resource> {
        keel_kubehub::get_opt(&*self.store, obj).await.unwrap()
    }

    /// Every stored object labelled as belonging to `component` (manifests and installer sets).
    pub fn owned(&self, component: &str) -> Vec<Resource> {
        self.store
            .objects()
            .into_iter()
            .filter(|r| r.metadata.labels.get(labels::COMPONENT).map(String::as_str) == Some(component))
            .collect()
    }

    pub async fn delete(&self, key: &ObjectKey) {
        let c = self.must(key).await;
        self.store.delete(&c.object_ref(), None).await.unwrap();
    }
}

pub fn cm_ref(name: &str) -> ObjectRef {
    ObjectRef::new(&TypeRef::new("v1", "ConfigMap"), Some(TARGET), name)
}

pub fn deploy_ref(name: &str) -> ObjectRef {
    ObjectRef::new(&TypeRef::new("apps/v1", "Deployment"), Some(TARGET), name)
}

pub fn image_of(deploy: &Resource) -> String {
    deploy
        .field("spec")
        .and_then(|s| s.pointer("/template/spec/containers/0/image"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}
