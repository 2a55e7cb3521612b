//! Level-triggered runtime: watches feed per-kind work queues, fixed worker
//! pools drain them, and a periodic resync re-enqueues every known key.
//!
//! A key is never reconciled by two workers at once; rapid changes to one
//! key coalesce into a single pass. Errors requeue with per-key backoff,
//! conflicts requeue immediately.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use futures::StreamExt;
use metrics::counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use keel_core::{
    labels, Component, ComponentKind, Delta, DeltaKind, InstallerSet, LabelSelector, Object,
    ObjectKey, Result, Stack, TypeRef,
};
use keel_kubehub::typed;
use keel_store::WorkQueue;

use crate::component::reconcile_component;
use crate::orchestrator::{owning_stack, reconcile_stack};
use crate::{Action, Context};

/// Workload kinds whose status changes can flip an installer set's readiness.
pub fn workload_types() -> Vec<TypeRef> {
    vec![
        TypeRef::new("apps/v1", "Deployment"),
        TypeRef::new("apps/v1", "StatefulSet"),
        TypeRef::new("apps/v1", "DaemonSet"),
        TypeRef::new("batch/v1", "Job"),
        TypeRef::new("apiextensions.k8s.io/v1", "CustomResourceDefinition"),
    ]
}

const REWATCH_DELAY: Duration = Duration::from_secs(5);

/// Component names seen per (namespace, kind), used to route owned-object
/// events and to wake dependents.
type ComponentIndex = BTreeMap<ComponentKind, BTreeSet<ObjectKey>>;

pub struct Runtime {
    ctx: Arc<Context>,
    components: BTreeMap<ComponentKind, WorkQueue<ObjectKey>>,
    /// Components whose kind is not registered; they only get their error status
    unknown: WorkQueue<ObjectKey>,
    stacks: WorkQueue<ObjectKey>,
    index: Mutex<ComponentIndex>,
}

impl Runtime {
    pub fn new(ctx: Arc<Context>) -> Self {
        let backoff = ctx.config.requeue_backoff;
        let components = ctx
            .kinds
            .kinds()
            .map(|k| (k.clone(), WorkQueue::new(format!("component/{k}"), backoff)))
            .collect();
        Self {
            components,
            unknown: WorkQueue::new("component/unknown", backoff),
            stacks: WorkQueue::new("stack", backoff),
            index: Mutex::new(BTreeMap::new()),
            ctx,
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn component_queue(&self, kind: &ComponentKind) -> &WorkQueue<ObjectKey> {
        self.components.get(kind).unwrap_or(&self.unknown)
    }

    pub fn stack_queue(&self) -> &WorkQueue<ObjectKey> {
        &self.stacks
    }

    fn index(&self) -> std::sync::MutexGuard<'_, ComponentIndex> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue_component(&self, kind: &ComponentKind, key: ObjectKey) {
        self.component_queue(kind).add(key);
    }

    /// Components of kinds that depend on `kind`, in `namespace`.
    fn dependents_of(&self, kind: &ComponentKind, namespace: Option<&str>) -> Vec<(ComponentKind, ObjectKey)> {
        let index = self.index();
        self.ctx
            .graph
            .dependents(kind)
            .into_iter()
            .flat_map(|dep| {
                index
                    .get(&dep)
                    .into_iter()
                    .flatten()
                    .filter(|k| k.namespace.as_deref() == namespace)
                    .map(move |k| (dep.clone(), k.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Route one observed change to every queue it affects.
    pub fn observe(&self, delta: &Delta) {
        let res = &delta.object;
        if res.api_version != keel_core::API_VERSION {
            self.observe_managed(delta);
        } else if res.kind == Component::KIND {
            self.observe_component(delta);
        } else if res.kind == Stack::KIND {
            if delta.kind != DeltaKind::Deleted {
                self.stacks
                    .add(ObjectKey::new(res.metadata.namespace.as_deref(), &res.metadata.name));
            }
        } else if res.kind == InstallerSet::KIND {
            let labels = &res.metadata.labels;
            if let (Some(name), Some(kind)) =
                (labels.get(labels::COMPONENT), labels.get(labels::COMPONENT_KIND))
            {
                let key = ObjectKey::new(res.metadata.namespace.as_deref(), name.as_str());
                self.enqueue_component(&ComponentKind::from(kind.as_str()), key);
            }
        }
    }

    fn observe_component(&self, delta: &Delta) {
        let Ok(component) = delta.object.to_object::<Component>() else {
            warn!(object = %delta.object.object_ref(), "undecodable component");
            return;
        };
        let kind = component.spec.kind.clone();
        let key = component.key();
        let gone = delta.kind == DeltaKind::Deleted;
        {
            let mut index = self.index();
            let entry = index.entry(kind.clone()).or_default();
            if gone {
                entry.remove(&key);
            } else {
                entry.insert(key.clone());
            }
        }
        for (dep_kind, dep_key) in self.dependents_of(&kind, key.namespace.as_deref()) {
            self.enqueue_component(&dep_kind, dep_key);
        }
        // prerequisites waiting in their finalizer for this one to go
        if gone || component.metadata.is_deleting() {
            for prereq in self.ctx.graph.prerequisites(&kind) {
                for k in self.known(prereq, key.namespace.as_deref()) {
                    self.enqueue_component(prereq, k);
                }
            }
        }
        if let Some(stack) = owning_stack(&component.metadata) {
            self.stacks.add(stack);
        }
        if !gone {
            self.enqueue_component(&kind, key);
        }
    }

    /// A managed manifest changed: wake every known component with the
    /// owning name, since manifests may live outside the component's namespace.
    fn observe_managed(&self, delta: &Delta) {
        let labels = &delta.object.metadata.labels;
        if labels.get(labels::MANAGED_BY).map(String::as_str) != Some(labels::MANAGED_BY_VALUE) {
            return;
        }
        let (Some(name), Some(kind)) = (labels.get(labels::COMPONENT), labels.get(labels::COMPONENT_KIND)) else {
            return;
        };
        let kind = ComponentKind::from(kind.as_str());
        let owners: Vec<ObjectKey> = self
            .index()
            .get(&kind)
            .into_iter()
            .flatten()
            .filter(|k| &k.name == name)
            .cloned()
            .collect();
        for key in owners {
            self.enqueue_component(&kind, key);
        }
    }

    fn known(&self, kind: &ComponentKind, namespace: Option<&str>) -> Vec<ObjectKey> {
        self.index()
            .get(kind)
            .into_iter()
            .flatten()
            .filter(|k| k.namespace.as_deref() == namespace)
            .cloned()
            .collect()
    }

    /// Enqueue every component and stack currently stored. Returns how many keys were added.
    pub async fn resync(&self) -> Result<usize> {
        let ns = self.ctx.config.watch_namespace.as_deref();
        let everything = LabelSelector::everything();
        let components: Vec<Component> = typed::list(&*self.ctx.store, ns, &everything).await?;
        let stacks: Vec<Stack> = typed::list(&*self.ctx.store, ns, &everything).await?;
        let n = components.len() + stacks.len();
        for c in components {
            self.index()
                .entry(c.spec.kind.clone())
                .or_default()
                .insert(c.key());
            self.enqueue_component(&c.spec.kind, c.key());
        }
        for s in stacks {
            self.stacks.add(s.key());
        }
        debug!(keys = n, "resync");
        Ok(n)
    }

    fn finish(&self, queue: &WorkQueue<ObjectKey>, key: &ObjectKey, result: Result<Action>) {
        counter!("reconcile_total", 1u64, "queue" => queue.name().to_string());
        match result {
            Ok(Action::AwaitChange) => queue.forget(key),
            Ok(Action::Requeue(after)) => {
                queue.forget(key);
                queue.add_after(key.clone(), after);
            }
            Err(e) if e.is_conflict() => {
                debug!(queue = queue.name(), %key, error = %e, "conflict; re-reading");
                queue.add(key.clone());
            }
            Err(e) if e.is_cancelled() => {
                debug!(queue = queue.name(), %key, "pass abandoned on shutdown");
            }
            Err(e) => {
                counter!("reconcile_errors_total", 1u64, "queue" => queue.name().to_string(), "reason" => e.reason());
                let delay = queue.add_rate_limited(key.clone());
                warn!(queue = queue.name(), %key, error = %e, retry_in_ms = delay.as_millis() as u64, "reconcile failed");
            }
        }
        queue.done(key);
    }

    async fn component_worker(self: Arc<Self>, queue: WorkQueue<ObjectKey>) {
        while let Some(key) = queue.get().await {
            let result = reconcile_component(&self.ctx, &key).await;
            self.finish(&queue, &key, result);
        }
    }

    async fn stack_worker(self: Arc<Self>) {
        let queue = self.stacks.clone();
        while let Some(key) = queue.get().await {
            let result = reconcile_stack(&self.ctx, &key).await;
            self.finish(&queue, &key, result);
        }
    }

    async fn watch_type(self: Arc<Self>, type_ref: TypeRef, namespace: Option<String>, token: CancellationToken) {
        loop {
            match self.ctx.store.watch(&type_ref, namespace.as_deref()).await {
                Ok(mut stream) => {
                    debug!(type_ref = %type_ref, "watch established");
                    loop {
                        let next = tokio::select! {
                            _ = token.cancelled() => return,
                            d = stream.next() => d,
                        };
                        match next {
                            Some(delta) => self.observe(&delta),
                            None => break,
                        }
                    }
                }
                Err(e) if e.is_cancelled() => return,
                Err(e) => warn!(type_ref = %type_ref, error = %e, "watch failed"),
            }
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(REWATCH_DELAY) => {}
            }
        }
    }

    async fn resync_loop(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.ctx.config.resync_interval);
        // the first tick fires immediately; watches already list everything
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.resync().await {
                        warn!(error = %e, "resync failed");
                    }
                }
            }
        }
    }

    fn queues(&self) -> impl Iterator<Item = &WorkQueue<ObjectKey>> {
        self.components
            .values()
            .chain([&self.unknown, &self.stacks])
    }

    /// Run watches, workers and resync until `token` is cancelled, then shut
    /// the queues down and wait for in-flight passes to return.
    ///
    /// The store in the context should be bound to the same token (see
    /// `keel_kubehub::Cancellable`) so in-flight passes abandon promptly.
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> Result<()> {
        let workers = self.ctx.config.workers_per_kind;
        let ns = self.ctx.config.watch_namespace.clone();
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        for type_ref in [Component::type_ref(), Stack::type_ref(), InstallerSet::type_ref()] {
            tasks.push(tokio::spawn(Arc::clone(&self).watch_type(type_ref, ns.clone(), token.clone())));
        }
        for type_ref in workload_types() {
            tasks.push(tokio::spawn(Arc::clone(&self).watch_type(type_ref, None, token.clone())));
        }
        for queue in self.components.values() {
            for _ in 0..workers {
                tasks.push(tokio::spawn(Arc::clone(&self).component_worker(queue.clone())));
            }
        }
        tasks.push(tokio::spawn(Arc::clone(&self).component_worker(self.unknown.clone())));
        for _ in 0..workers {
            tasks.push(tokio::spawn(Arc::clone(&self).stack_worker()));
        }
        tasks.push(tokio::spawn(Arc::clone(&self).resync_loop(token.clone())));
        info!(kinds = self.components.len(), workers, "operator running");

        token.cancelled().await;
        info!("shutting down");
        for queue in self.queues() {
            queue.shutdown();
        }
        for res in join_all(tasks).await {
            if let Err(e) = res {
                warn!(error = %e, "task ended abnormally");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{ComponentSpec, Resource};
    use keel_kubehub::MemoryStore;

    fn runtime() -> Runtime {
        let ctx = Context::builder(Arc::new(MemoryStore::new())).build().unwrap();
        Runtime::new(Arc::new(ctx))
    }

    fn component(name: &str, kind: &str) -> Component {
        Component::new(
            name,
            Some("keel"),
            ComponentSpec {
                kind: kind.into(),
                ..Default::default()
            },
        )
    }

    fn applied(res: Resource) -> Delta {
        Delta {
            kind: DeltaKind::Applied,
            object: res,
        }
    }

    #[test]
    fn component_change_wakes_itself_and_dependents() {
        let rt = runtime();
        let triggers = component("triggers", "triggers");
        rt.observe(&applied(Resource::from_object(&triggers).unwrap()));
        assert_eq!(rt.component_queue(&"triggers".into()).len(), 1);

        let pipeline = component("pipeline", "pipeline");
        rt.observe(&applied(Resource::from_object(&pipeline).unwrap()));
        assert_eq!(rt.component_queue(&"pipeline".into()).len(), 1);
        // already queued; the second add coalesces
        assert_eq!(rt.component_queue(&"triggers".into()).len(), 1);
    }

    #[tokio::test]
    async fn managed_object_routes_to_owner() {
        let rt = runtime();
        let pipeline = component("pipeline", "pipeline");
        rt.observe(&applied(Resource::from_object(&pipeline).unwrap()));
        let queue = rt.component_queue(&"pipeline".into());
        let key = queue.get().await.unwrap();
        queue.done(&key);
        assert!(queue.is_empty());

        let deploy = |managed: bool| {
            let mut meta_labels = serde_json::Map::new();
            meta_labels.insert(labels::COMPONENT.into(), "pipeline".into());
            meta_labels.insert(labels::COMPONENT_KIND.into(), "pipeline".into());
            if managed {
                meta_labels.insert(labels::MANAGED_BY.into(), labels::MANAGED_BY_VALUE.into());
            }
            Resource::from_json(serde_json::json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": { "name": "controller", "namespace": "tekton-pipelines", "labels": meta_labels },
            }))
            .unwrap()
        };
        rt.observe(&applied(deploy(false)));
        assert!(queue.is_empty());
        rt.observe(&applied(deploy(true)));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some(key));
    }

    #[test]
    fn unknown_kind_goes_to_fallback_queue() {
        let rt = runtime();
        let c = component("mystery", "mystery");
        rt.observe(&applied(Resource::from_object(&c).unwrap()));
        assert_eq!(rt.component_queue(&"mystery".into()).name(), "component/unknown");
        assert_eq!(rt.component_queue(&"mystery".into()).len(), 1);
    }

    #[test]
    fn stack_owner_is_woken_by_child_change() {
        let rt = runtime();
        let mut child = component("pipeline", "pipeline");
        child.metadata.labels.insert(labels::STACK.into(), "ci".into());
        rt.observe(&applied(Resource::from_object(&child).unwrap()));
        assert_eq!(rt.stack_queue().len(), 1);
    }
}
