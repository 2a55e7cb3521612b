//! Workload settler for the in-memory cluster.
//!
//! Stands in for the controllers a real cluster runs: deployments report
//! ready replicas for their current generation, jobs complete, CRDs become
//! established. Objects can be held back to simulate a workload that never
//! becomes ready.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::{json, Value as Json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use keel_core::{Resource, Result};

use crate::{MemoryStore, PatchTarget, ResourceStore};

pub struct Simulator {
    store: Arc<MemoryStore>,
    held: Mutex<BTreeSet<String>>,
}

impl Simulator {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            held: Mutex::new(BTreeSet::new()),
        }
    }

    /// Never settle objects with this name.
    pub fn hold(&self, name: &str) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string());
    }

    pub fn release(&self, name: &str) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    fn is_held(&self, name: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }

    /// Bring every workload's status in line with its spec. Returns how many objects changed.
    pub async fn settle(&self) -> Result<usize> {
        let mut changed = 0;
        for res in self.store.objects() {
            if self.is_held(&res.metadata.name) {
                continue;
            }
            let Some(desired) = settled_status(&res) else {
                continue;
            };
            if status_matches(&res, &desired) {
                continue;
            }
            let patch = json!({ "status": desired });
            match self
                .store
                .patch(&res.object_ref(), &patch, res.version(), PatchTarget::Status)
                .await
            {
                Ok(_) => changed += 1,
                Err(e) if e.is_conflict() || e.is_not_found() => {
                    debug!(object = %res.object_ref(), "object moved while settling");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(changed)
    }

    pub fn spawn(self: Arc<Self>, every: Duration, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.settle().await {
                            warn!(error = %e, "simulator settle failed");
                        }
                    }
                }
            }
        })
    }
}

fn replicas(res: &Resource) -> i64 {
    res.field("spec")
        .and_then(|s| s.get("replicas"))
        .and_then(Json::as_i64)
        .unwrap_or(1)
}

fn settled_status(res: &Resource) -> Option<Json> {
    let generation = res.metadata.generation;
    match res.kind.as_str() {
        "Deployment" | "StatefulSet" => {
            let r = replicas(res);
            Some(json!({
                "observedGeneration": generation,
                "replicas": r,
                "readyReplicas": r,
                "availableReplicas": r,
                "updatedReplicas": r,
            }))
        }
        "DaemonSet" => Some(json!({
            "observedGeneration": generation,
            "desiredNumberScheduled": 1,
            "numberReady": 1,
        })),
        "Job" => Some(json!({ "succeeded": 1 })),
        "CustomResourceDefinition" => Some(json!({
            "conditions": [ { "type": "Established", "status": "True" } ]
        })),
        _ => None,
    }
}

fn status_matches(res: &Resource, desired: &Json) -> bool {
    let current = res.field("status");
    match desired.as_object() {
        Some(fields) => fields
            .iter()
            .all(|(k, v)| current.and_then(|c| c.get(k)) == Some(v)),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn settles_deployments_and_respects_holds() {
        let store = Arc::new(MemoryStore::new());
        for name in ["a", "b"] {
            let d = Resource::from_json(json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": { "name": name, "namespace": "ns" },
                "spec": { "replicas": 2 }
            }))
            .unwrap();
            store.create(&d).await.unwrap();
        }
        let sim = Simulator::new(store.clone());
        sim.hold("b");
        assert_eq!(sim.settle().await.unwrap(), 1);
        assert_eq!(sim.settle().await.unwrap(), 0);

        let a = store
            .objects()
            .into_iter()
            .find(|r| r.metadata.name == "a")
            .unwrap();
        assert_eq!(a.body["status"]["readyReplicas"], 2);
        assert_eq!(a.body["status"]["observedGeneration"], 1);
    }
}
