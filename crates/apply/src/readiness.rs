//! Readiness predicates evaluated against live objects.

use serde_json::Value as Json;

use keel_core::{ReadinessProbe, Resource};

fn int(v: Option<&Json>) -> Option<i64> {
    v.and_then(Json::as_i64)
}

/// The controller has observed the object's current generation.
fn observed_current(res: &Resource, status: &Json) -> bool {
    int(status.get("observedGeneration")).unwrap_or(0) >= res.metadata.generation
}

fn desired_replicas(res: &Resource) -> i64 {
    int(res.field("spec").and_then(|s| s.get("replicas"))).unwrap_or(1)
}

pub fn is_ready(probe: ReadinessProbe, live: &Resource) -> bool {
    let status = live.field("status").unwrap_or(&Json::Null);
    match probe {
        ReadinessProbe::Exists => true,
        ReadinessProbe::DeploymentAvailable => {
            let want = desired_replicas(live);
            observed_current(live, status)
                && int(status.get("readyReplicas")).unwrap_or(0) >= want
                && int(status.get("availableReplicas")).unwrap_or(0) >= want
        }
        ReadinessProbe::StatefulSetReady => {
            observed_current(live, status)
                && int(status.get("readyReplicas")).unwrap_or(0) >= desired_replicas(live)
        }
        ReadinessProbe::DaemonSetReady => {
            let desired = int(status.get("desiredNumberScheduled"));
            observed_current(live, status)
                && desired.is_some()
                && int(status.get("numberReady")) >= desired
        }
        ReadinessProbe::JobComplete => int(status.get("succeeded")).unwrap_or(0) >= 1,
        ReadinessProbe::CrdEstablished => status
            .get("conditions")
            .and_then(Json::as_array)
            .is_some_and(|conds| {
                conds.iter().any(|c| {
                    c.get("type").and_then(Json::as_str) == Some("Established")
                        && c.get("status").and_then(Json::as_str) == Some("True")
                })
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn res(kind: &str, generation: i64, spec: Json, status: Json) -> Resource {
        let mut r = Resource::from_json(json!({
            "apiVersion": "apps/v1", "kind": kind,
            "metadata": {"name": "x", "namespace": "ns"},
            "spec": spec, "status": status,
        }))
        .unwrap();
        r.metadata.generation = generation;
        r
    }

    #[test]
    fn deployment_needs_current_generation_and_replicas() {
        let ok = res("Deployment", 2, json!({"replicas": 2}),
                     json!({"observedGeneration": 2, "readyReplicas": 2, "availableReplicas": 2}));
        assert!(is_ready(ReadinessProbe::DeploymentAvailable, &ok));
        let stale = res("Deployment", 3, json!({"replicas": 2}),
                        json!({"observedGeneration": 2, "readyReplicas": 2, "availableReplicas": 2}));
        assert!(!is_ready(ReadinessProbe::DeploymentAvailable, &stale));
        let short = res("Deployment", 1, json!({}), json!({"observedGeneration": 1}));
        assert!(!is_ready(ReadinessProbe::DeploymentAvailable, &short));
    }

    #[test]
    fn other_probes() {
        let job = res("Job", 1, json!({}), json!({"succeeded": 1}));
        assert!(is_ready(ReadinessProbe::JobComplete, &job));
        let ds = res("DaemonSet", 1, json!({}), json!({"observedGeneration": 1, "desiredNumberScheduled": 3, "numberReady": 2}));
        assert!(!is_ready(ReadinessProbe::DaemonSetReady, &ds));
        let crd = res("CustomResourceDefinition", 1, json!({}),
                      json!({"conditions": [{"type": "Established", "status": "True"}]}));
        assert!(is_ready(ReadinessProbe::CrdEstablished, &crd));
        assert!(!is_ready(ReadinessProbe::CrdEstablished, &job));
        assert!(is_ready(ReadinessProbe::Exists, &job));
    }
}
