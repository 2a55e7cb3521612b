//! Per-kind defaults for manifests that carry no explicit hints.

use keel_core::ReadinessProbe;

/// Kinds that never take a namespace.
const CLUSTER_SCOPED: &[&str] = &[
    "Namespace",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleBinding",
    "MutatingWebhookConfiguration",
    "ValidatingWebhookConfiguration",
    "PriorityClass",
    "StorageClass",
    "PersistentVolume",
    "APIService",
];

pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED.contains(&kind)
}

/// Apply-order hint used when a manifest has no `keel.dev/apply-order` annotation.
///
/// Namespaces and CRDs first, then RBAC, configuration, workloads; admission
/// webhooks last so they never block their own backends.
pub fn default_order(kind: &str) -> i32 {
    match kind {
        "Namespace" => -100,
        "CustomResourceDefinition" => -90,
        "ServiceAccount" => -80,
        "ClusterRole" | "Role" => -70,
        "ClusterRoleBinding" | "RoleBinding" => -60,
        "ConfigMap" | "Secret" => -50,
        "PersistentVolumeClaim" => -40,
        "Service" => -30,
        "Deployment" | "StatefulSet" | "DaemonSet" => 0,
        "Job" | "CronJob" => 10,
        "HorizontalPodAutoscaler" | "PodDisruptionBudget" => 20,
        "MutatingWebhookConfiguration" | "ValidatingWebhookConfiguration" => 100,
        _ => 50,
    }
}

pub fn default_readiness(kind: &str) -> ReadinessProbe {
    match kind {
        "Deployment" => ReadinessProbe::DeploymentAvailable,
        "StatefulSet" => ReadinessProbe::StatefulSetReady,
        "DaemonSet" => ReadinessProbe::DaemonSetReady,
        "Job" => ReadinessProbe::JobComplete,
        "CustomResourceDefinition" => ReadinessProbe::CrdEstablished,
        _ => ReadinessProbe::Exists,
    }
}
