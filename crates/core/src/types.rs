//! Keel resource kinds: components, installer sets and stacks.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::condition::{Condition, ConditionSurface, Conditions};
use crate::resource::{Object, ObjectMeta, ObjectRef, TypeRef};

/// API group/version of every Keel-owned kind.
pub const API_VERSION: &str = "operator.keel.dev/v1alpha1";

/// Finalizer guarding components and stacks until owned resources are gone.
pub const FINALIZER: &str = "keel.dev/finalizer";

/// Well-known labels and annotations stamped on managed objects.
pub mod labels {
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
    pub const MANAGED_BY_VALUE: &str = "keel";
    pub const PART_OF: &str = "app.kubernetes.io/part-of";
    pub const VERSION: &str = "app.kubernetes.io/version";
    pub const COMPONENT: &str = "keel.dev/component";
    pub const COMPONENT_KIND: &str = "keel.dev/component-kind";
    pub const INSTALLER_SET: &str = "keel.dev/installer-set";
    pub const STACK: &str = "keel.dev/stack";
    /// Annotation carrying an explicit apply-order hint
    pub const APPLY_ORDER: &str = "keel.dev/apply-order";
    /// Annotation carrying the release a manifest was rendered from
    pub const RELEASE: &str = "keel.dev/release";
    /// Annotation carrying an installer set's content hash
    pub const CONTENT_HASH: &str = "keel.dev/content-hash";
}

/// Condition types used across Keel resources.
pub mod conditions {
    pub use crate::condition::READY;
    pub const DEPENDENCIES_READY: &str = "DependenciesReady";
    pub const SPEC_VALID: &str = "SpecValid";
    pub const INSTALLER_SET_READY: &str = "InstallerSetReady";
    pub const MANIFESTS_APPLIED: &str = "ManifestsApplied";
    pub const COMPONENTS_READY: &str = "ComponentsReady";
}

/// Identifier of a component kind (e.g. `pipeline`, `triggers`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentKind(String);

impl ComponentKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ComponentKind {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::borrow::Borrow<str> for ComponentKind {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// ---- Component ----

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    pub kind: ComponentKind,
    /// Target release; empty means "newest supported"
    #[serde(default)]
    pub version: String,
    /// Install namespace; empty means the kind's default
    #[serde(default)]
    pub target_namespace: String,
    /// Kind-specific overrides, opaque to the core
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, Json>,
}

impl Default for ComponentKind {
    fn default() -> Self {
        Self(String::new())
    }
}

/// Lifecycle phase of a component
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentPhase {
    #[default]
    Pending,
    Waiting,
    Installing,
    Ready,
    Upgrading,
    Error,
    Deleting,
}

impl fmt::Display for ComponentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Waiting => "Waiting",
            Self::Installing => "Installing",
            Self::Ready => "Ready",
            Self::Upgrading => "Upgrading",
            Self::Error => "Error",
            Self::Deleting => "Deleting",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    #[serde(default)]
    pub phase: ComponentPhase,
    #[serde(default)]
    pub conditions: Conditions,
    /// Last spec generation fully processed
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_installer_set: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_hash: Option<String>,
    /// Previously Ready bundle kept as rollback target during an upgrade
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retained_installer_set: Option<String>,
    /// Content hash of an upgrade that was rolled back; not retried until inputs change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_hash: Option<String>,
}

impl ConditionSurface for ComponentStatus {
    fn conditions(&self) -> &[Condition] {
        self.conditions.conditions()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub metadata: ObjectMeta,
    pub spec: ComponentSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ComponentStatus>,
}

impl Component {
    pub fn new(name: &str, namespace: Option<&str>, spec: ComponentSpec) -> Self {
        Self {
            metadata: ObjectMeta::named(name, namespace),
            spec,
            status: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status.as_ref().map(|s| s.ready()).unwrap_or(false)
    }

    pub fn phase(&self) -> ComponentPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }
}

impl Object for Component {
    const API_VERSION: &'static str = API_VERSION;
    const KIND: &'static str = "Component";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

// ---- Manifests ----

/// Identity of one manifest document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestId {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ManifestId {
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(
            &TypeRef::new(self.api_version.clone(), self.kind.clone()),
            self.namespace.as_deref(),
            self.name.clone(),
        )
    }
}

impl fmt::Display for ManifestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Readiness predicate evaluated against the live object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadinessProbe {
    /// Ready as soon as the object exists
    #[default]
    Exists,
    /// `readyReplicas` reached `spec.replicas` for the current generation
    DeploymentAvailable,
    StatefulSetReady,
    DaemonSetReady,
    /// `status.succeeded >= 1`
    JobComplete,
    /// `Established=True` condition
    CrdEstablished,
}

/// A single declarative document plus how to apply and judge it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestItem {
    pub id: ManifestId,
    /// Ordering hint; lower applies first, ties keep list order
    #[serde(default)]
    pub order: i32,
    pub payload: Json,
    #[serde(default)]
    pub readiness: ReadinessProbe,
}

// ---- InstallerSet ----

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstallerSetPhase {
    #[default]
    Pending,
    Applying,
    PartiallyFailed,
    Ready,
    Superseded,
    Deleting,
}

impl fmt::Display for InstallerSetPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Applying => "Applying",
            Self::PartiallyFailed => "PartiallyFailed",
            Self::Ready => "Ready",
            Self::Superseded => "Superseded",
            Self::Deleting => "Deleting",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemState {
    #[default]
    Pending,
    /// Written to the store, readiness predicate not yet satisfied
    Applied,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemStatus {
    pub state: ItemState,
    /// Consecutive failed apply attempts
    #[serde(default)]
    pub failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub permanent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallerSetSpec {
    /// Owning component name
    pub component: String,
    pub component_kind: ComponentKind,
    pub version: String,
    pub hash: String,
    pub items: Vec<ManifestItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallerSetStatus {
    #[serde(default)]
    pub phase: InstallerSetPhase,
    /// Per-manifest status keyed by manifest identity
    #[serde(default)]
    pub items: BTreeMap<String, ItemStatus>,
    #[serde(default)]
    pub conditions: Conditions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_at: Option<DateTime<Utc>>,
}

impl ConditionSurface for InstallerSetStatus {
    fn conditions(&self) -> &[Condition] {
        self.conditions.conditions()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallerSet {
    pub metadata: ObjectMeta,
    pub spec: InstallerSetSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<InstallerSetStatus>,
}

impl InstallerSet {
    pub fn hash(&self) -> &str {
        &self.spec.hash
    }

    pub fn phase(&self) -> InstallerSetPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    pub fn is_ready(&self) -> bool {
        self.status.as_ref().map(|s| s.ready()).unwrap_or(false)
    }

    /// Item whose consecutive failures reached `threshold`, if any.
    pub fn item_past_threshold(&self, threshold: u32) -> Option<(&str, &ItemStatus)> {
        let status = self.status.as_ref()?;
        status
            .items
            .iter()
            .filter(|(_, s)| s.state == ItemState::Failed && s.failures >= threshold)
            .max_by_key(|(_, s)| s.failures)
            .map(|(k, s)| (k.as_str(), s))
    }

    /// Identities of every manifest this set owns.
    pub fn manifest_ids(&self) -> impl Iterator<Item = &ManifestId> {
        self.spec.items.iter().map(|i| &i.id)
    }
}

impl Object for InstallerSet {
    const API_VERSION: &'static str = API_VERSION;
    const KIND: &'static str = "InstallerSet";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

// ---- Stack (top-level resource) ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackComponent {
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, Json>,
}

fn enabled_by_default() -> bool {
    true
}

impl Default for StackComponent {
    fn default() -> Self {
        Self {
            enabled: true,
            version: String::new(),
            config: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackSpec {
    /// Install namespace applied to every component that does not set one
    #[serde(default)]
    pub target_namespace: String,
    #[serde(default)]
    pub components: BTreeMap<ComponentKind, StackComponent>,
}

impl StackSpec {
    pub fn is_enabled(&self, kind: &ComponentKind) -> bool {
        self.components.get(kind).map(|c| c.enabled).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSummary {
    pub phase: ComponentPhase,
    pub ready: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackStatus {
    #[serde(default)]
    pub conditions: Conditions,
    #[serde(default)]
    pub components: BTreeMap<ComponentKind, ComponentSummary>,
    #[serde(default)]
    pub observed_generation: i64,
}

impl ConditionSurface for StackStatus {
    fn conditions(&self) -> &[Condition] {
        self.conditions.conditions()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stack {
    pub metadata: ObjectMeta,
    pub spec: StackSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StackStatus>,
}

impl Stack {
    pub fn new(name: &str, namespace: Option<&str>, spec: StackSpec) -> Self {
        Self {
            metadata: ObjectMeta::named(name, namespace),
            spec,
            status: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status.as_ref().map(|s| s.ready()).unwrap_or(false)
    }
}

impl Object for Stack {
    const API_VERSION: &'static str = API_VERSION;
    const KIND: &'static str = "Stack";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
