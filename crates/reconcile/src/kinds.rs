//! Per-kind strategy table.
//!
//! Every component kind shares the same state machine; what differs is
//! captured by a [`ComponentStrategy`] entry: where the kind installs by
//! default, which extra config keys it accepts, and which kinds must be
//! Ready before it may be installed.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value as Json;

use keel_core::{ComponentKind, DependencyGraph, Result};

/// Namespace the built-in kinds install into unless a spec says otherwise.
pub const DEFAULT_NAMESPACE: &str = "keel-pipelines";

pub trait ComponentStrategy: Send + Sync {
    fn kind(&self) -> &ComponentKind;

    fn default_namespace(&self) -> &str;

    /// Kinds that must be Ready before this one is installed.
    fn prerequisites(&self) -> &[ComponentKind];

    /// Config keys accepted on top of the common ones.
    fn extra_config_keys(&self) -> &[&'static str] {
        &[]
    }

    fn config_schema(&self) -> Option<&Json> {
        None
    }
}

/// Table-driven strategy used for every built-in kind.
#[derive(Debug, Clone)]
pub struct StandardComponent {
    kind: ComponentKind,
    default_namespace: String,
    prerequisites: Vec<ComponentKind>,
    extra_config_keys: Vec<&'static str>,
    config_schema: Option<Json>,
}

impl StandardComponent {
    pub fn new(kind: impl Into<ComponentKind>, default_namespace: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            default_namespace: default_namespace.into(),
            prerequisites: Vec::new(),
            extra_config_keys: Vec::new(),
            config_schema: None,
        }
    }

    pub fn requires(mut self, kinds: &[&str]) -> Self {
        self.prerequisites
            .extend(kinds.iter().map(|k| ComponentKind::from(*k)));
        self
    }

    pub fn config_keys(mut self, keys: &[&'static str]) -> Self {
        self.extra_config_keys.extend_from_slice(keys);
        self
    }

    pub fn schema(mut self, schema: Json) -> Self {
        self.config_schema = Some(schema);
        self
    }
}

impl ComponentStrategy for StandardComponent {
    fn kind(&self) -> &ComponentKind {
        &self.kind
    }

    fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    fn prerequisites(&self) -> &[ComponentKind] {
        &self.prerequisites
    }

    fn extra_config_keys(&self) -> &[&'static str] {
        &self.extra_config_keys
    }

    fn config_schema(&self) -> Option<&Json> {
        self.config_schema.as_ref()
    }
}

#[derive(Clone, Default)]
pub struct KindRegistry {
    kinds: BTreeMap<ComponentKind, Arc<dyn ComponentStrategy>>,
}

impl std::fmt::Debug for KindRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.kinds.keys()).finish()
    }
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// pipeline, triggers, dashboard, results and chains.
    pub fn builtin() -> Self {
        Self::new()
            .with(StandardComponent::new("pipeline", DEFAULT_NAMESPACE))
            .with(StandardComponent::new("triggers", DEFAULT_NAMESPACE).requires(&["pipeline"]))
            .with(
                StandardComponent::new("dashboard", DEFAULT_NAMESPACE)
                    .requires(&["pipeline", "triggers"]),
            )
            .with(StandardComponent::new("results", DEFAULT_NAMESPACE).requires(&["pipeline"]))
            .with(StandardComponent::new("chains", DEFAULT_NAMESPACE).requires(&["pipeline"]))
    }

    /// Register (or replace) the strategy for its kind.
    pub fn register(&mut self, strategy: impl ComponentStrategy + 'static) -> &mut Self {
        self.kinds
            .insert(strategy.kind().clone(), Arc::new(strategy));
        self
    }

    pub fn with(mut self, strategy: impl ComponentStrategy + 'static) -> Self {
        self.register(strategy);
        self
    }

    pub fn get(&self, kind: &ComponentKind) -> Option<&Arc<dyn ComponentStrategy>> {
        self.kinds.get(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &ComponentKind> {
        self.kinds.keys()
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// The dependency graph the registered prerequisites describe. Fails on
    /// cycles and on prerequisites that are not registered.
    pub fn graph(&self) -> Result<DependencyGraph> {
        DependencyGraph::new(
            self.kinds
                .iter()
                .map(|(kind, s)| (kind.clone(), s.prerequisites().to_vec())),
        )
    }
}
