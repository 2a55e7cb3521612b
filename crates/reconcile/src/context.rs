//! Shared reconciler context.

use std::sync::Arc;

use tracing::warn;

use keel_apply::InstallerSetController;
use keel_core::{ComponentKind, DependencyGraph, Result};
use keel_kubehub::ResourceStore;
use keel_persist::{Ledger, NullLedger};
use keel_schema::{Defaulter, SpecDefaulter, SpecValidator, ValidationContext, Validator};
use keel_transform::{ManifestSource, StaticSource};

use crate::config::OperatorConfig;
use crate::kinds::{ComponentStrategy, KindRegistry};

/// Everything a reconcile pass needs, built once at startup and shared by
/// every worker.
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(store)
///     .source(Arc::new(DirSource::new("releases")))
///     .ledger(Arc::new(SqliteLedger::open_default()?))
///     .build()?;
/// ```
pub struct Context {
    pub store: Arc<dyn ResourceStore>,
    pub kinds: KindRegistry,
    /// Derived from `kinds`; acyclic
    pub graph: DependencyGraph,
    pub source: Arc<dyn ManifestSource>,
    pub validator: Arc<dyn Validator>,
    pub defaulter: Arc<dyn Defaulter>,
    pub installer_sets: InstallerSetController,
    pub config: OperatorConfig,
}

impl Context {
    pub fn builder(store: Arc<dyn ResourceStore>) -> ContextBuilder {
        ContextBuilder::new(store)
    }

    pub fn strategy(&self, kind: &ComponentKind) -> Option<Arc<dyn ComponentStrategy>> {
        self.kinds.get(kind).cloned()
    }

    /// Validation inputs for one component of `strategy`'s kind.
    pub fn validation_context<'a>(
        &self,
        component: &'a str,
        strategy: &'a dyn ComponentStrategy,
        supported_versions: &'a [String],
    ) -> ValidationContext<'a> {
        ValidationContext {
            component,
            supported_versions,
            extra_config_keys: strategy.extra_config_keys(),
            default_namespace: strategy.default_namespace(),
            config_schema: strategy.config_schema(),
        }
    }
}

/// Builder for [`Context`].
///
/// Anything not set falls back to the built-in kinds, the releases shipped
/// with the operator, the structural validator/defaulter and no ledger.
pub struct ContextBuilder {
    store: Arc<dyn ResourceStore>,
    kinds: Option<KindRegistry>,
    source: Option<Arc<dyn ManifestSource>>,
    validator: Option<Arc<dyn Validator>>,
    defaulter: Option<Arc<dyn Defaulter>>,
    ledger: Option<Arc<dyn Ledger>>,
    config: OperatorConfig,
}

impl ContextBuilder {
    fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self {
            store,
            kinds: None,
            source: None,
            validator: None,
            defaulter: None,
            ledger: None,
            config: OperatorConfig::default(),
        }
    }

    pub fn kinds(mut self, kinds: KindRegistry) -> Self {
        self.kinds = Some(kinds);
        self
    }

    pub fn source(mut self, source: Arc<dyn ManifestSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn defaulter(mut self, defaulter: Arc<dyn Defaulter>) -> Self {
        self.defaulter = Some(defaulter);
        self
    }

    pub fn ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn config(mut self, config: OperatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the context. A cyclic or dangling dependency graph is fatal here,
    /// before any worker starts.
    pub fn build(self) -> Result<Context> {
        let kinds = self.kinds.unwrap_or_else(KindRegistry::builtin);
        let graph = kinds.graph()?;
        let source = match self.source {
            Some(s) => s,
            None => Arc::new(StaticSource::builtin()?),
        };
        for kind in kinds.kinds() {
            if source.supported_versions(kind).is_empty() {
                warn!(kind = %kind, "manifest source has no releases for kind");
            }
        }
        let ledger = self.ledger.unwrap_or_else(|| Arc::new(NullLedger));
        let installer_sets =
            InstallerSetController::new(Arc::clone(&self.store), ledger, self.config.rollout);
        Ok(Context {
            store: self.store,
            kinds,
            graph,
            source,
            validator: self.validator.unwrap_or_else(|| Arc::new(SpecValidator)),
            defaulter: self.defaulter.unwrap_or_else(|| Arc::new(SpecDefaulter)),
            installer_sets,
            config: self.config,
        })
    }
}
