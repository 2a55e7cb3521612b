//! Keel reconcile: the component state machine, the stack orchestrator and
//! the worker runtime that drives both.

#![forbid(unsafe_code)]

use std::time::Duration;

pub mod component;
pub mod config;
pub mod context;
pub mod kinds;
pub mod orchestrator;
pub mod runtime;

pub use component::reconcile_component;
pub use config::OperatorConfig;
pub use context::{Context, ContextBuilder};
pub use kinds::{ComponentStrategy, KindRegistry, StandardComponent, DEFAULT_NAMESPACE};
pub use orchestrator::{child_name, reconcile_stack};
pub use runtime::Runtime;

/// What the runtime should do with a key after a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Look again after the delay even if nothing changes
    Requeue(Duration),
    /// Nothing to do until a watched object changes (or the next resync)
    AwaitChange,
}

impl Action {
    pub fn requeue(after: Duration) -> Self {
        Self::Requeue(after)
    }

    pub fn await_change() -> Self {
        Self::AwaitChange
    }
}
