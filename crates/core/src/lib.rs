//! Keel core: the data model shared by the installer-set controller, the
//! component reconciler and the orchestrator.

#![forbid(unsafe_code)]

pub mod backoff;
pub mod condition;
pub mod error;
pub mod graph;
pub mod hash;
pub mod resource;
pub mod types;

pub use backoff::Backoff;
pub use condition::{Condition, ConditionStatus, ConditionSurface, Conditions};
pub use error::{Error, Result};
pub use graph::DependencyGraph;
pub use resource::{
    Delta, DeltaKind, LabelSelector, Object, ObjectKey, ObjectMeta, ObjectRef, Resource, TypeRef,
};
pub use types::*;

pub mod prelude {
    pub use super::{
        Component, ComponentKind, ComponentPhase, ComponentSpec, ComponentStatus, Condition,
        ConditionStatus, ConditionSurface, Conditions, DependencyGraph, Error, InstallerSet,
        InstallerSetPhase, ManifestId, ManifestItem, Object, ObjectKey, ObjectMeta, ObjectRef,
        ReadinessProbe, Resource, Stack, TypeRef,
    };
}
