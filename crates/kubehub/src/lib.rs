//! Keel kubehub: the resource store seam.
//!
//! Everything that talks to a cluster goes through [`ResourceStore`]. Two
//! implementations ship here: [`MemoryStore`], an in-process versioned store
//! that behaves like an API server (generations, finalizers, watches), and
//! [`KubeStore`], which speaks to a real cluster through `kube` dynamic
//! objects. [`Cancellable`] binds any store to a shutdown token.

#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value as Json;

use keel_core::{Delta, LabelSelector, ObjectRef, Resource, Result, TypeRef};

pub mod cancel;
pub mod kube_store;
pub mod memory;
pub mod merge;
pub mod simulator;
pub mod typed;

pub use cancel::Cancellable;
pub use kube_store::KubeStore;
pub use memory::{Fault, MemoryStore, Op};
pub use simulator::Simulator;

/// Which part of an object a patch targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchTarget {
    Main,
    Status,
}

/// Generic typed access to declarative resources with optimistic concurrency.
///
/// Every write carries the version token the caller read; a mismatch is an
/// [`keel_core::Error::Conflict`] and must never be merged blindly.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch one object; [`keel_core::Error::NotFound`] when absent.
    async fn get(&self, obj: &ObjectRef) -> Result<Resource>;

    async fn list(
        &self,
        type_ref: &TypeRef,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<Resource>>;

    /// Stream of changes for one kind, starting with the current state.
    async fn watch(
        &self,
        type_ref: &TypeRef,
        namespace: Option<&str>,
    ) -> Result<BoxStream<'static, Delta>>;

    async fn create(&self, res: &Resource) -> Result<Resource>;

    /// Replace an object. `res.metadata.resource_version` is the expected version.
    async fn update(&self, res: &Resource) -> Result<Resource>;

    /// JSON merge patch (RFC 7386).
    async fn patch(
        &self,
        obj: &ObjectRef,
        patch: &Json,
        expected_version: Option<&str>,
        target: PatchTarget,
    ) -> Result<Resource>;

    /// Replace the status subresource as a whole. Fields absent from
    /// `status` are cleared; `null` removes the status entirely.
    async fn replace_status(
        &self,
        obj: &ObjectRef,
        status: &Json,
        expected_version: Option<&str>,
    ) -> Result<Resource>;

    /// Delete an object. Objects with finalizers are only marked for deletion.
    async fn delete(&self, obj: &ObjectRef, expected_version: Option<&str>) -> Result<()>;
}

/// Shared stores (e.g. an `Arc<MemoryStore>` also driven by a [`Simulator`]).
#[async_trait]
impl<S: ResourceStore + ?Sized> ResourceStore for Arc<S> {
    async fn get(&self, obj: &ObjectRef) -> Result<Resource> {
        (**self).get(obj).await
    }

    async fn list(
        &self,
        type_ref: &TypeRef,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<Resource>> {
        (**self).list(type_ref, namespace, selector).await
    }

    async fn watch(
        &self,
        type_ref: &TypeRef,
        namespace: Option<&str>,
    ) -> Result<BoxStream<'static, Delta>> {
        (**self).watch(type_ref, namespace).await
    }

    async fn create(&self, res: &Resource) -> Result<Resource> {
        (**self).create(res).await
    }

    async fn update(&self, res: &Resource) -> Result<Resource> {
        (**self).update(res).await
    }

    async fn patch(
        &self,
        obj: &ObjectRef,
        patch: &Json,
        expected_version: Option<&str>,
        target: PatchTarget,
    ) -> Result<Resource> {
        (**self).patch(obj, patch, expected_version, target).await
    }

    async fn replace_status(
        &self,
        obj: &ObjectRef,
        status: &Json,
        expected_version: Option<&str>,
    ) -> Result<Resource> {
        (**self).replace_status(obj, status, expected_version).await
    }

    async fn delete(&self, obj: &ObjectRef, expected_version: Option<&str>) -> Result<()> {
        (**self).delete(obj, expected_version).await
    }
}

/// `get` that maps not-found to `None`.
pub async fn get_opt(store: &dyn ResourceStore, obj: &ObjectRef) -> Result<Option<Resource>> {
    match store.get(obj).await {
        Ok(res) => Ok(Some(res)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// `delete` that treats an already-absent object as success.
pub async fn delete_if_present(
    store: &dyn ResourceStore,
    obj: &ObjectRef,
    expected_version: Option<&str>,
) -> Result<bool> {
    match store.delete(obj, expected_version).await {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}
