//! Bind every store call to a process-lifetime cancellation token.

use std::future::Future;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;

use keel_core::{Delta, Error, LabelSelector, ObjectRef, Resource, Result, TypeRef};

use crate::{PatchTarget, ResourceStore};

/// Store decorator: once the token is cancelled, in-flight and new calls
/// return [`Error::Cancelled`] instead of completing.
pub struct Cancellable<S> {
    inner: S,
    token: CancellationToken,
}

impl<S: ResourceStore> Cancellable<S> {
    pub fn new(inner: S, token: CancellationToken) -> Self {
        Self { inner, token }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn guard<T>(&self, fut: impl Future<Output = Result<T>> + Send) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Error::Cancelled),
            res = fut => res,
        }
    }
}

#[async_trait]
impl<S: ResourceStore> ResourceStore for Cancellable<S> {
    async fn get(&self, obj: &ObjectRef) -> Result<Resource> {
        self.guard(self.inner.get(obj)).await
    }

    async fn list(
        &self,
        type_ref: &TypeRef,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<Resource>> {
        self.guard(self.inner.list(type_ref, namespace, selector)).await
    }

    async fn watch(
        &self,
        type_ref: &TypeRef,
        namespace: Option<&str>,
    ) -> Result<BoxStream<'static, Delta>> {
        let stream = self.guard(self.inner.watch(type_ref, namespace)).await?;
        let token = self.token.clone();
        Ok(stream.take_until(token.cancelled_owned()).boxed())
    }

    async fn create(&self, res: &Resource) -> Result<Resource> {
        self.guard(self.inner.create(res)).await
    }

    async fn update(&self, res: &Resource) -> Result<Resource> {
        self.guard(self.inner.update(res)).await
    }

    async fn patch(
        &self,
        obj: &ObjectRef,
        patch: &Json,
        expected_version: Option<&str>,
        target: PatchTarget,
    ) -> Result<Resource> {
        self.guard(self.inner.patch(obj, patch, expected_version, target))
            .await
    }

    async fn replace_status(
        &self,
        obj: &ObjectRef,
        status: &Json,
        expected_version: Option<&str>,
    ) -> Result<Resource> {
        self.guard(self.inner.replace_status(obj, status, expected_version))
            .await
    }

    async fn delete(&self, obj: &ObjectRef, expected_version: Option<&str>) -> Result<()> {
        self.guard(self.inner.delete(obj, expected_version)).await
    }
}
