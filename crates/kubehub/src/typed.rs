//! Typed helpers over [`ResourceStore`] for Keel's own kinds.

use serde_json::Value as Json;

use keel_core::{LabelSelector, Object, ObjectKey, ObjectRef, Resource, Result};

use crate::{get_opt, ResourceStore};

pub fn object_ref<T: Object>(key: &ObjectKey) -> ObjectRef {
    ObjectRef::new(&T::type_ref(), key.namespace.as_deref(), key.name.clone())
}

pub async fn get<T: Object>(store: &dyn ResourceStore, key: &ObjectKey) -> Result<Option<T>> {
    match get_opt(store, &object_ref::<T>(key)).await? {
        Some(res) => Ok(Some(res.to_object()?)),
        None => Ok(None),
    }
}

pub async fn list<T: Object>(
    store: &dyn ResourceStore,
    namespace: Option<&str>,
    selector: &LabelSelector,
) -> Result<Vec<T>> {
    store
        .list(&T::type_ref(), namespace, selector)
        .await?
        .iter()
        .map(Resource::to_object)
        .collect()
}

pub async fn create<T: Object>(store: &dyn ResourceStore, obj: &T) -> Result<T> {
    store.create(&Resource::from_object(obj)?).await?.to_object()
}

/// Replace `obj`, using its `resourceVersion` as the expected version.
pub async fn update<T: Object>(store: &dyn ResourceStore, obj: &T) -> Result<T> {
    store.update(&Resource::from_object(obj)?).await?.to_object()
}

/// Replace the status subresource with `status`, guarded by `obj`'s version.
/// Fields missing from `status` do not survive the write.
pub async fn replace_status<T: Object>(
    store: &dyn ResourceStore,
    obj: &T,
    status: &Json,
) -> Result<T> {
    store
        .replace_status(&obj.object_ref(), status, obj.metadata().resource_version.as_deref())
        .await?
        .to_object()
}

pub async fn delete<T: Object>(store: &dyn ResourceStore, obj: &T) -> Result<bool> {
    crate::delete_if_present(store, &obj.object_ref(), None).await
}
