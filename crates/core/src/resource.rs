//! Dynamic resource representation exchanged with the resource store.
//!
//! A [`Resource`] is a Kubernetes-shaped document: `apiVersion`, `kind`,
//! `metadata`, and everything else kept verbatim in `body`. Typed records
//! (components, installer sets, stacks) implement [`Object`] and convert
//! through JSON.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::{Error, Result};

fn is_zero(v: &i64) -> bool {
    *v == 0
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Optimistic concurrency token assigned by the store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    /// Bumped by the store whenever `spec` changes
    #[serde(default, skip_serializing_if = "is_zero")]
    pub generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    /// Fields this crate does not interpret (ownerReferences, managedFields, ...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, Json>,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>, namespace: Option<&str>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.map(str::to_string),
            ..Default::default()
        }
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }
}

/// Group/version + kind, used for list and watch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeRef {
    pub api_version: String,
    pub kind: String,
}

impl TypeRef {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
        }
    }

    /// API group, empty for the core group.
    pub fn group(&self) -> &str {
        self.api_version
            .split_once('/')
            .map(|(g, _)| g)
            .unwrap_or("")
    }

    pub fn version(&self) -> &str {
        self.api_version
            .split_once('/')
            .map(|(_, v)| v)
            .unwrap_or(&self.api_version)
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version, self.kind)
    }
}

/// Fully qualified reference to one object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    pub fn new(type_ref: &TypeRef, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            api_version: type_ref.api_version.clone(),
            kind: type_ref.kind.clone(),
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }

    pub fn type_ref(&self) -> TypeRef {
        TypeRef::new(self.api_version.clone(), self.kind.clone())
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.as_deref(), &self.name)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}/{}", self.api_version, self.kind, ns, self.name),
            None => write!(f, "{}/{}/{}", self.api_version, self.kind, self.name),
        }
    }
}

/// Opaque work-queue key: namespace + name within one kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Equality-based label selector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector(pub BTreeMap<String, String>);

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{}", parts.join(","))
    }
}

/// A Kubernetes-shaped document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Everything else (spec, status, data, rules, ...)
    #[serde(flatten)]
    pub body: serde_json::Map<String, Json>,
}

impl Resource {
    /// Parse a raw JSON document. `apiVersion`, `kind` and `metadata.name` are required.
    pub fn from_json(value: Json) -> Result<Self> {
        let res: Resource = serde_json::from_value(value)?;
        if res.api_version.is_empty() || res.kind.is_empty() {
            return Err(Error::serialization("document missing apiVersion or kind"));
        }
        if res.metadata.name.is_empty() {
            return Err(Error::serialization(format!(
                "{} document missing metadata.name",
                res.kind
            )));
        }
        Ok(res)
    }

    pub fn to_json(&self) -> Result<Json> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn type_ref(&self) -> TypeRef {
        TypeRef::new(self.api_version.clone(), self.kind.clone())
    }

    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            namespace: self.metadata.namespace.clone(),
            name: self.metadata.name.clone(),
        }
    }

    pub fn version(&self) -> Option<&str> {
        self.metadata.resource_version.as_deref()
    }

    pub fn field(&self, key: &str) -> Option<&Json> {
        self.body.get(key)
    }

    pub fn from_object<T: Object>(obj: &T) -> Result<Self> {
        let value = serde_json::to_value(obj)?;
        let Json::Object(mut map) = value else {
            return Err(Error::serialization(format!("{} did not serialize to a map", T::KIND)));
        };
        let metadata = match map.remove("metadata") {
            Some(m) => serde_json::from_value(m)?,
            None => ObjectMeta::default(),
        };
        map.remove("apiVersion");
        map.remove("kind");
        Ok(Self {
            api_version: T::API_VERSION.to_string(),
            kind: T::KIND.to_string(),
            metadata,
            body: map,
        })
    }

    pub fn to_object<T: Object>(&self) -> Result<T> {
        if self.kind != T::KIND {
            return Err(Error::serialization(format!(
                "expected kind {}, found {}",
                T::KIND,
                self.kind
            )));
        }
        Ok(serde_json::from_value(self.to_json()?)?)
    }
}

/// A typed record persisted through the resource store.
pub trait Object: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const API_VERSION: &'static str;
    const KIND: &'static str;

    fn metadata(&self) -> &ObjectMeta;
    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    fn type_ref() -> TypeRef {
        TypeRef::new(Self::API_VERSION, Self::KIND)
    }

    fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(
            &Self::type_ref(),
            self.metadata().namespace.as_deref(),
            self.metadata().name.clone(),
        )
    }

    fn key(&self) -> ObjectKey {
        ObjectKey::new(self.metadata().namespace.as_deref(), &self.metadata().name)
    }

    fn name(&self) -> &str {
        &self.metadata().name
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Applied,
    Deleted,
}

/// One observed change from a watch stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub kind: DeltaKind,
    pub object: Resource,
}
