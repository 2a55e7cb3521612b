//! In-process resource store with API-server semantics.
//!
//! Versions are a single monotonically increasing counter, `generation`
//! moves only when `spec` changes, deletes of objects carrying finalizers
//! only stamp `deletionTimestamp`, and every successful write is broadcast
//! to watchers. Faults can be injected per operation/kind/name to exercise
//! retry and isolation paths.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value as Json;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use keel_core::{Delta, DeltaKind, Error, LabelSelector, ObjectRef, Resource, Result, TypeRef};

use crate::merge::merge_patch;
use crate::{PatchTarget, ResourceStore};

/// Store operation, used to target injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Get,
    List,
    Create,
    Update,
    Patch,
    Delete,
}

impl Op {
    fn is_write(self) -> bool {
        matches!(self, Op::Create | Op::Update | Op::Patch | Op::Delete)
    }
}

/// An error the store returns instead of performing a matching operation.
#[derive(Debug, Clone)]
pub struct Fault {
    op: Option<Op>,
    writes_only: bool,
    kind: Option<String>,
    name: Option<String>,
    error: Error,
    remaining: Option<u32>,
}

impl Fault {
    /// Fail every write (create/update/patch/delete).
    pub fn on_write(error: Error) -> Self {
        Self {
            op: None,
            writes_only: true,
            kind: None,
            name: None,
            error,
            remaining: None,
        }
    }

    pub fn on(op: Op, error: Error) -> Self {
        Self {
            op: Some(op),
            writes_only: false,
            kind: None,
            name: None,
            error,
            remaining: None,
        }
    }

    pub fn for_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn for_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Only fire `n` times, then disappear.
    pub fn times(mut self, n: u32) -> Self {
        self.remaining = Some(n);
        self
    }

    fn matches(&self, op: Op, kind: &str, name: Option<&str>) -> bool {
        if self.writes_only && !op.is_write() {
            return false;
        }
        if self.op.is_some_and(|o| o != op) {
            return false;
        }
        if self.kind.as_deref().is_some_and(|k| k != kind) {
            return false;
        }
        match (self.name.as_deref(), name) {
            (Some(want), Some(got)) => want == got,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectRef, Resource>,
    version: u64,
    faults: Vec<Fault>,
}

impl State {
    fn check_fault(&mut self, op: Op, kind: &str, name: Option<&str>) -> Result<()> {
        let Some(idx) = self.faults.iter().position(|f| f.matches(op, kind, name)) else {
            return Ok(());
        };
        let fault = &mut self.faults[idx];
        let error = fault.error.clone();
        let exhausted = match fault.remaining.as_mut() {
            Some(n) => {
                *n = n.saturating_sub(1);
                *n == 0
            }
            None => false,
        };
        if exhausted {
            self.faults.remove(idx);
        }
        debug!(?op, kind, name, error = %error, "injected fault");
        Err(error)
    }

    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn current(&self, key: &ObjectRef) -> Result<&Resource> {
        self.objects.get(key).ok_or_else(|| Error::not_found(key))
    }
}

fn check_version(key: &ObjectRef, current: &Resource, expected: Option<&str>) -> Result<()> {
    match expected {
        Some(exp) if current.version() != Some(exp) => Err(Error::conflict(
            key,
            format!(
                "expected version {}, found {}",
                exp,
                current.version().unwrap_or("<none>")
            ),
        )),
        _ => Ok(()),
    }
}

/// In-memory versioned store.
pub struct MemoryStore {
    state: Mutex<State>,
    events: broadcast::Sender<Delta>,
    writes: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(State::default()),
            events,
            writes: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push(fault);
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Number of successful writes since creation.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn contains(&self, obj: &ObjectRef) -> bool {
        self.lock().objects.contains_key(obj)
    }

    /// Every stored object, in key order.
    pub fn objects(&self) -> Vec<Resource> {
        self.lock().objects.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn emit(&self, kind: DeltaKind, object: Resource) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        metrics::counter!("store_writes_total", 1u64);
        // No receivers is fine.
        let _ = self.events.send(Delta { kind, object });
    }

    /// Store `next` under `key`, or drop it when deletion has been requested
    /// and no finalizers remain.
    fn commit(&self, mut st: MutexGuard<'_, State>, key: ObjectRef, next: Resource) -> Resource {
        if next.metadata.is_deleting() && next.metadata.finalizers.is_empty() {
            st.objects.remove(&key);
            drop(st);
            self.emit(DeltaKind::Deleted, next.clone());
        } else {
            st.objects.insert(key, next.clone());
            drop(st);
            self.emit(DeltaKind::Applied, next.clone());
        }
        next
    }
}

fn same_namespace(res: &Resource, namespace: Option<&str>) -> bool {
    namespace.is_none() || res.metadata.namespace.as_deref() == namespace
}

fn same_type(res: &Resource, type_ref: &TypeRef) -> bool {
    res.api_version == type_ref.api_version && res.kind == type_ref.kind
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, obj: &ObjectRef) -> Result<Resource> {
        let mut st = self.lock();
        st.check_fault(Op::Get, &obj.kind, Some(&obj.name))?;
        st.current(obj).cloned()
    }

    async fn list(
        &self,
        type_ref: &TypeRef,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<Resource>> {
        let mut st = self.lock();
        st.check_fault(Op::List, &type_ref.kind, None)?;
        Ok(st
            .objects
            .values()
            .filter(|r| same_type(r, type_ref) && same_namespace(r, namespace))
            .filter(|r| selector.matches(&r.metadata.labels))
            .cloned()
            .collect())
    }

    async fn watch(
        &self,
        type_ref: &TypeRef,
        namespace: Option<&str>,
    ) -> Result<BoxStream<'static, Delta>> {
        let rx = self.events.subscribe();
        let initial: Vec<Delta> = self
            .list(type_ref, namespace, &LabelSelector::everything())
            .await?
            .into_iter()
            .map(|object| Delta {
                kind: DeltaKind::Applied,
                object,
            })
            .collect();

        let type_ref = type_ref.clone();
        let namespace = namespace.map(str::to_string);
        let live = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(d) => return Some((d, rx)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "memory watch lagged; relying on resync");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |d| {
            let keep = same_type(&d.object, &type_ref)
                && same_namespace(&d.object, namespace.as_deref());
            futures::future::ready(keep)
        });
        Ok(stream::iter(initial).chain(live).boxed())
    }

    async fn create(&self, res: &Resource) -> Result<Resource> {
        let key = res.object_ref();
        let mut st = self.lock();
        st.check_fault(Op::Create, &key.kind, Some(&key.name))?;
        if st.objects.contains_key(&key) {
            return Err(Error::conflict(&key, "already exists"));
        }
        let mut obj = res.clone();
        obj.metadata.resource_version = Some(st.next_version());
        obj.metadata.uid = Some(Uuid::new_v4().to_string());
        obj.metadata.creation_timestamp = Some(Utc::now().trunc_subsecs(0));
        obj.metadata.deletion_timestamp = None;
        obj.metadata.generation = 1;
        Ok(self.commit(st, key, obj))
    }

    async fn update(&self, res: &Resource) -> Result<Resource> {
        let key = res.object_ref();
        let mut st = self.lock();
        st.check_fault(Op::Update, &key.kind, Some(&key.name))?;
        let current = st.current(&key)?;
        check_version(&key, current, res.version())?;

        let mut next = res.clone();
        next.metadata.uid = current.metadata.uid.clone();
        next.metadata.creation_timestamp = current.metadata.creation_timestamp;
        next.metadata.deletion_timestamp = current.metadata.deletion_timestamp;
        next.metadata.generation = if next.field("spec") != current.field("spec") {
            current.metadata.generation + 1
        } else {
            current.metadata.generation
        };
        next.metadata.resource_version = Some(st.next_version());
        Ok(self.commit(st, key, next))
    }

    async fn patch(
        &self,
        obj: &ObjectRef,
        patch: &Json,
        expected_version: Option<&str>,
        target: PatchTarget,
    ) -> Result<Resource> {
        let mut st = self.lock();
        st.check_fault(Op::Patch, &obj.kind, Some(&obj.name))?;
        let current = st.current(obj)?;
        check_version(obj, current, expected_version)?;

        let effective = match (target, patch) {
            (PatchTarget::Status, p) => {
                serde_json::json!({ "status": p.get("status").cloned().unwrap_or(Json::Null) })
            }
            (PatchTarget::Main, Json::Object(map)) => {
                let mut map = map.clone();
                map.remove("status");
                Json::Object(map)
            }
            (PatchTarget::Main, _) => {
                return Err(Error::rejected(obj, "merge patch must be a JSON object"));
            }
        };

        let mut doc = current.to_json()?;
        merge_patch(&mut doc, &effective);
        let mut next: Resource = serde_json::from_value(doc)?;
        next.api_version = current.api_version.clone();
        next.kind = current.kind.clone();
        next.metadata.name = current.metadata.name.clone();
        next.metadata.namespace = current.metadata.namespace.clone();
        next.metadata.uid = current.metadata.uid.clone();
        next.metadata.creation_timestamp = current.metadata.creation_timestamp;
        next.metadata.deletion_timestamp = current.metadata.deletion_timestamp;
        next.metadata.generation = if next.field("spec") != current.field("spec") {
            current.metadata.generation + 1
        } else {
            current.metadata.generation
        };
        next.metadata.resource_version = Some(st.next_version());
        Ok(self.commit(st, obj.clone(), next))
    }

    async fn replace_status(
        &self,
        obj: &ObjectRef,
        status: &Json,
        expected_version: Option<&str>,
    ) -> Result<Resource> {
        let mut st = self.lock();
        st.check_fault(Op::Update, &obj.kind, Some(&obj.name))?;
        let current = st.current(obj)?;
        check_version(obj, current, expected_version)?;

        let mut next = current.clone();
        if status.is_null() {
            next.body.remove("status");
        } else {
            next.body.insert("status".into(), status.clone());
        }
        next.metadata.resource_version = Some(st.next_version());
        Ok(self.commit(st, obj.clone(), next))
    }

    async fn delete(&self, obj: &ObjectRef, expected_version: Option<&str>) -> Result<()> {
        let mut st = self.lock();
        st.check_fault(Op::Delete, &obj.kind, Some(&obj.name))?;
        let current = st.current(obj)?;
        check_version(obj, current, expected_version)?;

        if current.metadata.finalizers.is_empty() {
            let gone = current.clone();
            st.objects.remove(obj);
            drop(st);
            self.emit(DeltaKind::Deleted, gone);
            return Ok(());
        }
        if current.metadata.is_deleting() {
            return Ok(());
        }
        let mut next = current.clone();
        next.metadata.deletion_timestamp = Some(Utc::now().trunc_subsecs(0));
        next.metadata.resource_version = Some(st.next_version());
        self.commit(st, obj.clone(), next);
        Ok(())
    }
}
