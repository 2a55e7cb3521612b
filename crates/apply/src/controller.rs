//! Installer-set lifecycle: create, converge, supersede, delete, roll back.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use keel_core::conditions::{MANIFESTS_APPLIED, READY};
use keel_core::hash::short_hash;
use keel_core::{
    labels, Backoff, Component, Error, InstallerSet, InstallerSetPhase, InstallerSetSpec,
    InstallerSetStatus, ItemState, ItemStatus, LabelSelector, ManifestId, ManifestItem, Object,
    ObjectKey, ObjectMeta, Resource, Result,
};
use keel_kubehub::{delete_if_present, get_opt, typed, ResourceStore};
use keel_persist::{Ledger, LedgerEntry, LedgerEvent};

use crate::diff::{diff_summary, is_subset, overlay, strip_noisy};
use crate::readiness;

/// When a failing upgrade gives up, and how failed items are retried.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutPolicy {
    /// Consecutive item failures before rolling back (or, without a retained
    /// bundle, surfacing an error). `None` retries forever.
    pub failure_threshold: Option<u32>,
    pub item_backoff: Backoff,
}

impl Default for RolloutPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: Some(5),
            item_backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(300)),
        }
    }
}

/// Desired content of one installer set.
#[derive(Debug, Clone, PartialEq)]
pub struct Bundle {
    pub version: String,
    pub hash: String,
    pub items: Vec<ManifestItem>,
}

/// Result of one converge pass over a set.
#[derive(Debug, Clone)]
pub struct Convergence {
    /// The set as stored after the pass
    pub set: InstallerSet,
    /// Earliest moment a failed item becomes eligible for retry
    pub retry_after: Option<Duration>,
}

pub fn installer_set_name(component: &str, hash: &str) -> String {
    format!("{component}-{}", short_hash(hash))
}

/// Selector for every installer set owned by `component`.
pub fn owned_by(component: &str) -> LabelSelector {
    LabelSelector::everything()
        .with(labels::MANAGED_BY, labels::MANAGED_BY_VALUE)
        .with(labels::COMPONENT, component)
}

fn ordered(items: &[ManifestItem]) -> Vec<&ManifestItem> {
    let mut v: Vec<&ManifestItem> = items.iter().collect();
    v.sort_by_key(|i| i.order);
    v
}

fn min_delay(current: Option<Duration>, candidate: Duration) -> Option<Duration> {
    Some(current.map_or(candidate, |c| c.min(candidate)))
}

fn owner_id(set: &InstallerSet) -> String {
    format!(
        "{}/{}",
        set.metadata.namespace.as_deref().unwrap_or_default(),
        set.spec.component
    )
}

fn snapshot(items: &[ManifestItem]) -> String {
    items
        .iter()
        .filter_map(|i| serde_yaml::to_string(&i.payload).ok())
        .collect::<Vec<_>>()
        .join("---\n")
}

pub struct InstallerSetController {
    store: Arc<dyn ResourceStore>,
    ledger: Arc<dyn Ledger>,
    policy: RolloutPolicy,
}

impl InstallerSetController {
    pub fn new(store: Arc<dyn ResourceStore>, ledger: Arc<dyn Ledger>, policy: RolloutPolicy) -> Self {
        Self {
            store,
            ledger,
            policy,
        }
    }

    pub fn policy(&self) -> &RolloutPolicy {
        &self.policy
    }

    /// SQLite writes block, so they run on the blocking pool.
    async fn record(&self, entry: LedgerEntry) {
        let ledger = Arc::clone(&self.ledger);
        match tokio::task::spawn_blocking(move || ledger.record(entry)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "ledger write failed"),
            Err(e) => warn!(error = %e, "ledger task failed"),
        }
    }

    pub async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<InstallerSet>> {
        typed::get(&*self.store, &ObjectKey::new(namespace, name)).await
    }

    /// Every installer set owned by `owner`, in name order.
    pub async fn list_for(&self, owner: &Component) -> Result<Vec<InstallerSet>> {
        let mut sets: Vec<InstallerSet> = typed::list(
            &*self.store,
            owner.metadata.namespace.as_deref(),
            &owned_by(&owner.metadata.name),
        )
        .await?;
        sets.retain(|s| s.spec.component == owner.metadata.name);
        sets.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(sets)
    }

    /// Ensure a set exists for `bundle`. A set with the same hash is returned
    /// untouched, so repeated calls never write.
    pub async fn create_or_update(&self, owner: &Component, bundle: &Bundle) -> Result<InstallerSet> {
        let name = installer_set_name(&owner.metadata.name, &bundle.hash);
        let namespace = owner.metadata.namespace.as_deref();
        if let Some(existing) = self.get(namespace, &name).await? {
            if existing.spec.hash == bundle.hash {
                return Ok(existing);
            }
            return Err(Error::conflict(
                existing.object_ref(),
                format!("name taken by bundle {}", existing.spec.hash),
            ));
        }

        let mut metadata = ObjectMeta::named(&name, namespace);
        metadata.labels = [
            (labels::MANAGED_BY, labels::MANAGED_BY_VALUE),
            (labels::COMPONENT, owner.metadata.name.as_str()),
            (labels::COMPONENT_KIND, owner.spec.kind.as_str()),
            (labels::VERSION, bundle.version.as_str()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        metadata
            .annotations
            .insert(labels::CONTENT_HASH.to_string(), bundle.hash.clone());
        if let Some(uid) = &owner.metadata.uid {
            metadata.extra.insert(
                "ownerReferences".into(),
                serde_json::json!([{
                    "apiVersion": Component::API_VERSION,
                    "kind": Component::KIND,
                    "name": owner.metadata.name,
                    "uid": uid,
                    "controller": true,
                    "blockOwnerDeletion": true,
                }]),
            );
        }
        let set = InstallerSet {
            metadata,
            spec: InstallerSetSpec {
                component: owner.metadata.name.clone(),
                component_kind: owner.spec.kind.clone(),
                version: bundle.version.clone(),
                hash: bundle.hash.clone(),
                items: bundle.items.clone(),
            },
            status: None,
        };

        match typed::create(&*self.store, &set).await {
            Ok(created) => {
                info!(component = %owner.metadata.name, installer_set = %name, hash = %bundle.hash, "created installer set");
                counter!("installer_set_created_total", 1u64);
                self.record(
                    LedgerEntry::new(&owner_id(&created), &name, &bundle.hash, LedgerEvent::Created)
                        .with_detail(format!("version {}", bundle.version))
                        .with_snapshot(&snapshot(&bundle.items)),
                )
                .await;
                Ok(created)
            }
            // another writer got there first
            Err(e) if e.is_conflict() => match self.get(namespace, &name).await? {
                Some(existing) if existing.spec.hash == bundle.hash => Ok(existing),
                _ => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    /// Apply every item in order, evaluate readiness and write the aggregated
    /// status when it changed.
    ///
    /// A failing item never stops the others. Once a set is Ready its items
    /// are not downgraded by readiness probes; only a failed re-apply can make
    /// it not Ready again.
    pub async fn converge(&self, set: &InstallerSet) -> Result<Convergence> {
        if matches!(set.phase(), InstallerSetPhase::Superseded | InstallerSetPhase::Deleting) {
            return Ok(Convergence {
                set: set.clone(),
                retry_after: None,
            });
        }
        let t0 = Instant::now();
        let now = Utc::now();
        let previous = set.status.clone().unwrap_or_default();
        let mut status = previous.clone();
        let was_ready = set.is_ready();
        let mut retry_after = None;

        for item in ordered(&set.spec.items) {
            let key = item.id.to_string();
            let prev = previous.items.get(&key).cloned().unwrap_or_default();
            if prev.state == ItemState::Failed {
                if let Some(at) = prev.next_retry_at.filter(|at| *at > now) {
                    retry_after = min_delay(retry_after, (at - now).to_std().unwrap_or_default());
                    continue;
                }
            }
            let next = match self.apply_item(set, item).await {
                Ok(live) => {
                    let ready = (was_ready && prev.state == ItemState::Ready)
                        || readiness::is_ready(item.readiness, &live);
                    ItemStatus {
                        state: if ready { ItemState::Ready } else { ItemState::Applied },
                        ..Default::default()
                    }
                }
                Err(e) if e.is_conflict() || e.is_cancelled() => return Err(e),
                Err(e) => {
                    let failures = prev.failures.saturating_add(1);
                    let permanent = !e.is_retryable();
                    let delay = if permanent {
                        self.policy.item_backoff.max
                    } else {
                        self.policy.item_backoff.delay(failures - 1)
                    };
                    retry_after = min_delay(retry_after, delay);
                    counter!("installer_set_item_failures_total", 1u64);
                    warn!(installer_set = %set.metadata.name, item = %key, failures, permanent, error = %e, "manifest apply failed");
                    ItemStatus {
                        state: ItemState::Failed,
                        failures,
                        reason: Some(e.reason().to_string()),
                        message: Some(e.to_string()),
                        permanent,
                        next_retry_at: Some(
                            now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
                        ),
                    }
                }
            };
            status.items.insert(key, next);
        }

        aggregate(&mut status, set.spec.items.len());
        if status.phase == InstallerSetPhase::Ready && !was_ready {
            status.ready_at = Some(now);
            info!(installer_set = %set.metadata.name, hash = %set.spec.hash, "installer set ready");
            self.record(LedgerEntry::new(
                &owner_id(set),
                &set.metadata.name,
                &set.spec.hash,
                LedgerEvent::Ready,
            ))
            .await;
        }

        let set = if status != previous {
            debug!(installer_set = %set.metadata.name, phase = %status.phase, "writing installer set status");
            typed::replace_status(&*self.store, set, &serde_json::to_value(&status)?).await?
        } else {
            set.clone()
        };
        histogram!("installer_set_converge_ms", t0.elapsed().as_secs_f64() * 1000.0);
        Ok(Convergence { set, retry_after })
    }

    async fn apply_item(&self, set: &InstallerSet, item: &ManifestItem) -> Result<Resource> {
        let desired = Resource::from_json(item.payload.clone())
            .map_err(|e| Error::rejected(&item.id, e.to_string()))?;
        let obj = desired.object_ref();
        let Some(live) = get_opt(&*self.store, &obj).await? else {
            debug!(installer_set = %set.metadata.name, item = %item.id, "creating");
            return self.store.create(&desired).await;
        };
        let live_json = live.to_json()?;
        let want = strip_noisy(item.payload.clone());
        if is_subset(&want, &live_json) {
            return Ok(live);
        }
        let summary = diff_summary(&want, &strip_noisy(live_json.clone()));
        info!(
            installer_set = %set.metadata.name,
            item = %item.id,
            adds = summary.adds,
            updates = summary.updates,
            removes = summary.removes,
            "drift detected; re-applying"
        );
        counter!("installer_set_drift_total", 1u64);
        self.store
            .update(&Resource::from_json(overlay(&live_json, &want))?)
            .await
    }

    /// The first item past the rollout failure threshold, if any.
    pub fn past_threshold<'a>(&self, set: &'a InstallerSet) -> Option<(&'a str, &'a ItemStatus)> {
        self.policy
            .failure_threshold
            .and_then(|t| set.item_past_threshold(t))
    }

    /// Retire `set` now that `keep` is Ready: mark it Superseded, remove the
    /// manifests `keep` does not also own, then the record itself.
    pub async fn supersede(&self, set: &InstallerSet, keep: &InstallerSet) -> Result<usize> {
        let mut status = set.status.clone().unwrap_or_default();
        let set = if status.phase == InstallerSetPhase::Superseded {
            set.clone()
        } else {
            status.phase = InstallerSetPhase::Superseded;
            status.superseded_at = Some(Utc::now());
            status
                .conditions
                .mark_false(READY, "Superseded", format!("replaced by {}", keep.metadata.name));
            typed::replace_status(&*self.store, set, &serde_json::to_value(&status)?).await?
        };
        info!(installer_set = %set.metadata.name, replaced_by = %keep.metadata.name, "superseding installer set");
        self.record(
            LedgerEntry::new(&owner_id(&set), &set.metadata.name, &set.spec.hash, LedgerEvent::Superseded)
                .with_detail(format!("replaced by {}", keep.metadata.name)),
        )
        .await;
        self.remove(&set, Some(keep)).await
    }

    /// Tear `set` down: its manifests in reverse apply order (except those
    /// `keep` owns), then the record. Absent objects count as removed.
    pub async fn delete(&self, set: &InstallerSet, keep: Option<&InstallerSet>) -> Result<usize> {
        let set = if matches!(set.phase(), InstallerSetPhase::Deleting | InstallerSetPhase::Superseded) {
            set.clone()
        } else {
            let mut status = set.status.clone().unwrap_or_default();
            status.phase = InstallerSetPhase::Deleting;
            status.conditions.mark_false(READY, "Deleting", "installer set is being removed");
            match typed::replace_status(&*self.store, set, &serde_json::to_value(&status)?).await {
                Ok(updated) => updated,
                Err(e) if e.is_not_found() => return Ok(0),
                Err(e) => return Err(e),
            }
        };
        self.remove(&set, keep).await
    }

    async fn remove(&self, set: &InstallerSet, keep: Option<&InstallerSet>) -> Result<usize> {
        let removed = self.delete_manifests(set, keep).await?;
        delete_if_present(&*self.store, &set.object_ref(), None)
            .await
            .map_err(|e| finalization_error(&set.object_ref(), e))?;
        counter!("installer_set_deleted_total", 1u64);
        self.record(
            LedgerEntry::new(&owner_id(set), &set.metadata.name, &set.spec.hash, LedgerEvent::Deleted)
                .with_detail(format!("{removed} manifests removed")),
        )
        .await;
        info!(installer_set = %set.metadata.name, removed, "installer set removed");
        Ok(removed)
    }

    async fn delete_manifests(&self, set: &InstallerSet, keep: Option<&InstallerSet>) -> Result<usize> {
        let keep_ids: BTreeSet<&ManifestId> = keep.map(|k| k.manifest_ids().collect()).unwrap_or_default();
        let mut removed = 0;
        for item in ordered(&set.spec.items).into_iter().rev() {
            if keep_ids.contains(&item.id) {
                continue;
            }
            let obj = item.id.object_ref();
            let live = get_opt(&*self.store, &obj)
                .await
                .map_err(|e| finalization_error(&item.id, e))?;
            let Some(live) = live else {
                continue;
            };
            if live.metadata.labels.get(labels::COMPONENT) != Some(&set.spec.component) {
                warn!(installer_set = %set.metadata.name, item = %item.id, "object not owned by component; leaving it");
                continue;
            }
            if delete_if_present(&*self.store, &obj, live.version())
                .await
                .map_err(|e| finalization_error(&item.id, e))?
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Give up on `failed`: converge `retained` again (restoring any manifests
    /// the upgrade overwrote), then delete what only `failed` owned.
    ///
    /// The retained bundle's manifests stay applied throughout.
    pub async fn rollback(&self, failed: &InstallerSet, retained: &InstallerSet) -> Result<Convergence> {
        let reason = self
            .past_threshold(failed)
            .map(|(item, st)| format!("{item}: {}", st.message.as_deref().unwrap_or("failed")))
            .unwrap_or_else(|| "upgrade failed".to_string());
        warn!(failed = %failed.metadata.name, retained = %retained.metadata.name, %reason, "rolling back upgrade");
        let restored = self.converge(retained).await?;
        self.delete(failed, Some(&restored.set)).await?;
        counter!("installer_set_rollbacks_total", 1u64);
        self.record(
            LedgerEntry::new(&owner_id(failed), &failed.metadata.name, &failed.spec.hash, LedgerEvent::RolledBack)
                .with_detail(format!("restored {}; {reason}", retained.metadata.name)),
        )
        .await;
        Ok(restored)
    }
}

/// Conflicts and cancellation keep their meaning; anything else during
/// teardown is a finalization failure.
fn finalization_error(object: &impl ToString, e: Error) -> Error {
    if e.is_conflict() || e.is_cancelled() {
        e
    } else {
        Error::finalization(object.to_string(), e.to_string())
    }
}

fn aggregate(status: &mut InstallerSetStatus, total: usize) {
    let ready = status.items.values().filter(|s| s.state == ItemState::Ready).count();
    let failed: Vec<(&String, &ItemStatus)> = status
        .items
        .iter()
        .filter(|(_, s)| s.state == ItemState::Failed)
        .collect();

    let (phase, failure) = match failed.first() {
        Some((key, st)) => {
            let reason = st.reason.clone().unwrap_or_else(|| "ManifestApplyError".into());
            let message = format!(
                "{} of {total} manifests failing; {key}: {}",
                failed.len(),
                st.message.as_deref().unwrap_or("apply failed")
            );
            (InstallerSetPhase::PartiallyFailed, Some((reason, message)))
        }
        None if ready == total => (InstallerSetPhase::Ready, None),
        None => (InstallerSetPhase::Applying, None),
    };
    status.phase = phase;

    match &failure {
        Some((reason, message)) => {
            status.conditions.mark_false(MANIFESTS_APPLIED, reason.as_str(), message.as_str());
            status.conditions.mark_false(READY, reason.as_str(), message.as_str());
        }
        None => {
            status
                .conditions
                .mark_true(MANIFESTS_APPLIED, "AllApplied", format!("{total} manifests applied"));
            if phase == InstallerSetPhase::Ready {
                status
                    .conditions
                    .mark_true(READY, "AllManifestsReady", format!("{total}/{total} manifests ready"));
            } else {
                status
                    .conditions
                    .mark_false(READY, "Applying", format!("{ready}/{total} manifests ready"));
            }
        }
    }
}
