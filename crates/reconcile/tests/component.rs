//! Component reconciler against the in-memory cluster.

mod common;

use common::*;
use keel_core::conditions::{DEPENDENCIES_READY, READY, SPEC_VALID};
use keel_core::{labels, ComponentPhase, Condition, Error, InstallerSetPhase};
use keel_kubehub::{Cancellable, Fault, Op};
use keel_persist::{Ledger, LedgerEvent};
use keel_reconcile::{reconcile_component, Action, Context};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn ready_condition(c: &keel_core::Component) -> Condition {
    c.status
        .as_ref()
        .and_then(|s| s.conditions.get(READY))
        .cloned()
        .expect("ready condition")
}

fn is_ready(c: &keel_core::Component) -> bool {
    c.phase() == ComponentPhase::Ready
}

/// Further passes over a Ready component neither write nor requeue.
async fn assert_settled(env: &Env, key: &keel_core::ObjectKey) {
    for pass in 0..3 {
        let before = env.store.writes();
        let action = reconcile_component(&env.ctx, key).await.unwrap();
        assert_eq!(action, Action::AwaitChange, "pass {pass}");
        assert_eq!(env.store.writes(), before, "pass {pass} wrote");
    }
}

#[tokio::test]
async fn installs_to_ready_and_records_hash() {
    let env = env(Some(3));
    let key = env.create(&component("pipeline", "pipeline", "v1.0")).await;

    let first = env.pass(&key).await;
    assert!(matches!(first, Action::Requeue(_)));
    let c = env.must(&key).await;
    assert_eq!(c.phase(), ComponentPhase::Installing);
    assert!(c.metadata.has_finalizer(keel_core::FINALIZER));

    let c = env.drive_until(&key, 5, is_ready).await;
    let status = c.status.clone().unwrap();
    assert!(status.active_hash.as_deref().unwrap().starts_with("sha256:"));
    assert_eq!(status.version.as_deref(), Some("v1.0"));
    assert_eq!(status.observed_generation, c.metadata.generation);
    assert!(status.conditions.is_true(SPEC_VALID));
    assert!(status.conditions.is_true(DEPENDENCIES_READY));
    assert!(ready_condition(&c).is_true());

    let deploy = env.live(&deploy_ref("pipeline-controller")).await.unwrap();
    assert_eq!(image_of(&deploy), "registry.local/pipeline:1.0");
    assert_eq!(deploy.metadata.labels[labels::MANAGED_BY], labels::MANAGED_BY_VALUE);
    assert_eq!(deploy.metadata.labels[labels::COMPONENT], "pipeline");
    assert!(env.live(&cm_ref("pipeline-config")).await.is_some());

    let history = env.ledger.history("keel/pipeline", None).unwrap();
    assert!(history.iter().any(|e| e.event == LedgerEvent::Ready));
}

#[tokio::test]
async fn ready_component_reconciles_without_writes() {
    let env = env(Some(3));
    let key = env.create(&component("pipeline", "pipeline", "v1.0")).await;
    env.drive_until(&key, 5, is_ready).await;

    assert_settled(&env, &key).await;
}

#[tokio::test]
async fn immaterial_spec_edit_only_bumps_observed_generation() {
    let env = env(Some(3));
    let key = env.create(&component("pipeline", "pipeline", "v1.0")).await;
    let c = env.drive_until(&key, 5, is_ready).await;
    let hash = c.status.unwrap().active_hash;

    env.edit(&key, |spec| {
        spec.config.insert("labels".into(), serde_json::json!({}));
    })
    .await;
    let before = env.store.writes();
    reconcile_component(&env.ctx, &key).await.unwrap();
    // the status patch for the new observed generation, nothing else
    assert_eq!(env.store.writes(), before + 1);

    let c = env.must(&key).await;
    let status = c.status.clone().unwrap();
    assert_eq!(status.active_hash, hash);
    assert_eq!(status.observed_generation, c.metadata.generation);
    assert_eq!(env.sets(&key).await.len(), 1);
}

#[tokio::test]
async fn upgrade_keeps_old_set_until_new_one_is_ready() {
    let env = env(Some(3));
    let key = env.create(&component("pipeline", "pipeline", "v1.0")).await;
    let c = env.drive_until(&key, 5, is_ready).await;
    let old_set = c.status.unwrap().active_installer_set.unwrap();

    env.sim.hold("pipeline-controller");
    env.edit(&key, |spec| spec.version = "v1.1".into()).await;
    env.pass(&key).await;

    let c = env.must(&key).await;
    let status = c.status.clone().unwrap();
    assert_eq!(c.phase(), ComponentPhase::Upgrading);
    assert_eq!(status.retained_installer_set.as_deref(), Some(old_set.as_str()));
    assert_ne!(status.active_installer_set.as_deref(), Some(old_set.as_str()));
    assert_eq!(ready_condition(&c).reason, "Upgrading");
    assert_eq!(env.sets(&key).await.len(), 2);

    // still held: nothing is superseded
    env.pass(&key).await;
    assert_eq!(env.must(&key).await.phase(), ComponentPhase::Upgrading);
    assert_eq!(env.sets(&key).await.len(), 2);

    env.sim.release("pipeline-controller");
    env.sim.settle().await.unwrap();
    let c = env.drive_until(&key, 5, is_ready).await;
    let status = c.status.unwrap();
    assert_eq!(status.version.as_deref(), Some("v1.1"));
    assert!(status.retained_installer_set.is_none());

    let sets = env.sets(&key).await;
    assert_eq!(sets.len(), 1);
    assert_ne!(sets[0].metadata.name, old_set);
    let deploy = env.live(&deploy_ref("pipeline-controller")).await.unwrap();
    assert_eq!(image_of(&deploy), "registry.local/pipeline:1.1");

    let history = env.ledger.history("keel/pipeline", None).unwrap();
    assert!(history
        .iter()
        .any(|e| e.event == LedgerEvent::Superseded && e.installer_set == old_set));

    assert_settled(&env, &key).await;
}

#[tokio::test]
async fn install_failure_past_threshold_reports_item_reason_and_recovers() {
    let env = env(Some(3));
    env.store.inject(
        Fault::on(Op::Create, Error::rejected("ConfigMap/ci/pipeline-config", "forbidden by policy"))
            .for_name("pipeline-config"),
    );
    let key = env.create(&component("pipeline", "pipeline", "v1.0")).await;

    env.pass(&key).await;
    env.pass(&key).await;
    let c = env.must(&key).await;
    assert_eq!(c.phase(), ComponentPhase::Installing);
    assert_eq!(env.sets(&key).await[0].phase(), InstallerSetPhase::PartiallyFailed);

    let action = env.pass(&key).await;
    assert!(matches!(action, Action::Requeue(_)));
    let c = env.must(&key).await;
    assert_eq!(c.phase(), ComponentPhase::Error);
    let ready = ready_condition(&c);
    assert_eq!(ready.reason, "Rejected");
    assert!(ready.message.contains("forbidden by policy"), "{}", ready.message);
    // the rest of the bundle is still in place
    assert!(env.live(&deploy_ref("pipeline-controller")).await.is_some());

    env.store.clear_faults();
    env.drive_until(&key, 5, is_ready).await;
    assert!(env.live(&cm_ref("pipeline-config")).await.is_some());
}

#[tokio::test]
async fn failed_upgrade_rolls_back_to_retained_bundle() {
    let env = env(Some(2));
    let key = env.create(&component("pipeline", "pipeline", "v1.0")).await;
    let c = env.drive_until(&key, 5, is_ready).await;
    let good = c.status.unwrap();

    env.store.inject(
        Fault::on(Op::Create, Error::rejected("ConfigMap/ci/pipeline-extra", "quota exceeded"))
            .for_name("pipeline-extra"),
    );
    env.edit(&key, |spec| spec.version = "v2.0".into()).await;

    env.pass(&key).await;
    assert_eq!(env.must(&key).await.phase(), ComponentPhase::Upgrading);
    assert!(env.live(&deploy_ref("pipeline-controller")).await.is_some());
    assert!(env.live(&cm_ref("pipeline-config")).await.is_some());

    let action = env.pass(&key).await;
    assert_eq!(action, Action::AwaitChange);
    let c = env.must(&key).await;
    let status = c.status.clone().unwrap();
    assert_eq!(c.phase(), ComponentPhase::Error);
    assert_eq!(ready_condition(&c).reason, "UpgradeRolledBack");
    assert_eq!(status.active_installer_set, good.active_installer_set);
    assert_eq!(status.active_hash, good.active_hash);
    assert!(status.retained_installer_set.is_none());
    assert!(status.failed_hash.is_some());
    assert_ne!(status.failed_hash, good.active_hash);

    let deploy = env.live(&deploy_ref("pipeline-controller")).await.unwrap();
    assert_eq!(image_of(&deploy), "registry.local/pipeline:1.0");
    assert!(env.live(&cm_ref("pipeline-extra")).await.is_none());
    assert_eq!(env.sets(&key).await.len(), 1);

    // the failed hash is not retried
    let before = env.store.writes();
    assert_eq!(reconcile_component(&env.ctx, &key).await.unwrap(), Action::AwaitChange);
    assert_eq!(env.store.writes(), before);

    let history = env.ledger.history("keel/pipeline", None).unwrap();
    assert!(history.iter().any(|e| e.event == LedgerEvent::RolledBack));

    // a new spec clears the failure
    env.store.clear_faults();
    env.edit(&key, |spec| spec.version = "v1.1".into()).await;
    let c = env.drive_until(&key, 6, is_ready).await;
    let status = c.status.unwrap();
    assert!(status.failed_hash.is_none());
    assert_eq!(status.version.as_deref(), Some("v1.1"));
    assert_settled(&env, &key).await;

    // with the cause gone, asking for the rolled-back version again retries it
    env.edit(&key, |spec| spec.version = "v2.0".into()).await;
    let c = env.drive_until(&key, 6, is_ready).await;
    let status = c.status.unwrap();
    assert_eq!(status.version.as_deref(), Some("v2.0"));
    assert!(status.failed_hash.is_none());
    assert!(env.live(&cm_ref("pipeline-extra")).await.is_some());
    assert_settled(&env, &key).await;
}

#[tokio::test]
async fn recovered_item_leaves_no_failure_behind() {
    let env = env(Some(3));
    env.store.inject(
        Fault::on(Op::Create, Error::transient("etcd busy"))
            .for_name("pipeline-config")
            .times(1),
    );
    let key = env.create(&component("pipeline", "pipeline", "v1.0")).await;
    env.pass(&key).await;
    let sets = env.sets(&key).await;
    let items = &sets[0].status.as_ref().unwrap().items;
    assert!(items.values().any(|i| i.reason.as_deref() == Some("TransientClusterError")));

    env.drive_until(&key, 5, is_ready).await;
    let sets = env.sets(&key).await;
    for (id, item) in &sets[0].status.as_ref().unwrap().items {
        assert_eq!(item.reason, None, "{id}");
        assert_eq!(item.message, None, "{id}");
        assert_eq!(item.next_retry_at, None, "{id}");
    }
    assert_settled(&env, &key).await;
}

#[tokio::test]
async fn dependent_waits_for_prerequisite() {
    let env = env(Some(3));
    let triggers = env.create(&component("triggers", "triggers", "v1.0")).await;

    let action = env.pass(&triggers).await;
    assert!(matches!(action, Action::Requeue(_)));
    let c = env.must(&triggers).await;
    assert_eq!(c.phase(), ComponentPhase::Waiting);
    let ready = ready_condition(&c);
    assert_eq!(ready.reason, "DependencyNotReady");
    assert_eq!(ready.message, "pipeline not ready");
    assert!(env.sets(&triggers).await.is_empty());

    let pipeline = env.create(&component("pipeline", "pipeline", "v1.0")).await;
    env.pass(&pipeline).await;
    env.pass(&triggers).await;
    assert_eq!(env.must(&triggers).await.phase(), ComponentPhase::Waiting);

    env.drive_until(&pipeline, 5, is_ready).await;
    let c = env.drive_until(&triggers, 5, is_ready).await;
    assert!(c.status.unwrap().conditions.is_true(DEPENDENCIES_READY));
    assert!(env.live(&deploy_ref("triggers-controller")).await.is_some());
}

#[tokio::test]
async fn invalid_version_is_terminal_until_fixed() {
    let env = env(Some(3));
    let key = env.create(&component("pipeline", "pipeline", "v9.9")).await;

    assert_eq!(env.pass(&key).await, Action::AwaitChange);
    let c = env.must(&key).await;
    assert_eq!(c.phase(), ComponentPhase::Error);
    let status = c.status.clone().unwrap();
    let spec_valid = status.conditions.get(SPEC_VALID).unwrap();
    assert!(!spec_valid.is_true());
    assert_eq!(spec_valid.reason, "ValidationError");
    assert!(env.sets(&key).await.is_empty());
    assert!(env.owned("pipeline").is_empty());

    env.edit(&key, |spec| spec.version = "v1.0".into()).await;
    env.drive_until(&key, 5, is_ready).await;
}

#[tokio::test]
async fn unknown_kind_is_rejected() {
    let env = env(Some(3));
    let key = env.create(&component("mystery", "mystery", "v1.0")).await;

    assert_eq!(env.pass(&key).await, Action::AwaitChange);
    let c = env.must(&key).await;
    assert_eq!(c.phase(), ComponentPhase::Error);
    assert_eq!(ready_condition(&c).reason, "ValidationError");
}

#[tokio::test]
async fn empty_version_defaults_to_newest_release() {
    let env = env(Some(3));
    let key = env.create(&component("pipeline", "pipeline", "")).await;
    let c = env.drive_until(&key, 5, is_ready).await;
    assert_eq!(c.status.unwrap().version.as_deref(), Some("v2.0"));
    assert!(env.live(&cm_ref("pipeline-extra")).await.is_some());
}

#[tokio::test]
async fn deletion_removes_everything_and_is_idempotent() {
    let env = env(Some(3));
    let key = env.create(&component("pipeline", "pipeline", "v1.0")).await;
    env.drive_until(&key, 5, is_ready).await;
    assert!(!env.owned("pipeline").is_empty());

    env.delete(&key).await;
    assert_eq!(env.pass(&key).await, Action::AwaitChange);
    assert!(env.fetch(&key).await.is_none());
    assert!(env.owned("pipeline").is_empty());
    assert!(env.live(&deploy_ref("pipeline-controller")).await.is_none());

    let history = env.ledger.history("keel/pipeline", None).unwrap();
    assert!(history.iter().any(|e| e.event == LedgerEvent::Deleted));

    let before = env.store.writes();
    assert_eq!(reconcile_component(&env.ctx, &key).await.unwrap(), Action::AwaitChange);
    assert_eq!(env.store.writes(), before);
}

#[tokio::test]
async fn prerequisite_deletion_waits_for_dependents() {
    let env = env(Some(3));
    let pipeline = env.create(&component("pipeline", "pipeline", "v1.0")).await;
    let triggers = env.create(&component("triggers", "triggers", "v1.0")).await;
    env.drive_until(&pipeline, 5, is_ready).await;
    env.drive_until(&triggers, 5, is_ready).await;

    env.delete(&pipeline).await;
    assert!(matches!(env.pass(&pipeline).await, Action::Requeue(_)));
    let c = env.must(&pipeline).await;
    assert_eq!(c.phase(), ComponentPhase::Deleting);
    assert!(ready_condition(&c).message.contains("triggers"));
    assert!(env.live(&deploy_ref("pipeline-controller")).await.is_some());

    env.delete(&triggers).await;
    env.pass(&triggers).await;
    assert!(env.fetch(&triggers).await.is_none());
    assert!(env.owned("triggers").is_empty());

    env.pass(&pipeline).await;
    assert!(env.fetch(&pipeline).await.is_none());
    assert!(env.owned("pipeline").is_empty());
}

#[tokio::test]
async fn conflict_surfaces_and_next_pass_succeeds() {
    let env = env(Some(3));
    let key = env.create(&component("pipeline", "pipeline", "v1.0")).await;
    env.pass(&key).await;

    env.store.inject(
        Fault::on(Op::Create, Error::conflict("InstallerSet", "stale resource version"))
            .for_kind("InstallerSet")
            .times(1),
    );
    env.edit(&key, |spec| spec.version = "v1.1".into()).await;
    let err = reconcile_component(&env.ctx, &key).await.unwrap_err();
    assert!(err.is_conflict());

    env.drive_until(&key, 6, is_ready).await;
}

#[tokio::test]
async fn cancelled_store_stops_the_pass() {
    let env = env(Some(3));
    let key = env.create(&component("pipeline", "pipeline", "v1.0")).await;

    let token = CancellationToken::new();
    let store = Arc::new(Cancellable::new(env.store.clone(), token.clone()));
    let ctx = Context::builder(store)
        .kinds(kinds())
        .source(Arc::new(source()))
        .config(config(Some(3)))
        .build()
        .unwrap();
    token.cancel();

    let err = reconcile_component(&ctx, &key).await.unwrap_err();
    assert!(err.is_cancelled(), "{err}");
    assert!(!env.must(&key).await.metadata.has_finalizer(keel_core::FINALIZER));
}
