//! Typed helpers over a shared in-memory cluster.

use std::sync::Arc;

use futures::StreamExt;
use keel_core::{
    Component, ComponentPhase, ComponentSpec, ComponentStatus, DeltaKind, LabelSelector, Object,
    FINALIZER,
};
use keel_kubehub::{typed, Cancellable, MemoryStore, ResourceStore};
use tokio_util::sync::CancellationToken;

fn pipeline() -> Component {
    Component::new(
        "pipeline",
        Some("keel"),
        ComponentSpec {
            kind: "pipeline".into(),
            version: "v1.0".into(),
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn status_write_leaves_spec_and_generation_alone() {
    let store = MemoryStore::new();
    let created = typed::create(&store, &pipeline()).await.unwrap();
    assert_eq!(created.metadata.generation, 1);

    let status = ComponentStatus {
        phase: ComponentPhase::Installing,
        ..Default::default()
    };
    let patched = typed::replace_status(&store, &created, &serde_json::to_value(&status).unwrap())
        .await
        .unwrap();
    assert_eq!(patched.phase(), ComponentPhase::Installing);
    assert_eq!(patched.spec, created.spec);
    assert_eq!(patched.metadata.generation, 1);

    // the old version is stale now
    let err = typed::replace_status(&store, &created, &serde_json::json!({})).await.unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test]
async fn status_write_drops_cleared_fields() {
    let store = MemoryStore::new();
    let created = typed::create(&store, &pipeline()).await.unwrap();
    let upgrading = ComponentStatus {
        phase: ComponentPhase::Upgrading,
        retained_installer_set: Some("pipeline-0123456789".into()),
        failed_hash: Some("sha256:abc".into()),
        ..Default::default()
    };
    let c = typed::replace_status(&store, &created, &serde_json::to_value(&upgrading).unwrap())
        .await
        .unwrap();

    let settled = ComponentStatus {
        phase: ComponentPhase::Ready,
        ..Default::default()
    };
    typed::replace_status(&store, &c, &serde_json::to_value(&settled).unwrap())
        .await
        .unwrap();
    let live: Component = typed::get(&store, &c.key()).await.unwrap().unwrap();
    let status = live.status.unwrap();
    assert_eq!(status.phase, ComponentPhase::Ready);
    assert_eq!(status.retained_installer_set, None);
    assert_eq!(status.failed_hash, None);
}

#[tokio::test]
async fn finalizer_holds_deletion_until_released() {
    let store = MemoryStore::new();
    let mut c = pipeline();
    c.metadata.finalizers.push(FINALIZER.into());
    let c = typed::create(&store, &c).await.unwrap();

    assert!(typed::delete(&store, &c).await.unwrap());
    let mut c: Component = typed::get(&store, &c.key()).await.unwrap().unwrap();
    assert!(c.metadata.is_deleting());

    c.metadata.finalizers.clear();
    typed::update(&store, &c).await.unwrap();
    assert!(typed::get::<Component>(&store, &c.key()).await.unwrap().is_none());
    assert!(!typed::delete(&store, &c).await.unwrap());
}

#[tokio::test]
async fn shared_store_behind_cancellation() {
    let inner = Arc::new(MemoryStore::new());
    let token = CancellationToken::new();
    let store = Cancellable::new(Arc::clone(&inner), token.clone());

    let mut events = store
        .watch(&Component::type_ref(), Some("keel"))
        .await
        .unwrap();
    typed::create(&store, &pipeline()).await.unwrap();
    let first = events.next().await.unwrap();
    assert_eq!(first.kind, DeltaKind::Applied);
    assert_eq!(first.object.metadata.name, "pipeline");

    // writes through the wrapper land in the shared store
    let listed: Vec<Component> = typed::list(&*inner, Some("keel"), &LabelSelector::everything())
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    token.cancel();
    assert!(events.next().await.is_none());
    let err = typed::get::<Component>(&store, &pipeline().key()).await.unwrap_err();
    assert!(err.is_cancelled());
}
