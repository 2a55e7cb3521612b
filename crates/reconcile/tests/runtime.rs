//! The full operator loop: watches, queues and workers over the in-memory
//! cluster with the simulator settling workloads in the background.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use keel_core::{
    ComponentKind, LabelSelector, Object, ObjectKey, Stack, StackComponent, StackSpec,
};
use keel_kubehub::{typed, MemoryStore, ResourceStore, Simulator};
use keel_reconcile::{Context, OperatorConfig, Runtime};
use tokio_util::sync::CancellationToken;

async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn stack_ready(store: &MemoryStore, key: &ObjectKey) -> bool {
    typed::get::<Stack>(store, key)
        .await
        .ok()
        .flatten()
        .is_some_and(|s| s.is_ready())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn operator_brings_a_stack_up_and_down() {
    let store = Arc::new(MemoryStore::new());
    let config = OperatorConfig {
        workers_per_kind: 2,
        resync_interval: Duration::from_millis(500),
        ..config(Some(5))
    };
    let ctx = Context::builder(store.clone())
        .kinds(kinds())
        .source(Arc::new(source()))
        .config(config)
        .build()
        .unwrap();
    let runtime = Arc::new(Runtime::new(Arc::new(ctx)));
    let token = CancellationToken::new();
    let sim = Arc::new(Simulator::new(store.clone())).spawn(Duration::from_millis(10), token.clone());
    let operator = tokio::spawn(Arc::clone(&runtime).run(token.clone()));

    let components = [("pipeline", "v1.0"), ("triggers", "v1.0")]
        .into_iter()
        .map(|(kind, version)| {
            (
                ComponentKind::from(kind),
                StackComponent {
                    version: version.into(),
                    ..Default::default()
                },
            )
        })
        .collect();
    let stack = Stack::new(
        "ci",
        Some(NS),
        StackSpec {
            target_namespace: TARGET.into(),
            components,
        },
    );
    let key = typed::create(&*store, &stack).await.unwrap().key();

    wait_for("stack ready", || stack_ready(&store, &key)).await;
    assert!(store.contains(&deploy_ref("pipeline-controller")));
    assert!(store.contains(&deploy_ref("triggers-controller")));

    let current: Stack = typed::get(&*store, &key).await.unwrap().unwrap();
    store.delete(&current.object_ref(), None).await.unwrap();
    wait_for("stack removed", || {
        let store = store.clone();
        let key = key.clone();
        async move {
            let gone = typed::get::<Stack>(&*store, &key).await.ok().flatten().is_none();
            let left: Vec<keel_core::Component> = typed::list(&*store, Some(NS), &LabelSelector::everything())
                .await
                .unwrap_or_default();
            gone && left.is_empty()
        }
    })
    .await;
    assert!(!store.contains(&deploy_ref("pipeline-controller")));
    assert!(!store.contains(&cm_ref("triggers-config")));

    token.cancel();
    operator.await.unwrap().unwrap();
    sim.await.unwrap();
}
