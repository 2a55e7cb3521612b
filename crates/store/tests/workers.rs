#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keel_core::Backoff;
use keel_store::WorkQueue;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn workers_never_share_a_key() {
    let q: WorkQueue<u32> = WorkQueue::new("workers", Backoff::immediate());
    let active: Arc<Mutex<HashMap<u32, usize>>> = Arc::default();
    let overlaps = Arc::new(AtomicUsize::new(0));
    let handled = Arc::new(AtomicUsize::new(0));

    let mut workers = Vec::new();
    for _ in 0..4 {
        let (q, active, overlaps, handled) =
            (q.clone(), active.clone(), overlaps.clone(), handled.clone());
        workers.push(tokio::spawn(async move {
            while let Some(key) = q.get().await {
                {
                    let mut a = active.lock().unwrap();
                    let n = a.entry(key).or_insert(0);
                    *n += 1;
                    if *n > 1 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
                *active.lock().unwrap().get_mut(&key).unwrap() -= 1;
                handled.fetch_add(1, Ordering::SeqCst);
                q.done(&key);
            }
        }));
    }

    for round in 0..5 {
        for key in 0..8u32 {
            q.add(key);
        }
        tokio::time::sleep(Duration::from_millis(5 + round)).await;
    }
    // let the queue drain
    for _ in 0..200 {
        if q.is_empty() && q.in_flight() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    q.shutdown();
    for w in workers {
        w.await.unwrap();
    }

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    let n = handled.load(Ordering::SeqCst);
    // coalescing bounds the work: at least one pass per key, at most one per add
    assert!((8..=40).contains(&n), "handled {n}");
}
