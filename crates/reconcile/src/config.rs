//! Operator tunables, read from `KEEL_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use keel_apply::RolloutPolicy;
use keel_core::Backoff;

#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    /// Reconcile workers per component kind (and for stacks)
    pub workers_per_kind: usize,
    /// Every known key is re-enqueued on this interval
    pub resync_interval: Duration,
    /// Per-key backoff for passes that return an error
    pub requeue_backoff: Backoff,
    /// Poll interval while waiting on prerequisites or rollouts
    pub not_ready_poll: Duration,
    pub rollout: RolloutPolicy,
    /// Only watch this namespace; `None` watches all
    pub watch_namespace: Option<String>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            workers_per_kind: 2,
            resync_interval: Duration::from_secs(300),
            requeue_backoff: Backoff::new(Duration::from_millis(500), Duration::from_secs(300)),
            not_ready_poll: Duration::from_secs(10),
            rollout: RolloutPolicy::default(),
            watch_namespace: None,
        }
    }
}

impl OperatorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset or unparsable values keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |key: &str| lookup(key).and_then(|s| parse_trimmed::<u64>(&s));
        let mut cfg = Self::default();

        if let Some(n) = lookup("KEEL_WORKERS").and_then(|s| parse_trimmed::<usize>(&s)) {
            cfg.workers_per_kind = n.max(1);
        }
        if let Some(secs) = parse("KEEL_RESYNC_SECS") {
            cfg.resync_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(ms) = parse("KEEL_REQUEUE_BASE_MS") {
            cfg.requeue_backoff.initial = Duration::from_millis(ms);
        }
        if let Some(secs) = parse("KEEL_REQUEUE_MAX_SECS") {
            cfg.requeue_backoff.max = Duration::from_secs(secs);
        }
        if let Some(secs) = parse("KEEL_POLL_SECS") {
            cfg.not_ready_poll = Duration::from_secs(secs.max(1));
        }
        // "none" or 0 disables rollback and retries forever
        if let Some(raw) = lookup("KEEL_FAILURE_THRESHOLD") {
            match raw.trim() {
                "none" | "0" => cfg.rollout.failure_threshold = None,
                s => {
                    if let Ok(n) = s.parse::<u32>() {
                        cfg.rollout.failure_threshold = Some(n);
                    }
                }
            }
        }
        if let Some(ms) = parse("KEEL_ITEM_BACKOFF_BASE_MS") {
            cfg.rollout.item_backoff.initial = Duration::from_millis(ms);
        }
        if let Some(secs) = parse("KEEL_ITEM_BACKOFF_MAX_SECS") {
            cfg.rollout.item_backoff.max = Duration::from_secs(secs);
        }
        cfg.watch_namespace = lookup("KEEL_WATCH_NAMESPACE").filter(|s| !s.trim().is_empty());
        cfg
    }
}

fn parse_trimmed<T: FromStr>(s: &str) -> Option<T> {
    s.trim().parse::<T>().ok()
}
