//! Per-node reliability counters.
//!
//! Tracks how often status/telemetry requests to each tracked node succeed or
//! fail over the process lifetime. Counters are global so spawned node update
//! tasks can record outcomes without threading a handle everywhere; the
//! `status` CLI command prints a snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

static REQUESTS_SENT: AtomicU64 = AtomicU64::new(0);
static TOKENS_DENIED: AtomicU64 = AtomicU64::new(0);
static TICKS_COMPLETED: AtomicU64 = AtomicU64::new(0);
static TICKS_FAILED: AtomicU64 = AtomicU64::new(0);

static NODE_COUNTERS: OnceLock<Mutex<HashMap<String, NodeCounter>>> = OnceLock::new();

/// Success/failure tally for one tracked node, keyed by pubkey prefix.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NodeCounter {
    pub successes: u64,
    pub failures: u64,
}

fn node_counter_lock() -> &'static Mutex<HashMap<String, NodeCounter>> {
    NODE_COUNTERS.get_or_init(|| Mutex::new(HashMap::new()))
}

pub fn inc_requests_sent() {
    REQUESTS_SENT.fetch_add(1, Ordering::Relaxed);
}

/// A rate-limiter token was unavailable when a node run wanted one.
pub fn inc_tokens_denied() {
    TOKENS_DENIED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_ticks_completed() {
    TICKS_COMPLETED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_ticks_failed() {
    TICKS_FAILED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_success(pubkey_prefix: &str) -> NodeCounter {
    let mut guard = node_counter_lock()
        .lock()
        .expect("node counter mutex poisoned");
    let counter = guard.entry(pubkey_prefix.to_string()).or_default();
    counter.successes = counter.successes.saturating_add(1);
    *counter
}

pub fn record_failure(pubkey_prefix: &str) -> NodeCounter {
    let mut guard = node_counter_lock()
        .lock()
        .expect("node counter mutex poisoned");
    let counter = guard.entry(pubkey_prefix.to_string()).or_default();
    counter.failures = counter.failures.saturating_add(1);
    *counter
}

pub fn node_counters_snapshot() -> HashMap<String, NodeCounter> {
    node_counter_lock()
        .lock()
        .expect("node counter mutex poisoned")
        .clone()
}

/// Global counters snapshot for the `status` command.
#[derive(Debug, Clone, Copy, Default)]
pub struct Snapshot {
    pub requests_sent: u64,
    pub tokens_denied: u64,
    pub ticks_completed: u64,
    pub ticks_failed: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        requests_sent: REQUESTS_SENT.load(Ordering::Relaxed),
        tokens_denied: TOKENS_DENIED.load(Ordering::Relaxed),
        ticks_completed: TICKS_COMPLETED.load(Ordering::Relaxed),
        ticks_failed: TICKS_FAILED.load(Ordering::Relaxed),
    }
}
