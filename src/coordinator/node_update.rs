//! Per-node update runs.
//!
//! Each tracked node is polled on its own schedule by a spawned task that
//! walks one status (or telemetry) request through jitter, rate limiting,
//! the request/response exchange, and failure classification. The
//! coordinator guarantees at most one in-flight run per node by holding a
//! task handle; runs for different nodes interleave freely.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use rand::Rng;
use tokio::task::JoinHandle;

use crate::logutil::escape_log;
use crate::meshcore::dispatcher::EventFilter;
use crate::meshcore::{BinaryReqType, Contact, Event, EventKind, StatusPayload};
use crate::metrics;
use crate::{config::NodeConfig, coordinator::backoff};

use super::Shared;

/// Random pre-request delay bound, spreading out nodes that share an
/// update interval.
const JITTER_MAX_SECS: u64 = 30;

/// Soft bound on waiting for the status/telemetry response. The protocol
/// has no reply deadline of its own; past this the run counts as
/// "no response".
const RESPONSE_WAIT: Duration = Duration::from_secs(30);

/// How long a login exchange may take before it is treated as unresolved.
const LOGIN_WAIT: Duration = Duration::from_secs(15);

/// What a spawned run requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Status,
    Telemetry,
}

/// Mutable per-node scheduling and result state, keyed by pubkey prefix in
/// the coordinator's node map. All timestamps are unix seconds.
#[derive(Debug, Clone, Default)]
pub struct NodeRuntimeState {
    pub consecutive_failures: u32,
    pub last_success_at: Option<u64>,
    /// When tracking began; stands in for `last_success_at` in the
    /// auto-disable clock until the first success.
    pub tracking_since: u64,
    pub next_update_at: u64,
    pub next_telemetry_at: u64,
    pub last_login_attempt_at: Option<u64>,
    pub auto_disabled: bool,
    pub last_status: Option<StatusPayload>,
    pub last_telemetry_lpp: Option<Vec<u8>>,
}

impl NodeRuntimeState {
    pub fn new(now: u64) -> Self {
        Self {
            tracking_since: now,
            ..Default::default()
        }
    }
}

/// Live task handles for in-flight node runs, keyed by pubkey prefix.
/// A slot frees up only once its task has resolved.
#[derive(Default)]
pub struct NodeTaskSet {
    tasks: HashMap<String, JoinHandle<()>>,
}

impl NodeTaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a run for this node is still unresolved.
    pub fn is_running(&self, pubkey_prefix: &str) -> bool {
        self.tasks
            .get(pubkey_prefix)
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Claim the node's slot. Returns false (and spawns nothing) when a run
    /// is already in flight.
    pub fn start(&mut self, pubkey_prefix: &str, handle: JoinHandle<()>) -> bool {
        if self.is_running(pubkey_prefix) {
            handle.abort();
            return false;
        }
        self.tasks.insert(pubkey_prefix.to_string(), handle);
        true
    }

    /// Drop handles of completed runs.
    pub fn reap(&mut self) {
        self.tasks.retain(|_, h| !h.is_finished());
    }

    /// Abort everything, e.g. on disconnect. Scheduling state is untouched
    /// so the next tick resumes fairly.
    pub fn cancel_all(&mut self) {
        for (prefix, handle) in self.tasks.drain() {
            debug!("cancelling in-flight run for {prefix}");
            handle.abort();
        }
    }

    pub fn running_count(&self) -> usize {
        self.tasks.values().filter(|h| !h.is_finished()).count()
    }
}

fn now_epoch() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Execute one update run for a node. Never propagates errors; every
/// outcome lands in the node's runtime state.
pub async fn run_node_update(shared: Arc<Shared>, node: NodeConfig, kind: RunKind) {
    let jitter = rand::thread_rng().gen_range(0..=JITTER_MAX_SECS);
    debug!(
        "{:?} run for {} starting after {jitter}s jitter",
        kind, node.pubkey_prefix
    );
    tokio::time::sleep(Duration::from_secs(jitter)).await;

    let contact = {
        let registry = shared.registry.lock().expect("registry mutex poisoned");
        registry.get_by_prefix(&node.pubkey_prefix)
    };
    let Some(contact) = contact else {
        // Not yet discovered or synced; not a failure, try again next tick.
        debug!("no contact known for {}, skipping run", node.pubkey_prefix);
        return;
    };

    if kind == RunKind::Status && needs_login(&shared, &node) && !attempt_login(&shared, &node, &contact).await {
        return;
    }

    if !take_token(&shared) {
        metrics::inc_tokens_denied();
        warn!(
            "rate limit empty, deferring {:?} run for {}",
            kind, node.pubkey_prefix
        );
        record_failure(&shared, &node, kind, &contact, false).await;
        return;
    }

    let req = match kind {
        RunKind::Status => BinaryReqType::Status,
        RunKind::Telemetry => BinaryReqType::Telemetry,
    };
    let api = shared.api();
    metrics::inc_requests_sent();
    if let Err(e) = api.send_binary_req(&contact, req).await {
        warn!("{:?} request to {} failed: {e:#}", kind, node.pubkey_prefix);
        record_failure(&shared, &node, kind, &contact, true).await;
        return;
    }

    let wanted = match kind {
        RunKind::Status => EventKind::StatusResponse,
        RunKind::Telemetry => EventKind::TelemetryResponse,
    };
    let response = api
        .dispatcher()
        .wait_for(wanted, EventFilter::for_prefix(&node.pubkey_prefix), RESPONSE_WAIT)
        .await;

    match response {
        Some(Event::StatusResponse(payload)) => {
            if payload.uptime == 0 {
                // Known malformed-response class, distinct from silence.
                warn!(
                    "malformed status from {} (zero uptime)",
                    node.pubkey_prefix
                );
                record_failure(&shared, &node, kind, &contact, true).await;
            } else {
                info!(
                    "status from {} ({}): {}mV, rssi {}dBm, up {}s",
                    node.pubkey_prefix,
                    escape_log(&contact.adv_name),
                    payload.battery_mv,
                    payload.last_rssi,
                    payload.uptime
                );
                record_success(&shared, &node, kind, Some(payload), None);
            }
        }
        Some(Event::TelemetryResponse(payload)) => {
            info!(
                "telemetry from {}: {} LPP bytes",
                node.pubkey_prefix,
                payload.lpp.len()
            );
            record_success(&shared, &node, kind, None, Some(payload.lpp));
        }
        Some(other) => {
            warn!(
                "unexpected {:?} reply for {}",
                other.kind(),
                node.pubkey_prefix
            );
            record_failure(&shared, &node, kind, &contact, true).await;
        }
        None => {
            warn!("no {:?} response from {}", kind, node.pubkey_prefix);
            record_failure(&shared, &node, kind, &contact, true).await;
        }
    }
}

fn take_token(shared: &Shared) -> bool {
    shared
        .bucket
        .lock()
        .expect("token bucket mutex poisoned")
        .try_consume()
}

/// Whether the failure streak and cooldown call for a login attempt.
fn needs_login(shared: &Shared, node: &NodeConfig) -> bool {
    if node.login_password.is_none() {
        return false;
    }
    let nodes = shared.nodes.lock().expect("node state mutex poisoned");
    let Some(state) = nodes.get(&node.pubkey_prefix) else {
        return false;
    };
    if state.consecutive_failures < shared.config.max_repeater_failures_before_login {
        return false;
    }
    match state.last_login_attempt_at {
        Some(at) => now_epoch().saturating_sub(at) >= shared.config.login_cooldown_seconds,
        None => true,
    }
}

/// Try a repeater login. The failure streak is reset and the attempt
/// timestamp recorded whatever the outcome, so a wrong password cannot
/// cause login hammering. Returns false when the run should stop here.
async fn attempt_login(shared: &Arc<Shared>, node: &NodeConfig, contact: &Contact) -> bool {
    let password = match &node.login_password {
        Some(p) => p.clone(),
        None => return true,
    };
    if !take_token(shared) {
        metrics::inc_tokens_denied();
        metrics::record_failure(&node.pubkey_prefix);
        bump_failures(shared, node);
        return false;
    }
    info!("attempting login to {}", node.pubkey_prefix);
    let api = shared.api();
    metrics::inc_requests_sent();
    let sent = api.send_login(contact, &password).await;
    let outcome = match sent {
        Ok(()) => {
            let success = api
                .dispatcher()
                .wait_for(
                    EventKind::LoginSuccess,
                    EventFilter::for_prefix(&node.pubkey_prefix),
                    LOGIN_WAIT,
                )
                .await;
            if success.is_some() {
                "succeeded"
            } else {
                "unconfirmed"
            }
        }
        Err(_) => "failed to send",
    };
    info!("login to {} {}", node.pubkey_prefix, outcome);
    let mut nodes = shared.nodes.lock().expect("node state mutex poisoned");
    if let Some(state) = nodes.get_mut(&node.pubkey_prefix) {
        state.consecutive_failures = 0;
        state.last_login_attempt_at = Some(now_epoch());
    }
    true
}

fn bump_failures(shared: &Shared, node: &NodeConfig) -> u32 {
    let mut nodes = shared.nodes.lock().expect("node state mutex poisoned");
    let state = nodes
        .entry(node.pubkey_prefix.clone())
        .or_insert_with(|| NodeRuntimeState::new(now_epoch()));
    state.consecutive_failures += 1;
    state.consecutive_failures
}

/// Record a failed run: bump the streak, maybe reset the routing path, and
/// push the next attempt out by the exponential backoff.
async fn record_failure(
    shared: &Arc<Shared>,
    node: &NodeConfig,
    kind: RunKind,
    contact: &Contact,
    count_it: bool,
) {
    let failures = if count_it {
        metrics::record_failure(&node.pubkey_prefix);
        bump_failures(shared, node)
    } else {
        let nodes = shared.nodes.lock().expect("node state mutex poisoned");
        nodes
            .get(&node.pubkey_prefix)
            .map(|s| s.consecutive_failures)
            .unwrap_or(0)
    };

    if count_it
        && failures == shared.config.max_failures_before_path_reset
        && contact.has_path()
        && !node.disable_path_reset
    {
        // Best effort: a stale path is a common cause of silence and the
        // radio will flood-route until a new one is learned.
        info!(
            "resetting path to {} after {failures} failures",
            node.pubkey_prefix
        );
        if let Err(e) = shared.api().reset_path(contact).await {
            warn!("path reset for {} failed: {e:#}", node.pubkey_prefix);
        }
    }

    let delay = backoff::delay_for(node.update_interval_seconds, failures);
    let mut nodes = shared.nodes.lock().expect("node state mutex poisoned");
    let state = nodes
        .entry(node.pubkey_prefix.clone())
        .or_insert_with(|| NodeRuntimeState::new(now_epoch()));
    let next = now_epoch() + delay;
    match kind {
        RunKind::Status => state.next_update_at = next,
        RunKind::Telemetry => state.next_telemetry_at = next,
    }
    debug!(
        "{:?} retry for {} in {delay}s (failure #{failures})",
        kind, node.pubkey_prefix
    );
}

/// Record a successful run: clear the streak, stamp the result, schedule
/// the next run a full interval out, and flag the contact dirty for
/// downstream observers.
fn record_success(
    shared: &Arc<Shared>,
    node: &NodeConfig,
    kind: RunKind,
    status: Option<StatusPayload>,
    telemetry: Option<Vec<u8>>,
) {
    metrics::record_success(&node.pubkey_prefix);
    let now = now_epoch();
    {
        let mut nodes = shared.nodes.lock().expect("node state mutex poisoned");
        let state = nodes
            .entry(node.pubkey_prefix.clone())
            .or_insert_with(|| NodeRuntimeState::new(now));
        state.consecutive_failures = 0;
        state.last_success_at = Some(now);
        if let Some(payload) = status {
            state.last_status = Some(payload);
        }
        if let Some(lpp) = telemetry {
            state.last_telemetry_lpp = Some(lpp);
        }
        match kind {
            RunKind::Status => state.next_update_at = now + node.update_interval_seconds,
            RunKind::Telemetry => state.next_telemetry_at = now + node.update_interval_seconds,
        }
    }
    let mut registry = shared.registry.lock().expect("registry mutex poisoned");
    registry.mark_contact_dirty(&node.pubkey_prefix);
}
