//! # Update Coordinator Module
//!
//! The heart of the monitor: a periodic tick that keeps the radio link
//! healthy, reconciles the contact registry, schedules per-node status and
//! telemetry runs, and drains the inbound message queue. Per-node runs are
//! spawned tasks so a slow node never blocks the tick or other nodes.
//!
//! Tick phases, in order:
//! 1. **EnsureConnected** — a down link aborts the whole tick with an error
//!    (the outer run loop reconnects and retries).
//! 2. **FixedCommands** — once per connection: app start, device query,
//!    radio clock sync. Every tick: battery. On its own interval: local
//!    radio telemetry.
//! 3. **ReconcileContacts** — re-sync the added set when the radio flagged
//!    its table dirty or the refresh interval elapsed.
//! 4. **PerNodeScheduling** — repeaters, then clients; each gated by
//!    disabled/auto-disabled, an in-flight check, and its `next_update_at`.
//! 5. **DrainMessageQueue** — pull queued messages until the no-more
//!    sentinel, correlating channel text against the RX-log cache.

pub mod backoff;
pub mod node_update;
pub mod rate_limiter;
pub mod registry;
pub mod rx_log;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};

use crate::config::{ChannelConfig, Config, CoordinatorConfig, NodeConfig};
use crate::logutil::escape_log;
use crate::meshcore::api::MeshApi;
use crate::meshcore::dispatcher::EventFilter;
use crate::meshcore::{Contact, DeviceInfo, Event, SelfInfo};
use crate::metrics;
use crate::storage::PersistBackend;

use node_update::{NodeRuntimeState, NodeTaskSet, RunKind};
use rate_limiter::TokenBucket;
use registry::ContactRegistry;
use rx_log::{ChannelKey, RxLogCorrelator};

/// Upper bound on messages drained in one tick, against runaway queues.
const DRAIN_LIMIT: usize = 50;

/// State shared between the coordinator and its spawned node tasks.
pub struct Shared {
    api: RwLock<Arc<dyn MeshApi>>,
    pub config: CoordinatorConfig,
    pub bucket: Mutex<TokenBucket>,
    pub registry: Mutex<ContactRegistry>,
    pub nodes: Mutex<HashMap<String, NodeRuntimeState>>,
}

impl Shared {
    /// Current radio handle. Cheap; swapped atomically on reconnect.
    pub fn api(&self) -> Arc<dyn MeshApi> {
        self.api.read().expect("api lock poisoned").clone()
    }

    fn set_api(&self, api: Arc<dyn MeshApi>) {
        *self.api.write().expect("api lock poisoned") = api;
    }
}

pub struct UpdateCoordinator {
    shared: Arc<Shared>,
    tasks: NodeTaskSet,
    repeaters: Vec<NodeConfig>,
    clients: Vec<NodeConfig>,
    correlator: Arc<Mutex<RxLogCorrelator>>,
    /// App start and device query ran on the current connection.
    handshake_done: bool,
    advert_on_connect: bool,
    app_name: String,
    next_self_telemetry_at: u64,
    next_contact_refresh_at: u64,
    pub self_info: Option<SelfInfo>,
    pub device_info: Option<DeviceInfo>,
    pub last_battery_mv: Option<u16>,
    pub last_self_telemetry: Option<Vec<u8>>,
}

fn now_epoch() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

fn channel_keys(channels: &[ChannelConfig]) -> Result<Vec<ChannelKey>> {
    channels
        .iter()
        .map(|c| Ok(ChannelKey::new(c.channel_idx, c.secret_bytes()?)))
        .collect()
}

impl UpdateCoordinator {
    pub fn new(
        api: Arc<dyn MeshApi>,
        config: &Config,
        backend: Arc<dyn PersistBackend>,
    ) -> Result<Self> {
        let cfg = config.coordinator.clone();
        let bucket = TokenBucket::new(
            f64::from(cfg.rate_limiter_capacity),
            cfg.rate_limiter_refill_seconds,
        );
        let registry = ContactRegistry::new(backend, cfg.max_discovered_contacts);
        let correlator = RxLogCorrelator::new(
            if config.rx_log.enabled {
                channel_keys(&config.channels)?
            } else {
                Vec::new()
            },
            config.rx_log.ttl_seconds,
            config.rx_log.cache_max_size,
        );
        let shared = Arc::new(Shared {
            api: RwLock::new(api),
            config: cfg,
            bucket: Mutex::new(bucket),
            registry: Mutex::new(registry),
            nodes: Mutex::new(HashMap::new()),
        });
        Ok(Self {
            shared,
            tasks: NodeTaskSet::new(),
            repeaters: config.repeaters.clone(),
            clients: config.clients.clone(),
            correlator: Arc::new(Mutex::new(correlator)),
            handshake_done: false,
            advert_on_connect: config.radio.advert_on_connect,
            app_name: config.radio.app_name.clone(),
            next_self_telemetry_at: 0,
            next_contact_refresh_at: 0,
            self_info: None,
            device_info: None,
            last_battery_mv: None,
            last_self_telemetry: None,
        })
    }

    pub fn shared(&self) -> Arc<Shared> {
        self.shared.clone()
    }

    /// Seed the discovered store from persisted state. Call once at startup.
    pub fn load_discovered(&self, snapshot: Vec<Contact>) {
        self.shared
            .registry
            .lock()
            .expect("registry mutex poisoned")
            .load_discovered(snapshot);
    }

    /// Bind to a (new) radio connection: swap the handle, reset per
    /// connection state, and spawn the push-event router.
    pub fn attach(&mut self, api: Arc<dyn MeshApi>) {
        self.shared.set_api(api.clone());
        self.handshake_done = false;
        let shared = self.shared.clone();
        let correlator = self.correlator.clone();
        tokio::spawn(route_push_events(api, shared, correlator));
    }

    /// Run one coordinator tick. A transport-fatal error aborts the tick;
    /// per-node outcomes never propagate here.
    pub async fn tick(&mut self) -> Result<()> {
        let api = self.shared.api();
        if !api.connected() {
            self.on_link_lost();
            bail!("radio link is down");
        }

        self.fixed_commands(api.as_ref())
            .await
            .context("fixed command phase")?;
        self.reconcile_contacts(api.as_ref()).await;
        self.schedule_node_runs();
        self.drain_messages(api.as_ref()).await;

        metrics::inc_ticks_completed();
        Ok(())
    }

    /// Cancel in-flight runs but keep scheduling state, so the next
    /// successful tick resumes where it left off.
    pub fn on_link_lost(&mut self) {
        metrics::inc_ticks_failed();
        self.tasks.cancel_all();
        self.handshake_done = false;
    }

    async fn fixed_commands(&mut self, api: &dyn MeshApi) -> Result<()> {
        if !self.handshake_done {
            let info = api.app_start(&self.app_name).await?;
            info!(
                "radio is {} ({})",
                escape_log(&info.name),
                &info.public_key[..info.public_key.len().min(12)]
            );
            self.self_info = Some(info);
            match api.device_query().await {
                Ok(device) => {
                    info!(
                        "device: {} fw {} ({} channels)",
                        device.model, device.firmware_version, device.max_channels
                    );
                    self.device_info = Some(device);
                }
                Err(e) => warn!("device query failed: {e:#}"),
            }
            // Radios drift without a battery-backed clock; sync ours once
            // per connection.
            if let Err(e) = api.set_time(now_epoch() as u32).await {
                warn!("clock sync failed: {e:#}");
            }
            if self.advert_on_connect {
                if let Err(e) = api.send_advert(false).await {
                    warn!("advert on connect failed: {e:#}");
                }
            }
            self.handshake_done = true;
        }

        match api.get_battery().await {
            Ok(mv) => {
                debug!("local battery {mv}mV");
                self.last_battery_mv = Some(mv);
            }
            Err(e) => warn!("battery query failed: {e:#}"),
        }

        let now = now_epoch();
        if now >= self.next_self_telemetry_at {
            match api.get_self_telemetry().await {
                Ok(lpp) => {
                    debug!("self telemetry: {} LPP bytes", lpp.len());
                    self.last_self_telemetry = Some(lpp);
                }
                Err(e) => warn!("self telemetry failed: {e:#}"),
            }
            self.next_self_telemetry_at = now + self.shared.config.self_telemetry_seconds;
        }
        Ok(())
    }

    async fn reconcile_contacts(&mut self, api: &dyn MeshApi) {
        let now = now_epoch();
        let dirty = self
            .shared
            .registry
            .lock()
            .expect("registry mutex poisoned")
            .take_dirty();
        if !dirty && now < self.next_contact_refresh_at {
            return;
        }
        match api.sync_contacts(0).await {
            Ok(contacts) => {
                debug!("synced {} contacts from radio", contacts.len());
                self.shared
                    .registry
                    .lock()
                    .expect("registry mutex poisoned")
                    .set_added_contacts(contacts);
            }
            Err(e) => warn!("contact sync failed: {e:#}"),
        }
        self.next_contact_refresh_at = now + self.shared.config.contact_refresh_seconds;
    }

    fn schedule_node_runs(&mut self) {
        self.tasks.reap();
        let now = now_epoch();
        let nodes: Vec<NodeConfig> = self
            .repeaters
            .iter()
            .chain(self.clients.iter())
            .cloned()
            .collect();
        for node in nodes {
            self.schedule_one(&node, now);
        }
    }

    fn schedule_one(&mut self, node: &NodeConfig, now: u64) {
        if node.disabled {
            return;
        }
        let prefix = node.pubkey_prefix.clone();
        let (due_status, due_telemetry) = {
            let mut states = self.shared.nodes.lock().expect("node state mutex poisoned");
            let state = states
                .entry(prefix.clone())
                .or_insert_with(|| NodeRuntimeState::new(now));

            let anchor = state.last_success_at.unwrap_or(state.tracking_since);
            let limit = self.shared.config.auto_disable_hours * 3600;
            if now.saturating_sub(anchor) >= limit {
                if !state.auto_disabled {
                    warn!(
                        "auto-disabling {prefix}: no successful update in {}h",
                        self.shared.config.auto_disable_hours
                    );
                    state.auto_disabled = true;
                }
                return;
            }
            (
                now >= state.next_update_at,
                node.telemetry_enabled && now >= state.next_telemetry_at,
            )
        };

        if self.tasks.is_running(&prefix) {
            return;
        }
        let kind = if due_status {
            RunKind::Status
        } else if due_telemetry {
            RunKind::Telemetry
        } else {
            return;
        };
        debug!("spawning {:?} run for {prefix}", kind);
        let handle = tokio::spawn(node_update::run_node_update(
            self.shared.clone(),
            node.clone(),
            kind,
        ));
        self.tasks.start(&prefix, handle);
    }

    async fn drain_messages(&mut self, api: &dyn MeshApi) {
        for _ in 0..DRAIN_LIMIT {
            match api.sync_next_message().await {
                Ok(Event::NoMoreMsgs) => return,
                Ok(Event::ChannelMsgRecv(msg)) => {
                    let observations = self
                        .correlator
                        .lock()
                        .expect("correlator mutex poisoned")
                        .take_matches(msg.channel_idx, msg.timestamp, &msg.text);
                    if let Some(best) = observations.first() {
                        info!(
                            "channel {} msg ({} paths, snr {:.1}dB rssi {:.0}dBm): {}",
                            msg.channel_idx,
                            observations.len(),
                            best.snr,
                            best.rssi,
                            escape_log(&msg.text)
                        );
                    } else {
                        info!(
                            "channel {} msg: {}",
                            msg.channel_idx,
                            escape_log(&msg.text)
                        );
                    }
                }
                Ok(Event::ContactMsgRecv(msg)) => {
                    info!(
                        "direct msg from {}: {}",
                        msg.pubkey_prefix,
                        escape_log(&msg.text)
                    );
                }
                Ok(other) => {
                    debug!("unexpected drain reply {:?}", other.kind());
                    return;
                }
                Err(e) => {
                    debug!("message drain stopped: {e:#}");
                    return;
                }
            }
        }
        warn!("message drain hit the per-tick limit of {DRAIN_LIMIT}");
    }

    // -- surface for the status command and downstream observers --

    /// Merged contact view.
    pub fn get_all_contacts(&self) -> Vec<Contact> {
        self.shared
            .registry
            .lock()
            .expect("registry mutex poisoned")
            .merge()
    }

    pub fn get_device_update_interval(&self, pubkey_prefix: &str) -> Option<u64> {
        self.repeaters
            .iter()
            .chain(self.clients.iter())
            .find(|n| n.pubkey_prefix == pubkey_prefix)
            .map(|n| n.update_interval_seconds)
    }

    /// Current rate-limiter balance, for observability.
    pub fn tokens_available(&self) -> f64 {
        self.shared
            .bucket
            .lock()
            .expect("token bucket mutex poisoned")
            .available()
    }

    pub fn mark_contact_dirty(&self, pubkey_prefix: &str) {
        self.shared
            .registry
            .lock()
            .expect("registry mutex poisoned")
            .mark_contact_dirty(pubkey_prefix);
    }

    pub fn is_contact_dirty(&self, pubkey_prefix: &str) -> bool {
        self.shared
            .registry
            .lock()
            .expect("registry mutex poisoned")
            .is_contact_dirty(pubkey_prefix)
    }

    pub fn clear_contact_dirty(&self, pubkey_prefix: &str) {
        self.shared
            .registry
            .lock()
            .expect("registry mutex poisoned")
            .clear_contact_dirty(pubkey_prefix);
    }

    /// Snapshot of per-node runtime state, keyed by pubkey prefix.
    pub fn node_states(&self) -> HashMap<String, NodeRuntimeState> {
        self.shared
            .nodes
            .lock()
            .expect("node state mutex poisoned")
            .clone()
    }

    pub fn in_flight_runs(&self) -> usize {
        self.tasks.running_count()
    }
}

/// Background router for pushes that arrive outside any command exchange:
/// advertisements feed the discovered store, dirty flags mark the registry,
/// raw RX logs feed the correlator. Ends when the connection drops.
async fn route_push_events(
    api: Arc<dyn MeshApi>,
    shared: Arc<Shared>,
    correlator: Arc<Mutex<RxLogCorrelator>>,
) {
    let mut stream = api.dispatcher().subscribe(None, EventFilter::any());
    while let Some(event) = stream.recv().await {
        match event {
            Event::Advertisement(contact) => {
                let mut registry = shared.registry.lock().expect("registry mutex poisoned");
                registry.on_new_contact_discovered(contact);
            }
            Event::ContactsDirty => {
                debug!("radio flagged contact table dirty");
                let mut registry = shared.registry.lock().expect("registry mutex poisoned");
                registry.mark_dirty();
            }
            Event::PathUpdated { pubkey_prefix } => {
                debug!("path updated for {pubkey_prefix}");
                let mut registry = shared.registry.lock().expect("registry mutex poisoned");
                registry.mark_dirty();
                registry.mark_contact_dirty(&pubkey_prefix);
            }
            Event::RxLog(rx) => {
                let mut correlator = correlator.lock().expect("correlator mutex poisoned");
                correlator.on_rx_log(&rx);
            }
            Event::Disconnected => break,
            _ => {}
        }
    }
    debug!("push event router stopped");
}
