//! Shared helpers for integration tests: a scripted in-memory radio and a
//! call-counting persistence backend.
#![allow(dead_code)] // Not every test binary uses every helper.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use meshmon::meshcore::api::MeshApi;
use meshmon::meshcore::dispatcher::Dispatcher;
use meshmon::meshcore::{
    BinaryReqType, Contact, DeviceInfo, Event, NodeType, SelfInfo, StatusPayload,
    TelemetryPayload,
};
use meshmon::storage::PersistBackend;

/// A contact whose 64-hex public key is one character repeated.
pub fn contact(tag: char, node_type: NodeType) -> Contact {
    Contact {
        public_key: tag.to_string().repeat(64),
        adv_name: format!("node-{tag}"),
        node_type,
        last_advert: 1_700_000_000,
        out_path: vec![0x10],
        out_path_len: 1,
        adv_lat: 0.0,
        adv_lon: 0.0,
        lastmod: 1_700_000_000,
        pubkey_prefix: String::new(),
        added_to_node: false,
    }
}

pub fn prefix(tag: char) -> String {
    tag.to_string().repeat(12)
}

/// Persistence backend that only counts writes.
#[derive(Default)]
pub struct MemoryBackend {
    pub writes: AtomicUsize,
    pub last: Mutex<Vec<Contact>>,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl PersistBackend for MemoryBackend {
    fn save(&self, contacts: &[Contact]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = contacts.to_vec();
        Ok(())
    }
}

/// Scripted radio. Status/telemetry requests answer from `status_by_prefix`
/// after a short delay, unless the prefix is in `silent_prefixes`.
pub struct FakeApi {
    dispatcher: Dispatcher,
    pub up: AtomicBool,
    pub contacts: Mutex<Vec<Contact>>,
    pub status_by_prefix: Mutex<HashMap<String, StatusPayload>>,
    pub silent_prefixes: Mutex<HashSet<String>>,
    pub binary_reqs: Mutex<Vec<(String, u8)>>,
    pub logins: Mutex<Vec<String>>,
    pub path_resets: Mutex<Vec<String>>,
    pub message_queue: Mutex<VecDeque<Event>>,
    pub sent_msgs: Mutex<Vec<(String, String)>>,
    pub chan_msgs: Mutex<Vec<(u8, String)>>,
    pub added_contacts: Mutex<Vec<String>>,
    pub reboots: AtomicUsize,
    pub adverts: Mutex<Vec<bool>>,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            dispatcher: Dispatcher::new(),
            up: AtomicBool::new(true),
            contacts: Mutex::new(Vec::new()),
            status_by_prefix: Mutex::new(HashMap::new()),
            silent_prefixes: Mutex::new(HashSet::new()),
            binary_reqs: Mutex::new(Vec::new()),
            logins: Mutex::new(Vec::new()),
            path_resets: Mutex::new(Vec::new()),
            message_queue: Mutex::new(VecDeque::new()),
            sent_msgs: Mutex::new(Vec::new()),
            chan_msgs: Mutex::new(Vec::new()),
            added_contacts: Mutex::new(Vec::new()),
            reboots: AtomicUsize::new(0),
            adverts: Mutex::new(Vec::new()),
        })
    }

    pub fn with_contact(self: &Arc<Self>, c: Contact) -> Arc<Self> {
        self.contacts.lock().unwrap().push(c);
        self.clone()
    }

    /// Configure a healthy status reply for a node.
    pub fn answer_status(&self, pubkey_prefix: &str, uptime: u32) {
        self.status_by_prefix.lock().unwrap().insert(
            pubkey_prefix.to_string(),
            StatusPayload {
                pubkey_prefix: pubkey_prefix.to_string(),
                battery_mv: 4100,
                uptime,
                last_rssi: -80,
                ..Default::default()
            },
        );
    }

    pub fn go_silent(&self, pubkey_prefix: &str) {
        self.silent_prefixes
            .lock()
            .unwrap()
            .insert(pubkey_prefix.to_string());
        self.status_by_prefix.lock().unwrap().remove(pubkey_prefix);
    }

    pub fn request_count(&self, pubkey_prefix: &str) -> usize {
        self.binary_reqs
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == pubkey_prefix)
            .count()
    }
}

#[async_trait]
impl MeshApi for FakeApi {
    fn connected(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    async fn app_start(&self, _app_name: &str) -> Result<SelfInfo> {
        Ok(SelfInfo {
            public_key: "f".repeat(64),
            name: "fake-radio".into(),
        })
    }

    async fn device_query(&self) -> Result<DeviceInfo> {
        Ok(DeviceInfo {
            firmware_version: "v1.8.0".into(),
            model: "Fake T1000".into(),
            max_channels: 4,
        })
    }

    async fn get_battery(&self) -> Result<u16> {
        Ok(3900)
    }

    async fn get_self_telemetry(&self) -> Result<Vec<u8>> {
        Ok(vec![0x01, 0x67, 0x00, 0xd2])
    }

    async fn sync_contacts(&self, _since: u32) -> Result<Vec<Contact>> {
        Ok(self.contacts.lock().unwrap().clone())
    }

    async fn get_time(&self) -> Result<u64> {
        Ok(1_700_000_000)
    }

    async fn set_time(&self, _epoch: u32) -> Result<()> {
        Ok(())
    }

    async fn send_advert(&self, flood: bool) -> Result<()> {
        self.adverts.lock().unwrap().push(flood);
        Ok(())
    }

    async fn set_name(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn set_coords(&self, _lat: f64, _lon: f64) -> Result<()> {
        Ok(())
    }

    async fn set_tx_power(&self, _dbm: u8) -> Result<()> {
        Ok(())
    }

    async fn set_radio_params(&self, _f: u32, _b: u32, _sf: u8, _cr: u8) -> Result<()> {
        Ok(())
    }

    async fn set_channel(&self, _idx: u8, _name: &str, _secret: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn reboot(&self) -> Result<()> {
        self.reboots.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn add_update_contact(&self, c: &Contact) -> Result<()> {
        self.added_contacts.lock().unwrap().push(c.public_key.clone());
        Ok(())
    }

    async fn remove_contact(&self, _c: &Contact) -> Result<()> {
        Ok(())
    }

    async fn reset_path(&self, c: &Contact) -> Result<()> {
        self.path_resets
            .lock()
            .unwrap()
            .push(c.key_prefix().to_string());
        Ok(())
    }

    async fn send_login(&self, c: &Contact, _password: &str) -> Result<()> {
        let p = c.key_prefix().to_string();
        self.logins.lock().unwrap().push(p.clone());
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            dispatcher.dispatch(&Event::LoginSuccess { pubkey_prefix: p });
        });
        Ok(())
    }

    async fn send_logout(&self, _c: &Contact) -> Result<()> {
        Ok(())
    }

    async fn send_binary_req(&self, c: &Contact, req: BinaryReqType) -> Result<()> {
        if !self.connected() {
            bail!("link down");
        }
        let p = c.key_prefix().to_string();
        self.binary_reqs.lock().unwrap().push((p.clone(), req.as_u8()));
        if self.silent_prefixes.lock().unwrap().contains(&p) {
            return Ok(());
        }
        let status = self.status_by_prefix.lock().unwrap().get(&p).cloned();
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            match req {
                BinaryReqType::Telemetry => dispatcher.dispatch(&Event::TelemetryResponse(
                    TelemetryPayload {
                        pubkey_prefix: p,
                        lpp: vec![0x01, 0x67, 0x00, 0xaa],
                    },
                )),
                _ => {
                    if let Some(status) = status {
                        dispatcher.dispatch(&Event::StatusResponse(status));
                    }
                }
            }
        });
        Ok(())
    }

    async fn send_msg(&self, c: &Contact, text: &str) -> Result<()> {
        self.sent_msgs
            .lock()
            .unwrap()
            .push((c.key_prefix().to_string(), text.to_string()));
        Ok(())
    }

    async fn send_chan_msg(&self, channel_idx: u8, text: &str) -> Result<()> {
        self.chan_msgs
            .lock()
            .unwrap()
            .push((channel_idx, text.to_string()));
        Ok(())
    }

    async fn sync_next_message(&self) -> Result<Event> {
        Ok(self
            .message_queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Event::NoMoreMsgs))
    }

    async fn disconnect(&self) {
        self.up.store(false, Ordering::SeqCst);
        self.dispatcher.dispatch(&Event::Disconnected);
    }
}
