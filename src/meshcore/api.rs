//! Radio command surface.
//!
//! [`MeshApi`] is the async command interface the coordinator and the command
//! executor program against; [`MeshConnection`] is the live implementation
//! over the TCP transport. Tests substitute a scripted fake.
//!
//! Commands are serialized: the companion protocol pairs replies to commands
//! by arrival order, so a command holds the command lock from send until its
//! reply (or timeout). Push events are unaffected and flow through the
//! [`Dispatcher`] at any time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::dispatcher::{Dispatcher, EventFilter};
use super::protocol::{self, Decoded};
use super::transport::{self, FrameReader, FrameWriter};
use super::{BinaryReqType, Contact, DeviceInfo, Event, EventKind, SelfInfo};

/// How long to wait for the direct reply to a command frame.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Commands the coordinator issues to a companion radio.
#[async_trait]
pub trait MeshApi: Send + Sync {
    /// Whether the underlying link is currently up.
    fn connected(&self) -> bool;

    /// Event hub carrying pushes and decoded replies from this radio.
    fn dispatcher(&self) -> &Dispatcher;

    async fn app_start(&self, app_name: &str) -> Result<SelfInfo>;
    async fn device_query(&self) -> Result<DeviceInfo>;
    async fn get_battery(&self) -> Result<u16>;
    async fn get_self_telemetry(&self) -> Result<Vec<u8>>;
    /// Sync the radio's contact table; `since` of 0 fetches everything.
    async fn sync_contacts(&self, since: u32) -> Result<Vec<Contact>>;
    async fn get_time(&self) -> Result<u64>;
    async fn set_time(&self, epoch: u32) -> Result<()>;
    async fn send_advert(&self, flood: bool) -> Result<()>;
    async fn set_name(&self, name: &str) -> Result<()>;
    async fn set_coords(&self, lat: f64, lon: f64) -> Result<()>;
    async fn set_tx_power(&self, dbm: u8) -> Result<()>;
    async fn set_radio_params(&self, freq_khz: u32, bw_hz: u32, sf: u8, cr: u8) -> Result<()>;
    async fn set_channel(&self, channel_idx: u8, name: &str, secret: &[u8]) -> Result<()>;
    async fn reboot(&self) -> Result<()>;
    async fn add_update_contact(&self, contact: &Contact) -> Result<()>;
    async fn remove_contact(&self, contact: &Contact) -> Result<()>;
    async fn reset_path(&self, contact: &Contact) -> Result<()>;
    async fn send_login(&self, contact: &Contact, password: &str) -> Result<()>;
    async fn send_logout(&self, contact: &Contact) -> Result<()>;
    async fn send_binary_req(&self, contact: &Contact, req: BinaryReqType) -> Result<()>;
    async fn send_msg(&self, contact: &Contact, text: &str) -> Result<()>;
    async fn send_chan_msg(&self, channel_idx: u8, text: &str) -> Result<()>;
    /// Pull the next queued message. Resolves to `ChannelMsgRecv`,
    /// `ContactMsgRecv` or `NoMoreMsgs`.
    async fn sync_next_message(&self) -> Result<Event>;
    async fn disconnect(&self);
}

/// Live connection to a companion radio over TCP.
pub struct MeshConnection {
    writer: Mutex<FrameWriter>,
    dispatcher: Dispatcher,
    connected: Arc<AtomicBool>,
    cmd_lock: Mutex<()>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl MeshConnection {
    /// Connect and start the background reader. The returned connection is
    /// ready for commands; events begin flowing into the dispatcher at once.
    pub async fn open(host: &str, port: u16) -> Result<Arc<Self>> {
        let (reader, writer) = transport::connect(host, port).await?;
        let dispatcher = Dispatcher::new();
        let connected = Arc::new(AtomicBool::new(true));
        let conn = Arc::new(Self {
            writer: Mutex::new(writer),
            dispatcher: dispatcher.clone(),
            connected: connected.clone(),
            cmd_lock: Mutex::new(()),
            reader_task: Mutex::new(None),
        });
        let task = tokio::spawn(read_loop(reader, dispatcher, connected));
        *conn.reader_task.lock().await = Some(task);
        info!("connected to radio at {host}:{port}");
        Ok(conn)
    }

    /// Send a frame and wait for its direct reply of one of `kinds`.
    async fn command(&self, frame: Vec<u8>, kinds: &[EventKind]) -> Result<Event> {
        if !self.connected() {
            bail!("radio link is down");
        }
        let _serial = self.cmd_lock.lock().await;
        let mut stream = self.dispatcher.subscribe(None, EventFilter::any());
        self.writer.lock().await.send(&frame).await?;
        let deadline = tokio::time::Instant::now() + RESPONSE_TIMEOUT;
        loop {
            let event = tokio::time::timeout_at(deadline, stream.recv())
                .await
                .map_err(|_| anyhow!("no reply to command {:#04x}", frame[0]))?
                .ok_or_else(|| anyhow!("dispatcher closed"))?;
            if kinds.contains(&event.kind()) {
                return Ok(event);
            }
            if event.kind() == EventKind::Error {
                if let Event::Error { message } = &event {
                    bail!("radio error: {message}");
                }
            }
            // A push arriving between send and reply; other subscribers
            // already saw it, keep waiting for ours.
            debug!("skipping interleaved {:?} while awaiting reply", event.kind());
        }
    }

    async fn command_ok(&self, frame: Vec<u8>) -> Result<()> {
        self.command(frame, &[EventKind::Ok]).await.map(|_| ())
    }
}

#[async_trait]
impl MeshApi for MeshConnection {
    fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    async fn app_start(&self, app_name: &str) -> Result<SelfInfo> {
        match self
            .command(protocol::encode_app_start(app_name), &[EventKind::SelfInfo])
            .await?
        {
            Event::SelfInfo(info) => Ok(info),
            other => bail!("unexpected app start reply: {:?}", other.kind()),
        }
    }

    async fn device_query(&self) -> Result<DeviceInfo> {
        match self
            .command(protocol::encode_device_query(), &[EventKind::DeviceInfo])
            .await?
        {
            Event::DeviceInfo(info) => Ok(info),
            other => bail!("unexpected device query reply: {:?}", other.kind()),
        }
    }

    async fn get_battery(&self) -> Result<u16> {
        match self
            .command(protocol::encode_get_battery(), &[EventKind::BatteryVoltage])
            .await?
        {
            Event::BatteryVoltage { millivolts } => Ok(millivolts),
            other => bail!("unexpected battery reply: {:?}", other.kind()),
        }
    }

    async fn get_self_telemetry(&self) -> Result<Vec<u8>> {
        match self
            .command(
                protocol::encode_get_self_telemetry(),
                &[EventKind::TelemetryResponse],
            )
            .await?
        {
            Event::TelemetryResponse(t) => Ok(t.lpp),
            other => bail!("unexpected telemetry reply: {:?}", other.kind()),
        }
    }

    async fn sync_contacts(&self, since: u32) -> Result<Vec<Contact>> {
        match self
            .command(protocol::encode_get_contacts(since), &[EventKind::Contacts])
            .await?
        {
            Event::Contacts(contacts) => Ok(contacts),
            other => bail!("unexpected contact sync reply: {:?}", other.kind()),
        }
    }

    async fn get_time(&self) -> Result<u64> {
        match self
            .command(protocol::encode_get_device_time(), &[EventKind::CurrentTime])
            .await?
        {
            Event::CurrentTime { epoch } => Ok(epoch),
            other => bail!("unexpected device time reply: {:?}", other.kind()),
        }
    }

    async fn set_time(&self, epoch: u32) -> Result<()> {
        self.command_ok(protocol::encode_set_device_time(epoch)).await
    }

    async fn send_advert(&self, flood: bool) -> Result<()> {
        self.command_ok(protocol::encode_send_self_advert(flood)).await
    }

    async fn set_name(&self, name: &str) -> Result<()> {
        self.command_ok(protocol::encode_set_advert_name(name)).await
    }

    async fn set_coords(&self, lat: f64, lon: f64) -> Result<()> {
        self.command_ok(protocol::encode_set_advert_latlon(lat, lon)).await
    }

    async fn set_tx_power(&self, dbm: u8) -> Result<()> {
        self.command_ok(protocol::encode_set_tx_power(dbm)).await
    }

    async fn set_radio_params(&self, freq_khz: u32, bw_hz: u32, sf: u8, cr: u8) -> Result<()> {
        self.command_ok(protocol::encode_set_radio_params(freq_khz, bw_hz, sf, cr))
            .await
    }

    async fn set_channel(&self, channel_idx: u8, name: &str, secret: &[u8]) -> Result<()> {
        self.command_ok(protocol::encode_set_channel(channel_idx, name, secret))
            .await
    }

    async fn reboot(&self) -> Result<()> {
        // The radio drops the link on reboot without acking.
        if !self.connected() {
            bail!("radio link is down");
        }
        let _serial = self.cmd_lock.lock().await;
        self.writer.lock().await.send(&protocol::encode_reboot()).await
    }

    async fn add_update_contact(&self, contact: &Contact) -> Result<()> {
        self.command_ok(protocol::encode_add_update_contact(contact)?).await
    }

    async fn remove_contact(&self, contact: &Contact) -> Result<()> {
        self.command_ok(protocol::encode_remove_contact(contact)?).await
    }

    async fn reset_path(&self, contact: &Contact) -> Result<()> {
        self.command_ok(protocol::encode_reset_path(contact)?).await
    }

    async fn send_login(&self, contact: &Contact, password: &str) -> Result<()> {
        self.command_ok(protocol::encode_send_login(contact, password)?)
            .await
    }

    async fn send_logout(&self, contact: &Contact) -> Result<()> {
        self.command_ok(protocol::encode_send_logout(contact)?).await
    }

    async fn send_binary_req(&self, contact: &Contact, req: BinaryReqType) -> Result<()> {
        self.command_ok(protocol::encode_send_binary_req(contact, req.as_u8())?)
            .await
    }

    async fn send_msg(&self, contact: &Contact, text: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp() as u32;
        self.command_ok(protocol::encode_send_txt_msg(contact, text, now)?)
            .await
    }

    async fn send_chan_msg(&self, channel_idx: u8, text: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp() as u32;
        self.command_ok(protocol::encode_send_chan_msg(channel_idx, text, now))
            .await
    }

    async fn sync_next_message(&self) -> Result<Event> {
        self.command(
            protocol::encode_sync_next_message(),
            &[
                EventKind::ChannelMsgRecv,
                EventKind::ContactMsgRecv,
                EventKind::NoMoreMsgs,
            ],
        )
        .await
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
        self.dispatcher.dispatch(&Event::Disconnected);
        info!("radio link closed");
    }
}

/// Background read loop: decode frames, accumulate contact sync sequences,
/// publish everything else straight to the dispatcher.
async fn read_loop(mut reader: FrameReader, dispatcher: Dispatcher, connected: Arc<AtomicBool>) {
    let mut pending_contacts: Option<Vec<Contact>> = None;
    loop {
        let frame = match reader.recv().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("radio closed the connection");
                break;
            }
            Err(e) => {
                warn!("radio read failed: {e:#}");
                break;
            }
        };
        if frame.is_empty() {
            continue;
        }
        match protocol::decode_frame(&frame) {
            Ok(Decoded::ContactsStart) => pending_contacts = Some(Vec::new()),
            Ok(Decoded::ContactItem(contact)) => match pending_contacts.as_mut() {
                Some(list) => list.push(contact),
                None => warn!("contact record outside a sync sequence, dropped"),
            },
            Ok(Decoded::ContactsEnd) => {
                let contacts = pending_contacts.take().unwrap_or_default();
                debug!("contact sync complete: {} records", contacts.len());
                dispatcher.dispatch(&Event::Contacts(contacts));
            }
            Ok(Decoded::Event(event)) => {
                debug!("rx event: {:?}", event.kind());
                dispatcher.dispatch(&event);
            }
            Err(e) => {
                debug!("undecodable frame ({} bytes): {e}", frame.len());
            }
        }
    }
    connected.store(false, Ordering::Release);
    dispatcher.dispatch(&Event::Disconnected);
}
