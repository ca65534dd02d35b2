//! # MeshCore Companion Radio Module
//!
//! Types and plumbing for talking to a MeshCore companion radio: the contact
//! and event model shared across the crate, a typed event dispatcher, the
//! binary frame codec for the subset of the companion protocol the
//! coordinator uses, and the TCP transport plus live command API.
//!
//! The coordinator never touches frames directly; it sees the [`api::MeshApi`]
//! command surface and typed [`Event`]s delivered through the
//! [`dispatcher::Dispatcher`].

pub mod api;
pub mod dispatcher;
pub mod protocol;
pub mod transport;

use serde::{Deserialize, Serialize};

/// Length of a short stable node identifier: the first 12 hex characters of
/// the 64-hex-character public key.
pub const PUBKEY_PREFIX_LEN: usize = 12;

/// MeshCore node types as advertised on the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Client,
    Repeater,
    RoomServer,
    Sensor,
}

impl NodeType {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(NodeType::Client),
            2 => Some(NodeType::Repeater),
            3 => Some(NodeType::RoomServer),
            4 => Some(NodeType::Sensor),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            NodeType::Client => 1,
            NodeType::Repeater => 2,
            NodeType::RoomServer => 3,
            NodeType::Sensor => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::Client => "Client",
            NodeType::Repeater => "Repeater",
            NodeType::RoomServer => "Room Server",
            NodeType::Sensor => "Sensor",
        }
    }
}

/// A mesh peer record.
///
/// Contacts exist in two provenances: *added* (synced from the radio's own
/// contact table) and *discovered* (observed via advertisement broadcast
/// only). The registry merges the two by `public_key`; `added_to_node` and
/// `pubkey_prefix` are stamped onto the merged view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    /// 64 hex characters; the stable identity of the node.
    pub public_key: String,
    pub adv_name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// Unix seconds of the most recent advertisement heard for this node.
    pub last_advert: u64,
    /// Established outbound routing path (hop hashes), empty when unrouted.
    #[serde(default)]
    pub out_path: Vec<u8>,
    /// Length of `out_path` in hops; -1 means no established path.
    pub out_path_len: i32,
    /// Advertised position, degrees. Zero when the node does not share one.
    #[serde(default)]
    pub adv_lat: f64,
    #[serde(default)]
    pub adv_lon: f64,
    /// Unix seconds of the last modification to this record.
    pub lastmod: u64,
    /// Stamped by the registry merge: first 12 hex chars of `public_key`.
    #[serde(default)]
    pub pubkey_prefix: String,
    /// Stamped by the registry merge: present in the radio's contact table.
    #[serde(default)]
    pub added_to_node: bool,
}

impl Contact {
    /// Short stable identifier derived from the public key.
    pub fn key_prefix(&self) -> &str {
        let end = self.public_key.len().min(PUBKEY_PREFIX_LEN);
        &self.public_key[..end]
    }

    /// Whether the radio currently has an established outbound path.
    pub fn has_path(&self) -> bool {
        self.out_path_len >= 0
    }
}

/// Binary request payload types for `send_binary_req`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryReqType {
    Status,
    KeepAlive,
    Telemetry,
}

impl BinaryReqType {
    pub fn as_u8(self) -> u8 {
        match self {
            BinaryReqType::Status => 0x01,
            BinaryReqType::KeepAlive => 0x02,
            BinaryReqType::Telemetry => 0x03,
        }
    }
}

/// Decoded status response from a repeater or client.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusPayload {
    pub pubkey_prefix: String,
    pub battery_mv: u16,
    pub tx_queue_len: u16,
    pub noise_floor: i16,
    pub last_rssi: i16,
    pub packets_received: u32,
    pub packets_sent: u32,
    /// Seconds since the node booted. A zero uptime marks a malformed
    /// response and is classified as a failure by the scheduler.
    pub uptime: u32,
    pub airtime_seconds: u32,
}

/// Telemetry response carrying a raw Cayenne LPP payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryPayload {
    pub pubkey_prefix: String,
    pub lpp: Vec<u8>,
}

/// Device identity reported by the radio on `device_query`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    pub firmware_version: String,
    pub model: String,
    pub max_channels: u8,
}

/// Identity of the local radio, reported on app start.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelfInfo {
    pub public_key: String,
    pub name: String,
}

/// A decoded application-level channel (group) message.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    pub channel_idx: u8,
    pub timestamp: u32,
    pub text: String,
}

/// A decoded direct message from a contact.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectMessage {
    pub pubkey_prefix: String,
    pub timestamp: u32,
    pub text: String,
}

/// A raw radio-layer packet observation (RX log), before any decryption.
#[derive(Debug, Clone, PartialEq)]
pub struct RxLogData {
    /// Signal-to-noise ratio in dB.
    pub snr: f32,
    pub rssi: f32,
    /// The raw over-the-air packet bytes (header, path, payload).
    pub raw: Vec<u8>,
}

/// Fieldless discriminant of [`Event`], used to key subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Ok,
    Error,
    SelfInfo,
    Contacts,
    Advertisement,
    ContactsDirty,
    StatusResponse,
    TelemetryResponse,
    LoginSuccess,
    LoginFailed,
    DeviceInfo,
    BatteryVoltage,
    CurrentTime,
    ChannelMsgRecv,
    ContactMsgRecv,
    NoMoreMsgs,
    MsgWaiting,
    PathUpdated,
    RxLog,
    SendConfirmed,
    Disconnected,
}

/// A typed event from the radio.
///
/// This is a closed sum: new protocol pushes become new variants, and
/// subscribers register by [`EventKind`] rather than by string name.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Ok,
    Error { message: String },
    SelfInfo(SelfInfo),
    /// Full contact-table sync result.
    Contacts(Vec<Contact>),
    /// A broadcast advertisement carrying the advertiser's contact record.
    Advertisement(Contact),
    /// The radio flagged its internal contact table as changed.
    ContactsDirty,
    StatusResponse(StatusPayload),
    TelemetryResponse(TelemetryPayload),
    LoginSuccess { pubkey_prefix: String },
    LoginFailed { pubkey_prefix: String },
    DeviceInfo(DeviceInfo),
    BatteryVoltage { millivolts: u16 },
    CurrentTime { epoch: u64 },
    ChannelMsgRecv(ChannelMessage),
    ContactMsgRecv(DirectMessage),
    NoMoreMsgs,
    MsgWaiting,
    PathUpdated { pubkey_prefix: String },
    RxLog(RxLogData),
    SendConfirmed,
    Disconnected,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Ok => EventKind::Ok,
            Event::Error { .. } => EventKind::Error,
            Event::SelfInfo(_) => EventKind::SelfInfo,
            Event::Contacts(_) => EventKind::Contacts,
            Event::Advertisement(_) => EventKind::Advertisement,
            Event::ContactsDirty => EventKind::ContactsDirty,
            Event::StatusResponse(_) => EventKind::StatusResponse,
            Event::TelemetryResponse(_) => EventKind::TelemetryResponse,
            Event::LoginSuccess { .. } => EventKind::LoginSuccess,
            Event::LoginFailed { .. } => EventKind::LoginFailed,
            Event::DeviceInfo(_) => EventKind::DeviceInfo,
            Event::BatteryVoltage { .. } => EventKind::BatteryVoltage,
            Event::CurrentTime { .. } => EventKind::CurrentTime,
            Event::ChannelMsgRecv(_) => EventKind::ChannelMsgRecv,
            Event::ContactMsgRecv(_) => EventKind::ContactMsgRecv,
            Event::NoMoreMsgs => EventKind::NoMoreMsgs,
            Event::MsgWaiting => EventKind::MsgWaiting,
            Event::PathUpdated { .. } => EventKind::PathUpdated,
            Event::RxLog(_) => EventKind::RxLog,
            Event::SendConfirmed => EventKind::SendConfirmed,
            Event::Disconnected => EventKind::Disconnected,
        }
    }

    /// The pubkey prefix this event pertains to, when it has one. Used by
    /// attribute-filtered subscriptions (e.g. "status responses from node X").
    pub fn pubkey_prefix(&self) -> Option<&str> {
        match self {
            Event::StatusResponse(p) => Some(&p.pubkey_prefix),
            Event::TelemetryResponse(p) => Some(&p.pubkey_prefix),
            Event::LoginSuccess { pubkey_prefix } => Some(pubkey_prefix),
            Event::LoginFailed { pubkey_prefix } => Some(pubkey_prefix),
            Event::PathUpdated { pubkey_prefix } => Some(pubkey_prefix),
            Event::ContactMsgRecv(m) => Some(&m.pubkey_prefix),
            Event::Advertisement(c) => Some(c.key_prefix()),
            _ => None,
        }
    }

    /// The channel index this event pertains to, when it has one.
    pub fn channel_idx(&self) -> Option<u8> {
        match self {
            Event::ChannelMsgRecv(m) => Some(m.channel_idx),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_prefix_is_first_twelve_hex_chars() {
        let c = Contact {
            public_key: "aabbccddeeff00112233445566778899aabbccddeeff00112233445566778899"
                .into(),
            adv_name: "Test".into(),
            node_type: NodeType::Repeater,
            last_advert: 0,
            out_path: vec![],
            out_path_len: -1,
            adv_lat: 0.0,
            adv_lon: 0.0,
            lastmod: 0,
            pubkey_prefix: String::new(),
            added_to_node: false,
        };
        assert_eq!(c.key_prefix(), "aabbccddeeff");
        assert!(!c.has_path());
    }

    #[test]
    fn event_kind_matches_variant() {
        let ev = Event::BatteryVoltage { millivolts: 4100 };
        assert_eq!(ev.kind(), EventKind::BatteryVoltage);
        assert_eq!(ev.pubkey_prefix(), None);
    }
}
