//! Companion-radio frame codec.
//!
//! Encodes the command frames the coordinator issues and decodes the
//! response/push frames it consumes. Each frame is one command or event:
//! a single code byte followed by a code-specific binary payload, integers
//! little-endian. Only the subset of the companion protocol that meshmon
//! uses is implemented; unknown codes decode to [`ProtocolError::UnknownCode`]
//! and are skipped by the reader with a debug log.

use thiserror::Error;

use super::{
    ChannelMessage, Contact, DeviceInfo, DirectMessage, Event, NodeType, RxLogData, SelfInfo,
    StatusPayload, TelemetryPayload,
};

// Host -> radio command codes.
pub const CMD_APP_START: u8 = 1;
pub const CMD_SEND_TXT_MSG: u8 = 2;
pub const CMD_SEND_CHANNEL_TXT_MSG: u8 = 3;
pub const CMD_GET_CONTACTS: u8 = 4;
pub const CMD_GET_DEVICE_TIME: u8 = 5;
pub const CMD_SET_DEVICE_TIME: u8 = 6;
pub const CMD_SEND_SELF_ADVERT: u8 = 7;
pub const CMD_SET_ADVERT_NAME: u8 = 8;
pub const CMD_ADD_UPDATE_CONTACT: u8 = 9;
pub const CMD_SYNC_NEXT_MESSAGE: u8 = 10;
pub const CMD_SET_RADIO_PARAMS: u8 = 11;
pub const CMD_SET_RADIO_TX_POWER: u8 = 12;
pub const CMD_RESET_PATH: u8 = 13;
pub const CMD_SET_ADVERT_LATLON: u8 = 14;
pub const CMD_REMOVE_CONTACT: u8 = 15;
pub const CMD_REBOOT: u8 = 19;
pub const CMD_GET_BATTERY_VOLTAGE: u8 = 20;
pub const CMD_DEVICE_QUERY: u8 = 22;
pub const CMD_SEND_LOGIN: u8 = 24;
pub const CMD_SEND_LOGOUT: u8 = 25;
pub const CMD_GET_CHANNEL: u8 = 26;
pub const CMD_SET_CHANNEL: u8 = 27;
pub const CMD_GET_SELF_TELEMETRY: u8 = 30;
pub const CMD_SEND_BINARY_REQ: u8 = 31;

// Radio -> host response codes (direct replies).
pub const RESP_CODE_OK: u8 = 0;
pub const RESP_CODE_ERR: u8 = 1;
pub const RESP_CODE_CONTACTS_START: u8 = 2;
pub const RESP_CODE_CONTACT: u8 = 3;
pub const RESP_CODE_END_OF_CONTACTS: u8 = 4;
pub const RESP_CODE_SELF_INFO: u8 = 5;
pub const RESP_CODE_SENT: u8 = 6;
pub const RESP_CODE_CONTACT_MSG_RECV: u8 = 7;
pub const RESP_CODE_CHANNEL_MSG_RECV: u8 = 8;
pub const RESP_CODE_CURR_TIME: u8 = 9;
pub const RESP_CODE_NO_MORE_MESSAGES: u8 = 10;
pub const RESP_CODE_BATTERY_VOLTAGE: u8 = 11;
pub const RESP_CODE_DEVICE_INFO: u8 = 12;
pub const RESP_CODE_SELF_TELEMETRY: u8 = 14;

// Radio -> host push codes (asynchronous, bit 7 set).
pub const PUSH_CODE_ADVERT: u8 = 0x80;
pub const PUSH_CODE_PATH_UPDATED: u8 = 0x81;
pub const PUSH_CODE_SEND_CONFIRMED: u8 = 0x82;
pub const PUSH_CODE_MSG_WAITING: u8 = 0x83;
pub const PUSH_CODE_LOGIN_SUCCESS: u8 = 0x84;
pub const PUSH_CODE_LOGIN_FAIL: u8 = 0x85;
pub const PUSH_CODE_STATUS_RESPONSE: u8 = 0x86;
pub const PUSH_CODE_LOG_RX_DATA: u8 = 0x87;
pub const PUSH_CODE_TELEMETRY_RESPONSE: u8 = 0x88;
pub const PUSH_CODE_CONTACTS_DIRTY: u8 = 0x89;

/// On-wire contact record length: pubkey(32) type(1) flags(1) out_path_len(1)
/// out_path(64) adv_name(32) last_advert(4) adv_lat(4) adv_lon(4) lastmod(4).
pub const CONTACT_BLOB_LEN: usize = 147;

const MAX_PATH_LEN: usize = 64;
const ADV_NAME_LEN: usize = 32;

#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("frame truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("unknown frame code {0:#04x}")]
    UnknownCode(u8),
    #[error("invalid utf-8 in text field")]
    BadUtf8,
    #[error("invalid node type {0}")]
    BadNodeType(u8),
    #[error("invalid hex string")]
    BadHex,
}

/// Result of decoding one inbound frame. Contact-table syncs arrive as a
/// start/item/end sequence that the reader accumulates before publishing a
/// single [`Event::Contacts`].
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Event(Event),
    ContactsStart,
    ContactItem(Contact),
    ContactsEnd,
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

pub fn encode_app_start(app_name: &str) -> Vec<u8> {
    let mut frame = vec![CMD_APP_START, 1];
    frame.extend_from_slice(app_name.as_bytes());
    frame
}

pub fn encode_device_query() -> Vec<u8> {
    vec![CMD_DEVICE_QUERY, 1]
}

pub fn encode_get_battery() -> Vec<u8> {
    vec![CMD_GET_BATTERY_VOLTAGE]
}

pub fn encode_get_device_time() -> Vec<u8> {
    vec![CMD_GET_DEVICE_TIME]
}

pub fn encode_set_device_time(epoch: u32) -> Vec<u8> {
    let mut frame = vec![CMD_SET_DEVICE_TIME];
    frame.extend_from_slice(&epoch.to_le_bytes());
    frame
}

/// `since`: only contacts with `lastmod` >= this value are returned (0 = all).
pub fn encode_get_contacts(since: u32) -> Vec<u8> {
    let mut frame = vec![CMD_GET_CONTACTS];
    frame.extend_from_slice(&since.to_le_bytes());
    frame
}

pub fn encode_sync_next_message() -> Vec<u8> {
    vec![CMD_SYNC_NEXT_MESSAGE]
}

pub fn encode_send_self_advert(flood: bool) -> Vec<u8> {
    vec![CMD_SEND_SELF_ADVERT, u8::from(flood)]
}

pub fn encode_set_advert_name(name: &str) -> Vec<u8> {
    let mut frame = vec![CMD_SET_ADVERT_NAME];
    frame.extend_from_slice(name.as_bytes());
    frame
}

pub fn encode_set_advert_latlon(lat: f64, lon: f64) -> Vec<u8> {
    let mut frame = vec![CMD_SET_ADVERT_LATLON];
    frame.extend_from_slice(&((lat * 1e6) as i32).to_le_bytes());
    frame.extend_from_slice(&((lon * 1e6) as i32).to_le_bytes());
    frame
}

pub fn encode_set_tx_power(dbm: u8) -> Vec<u8> {
    vec![CMD_SET_RADIO_TX_POWER, dbm]
}

pub fn encode_set_radio_params(freq_khz: u32, bw_hz: u32, sf: u8, cr: u8) -> Vec<u8> {
    let mut frame = vec![CMD_SET_RADIO_PARAMS];
    frame.extend_from_slice(&freq_khz.to_le_bytes());
    frame.extend_from_slice(&bw_hz.to_le_bytes());
    frame.push(sf);
    frame.push(cr);
    frame
}

pub fn encode_reboot() -> Vec<u8> {
    let mut frame = vec![CMD_REBOOT];
    frame.extend_from_slice(b"reboot");
    frame
}

fn push_pubkey(frame: &mut Vec<u8>, public_key_hex: &str) -> Result<(), ProtocolError> {
    let key = hex_decode(public_key_hex)?;
    frame.extend_from_slice(&key);
    Ok(())
}

pub fn encode_reset_path(contact: &Contact) -> Result<Vec<u8>, ProtocolError> {
    let mut frame = vec![CMD_RESET_PATH];
    push_pubkey(&mut frame, &contact.public_key)?;
    Ok(frame)
}

pub fn encode_remove_contact(contact: &Contact) -> Result<Vec<u8>, ProtocolError> {
    let mut frame = vec![CMD_REMOVE_CONTACT];
    push_pubkey(&mut frame, &contact.public_key)?;
    Ok(frame)
}

pub fn encode_add_update_contact(contact: &Contact) -> Result<Vec<u8>, ProtocolError> {
    let mut frame = vec![CMD_ADD_UPDATE_CONTACT];
    frame.extend_from_slice(&encode_contact_blob(contact)?);
    Ok(frame)
}

pub fn encode_send_login(contact: &Contact, password: &str) -> Result<Vec<u8>, ProtocolError> {
    let mut frame = vec![CMD_SEND_LOGIN];
    push_pubkey(&mut frame, &contact.public_key)?;
    frame.extend_from_slice(password.as_bytes());
    Ok(frame)
}

pub fn encode_send_logout(contact: &Contact) -> Result<Vec<u8>, ProtocolError> {
    let mut frame = vec![CMD_SEND_LOGOUT];
    push_pubkey(&mut frame, &contact.public_key)?;
    Ok(frame)
}

pub fn encode_send_binary_req(contact: &Contact, req_type: u8) -> Result<Vec<u8>, ProtocolError> {
    let mut frame = vec![CMD_SEND_BINARY_REQ];
    push_pubkey(&mut frame, &contact.public_key)?;
    frame.push(req_type);
    Ok(frame)
}

pub fn encode_get_self_telemetry() -> Vec<u8> {
    vec![CMD_GET_SELF_TELEMETRY]
}

pub fn encode_send_txt_msg(
    contact: &Contact,
    text: &str,
    timestamp: u32,
) -> Result<Vec<u8>, ProtocolError> {
    let mut frame = vec![CMD_SEND_TXT_MSG, 0, 0];
    frame.extend_from_slice(&timestamp.to_le_bytes());
    let key = hex_decode(&contact.public_key)?;
    frame.extend_from_slice(&key[..6.min(key.len())]);
    frame.extend_from_slice(text.as_bytes());
    Ok(frame)
}

pub fn encode_send_chan_msg(channel_idx: u8, text: &str, timestamp: u32) -> Vec<u8> {
    let mut frame = vec![CMD_SEND_CHANNEL_TXT_MSG, 0, channel_idx];
    frame.extend_from_slice(&timestamp.to_le_bytes());
    frame.extend_from_slice(text.as_bytes());
    frame
}

pub fn encode_get_channel(channel_idx: u8) -> Vec<u8> {
    vec![CMD_GET_CHANNEL, channel_idx]
}

pub fn encode_set_channel(channel_idx: u8, name: &str, secret: &[u8]) -> Vec<u8> {
    let mut frame = vec![CMD_SET_CHANNEL, channel_idx];
    let mut name_field = [0u8; ADV_NAME_LEN];
    let name_bytes = name.as_bytes();
    let n = name_bytes.len().min(ADV_NAME_LEN);
    name_field[..n].copy_from_slice(&name_bytes[..n]);
    frame.extend_from_slice(&name_field);
    frame.extend_from_slice(secret);
    frame
}

fn encode_contact_blob(contact: &Contact) -> Result<Vec<u8>, ProtocolError> {
    let mut blob = Vec::with_capacity(CONTACT_BLOB_LEN);
    blob.extend_from_slice(&hex_decode(&contact.public_key)?);
    blob.push(contact.node_type.as_u8());
    blob.push(0); // flags
    blob.push(contact.out_path_len.clamp(-1, MAX_PATH_LEN as i32) as i8 as u8);
    let mut path = [0u8; MAX_PATH_LEN];
    let n = contact.out_path.len().min(MAX_PATH_LEN);
    path[..n].copy_from_slice(&contact.out_path[..n]);
    blob.extend_from_slice(&path);
    let mut name = [0u8; ADV_NAME_LEN];
    let name_bytes = contact.adv_name.as_bytes();
    let n = name_bytes.len().min(ADV_NAME_LEN);
    name[..n].copy_from_slice(&name_bytes[..n]);
    blob.extend_from_slice(&name);
    blob.extend_from_slice(&(contact.last_advert as u32).to_le_bytes());
    blob.extend_from_slice(&((contact.adv_lat * 1e6) as i32).to_le_bytes());
    blob.extend_from_slice(&((contact.adv_lon * 1e6) as i32).to_le_bytes());
    blob.extend_from_slice(&(contact.lastmod as u32).to_le_bytes());
    Ok(blob)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.buf.len() - self.pos < n {
            return Err(ProtocolError::Truncated {
                need: self.pos + n,
                have: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn i16(&mut self) -> Result<i16, ProtocolError> {
        let b = self.take(2)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32, ProtocolError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }

    fn rest_utf8(&mut self) -> Result<String, ProtocolError> {
        let raw = self.rest();
        let trimmed = raw.strip_suffix(&[0u8]).unwrap_or(raw);
        String::from_utf8(trimmed.to_vec()).map_err(|_| ProtocolError::BadUtf8)
    }
}

/// Decode one inbound frame.
pub fn decode_frame(frame: &[u8]) -> Result<Decoded, ProtocolError> {
    let mut r = Reader::new(frame);
    let code = r.u8()?;
    let decoded = match code {
        RESP_CODE_OK | RESP_CODE_SENT => Decoded::Event(Event::Ok),
        RESP_CODE_ERR => Decoded::Event(Event::Error {
            message: r.rest_utf8().unwrap_or_else(|_| "error".to_string()),
        }),
        RESP_CODE_CONTACTS_START => Decoded::ContactsStart,
        RESP_CODE_CONTACT => Decoded::ContactItem(decode_contact_blob(&mut r)?),
        RESP_CODE_END_OF_CONTACTS => Decoded::ContactsEnd,
        RESP_CODE_SELF_INFO => {
            let key = r.take(32)?;
            let name = r.rest_utf8()?;
            Decoded::Event(Event::SelfInfo(SelfInfo {
                public_key: hex_encode(key),
                name,
            }))
        }
        RESP_CODE_CONTACT_MSG_RECV => {
            let prefix = r.take(6)?;
            let _path_len = r.u8()?;
            let _txt_type = r.u8()?;
            let timestamp = r.u32()?;
            let text = r.rest_utf8()?;
            Decoded::Event(Event::ContactMsgRecv(DirectMessage {
                pubkey_prefix: hex_encode(prefix),
                timestamp,
                text,
            }))
        }
        RESP_CODE_CHANNEL_MSG_RECV => {
            let channel_idx = r.u8()?;
            let _path_len = r.u8()?;
            let _txt_type = r.u8()?;
            let timestamp = r.u32()?;
            let text = r.rest_utf8()?;
            Decoded::Event(Event::ChannelMsgRecv(ChannelMessage {
                channel_idx,
                timestamp,
                text,
            }))
        }
        RESP_CODE_CURR_TIME => Decoded::Event(Event::CurrentTime {
            epoch: u64::from(r.u32()?),
        }),
        RESP_CODE_NO_MORE_MESSAGES => Decoded::Event(Event::NoMoreMsgs),
        RESP_CODE_BATTERY_VOLTAGE => Decoded::Event(Event::BatteryVoltage {
            millivolts: r.u16()?,
        }),
        RESP_CODE_DEVICE_INFO => {
            let max_channels = r.u8()?;
            let model_raw = r.take(ADV_NAME_LEN)?;
            let model = field_str(model_raw)?;
            let firmware_version = r.rest_utf8()?;
            Decoded::Event(Event::DeviceInfo(DeviceInfo {
                firmware_version,
                model,
                max_channels,
            }))
        }
        RESP_CODE_SELF_TELEMETRY => Decoded::Event(Event::TelemetryResponse(TelemetryPayload {
            pubkey_prefix: String::new(),
            lpp: r.rest().to_vec(),
        })),
        PUSH_CODE_ADVERT => Decoded::Event(Event::Advertisement(decode_contact_blob(&mut r)?)),
        PUSH_CODE_PATH_UPDATED => {
            let prefix = r.take(6)?;
            Decoded::Event(Event::PathUpdated {
                pubkey_prefix: hex_encode(prefix),
            })
        }
        PUSH_CODE_SEND_CONFIRMED => Decoded::Event(Event::SendConfirmed),
        PUSH_CODE_MSG_WAITING => Decoded::Event(Event::MsgWaiting),
        PUSH_CODE_LOGIN_SUCCESS => {
            let prefix = r.take(6)?;
            Decoded::Event(Event::LoginSuccess {
                pubkey_prefix: hex_encode(prefix),
            })
        }
        PUSH_CODE_LOGIN_FAIL => {
            let prefix = r.take(6)?;
            Decoded::Event(Event::LoginFailed {
                pubkey_prefix: hex_encode(prefix),
            })
        }
        PUSH_CODE_STATUS_RESPONSE => {
            let prefix = r.take(6)?;
            Decoded::Event(Event::StatusResponse(StatusPayload {
                pubkey_prefix: hex_encode(prefix),
                battery_mv: r.u16()?,
                tx_queue_len: r.u16()?,
                noise_floor: r.i16()?,
                last_rssi: r.i16()?,
                packets_received: r.u32()?,
                packets_sent: r.u32()?,
                airtime_seconds: r.u32()?,
                uptime: r.u32()?,
            }))
        }
        PUSH_CODE_LOG_RX_DATA => {
            // SNR arrives in quarter-dB units, RSSI in whole dBm.
            let snr_raw = r.u8()? as i8;
            let rssi_raw = r.u8()? as i8;
            Decoded::Event(Event::RxLog(RxLogData {
                snr: f32::from(snr_raw) / 4.0,
                rssi: f32::from(rssi_raw),
                raw: r.rest().to_vec(),
            }))
        }
        PUSH_CODE_TELEMETRY_RESPONSE => {
            let prefix = r.take(6)?;
            Decoded::Event(Event::TelemetryResponse(TelemetryPayload {
                pubkey_prefix: hex_encode(prefix),
                lpp: r.rest().to_vec(),
            }))
        }
        PUSH_CODE_CONTACTS_DIRTY => Decoded::Event(Event::ContactsDirty),
        other => return Err(ProtocolError::UnknownCode(other)),
    };
    Ok(decoded)
}

fn field_str(raw: &[u8]) -> Result<String, ProtocolError> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8(raw[..end].to_vec()).map_err(|_| ProtocolError::BadUtf8)
}

fn decode_contact_blob(r: &mut Reader<'_>) -> Result<Contact, ProtocolError> {
    let public_key = hex_encode(r.take(32)?);
    let type_raw = r.u8()?;
    let node_type = NodeType::from_u8(type_raw).ok_or(ProtocolError::BadNodeType(type_raw))?;
    let _flags = r.u8()?;
    let out_path_len = i32::from(r.u8()? as i8);
    let path_raw = r.take(MAX_PATH_LEN)?;
    let out_path = if out_path_len > 0 {
        path_raw[..(out_path_len as usize).min(MAX_PATH_LEN)].to_vec()
    } else {
        Vec::new()
    };
    let adv_name = field_str(r.take(ADV_NAME_LEN)?)?;
    let last_advert = u64::from(r.u32()?);
    let adv_lat = f64::from(r.i32()?) / 1e6;
    let adv_lon = f64::from(r.i32()?) / 1e6;
    let lastmod = u64::from(r.u32()?);
    Ok(Contact {
        public_key,
        adv_name,
        node_type,
        last_advert,
        out_path,
        out_path_len,
        adv_lat,
        adv_lon,
        lastmod,
        pubkey_prefix: String::new(),
        added_to_node: false,
    })
}

// ---------------------------------------------------------------------------
// Hex helpers (shared with command parsing and config validation)
// ---------------------------------------------------------------------------

pub fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

pub fn hex_decode(s: &str) -> Result<Vec<u8>, ProtocolError> {
    // Byte-pair offsets, so reject non-ASCII input up front instead of
    // slicing into the middle of a multibyte character.
    if s.len() % 2 != 0 || !s.is_ascii() {
        return Err(ProtocolError::BadHex);
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| ProtocolError::BadHex))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_contact() -> Contact {
        Contact {
            public_key: "ab".repeat(32),
            adv_name: "Hilltop Repeater".into(),
            node_type: NodeType::Repeater,
            last_advert: 1_700_000_000,
            out_path: vec![0x11, 0x22],
            out_path_len: 2,
            adv_lat: 37.7749,
            adv_lon: -122.4194,
            lastmod: 1_700_000_100,
            pubkey_prefix: String::new(),
            added_to_node: false,
        }
    }

    #[test]
    fn contact_blob_roundtrip() {
        let contact = sample_contact();
        let mut frame = vec![RESP_CODE_CONTACT];
        frame.extend_from_slice(&encode_contact_blob(&contact).unwrap());
        match decode_frame(&frame).unwrap() {
            Decoded::ContactItem(got) => {
                assert_eq!(got.public_key, contact.public_key);
                assert_eq!(got.adv_name, contact.adv_name);
                assert_eq!(got.node_type, NodeType::Repeater);
                assert_eq!(got.out_path, vec![0x11, 0x22]);
                assert_eq!(got.out_path_len, 2);
                assert_eq!(got.lastmod, contact.lastmod);
                assert!((got.adv_lat - contact.adv_lat).abs() < 1e-5);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn status_push_decodes_all_fields() {
        let mut frame = vec![PUSH_CODE_STATUS_RESPONSE];
        frame.extend_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        frame.extend_from_slice(&4100u16.to_le_bytes()); // battery
        frame.extend_from_slice(&3u16.to_le_bytes()); // tx queue
        frame.extend_from_slice(&(-104i16).to_le_bytes()); // noise floor
        frame.extend_from_slice(&(-78i16).to_le_bytes()); // rssi
        frame.extend_from_slice(&1234u32.to_le_bytes()); // recv
        frame.extend_from_slice(&987u32.to_le_bytes()); // sent
        frame.extend_from_slice(&55u32.to_le_bytes()); // airtime
        frame.extend_from_slice(&86_400u32.to_le_bytes()); // uptime
        match decode_frame(&frame).unwrap() {
            Decoded::Event(Event::StatusResponse(p)) => {
                assert_eq!(p.pubkey_prefix, "aabbccddeeff");
                assert_eq!(p.battery_mv, 4100);
                assert_eq!(p.noise_floor, -104);
                assert_eq!(p.last_rssi, -78);
                assert_eq!(p.uptime, 86_400);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let frame = vec![PUSH_CODE_STATUS_RESPONSE, 0xaa, 0xbb];
        assert!(matches!(
            decode_frame(&frame),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn unknown_code_is_reported() {
        assert_eq!(
            decode_frame(&[0x7f]),
            Err(ProtocolError::UnknownCode(0x7f))
        );
    }

    #[test]
    fn rx_log_snr_is_quarter_db() {
        let mut frame = vec![PUSH_CODE_LOG_RX_DATA];
        frame.push((-26i8) as u8); // -6.5 dB
        frame.push((-92i8) as u8);
        frame.extend_from_slice(&[0x15, 0x00, 0xde, 0xad]);
        match decode_frame(&frame).unwrap() {
            Decoded::Event(Event::RxLog(rx)) => {
                assert!((rx.snr + 6.5).abs() < f32::EPSILON);
                assert!((rx.rssi + 92.0).abs() < f32::EPSILON);
                assert_eq!(rx.raw, vec![0x15, 0x00, 0xde, 0xad]);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn hex_roundtrip() {
        let bytes = vec![0x00, 0xff, 0x12, 0xab];
        assert_eq!(hex_decode(&hex_encode(&bytes)).unwrap(), bytes);
        assert!(hex_decode("abc").is_err());
        assert!(hex_decode("zz").is_err());
        // Multibyte characters can land pair boundaries mid-character; the
        // decoder must report bad hex, not panic.
        assert!(hex_decode("\u{20ac}a").is_err());
        assert!(hex_decode("a\u{e9}").is_err());
    }
}
