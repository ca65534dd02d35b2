//! Raw RX-log correlation.
//!
//! The radio pushes a raw copy of every packet it hears. Channel text
//! packets among them can be decrypted with the configured channel secrets,
//! which yields the radio-layer observation (SNR, RSSI, path) for a message
//! that will also arrive through the application-level message queue. The
//! correlator caches decrypted observations for a few seconds keyed by
//! channel, timestamp and text, so the message handler can attach signal
//! data to the delivered message.
//!
//! Decryption failures are expected: packets for unconfigured channels,
//! corrupt ciphertext, unrelated traffic. They stay at debug level.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, KeyInit};
use aes::Aes128;
use hmac::{Hmac, Mac};
use log::debug;
use sha2::{Digest, Sha256};

use crate::logutil::escape_log;
use crate::meshcore::protocol::hex_encode;
use crate::meshcore::RxLogData;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_TTL_SECONDS: f64 = 5.0;
pub const DEFAULT_MAX_CACHE_SIZE: usize = 100;

/// Payload-type nibble for group/channel text packets.
const PAYLOAD_TYPE_GROUP_TEXT: u8 = 0x05;

/// A channel the correlator can decrypt.
#[derive(Debug, Clone)]
pub struct ChannelKey {
    pub channel_idx: u8,
    pub secret: [u8; 16],
    /// First byte of `sha256(secret)`, matched against the packet's
    /// channel-hash byte before attempting decryption.
    hash: u8,
}

impl ChannelKey {
    pub fn new(channel_idx: u8, secret: [u8; 16]) -> Self {
        let hash = Sha256::digest(secret)[0];
        Self {
            channel_idx,
            secret,
            hash,
        }
    }
}

/// One decrypted radio-layer observation of a channel message.
#[derive(Debug, Clone, PartialEq)]
pub struct RxObservation {
    pub channel_idx: u8,
    pub timestamp: u32,
    pub text: String,
    pub snr: f32,
    pub rssi: f32,
    pub path_len: u8,
    pub path: Vec<u8>,
    pub channel_hash: u8,
}

struct CacheEntry {
    observations: Vec<RxObservation>,
    inserted_at: f64,
}

pub struct RxLogCorrelator {
    channels: Vec<ChannelKey>,
    cache: std::collections::HashMap<String, CacheEntry>,
    ttl_seconds: f64,
    max_size: usize,
    origin: std::time::Instant,
}

impl RxLogCorrelator {
    pub fn new(channels: Vec<ChannelKey>, ttl_seconds: f64, max_size: usize) -> Self {
        Self {
            channels,
            cache: std::collections::HashMap::new(),
            ttl_seconds,
            max_size,
            origin: std::time::Instant::now(),
        }
    }

    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    /// Cache key for a delivered or decrypted channel message.
    pub fn correlation_key(channel_idx: u8, timestamp: u32, text: &str) -> String {
        let digest = Sha256::digest(format!("{channel_idx}:{timestamp}:{text}").as_bytes());
        hex_encode(&digest)[..16].to_string()
    }

    /// Process one raw RX-log push: parse, try each matching channel secret,
    /// cache every successful decryption.
    pub fn on_rx_log(&mut self, rx: &RxLogData) {
        let now = self.now();
        self.on_rx_log_at(rx, now);
    }

    pub fn on_rx_log_at(&mut self, rx: &RxLogData, now: f64) {
        let Some(packet) = parse_packet(&rx.raw) else {
            return;
        };
        let mut decrypted = Vec::new();
        for channel in &self.channels {
            if channel.hash != packet.channel_hash {
                continue;
            }
            let Some((timestamp, text)) = decrypt_group_text(channel, &packet) else {
                continue;
            };
            debug!(
                "decrypted channel {} message at {}: {}",
                channel.channel_idx,
                timestamp,
                escape_log(&text)
            );
            let observation = RxObservation {
                channel_idx: channel.channel_idx,
                timestamp,
                text: text.clone(),
                snr: rx.snr,
                rssi: rx.rssi,
                path_len: packet.path.len() as u8,
                path: packet.path.clone(),
                channel_hash: packet.channel_hash,
            };
            let key = Self::correlation_key(channel.channel_idx, timestamp, &text);
            decrypted.push((key, observation));
        }
        for (key, observation) in decrypted {
            self.insert_at(key, observation, now);
        }
    }

    fn insert_at(&mut self, key: String, observation: RxObservation, now: f64) {
        self.purge_at(now);
        self.cache
            .entry(key)
            .or_insert_with(|| CacheEntry {
                observations: Vec::new(),
                inserted_at: now,
            })
            .observations
            .push(observation);
        // Over the size cap, drop the oldest keys first.
        while self.cache.len() > self.max_size {
            let oldest = self
                .cache
                .iter()
                .min_by(|a, b| {
                    a.1.inserted_at
                        .partial_cmp(&b.1.inserted_at)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    self.cache.remove(&k);
                }
                None => break,
            }
        }
    }

    fn purge_at(&mut self, now: f64) {
        let ttl = self.ttl_seconds;
        self.cache.retain(|_, entry| now - entry.inserted_at <= ttl);
    }

    /// Remove and return all cached observations for a delivered message.
    /// Empty when the packet was not heard (or has already expired).
    pub fn take_matches(&mut self, channel_idx: u8, timestamp: u32, text: &str) -> Vec<RxObservation> {
        let now = self.now();
        self.take_matches_at(channel_idx, timestamp, text, now)
    }

    pub fn take_matches_at(
        &mut self,
        channel_idx: u8,
        timestamp: u32,
        text: &str,
        now: f64,
    ) -> Vec<RxObservation> {
        self.purge_at(now);
        let key = Self::correlation_key(channel_idx, timestamp, text);
        self.cache
            .remove(&key)
            .map(|entry| entry.observations)
            .unwrap_or_default()
    }

    pub fn cached_keys(&self) -> usize {
        self.cache.len()
    }
}

struct ParsedPacket {
    path: Vec<u8>,
    channel_hash: u8,
    mac: [u8; 2],
    ciphertext: Vec<u8>,
}

/// Parse the over-the-air layout: header, path length, path, channel-hash
/// byte, 2-byte truncated MAC, ciphertext. Only group-text payloads parse.
fn parse_packet(raw: &[u8]) -> Option<ParsedPacket> {
    if raw.len() < 2 {
        return None;
    }
    let header = raw[0];
    if (header >> 2) & 0x0f != PAYLOAD_TYPE_GROUP_TEXT {
        return None;
    }
    let path_len = raw[1] as usize;
    let rest = &raw[2..];
    if rest.len() < path_len + 3 {
        return None;
    }
    let path = rest[..path_len].to_vec();
    let channel_hash = rest[path_len];
    let mac = [rest[path_len + 1], rest[path_len + 2]];
    let ciphertext = rest[path_len + 3..].to_vec();
    if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
        return None;
    }
    Some(ParsedPacket {
        path,
        channel_hash,
        mac,
        ciphertext,
    })
}

/// AES-128-ECB decrypt and unpack `timestamp || text`. The truncated MAC is
/// checked but a mismatch only logs; MeshCore senders differ in what they
/// MAC over, and the timestamp/text sanity checks below catch garbage.
fn decrypt_group_text(channel: &ChannelKey, packet: &ParsedPacket) -> Option<(u32, String)> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(&channel.secret).ok()?;
    mac.update(&packet.ciphertext);
    let expected = mac.finalize().into_bytes();
    if expected[..2] != packet.mac {
        debug!(
            "truncated MAC mismatch on channel {} packet",
            channel.channel_idx
        );
    }

    let cipher = Aes128::new(GenericArray::from_slice(&channel.secret));
    let mut plaintext = packet.ciphertext.clone();
    for chunk in plaintext.chunks_exact_mut(16) {
        cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
    }

    if plaintext.len() < 5 {
        return None;
    }
    let timestamp = u32::from_le_bytes([plaintext[0], plaintext[1], plaintext[2], plaintext[3]]);
    let body = &plaintext[4..];
    let end = body.iter().rposition(|&b| b != 0).map(|p| p + 1).unwrap_or(0);
    let text = std::str::from_utf8(&body[..end]).ok()?;
    if text.is_empty() {
        return None;
    }
    Some((timestamp, text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::BlockEncrypt;

    fn secret() -> [u8; 16] {
        *b"0123456789abcdef"
    }

    fn encrypt(secret: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
        let cipher = Aes128::new(GenericArray::from_slice(secret));
        let mut padded = plaintext.to_vec();
        while padded.len() % 16 != 0 {
            padded.push(0);
        }
        for chunk in padded.chunks_exact_mut(16) {
            cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
        }
        padded
    }

    fn build_packet(secret: &[u8; 16], path: &[u8], timestamp: u32, text: &str) -> Vec<u8> {
        let mut plaintext = timestamp.to_le_bytes().to_vec();
        plaintext.extend_from_slice(text.as_bytes());
        let ciphertext = encrypt(secret, &plaintext);
        let mut mac = <HmacSha256 as Mac>::new_from_slice(secret).unwrap();
        mac.update(&ciphertext);
        let tag = mac.finalize().into_bytes();

        let mut raw = vec![PAYLOAD_TYPE_GROUP_TEXT << 2, path.len() as u8];
        raw.extend_from_slice(path);
        raw.push(Sha256::digest(secret)[0]);
        raw.extend_from_slice(&tag[..2]);
        raw.extend_from_slice(&ciphertext);
        raw
    }

    fn rx(raw: Vec<u8>) -> RxLogData {
        RxLogData {
            snr: -5.25,
            rssi: -91.0,
            raw,
        }
    }

    #[test]
    fn decrypts_and_correlates_matching_channel() {
        let mut correlator =
            RxLogCorrelator::new(vec![ChannelKey::new(0, secret())], 5.0, 100);
        let raw = build_packet(&secret(), &[0x42, 0x17], 1_700_000_000, "hello mesh");
        correlator.on_rx_log_at(&rx(raw), 0.0);

        let matches = correlator.take_matches_at(0, 1_700_000_000, "hello mesh", 1.0);
        assert_eq!(matches.len(), 1);
        let obs = &matches[0];
        assert_eq!(obs.text, "hello mesh");
        assert_eq!(obs.path, vec![0x42, 0x17]);
        assert_eq!(obs.path_len, 2);
        assert!((obs.snr + 5.25).abs() < f32::EPSILON);
        // Taking consumes the entry.
        assert!(correlator
            .take_matches_at(0, 1_700_000_000, "hello mesh", 1.0)
            .is_empty());
    }

    #[test]
    fn redundant_receptions_accumulate_under_one_key() {
        let mut correlator =
            RxLogCorrelator::new(vec![ChannelKey::new(0, secret())], 5.0, 100);
        // Same message heard over two paths.
        correlator.on_rx_log_at(&rx(build_packet(&secret(), &[], 42, "dup")), 0.0);
        correlator.on_rx_log_at(&rx(build_packet(&secret(), &[0x01], 42, "dup")), 0.5);
        let matches = correlator.take_matches_at(0, 42, "dup", 1.0);
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].path_len, 0);
        assert_eq!(matches[1].path_len, 1);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let mut correlator =
            RxLogCorrelator::new(vec![ChannelKey::new(0, secret())], 5.0, 100);
        correlator.on_rx_log_at(&rx(build_packet(&secret(), &[], 7, "late")), 0.0);
        assert!(correlator.take_matches_at(0, 7, "late", 6.0).is_empty());
    }

    #[test]
    fn wrong_channel_hash_is_skipped() {
        let other_secret = *b"ffffffffffffffff";
        let mut correlator =
            RxLogCorrelator::new(vec![ChannelKey::new(0, secret())], 5.0, 100);
        let raw = build_packet(&other_secret, &[], 9, "not ours");
        correlator.on_rx_log_at(&rx(raw), 0.0);
        assert_eq!(correlator.cached_keys(), 0);
    }

    #[test]
    fn non_group_text_payloads_are_ignored() {
        let mut correlator =
            RxLogCorrelator::new(vec![ChannelKey::new(0, secret())], 5.0, 100);
        let mut raw = build_packet(&secret(), &[], 9, "advert");
        raw[0] = 0x01 << 2; // some other payload type
        correlator.on_rx_log_at(&rx(raw), 0.0);
        assert_eq!(correlator.cached_keys(), 0);
    }

    #[test]
    fn truncated_or_garbage_packets_are_silent() {
        let mut correlator =
            RxLogCorrelator::new(vec![ChannelKey::new(0, secret())], 5.0, 100);
        correlator.on_rx_log_at(&rx(vec![]), 0.0);
        correlator.on_rx_log_at(&rx(vec![PAYLOAD_TYPE_GROUP_TEXT << 2]), 0.0);
        correlator.on_rx_log_at(&rx(vec![PAYLOAD_TYPE_GROUP_TEXT << 2, 200, 1, 2]), 0.0);
        assert_eq!(correlator.cached_keys(), 0);
    }

    #[test]
    fn every_matching_channel_caches_its_own_observation() {
        // Two channel slots sharing a secret both match the hash byte, so one
        // packet produces one cached observation per channel index.
        let mut correlator = RxLogCorrelator::new(
            vec![ChannelKey::new(0, secret()), ChannelKey::new(3, secret())],
            5.0,
            100,
        );
        correlator.on_rx_log_at(&rx(build_packet(&secret(), &[], 55, "both")), 0.0);
        assert_eq!(correlator.cached_keys(), 2);
        assert_eq!(correlator.take_matches_at(0, 55, "both", 1.0).len(), 1);
        assert_eq!(correlator.take_matches_at(3, 55, "both", 1.0).len(), 1);
    }

    #[test]
    fn correlation_key_is_deterministic_and_input_sensitive() {
        let key = RxLogCorrelator::correlation_key(0, 1000, "hi");
        assert_eq!(key.len(), 16);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(key, RxLogCorrelator::correlation_key(0, 1000, "hi"));
        assert_ne!(key, RxLogCorrelator::correlation_key(1, 1000, "hi"));
        assert_ne!(key, RxLogCorrelator::correlation_key(0, 1001, "hi"));
        assert_ne!(key, RxLogCorrelator::correlation_key(0, 1000, "hj"));
    }

    #[test]
    fn size_cap_drops_oldest_keys() {
        let mut correlator =
            RxLogCorrelator::new(vec![ChannelKey::new(0, secret())], 60.0, 2);
        for (i, text) in ["one", "two", "three"].iter().enumerate() {
            correlator.on_rx_log_at(&rx(build_packet(&secret(), &[], 100 + i as u32, text)), i as f64);
        }
        assert_eq!(correlator.cached_keys(), 2);
        assert!(correlator.take_matches_at(0, 100, "one", 3.0).is_empty());
        assert!(!correlator.take_matches_at(0, 102, "three", 3.0).is_empty());
    }
}
