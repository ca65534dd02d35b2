//! # Persistence Module
//!
//! Durable storage for discovered contacts: a single JSON object mapping
//! `public_key` to the contact record. Key order in the file is the
//! discovery order, which doubles as the eviction queue, so it survives
//! restarts (serde_json is built with `preserve_order`).
//!
//! Writes go through a temp file and an atomic rename, under an exclusive
//! advisory lock, so a crash mid-write never corrupts the store.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use log::{debug, info, warn};

use crate::meshcore::Contact;

/// Where discovered-contact snapshots end up.
pub trait PersistBackend: Send + Sync {
    /// Persist the full ordered snapshot.
    fn save(&self, contacts: &[Contact]) -> Result<()>;
}

/// JSON file backend used in production.
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load the snapshot, preserving file order. A missing file is an empty
    /// store, not an error.
    pub fn load(&self) -> Result<Vec<Contact>> {
        if !self.path.exists() {
            debug!("no contact store at {}, starting empty", self.path.display());
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        let map: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        let mut contacts = Vec::with_capacity(map.len());
        for (key, value) in map {
            match serde_json::from_value::<Contact>(value) {
                Ok(contact) => contacts.push(contact),
                Err(e) => warn!("dropping malformed stored contact {key}: {e}"),
            }
        }
        info!(
            "loaded {} discovered contacts from {}",
            contacts.len(),
            self.path.display()
        );
        Ok(contacts)
    }
}

impl PersistBackend for JsonFileBackend {
    fn save(&self, contacts: &[Contact]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        let mut map = serde_json::Map::with_capacity(contacts.len());
        for contact in contacts {
            map.insert(contact.public_key.clone(), serde_json::to_value(contact)?);
        }
        let payload = serde_json::to_string_pretty(&map)?;

        let lock_path = self.path.with_extension("lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("opening {}", lock_path.display()))?;
        lock_file
            .lock_exclusive()
            .with_context(|| format!("locking {}", lock_path.display()))?;

        let tmp_path = self.path.with_extension("tmp");
        let result = (|| -> Result<()> {
            let mut tmp = fs::File::create(&tmp_path)
                .with_context(|| format!("creating {}", tmp_path.display()))?;
            tmp.write_all(payload.as_bytes())?;
            tmp.sync_all()?;
            fs::rename(&tmp_path, &self.path)
                .with_context(|| format!("replacing {}", self.path.display()))?;
            Ok(())
        })();
        let _ = fs2::FileExt::unlock(&lock_file);
        result
    }
}

/// Insertion-ordered `public_key -> Contact` store; the order is the
/// eviction queue. Re-inserting a known key moves it to the back, so the
/// front always holds the least-recently-(re)discovered entries.
#[derive(Default)]
pub struct DiscoveredContactStore {
    by_key: HashMap<String, Contact>,
    order: VecDeque<String>,
}

impl DiscoveredContactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a persisted snapshot, keeping its order.
    pub fn from_snapshot(contacts: Vec<Contact>) -> Self {
        let mut store = Self::new();
        for contact in contacts {
            store.insert(contact);
        }
        store
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn get(&self, public_key: &str) -> Option<&Contact> {
        self.by_key.get(public_key)
    }

    /// Insert or refresh a contact, moving its key to the back of the
    /// eviction order either way.
    pub fn insert(&mut self, contact: Contact) {
        let key = contact.public_key.clone();
        if self.by_key.insert(key.clone(), contact).is_some() {
            self.order.retain(|k| k != &key);
        }
        self.order.push_back(key);
    }

    /// Drop oldest entries until at most `max_contacts` remain. Returns the
    /// evicted keys; empty when already at or under the cap.
    pub fn evict_to_capacity(&mut self, max_contacts: usize) -> Vec<String> {
        let mut evicted = Vec::new();
        while self.by_key.len() > max_contacts {
            match self.order.pop_front() {
                Some(key) => {
                    self.by_key.remove(&key);
                    evicted.push(key);
                }
                None => break,
            }
        }
        evicted
    }

    /// Contacts in eviction order, oldest first. This is the persisted form.
    pub fn in_order(&self) -> Vec<Contact> {
        self.order
            .iter()
            .filter_map(|key| self.by_key.get(key).cloned())
            .collect()
    }

    pub fn keys_in_order(&self) -> Vec<String> {
        self.order.iter().cloned().collect()
    }

    pub fn values(&self) -> impl Iterator<Item = &Contact> {
        self.by_key.values()
    }
}

/// Store file location inside the configured data directory.
pub fn default_store_path(data_dir: &Path) -> PathBuf {
    data_dir.join("discovered_contacts.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meshcore::NodeType;

    fn contact(tag: &str) -> Contact {
        Contact {
            public_key: tag.repeat(64 / tag.len().max(1)),
            adv_name: format!("node-{tag}"),
            node_type: NodeType::Client,
            last_advert: 100,
            out_path: vec![],
            out_path_len: -1,
            adv_lat: 0.0,
            adv_lon: 0.0,
            lastmod: 100,
            pubkey_prefix: String::new(),
            added_to_node: false,
        }
    }

    #[test]
    fn reinsert_moves_key_to_back() {
        let mut store = DiscoveredContactStore::new();
        for tag in ["a", "b", "c"] {
            store.insert(contact(tag));
        }
        store.insert(contact("a"));
        let keys = store.keys_in_order();
        assert_eq!(keys[0], "b".repeat(64));
        assert_eq!(keys[2], "a".repeat(64));
    }

    #[test]
    fn eviction_is_oldest_first_and_noop_under_cap() {
        let mut store = DiscoveredContactStore::new();
        for tag in ["a", "b", "c"] {
            store.insert(contact(tag));
        }
        assert!(store.evict_to_capacity(3).is_empty());
        assert!(store.evict_to_capacity(5).is_empty());
        let evicted = store.evict_to_capacity(1);
        assert_eq!(evicted, vec!["a".repeat(64), "b".repeat(64)]);
        assert_eq!(store.len(), 1);
        assert!(store.get(&"c".repeat(64)).is_some());
    }

    #[test]
    fn json_backend_roundtrip_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let backend = JsonFileBackend::new(dir.path().join("contacts.json"));
        let snapshot = vec![contact("e"), contact("a"), contact("c")];
        backend.save(&snapshot).unwrap();
        let loaded = backend.load().unwrap();
        let keys: Vec<_> = loaded.iter().map(|c| c.public_key.clone()).collect();
        assert_eq!(
            keys,
            vec!["e".repeat(64), "a".repeat(64), "c".repeat(64)]
        );
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let backend = JsonFileBackend::new(dir.path().join("absent.json"));
        assert!(backend.load().unwrap().is_empty());
    }
}
