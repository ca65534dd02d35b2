//! Contact registry: merged view of added and discovered contacts.
//!
//! *Added* contacts come from the radio's own contact table and are re-synced
//! whenever the radio flags it dirty. *Discovered* contacts were only heard
//! via advertisement broadcast. The registry merges the two by public key,
//! keeps the freshest record, bounds the discovered store with
//! LRU-by-discovery eviction, and persists the discovered store on every
//! mutation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::meshcore::{Contact, PUBKEY_PREFIX_LEN};
use crate::storage::{DiscoveredContactStore, PersistBackend};

pub const DEFAULT_MAX_DISCOVERED: usize = 200;

pub struct ContactRegistry {
    added: HashMap<String, Contact>,
    discovered: DiscoveredContactStore,
    backend: Arc<dyn PersistBackend>,
    max_discovered: usize,
    /// Set when the radio's own contact table changed and the added set
    /// needs a re-sync.
    dirty: bool,
    /// Per-contact dirty flags, keyed by pubkey prefix, letting downstream
    /// views skip unchanged entries.
    dirty_contacts: HashSet<String>,
}

impl ContactRegistry {
    pub fn new(backend: Arc<dyn PersistBackend>, max_discovered: usize) -> Self {
        Self {
            added: HashMap::new(),
            discovered: DiscoveredContactStore::new(),
            backend,
            max_discovered,
            dirty: false,
            dirty_contacts: HashSet::new(),
        }
    }

    /// Seed the discovered store from a persisted snapshot, keeping its
    /// order. Does not write storage.
    pub fn load_discovered(&mut self, snapshot: Vec<Contact>) {
        self.discovered = DiscoveredContactStore::from_snapshot(snapshot);
    }

    /// Replace the added set after a radio contact sync.
    pub fn set_added_contacts(&mut self, contacts: Vec<Contact>) {
        debug!("added set replaced: {} contacts", contacts.len());
        self.added = contacts
            .into_iter()
            .map(|c| (c.public_key.clone(), c))
            .collect();
    }

    /// Record an advertisement observation. Insertion (or re-insertion)
    /// moves the key to the back of the eviction order, runs the eviction
    /// check, and persists.
    pub fn on_new_contact_discovered(&mut self, contact: Contact) {
        let known = self.discovered.get(&contact.public_key).is_some();
        if known {
            debug!(
                "re-discovered {} ({})",
                crate::logutil::escape_log(&contact.adv_name),
                contact.key_prefix()
            );
        } else {
            info!(
                "discovered new contact {} ({})",
                crate::logutil::escape_log(&contact.adv_name),
                contact.key_prefix()
            );
        }
        let prefix = contact.key_prefix().to_string();
        self.discovered.insert(contact);
        self.dirty_contacts.insert(prefix);
        let evicted = self.discovered.evict_to_capacity(self.max_discovered);
        self.drop_secondary_indices(&evicted);
        if !evicted.is_empty() {
            info!("evicted {} discovered contacts over capacity", evicted.len());
        }
        self.persist();
    }

    fn drop_secondary_indices(&mut self, evicted_keys: &[String]) {
        for key in evicted_keys {
            let prefix = &key[..key.len().min(PUBKEY_PREFIX_LEN)];
            self.dirty_contacts.remove(prefix);
        }
    }

    /// Evict down to the cap if over it. Under/at cap this is a no-op and
    /// issues no storage write. Returns whether eviction occurred.
    pub fn evict_if_over_capacity(&mut self) -> bool {
        let evicted = self.discovered.evict_to_capacity(self.max_discovered);
        if evicted.is_empty() {
            return false;
        }
        self.drop_secondary_indices(&evicted);
        info!("evicted {} discovered contacts", evicted.len());
        self.persist();
        true
    }

    fn persist(&self) {
        // Best effort: losing the discovered cache costs rediscovery time,
        // not correctness.
        if let Err(e) = self.backend.save(&self.discovered.in_order()) {
            warn!("failed to persist discovered contacts: {e:#}");
        }
    }

    /// Merged view: union of both provenances keyed by public key, the
    /// record with the greater `lastmod` winning, stamped with
    /// `pubkey_prefix` and `added_to_node`.
    pub fn merge(&self) -> Vec<Contact> {
        let mut merged: HashMap<&str, &Contact> = HashMap::new();
        for contact in self.discovered.values() {
            merged.insert(contact.public_key.as_str(), contact);
        }
        for contact in self.added.values() {
            merged
                .entry(contact.public_key.as_str())
                .and_modify(|existing| {
                    if contact.lastmod >= existing.lastmod {
                        *existing = contact;
                    }
                })
                .or_insert(contact);
        }
        merged
            .into_values()
            .map(|c| {
                let mut stamped = c.clone();
                stamped.pubkey_prefix = c.key_prefix().to_string();
                stamped.added_to_node = self.added.contains_key(&c.public_key);
                stamped
            })
            .collect()
    }

    /// Look up a merged contact by pubkey prefix (min 6 hex chars).
    pub fn get_by_prefix(&self, prefix: &str) -> Option<Contact> {
        if prefix.len() < 6 || prefix.len() > PUBKEY_PREFIX_LEN * 2 {
            return None;
        }
        self.merge()
            .into_iter()
            .find(|c| c.public_key.starts_with(prefix))
    }

    /// Look up a merged contact by exact advertised name.
    pub fn get_by_name(&self, name: &str) -> Option<Contact> {
        self.merge().into_iter().find(|c| c.adv_name == name)
    }

    /// Look up a contact in the radio's own table by pubkey prefix.
    pub fn get_added_by_prefix(&self, prefix: &str) -> Option<Contact> {
        if prefix.len() < 6 {
            return None;
        }
        self.added
            .values()
            .find(|c| c.public_key.starts_with(prefix))
            .cloned()
    }

    /// Look up a contact in the radio's own table by exact advertised name.
    pub fn get_added_by_name(&self, name: &str) -> Option<Contact> {
        self.added.values().find(|c| c.adv_name == name).cloned()
    }

    /// Look up a discovered-only contact, used when adding a heard node to
    /// the radio's table.
    pub fn get_discovered_by_prefix(&self, prefix: &str) -> Option<Contact> {
        if prefix.len() < 6 {
            return None;
        }
        self.discovered
            .values()
            .find(|c| c.public_key.starts_with(prefix))
            .cloned()
    }

    pub fn discovered_len(&self) -> usize {
        self.discovered.len()
    }

    pub fn discovered_keys_in_order(&self) -> Vec<String> {
        self.discovered.keys_in_order()
    }

    /// The radio flagged its contact table as changed.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Read and clear the radio-dirty flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub fn mark_contact_dirty(&mut self, prefix: &str) {
        self.dirty_contacts.insert(prefix.to_string());
    }

    pub fn is_contact_dirty(&self, prefix: &str) -> bool {
        self.dirty_contacts.contains(prefix)
    }

    pub fn clear_contact_dirty(&mut self, prefix: &str) {
        self.dirty_contacts.remove(prefix);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meshcore::NodeType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBackend {
        writes: AtomicUsize,
    }

    impl CountingBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                writes: AtomicUsize::new(0),
            })
        }

        fn count(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }
    }

    impl PersistBackend for CountingBackend {
        fn save(&self, _contacts: &[Contact]) -> anyhow::Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn contact(tag: char, lastmod: u64) -> Contact {
        Contact {
            public_key: tag.to_string().repeat(64),
            adv_name: format!("node-{tag}"),
            node_type: NodeType::Repeater,
            last_advert: lastmod,
            out_path: vec![],
            out_path_len: -1,
            adv_lat: 0.0,
            adv_lon: 0.0,
            lastmod,
            pubkey_prefix: String::new(),
            added_to_node: false,
        }
    }

    #[test]
    fn merge_prefers_greater_lastmod_and_stamps_added() {
        let backend = CountingBackend::new();
        let mut registry = ContactRegistry::new(backend, 10);
        let mut discovered = contact('a', 200);
        discovered.adv_name = "fresh-name".into();
        registry.on_new_contact_discovered(discovered);
        registry.set_added_contacts(vec![contact('a', 100)]);

        let merged = registry.merge();
        assert_eq!(merged.len(), 1);
        // Discovered record is fresher, so its fields win, but the added
        // provenance still stamps the flag.
        assert_eq!(merged[0].adv_name, "fresh-name");
        assert!(merged[0].added_to_node);
        assert_eq!(merged[0].pubkey_prefix, "a".repeat(12));
    }

    #[test]
    fn merge_prefers_added_when_fresher() {
        let backend = CountingBackend::new();
        let mut registry = ContactRegistry::new(backend, 10);
        registry.on_new_contact_discovered(contact('b', 50));
        let mut added = contact('b', 500);
        added.adv_name = "authoritative".into();
        registry.set_added_contacts(vec![added]);
        let merged = registry.merge();
        assert_eq!(merged[0].adv_name, "authoritative");
        assert!(merged[0].added_to_node);
    }

    #[test]
    fn eviction_noop_issues_no_write() {
        let backend = CountingBackend::new();
        let mut registry = ContactRegistry::new(backend.clone(), 3);
        for tag in ['a', 'b', 'c'] {
            registry.on_new_contact_discovered(contact(tag, 10));
        }
        let writes_before = backend.count();
        assert!(!registry.evict_if_over_capacity());
        assert_eq!(backend.count(), writes_before);
    }

    #[test]
    fn eviction_removes_oldest_first() {
        let backend = CountingBackend::new();
        let mut registry = ContactRegistry::new(backend, 3);
        // Insert five with the cap applied afterwards so order is intact.
        let mut raw = DiscoveredContactStore::new();
        for tag in ['a', 'b', 'c', 'd', 'e'] {
            raw.insert(contact(tag, 10));
        }
        registry.load_discovered(raw.in_order());
        assert!(registry.evict_if_over_capacity());
        let keys = registry.discovered_keys_in_order();
        assert_eq!(
            keys,
            vec!["c".repeat(64), "d".repeat(64), "e".repeat(64)]
        );
    }

    #[test]
    fn readvertisement_refreshes_eviction_order() {
        let backend = CountingBackend::new();
        let mut registry = ContactRegistry::new(backend, 10);
        let mut raw = DiscoveredContactStore::new();
        for tag in ['a', 'b', 'c', 'd', 'e'] {
            raw.insert(contact(tag, 10));
        }
        registry.load_discovered(raw.in_order());
        registry.on_new_contact_discovered(contact('b', 20));
        assert_eq!(
            registry.discovered_keys_in_order(),
            vec![
                "a".repeat(64),
                "c".repeat(64),
                "d".repeat(64),
                "e".repeat(64),
                "b".repeat(64)
            ]
        );
    }

    #[test]
    fn prefix_lookup_requires_six_chars() {
        let backend = CountingBackend::new();
        let mut registry = ContactRegistry::new(backend, 10);
        registry.on_new_contact_discovered(contact('d', 10));
        assert!(registry.get_by_prefix("ddd").is_none());
        assert!(registry.get_by_prefix("dddddd").is_some());
        assert!(registry.get_by_name("node-d").is_some());
    }

    #[test]
    fn eviction_clears_per_contact_dirty_flags() {
        let backend = CountingBackend::new();
        let mut registry = ContactRegistry::new(backend, 1);
        registry.on_new_contact_discovered(contact('a', 10));
        assert!(registry.is_contact_dirty(&"a".repeat(12)));
        // Inserting a second contact evicts 'a' and its dirty flag.
        registry.on_new_contact_discovered(contact('b', 20));
        assert!(!registry.is_contact_dirty(&"a".repeat(12)));
        assert!(registry.is_contact_dirty(&"b".repeat(12)));
        registry.clear_contact_dirty(&"b".repeat(12));
        assert!(!registry.is_contact_dirty(&"b".repeat(12)));
    }

    #[test]
    fn dirty_flag_is_consumed_once() {
        let backend = CountingBackend::new();
        let mut registry = ContactRegistry::new(backend, 10);
        registry.mark_dirty();
        assert!(registry.take_dirty());
        assert!(!registry.take_dirty());
    }
}
