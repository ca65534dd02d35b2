//! Discovered-contact persistence: eviction order survives restarts, and
//! mutations (but only mutations) hit storage.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use common::{contact, MemoryBackend};
use meshmon::coordinator::registry::ContactRegistry;
use meshmon::meshcore::NodeType;
use meshmon::storage::{DiscoveredContactStore, JsonFileBackend};

#[test]
fn eviction_order_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("contacts.json");

    {
        let backend = Arc::new(JsonFileBackend::new(&path));
        let mut registry = ContactRegistry::new(backend, 10);
        for tag in ['a', 'b', 'c', 'd'] {
            registry.on_new_contact_discovered(contact(tag, NodeType::Client));
        }
        // Re-discovering 'a' moves it to the back before shutdown.
        registry.on_new_contact_discovered(contact('a', NodeType::Client));
    }

    // "Restart": load the snapshot fresh and evict to 2.
    let backend = Arc::new(JsonFileBackend::new(&path));
    let snapshot = backend.load().unwrap();
    let keys: Vec<_> = snapshot.iter().map(|c| c.key_prefix().to_string()).collect();
    assert_eq!(
        keys,
        vec![
            "b".repeat(12),
            "c".repeat(12),
            "d".repeat(12),
            "a".repeat(12)
        ]
    );

    let mut registry = ContactRegistry::new(backend.clone(), 2);
    registry.load_discovered(snapshot);
    assert!(registry.evict_if_over_capacity());
    assert_eq!(
        registry.discovered_keys_in_order(),
        vec!["d".repeat(64), "a".repeat(64)]
    );

    // The eviction persisted too.
    let reloaded = backend.load().unwrap();
    assert_eq!(reloaded.len(), 2);
}

#[test]
fn only_mutations_write_storage() {
    let backend = MemoryBackend::new();
    let mut registry = ContactRegistry::new(backend.clone(), 3);

    registry.on_new_contact_discovered(contact('a', NodeType::Client));
    let after_insert = backend.writes.load(Ordering::SeqCst);
    assert_eq!(after_insert, 1);

    // Reads and no-op evictions are write-free.
    let _ = registry.merge();
    let _ = registry.get_by_prefix(&"a".repeat(12));
    assert!(!registry.evict_if_over_capacity());
    assert_eq!(backend.writes.load(Ordering::SeqCst), after_insert);

    // Over-capacity insert writes once (the insert persists post-eviction).
    for tag in ['b', 'c', 'd'] {
        registry.on_new_contact_discovered(contact(tag, NodeType::Client));
    }
    assert_eq!(registry.discovered_len(), 3);
    assert_eq!(backend.last.lock().unwrap().len(), 3);
}

#[test]
fn snapshot_rebuild_keeps_insertion_semantics() {
    let mut store = DiscoveredContactStore::new();
    for tag in ['x', 'y', 'z'] {
        store.insert(contact(tag, NodeType::Sensor));
    }
    let rebuilt = DiscoveredContactStore::from_snapshot(store.in_order());
    assert_eq!(rebuilt.keys_in_order(), store.keys_in_order());
}
