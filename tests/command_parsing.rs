//! Operator command execution end to end: parse, resolve, dispatch.

mod common;

use std::sync::Mutex;

use common::{contact, prefix, FakeApi, MemoryBackend};
use meshmon::commands;
use meshmon::coordinator::registry::ContactRegistry;
use meshmon::meshcore::NodeType;

fn registry_with_nodes() -> Mutex<ContactRegistry> {
    let backend = MemoryBackend::new();
    let mut registry = ContactRegistry::new(backend, 10);
    // 'a' is in the radio's table; 'b' was only heard via advertisement.
    registry.set_added_contacts(vec![contact('a', NodeType::Repeater)]);
    registry.on_new_contact_discovered(contact('b', NodeType::Client));
    Mutex::new(registry)
}

#[tokio::test]
async fn resolves_by_prefix_and_by_name() {
    let api = FakeApi::new();
    let registry = registry_with_nodes();

    commands::execute(
        &format!(r#"send_msg("{}", "hi there")"#, prefix('a')),
        api.as_ref(),
        &registry,
    )
    .await
    .unwrap();

    commands::execute(r#"send_msg("node-a", "again")"#, api.as_ref(), &registry)
        .await
        .unwrap();

    let sent = api.sent_msgs.lock().unwrap().clone();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|(p, _)| p == &prefix('a')));
}

#[tokio::test]
async fn short_prefixes_resolve_but_not_below_six_chars() {
    let api = FakeApi::new();
    let registry = registry_with_nodes();

    commands::execute(r#"reset_path("aaaaaa")"#, api.as_ref(), &registry)
        .await
        .unwrap();
    assert_eq!(api.path_resets.lock().unwrap().clone(), vec![prefix('a')]);

    let err = commands::execute(r#"reset_path("aaa")"#, api.as_ref(), &registry).await;
    assert!(err.is_err());
}

#[tokio::test]
async fn add_contact_reaches_into_the_discovered_store() {
    let api = FakeApi::new();
    let registry = registry_with_nodes();

    // 'b' is discovered-only: messaging it fails, adding it works.
    assert!(
        commands::execute(r#"send_msg("bbbbbb", "x")"#, api.as_ref(), &registry)
            .await
            .is_err()
    );
    commands::execute(r#"add_contact("bbbbbb")"#, api.as_ref(), &registry)
        .await
        .unwrap();
    assert_eq!(
        api.added_contacts.lock().unwrap().clone(),
        vec!["b".repeat(64)]
    );
}

#[tokio::test]
async fn contactless_commands_run_directly() {
    let api = FakeApi::new();
    let registry = registry_with_nodes();

    let out = commands::execute("get_battery()", api.as_ref(), &registry)
        .await
        .unwrap();
    assert!(out.contains("3900"));

    commands::execute("send_advert(True)", api.as_ref(), &registry)
        .await
        .unwrap();
    assert_eq!(api.adverts.lock().unwrap().clone(), vec![true]);

    commands::execute("reboot()", api.as_ref(), &registry)
        .await
        .unwrap();
    assert_eq!(api.reboots.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn malformed_input_is_rejected_before_any_radio_traffic() {
    let api = FakeApi::new();
    let registry = registry_with_nodes();

    for bad in [
        "reboot",
        "reboot(1+2)",
        "reboot(); send_advert(True)",
        "__import__('os')",
        "send_msg(node-a, hi)",
    ] {
        assert!(
            commands::execute(bad, api.as_ref(), &registry).await.is_err(),
            "{bad:?} should be rejected"
        );
    }
    assert!(api.sent_msgs.lock().unwrap().is_empty());
    assert_eq!(api.reboots.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert!(api.adverts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn channel_message_takes_the_channel_path() {
    let api = FakeApi::new();
    let registry = registry_with_nodes();

    commands::execute(
        r#"send_chan_msg(2, "hello, channel")"#,
        api.as_ref(),
        &registry,
    )
    .await
    .unwrap();
    assert_eq!(
        api.chan_msgs.lock().unwrap().clone(),
        vec![(2u8, "hello, channel".to_string())]
    );
}
