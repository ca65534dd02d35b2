//! Typed event dispatch.
//!
//! Subscriptions are keyed by [`EventKind`] (or `None` for a catch-all) plus
//! an optional attribute filter, and a single dispatch loop fans incoming
//! events out to every matching subscriber. Dead subscribers are pruned on
//! the next dispatch; dropping an [`EventStream`] unsubscribes it.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::mpsc;

use super::{Event, EventKind};

/// Attribute predicate applied after the kind match.
///
/// An empty filter matches every event of the subscribed kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub pubkey_prefix: Option<String>,
    pub channel_idx: Option<u8>,
}

impl EventFilter {
    /// Matches everything.
    pub fn any() -> Self {
        Self::default()
    }

    /// Matches events carrying the given pubkey prefix.
    pub fn for_prefix(prefix: &str) -> Self {
        Self {
            pubkey_prefix: Some(prefix.to_string()),
            channel_idx: None,
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref want) = self.pubkey_prefix {
            // Prefix lengths vary between config (12 chars) and the wire
            // (6 bytes = 12 hex, but some pushes carry fewer); accept
            // containment in either direction.
            match event.pubkey_prefix() {
                Some(have) => {
                    if !(have.starts_with(want.as_str()) || want.starts_with(have)) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        if let Some(want_idx) = self.channel_idx {
            if event.channel_idx() != Some(want_idx) {
                return false;
            }
        }
        true
    }
}

struct Subscription {
    id: u64,
    kind: Option<EventKind>,
    filter: EventFilter,
    tx: mpsc::UnboundedSender<Event>,
}

#[derive(Default)]
struct DispatchState {
    next_id: u64,
    subs: Vec<Subscription>,
}

/// Fan-out hub for radio events. Cheap to clone; clones share subscribers.
#[derive(Clone, Default)]
pub struct Dispatcher {
    state: Arc<Mutex<DispatchState>>,
}

/// Receiving end of a subscription. Unsubscribes itself when dropped.
pub struct EventStream {
    id: u64,
    rx: mpsc::UnboundedReceiver<Event>,
    state: Weak<Mutex<DispatchState>>,
}

impl EventStream {
    /// Next matching event, or `None` once the dispatcher is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            if let Ok(mut guard) = state.lock() {
                guard.subs.retain(|s| s.id != self.id);
            }
        }
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription. `kind: None` is the catch-all registration.
    pub fn subscribe(&self, kind: Option<EventKind>, filter: EventFilter) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut guard = self.state.lock().expect("dispatcher mutex poisoned");
        guard.next_id += 1;
        let id = guard.next_id;
        guard.subs.push(Subscription {
            id,
            kind,
            filter,
            tx,
        });
        EventStream {
            id,
            rx,
            state: Arc::downgrade(&self.state),
        }
    }

    /// Deliver one event to every matching subscriber.
    pub fn dispatch(&self, event: &Event) {
        let mut guard = self.state.lock().expect("dispatcher mutex poisoned");
        let kind = event.kind();
        guard.subs.retain(|sub| {
            let kind_match = sub.kind.map(|k| k == kind).unwrap_or(true);
            if kind_match && sub.filter.matches(event) {
                // A failed send means the stream was dropped without running
                // its destructor yet; prune it here.
                sub.tx.send(event.clone()).is_ok()
            } else {
                true
            }
        });
    }

    /// One-shot wait for the next event of `kind` passing `filter`.
    ///
    /// Returns `None` on timeout; the temporary subscription is removed
    /// either way.
    pub async fn wait_for(
        &self,
        kind: EventKind,
        filter: EventFilter,
        timeout: Duration,
    ) -> Option<Event> {
        let mut stream = self.subscribe(Some(kind), filter);
        match tokio::time::timeout(timeout, stream.recv()).await {
            Ok(event) => event,
            Err(_) => None,
        }
    }

    /// Number of live subscriptions, for diagnostics.
    pub fn subscription_count(&self) -> usize {
        self.state
            .lock()
            .expect("dispatcher mutex poisoned")
            .subs
            .len()
    }
}
