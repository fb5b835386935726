//! Typed event keys and the listener callback registry.
//!
//! Listener registrations survive reconnects; dispatch iterates a snapshot
//! copy so a listener may add or remove callbacks mid-dispatch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::channel::proto::InboundFrame;

/// Key a listener is registered under.
///
/// A composite [`ChannelEvent`](EventKey::ChannelEvent) key cannot be
/// confused with a bare event name, unlike string-concatenation keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKey {
    /// Transport successfully opened.
    Connect,
    /// Transport-level error.
    Error,
    /// Any inbound event with this name, regardless of topic.
    Event(String),
    /// An event scoped to a single topic.
    ChannelEvent { topic: String, event: String },
}

/// Event delivered to registered listeners.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Transport opened; fired once per successful connect.
    Connected,
    /// Transport-level error. The close path, not this event, tears the
    /// connection down.
    TransportError { message: String },
    /// Server-pushed frame.
    Push { frame: InboundFrame },
}

/// Listener callback. Held by `Arc` so removal can match on identity.
pub type EventCallback = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

/// Ordered listener lists keyed by [`EventKey`].
#[derive(Default)]
pub struct CallbackRegistry {
    entries: Mutex<HashMap<EventKey, Vec<EventCallback>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a listener under `key`. Duplicates are allowed and insertion
    /// order is preserved.
    pub fn add(&self, key: EventKey, callback: EventCallback) {
        self.entries().entry(key).or_default().push(callback);
    }

    /// Removes listeners under `key`.
    ///
    /// With a callback, only entries that are the same `Arc` are removed;
    /// without one, the whole key is cleared.
    pub fn remove(&self, key: &EventKey, callback: Option<&EventCallback>) {
        let mut entries = self.entries();
        match callback {
            Some(target) => {
                if let Some(listeners) = entries.get_mut(key) {
                    listeners.retain(|listener| !Arc::ptr_eq(listener, target));
                    if listeners.is_empty() {
                        entries.remove(key);
                    }
                }
            }
            None => {
                entries.remove(key);
            }
        }
    }

    /// Invokes every listener registered under `key` with `event`.
    ///
    /// Listeners run outside the registry lock, against a snapshot of the
    /// list taken at dispatch time.
    pub fn dispatch(&self, key: &EventKey, event: &ClientEvent) {
        let listeners: Vec<EventCallback> =
            self.entries().get(key).cloned().unwrap_or_default();
        for listener in listeners {
            listener(event);
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<EventKey, Vec<EventCallback>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
