//! Event dispatch for inbound envelopes
//!
//! Handlers register for a (kind, channel) pair. A registration with no
//! channel only matches envelopes with no channel; kinds match exactly.
//! Every matching handler runs, and a handler that errors or panics is logged
//! without stopping the others.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{error, warn};

use crate::envelope::Envelope;
use crate::errors::FabricResult;
use crate::message::MessageKind;

// ----------------------------------------------------------------------------
// Listener Types
// ----------------------------------------------------------------------------

/// Handle returned by [`EventDispatcher::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Callback invoked with the attested sender name and the envelope
pub type Listener = Arc<dyn Fn(&str, &Envelope) -> FabricResult<()> + Send + Sync>;

struct Registration {
    id: ListenerId,
    kind: MessageKind,
    channel: Option<String>,
    listener: Listener,
}

impl Registration {
    fn matches(&self, envelope: &Envelope) -> bool {
        self.kind == envelope.kind() && self.channel.as_deref() == envelope.channel()
    }
}

// ----------------------------------------------------------------------------
// Event Dispatcher
// ----------------------------------------------------------------------------

/// Kind/channel-indexed listener table
#[derive(Default)]
pub struct EventDispatcher {
    registrations: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for a kind and optional channel
    pub fn register<F>(&self, kind: MessageKind, channel: Option<&str>, listener: F) -> ListenerId
    where
        F: Fn(&str, &Envelope) -> FabricResult<()> + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registration {
                id,
                kind,
                channel: channel.map(str::to_string),
                listener: Arc::new(listener),
            });
        id
    }

    /// Remove one listener; returns whether it existed
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut registrations = self
            .registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        registrations.len() != before
    }

    /// Remove every listener on a channel; returns how many were removed
    pub fn unregister_channel(&self, channel: &str) -> usize {
        let mut registrations = self
            .registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = registrations.len();
        registrations.retain(|r| r.channel.as_deref() != Some(channel));
        before - registrations.len()
    }

    pub fn listener_count(&self) -> usize {
        self.registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Run every matching listener; returns how many matched
    pub fn execute(&self, sender: &str, envelope: &Envelope) -> usize {
        // snapshot so listeners may (un)register without deadlocking
        let matching: Vec<(ListenerId, Listener)> = self
            .registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.matches(envelope))
            .map(|r| (r.id, Arc::clone(&r.listener)))
            .collect();

        for (id, listener) in &matching {
            match catch_unwind(AssertUnwindSafe(|| listener(sender, envelope))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    "Listener {:?} for {} from {} failed: {}",
                    id,
                    envelope.kind(),
                    sender,
                    e
                ),
                Err(_) => error!(
                    "Listener {:?} for {} from {} panicked",
                    id,
                    envelope.kind(),
                    sender
                ),
            }
        }
        matching.len()
    }
}

impl core::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FabricError;
    use std::sync::atomic::AtomicUsize;

    fn create_test_envelope(kind: MessageKind, channel: Option<&str>) -> Envelope {
        let envelope = Envelope::new(kind);
        match channel {
            Some(channel) => envelope.with_channel(channel),
            None => envelope,
        }
    }

    fn counter(dispatcher: &EventDispatcher, kind: MessageKind, channel: Option<&str>) -> Arc<AtomicUsize> {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        dispatcher.register(kind, channel, move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        hits
    }

    #[test]
    fn test_channel_match_is_exact_or_both_none() {
        let dispatcher = EventDispatcher::new();
        let plain = counter(&dispatcher, MessageKind::Api, None);
        let shop = counter(&dispatcher, MessageKind::Api, Some("shop:buy"));

        dispatcher.execute("lobby", &create_test_envelope(MessageKind::Api, None));
        dispatcher.execute("lobby", &create_test_envelope(MessageKind::Api, Some("shop:buy")));
        dispatcher.execute("lobby", &create_test_envelope(MessageKind::Api, Some("shop:sell")));
        dispatcher.execute("lobby", &create_test_envelope(MessageKind::Command, None));

        assert_eq!(plain.load(Ordering::SeqCst), 1);
        assert_eq!(shop.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_listeners_do_not_stop_dispatch() {
        let dispatcher = EventDispatcher::new();
        dispatcher.register(MessageKind::Command, None, |_, _| {
            Err(FabricError::handler_error("boom"))
        });
        dispatcher.register(MessageKind::Command, None, |_, _| panic!("listener panic"));
        let survivor = counter(&dispatcher, MessageKind::Command, None);

        let matched = dispatcher.execute("proxy", &create_test_envelope(MessageKind::Command, None));
        assert_eq!(matched, 3);
        assert_eq!(survivor.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sender_is_passed_through() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(std::sync::Mutex::new(String::new()));
        let sink = seen.clone();
        dispatcher.register(MessageKind::ChatMessage, None, move |sender, _| {
            *sink.lock().unwrap() = sender.to_string();
            Ok(())
        });
        dispatcher.execute("games", &create_test_envelope(MessageKind::ChatMessage, None));
        assert_eq!(*seen.lock().unwrap(), "games");
    }

    #[test]
    fn test_unregister() {
        let dispatcher = EventDispatcher::new();
        let id = dispatcher.register(MessageKind::Ping, None, |_, _| Ok(()));
        dispatcher.register(MessageKind::PeerAuth, Some("peer-auth:x"), |_, _| Ok(()));
        dispatcher.register(MessageKind::Api, Some("peer-auth:x"), |_, _| Ok(()));

        assert!(dispatcher.unregister(id));
        assert!(!dispatcher.unregister(id));
        assert_eq!(dispatcher.unregister_channel("peer-auth:x"), 2);
        assert_eq!(dispatcher.listener_count(), 0);
    }
}
