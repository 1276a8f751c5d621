//! In-process endpoint pair.
//!
//! Sending on one endpoint synchronously invokes the listeners registered on
//! its peer. Disconnecting an endpoint unlinks it from its peer and drops its
//! own listeners; the peer is left untouched.

use super::{MessageEndpoint, MessageListener};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::debug;

#[derive(Default)]
struct MemoryInner {
    peer: Mutex<Weak<MemoryInner>>,
    listeners: Mutex<Vec<MessageListener>>,
}

impl MemoryInner {
    fn deliver(&self, message: serde_json::Value) {
        // Listeners may send in turn, so never call them with the lock held.
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for listener in listeners {
            listener(message.clone());
        }
    }
}

/// One side of an in-memory channel. Clones share the same side.
#[derive(Clone, Default)]
pub struct MemoryEndpoint {
    inner: Arc<MemoryInner>,
}

impl MemoryEndpoint {
    /// Check whether this side is still linked to its peer.
    pub fn is_linked(&self) -> bool {
        self.inner
            .peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade()
            .is_some()
    }

    /// Number of listeners registered on this side.
    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn link(&self, other: &MemoryEndpoint) {
        *self.inner.peer.lock().unwrap_or_else(PoisonError::into_inner) =
            Arc::downgrade(&other.inner);
    }
}

/// Create two endpoints wired to each other.
pub fn endpoint_pair() -> (MemoryEndpoint, MemoryEndpoint) {
    let one = MemoryEndpoint::default();
    let two = MemoryEndpoint::default();

    one.link(&two);
    two.link(&one);

    (one, two)
}

impl MessageEndpoint for MemoryEndpoint {
    fn on_message(&self, listener: MessageListener) {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    fn send_message(&self, message: serde_json::Value) {
        let peer = self
            .inner
            .peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade();

        match peer {
            Some(peer) => peer.deliver(message),
            None => debug!("Dropping message sent on an unlinked memory endpoint"),
        }
    }

    fn disconnect(&self) {
        *self.inner.peer.lock().unwrap_or_else(PoisonError::into_inner) = Weak::new();
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorder(endpoint: &MemoryEndpoint) -> Arc<Mutex<Vec<serde_json::Value>>> {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        endpoint.on_message(Arc::new(move |message: serde_json::Value| {
            sink.lock().unwrap().push(message)
        }));
        received
    }

    #[test]
    fn test_messages_reach_the_peer_in_order() {
        let (one, two) = endpoint_pair();
        let received = recorder(&two);

        one.send_message(json!(1));
        one.send_message(json!({"two": 2}));

        assert_eq!(*received.lock().unwrap(), vec![json!(1), json!({"two": 2})]);
    }

    #[test]
    fn test_listeners_accumulate() {
        let (one, two) = endpoint_pair();
        let first = recorder(&two);
        let second = recorder(&two);

        one.send_message(json!("hi"));

        assert_eq!(first.lock().unwrap().len(), 1);
        assert_eq!(second.lock().unwrap().len(), 1);
        assert_eq!(two.listener_count(), 2);
    }

    #[test]
    fn test_disconnect_only_affects_one_side() {
        let (one, two) = endpoint_pair();
        let at_one = recorder(&one);
        let at_two = recorder(&two);

        two.disconnect();
        two.disconnect();

        one.send_message(json!("lost"));
        two.send_message(json!("also lost"));

        assert!(at_one.lock().unwrap().is_empty());
        assert!(at_two.lock().unwrap().is_empty());
        assert!(one.is_linked());
        assert!(!two.is_linked());
        assert_eq!(two.listener_count(), 0);
    }
}
