//! Listener plumbing shared by both messengers
//!
//! Listener lists are copy-on-write: dispatch walks a snapshot, so a
//! listener may register or unregister listeners while being called.
//! Callbacks run on whichever task detected the event and must not block.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::node::Node;
use crate::protocol::Payload;

/// Receives payloads delivered to the local node
pub trait MessageListener: Send + Sync {
    fn message_received(&self, payload: &Payload, from: &Node);
}

/// Observes nodes entering and leaving the routing table
pub trait ConnectionChangeListener: Send + Sync {
    fn connection_added(&self, node: &Node);
    fn connection_removed(&self, node: &Node);
}

/// Told when a client messenger loses its connection
pub trait ErrorListener: Send + Sync {
    fn messenger_invalid(&self, reason: &str);
}

/// Copy-on-write list of shared listeners
pub struct ListenerList<L: ?Sized> {
    listeners: RwLock<Arc<Vec<Arc<L>>>>,
}

impl<L: ?Sized> ListenerList<L> {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn add(&self, listener: Arc<L>) {
        let mut guard = self.listeners.write();
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(listener);
        *guard = Arc::new(next);
    }

    /// Remove a listener by identity. Returns whether it was registered.
    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut guard = self.listeners.write();
        let before = guard.len();
        let next: Vec<Arc<L>> = guard
            .iter()
            .filter(|l| !Arc::ptr_eq(*l, listener))
            .cloned()
            .collect();
        let removed = next.len() != before;
        *guard = Arc::new(next);
        removed
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<L>>> {
        self.listeners.read().clone()
    }

    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&L),
    {
        for listener in self.snapshot().iter() {
            f(listener.as_ref());
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<L: ?Sized> Default for ListenerList<L> {
    fn default() -> Self {
        Self::new()
    }
}

/// Events forwarded to async consumers
#[derive(Debug, Clone)]
pub enum MessengerEvent {
    ConnectionAdded(Node),
    ConnectionRemoved(Node),
    MessageReceived { payload: Payload, from: Node },
    Invalid { reason: String },
}

/// Adapts listener callbacks onto an mpsc channel
pub struct EventForwarder {
    tx: mpsc::UnboundedSender<MessengerEvent>,
}

impl EventForwarder {
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<MessengerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn forward(&self, event: MessengerEvent) {
        // Receiver gone means nobody is listening anymore
        let _ = self.tx.send(event);
    }
}

impl MessageListener for EventForwarder {
    fn message_received(&self, payload: &Payload, from: &Node) {
        self.forward(MessengerEvent::MessageReceived {
            payload: payload.clone(),
            from: from.clone(),
        });
    }
}

impl ConnectionChangeListener for EventForwarder {
    fn connection_added(&self, node: &Node) {
        self.forward(MessengerEvent::ConnectionAdded(node.clone()));
    }

    fn connection_removed(&self, node: &Node) {
        self.forward(MessengerEvent::ConnectionRemoved(node.clone()));
    }
}

impl ErrorListener for EventForwarder {
    fn messenger_invalid(&self, reason: &str) {
        self.forward(MessengerEvent::Invalid {
            reason: reason.to_string(),
        });
    }
}
