//! Many-to-many subscriber registry.
//!
//! Maps subscriber names (rule names from the document) to live inboxes.
//! Coordinators publish through [`SubscriberRegistry::dispatch`]; downstream
//! consumers attach with [`SubscriberRegistry::subscribe`] or register an
//! existing sender. Entries for closed inboxes are pruned on dispatch.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;
use tracing::trace;

use crate::envelope::Envelope;

/// Message delivered to subscribers: a tag plus the normalized envelope
#[derive(Debug, Clone)]
pub enum SubscriberMessage {
    MonitorData(Arc<Envelope>),
    MonitorError(Arc<Envelope>),
}

impl SubscriberMessage {
    pub fn envelope(&self) -> &Envelope {
        match self {
            SubscriberMessage::MonitorData(envelope) => envelope,
            SubscriberMessage::MonitorError(envelope) => envelope,
        }
    }
}

pub type SubscriberSender = mpsc::UnboundedSender<SubscriberMessage>;
pub type SubscriberReceiver = mpsc::UnboundedReceiver<SubscriberMessage>;

/// Process-wide index from subscriber name to live inboxes
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    entries: RwLock<HashMap<String, Vec<SubscriberSender>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an inbox under `name`. Idempotent per (name, inbox) pair;
    /// distinct inboxes may share a name.
    pub fn register(&self, name: &str, sender: SubscriberSender) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let inboxes = entries.entry(name.to_string()).or_default();
        if !inboxes.iter().any(|existing| existing.same_channel(&sender)) {
            inboxes.push(sender);
        }
    }

    /// Create a fresh inbox, register it under `name`, and hand back the
    /// receiving half.
    pub fn subscribe(&self, name: &str) -> SubscriberReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.register(name, tx);
        rx
    }

    /// Send `message` to every inbox registered under `name`.
    ///
    /// Best-effort and non-blocking: closed inboxes are dropped from the
    /// index, and a name with no subscribers is silently ignored.
    pub fn dispatch(&self, name: &str, message: &SubscriberMessage) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let Some(inboxes) = entries.get_mut(name) else {
            trace!(subscriber = name, "No inboxes registered, dropping message");
            return;
        };

        inboxes.retain(|inbox| inbox.send(message.clone()).is_ok());
        if inboxes.is_empty() {
            entries.remove(name);
        }
    }

    /// Number of live inboxes currently registered under `name`
    pub fn subscriber_count(&self, name: &str) -> usize {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(name).map(|inboxes| inboxes.len()).unwrap_or(0)
    }
}
