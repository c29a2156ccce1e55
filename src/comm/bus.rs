//! Session bus: pub/sub over `(session id, message type)`.
//!
//! Subscriptions are exact-match only; there is no wildcard and no
//! backlog, so a subscriber never sees messages published before it
//! subscribed. Deliveries are spawned so one slow subscriber cannot stall
//! dispatch for the rest.

use crate::comm::wire::{Envelope, MessageType};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

type SubKey = (String, MessageType);

/// Handle returned by [`SessionBus::subscribe`]; needed to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId {
    id: u64,
    session_id: String,
    message_type: MessageType,
}

impl SubscriptionId {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }
}

#[derive(Default)]
struct Inner {
    by_key: HashMap<SubKey, Vec<(u64, mpsc::Sender<Envelope>)>>,
    by_id: HashMap<u64, SubKey>,
}

/// Multiplexes many concurrent sessions over the shared peer streams.
/// Holds subscription handles only; sessions own their lifecycle and
/// unsubscribe on exit.
pub struct SessionBus {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl SessionBus {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()), next_id: AtomicU64::new(1) }
    }

    pub fn subscribe(
        &self,
        session_id: &str,
        message_type: MessageType,
        channel: mpsc::Sender<Envelope>,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let key = (session_id.to_string(), message_type);
        let mut inner = self.inner.lock().unwrap();
        inner.by_key.entry(key.clone()).or_default().push((id, channel));
        inner.by_id.insert(id, key);
        trace!(session_id, %message_type, "subscribed");
        SubscriptionId { id, session_id: session_id.to_string(), message_type }
    }

    pub fn unsubscribe(&self, sub: &SubscriptionId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(key) = inner.by_id.remove(&sub.id) {
            if let Some(subs) = inner.by_key.get_mut(&key) {
                subs.retain(|(id, _)| *id != sub.id);
                if subs.is_empty() {
                    inner.by_key.remove(&key);
                }
            }
            trace!(session_id = %sub.session_id, message_type = %sub.message_type, "unsubscribed");
        }
    }

    /// Fan a message out to all matching subscribers. Each delivery runs
    /// on its own task; delivery is best-effort.
    pub fn publish(&self, envelope: Envelope) {
        let key = (envelope.session_id.clone(), envelope.message_type);
        let channels: Vec<mpsc::Sender<Envelope>> = {
            let inner = self.inner.lock().unwrap();
            match inner.by_key.get(&key) {
                Some(subs) => subs.iter().map(|(_, tx)| tx.clone()).collect(),
                None => return,
            }
        };
        for tx in channels {
            let msg = envelope.clone();
            tokio::spawn(async move {
                let _ = tx.send(msg).await;
            });
        }
    }

    /// Drop every subscription scoped to `session_id`. Streams are shared
    /// per peer and stay open. Repeated close is a no-op.
    pub fn close_session(&self, session_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let keys: Vec<SubKey> = inner
            .by_key
            .keys()
            .filter(|(session, _)| session == session_id)
            .cloned()
            .collect();
        for key in keys {
            if let Some(subs) = inner.by_key.remove(&key) {
                for (id, _) in subs {
                    inner.by_id.remove(&id);
                }
            }
        }
    }

    #[cfg(test)]
    fn subscription_count(&self) -> usize {
        self.inner.lock().unwrap().by_id.len()
    }
}

impl Default for SessionBus {
    fn default() -> Self {
        Self::new()
    }
}
