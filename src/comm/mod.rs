//! Session communication fabric: typed pub/sub over authenticated peer
//! streams.

pub mod bus;
pub mod elector;
pub mod health;
pub mod secure;
pub mod transport;
pub mod wire;

pub use bus::{SessionBus, SubscriptionId};
pub use elector::{
    BullyConfig, CoordinatorElector, CoordinatorElectorFactory, ElectorKind, StaticElector,
};
pub use transport::PeerTransport;
pub use wire::{Envelope, MessageType};

use crate::crypto::PeerId;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A send toward one peer failed; tagged so higher layers can mark
/// culprits.
#[derive(Error, Debug, Clone)]
#[error("communication with peer {peer} failed: {reason}")]
pub struct CommunicationError {
    pub peer: PeerId,
    pub reason: String,
}

impl CommunicationError {
    pub fn new(peer: PeerId, reason: String) -> Self {
        Self { peer, reason }
    }
}

/// Facade tying the peer transport and the session bus together; the one
/// handle sessions talk through.
pub struct Communication {
    transport: Arc<PeerTransport>,
    bus: Arc<SessionBus>,
}

impl Communication {
    pub fn new(transport: Arc<PeerTransport>, bus: Arc<SessionBus>) -> Arc<Self> {
        Arc::new(Self { transport, bus })
    }

    pub fn host_id(&self) -> PeerId {
        self.transport.host_id()
    }

    /// All peers of the current topology, self included.
    pub fn peers(&self) -> Vec<PeerId> {
        self.transport.topology().peer_ids()
    }

    pub fn topology(&self) -> crate::topology::NetworkTopology {
        self.transport.topology()
    }

    /// Swap in a refreshed topology (resharing path).
    pub fn set_topology(&self, topology: crate::topology::NetworkTopology) {
        self.transport.set_topology(topology)
    }

    /// Fire-and-forget fan-out of one message to `peers` (self is
    /// skipped). Per-peer failures are reported on `err_tx` when supplied,
    /// otherwise logged.
    pub fn broadcast(
        self: &Arc<Self>,
        peers: &[PeerId],
        payload: Vec<u8>,
        message_type: MessageType,
        session_id: &str,
        err_tx: Option<mpsc::Sender<CommunicationError>>,
    ) {
        let host_id = self.host_id();
        let envelope = Envelope::new(message_type, session_id, payload, host_id);
        debug!(session_id, %message_type, "broadcasting message");
        for peer in peers.iter().copied().filter(|p| *p != host_id) {
            let transport = self.transport.clone();
            let envelope = envelope.clone();
            let err_tx = err_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.send(peer, &envelope).await {
                    warn!(%peer, "broadcast send failed: {e}");
                    if let Some(tx) = err_tx {
                        let _ = tx.send(e).await;
                    }
                }
            });
        }
    }

    pub fn subscribe(
        &self,
        session_id: &str,
        message_type: MessageType,
        channel: mpsc::Sender<Envelope>,
    ) -> SubscriptionId {
        self.bus.subscribe(session_id, message_type, channel)
    }

    pub fn unsubscribe(&self, sub: &SubscriptionId) {
        self.bus.unsubscribe(sub)
    }

    pub fn close_session(&self, session_id: &str) {
        self.bus.close_session(session_id)
    }
}
