//! Peer transport: authenticated streams keyed by peer id.
//!
//! A stream toward a peer is dialled lazily on the first send and kept
//! open afterwards; sessions share it. A read or write error discards the
//! stream, and the next send re-dials. Inbound frames are decoded, stamped
//! with the stream's verified peer id and handed to the session bus.

use crate::comm::bus::SessionBus;
use crate::comm::secure::SecureStream;
use crate::comm::wire::{self, Envelope};
use crate::comm::CommunicationError;
use crate::crypto::{Keypair, PeerId};
use crate::topology::NetworkTopology;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Dial + handshake budget for one connection attempt.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound frames buffered per peer before senders start waiting.
const WRITER_QUEUE: usize = 64;

pub struct PeerTransport {
    keypair: Arc<Keypair>,
    topology: RwLock<NetworkTopology>,
    bus: Arc<SessionBus>,
    writers: Mutex<HashMap<PeerId, mpsc::Sender<Vec<u8>>>>,
    host_id: PeerId,
    shutdown: CancellationToken,
}

impl PeerTransport {
    pub fn new(
        keypair: Arc<Keypair>,
        topology: NetworkTopology,
        bus: Arc<SessionBus>,
    ) -> Arc<Self> {
        let host_id = keypair.peer_id();
        Arc::new(Self {
            keypair,
            topology: RwLock::new(topology),
            bus,
            writers: Mutex::new(HashMap::new()),
            host_id,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn host_id(&self) -> PeerId {
        self.host_id
    }

    pub fn topology(&self) -> NetworkTopology {
        self.topology.read().unwrap().clone()
    }

    /// Swap in a refreshed topology (resharing path).
    pub fn set_topology(&self, topology: NetworkTopology) {
        *self.topology.write().unwrap() = topology;
    }

    /// Bind the listen port and start accepting peer streams.
    pub async fn start(self: &Arc<Self>, port: u16) -> std::io::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!(port, peer = %self.host_id, "transport listening");
        let transport = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            let transport = transport.clone();
                            tokio::spawn(async move {
                                if let Err(e) = transport.handle_inbound(stream, addr).await {
                                    debug!(%addr, "inbound stream ended: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            warn!("accept failed: {e}");
                        }
                    },
                    _ = transport.shutdown.cancelled() => break,
                }
            }
        });
        Ok(())
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Send one envelope to `peer`, dialling if no stream is open. Errors
    /// are tagged with the peer id so callers can attribute culprits.
    pub async fn send(&self, peer: PeerId, envelope: &Envelope) -> Result<(), CommunicationError> {
        let bytes = wire::encode(envelope)
            .map_err(|e| CommunicationError::new(peer, format!("encode: {e}")))?;

        let existing = { self.writers.lock().await.get(&peer).cloned() };
        if let Some(tx) = existing {
            if tx.send(bytes.clone()).await.is_ok() {
                return Ok(());
            }
            // Writer task died; fall through and re-dial.
            self.writers.lock().await.remove(&peer);
        }

        let tx = self.dial(peer).await?;
        tx.send(bytes)
            .await
            .map_err(|_| CommunicationError::new(peer, "stream closed while sending".into()))
    }

    async fn dial(&self, peer: PeerId) -> Result<mpsc::Sender<Vec<u8>>, CommunicationError> {
        let info = self
            .topology
            .read()
            .unwrap()
            .peer(&peer)
            .cloned()
            .ok_or_else(|| CommunicationError::new(peer, "peer not in topology".into()))?;

        let addr = resolve(&info.address)
            .await
            .map_err(|e| CommunicationError::new(peer, format!("resolve {}: {e}", info.address)))?;

        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| CommunicationError::new(peer, format!("dial {addr}: timed out")))?
            .map_err(|e| CommunicationError::new(peer, format!("dial {addr}: {e}")))?;

        let secured =
            tokio::time::timeout(DIAL_TIMEOUT, SecureStream::connect(stream, &self.keypair, &info.x25519_key()))
                .await
                .map_err(|_| CommunicationError::new(peer, "handshake timed out".into()))?
                .map_err(|e| CommunicationError::new(peer, format!("handshake: {e}")))?;

        debug!(%peer, %addr, "dialled peer stream");
        let (mut reader, mut writer) = secured.into_split();
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(WRITER_QUEUE);
        self.writers.lock().await.insert(peer, tx.clone());

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = writer.send(&frame).await {
                    debug!(%peer, "peer stream write failed: {e}");
                    break;
                }
            }
        });

        // The dialled stream is write-oriented, but draining the read half
        // detects closure and keeps replies usable.
        let bus = self.bus.clone();
        tokio::spawn(async move {
            loop {
                match reader.recv().await {
                    Ok(frame) => publish_frame(&bus, &frame, peer),
                    Err(_) => break,
                }
            }
        });

        Ok(tx)
    }

    async fn handle_inbound(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), CommunicationError> {
        let topology = self.topology.read().unwrap().clone();
        let secured = tokio::time::timeout(
            DIAL_TIMEOUT,
            SecureStream::accept(stream, &self.keypair, |key| topology.peer_by_key(key).is_some()),
        )
        .await
        .map_err(|_| CommunicationError::new(self.host_id, format!("{addr}: handshake timed out")))?
        .map_err(|e| CommunicationError::new(self.host_id, format!("{addr}: {e}")))?;

        let remote_key = secured.remote_public();
        let peer = topology
            .peer_by_key(&remote_key)
            .map(|p| p.id)
            .ok_or_else(|| CommunicationError::new(self.host_id, "peer vanished from topology".into()))?;
        debug!(%peer, %addr, "accepted peer stream");

        let (mut reader, _writer) = secured.into_split();
        loop {
            let frame = reader
                .recv()
                .await
                .map_err(|e| CommunicationError::new(peer, format!("read: {e}")))?;
            publish_frame(&self.bus, &frame, peer);
        }
    }
}

fn publish_frame(bus: &SessionBus, frame: &[u8], verified_peer: PeerId) {
    match wire::decode(frame) {
        Ok(mut envelope) => {
            // The authenticated stream decides who this is from.
            envelope.from = verified_peer;
            bus.publish(envelope);
        }
        Err(e) => {
            warn!(%verified_peer, "dropping undecodable frame: {e}");
        }
    }
}

/// Resolve `host:port` through the runtime resolver; DNS names allowed.
async fn resolve(address: &str) -> std::io::Result<SocketAddr> {
    tokio::net::lookup_host(address).await?.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, format!("{address}: no addresses"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_literal_addresses() {
        let addr = resolve("127.0.0.1:9000").await.unwrap();
        assert_eq!(addr.port(), 9000);
    }

    #[tokio::test]
    async fn resolves_localhost() {
        let addr = resolve("localhost:9100").await.unwrap();
        assert_eq!(addr.port(), 9100);
    }
}
