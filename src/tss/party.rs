//! Boundary to the black-box MPC library.
//!
//! A party is one participant of a threshold protocol run. The library
//! behind [`PartyFactory`] consumes opaque inbound wire bytes, emits
//! opaque outbound ones and eventually produces an output or blames
//! culprits. [`drive_party`] is the adapter pump: it relays session-bus
//! traffic into the party and party output back onto the peer streams,
//! translating between party indices and peer ids through the roster
//! established at session start.

use crate::comm::wire::MessageType;
use crate::comm::Communication;
use crate::crypto::{sha3, PeerId};
use crate::tss::message::{marshal_tss_message, unmarshal_tss_message};
use crate::tss::ProcessError;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Index of a party within one session's roster.
pub type PartyId = u16;

/// Protocol-level failure reported by the library, blaming party indices.
#[derive(Error, Debug, Clone)]
#[error("party failure: {reason}")]
pub struct PartyFailure {
    pub culprits: Vec<PartyId>,
    pub reason: String,
}

/// Outbound round message from the local party.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub payload: Vec<u8>,
    /// `None` targets every other party in the roster.
    pub recipients: Option<Vec<PartyId>>,
    pub is_broadcast: bool,
}

/// Inbound round message fed into the local party.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub from: PartyId,
    pub payload: Vec<u8>,
    pub is_broadcast: bool,
}

/// Channels of a spawned party task.
pub struct PartyHandle<O> {
    pub incoming: mpsc::Sender<IncomingMessage>,
    pub outgoing: mpsc::Receiver<OutgoingMessage>,
    pub done: oneshot::Receiver<Result<O, PartyFailure>>,
}

/// Everything the library needs to instantiate one party.
#[derive(Debug, Clone)]
pub struct PartySetup {
    pub session_id: String,
    pub self_index: PartyId,
    /// Roster peers in party-index order; `peers[self_index]` is us.
    pub peers: Vec<PeerId>,
    pub threshold: u16,
    /// The 32-byte digest to sign; `None` for keygen and resharing.
    pub message: Option<Vec<u8>>,
}

impl PartySetup {
    pub fn parties(&self) -> u16 {
        self.peers.len() as u16
    }
}

/// Constructor for parties of one protocol kind.
pub trait PartyFactory: Send + Sync + 'static {
    type Output: Send + 'static;

    fn spawn(&self, setup: PartySetup) -> PartyHandle<Self::Output>;
}

/// The party↔peer bijection of one session. Peers are shuffled
/// deterministically by hashing each id together with the session id, so
/// every relayer derives the same ordering without coordination.
#[derive(Debug, Clone)]
pub struct PartyRoster {
    peers: Vec<PeerId>,
}

impl PartyRoster {
    pub fn sorted_for_session(mut peers: Vec<PeerId>, session_id: &str) -> Self {
        peers.sort();
        peers.dedup();
        peers.sort_by_key(|peer| {
            let mut seed = peer.as_bytes().to_vec();
            seed.extend_from_slice(session_id.as_bytes());
            sha3(&seed)
        });
        Self { peers }
    }

    pub fn party_of(&self, peer: &PeerId) -> Option<PartyId> {
        self.peers.iter().position(|p| p == peer).map(|i| i as PartyId)
    }

    pub fn peer_of(&self, party: PartyId) -> Option<PeerId> {
        self.peers.get(party as usize).copied()
    }

    pub fn peers_of(&self, parties: &[PartyId]) -> Vec<PeerId> {
        parties.iter().filter_map(|p| self.peer_of(*p)).collect()
    }

    pub fn peers(&self) -> &[PeerId] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Relay bus traffic and party output until the party finishes, fails, or
/// the run is cancelled. Returns `None` on cancellation.
pub async fn drive_party<O: Send + 'static>(
    comm: &Arc<Communication>,
    session_id: &str,
    roster: &PartyRoster,
    mut handle: PartyHandle<O>,
    ctx: &CancellationToken,
    halt: &CancellationToken,
) -> Option<Result<O, ProcessError>> {
    let (in_tx, mut in_rx) = mpsc::channel(64);
    let sub = comm.subscribe(session_id, MessageType::TssData, in_tx);
    let (comm_err_tx, mut comm_err_rx) = mpsc::channel(16);

    let outcome = loop {
        tokio::select! {
            // Flush outbound rounds before honouring completion, so a
            // party's closing message reaches slower peers.
            biased;
            Some(envelope) = in_rx.recv() => {
                let msg = match unmarshal_tss_message(&envelope.payload) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(session_id, from = %envelope.from, "dropping malformed round message: {e}");
                        continue;
                    }
                };
                // Senders outside the roster were not selected into this
                // run; their traffic is stale.
                let Some(from) = roster.party_of(&envelope.from) else { continue };
                let _ = handle
                    .incoming
                    .send(IncomingMessage { from, payload: msg.msg_bytes, is_broadcast: msg.is_broadcast })
                    .await;
            }
            Some(out) = handle.outgoing.recv() => {
                let wire = match marshal_tss_message(&out.payload, out.is_broadcast) {
                    Ok(wire) => wire,
                    Err(e) => break Some(Err(ProcessError::Message(e.to_string()))),
                };
                let peers = match &out.recipients {
                    Some(parties) => roster.peers_of(parties),
                    None => roster.peers().to_vec(),
                };
                comm.broadcast(&peers, wire, MessageType::TssData, session_id, Some(comm_err_tx.clone()));
            }
            Some(err) = comm_err_rx.recv() => {
                break Some(Err(ProcessError::Communication(err)));
            }
            done = &mut handle.done => {
                break Some(match done {
                    Ok(Ok(output)) => Ok(output),
                    Ok(Err(failure)) => Err(ProcessError::Protocol {
                        culprits: roster.peers_of(&failure.culprits),
                        reason: failure.reason,
                    }),
                    Err(_) => Err(ProcessError::Message("party task dropped its result".into())),
                });
            }
            _ = ctx.cancelled() => break None,
            _ = halt.cancelled() => break None,
        }
    };

    comm.unsubscribe(&sub);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    fn peers(n: u8) -> Vec<PeerId> {
        (1..=n).map(|i| Keypair::from_secret_bytes([i; 32]).peer_id()).collect()
    }

    #[test]
    fn roster_is_a_bijection() {
        let roster = PartyRoster::sorted_for_session(peers(4), "signing-xyz");
        for (i, peer) in roster.peers().to_vec().into_iter().enumerate() {
            assert_eq!(roster.party_of(&peer), Some(i as PartyId));
            assert_eq!(roster.peer_of(i as PartyId), Some(peer));
        }
        assert_eq!(roster.peer_of(4), None);
    }

    #[test]
    fn roster_order_is_session_dependent_but_deterministic() {
        let a = PartyRoster::sorted_for_session(peers(6), "signing-a");
        let b = PartyRoster::sorted_for_session(peers(6), "signing-a");
        assert_eq!(a.peers(), b.peers());

        let shuffled = {
            let mut p = peers(6);
            p.reverse();
            PartyRoster::sorted_for_session(p, "signing-a")
        };
        // Input order must not matter.
        assert_eq!(a.peers(), shuffled.peers());
    }
}
