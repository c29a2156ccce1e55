//! Distributed key generation. Every topology peer must participate, so
//! the process is not retryable: a failed keygen surfaces and waits for
//! the next on-chain request.

use crate::comm::Communication;
use crate::crypto::PeerId;
use crate::keyshare::KeyshareStorer;
use crate::tss::party::{drive_party, PartyFactory, PartyRoster, PartySetup};
use crate::tss::{HaltSwitch, ProcessError, ProcessStatus, TssProcess};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Session id for the ECDSA keygen requested at `block`.
pub fn keygen_session_id(block: u64) -> String {
    format!("keygen-{block}")
}

/// Session id for the FROST keygen requested at `block`.
pub fn frost_keygen_session_id(block: u64) -> String {
    format!("frost-keygen-{block}")
}

/// What the MPC library hands back from a completed keygen round set.
#[derive(Debug, Clone)]
pub struct KeygenOutput {
    pub public_key: Vec<u8>,
    pub share: Vec<u8>,
}

pub struct Keygen<F, S> {
    session_id: String,
    threshold: u16,
    peers: Vec<PeerId>,
    comm: Arc<Communication>,
    store: Arc<S>,
    factory: Arc<F>,
    halt: HaltSwitch,
}

impl<F, S> Keygen<F, S> {
    pub fn new(
        session_id: String,
        threshold: u16,
        peers: Vec<PeerId>,
        comm: Arc<Communication>,
        store: Arc<S>,
        factory: Arc<F>,
    ) -> Self {
        Self { session_id, threshold, peers, comm, store, factory, halt: HaltSwitch::new() }
    }
}

#[async_trait]
impl<F, S> TssProcess for Keygen<F, S>
where
    F: PartyFactory<Output = KeygenOutput>,
    S: KeyshareStorer,
{
    type Output = ();

    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn valid_coordinators(&self) -> Vec<PeerId> {
        self.peers.clone()
    }

    fn ready(
        &self,
        ready_peers: &HashMap<PeerId, bool>,
        _excluded: &[PeerId],
    ) -> Result<bool, ProcessError> {
        // Key generation needs the whole peer set; exclusions make no sense.
        let ready = self
            .peers
            .iter()
            .filter(|p| ready_peers.get(p).copied().unwrap_or(false))
            .count();
        Ok(ready == self.peers.len())
    }

    fn start_params(&self, _ready_peers: &HashMap<PeerId, bool>) -> Result<Vec<u8>, ProcessError> {
        Ok(Vec::new())
    }

    fn retryable(&self) -> bool {
        false
    }

    async fn run(
        self: Arc<Self>,
        ctx: CancellationToken,
        is_leader: bool,
        result_tx: mpsc::Sender<()>,
        status_tx: mpsc::Sender<ProcessStatus>,
        _params: Vec<u8>,
    ) {
        let halt = self.halt.arm();
        let roster = PartyRoster::sorted_for_session(self.peers.clone(), &self.session_id);
        let host = self.comm.host_id();
        let Some(self_index) = roster.party_of(&host) else {
            let _ = status_tx
                .send(Err(ProcessError::Message("host is not part of the topology".into())))
                .await;
            return;
        };
        info!(
            session_id = %self.session_id,
            leader = is_leader,
            parties = roster.len(),
            "keygen rounds started"
        );

        let handle = self.factory.spawn(PartySetup {
            session_id: self.session_id.clone(),
            self_index,
            peers: roster.peers().to_vec(),
            threshold: self.threshold,
            message: None,
        });

        match drive_party(&self.comm, &self.session_id, &roster, handle, &ctx, &halt).await {
            None => {}
            Some(Ok(output)) => {
                let stored = self
                    .store
                    .store_share(self.threshold, self.peers.clone(), output.public_key, output.share)
                    .await;
                if let Err(e) = stored {
                    let _ = status_tx
                        .send(Err(ProcessError::Message(format!("storing key share: {e}"))))
                        .await;
                    return;
                }
                info!(session_id = %self.session_id, "key share stored");
                let _ = result_tx.send(()).await;
                let _ = status_tx.send(Ok(())).await;
            }
            Some(Err(e)) => {
                let _ = status_tx.send(Err(e)).await;
            }
        }
    }

    fn stop(&self) {
        self.halt.halt();
    }
}
