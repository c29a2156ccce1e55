//! Key resharing after a topology refresh. The store is held exclusively
//! while the rounds run so no signing session reads a share that is about
//! to be replaced.

use crate::comm::Communication;
use crate::crypto::PeerId;
use crate::keyshare::{EcdsaKeyshare, EcdsaKeyshareStore};
use crate::tss::keygen::KeygenOutput;
use crate::tss::party::{drive_party, PartyFactory, PartyRoster, PartySetup};
use crate::tss::{HaltSwitch, ProcessError, ProcessStatus, TssProcess};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Session id for the resharing triggered at `block`.
pub fn resharing_session_id(block: u64) -> String {
    format!("resharing-{block}")
}

pub struct Resharing<F> {
    session_id: String,
    threshold: u16,
    peers: Vec<PeerId>,
    comm: Arc<Communication>,
    store: Arc<EcdsaKeyshareStore>,
    factory: Arc<F>,
    halt: HaltSwitch,
}

impl<F> Resharing<F> {
    /// `peers` and `threshold` come from the refreshed topology.
    pub fn new(
        session_id: String,
        threshold: u16,
        peers: Vec<PeerId>,
        comm: Arc<Communication>,
        store: Arc<EcdsaKeyshareStore>,
        factory: Arc<F>,
    ) -> Self {
        Self { session_id, threshold, peers, comm, store, factory, halt: HaltSwitch::new() }
    }
}

#[async_trait]
impl<F: PartyFactory<Output = KeygenOutput>> TssProcess for Resharing<F> {
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
                .send(Err(ProcessError::Message("host is not part of the new topology".into())))
                .await;
            return;
        };
        info!(
            session_id = %self.session_id,
            leader = is_leader,
            parties = roster.len(),
            "resharing rounds started"
        );

        let guard = self.store.lock_exclusive().await;
        let handle = self.factory.spawn(PartySetup {
            session_id: self.session_id.clone(),
            self_index,
            peers: roster.peers().to_vec(),
            threshold: self.threshold,
            message: None,
        });

        let outcome = drive_party(&self.comm, &self.session_id, &roster, handle, &ctx, &halt).await;
        // The store's own locking takes over for the final write.
        drop(guard);

        match outcome {
            None => {}
            Some(Ok(output)) => {
                let keyshare = EcdsaKeyshare {
                    threshold: self.threshold,
                    peers: self.peers.clone(),
                    public_key: output.public_key,
                    share: output.share,
                };
                if let Err(e) = self.store.store(&keyshare).await {
                    let _ = status_tx
                        .send(Err(ProcessError::Message(format!("storing reshared key: {e}"))))
                        .await;
                    return;
                }
                info!(session_id = %self.session_id, "reshared key share stored");
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
