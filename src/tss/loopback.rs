//! Loopback protocol backend.
//!
//! Stands in for an external MPC library behind [`PartyFactory`]: parties
//! exchange one acknowledgement round so the full session choreography
//! (bus, transport, coordinator) is exercised, then derive their output
//! deterministically from the session parameters. Tests and local drills
//! run on it; production deployments plug a real library into the same
//! trait.

use crate::crypto::sha3;
use crate::tss::keygen::KeygenOutput;
use crate::tss::party::{
    OutgoingMessage, PartyFactory, PartyFailure, PartyHandle, PartyId, PartySetup,
};
use crate::tss::SignatureParts;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const RETRANSMIT_PERIOD: Duration = Duration::from_millis(500);

type FinishFn<O> = dyn Fn(&PartySetup) -> Result<O, PartyFailure> + Send + Sync;

pub struct LoopbackFactory<O> {
    finish: Arc<FinishFn<O>>,
}

impl<O: Send + 'static> LoopbackFactory<O> {
    pub fn new(
        finish: impl Fn(&PartySetup) -> Result<O, PartyFailure> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self { finish: Arc::new(finish) })
    }
}

impl<O: Send + 'static> PartyFactory for LoopbackFactory<O> {
    type Output = O;

    fn spawn(&self, setup: PartySetup) -> PartyHandle<O> {
        let (in_tx, mut in_rx) = mpsc::channel::<crate::tss::party::IncomingMessage>(64);
        let (out_tx, out_rx) = mpsc::channel(64);
        let (done_tx, done_rx) = oneshot::channel();
        let finish = self.finish.clone();

        tokio::spawn(async move {
            let round = OutgoingMessage {
                payload: setup.self_index.to_be_bytes().to_vec(),
                recipients: None,
                is_broadcast: true,
            };

            // Retransmit until every other party has acknowledged; there
            // is no bus backlog, so a late starter would otherwise miss
            // the round.
            let mut ticker = tokio::time::interval(RETRANSMIT_PERIOD);
            let mut seen: HashSet<PartyId> = HashSet::new();
            while seen.len() + 1 < setup.parties() as usize {
                tokio::select! {
                    _ = ticker.tick() => {
                        if out_tx.send(round.clone()).await.is_err() {
                            return;
                        }
                    }
                    msg = in_rx.recv() => match msg {
                        Some(msg) => {
                            seen.insert(msg.from);
                        }
                        // Pump dropped the channel: the run was cancelled.
                        None => return,
                    }
                }
            }

            // One closing retransmit: anyone we just heard from is
            // subscribed by now and must not be left waiting for us.
            let _ = out_tx.send(round).await;
            let _ = done_tx.send(finish(&setup));
        });

        PartyHandle { incoming: in_tx, outgoing: out_rx, done: done_rx }
    }
}

/// Signing backend: the signature parts are a deterministic function of
/// the digest, so every party converges on the same result.
pub fn signing() -> Arc<LoopbackFactory<SignatureParts>> {
    LoopbackFactory::new(|setup| {
        let digest = setup.message.clone().ok_or_else(|| PartyFailure {
            culprits: Vec::new(),
            reason: "signing party started without a message".into(),
        })?;
        let mut r_seed = digest.clone();
        r_seed.extend_from_slice(b"r");
        let mut s_seed = digest.clone();
        s_seed.extend_from_slice(b"s");
        Ok(SignatureParts {
            r: sha3(&r_seed).to_vec(),
            s: sha3(&s_seed).to_vec(),
            recovery: digest.last().copied().unwrap_or(0) & 1,
        })
    })
}

/// Keygen/resharing backend: the group key is a deterministic function of
/// the session id, the local share additionally of the party index.
pub fn keygen() -> Arc<LoopbackFactory<KeygenOutput>> {
    LoopbackFactory::new(|setup| {
        let mut share_seed = setup.session_id.as_bytes().to_vec();
        share_seed.extend_from_slice(&setup.self_index.to_be_bytes());
        Ok(KeygenOutput {
            public_key: sha3(setup.session_id.as_bytes()).to_vec(),
            share: sha3(&share_seed).to_vec(),
        })
    })
}

/// Backend whose protocol run always fails blaming `culprits`; drives the
/// retry and culprit-exclusion paths in tests.
pub fn failing<O: Send + 'static>(culprits: Vec<PartyId>) -> Arc<LoopbackFactory<O>> {
    LoopbackFactory::new(move |_| {
        Err(PartyFailure { culprits: culprits.clone(), reason: "scripted failure".into() })
    })
}
