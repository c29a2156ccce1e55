//! Leader election for signing sessions.
//!
//! Two strategies. The static elector is deterministic and silent: every
//! relayer computes the same leader from the sorted candidate set and the
//! session id. The bully elector runs a classic bully round over the peer
//! streams and is used on retry, so a failed leader can be displaced.
//! Priority follows peer id order: the smallest id outranks everyone.

use crate::comm::wire::MessageType;
use crate::comm::{Communication, Envelope};
use crate::crypto::{sha3, PeerId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ElectorError {
    #[error("no election candidates")]
    NoCandidates,
    #[error("no coordinator selected within {0:?}")]
    Timeout(Duration),
    #[error("election cancelled")]
    Cancelled,
}

/// Bully round timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BullyConfig {
    /// How long to wait for an `alive` reply after challenging.
    #[serde(default = "default_election_wait")]
    pub election_wait_time: Duration,
    /// Overall budget for one election.
    #[serde(default = "default_bully_wait")]
    pub bully_wait_time: Duration,
    /// How long to wait for the winner's announcement before re-electing.
    #[serde(default = "default_select_wait")]
    pub select_wait_time: Duration,
}

fn default_election_wait() -> Duration {
    Duration::from_secs(2)
}

fn default_bully_wait() -> Duration {
    Duration::from_secs(3 * 60)
}

fn default_select_wait() -> Duration {
    Duration::from_secs(4)
}

impl Default for BullyConfig {
    fn default() -> Self {
        Self {
            election_wait_time: default_election_wait(),
            bully_wait_time: default_bully_wait(),
            select_wait_time: default_select_wait(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectorKind {
    Static,
    Bully,
}

pub struct CoordinatorElectorFactory {
    comm: Arc<Communication>,
    config: BullyConfig,
}

impl CoordinatorElectorFactory {
    pub fn new(comm: Arc<Communication>, config: BullyConfig) -> Self {
        Self { comm, config }
    }

    pub fn elector(&self, session_id: &str, kind: ElectorKind) -> CoordinatorElector {
        match kind {
            ElectorKind::Static => CoordinatorElector::Static(StaticElector {
                session_id: session_id.to_string(),
            }),
            ElectorKind::Bully => CoordinatorElector::Bully(BullyElector {
                comm: self.comm.clone(),
                session_id: session_id.to_string(),
                config: self.config.clone(),
            }),
        }
    }
}

pub enum CoordinatorElector {
    Static(StaticElector),
    Bully(BullyElector),
}

impl CoordinatorElector {
    pub async fn coordinator(
        &self,
        ctx: &CancellationToken,
        candidates: &[PeerId],
    ) -> Result<PeerId, ElectorError> {
        match self {
            CoordinatorElector::Static(e) => e.coordinator(candidates),
            CoordinatorElector::Bully(e) => e.coordinator(ctx, candidates).await,
        }
    }
}

/// Deterministic, zero-message election:
/// `sorted(candidates)[hash(session_id) mod n]`.
pub struct StaticElector {
    session_id: String,
}

impl StaticElector {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self { session_id: session_id.into() }
    }

    pub fn coordinator(&self, candidates: &[PeerId]) -> Result<PeerId, ElectorError> {
        if candidates.is_empty() {
            return Err(ElectorError::NoCandidates);
        }
        let mut sorted = candidates.to_vec();
        sorted.sort();
        sorted.dedup();
        let digest = sha3(self.session_id.as_bytes());
        let index = u64::from_be_bytes(digest[..8].try_into().unwrap()) % sorted.len() as u64;
        Ok(sorted[index as usize])
    }
}

/// Bully election over the session streams. Peers challenge everyone that
/// outranks them; silence means the challenger wins and announces itself.
pub struct BullyElector {
    comm: Arc<Communication>,
    session_id: String,
    config: BullyConfig,
}

impl BullyElector {
    pub async fn coordinator(
        &self,
        ctx: &CancellationToken,
        candidates: &[PeerId],
    ) -> Result<PeerId, ElectorError> {
        if candidates.is_empty() {
            return Err(ElectorError::NoCandidates);
        }
        let mut candidates = candidates.to_vec();
        candidates.sort();
        candidates.dedup();
        let host = self.comm.host_id();

        let (election_tx, mut election_rx) = mpsc::channel::<Envelope>(16);
        let (alive_tx, mut alive_rx) = mpsc::channel::<Envelope>(16);
        let (selected_tx, mut selected_rx) = mpsc::channel::<Envelope>(16);
        let election_sub = self.comm.subscribe(&self.session_id, MessageType::Election, election_tx);
        let alive_sub = self.comm.subscribe(&self.session_id, MessageType::Alive, alive_tx);
        let selected_sub = self.comm.subscribe(&self.session_id, MessageType::Selected, selected_tx);

        let result = self
            .run(ctx, host, &candidates, &mut election_rx, &mut alive_rx, &mut selected_rx)
            .await;

        if matches!(&result, Ok(leader) if *leader == host) {
            // Late challengers must converge on this outcome; keep
            // answering them for one bully window before releasing the
            // subscriptions.
            let comm = self.comm.clone();
            let session_id = self.session_id.clone();
            let window = self.config.bully_wait_time;
            tokio::spawn(async move {
                let deadline = tokio::time::sleep(window);
                tokio::pin!(deadline);
                loop {
                    tokio::select! {
                        Some(msg) = election_rx.recv() => {
                            comm.broadcast(&[msg.from], Vec::new(), MessageType::Alive, &session_id, None);
                            comm.broadcast(&[msg.from], Vec::new(), MessageType::Selected, &session_id, None);
                        }
                        _ = &mut deadline => break,
                    }
                }
                comm.unsubscribe(&election_sub);
                comm.unsubscribe(&alive_sub);
                comm.unsubscribe(&selected_sub);
            });
            return result;
        }

        self.comm.unsubscribe(&election_sub);
        self.comm.unsubscribe(&alive_sub);
        self.comm.unsubscribe(&selected_sub);
        result
    }

    async fn run(
        &self,
        ctx: &CancellationToken,
        host: PeerId,
        candidates: &[PeerId],
        election_rx: &mut mpsc::Receiver<Envelope>,
        alive_rx: &mut mpsc::Receiver<Envelope>,
        selected_rx: &mut mpsc::Receiver<Envelope>,
    ) -> Result<PeerId, ElectorError> {
        let deadline = tokio::time::sleep(self.config.bully_wait_time);
        tokio::pin!(deadline);

        // Not a candidate: stay passive and wait for the announcement.
        if !candidates.contains(&host) {
            loop {
                tokio::select! {
                    Some(msg) = selected_rx.recv() => {
                        if candidates.contains(&msg.from) {
                            return Ok(msg.from);
                        }
                    }
                    Some(msg) = election_rx.recv() => {
                        debug!(session_id = %self.session_id, from = %msg.from, "ignoring challenge, not a candidate");
                    }
                    _ = &mut deadline => return Err(ElectorError::Timeout(self.config.bully_wait_time)),
                    _ = ctx.cancelled() => return Err(ElectorError::Cancelled),
                }
            }
        }

        'election: loop {
            let outranking: Vec<PeerId> =
                candidates.iter().copied().filter(|p| *p < host).collect();
            if outranking.is_empty() {
                self.announce(candidates);
                return Ok(host);
            }
            debug!(session_id = %self.session_id, challengers = outranking.len(), "starting bully round");
            self.comm.broadcast(
                &outranking,
                Vec::new(),
                MessageType::Election,
                &self.session_id,
                None,
            );

            let alive_wait = tokio::time::sleep(self.config.election_wait_time);
            tokio::pin!(alive_wait);
            loop {
                tokio::select! {
                    Some(msg) = election_rx.recv() => self.answer_challenge(host, &msg),
                    Some(msg) = alive_rx.recv() => {
                        debug!(session_id = %self.session_id, from = %msg.from, "outranked, awaiting selection");
                        // A higher-priority peer is alive; wait for its
                        // announcement, re-electing if it goes quiet.
                        let select_wait = tokio::time::sleep(self.config.select_wait_time);
                        tokio::pin!(select_wait);
                        loop {
                            tokio::select! {
                                Some(msg) = selected_rx.recv() => {
                                    if candidates.contains(&msg.from) {
                                        return Ok(msg.from);
                                    }
                                }
                                Some(msg) = election_rx.recv() => self.answer_challenge(host, &msg),
                                _ = &mut select_wait => continue 'election,
                                _ = &mut deadline => return Err(ElectorError::Timeout(self.config.bully_wait_time)),
                                _ = ctx.cancelled() => return Err(ElectorError::Cancelled),
                            }
                        }
                    }
                    Some(msg) = selected_rx.recv() => {
                        if candidates.contains(&msg.from) {
                            return Ok(msg.from);
                        }
                    }
                    _ = &mut alive_wait => {
                        // Every outranking peer stayed silent.
                        self.announce(candidates);
                        return Ok(host);
                    }
                    _ = &mut deadline => return Err(ElectorError::Timeout(self.config.bully_wait_time)),
                    _ = ctx.cancelled() => return Err(ElectorError::Cancelled),
                }
            }
        }
    }

    fn answer_challenge(&self, host: PeerId, msg: &Envelope) {
        // Only challengers we outrank get an answer.
        if msg.from > host {
            self.comm.broadcast(
                &[msg.from],
                Vec::new(),
                MessageType::Alive,
                &self.session_id,
                None,
            );
        }
    }

    fn announce(&self, candidates: &[PeerId]) {
        debug!(session_id = %self.session_id, "announcing self as coordinator");
        self.comm.broadcast(
            candidates,
            Vec::new(),
            MessageType::Selected,
            &self.session_id,
            None,
        );
    }
}
