//! Session coordinator: elects a leader, synchronises readiness, fires
//! the start signal and shepherds one TSS process to a terminal state,
//! retrying recoverable failures through a bully re-election.
//!
//! One session is at most one local process: a second `execute` for the
//! same session id returns success without side effects. A session gets
//! at most one retry; the lock clears when the session exits.

use crate::comm::elector::ElectorError;
use crate::comm::wire::MessageType;
use crate::comm::{Communication, CoordinatorElectorFactory, ElectorKind};
use crate::crypto::PeerId;
use crate::tss::message::{marshal_start_message, unmarshal_start_message};
use crate::tss::{ProcessError, ProcessStatus, TssProcess};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Terminal failure of one session.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("tss process timed out after {0:?}")]
    Timeout(Duration),
    #[error("failure notice received for session {0}")]
    Failed(String),
    #[error(transparent)]
    Process(ProcessError),
    #[error("election failed: {0}")]
    Election(#[from] ElectorError),
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Re-broadcast cadence for `initiate` while collecting `ready`.
    pub initiate_period: Duration,
    /// Follower's patience for the leader; reset on every `initiate`.
    pub coordinator_timeout: Duration,
    /// Hard cap on any one session.
    pub tss_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            initiate_period: Duration::from_secs(15),
            coordinator_timeout: Duration::from_secs(5 * 60),
            tss_timeout: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Default)]
struct SessionFlags {
    pending: bool,
    retried: bool,
}

type LeaderSlot = Arc<Mutex<Option<PeerId>>>;

pub struct Coordinator {
    comm: Arc<Communication>,
    elector_factory: Arc<CoordinatorElectorFactory>,
    config: CoordinatorConfig,
    sessions: Mutex<HashMap<String, SessionFlags>>,
}

impl Coordinator {
    pub fn new(
        comm: Arc<Communication>,
        elector_factory: Arc<CoordinatorElectorFactory>,
        config: CoordinatorConfig,
    ) -> Arc<Self> {
        Arc::new(Self { comm, elector_factory, config, sessions: Mutex::new(HashMap::new()) })
    }

    /// Drive `process` to completion. Results flow out on `result_tx`;
    /// the return value is the session's terminal outcome. Cancellation
    /// is non-fatal and reports `Ok(())`.
    pub async fn execute<P: TssProcess>(
        self: &Arc<Self>,
        ctx: CancellationToken,
        process: Arc<P>,
        result_tx: mpsc::Sender<P::Output>,
    ) -> Result<(), SessionError> {
        let session_id = process.session_id().to_string();
        if !self.mark_pending(&session_id) {
            warn!(session_id, "process already pending");
            return Ok(());
        }

        let outcome = self.run_session(&ctx, process.clone(), result_tx).await;

        process.stop();
        self.comm.close_session(&session_id);
        self.clear_session(&session_id);
        match &outcome {
            Ok(()) => info!(session_id, "session finished"),
            Err(e) => error!(session_id, "session failed: {e}"),
        }
        outcome
    }

    async fn run_session<P: TssProcess>(
        self: &Arc<Self>,
        ctx: &CancellationToken,
        process: Arc<P>,
        result_tx: mpsc::Sender<P::Output>,
    ) -> Result<(), SessionError> {
        let session_id = process.session_id().to_string();

        let elector = self.elector_factory.elector(&session_id, ElectorKind::Static);
        let leader = elector.coordinator(ctx, &process.valid_coordinators()).await?;
        info!(session_id, %leader, "starting process");
        let current_leader: LeaderSlot = Arc::new(Mutex::new(Some(leader)));

        let (status_tx, mut status_rx) = mpsc::channel::<ProcessStatus>(8);
        self.spawn_start(ctx, process.clone(), leader, result_tx.clone(), status_tx.clone(), Vec::new());

        let (fail_tx, mut fail_rx) = mpsc::channel(8);
        let fail_sub = self.comm.subscribe(&session_id, MessageType::Fail, fail_tx);

        let timeout = tokio::time::sleep(self.config.tss_timeout);
        tokio::pin!(timeout);

        let outcome = loop {
            tokio::select! {
                _ = &mut timeout => {
                    error!(session_id, "tss process timed out");
                    break Err(SessionError::Timeout(self.config.tss_timeout));
                }
                _ = ctx.cancelled() => break Ok(()),
                Some(msg) = fail_rx.recv() => {
                    // Only the currently-elected leader may abort the session.
                    if Some(msg.from) != *current_leader.lock().unwrap() {
                        continue;
                    }
                    error!(session_id, from = %msg.from, "fail message received");
                    break Err(SessionError::Failed(session_id.clone()));
                }
                Some(status) = status_rx.recv() => {
                    let err = match status {
                        Ok(()) => break Ok(()),
                        Err(err) => err,
                    };
                    if !process.retryable() {
                        break Err(SessionError::Process(err));
                    }
                    if !self.lock_retry(&session_id) {
                        continue;
                    }
                    process.stop();
                    match err {
                        ProcessError::Coordinator { peer } => {
                            error!(session_id, %peer, "coordinator failed to drive the session");
                            self.spawn_retry(ctx, process.clone(), result_tx.clone(), status_tx.clone(), vec![peer], current_leader.clone());
                        }
                        ProcessError::Communication(e) => {
                            warn!(session_id, "communication error: {e}");
                            self.spawn_retry(ctx, process.clone(), result_tx.clone(), status_tx.clone(), Vec::new(), current_leader.clone());
                        }
                        ProcessError::Protocol { culprits, reason } => {
                            error!(session_id, ?culprits, "protocol failed: {reason}");
                            self.spawn_retry(ctx, process.clone(), result_tx.clone(), status_tx.clone(), culprits, current_leader.clone());
                        }
                        ProcessError::Subset => {
                            // Not selected this round; accept a start from
                            // whoever leads a later one.
                            *current_leader.lock().unwrap() = None;
                            self.spawn_wait(ctx, process.clone(), None, self.config.tss_timeout, result_tx.clone(), status_tx.clone());
                        }
                        other => break Err(SessionError::Process(other)),
                    }
                }
            }
        };

        self.comm.unsubscribe(&fail_sub);
        outcome
    }

    fn mark_pending(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        let flags = sessions.entry(session_id.to_string()).or_default();
        if flags.pending {
            return false;
        }
        flags.pending = true;
        true
    }

    fn clear_session(&self, session_id: &str) {
        self.sessions.lock().unwrap().remove(session_id);
    }

    /// Atomically claim the session's single retry slot.
    fn lock_retry(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        let flags = sessions.entry(session_id.to_string()).or_default();
        if flags.retried {
            warn!(session_id, "retry already pending");
            return false;
        }
        flags.retried = true;
        true
    }

    fn spawn_start<P: TssProcess>(
        self: &Arc<Self>,
        ctx: &CancellationToken,
        process: Arc<P>,
        leader: PeerId,
        result_tx: mpsc::Sender<P::Output>,
        status_tx: mpsc::Sender<ProcessStatus>,
        excluded: Vec<PeerId>,
    ) {
        let this = self.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if leader == this.comm.host_id() {
                this.initiate(ctx, process, result_tx, status_tx, excluded).await;
            } else {
                let timeout = this.config.coordinator_timeout;
                this.wait_for_start(ctx, process, Some(leader), timeout, result_tx, status_tx).await;
            }
        });
    }

    fn spawn_wait<P: TssProcess>(
        self: &Arc<Self>,
        ctx: &CancellationToken,
        process: Arc<P>,
        coordinator: Option<PeerId>,
        timeout: Duration,
        result_tx: mpsc::Sender<P::Output>,
        status_tx: mpsc::Sender<ProcessStatus>,
    ) {
        let this = self.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            this.wait_for_start(ctx, process, coordinator, timeout, result_tx, status_tx).await;
        });
    }

    /// Re-elect through a full bully round, excluding known culprits, and
    /// start over with the new leader.
    fn spawn_retry<P: TssProcess>(
        self: &Arc<Self>,
        ctx: &CancellationToken,
        process: Arc<P>,
        result_tx: mpsc::Sender<P::Output>,
        status_tx: mpsc::Sender<ProcessStatus>,
        excluded: Vec<PeerId>,
        current_leader: LeaderSlot,
    ) {
        let this = self.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let session_id = process.session_id().to_string();
            let candidates: Vec<PeerId> = process
                .valid_coordinators()
                .into_iter()
                .filter(|p| !excluded.contains(p))
                .collect();
            info!(session_id, excluded = excluded.len(), "retrying with bully election");

            let elector = this.elector_factory.elector(&session_id, ElectorKind::Bully);
            match elector.coordinator(&ctx, &candidates).await {
                Ok(leader) => {
                    info!(session_id, %leader, "retry elected coordinator");
                    *current_leader.lock().unwrap() = Some(leader);
                    if leader == this.comm.host_id() {
                        this.initiate(ctx, process, result_tx, status_tx, excluded).await;
                    } else {
                        let timeout = this.config.coordinator_timeout;
                        this.wait_for_start(ctx, process, Some(leader), timeout, result_tx, status_tx)
                            .await;
                    }
                }
                Err(e) => {
                    let _ = status_tx
                        .send(Err(ProcessError::Message(format!("retry election failed: {e}"))))
                        .await;
                }
            }
        });
    }

    /// Leader side: broadcast `initiate` on a cadence, collect `ready`
    /// replies, and fire `start` once the process declares the set
    /// sufficient.
    async fn initiate<P: TssProcess>(
        &self,
        ctx: CancellationToken,
        process: Arc<P>,
        result_tx: mpsc::Sender<P::Output>,
        status_tx: mpsc::Sender<ProcessStatus>,
        excluded: Vec<PeerId>,
    ) {
        let session_id = process.session_id().to_string();
        let (ready_tx, mut ready_rx) = mpsc::channel(32);
        // Subscribe before the first broadcast so no reply is lost.
        let sub = self.comm.subscribe(&session_id, MessageType::Ready, ready_tx);

        let mut ready_map: HashMap<PeerId, bool> = HashMap::new();
        ready_map.insert(self.comm.host_id(), true);

        let mut ticker = tokio::time::interval(self.config.initiate_period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!(session_id, "broadcasting initiate");
                    self.comm.broadcast(&self.comm.peers(), Vec::new(), MessageType::Initiate, &session_id, None);
                }
                Some(msg) = ready_rx.recv() => {
                    debug!(session_id, from = %msg.from, "ready message received");
                    if !excluded.contains(&msg.from) {
                        ready_map.insert(msg.from, true);
                    }
                    match process.ready(&ready_map, &excluded) {
                        Err(e) => {
                            let _ = status_tx.send(Err(e)).await;
                            break;
                        }
                        Ok(false) => continue,
                        Ok(true) => {}
                    }

                    let params = match process.start_params(&ready_map) {
                        Ok(params) => params,
                        Err(e) => {
                            let _ = status_tx.send(Err(e)).await;
                            break;
                        }
                    };
                    let start = match marshal_start_message(&params) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            let _ = status_tx.send(Err(ProcessError::Message(e.to_string()))).await;
                            break;
                        }
                    };
                    self.comm.broadcast(&self.comm.peers(), start, MessageType::Start, &session_id, None);
                    tokio::spawn(process.clone().run(ctx.clone(), true, result_tx.clone(), status_tx.clone(), params));
                    break;
                }
                _ = ctx.cancelled() => break,
            }
        }
        self.comm.unsubscribe(&sub);
    }

    /// Follower side: answer the leader's `initiate` probes and start on
    /// its `start` signal. `coordinator == None` accepts a start from any
    /// peer (subset-miss recovery).
    async fn wait_for_start<P: TssProcess>(
        &self,
        ctx: CancellationToken,
        process: Arc<P>,
        coordinator: Option<PeerId>,
        timeout: Duration,
        result_tx: mpsc::Sender<P::Output>,
        status_tx: mpsc::Sender<ProcessStatus>,
    ) {
        let session_id = process.session_id().to_string();
        let (init_tx, mut init_rx) = mpsc::channel(32);
        let (start_tx, mut start_rx) = mpsc::channel(32);
        let init_sub = self.comm.subscribe(&session_id, MessageType::Initiate, init_tx);
        let start_sub = self.comm.subscribe(&session_id, MessageType::Start, start_tx);

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                Some(msg) = init_rx.recv() => {
                    // An initiate from anyone but the expected leader is
                    // ignored outright, no reply.
                    if let Some(leader) = coordinator {
                        if msg.from != leader {
                            continue;
                        }
                    }
                    deadline.as_mut().reset(tokio::time::Instant::now() + timeout);
                    debug!(session_id, to = %msg.from, "replying ready");
                    self.comm.broadcast(&[msg.from], Vec::new(), MessageType::Ready, &session_id, None);
                }
                Some(msg) = start_rx.recv() => {
                    if let Some(leader) = coordinator {
                        if msg.from != leader {
                            let _ = status_tx
                                .send(Err(ProcessError::Message(format!(
                                    "start message received from peer {} that is not coordinator {leader}",
                                    msg.from
                                ))))
                                .await;
                            continue;
                        }
                    }
                    debug!(session_id, from = %msg.from, "start message received");
                    match unmarshal_start_message(&msg.payload) {
                        Ok(start) => {
                            tokio::spawn(process.clone().run(ctx.clone(), false, result_tx.clone(), status_tx.clone(), start.params));
                            break;
                        }
                        Err(e) => {
                            let _ = status_tx.send(Err(ProcessError::Message(e.to_string()))).await;
                            break;
                        }
                    }
                }
                _ = &mut deadline => {
                    let _ = status_tx
                        .send(Err(ProcessError::Coordinator { peer: coordinator.unwrap_or_default() }))
                        .await;
                    break;
                }
                _ = ctx.cancelled() => break,
            }
        }
        self.comm.unsubscribe(&init_sub);
        self.comm.unsubscribe(&start_sub);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::elector::BullyConfig;
    use crate::comm::{PeerTransport, SessionBus};
    use crate::crypto::Keypair;
    use crate::topology::{NetworkTopology, PeerInfo};
    use async_trait::async_trait;

    struct NeverReady {
        session_id: String,
        peers: Vec<PeerId>,
    }

    #[async_trait]
    impl TssProcess for NeverReady {
        type Output = ();

        fn session_id(&self) -> &str {
            &self.session_id
        }

        fn valid_coordinators(&self) -> Vec<PeerId> {
            self.peers.clone()
        }

        fn ready(&self, _: &HashMap<PeerId, bool>, _: &[PeerId]) -> Result<bool, ProcessError> {
            Ok(false)
        }

        fn start_params(&self, _: &HashMap<PeerId, bool>) -> Result<Vec<u8>, ProcessError> {
            Ok(Vec::new())
        }

        fn retryable(&self) -> bool {
            true
        }

        async fn run(
            self: Arc<Self>,
            _ctx: CancellationToken,
            _is_leader: bool,
            _result_tx: mpsc::Sender<()>,
            _status_tx: mpsc::Sender<ProcessStatus>,
            _params: Vec<u8>,
        ) {
        }

        fn stop(&self) {}
    }

    fn single_node() -> (Arc<Coordinator>, PeerId) {
        let kp = Keypair::from_secret_bytes([5; 32]);
        let peer_id = kp.peer_id();
        let topology = NetworkTopology {
            peers: vec![PeerInfo {
                id: peer_id,
                address: "127.0.0.1:1".into(),
                public_key: *kp.public().as_bytes(),
            }],
            threshold: 0,
        };
        let bus = Arc::new(SessionBus::new());
        let transport = PeerTransport::new(Arc::new(kp), topology, bus.clone());
        let comm = Communication::new(transport, bus);
        let factory = Arc::new(CoordinatorElectorFactory::new(comm.clone(), BullyConfig::default()));
        (Coordinator::new(comm, factory, CoordinatorConfig::default()), peer_id)
    }

    #[tokio::test]
    async fn second_execute_for_same_session_is_a_noop() {
        let (coordinator, peer_id) = single_node();
        let ctx = CancellationToken::new();

        let process = Arc::new(NeverReady { session_id: "signing-dup".into(), peers: vec![peer_id] });
        let (result_tx, _result_rx) = mpsc::channel(1);

        let first = {
            let coordinator = coordinator.clone();
            let ctx = ctx.clone();
            let process = process.clone();
            let result_tx = result_tx.clone();
            tokio::spawn(async move { coordinator.execute(ctx, process, result_tx).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Deduplicated: returns success immediately, no second process.
        let second = coordinator.execute(ctx.clone(), process.clone(), result_tx).await;
        assert!(second.is_ok());

        ctx.cancel();
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn cancellation_is_non_fatal() {
        let (coordinator, peer_id) = single_node();
        let ctx = CancellationToken::new();
        let process = Arc::new(NeverReady { session_id: "signing-cancel".into(), peers: vec![peer_id] });
        let (result_tx, _result_rx) = mpsc::channel(1);

        ctx.cancel();
        let outcome = coordinator.execute(ctx, process, result_tx).await;
        assert!(outcome.is_ok());
    }
}
