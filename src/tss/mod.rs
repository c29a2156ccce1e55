//! Threshold-signing sessions: the coordinator state machine, the three
//! process kinds (keygen, resharing, signing) and the driver boundary to
//! the black-box MPC library.

pub mod coordinator;
pub mod keygen;
pub mod loopback;
pub mod message;
pub mod party;
pub mod resharing;
pub mod signing;

pub use coordinator::{Coordinator, CoordinatorConfig, SessionError};

use crate::comm::CommunicationError;
use crate::crypto::PeerId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Raw ECDSA signature parts as produced by the signing protocol;
/// `recovery` is the 0/1 recovery bit before wire offsetting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureParts {
    pub r: Vec<u8>,
    pub s: Vec<u8>,
    pub recovery: u8,
}

/// Recoverable and fatal ways a running process can end. The coordinator
/// routes each kind to its retry policy.
#[derive(Error, Debug, Clone)]
pub enum ProcessError {
    /// The elected leader failed to drive the session.
    #[error("coordinator {peer} failed to drive the session")]
    Coordinator { peer: PeerId },
    /// A peer send failed mid-protocol.
    #[error(transparent)]
    Communication(#[from] CommunicationError),
    /// The protocol itself failed and blamed specific peers.
    #[error("protocol failed ({reason}), culprits: {culprits:?}")]
    Protocol { culprits: Vec<PeerId>, reason: String },
    /// This relayer was not chosen into the signing subset.
    #[error("not selected into the signing subset")]
    Subset,
    /// The remaining peer set cannot reach the threshold.
    #[error("only {available} peers available, {required} required")]
    NotEnoughPeers { available: usize, required: usize },
    /// Marshalling or other non-recoverable local failure.
    #[error("{0}")]
    Message(String),
}

/// Sent on the process status channel: `Ok(())` when the protocol
/// finished, the error otherwise.
pub type ProcessStatus = Result<(), ProcessError>;

/// Capability set shared by keygen, resharing and signing. The
/// coordinator owns the process for the session's lifetime and drives it
/// through this interface.
#[async_trait]
pub trait TssProcess: Send + Sync + 'static {
    type Output: Send + 'static;

    fn session_id(&self) -> &str;

    /// Peers eligible to lead this process.
    fn valid_coordinators(&self) -> Vec<PeerId>;

    /// Is the readiness map, minus exclusions, sufficient to start?
    fn ready(
        &self,
        ready_peers: &HashMap<PeerId, bool>,
        excluded: &[PeerId],
    ) -> Result<bool, ProcessError>;

    /// Parameters the leader commits to before broadcasting `start`.
    fn start_params(&self, ready_peers: &HashMap<PeerId, bool>) -> Result<Vec<u8>, ProcessError>;

    fn retryable(&self) -> bool;

    /// Drive the inner protocol rounds to completion. Results go to
    /// `result_tx`; completion or failure is reported on `status_tx`.
    /// Cancellation of `ctx` or a `stop()` call ends the run silently.
    async fn run(
        self: Arc<Self>,
        ctx: CancellationToken,
        is_leader: bool,
        result_tx: mpsc::Sender<Self::Output>,
        status_tx: mpsc::Sender<ProcessStatus>,
        params: Vec<u8>,
    );

    /// Idempotent teardown of the current run.
    fn stop(&self);
}

/// Cancels the current run of a process while allowing a later restart:
/// each `arm()` installs a fresh token, `halt()` cancels the current one.
pub(crate) struct HaltSwitch {
    current: Mutex<CancellationToken>,
}

impl HaltSwitch {
    pub fn new() -> Self {
        Self { current: Mutex::new(CancellationToken::new()) }
    }

    pub fn arm(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.current.lock().unwrap() = token.clone();
        token
    }

    pub fn halt(&self) {
        self.current.lock().unwrap().cancel();
    }
}
