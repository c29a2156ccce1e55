//! Loopback chain clients: in-memory stand-ins for the operator's RPC
//! clients, used by tests and the local drill binary. Mirrors the
//! loopback protocol backend in `tss::loopback`.

use crate::chains::evm::deposit::EvmDeposit;
use crate::chains::evm::executor::{BridgeContract, TransactOptions};
use crate::chains::evm::listener::{EventFetcher, KeygenRequest, RefreshEvent, RetryV2Event};
use crate::chains::{ChainError, TransferProposal};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Bridge contract that records executions in memory. Submission marks
/// every proposal of the batch executed, so the execution watcher
/// observes success on its next poll.
#[derive(Default)]
pub struct LoopbackBridge {
    executed: Mutex<HashSet<(u8, u8, u64)>>,
    fail_submission: AtomicBool,
}

impl LoopbackBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next submissions fail, driving the abort path.
    pub fn fail_submissions(&self, fail: bool) {
        self.fail_submission.store(fail, Ordering::SeqCst);
    }

    pub fn mark_executed(&self, proposal: &TransferProposal) {
        self.executed.lock().unwrap().insert((
            proposal.source,
            proposal.destination,
            proposal.data.deposit_nonce,
        ));
    }

    pub fn execution_count(&self) -> usize {
        self.executed.lock().unwrap().len()
    }
}

#[async_trait]
impl BridgeContract for LoopbackBridge {
    async fn is_proposal_executed(&self, proposal: &TransferProposal) -> Result<bool, ChainError> {
        Ok(self.executed.lock().unwrap().contains(&(
            proposal.source,
            proposal.destination,
            proposal.data.deposit_nonce,
        )))
    }

    async fn execute_proposals(
        &self,
        proposals: &[TransferProposal],
        signature: &[u8],
        _opts: TransactOptions,
    ) -> Result<[u8; 32], ChainError> {
        if self.fail_submission.load(Ordering::SeqCst) {
            return Err(ChainError::Submission("loopback submission failure".into()));
        }
        if signature.len() != 65 || !matches!(signature[64], 27 | 28) {
            return Err(ChainError::Submission("malformed signature wire".into()));
        }
        for proposal in proposals {
            self.mark_executed(proposal);
        }
        Ok(crate::crypto::keccak256(signature))
    }
}

/// Event source fed by hand: events are keyed by block height and served
/// once their range is polled.
#[derive(Default)]
pub struct ScriptedEvents {
    head: AtomicU64,
    deposits: Mutex<HashMap<u64, Vec<EvmDeposit>>>,
    retry_v1_deposits: Mutex<HashMap<u64, Vec<EvmDeposit>>>,
    keygen_requests: Mutex<HashMap<u64, Vec<KeygenRequest>>>,
    frost_keygen_requests: Mutex<HashMap<u64, Vec<KeygenRequest>>>,
    refresh_events: Mutex<HashMap<u64, Vec<RefreshEvent>>>,
    retry_v2_events: Mutex<HashMap<u64, Vec<RetryV2Event>>>,
}

impl ScriptedEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_head(&self, block: u64) {
        self.head.store(block, Ordering::SeqCst);
    }

    pub fn push_deposit(&self, block: u64, deposit: EvmDeposit) {
        self.deposits.lock().unwrap().entry(block).or_default().push(deposit);
    }

    pub fn push_retry_v1_deposit(&self, block: u64, deposit: EvmDeposit) {
        self.retry_v1_deposits.lock().unwrap().entry(block).or_default().push(deposit);
    }

    pub fn push_keygen_request(&self, block: u64) {
        self.keygen_requests
            .lock()
            .unwrap()
            .entry(block)
            .or_default()
            .push(KeygenRequest { block });
    }

    pub fn push_frost_keygen_request(&self, block: u64) {
        self.frost_keygen_requests
            .lock()
            .unwrap()
            .entry(block)
            .or_default()
            .push(KeygenRequest { block });
    }

    pub fn push_refresh_event(&self, block: u64, hash: &str) {
        self.refresh_events
            .lock()
            .unwrap()
            .entry(block)
            .or_default()
            .push(RefreshEvent { hash: hash.to_string() });
    }

    pub fn push_retry_v2_event(&self, block: u64, event: RetryV2Event) {
        self.retry_v2_events.lock().unwrap().entry(block).or_default().push(event);
    }
}

fn in_range<T: Clone>(map: &Mutex<HashMap<u64, Vec<T>>>, start: u64, end: u64) -> Vec<T> {
    let map = map.lock().unwrap();
    let mut out = Vec::new();
    for block in start..=end {
        if let Some(events) = map.get(&block) {
            out.extend(events.iter().cloned());
        }
    }
    out
}

#[async_trait]
impl EventFetcher for ScriptedEvents {
    async fn latest_block(&self) -> Result<u64, ChainError> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn fetch_deposits(&self, start: u64, end: u64) -> Result<Vec<EvmDeposit>, ChainError> {
        Ok(in_range(&self.deposits, start, end))
    }

    async fn fetch_keygen_requests(
        &self,
        start: u64,
        end: u64,
    ) -> Result<Vec<KeygenRequest>, ChainError> {
        Ok(in_range(&self.keygen_requests, start, end))
    }

    async fn fetch_frost_keygen_requests(
        &self,
        start: u64,
        end: u64,
    ) -> Result<Vec<KeygenRequest>, ChainError> {
        Ok(in_range(&self.frost_keygen_requests, start, end))
    }

    async fn fetch_refresh_events(
        &self,
        start: u64,
        end: u64,
    ) -> Result<Vec<RefreshEvent>, ChainError> {
        Ok(in_range(&self.refresh_events, start, end))
    }

    async fn fetch_retry_v2_events(
        &self,
        start: u64,
        end: u64,
    ) -> Result<Vec<RetryV2Event>, ChainError> {
        Ok(in_range(&self.retry_v2_events, start, end))
    }

    async fn fetch_retry_v1_deposits(
        &self,
        start: u64,
        end: u64,
    ) -> Result<Vec<EvmDeposit>, ChainError> {
        Ok(in_range(&self.retry_v1_deposits, start, end))
    }
}
