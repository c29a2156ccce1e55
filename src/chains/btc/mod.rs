//! Bitcoin domain: source-side deposit listener. Bitcoin as a
//! destination is not wired; transfers flow Bitcoin → EVM.

pub mod listener;

use crate::chains::ChainError;
use crate::relayer::{Message, RelayedChain};
use async_trait::async_trait;
use listener::{BtcConnection, BtcListener, RawTx};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub struct BtcChain {
    domain_id: u8,
    listener: BtcListener,
}

impl BtcChain {
    pub fn new(domain_id: u8, listener: BtcListener) -> Self {
        Self { domain_id, listener }
    }
}

#[async_trait]
impl RelayedChain for BtcChain {
    fn domain_id(&self) -> u8 {
        self.domain_id
    }

    async fn poll_events(&self, ctx: CancellationToken) {
        self.listener.listen(ctx).await
    }

    async fn write(&self, messages: Vec<Message>) -> Result<(), ChainError> {
        let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
        Err(ChainError::Other(format!(
            "bitcoin is not wired as a destination (messages {ids:?})"
        )))
    }
}

/// In-memory node connection for tests and local drills.
#[derive(Default)]
pub struct LoopbackConnection {
    head: std::sync::atomic::AtomicU64,
    blocks: Mutex<HashMap<u64, Vec<RawTx>>>,
}

impl LoopbackConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_head(&self, height: u64) {
        self.head.store(height, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn push_transaction(&self, height: u64, tx: RawTx) {
        self.blocks.lock().unwrap().entry(height).or_default().push(tx);
    }
}

#[async_trait]
impl BtcConnection for LoopbackConnection {
    async fn latest_block(&self) -> Result<u64, ChainError> {
        Ok(self.head.load(std::sync::atomic::Ordering::SeqCst))
    }

    async fn block_transactions(&self, height: u64) -> Result<Vec<RawTx>, ChainError> {
        Ok(self.blocks.lock().unwrap().get(&height).cloned().unwrap_or_default())
    }
}
