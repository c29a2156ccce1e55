//! Top-level message routing between registered domains.

pub mod message;

pub use message::{Message, MessageData, RetryMessageData, TransferMessageData, TransferType};

use crate::chains::ChainError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A chain participating in the bridge: it polls its own events and
/// executes messages destined to it.
#[async_trait]
pub trait RelayedChain: Send + Sync + 'static {
    fn domain_id(&self) -> u8;

    /// Poll source events until cancelled, pushing decoded message
    /// batches onto the relayer channel.
    async fn poll_events(&self, ctx: CancellationToken);

    /// Execute a batch of messages destined to this chain.
    async fn write(&self, messages: Vec<Message>) -> Result<(), ChainError>;
}

pub struct Relayer {
    chains: HashMap<u8, Arc<dyn RelayedChain>>,
}

impl Relayer {
    pub fn new(chains: Vec<Arc<dyn RelayedChain>>) -> Self {
        let chains = chains.into_iter().map(|c| (c.domain_id(), c)).collect();
        Self { chains }
    }

    /// Start every chain's poll loop and route message batches until
    /// cancelled.
    pub async fn start(&self, ctx: CancellationToken, mut msg_rx: mpsc::Receiver<Vec<Message>>) {
        for chain in self.chains.values() {
            info!(domain = chain.domain_id(), "starting domain poller");
            let chain = chain.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { chain.poll_events(ctx).await });
        }

        loop {
            tokio::select! {
                Some(messages) = msg_rx.recv() => self.route(messages),
                _ = ctx.cancelled() => break,
            }
        }
    }

    /// Fan one batch out to its destination chains.
    fn route(&self, messages: Vec<Message>) {
        let mut by_destination: HashMap<u8, Vec<Message>> = HashMap::new();
        for message in messages {
            by_destination.entry(message.destination).or_default().push(message);
        }

        for (destination, batch) in by_destination {
            let Some(chain) = self.chains.get(&destination).cloned() else {
                warn!(destination, "no chain registered for destination domain");
                continue;
            };
            tokio::spawn(async move {
                let ids: Vec<String> = batch.iter().map(|m| m.id.clone()).collect();
                if let Err(e) = chain.write(batch).await {
                    error!(destination, ?ids, "executing messages failed: {e}");
                }
            });
        }
    }
}
