//! EVM domain: listener, message handlers and the batch executor.

pub mod deposit;
pub mod executor;
pub mod fingerprint;
pub mod handler;
pub mod listener;
pub mod loopback;

use crate::chains::ChainError;
use crate::relayer::message::MessageData;
use crate::relayer::{Message, RelayedChain};
use crate::tss::party::PartyFactory;
use crate::tss::SignatureParts;
use async_trait::async_trait;
use executor::Executor;
use handler::{RetryMessageHandler, TransferMessageHandler};
use listener::EvmListener;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One EVM domain registered with the relayer.
pub struct EvmChain<F> {
    domain_id: u8,
    listener: Arc<EvmListener>,
    executor: Arc<Executor<F>>,
    transfer_handler: TransferMessageHandler,
    retry_handler: RetryMessageHandler,
}

impl<F> EvmChain<F> {
    pub fn new(
        domain_id: u8,
        listener: Arc<EvmListener>,
        executor: Arc<Executor<F>>,
        retry_handler: RetryMessageHandler,
    ) -> Self {
        Self {
            domain_id,
            listener,
            executor,
            transfer_handler: TransferMessageHandler,
            retry_handler,
        }
    }
}

#[async_trait]
impl<F: PartyFactory<Output = SignatureParts>> RelayedChain for EvmChain<F> {
    fn domain_id(&self) -> u8 {
        self.domain_id
    }

    async fn poll_events(&self, ctx: CancellationToken) {
        self.listener.listen(ctx).await
    }

    async fn write(&self, messages: Vec<Message>) -> Result<(), ChainError> {
        let mut proposals = Vec::new();
        for message in &messages {
            match &message.data {
                MessageData::Transfer(_) => {
                    proposals.push(self.transfer_handler.handle(message)?);
                }
                MessageData::Retry(_) => {
                    self.retry_handler.handle(message).await?;
                }
            }
        }
        if !proposals.is_empty() {
            self.executor.execute(proposals).await?;
        }
        Ok(())
    }
}
