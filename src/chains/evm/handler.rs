//! Destination-side message handling: packing transfer messages into
//! proposal calldata and re-resolving V2 retry requests.

use crate::chains::evm::deposit::DepositHandlerRegistry;
use crate::chains::evm::listener::EventFetcher;
use crate::chains::{ChainError, TransferProposal, TransferProposalData};
use crate::crypto::left_pad;
use crate::relayer::message::{Message, MessageData, TransferMessageData, TransferType};
use crate::store::{PropStatus, PropStore};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

fn payload_field<'a>(data: &'a TransferMessageData, index: usize, what: &str) -> Result<&'a [u8], ChainError> {
    data.payload
        .get(index)
        .map(|f| f.as_slice())
        .ok_or_else(|| ChainError::Decode(format!("transfer payload missing {what}")))
}

/// Packs a transfer message into the destination handler's calldata.
/// The layouts mirror the listener-side decoders byte for byte, so a
/// deposit's data round-trips unchanged.
pub struct TransferMessageHandler;

impl TransferMessageHandler {
    pub fn handle(&self, message: &Message) -> Result<TransferProposal, ChainError> {
        let MessageData::Transfer(data) = &message.data else {
            return Err(ChainError::Decode("expected a transfer message".into()));
        };

        let packed = match data.kind {
            TransferType::Fungible => {
                let amount = payload_field(data, 0, "amount")?;
                let recipient = payload_field(data, 1, "recipient")?;
                let mut out = left_pad(amount, 32);
                out.extend_from_slice(&left_pad(&(recipient.len() as u64).to_be_bytes(), 32));
                out.extend_from_slice(recipient);
                out
            }
            TransferType::NonFungible => {
                let token_id = payload_field(data, 0, "token id")?;
                let recipient = payload_field(data, 1, "recipient")?;
                let metadata = payload_field(data, 2, "metadata")?;
                let mut out = left_pad(token_id, 32);
                out.extend_from_slice(&left_pad(&(recipient.len() as u64).to_be_bytes(), 32));
                out.extend_from_slice(recipient);
                out.extend_from_slice(&left_pad(&(metadata.len() as u64).to_be_bytes(), 32));
                out.extend_from_slice(metadata);
                out
            }
            TransferType::PermissionlessGeneric => {
                let function_sig = payload_field(data, 0, "function signature")?;
                let contract_address = payload_field(data, 1, "contract address")?;
                let max_fee = payload_field(data, 2, "max fee")?;
                let depositor = payload_field(data, 3, "depositor")?;
                let execution_data = payload_field(data, 4, "execution data")?;

                let mut out = left_pad(max_fee, 32);
                out.extend_from_slice(&(function_sig.len() as u16).to_be_bytes());
                out.extend_from_slice(function_sig);
                out.push(contract_address.len() as u8);
                out.extend_from_slice(contract_address);
                out.push(depositor.len() as u8);
                out.extend_from_slice(depositor);
                out.extend_from_slice(execution_data);
                out
            }
        };

        Ok(TransferProposal {
            source: message.source,
            destination: message.destination,
            data: TransferProposalData {
                deposit_nonce: data.deposit_nonce,
                resource_id: data.resource_id,
                metadata: data.metadata.clone(),
                data: packed,
            },
        })
    }
}

/// Handles a V2 retry on the transfer's source chain: re-fetch the
/// deposits at the named height, drop executed ones, rewrite stuck
/// `pending` proposals to `failed` and re-emit the rest.
pub struct RetryMessageHandler {
    fetcher: Arc<dyn EventFetcher>,
    registry: Arc<DepositHandlerRegistry>,
    prop_store: PropStore,
    domain_id: u8,
    msg_tx: mpsc::Sender<Vec<Message>>,
}

impl RetryMessageHandler {
    pub fn new(
        fetcher: Arc<dyn EventFetcher>,
        registry: Arc<DepositHandlerRegistry>,
        prop_store: PropStore,
        domain_id: u8,
        msg_tx: mpsc::Sender<Vec<Message>>,
    ) -> Self {
        Self { fetcher, registry, prop_store, domain_id, msg_tx }
    }

    pub async fn handle(&self, message: &Message) -> Result<(), ChainError> {
        let MessageData::Retry(retry) = &message.data else {
            return Err(ChainError::Decode("expected a retry message".into()));
        };

        let deposits = self
            .fetcher
            .fetch_deposits(retry.block_height, retry.block_height)
            .await?;

        let mut retried = Vec::new();
        for deposit in &deposits {
            if deposit.resource_id != retry.resource_id
                || deposit.destination_domain_id != retry.destination_domain_id
            {
                continue;
            }

            match self.prop_store.status(
                self.domain_id,
                deposit.destination_domain_id,
                deposit.deposit_nonce,
            )? {
                PropStatus::Executed => {
                    debug!(nonce = deposit.deposit_nonce, "deposit already executed, not retrying");
                    continue;
                }
                PropStatus::Pending => {
                    self.prop_store.store_status(
                        self.domain_id,
                        deposit.destination_domain_id,
                        deposit.deposit_nonce,
                        PropStatus::Failed,
                    )?;
                }
                _ => {}
            }

            let id = format!(
                "retry-{}-{}-{}",
                self.domain_id, deposit.destination_domain_id, deposit.deposit_nonce
            );
            match self.registry.handle_deposit(self.domain_id, deposit, &id) {
                Ok(resolved) => {
                    info!(message_id = id, "re-emitting retried deposit");
                    retried.push(resolved);
                }
                Err(e) => {
                    debug!(message_id = id, "failed re-handling retried deposit: {e}");
                }
            }
        }

        if !retried.is_empty() {
            let _ = self.msg_tx.send(retried).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chains::evm::deposit::{DepositHandler, Erc20DepositHandler, PermissionlessGenericDepositHandler};
    use crate::crypto::left_pad;

    #[test]
    fn fungible_calldata_roundtrips_through_message_and_proposal() {
        let recipient = [0x11u8; 20];
        let mut calldata = left_pad(&19_000u64.to_be_bytes(), 32);
        calldata.extend_from_slice(&left_pad(&(recipient.len() as u64).to_be_bytes(), 32));
        calldata.extend_from_slice(&recipient);

        let message = Erc20DepositHandler
            .handle_deposit(1, 2, 7, [9; 32], &calldata, &[], "1-2-7")
            .unwrap();
        let proposal = TransferMessageHandler.handle(&message).unwrap();
        assert_eq!(proposal.data.data, calldata);
        assert_eq!(proposal.source, 1);
        assert_eq!(proposal.destination, 2);
        assert_eq!(proposal.data.deposit_nonce, 7);
    }

    #[test]
    fn generic_calldata_roundtrips_unchanged() {
        let mut calldata = left_pad(&1_000u64.to_be_bytes(), 32);
        calldata.extend_from_slice(&4u16.to_be_bytes());
        calldata.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        calldata.push(20);
        calldata.extend_from_slice(&[0x33; 20]);
        calldata.push(20);
        calldata.extend_from_slice(&[0x44; 20]);
        calldata.extend_from_slice(b"execution payload");

        let message = PermissionlessGenericDepositHandler
            .handle_deposit(1, 2, 8, [9; 32], &calldata, &[], "1-2-8")
            .unwrap();
        let proposal = TransferMessageHandler.handle(&message).unwrap();
        assert_eq!(proposal.data.data, calldata);
    }

    #[test]
    fn retry_message_is_rejected_by_transfer_handler() {
        let message = Message::new_retry(
            1,
            2,
            "retry-1-2".into(),
            crate::relayer::message::RetryMessageData {
                source_domain_id: 1,
                destination_domain_id: 2,
                block_height: 10,
                resource_id: [0; 32],
            },
        );
        assert!(TransferMessageHandler.handle(&message).is_err());
    }
}
