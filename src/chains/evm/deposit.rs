//! Deposit calldata decoding per handler kind.
//!
//! Layouts must round-trip unchanged through the proposal data packed on
//! the executor side, so every slice boundary here mirrors the packing in
//! `handler.rs`.

use crate::chains::ChainError;
use crate::relayer::message::{Message, TransferMessageData, TransferType};
use std::collections::HashMap;
use std::sync::Arc;

/// A decoded `Deposit` event log.
#[derive(Debug, Clone)]
pub struct EvmDeposit {
    pub destination_domain_id: u8,
    pub resource_id: [u8; 32],
    pub deposit_nonce: u64,
    pub sender: [u8; 20],
    pub data: Vec<u8>,
    pub handler_response: Vec<u8>,
}

/// Converts one deposit's calldata into a transfer message.
pub trait DepositHandler: Send + Sync {
    fn handle_deposit(
        &self,
        source: u8,
        destination: u8,
        nonce: u64,
        resource_id: [u8; 32],
        calldata: &[u8],
        handler_response: &[u8],
        message_id: &str,
    ) -> Result<Message, ChainError>;
}

fn be_len(word: &[u8]) -> Result<usize, ChainError> {
    // Lengths are 32-byte big-endian words; anything beyond usize range
    // cannot index real calldata.
    if word.iter().take(word.len().saturating_sub(8)).any(|b| *b != 0) {
        return Err(ChainError::Decode("length word out of range".into()));
    }
    let mut bytes = [0u8; 8];
    let tail = &word[word.len() - 8..];
    bytes.copy_from_slice(tail);
    Ok(u64::from_be_bytes(bytes) as usize)
}

fn slice<'a>(calldata: &'a [u8], start: usize, len: usize, what: &str) -> Result<&'a [u8], ChainError> {
    let end = start
        .checked_add(len)
        .ok_or_else(|| ChainError::Decode(format!("length overflow in {what}")))?;
    calldata
        .get(start..end)
        .ok_or_else(|| ChainError::Decode(format!("calldata too short for {what}")))
}

/// Fungible transfers: `amount(32) ‖ len(recipient)(32) ‖ recipient`.
pub struct Erc20DepositHandler;

impl DepositHandler for Erc20DepositHandler {
    fn handle_deposit(
        &self,
        source: u8,
        destination: u8,
        nonce: u64,
        resource_id: [u8; 32],
        calldata: &[u8],
        _handler_response: &[u8],
        message_id: &str,
    ) -> Result<Message, ChainError> {
        if calldata.len() < 84 {
            return Err(ChainError::Decode("invalid calldata length: less than 84 bytes".into()));
        }
        let amount = &calldata[..32];
        let recipient_len = be_len(&calldata[32..64])?;
        let recipient = slice(calldata, 64, recipient_len, "recipient")?;

        Ok(Message::new_transfer(
            source,
            destination,
            message_id.to_string(),
            TransferMessageData {
                deposit_nonce: nonce,
                resource_id,
                metadata: HashMap::new(),
                payload: vec![amount.to_vec(), recipient.to_vec()],
                kind: TransferType::Fungible,
            },
        ))
    }
}

/// Non-fungible transfers:
/// `tokenId(32) ‖ len(recipient)(32) ‖ recipient ‖ len(metadata)(32) ‖ metadata`.
pub struct Erc721DepositHandler;

impl DepositHandler for Erc721DepositHandler {
    fn handle_deposit(
        &self,
        source: u8,
        destination: u8,
        nonce: u64,
        resource_id: [u8; 32],
        calldata: &[u8],
        _handler_response: &[u8],
        message_id: &str,
    ) -> Result<Message, ChainError> {
        if calldata.len() < 64 {
            return Err(ChainError::Decode("invalid calldata length: less than 64 bytes".into()));
        }
        let token_id = &calldata[..32];
        let recipient_len = be_len(&calldata[32..64])?;
        let recipient = slice(calldata, 64, recipient_len, "recipient")?;

        let metadata_start = 64 + recipient_len;
        let metadata = if calldata.len() > metadata_start {
            let metadata_len = be_len(slice(calldata, metadata_start, 32, "metadata length")?)?;
            slice(calldata, metadata_start + 32, metadata_len, "metadata")?.to_vec()
        } else {
            Vec::new()
        };

        Ok(Message::new_transfer(
            source,
            destination,
            message_id.to_string(),
            TransferMessageData {
                deposit_nonce: nonce,
                resource_id,
                metadata: HashMap::new(),
                payload: vec![token_id.to_vec(), recipient.to_vec(), metadata],
                kind: TransferType::NonFungible,
            },
        ))
    }
}

/// Permissionless generic calls:
/// `maxFee(32) ‖ len(sig)(2) ‖ sig ‖ len(addr)(1) ‖ addr ‖
///  len(depositor)(1) ‖ depositor ‖ executionData`.
pub struct PermissionlessGenericDepositHandler;

impl DepositHandler for PermissionlessGenericDepositHandler {
    fn handle_deposit(
        &self,
        source: u8,
        destination: u8,
        nonce: u64,
        resource_id: [u8; 32],
        calldata: &[u8],
        _handler_response: &[u8],
        message_id: &str,
    ) -> Result<Message, ChainError> {
        if calldata.len() < 76 {
            return Err(ChainError::Decode("invalid calldata length: less than 76 bytes".into()));
        }
        let max_fee = &calldata[..32];
        let sig_len = u16::from_be_bytes([calldata[32], calldata[33]]) as usize;
        let function_sig = slice(calldata, 34, sig_len, "function signature")?;

        let mut cursor = 34 + sig_len;
        let addr_len = *slice(calldata, cursor, 1, "contract address length")?.first().unwrap() as usize;
        cursor += 1;
        let contract_address = slice(calldata, cursor, addr_len, "contract address")?;
        cursor += addr_len;

        let depositor_len = *slice(calldata, cursor, 1, "depositor length")?.first().unwrap() as usize;
        cursor += 1;
        let depositor = slice(calldata, cursor, depositor_len, "depositor")?;
        cursor += depositor_len;
        let execution_data = &calldata[cursor.min(calldata.len())..];

        Ok(Message::new_transfer(
            source,
            destination,
            message_id.to_string(),
            TransferMessageData {
                deposit_nonce: nonce,
                resource_id,
                metadata: HashMap::new(),
                payload: vec![
                    function_sig.to_vec(),
                    contract_address.to_vec(),
                    max_fee.to_vec(),
                    depositor.to_vec(),
                    execution_data.to_vec(),
                ],
                kind: TransferType::PermissionlessGeneric,
            },
        ))
    }
}

/// Resource-keyed dispatch to the configured handler.
pub struct DepositHandlerRegistry {
    handlers: HashMap<[u8; 32], Arc<dyn DepositHandler>>,
}

impl DepositHandlerRegistry {
    pub fn new() -> Self {
        Self { handlers: HashMap::new() }
    }

    pub fn register(&mut self, resource_id: [u8; 32], handler: Arc<dyn DepositHandler>) {
        self.handlers.insert(resource_id, handler);
    }

    pub fn handle_deposit(
        &self,
        source: u8,
        deposit: &EvmDeposit,
        message_id: &str,
    ) -> Result<Message, ChainError> {
        let handler = self.handlers.get(&deposit.resource_id).ok_or_else(|| {
            ChainError::Decode(format!(
                "no handler registered for resource {}",
                hex::encode(deposit.resource_id)
            ))
        })?;
        handler.handle_deposit(
            source,
            deposit.destination_domain_id,
            deposit.deposit_nonce,
            deposit.resource_id,
            &deposit.data,
            &deposit.handler_response,
            message_id,
        )
    }
}

impl Default for DepositHandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::left_pad;
    use crate::relayer::message::MessageData;

    fn fungible_calldata(amount: u64, recipient: &[u8]) -> Vec<u8> {
        let mut data = left_pad(&amount.to_be_bytes(), 32);
        data.extend_from_slice(&left_pad(&(recipient.len() as u64).to_be_bytes(), 32));
        data.extend_from_slice(recipient);
        data
    }

    #[test]
    fn erc20_decodes_amount_and_recipient() {
        let recipient = [0x11u8; 20];
        let calldata = fungible_calldata(19_000, &recipient);
        let msg = Erc20DepositHandler
            .handle_deposit(1, 2, 7, [9; 32], &calldata, &[], "1-2-7")
            .unwrap();

        let MessageData::Transfer(data) = msg.data else { panic!("expected transfer") };
        assert_eq!(data.kind, TransferType::Fungible);
        assert_eq!(data.payload[0], left_pad(&19_000u64.to_be_bytes(), 32));
        assert_eq!(data.payload[1], recipient.to_vec());
    }

    #[test]
    fn erc20_rejects_short_calldata() {
        let err = Erc20DepositHandler
            .handle_deposit(1, 2, 7, [9; 32], &[0u8; 83], &[], "1-2-7")
            .unwrap_err();
        assert!(matches!(err, ChainError::Decode(_)));
    }

    #[test]
    fn erc721_rejects_short_calldata() {
        let err = Erc721DepositHandler
            .handle_deposit(1, 2, 7, [9; 32], &[0u8; 63], &[], "1-2-7")
            .unwrap_err();
        assert!(matches!(err, ChainError::Decode(_)));
    }

    #[test]
    fn erc721_decodes_token_recipient_and_metadata() {
        let recipient = [0x22u8; 20];
        let metadata = b"ipfs://token";
        let mut calldata = left_pad(&42u64.to_be_bytes(), 32);
        calldata.extend_from_slice(&left_pad(&(recipient.len() as u64).to_be_bytes(), 32));
        calldata.extend_from_slice(&recipient);
        calldata.extend_from_slice(&left_pad(&(metadata.len() as u64).to_be_bytes(), 32));
        calldata.extend_from_slice(metadata);

        let msg = Erc721DepositHandler
            .handle_deposit(1, 2, 7, [9; 32], &calldata, &[], "1-2-7")
            .unwrap();
        let MessageData::Transfer(data) = msg.data else { panic!("expected transfer") };
        assert_eq!(data.kind, TransferType::NonFungible);
        assert_eq!(data.payload[1], recipient.to_vec());
        assert_eq!(data.payload[2], metadata.to_vec());
    }

    #[test]
    fn generic_roundtrips_all_fields() {
        let max_fee = left_pad(&50_000u64.to_be_bytes(), 32);
        let sig = [0xde, 0xad, 0xbe, 0xef];
        let addr = [0x33u8; 20];
        let depositor = [0x44u8; 20];
        let execution_data = b"payload bytes".to_vec();

        let mut calldata = max_fee.clone();
        calldata.extend_from_slice(&(sig.len() as u16).to_be_bytes());
        calldata.extend_from_slice(&sig);
        calldata.push(addr.len() as u8);
        calldata.extend_from_slice(&addr);
        calldata.push(depositor.len() as u8);
        calldata.extend_from_slice(&depositor);
        calldata.extend_from_slice(&execution_data);

        let msg = PermissionlessGenericDepositHandler
            .handle_deposit(1, 2, 7, [9; 32], &calldata, &[], "1-2-7")
            .unwrap();
        let MessageData::Transfer(data) = msg.data else { panic!("expected transfer") };
        assert_eq!(data.payload[0], sig.to_vec());
        assert_eq!(data.payload[1], addr.to_vec());
        assert_eq!(data.payload[2], max_fee);
        assert_eq!(data.payload[3], depositor.to_vec());
        assert_eq!(data.payload[4], execution_data);
    }

    #[test]
    fn registry_dispatches_by_resource() {
        let mut registry = DepositHandlerRegistry::new();
        registry.register([9; 32], Arc::new(Erc20DepositHandler));

        let deposit = EvmDeposit {
            destination_domain_id: 2,
            resource_id: [9; 32],
            deposit_nonce: 7,
            sender: [0; 20],
            data: fungible_calldata(5, &[0x55; 20]),
            handler_response: Vec::new(),
        };
        assert!(registry.handle_deposit(1, &deposit, "1-2-7").is_ok());

        let unknown = EvmDeposit { resource_id: [8; 32], ..deposit };
        assert!(registry.handle_deposit(1, &unknown, "1-2-7").is_err());
    }
}
