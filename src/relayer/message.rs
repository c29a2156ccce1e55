//! Messages flowing from chain listeners to destination executors.

use std::collections::HashMap;

/// Kinds of cross-chain transfer a handler can decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Fungible,
    NonFungible,
    PermissionlessGeneric,
}

/// Decoded deposit on its way to becoming a proposal.
#[derive(Debug, Clone)]
pub struct TransferMessageData {
    pub deposit_nonce: u64,
    pub resource_id: [u8; 32],
    pub metadata: HashMap<String, serde_json::Value>,
    /// Handler-specific fields in deposit order (amount/recipient for
    /// fungible transfers, and so on).
    pub payload: Vec<Vec<u8>>,
    pub kind: TransferType,
}

/// A V2 retry request observed on the source chain.
#[derive(Debug, Clone)]
pub struct RetryMessageData {
    pub source_domain_id: u8,
    pub destination_domain_id: u8,
    pub block_height: u64,
    pub resource_id: [u8; 32],
}

#[derive(Debug, Clone)]
pub enum MessageData {
    Transfer(TransferMessageData),
    Retry(RetryMessageData),
}

/// One unit of work routed between domains.
#[derive(Debug, Clone)]
pub struct Message {
    pub source: u8,
    pub destination: u8,
    pub id: String,
    pub data: MessageData,
}

impl Message {
    pub fn new_transfer(
        source: u8,
        destination: u8,
        id: String,
        data: TransferMessageData,
    ) -> Self {
        Self { source, destination, id, data: MessageData::Transfer(data) }
    }

    pub fn new_retry(source: u8, destination: u8, id: String, data: RetryMessageData) -> Self {
        Self { source, destination, id, data: MessageData::Retry(data) }
    }
}
