//! Chain-facing types shared by listeners and executors.

pub mod btc;
pub mod evm;

use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("submission error: {0}")]
    Submission(String),
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("key share error: {0}")]
    Keyshare(#[from] crate::keyshare::KeyshareError),
    #[error("{0}")]
    Other(String),
}

/// The canonical representation of a transfer ready to execute on its
/// destination. `(source, destination, deposit_nonce)` is unique per
/// logical transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProposal {
    pub source: u8,
    pub destination: u8,
    pub data: TransferProposalData,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferProposalData {
    pub deposit_nonce: u64,
    pub resource_id: [u8; 32],
    pub metadata: HashMap<String, serde_json::Value>,
    /// Destination-handler calldata, packed by the message handler.
    pub data: Vec<u8>,
}
