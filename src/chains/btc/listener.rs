//! Bitcoin deposit detection.
//!
//! A transaction is a bridge deposit iff one `vout` is a `nulldata`
//! script whose content (after the two opcode bytes) is UTF-8 destination
//! metadata AND another `vout` pays the configured bridge address. The
//! metadata is `<evm-address>_<destination-domain>`.

use crate::chains::ChainError;
use crate::relayer::message::{Message, TransferMessageData, TransferType};
use crate::store::BlockStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Default)]
pub struct ScriptPubKey {
    /// Script class as reported by the node (`nulldata`, taproot, ...).
    pub script_type: String,
    pub hex: String,
    pub address: String,
}

#[derive(Debug, Clone, Default)]
pub struct TxOut {
    /// Value in whole bitcoin, as reported by the node.
    pub value: f64,
    pub script_pub_key: ScriptPubKey,
}

#[derive(Debug, Clone, Default)]
pub struct RawTx {
    pub txid: String,
    pub vout: Vec<TxOut>,
}

/// One watched bridge address and the resource it maps to.
#[derive(Debug, Clone)]
pub struct BtcResource {
    pub resource_id: [u8; 32],
    pub address: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BtcDeposit {
    pub resource_id: [u8; 32],
    /// Amount in satoshi.
    pub amount: u64,
    /// OP_RETURN metadata, `<evm-address>_<domain>`.
    pub data: String,
}

/// Decode one transaction against one watched resource.
///
/// `Ok(None)`: not a bridge deposit (no vout pays the bridge address).
/// `Err(_)`: it addressed the bridge but its metadata is unusable.
pub fn decode_deposit(tx: &RawTx, resource: &BtcResource) -> Result<Option<BtcDeposit>, ChainError> {
    let mut amount: Option<u64> = None;
    let mut data = String::new();

    for vout in &tx.vout {
        if vout.script_pub_key.script_type == "nulldata" {
            let script = hex::decode(&vout.script_pub_key.hex)
                .map_err(|e| ChainError::Decode(format!("invalid OP_RETURN hex: {e}")))?;
            if script.len() < 2 {
                return Err(ChainError::Decode("OP_RETURN script too short".into()));
            }
            data = String::from_utf8(script[2..].to_vec())
                .map_err(|e| ChainError::Decode(format!("OP_RETURN data is not UTF-8: {e}")))?;
        }
        if vout.script_pub_key.address == resource.address {
            amount = Some((vout.value * 1e8).round() as u64);
        }
    }

    match amount {
        None => Ok(None),
        Some(amount) => Ok(Some(BtcDeposit { resource_id: resource.resource_id, amount, data })),
    }
}

/// Turn a decoded deposit into a fungible transfer message for its
/// destination domain.
pub fn handle_deposit(
    source: u8,
    nonce: u64,
    deposit: &BtcDeposit,
) -> Result<Message, ChainError> {
    let (recipient, domain) = deposit
        .data
        .split_once('_')
        .ok_or_else(|| ChainError::Decode(format!("malformed deposit metadata {:?}", deposit.data)))?;
    let destination: u8 = domain
        .parse()
        .map_err(|_| ChainError::Decode(format!("bad destination domain {domain:?}")))?;
    let recipient = hex::decode(recipient.trim_start_matches("0x"))
        .map_err(|e| ChainError::Decode(format!("bad recipient address: {e}")))?;

    Ok(Message::new_transfer(
        source,
        destination,
        format!("{source}-{destination}-{nonce}"),
        TransferMessageData {
            deposit_nonce: nonce,
            resource_id: deposit.resource_id,
            metadata: HashMap::new(),
            payload: vec![deposit.amount.to_be_bytes().to_vec(), recipient],
            kind: TransferType::Fungible,
        },
    ))
}

/// Node RPC surface consumed by the listener.
#[async_trait]
pub trait BtcConnection: Send + Sync + 'static {
    async fn latest_block(&self) -> Result<u64, ChainError>;
    async fn block_transactions(&self, height: u64) -> Result<Vec<RawTx>, ChainError>;
}

pub struct BtcListener {
    conn: Arc<dyn BtcConnection>,
    resources: Vec<BtcResource>,
    block_store: BlockStore,
    domain_id: u8,
    block_confirmations: u64,
    block_retry_interval: Duration,
    start_block: u64,
    msg_tx: mpsc::Sender<Vec<Message>>,
}

impl BtcListener {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conn: Arc<dyn BtcConnection>,
        resources: Vec<BtcResource>,
        block_store: BlockStore,
        domain_id: u8,
        block_confirmations: u64,
        block_retry_interval: Duration,
        start_block: u64,
        msg_tx: mpsc::Sender<Vec<Message>>,
    ) -> Self {
        Self {
            conn,
            resources,
            block_store,
            domain_id,
            block_confirmations,
            block_retry_interval,
            start_block,
            msg_tx,
        }
    }

    pub async fn listen(&self, ctx: CancellationToken) {
        let mut next = match self.block_store.latest_block(self.domain_id) {
            Ok(Some(block)) => block + 1,
            _ => self.start_block,
        };
        info!(domain_id = self.domain_id, start = next, "listening for deposits");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.block_retry_interval) => {
                    if let Err(e) = self.poll_once(&mut next).await {
                        warn!(domain_id = self.domain_id, "deposit poll failed: {e}");
                    }
                }
                _ = ctx.cancelled() => break,
            }
        }
    }

    async fn poll_once(&self, next: &mut u64) -> Result<(), ChainError> {
        let head = self.conn.latest_block().await?;
        if head.saturating_sub(self.block_confirmations) < *next {
            return Ok(());
        }

        let transactions = self.conn.block_transactions(*next).await?;
        let mut messages = Vec::new();
        for (index, tx) in transactions.iter().enumerate() {
            // Nonces are unique per (block, transaction position).
            let nonce = (*next << 16) | index as u64;
            for resource in &self.resources {
                match decode_deposit(tx, resource) {
                    Ok(None) => continue,
                    Ok(Some(deposit)) => {
                        info!(txid = tx.txid, amount = deposit.amount, "decoded bridge deposit");
                        match handle_deposit(self.domain_id, nonce, &deposit) {
                            Ok(message) => messages.push(message),
                            Err(e) => error!(txid = tx.txid, "failed handling deposit: {e}"),
                        }
                    }
                    // One undecodable deposit must not halt the listener.
                    Err(e) => error!(txid = tx.txid, "failed decoding deposit: {e}"),
                }
            }
        }

        if !messages.is_empty() {
            let _ = self.msg_tx.send(messages).await;
        }
        self.block_store.store_block(self.domain_id, *next)?;
        *next += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relayer::message::MessageData;

    const BRIDGE_ADDRESS: &str = "tb1qln69zuhdunc9stwfh6t7adexxrcr04ppy6thgm";
    // OP_RETURN carrying "0xe9f23A8289764280697a03aC06795eA92a170e42_1".
    const OP_RETURN_HEX: &str =
        "6a2c3078653966323341383238393736343238303639376130336143303637393565413932613137306534325f31";

    fn resource() -> BtcResource {
        BtcResource { resource_id: [0; 32], address: BRIDGE_ADDRESS.to_string() }
    }

    fn deposit_tx(nulldata_hex: &str, pay_to: &str) -> RawTx {
        RawTx {
            txid: "00000000000000000008bba5a6ff31fdb9bb1d4147905b5b3c47a07a07235bfc".into(),
            vout: vec![
                TxOut {
                    value: 0.0,
                    script_pub_key: ScriptPubKey {
                        script_type: "nulldata".into(),
                        hex: nulldata_hex.into(),
                        address: String::new(),
                    },
                },
                TxOut {
                    value: 0.00019,
                    script_pub_key: ScriptPubKey {
                        script_type: "witness_v1_taproot".into(),
                        hex: String::new(),
                        address: pay_to.into(),
                    },
                },
            ],
        }
    }

    #[test]
    fn decodes_deposit_event() {
        let tx = deposit_tx(OP_RETURN_HEX, BRIDGE_ADDRESS);
        let deposit = decode_deposit(&tx, &resource()).unwrap().unwrap();
        assert_eq!(deposit.amount, 19_000);
        assert_eq!(deposit.data, "0xe9f23A8289764280697a03aC06795eA92a170e42_1");
        assert_eq!(deposit.resource_id, [0; 32]);
    }

    #[test]
    fn invalid_op_return_data_is_an_error() {
        let tx = deposit_tx("InvalidCharć", BRIDGE_ADDRESS);
        assert!(decode_deposit(&tx, &resource()).is_err());
    }

    #[test]
    fn not_a_bridge_deposit_without_bridge_vout() {
        let tx = deposit_tx(OP_RETURN_HEX, "NotBridgeAddress");
        assert_eq!(decode_deposit(&tx, &resource()).unwrap(), None);
    }

    #[test]
    fn deposit_becomes_fungible_transfer() {
        let tx = deposit_tx(OP_RETURN_HEX, BRIDGE_ADDRESS);
        let deposit = decode_deposit(&tx, &resource()).unwrap().unwrap();
        let message = handle_deposit(3, 42, &deposit).unwrap();

        assert_eq!(message.source, 3);
        assert_eq!(message.destination, 1);
        let MessageData::Transfer(data) = message.data else { panic!("expected transfer") };
        assert_eq!(data.kind, TransferType::Fungible);
        assert_eq!(data.payload[0], 19_000u64.to_be_bytes().to_vec());
        assert_eq!(data.payload[1], hex::decode("e9f23A8289764280697a03aC06795eA92a170e42").unwrap());
    }

    #[test]
    fn malformed_metadata_is_rejected() {
        let deposit = BtcDeposit { resource_id: [0; 32], amount: 1, data: "no-separator".into() };
        assert!(handle_deposit(3, 1, &deposit).is_err());
    }
}
