//! Retry flow: a V1 retry event rewrites a stuck proposal to `failed`
//! and feeds it back into the batching pipeline; `executed` blocks it.

mod common;

use common::temp_db;
use std::sync::Arc;
use tokio::sync::mpsc;
use viaduct::chains::evm::deposit::{DepositHandlerRegistry, Erc20DepositHandler, EvmDeposit};
use viaduct::chains::evm::listener::{EventHandler, RetryV1EventHandler};
use viaduct::chains::evm::loopback::ScriptedEvents;
use viaduct::crypto::left_pad;
use viaduct::store::{PropStatus, PropStore};

fn fungible_deposit(nonce: u64) -> EvmDeposit {
    let recipient = [0x11u8; 20];
    let mut calldata = left_pad(&5_000u64.to_be_bytes(), 32);
    calldata.extend_from_slice(&left_pad(&(recipient.len() as u64).to_be_bytes(), 32));
    calldata.extend_from_slice(&recipient);

    EvmDeposit {
        destination_domain_id: 2,
        resource_id: [9; 32],
        deposit_nonce: nonce,
        sender: [0; 20],
        data: calldata,
        handler_response: Vec::new(),
    }
}

fn retry_handler(
    fetcher: Arc<ScriptedEvents>,
    prop_store: PropStore,
) -> (RetryV1EventHandler, mpsc::Receiver<Vec<viaduct::relayer::Message>>) {
    let mut registry = DepositHandlerRegistry::new();
    registry.register([9; 32], Arc::new(Erc20DepositHandler));
    let (msg_tx, msg_rx) = mpsc::channel(8);
    (RetryV1EventHandler::new(fetcher, Arc::new(registry), prop_store, 1, msg_tx), msg_rx)
}

#[tokio::test]
async fn pending_proposal_is_rewritten_and_reemitted() {
    let prop_store = PropStore::new(temp_db("retry_pending"));
    prop_store.store_status(1, 2, 7, PropStatus::Pending).unwrap();

    let fetcher = Arc::new(ScriptedEvents::new());
    fetcher.push_retry_v1_deposit(5, fungible_deposit(7));
    let (handler, mut msg_rx) = retry_handler(fetcher, prop_store.clone());

    handler.handle_events(0, 10).await.unwrap();

    // Stuck pending is now failed, and the transfer re-enters the pipeline.
    assert_eq!(prop_store.status(1, 2, 7).unwrap(), PropStatus::Failed);
    let messages = msg_rx.recv().await.expect("no retried messages");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].source, 1);
    assert_eq!(messages[0].destination, 2);
}

#[tokio::test]
async fn executed_proposal_blocks_retry() {
    let prop_store = PropStore::new(temp_db("retry_executed"));
    prop_store.store_status(1, 2, 7, PropStatus::Executed).unwrap();

    let fetcher = Arc::new(ScriptedEvents::new());
    fetcher.push_retry_v1_deposit(5, fungible_deposit(7));
    let (handler, mut msg_rx) = retry_handler(fetcher, prop_store.clone());

    handler.handle_events(0, 10).await.unwrap();

    assert_eq!(prop_store.status(1, 2, 7).unwrap(), PropStatus::Executed);
    assert!(msg_rx.try_recv().is_err());
}

#[tokio::test]
async fn unknown_proposal_is_still_retried() {
    let prop_store = PropStore::new(temp_db("retry_missing"));

    let fetcher = Arc::new(ScriptedEvents::new());
    fetcher.push_retry_v1_deposit(5, fungible_deposit(8));
    let (handler, mut msg_rx) = retry_handler(fetcher, prop_store.clone());

    handler.handle_events(0, 10).await.unwrap();
    assert!(msg_rx.recv().await.is_some());
}
