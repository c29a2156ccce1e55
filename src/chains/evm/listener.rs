//! EVM source-side event handling: block polling plus one handler per
//! event family (deposits, keygen requests, topology refreshes, retries).

use crate::chains::evm::deposit::{DepositHandlerRegistry, EvmDeposit};
use crate::chains::ChainError;
use crate::comm::Communication;
use crate::keyshare::{EcdsaKeyshareStore, KeyshareStorer};
use crate::relayer::message::Message;
use crate::store::{BlockStore, PropStatus, PropStore};
use crate::topology::{load_topology, NetworkTopology, TopologyStore};
use crate::tss::keygen::{frost_keygen_session_id, keygen_session_id, Keygen, KeygenOutput};
use crate::tss::party::PartyFactory;
use crate::tss::resharing::{resharing_session_id, Resharing};
use crate::tss::Coordinator;
use async_trait::async_trait;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// An on-chain keygen request.
#[derive(Debug, Clone)]
pub struct KeygenRequest {
    pub block: u64,
}

/// An on-chain topology refresh announcement.
#[derive(Debug, Clone)]
pub struct RefreshEvent {
    /// Content hash naming the new topology.
    pub hash: String,
}

/// A V2 retry request.
#[derive(Debug, Clone)]
pub struct RetryV2Event {
    pub source_domain_id: u8,
    pub destination_domain_id: u8,
    pub block_height: u64,
    pub resource_id: [u8; 32],
}

/// Chain RPC surface the listener consumes; implemented by the operator's
/// client of choice.
#[async_trait]
pub trait EventFetcher: Send + Sync + 'static {
    async fn latest_block(&self) -> Result<u64, ChainError>;
    async fn fetch_deposits(&self, start: u64, end: u64) -> Result<Vec<EvmDeposit>, ChainError>;
    async fn fetch_keygen_requests(&self, start: u64, end: u64) -> Result<Vec<KeygenRequest>, ChainError>;
    async fn fetch_frost_keygen_requests(&self, start: u64, end: u64) -> Result<Vec<KeygenRequest>, ChainError>;
    async fn fetch_refresh_events(&self, start: u64, end: u64) -> Result<Vec<RefreshEvent>, ChainError>;
    async fn fetch_retry_v2_events(&self, start: u64, end: u64) -> Result<Vec<RetryV2Event>, ChainError>;
    /// Deposits re-requested through V1 retry transactions in the range.
    async fn fetch_retry_v1_deposits(&self, start: u64, end: u64) -> Result<Vec<EvmDeposit>, ChainError>;
}

/// Resolves a refreshed topology from its announced hash.
pub trait TopologyProvider: Send + Sync + 'static {
    fn network_topology(&self, hash: &str) -> Result<NetworkTopology, ChainError>;
}

/// Provider backed by an operator-distributed topology file; the
/// announced hash only gates that a refresh happened.
pub struct FileTopologyProvider {
    path: std::path::PathBuf,
}

impl FileTopologyProvider {
    pub fn new<P: AsRef<std::path::Path>>(path: P) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }
}

impl TopologyProvider for FileTopologyProvider {
    fn network_topology(&self, _hash: &str) -> Result<NetworkTopology, ChainError> {
        load_topology(&self.path).map_err(|e| ChainError::Other(e.to_string()))
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_events(&self, start: u64, end: u64) -> Result<(), ChainError>;
}

fn message_id(source: u8, destination: u8, nonce: u64) -> String {
    format!("{source}-{destination}-{nonce}")
}

/// Decodes deposits into transfer messages, grouped per destination.
pub struct DepositEventHandler {
    fetcher: Arc<dyn EventFetcher>,
    registry: Arc<DepositHandlerRegistry>,
    domain_id: u8,
    msg_tx: mpsc::Sender<Vec<Message>>,
}

impl DepositEventHandler {
    pub fn new(
        fetcher: Arc<dyn EventFetcher>,
        registry: Arc<DepositHandlerRegistry>,
        domain_id: u8,
        msg_tx: mpsc::Sender<Vec<Message>>,
    ) -> Self {
        Self { fetcher, registry, domain_id, msg_tx }
    }
}

#[async_trait]
impl EventHandler for DepositEventHandler {
    async fn handle_events(&self, start: u64, end: u64) -> Result<(), ChainError> {
        let deposits = self.fetcher.fetch_deposits(start, end).await?;
        let mut by_destination: std::collections::HashMap<u8, Vec<Message>> = Default::default();

        for deposit in &deposits {
            let id = message_id(self.domain_id, deposit.destination_domain_id, deposit.deposit_nonce);
            // A decode panic in one handler must not halt the listener.
            let handled = catch_unwind(AssertUnwindSafe(|| {
                self.registry.handle_deposit(self.domain_id, deposit, &id)
            }));
            match handled {
                Ok(Ok(message)) => {
                    debug!(message_id = id, "resolved deposit in range {start}-{end}");
                    by_destination.entry(message.destination).or_default().push(message);
                }
                Ok(Err(e)) => {
                    error!(message_id = id, domain_id = self.domain_id, "failed handling deposit: {e}");
                }
                Err(_) => {
                    error!(message_id = id, "panic occurred while handling deposit");
                }
            }
        }

        for (_, messages) in by_destination {
            let _ = self.msg_tx.send(messages).await;
        }
        Ok(())
    }
}

/// Which keygen request family a handler listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeygenScheme {
    Ecdsa,
    Frost,
}

/// Starts a keygen session on an on-chain request, unless a key share
/// already exists.
pub struct KeygenEventHandler<F, S> {
    fetcher: Arc<dyn EventFetcher>,
    coordinator: Arc<Coordinator>,
    comm: Arc<Communication>,
    store: Arc<S>,
    factory: Arc<F>,
    scheme: KeygenScheme,
}

impl<F, S> KeygenEventHandler<F, S> {
    pub fn new(
        fetcher: Arc<dyn EventFetcher>,
        coordinator: Arc<Coordinator>,
        comm: Arc<Communication>,
        store: Arc<S>,
        factory: Arc<F>,
        scheme: KeygenScheme,
    ) -> Self {
        Self { fetcher, coordinator, comm, store, factory, scheme }
    }
}

#[async_trait]
impl<F, S> EventHandler for KeygenEventHandler<F, S>
where
    F: PartyFactory<Output = KeygenOutput>,
    S: KeyshareStorer,
{
    async fn handle_events(&self, start: u64, end: u64) -> Result<(), ChainError> {
        if self.store.has_share().await {
            return Ok(());
        }
        let requests = match self.scheme {
            KeygenScheme::Ecdsa => self.fetcher.fetch_keygen_requests(start, end).await?,
            KeygenScheme::Frost => self.fetcher.fetch_frost_keygen_requests(start, end).await?,
        };
        let Some(request) = requests.first() else { return Ok(()) };
        info!(scheme = ?self.scheme, "resolved keygen request in block range {start}-{end}");

        let session_id = match self.scheme {
            KeygenScheme::Ecdsa => keygen_session_id(request.block),
            KeygenScheme::Frost => frost_keygen_session_id(request.block),
        };
        let topology = self.comm.topology();
        let keygen = Arc::new(Keygen::new(
            session_id,
            topology.threshold,
            topology.peer_ids(),
            self.comm.clone(),
            self.store.clone(),
            self.factory.clone(),
        ));
        let (result_tx, _result_rx) = mpsc::channel(1);
        if let Err(e) = self.coordinator.execute(CancellationToken::new(), keygen, result_tx).await {
            error!("failed executing keygen: {e}");
        }
        Ok(())
    }
}

/// Applies a refreshed topology and reshares the key to it.
pub struct RefreshEventHandler<F> {
    fetcher: Arc<dyn EventFetcher>,
    provider: Arc<dyn TopologyProvider>,
    topology_store: Arc<TopologyStore>,
    coordinator: Arc<Coordinator>,
    comm: Arc<Communication>,
    store: Arc<EcdsaKeyshareStore>,
    factory: Arc<F>,
}

impl<F> RefreshEventHandler<F> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fetcher: Arc<dyn EventFetcher>,
        provider: Arc<dyn TopologyProvider>,
        topology_store: Arc<TopologyStore>,
        coordinator: Arc<Coordinator>,
        comm: Arc<Communication>,
        store: Arc<EcdsaKeyshareStore>,
        factory: Arc<F>,
    ) -> Self {
        Self { fetcher, provider, topology_store, coordinator, comm, store, factory }
    }
}

#[async_trait]
impl<F: PartyFactory<Output = KeygenOutput>> EventHandler for RefreshEventHandler<F> {
    async fn handle_events(&self, start: u64, end: u64) -> Result<(), ChainError> {
        let events = self.fetcher.fetch_refresh_events(start, end).await?;
        let Some(event) = events.last() else { return Ok(()) };
        if event.hash.is_empty() {
            return Err(ChainError::Decode("refresh hash cannot be an empty string".into()));
        }

        let topology = self.provider.network_topology(&event.hash)?;
        self.topology_store
            .store(&topology)
            .map_err(|e| ChainError::Other(e.to_string()))?;
        self.comm.set_topology(topology.clone());
        info!("resolved refresh event in block range {start}-{end}");

        let resharing = Arc::new(Resharing::new(
            resharing_session_id(start),
            topology.threshold,
            topology.peer_ids(),
            self.comm.clone(),
            self.store.clone(),
            self.factory.clone(),
        ));
        let (result_tx, _result_rx) = mpsc::channel(1);
        if let Err(e) = self.coordinator.execute(CancellationToken::new(), resharing, result_tx).await {
            error!("failed executing key refresh: {e}");
        }
        Ok(())
    }
}

/// V1 retries: re-handle the referenced deposits, rewriting stuck
/// `pending` proposals to `failed` so batching picks them up again.
pub struct RetryV1EventHandler {
    fetcher: Arc<dyn EventFetcher>,
    registry: Arc<DepositHandlerRegistry>,
    prop_store: PropStore,
    domain_id: u8,
    msg_tx: mpsc::Sender<Vec<Message>>,
}

impl RetryV1EventHandler {
    pub fn new(
        fetcher: Arc<dyn EventFetcher>,
        registry: Arc<DepositHandlerRegistry>,
        prop_store: PropStore,
        domain_id: u8,
        msg_tx: mpsc::Sender<Vec<Message>>,
    ) -> Self {
        Self { fetcher, registry, prop_store, domain_id, msg_tx }
    }

    /// `true` when the proposal is already executed and the retry must be
    /// dropped. A stuck `pending` is rewritten to `failed` on the way.
    fn is_executed(&self, source: u8, destination: u8, nonce: u64) -> Result<bool, ChainError> {
        match self.prop_store.status(source, destination, nonce)? {
            PropStatus::Executed => Ok(true),
            PropStatus::Pending => {
                self.prop_store.store_status(source, destination, nonce, PropStatus::Failed)?;
                Ok(false)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl EventHandler for RetryV1EventHandler {
    async fn handle_events(&self, start: u64, end: u64) -> Result<(), ChainError> {
        let deposits = self.fetcher.fetch_retry_v1_deposits(start, end).await?;
        let mut by_destination: std::collections::HashMap<u8, Vec<Message>> = Default::default();

        for deposit in &deposits {
            let id = message_id(self.domain_id, deposit.destination_domain_id, deposit.deposit_nonce);
            let handled = catch_unwind(AssertUnwindSafe(|| {
                self.registry.handle_deposit(self.domain_id, deposit, &id)
            }));
            let message = match handled {
                Ok(Ok(message)) => message,
                Ok(Err(e)) => {
                    error!(message_id = id, "failed handling retried deposit: {e}");
                    continue;
                }
                Err(_) => {
                    error!(message_id = id, "panic occurred while handling retried deposit");
                    continue;
                }
            };

            match self.is_executed(self.domain_id, deposit.destination_domain_id, deposit.deposit_nonce) {
                Ok(true) => {
                    debug!(message_id = id, "deposit already executed, skipping retry");
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    error!(message_id = id, "failed checking execution status: {e}");
                    continue;
                }
            }

            info!(message_id = id, "resolved retry message in block range {start}-{end}");
            by_destination.entry(message.destination).or_default().push(message);
        }

        for (_, messages) in by_destination {
            let _ = self.msg_tx.send(messages).await;
        }
        Ok(())
    }
}

/// V2 retries: forward the request to the transfer's source domain, which
/// re-resolves the deposits itself.
pub struct RetryV2EventHandler {
    fetcher: Arc<dyn EventFetcher>,
    domain_id: u8,
    msg_tx: mpsc::Sender<Vec<Message>>,
}

impl RetryV2EventHandler {
    pub fn new(
        fetcher: Arc<dyn EventFetcher>,
        domain_id: u8,
        msg_tx: mpsc::Sender<Vec<Message>>,
    ) -> Self {
        Self { fetcher, domain_id, msg_tx }
    }
}

#[async_trait]
impl EventHandler for RetryV2EventHandler {
    async fn handle_events(&self, start: u64, end: u64) -> Result<(), ChainError> {
        let events = self.fetcher.fetch_retry_v2_events(start, end).await?;
        for event in events {
            let id = format!("retry-{}-{}", event.source_domain_id, event.destination_domain_id);
            let message = Message::new_retry(
                self.domain_id,
                event.source_domain_id,
                id.clone(),
                crate::relayer::message::RetryMessageData {
                    source_domain_id: event.source_domain_id,
                    destination_domain_id: event.destination_domain_id,
                    block_height: event.block_height,
                    resource_id: event.resource_id,
                },
            );
            info!(message_id = id, "resolved retry message in block range {start}-{end}");
            let _ = self.msg_tx.send(vec![message]).await;
        }
        Ok(())
    }
}

/// Block-poll loop: walks confirmed ranges and feeds them to every
/// registered handler, persisting progress per domain.
pub struct EvmListener {
    fetcher: Arc<dyn EventFetcher>,
    handlers: Vec<Arc<dyn EventHandler>>,
    block_store: BlockStore,
    domain_id: u8,
    block_interval: u64,
    block_confirmations: u64,
    block_retry_interval: Duration,
    start_block: u64,
}

impl EvmListener {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fetcher: Arc<dyn EventFetcher>,
        handlers: Vec<Arc<dyn EventHandler>>,
        block_store: BlockStore,
        domain_id: u8,
        block_interval: u64,
        block_confirmations: u64,
        block_retry_interval: Duration,
        start_block: u64,
    ) -> Self {
        Self {
            fetcher,
            handlers,
            block_store,
            domain_id,
            block_interval,
            block_confirmations,
            block_retry_interval,
            start_block,
        }
    }

    pub async fn listen(&self, ctx: CancellationToken) {
        let mut next = match self.block_store.latest_block(self.domain_id) {
            Ok(Some(block)) => block + 1,
            _ => self.start_block,
        };
        info!(domain_id = self.domain_id, start = next, "listening for events");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.block_retry_interval) => {
                    if let Err(e) = self.poll_once(&mut next).await {
                        warn!(domain_id = self.domain_id, "event poll failed: {e}");
                    }
                }
                _ = ctx.cancelled() => break,
            }
        }
    }

    async fn poll_once(&self, next: &mut u64) -> Result<(), ChainError> {
        let head = self.fetcher.latest_block().await?;
        let end = next.saturating_add(self.block_interval - 1);
        // Only walk ranges that have settled past the confirmation depth.
        if head.saturating_sub(self.block_confirmations) < end {
            return Ok(());
        }

        for handler in &self.handlers {
            handler.handle_events(*next, end).await?;
        }

        self.block_store.store_block(self.domain_id, end)?;
        *next = end + 1;
        Ok(())
    }
}
