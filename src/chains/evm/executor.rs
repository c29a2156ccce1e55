//! Batched proposal execution on an EVM destination.
//!
//! Proposals aggregate into gas-bounded batches; each non-empty batch gets
//! its own signing session named after the batch fingerprint, and an
//! execution watcher that polls the destination until every proposal in
//! the batch reports executed.

use crate::chains::evm::fingerprint::proposals_hash;
use crate::chains::{ChainError, TransferProposal};
use crate::comm::wire::MessageType;
use crate::comm::Communication;
use crate::keyshare::EcdsaKeyshareStore;
use crate::store::{PropStatus, PropStore};
use crate::tss::party::PartyFactory;
use crate::tss::signing::{signing_session_id, Signing};
use crate::tss::{Coordinator, SignatureParts};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Gas charged for a transfer with no `gasLimit` metadata.
pub const TRANSFER_GAS_COST: u64 = 200_000;

/// Default cadence of the execution watcher.
pub const DEFAULT_EXECUTION_CHECK_PERIOD: Duration = Duration::from_secs(60);

/// Default executor-level cap per batch.
pub const DEFAULT_SIGNING_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Default)]
pub struct TransactOptions {
    pub gas_limit: u64,
}

/// Destination bridge contract surface.
#[async_trait]
pub trait BridgeContract: Send + Sync + 'static {
    async fn is_proposal_executed(&self, proposal: &TransferProposal) -> Result<bool, ChainError>;
    async fn execute_proposals(
        &self,
        proposals: &[TransferProposal],
        signature: &[u8],
        opts: TransactOptions,
    ) -> Result<[u8; 32], ChainError>;
}

/// A closed, gas-bounded group of proposals signed together.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub proposals: Vec<TransferProposal>,
    pub gas_limit: u64,
}

fn proposal_gas(proposal: &TransferProposal) -> u64 {
    proposal
        .data
        .metadata
        .get("gasLimit")
        .and_then(|v| v.as_u64())
        .unwrap_or(TRANSFER_GAS_COST)
}

/// Walk proposals in order, sealing the current batch whenever the next
/// proposal would push it past `max_gas`: a closed batch's gas sum never
/// exceeds the cap. Input order is preserved within batches.
pub fn build_batches(proposals: Vec<TransferProposal>, max_gas: u64) -> Vec<Batch> {
    let mut batches = vec![Batch::default()];
    for proposal in proposals {
        let gas = proposal_gas(&proposal);
        let current = batches.last_mut().unwrap();
        if !current.proposals.is_empty() && current.gas_limit + gas > max_gas {
            batches.push(Batch::default());
        }
        let current = batches.last_mut().unwrap();
        current.gas_limit += gas;
        current.proposals.push(proposal);
    }
    batches
}

/// Pack `R ‖ S ‖ v` with `v` offset to the destination's 27/28 form.
pub fn assemble_signature(sig: &SignatureParts) -> Vec<u8> {
    let mut wire = crate::crypto::left_pad(&sig.r, 32);
    wire.extend_from_slice(&crate::crypto::left_pad(&sig.s, 32));
    wire.push(sig.recovery + 27);
    wire
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// EVM chain id of the destination, bound into the fingerprint.
    pub chain_id: u64,
    /// Gas ceiling of one submitted transaction.
    pub transaction_max_gas: u64,
    pub execution_check_period: Duration,
    pub signing_timeout: Duration,
}

impl ExecutorConfig {
    pub fn new(chain_id: u64, transaction_max_gas: u64) -> Self {
        Self {
            chain_id,
            transaction_max_gas,
            execution_check_period: DEFAULT_EXECUTION_CHECK_PERIOD,
            signing_timeout: DEFAULT_SIGNING_TIMEOUT,
        }
    }
}

pub struct Executor<F> {
    comm: Arc<Communication>,
    coordinator: Arc<Coordinator>,
    bridge: Arc<dyn BridgeContract>,
    keyshare_store: Arc<EcdsaKeyshareStore>,
    party_factory: Arc<F>,
    prop_store: PropStore,
    exit_lock: Arc<RwLock<()>>,
    config: ExecutorConfig,
}

impl<F: PartyFactory<Output = SignatureParts>> Executor<F> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        comm: Arc<Communication>,
        coordinator: Arc<Coordinator>,
        bridge: Arc<dyn BridgeContract>,
        keyshare_store: Arc<EcdsaKeyshareStore>,
        party_factory: Arc<F>,
        prop_store: PropStore,
        exit_lock: Arc<RwLock<()>>,
        config: ExecutorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            comm,
            coordinator,
            bridge,
            keyshare_store,
            party_factory,
            prop_store,
            exit_lock,
            config,
        })
    }

    /// Sign and execute `proposals`, one session per gas-bounded batch.
    /// Holds the process exit lock shared, so shutdown waits for in-flight
    /// sessions to drain.
    pub async fn execute(self: &Arc<Self>, proposals: Vec<TransferProposal>) -> Result<(), ChainError> {
        let _exit = self.exit_lock.read().await;

        let batches = self.batch(proposals).await?;
        let mut tasks = tokio::task::JoinSet::new();
        for batch in batches {
            if batch.proposals.is_empty() {
                continue;
            }
            for proposal in &batch.proposals {
                self.prop_store.store_status(
                    proposal.source,
                    proposal.destination,
                    proposal.data.deposit_nonce,
                    PropStatus::Pending,
                )?;
            }
            let this = self.clone();
            tasks.spawn(async move { this.execute_batch(batch).await });
        }

        let mut outcome = Ok(());
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|e| Err(ChainError::Other(e.to_string())));
            if outcome.is_ok() {
                outcome = result;
            }
        }
        outcome
    }

    /// Skip already-executed proposals, then seal the rest into batches.
    async fn batch(&self, proposals: Vec<TransferProposal>) -> Result<Vec<Batch>, ChainError> {
        let mut outstanding = Vec::with_capacity(proposals.len());
        for proposal in proposals {
            if self.bridge.is_proposal_executed(&proposal).await? {
                info!(
                    nonce = proposal.data.deposit_nonce,
                    destination = proposal.destination,
                    "proposal already executed"
                );
                continue;
            }
            outstanding.push(proposal);
        }
        Ok(build_batches(outstanding, self.config.transaction_max_gas))
    }

    async fn execute_batch(self: Arc<Self>, batch: Batch) -> Result<(), ChainError> {
        let digest = proposals_hash(&batch.proposals, self.config.chain_id);
        let session_id = signing_session_id(&digest);
        let nonces: Vec<u64> = batch.proposals.iter().map(|p| p.data.deposit_nonce).collect();
        info!(session_id, ?nonces, gas = batch.gas_limit, "executing batch");

        let signing = Arc::new(
            Signing::new(
                digest.to_vec(),
                session_id.clone(),
                self.comm.clone(),
                &self.keyshare_store,
                self.party_factory.clone(),
            )
            .await?,
        );

        let (sig_tx, sig_rx) = mpsc::channel(1);
        let execution_ctx = CancellationToken::new();
        let watch_ctx = CancellationToken::new();

        let coordinator = self.coordinator.clone();
        let signing_ctx = execution_ctx.clone();
        let watch_cancel = watch_ctx.clone();
        let session = tokio::spawn(async move {
            let outcome = coordinator.execute(signing_ctx, signing, sig_tx).await;
            if outcome.is_err() {
                watch_cancel.cancel();
            }
            outcome
        });

        let watch_outcome = self
            .watch_execution(watch_ctx, execution_ctx.clone(), &batch, sig_rx, &session_id)
            .await;
        // The watcher's verdict ends the signing session either way.
        execution_ctx.cancel();
        let session_outcome = match session.await {
            Ok(outcome) => outcome.map_err(|e| ChainError::Other(e.to_string())),
            Err(e) => Err(ChainError::Other(e.to_string())),
        };

        let result = watch_outcome.and(session_outcome);
        if let Err(e) = &result {
            error!(session_id, destination = self.config.chain_id, ?nonces, "batch failed: {e}");
            // Conditional write: a concurrent execution confirmation wins.
            for proposal in &batch.proposals {
                let _ = self.prop_store.store_status(
                    proposal.source,
                    proposal.destination,
                    proposal.data.deposit_nonce,
                    PropStatus::Failed,
                );
            }
        }
        result
    }

    /// Wait for the signature and submit it, while independently polling
    /// the destination until the whole batch reports executed.
    async fn watch_execution(
        &self,
        ctx: CancellationToken,
        cancel_execution: CancellationToken,
        batch: &Batch,
        mut sig_rx: mpsc::Receiver<SignatureParts>,
        session_id: &str,
    ) -> Result<(), ChainError> {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.execution_check_period,
            self.config.execution_check_period,
        );
        let timeout = tokio::time::sleep(self.config.signing_timeout);
        tokio::pin!(timeout);

        loop {
            tokio::select! {
                Some(signature) = sig_rx.recv() => {
                    cancel_execution.cancel();
                    let wire = assemble_signature(&signature);
                    match self
                        .bridge
                        .execute_proposals(&batch.proposals, &wire, TransactOptions { gas_limit: batch.gas_limit })
                        .await
                    {
                        Ok(hash) => {
                            info!(session_id, tx = %hex::encode(hash), "sent proposals execution");
                        }
                        Err(e) => {
                            // Tell the peers to abort their sessions too.
                            self.comm.broadcast(
                                &self.comm.peers(),
                                Vec::new(),
                                MessageType::Fail,
                                session_id,
                                None,
                            );
                            return Err(e);
                        }
                    }
                }
                _ = ticker.tick() => {
                    if !self.proposals_executed(&batch.proposals).await {
                        continue;
                    }
                    for proposal in &batch.proposals {
                        self.prop_store.store_status(
                            proposal.source,
                            proposal.destination,
                            proposal.data.deposit_nonce,
                            PropStatus::Executed,
                        )?;
                    }
                    info!(session_id, "successfully executed proposals");
                    return Ok(());
                }
                _ = &mut timeout => {
                    return Err(ChainError::Other(format!(
                        "execution timed out in {:?}",
                        self.config.signing_timeout
                    )));
                }
                _ = ctx.cancelled() => return Ok(()),
            }
        }
    }

    async fn proposals_executed(&self, proposals: &[TransferProposal]) -> bool {
        for proposal in proposals {
            match self.bridge.is_proposal_executed(proposal).await {
                Ok(true) => continue,
                Ok(false) => return false,
                Err(e) => {
                    warn!("execution check failed: {e}");
                    return false;
                }
            }
        }
        true
    }
}
