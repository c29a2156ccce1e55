//! Viaduct relayer daemon.
//!
//! Wires the peer fabric, session coordinator, stores and configured
//! domains, then runs until a shutdown signal. Chain clients and the MPC
//! backend are the in-crate loopback implementations; production
//! deployments plug their RPC clients and MPC library into the same
//! traits at the marked construction points.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use viaduct::chains::btc::listener::{BtcListener, BtcResource};
use viaduct::chains::btc::{BtcChain, LoopbackConnection};
use viaduct::chains::evm::deposit::{
    DepositHandlerRegistry, Erc20DepositHandler, Erc721DepositHandler,
    PermissionlessGenericDepositHandler,
};
use viaduct::chains::evm::executor::{Executor, ExecutorConfig};
use viaduct::chains::evm::handler::RetryMessageHandler;
use viaduct::chains::evm::listener::{
    DepositEventHandler, EventHandler, EvmListener, FileTopologyProvider, KeygenEventHandler,
    KeygenScheme, RefreshEventHandler, RetryV1EventHandler, RetryV2EventHandler,
};
use viaduct::chains::evm::loopback::{LoopbackBridge, ScriptedEvents};
use viaduct::chains::evm::EvmChain;
use viaduct::comm::health::HealthCheckJob;
use viaduct::comm::CoordinatorElectorFactory;
use viaduct::config::{self, ChainConfig, HandlerKind};
use viaduct::keyshare::{EcdsaKeyshareStore, FrostKeyshareStore};
use viaduct::relayer::RelayedChain;
use viaduct::topology::TopologyStore;
use viaduct::tss::loopback;
use viaduct::{
    load_config, load_topology, BlockStore, Communication, Coordinator, CoordinatorConfig,
    Keypair, PeerTransport, PropStore, Relayer, SessionBus,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "viaduct", version, about = "Viaduct: threshold-signing bridge relayer")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "./config.json")]
    config: PathBuf,

    /// Data directory
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Listen port override
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("viaduct=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    info!("Viaduct v{VERSION}");

    if let Err(e) = run(args).await {
        error!("relayer failed: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let configuration = load_config(&args.config)?;
    std::fs::create_dir_all(&args.data_dir)?;

    let keypair = Arc::new(Keypair::load_or_generate(&configuration.mpc.key_path)?);
    info!(peer = %keypair.peer_id(), "loaded relayer identity");

    let topology = load_topology(&configuration.mpc.topology_path)?;
    if !topology.contains(&keypair.peer_id()) {
        warn!("this relayer is not part of the configured topology");
    }
    info!(peers = topology.peers.len(), threshold = topology.threshold, "topology loaded");

    let db = sled::open(args.data_dir.join("db"))?;
    let block_store = BlockStore::new(db.clone());
    let prop_store = PropStore::new(db);

    // Peer fabric.
    let bus = Arc::new(SessionBus::new());
    let transport = PeerTransport::new(keypair, topology, bus.clone());
    let port = args.port.unwrap_or(configuration.mpc.port);
    transport.start(port).await?;
    let comm = Communication::new(transport.clone(), bus);

    let elector_factory =
        Arc::new(CoordinatorElectorFactory::new(comm.clone(), configuration.bully.clone()));
    let coordinator = Coordinator::new(comm.clone(), elector_factory, CoordinatorConfig::default());

    let keyshare_store = Arc::new(EcdsaKeyshareStore::new(&configuration.mpc.keyshare_path));
    let frost_keyshare_store =
        Arc::new(FrostKeyshareStore::new(&configuration.mpc.frost_keyshare_path));
    let topology_store = Arc::new(TopologyStore::new(&configuration.mpc.topology_path));
    let topology_provider = Arc::new(FileTopologyProvider::new(&configuration.mpc.topology_path));

    // Wait until in-flight executions drain before exiting.
    let exit_lock = Arc::new(RwLock::new(()));
    let ctx = CancellationToken::new();

    let health = HealthCheckJob::new(
        comm.clone(),
        Duration::from_secs(configuration.health_interval_secs),
    );
    tokio::spawn(health.run(ctx.clone()));

    let (msg_tx, msg_rx) = mpsc::channel(64);
    let mut chains: Vec<Arc<dyn RelayedChain>> = Vec::new();
    for chain_config in &configuration.chains {
        match chain_config {
            ChainConfig::Evm(cfg) => {
                info!(domain = cfg.id, name = cfg.name, "registering EVM domain");

                // Loopback clients; a production build constructs its RPC
                // clients here.
                let fetcher = Arc::new(ScriptedEvents::new());
                let bridge = Arc::new(LoopbackBridge::new());

                let mut registry = DepositHandlerRegistry::new();
                for resource in &cfg.resources {
                    let resource_id = config::parse_resource_id(&resource.resource_id)?;
                    match resource.handler {
                        HandlerKind::Erc20 => {
                            registry.register(resource_id, Arc::new(Erc20DepositHandler))
                        }
                        HandlerKind::Erc721 => {
                            registry.register(resource_id, Arc::new(Erc721DepositHandler))
                        }
                        HandlerKind::PermissionlessGeneric => registry
                            .register(resource_id, Arc::new(PermissionlessGenericDepositHandler)),
                    }
                }
                let registry = Arc::new(registry);

                let handlers: Vec<Arc<dyn EventHandler>> = vec![
                    Arc::new(DepositEventHandler::new(
                        fetcher.clone(),
                        registry.clone(),
                        cfg.id,
                        msg_tx.clone(),
                    )),
                    Arc::new(KeygenEventHandler::new(
                        fetcher.clone(),
                        coordinator.clone(),
                        comm.clone(),
                        keyshare_store.clone(),
                        loopback::keygen(),
                        KeygenScheme::Ecdsa,
                    )),
                    Arc::new(KeygenEventHandler::new(
                        fetcher.clone(),
                        coordinator.clone(),
                        comm.clone(),
                        frost_keyshare_store.clone(),
                        loopback::keygen(),
                        KeygenScheme::Frost,
                    )),
                    Arc::new(RefreshEventHandler::new(
                        fetcher.clone(),
                        topology_provider.clone(),
                        topology_store.clone(),
                        coordinator.clone(),
                        comm.clone(),
                        keyshare_store.clone(),
                        loopback::keygen(),
                    )),
                    Arc::new(RetryV1EventHandler::new(
                        fetcher.clone(),
                        registry.clone(),
                        prop_store.clone(),
                        cfg.id,
                        msg_tx.clone(),
                    )),
                    Arc::new(RetryV2EventHandler::new(fetcher.clone(), cfg.id, msg_tx.clone())),
                ];

                let listener = Arc::new(EvmListener::new(
                    fetcher.clone(),
                    handlers,
                    block_store.clone(),
                    cfg.id,
                    cfg.block_interval,
                    cfg.block_confirmations,
                    Duration::from_secs(cfg.block_retry_interval_secs),
                    cfg.start_block,
                ));

                let executor = Executor::new(
                    comm.clone(),
                    coordinator.clone(),
                    bridge,
                    keyshare_store.clone(),
                    loopback::signing(),
                    prop_store.clone(),
                    exit_lock.clone(),
                    ExecutorConfig::new(cfg.chain_id, cfg.transaction_max_gas),
                );

                let retry_handler = RetryMessageHandler::new(
                    fetcher,
                    registry,
                    prop_store.clone(),
                    cfg.id,
                    msg_tx.clone(),
                );

                chains.push(Arc::new(EvmChain::new(cfg.id, listener, executor, retry_handler)));
            }
            ChainConfig::Btc(cfg) => {
                info!(domain = cfg.id, name = cfg.name, "registering Bitcoin domain");

                let conn = Arc::new(LoopbackConnection::new());
                let resources = cfg
                    .resources
                    .iter()
                    .map(|r| {
                        Ok(BtcResource {
                            resource_id: config::parse_resource_id(&r.resource_id)?,
                            address: r.address.clone(),
                        })
                    })
                    .collect::<Result<Vec<_>, config::ConfigError>>()?;

                let listener = BtcListener::new(
                    conn,
                    resources,
                    block_store.clone(),
                    cfg.id,
                    cfg.block_confirmations,
                    Duration::from_secs(cfg.block_retry_interval_secs),
                    cfg.start_block,
                    msg_tx.clone(),
                );
                chains.push(Arc::new(BtcChain::new(cfg.id, listener)));
            }
        }
    }

    let relayer = Arc::new(Relayer::new(chains));
    {
        let relayer = relayer.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { relayer.start(ctx, msg_rx).await });
    }
    info!("relayer running");

    wait_for_shutdown().await;
    info!("shutting down");
    ctx.cancel();
    // Block until in-flight signing sessions have drained; no signature
    // is orphaned between local completion and submission.
    let _guard = exit_lock.write().await;
    transport.stop();
    Ok(())
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed installing signal handler: {e}");
            return;
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed installing signal handler: {e}");
            return;
        }
    };
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed installing signal handler: {e}");
            return;
        }
    };
    let mut quit = match signal(SignalKind::quit()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed installing signal handler: {e}");
            return;
        }
    };

    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
        _ = hangup.recv() => {}
        _ = quit.recv() => {}
    }
}
