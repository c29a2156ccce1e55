#![allow(dead_code)]

//! In-process relayer clusters for session and executor tests: real TCP
//! transport, real coordinator, loopback protocol backend.

use std::sync::Arc;
use std::time::Duration;
use viaduct::comm::elector::BullyConfig;
use viaduct::comm::CoordinatorElectorFactory;
use viaduct::keyshare::{EcdsaKeyshare, EcdsaKeyshareStore};
use viaduct::topology::{NetworkTopology, PeerInfo};
use viaduct::{
    Communication, Coordinator, CoordinatorConfig, Keypair, PeerId, PeerTransport, SessionBus,
};

pub struct TestNode {
    pub peer_id: PeerId,
    pub comm: Arc<Communication>,
    pub coordinator: Arc<Coordinator>,
    pub keyshare_store: Arc<EcdsaKeyshareStore>,
    pub transport: Arc<PeerTransport>,
}

pub fn fast_coordinator_config(tss_timeout: Duration) -> CoordinatorConfig {
    CoordinatorConfig {
        initiate_period: Duration::from_millis(200),
        coordinator_timeout: Duration::from_millis(1500),
        tss_timeout,
    }
}

pub fn fast_bully_config() -> BullyConfig {
    BullyConfig {
        election_wait_time: Duration::from_millis(500),
        bully_wait_time: Duration::from_secs(10),
        select_wait_time: Duration::from_millis(1500),
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Spin up `n` connected relayers sharing one topology and matching key
/// shares. `seed_base` keeps identities distinct between tests.
pub async fn spawn_cluster(
    seed_base: u8,
    n: usize,
    threshold: u16,
    config: CoordinatorConfig,
) -> Vec<TestNode> {
    let ports: Vec<u16> = (0..n).map(|_| free_port()).collect();
    let keypairs: Vec<Keypair> = (0..n)
        .map(|i| Keypair::from_secret_bytes([seed_base + i as u8; 32]))
        .collect();

    let mut peers: Vec<PeerInfo> = keypairs
        .iter()
        .zip(&ports)
        .map(|(kp, port)| PeerInfo {
            id: kp.peer_id(),
            address: format!("127.0.0.1:{port}"),
            public_key: *kp.public().as_bytes(),
        })
        .collect();
    peers.sort_by_key(|p| p.id);
    let topology = NetworkTopology { peers, threshold };
    let key_peers = topology.peer_ids();

    let mut nodes = Vec::with_capacity(n);
    for (keypair, port) in keypairs.into_iter().zip(ports) {
        let peer_id = keypair.peer_id();
        let bus = Arc::new(SessionBus::new());
        let transport = PeerTransport::new(Arc::new(keypair), topology.clone(), bus.clone());
        transport.start(port).await.unwrap();
        let comm = Communication::new(transport.clone(), bus);

        let elector_factory =
            Arc::new(CoordinatorElectorFactory::new(comm.clone(), fast_bully_config()));
        let coordinator = Coordinator::new(comm.clone(), elector_factory, config.clone());

        let share_path = std::env::temp_dir().join(format!("viaduct_test_share_{port}.json"));
        std::fs::remove_file(&share_path).ok();
        let keyshare_store = Arc::new(EcdsaKeyshareStore::new(&share_path));
        keyshare_store
            .store(&EcdsaKeyshare {
                threshold,
                peers: key_peers.clone(),
                public_key: vec![2; 33],
                share: vec![7; 32],
            })
            .await
            .unwrap();

        nodes.push(TestNode { peer_id, comm, coordinator, keyshare_store, transport });
    }
    nodes
}

/// Sled handle on a fresh temp directory.
pub fn temp_db(name: &str) -> sled::Db {
    let path = std::env::temp_dir().join(format!("viaduct_test_db_{name}_{}", std::process::id()));
    std::fs::remove_dir_all(&path).ok();
    sled::open(path).unwrap()
}
