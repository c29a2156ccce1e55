//! Static relayer topology: the peer set and signing threshold.
//!
//! The topology is loaded once at startup and refreshed only through an
//! on-chain refresh event. Peer ids are derived from the configured public
//! keys and kept sorted so every relayer agrees on orderings.

use crate::crypto::PeerId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use x25519_dalek::PublicKey;

#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("topology file error: {0}")]
    File(#[from] std::io::Error),
    #[error("topology parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid topology: {0}")]
    Invalid(String),
}

/// Operator-supplied topology entry before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPeer {
    /// `host:port`; the host may be a DNS name.
    pub address: String,
    /// Hex-encoded static x25519 public key.
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTopology {
    pub peers: Vec<RawPeer>,
    pub threshold: String,
}

/// One validated peer of the relayer set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub address: String,
    pub public_key: [u8; 32],
}

impl PeerInfo {
    pub fn x25519_key(&self) -> PublicKey {
        PublicKey::from(self.public_key)
    }
}

/// The validated peer set. Peers are sorted by id; signing requires
/// `threshold + 1` participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkTopology {
    pub peers: Vec<PeerInfo>,
    pub threshold: u16,
}

impl NetworkTopology {
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.iter().map(|p| p.id).collect()
    }

    pub fn peer(&self, id: &PeerId) -> Option<&PeerInfo> {
        self.peers.iter().find(|p| &p.id == id)
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peer(id).is_some()
    }

    /// Look a peer up by its static public key; used to authenticate
    /// inbound streams.
    pub fn peer_by_key(&self, key: &[u8; 32]) -> Option<&PeerInfo> {
        self.peers.iter().find(|p| &p.public_key == key)
    }
}

/// Validate a raw topology: decode keys, derive ids, sort, parse threshold.
pub fn process_raw_topology(raw: &RawTopology) -> Result<NetworkTopology, TopologyError> {
    let threshold: u16 = raw
        .threshold
        .parse()
        .map_err(|_| TopologyError::Invalid(format!("bad threshold {:?}", raw.threshold)))?;

    let mut peers = Vec::with_capacity(raw.peers.len());
    for rp in &raw.peers {
        let key = hex::decode(&rp.public_key)
            .map_err(|e| TopologyError::Invalid(format!("bad public key: {e}")))?;
        let key: [u8; 32] = key
            .try_into()
            .map_err(|_| TopologyError::Invalid("public key must be 32 bytes".into()))?;
        peers.push(PeerInfo {
            id: PeerId::from_public_key(&PublicKey::from(key)),
            address: rp.address.clone(),
            public_key: key,
        });
    }

    if peers.is_empty() {
        return Err(TopologyError::Invalid("topology has no peers".into()));
    }
    if peers.len() <= threshold as usize {
        return Err(TopologyError::Invalid(format!(
            "threshold {} requires more than {} peers",
            threshold,
            peers.len()
        )));
    }
    peers.sort_by_key(|p| p.id);
    peers.dedup_by_key(|p| p.id);

    Ok(NetworkTopology { peers, threshold })
}

/// Persists refreshed topologies to disk.
pub struct TopologyStore {
    path: PathBuf,
}

impl TopologyStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    pub fn store(&self, topology: &NetworkTopology) -> Result<(), TopologyError> {
        let data = serde_json::to_vec_pretty(topology)?;
        std::fs::write(&self.path, data)?;
        Ok(())
    }

    pub fn topology(&self) -> Result<NetworkTopology, TopologyError> {
        let data = std::fs::read(&self.path)?;
        Ok(serde_json::from_slice(&data)?)
    }
}

/// Load a raw topology file and validate it.
pub fn load_topology<P: AsRef<Path>>(path: P) -> Result<NetworkTopology, TopologyError> {
    let data = std::fs::read(path)?;
    let raw: RawTopology = serde_json::from_slice(&data)?;
    process_raw_topology(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    fn raw_peer(seed: u8, address: &str) -> RawPeer {
        let kp = Keypair::from_secret_bytes([seed; 32]);
        RawPeer {
            address: address.to_string(),
            public_key: hex::encode(kp.public().as_bytes()),
        }
    }

    #[test]
    fn processes_and_sorts_peers() {
        let raw = RawTopology {
            peers: vec![
                raw_peer(1, "relayer1:9000"),
                raw_peer(2, "relayer2:9001"),
                raw_peer(3, "relayer3:9002"),
            ],
            threshold: "2".into(),
        };
        let topology = process_raw_topology(&raw).unwrap();
        assert_eq!(topology.threshold, 2);
        assert_eq!(topology.peers.len(), 3);
        let mut sorted = topology.peer_ids();
        sorted.sort();
        assert_eq!(sorted, topology.peer_ids());
    }

    #[test]
    fn rejects_bad_threshold() {
        let raw = RawTopology {
            peers: vec![raw_peer(1, "relayer1:9000")],
            threshold: "two".into(),
        };
        assert!(process_raw_topology(&raw).is_err());
    }

    #[test]
    fn rejects_threshold_at_peer_count() {
        let raw = RawTopology {
            peers: vec![raw_peer(1, "a:1"), raw_peer(2, "b:2")],
            threshold: "2".into(),
        };
        assert!(process_raw_topology(&raw).is_err());
    }

    #[test]
    fn store_and_retrieve_topology() {
        let raw = RawTopology {
            peers: vec![raw_peer(1, "relayer1:9000"), raw_peer(2, "relayer2:9001")],
            threshold: "1".into(),
        };
        let topology = process_raw_topology(&raw).unwrap();

        let path = std::env::temp_dir().join("viaduct_topology_test.json");
        let store = TopologyStore::new(&path);
        store.store(&topology).unwrap();
        let loaded = store.topology().unwrap();
        assert_eq!(topology, loaded);
        std::fs::remove_file(path).ok();
    }
}
