//! Relayer identity and hashing primitives.
//!
//! Every relayer holds a long-term static x25519 key. The peer id is a
//! truncated SHA3-256 fingerprint of the public key: stable, sortable and
//! cheap to compare, which the session layer relies on for leader election
//! and party ordering.

use rand::rngs::OsRng;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256, Sha3_256};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};

/// Size of a peer id in bytes (truncated SHA3-256 of the public key).
pub const PEER_ID_SIZE: usize = 16;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    #[error("key file error: {0}")]
    KeyFile(#[from] std::io::Error),
}

/// Stable, sortable relayer identifier derived from a long-term public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PeerId([u8; PEER_ID_SIZE]);

impl PeerId {
    pub fn from_public_key(public: &PublicKey) -> Self {
        let digest = Sha3_256::digest(public.as_bytes());
        let mut id = [0u8; PEER_ID_SIZE];
        id.copy_from_slice(&digest[..PEER_ID_SIZE]);
        PeerId(id)
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_SIZE] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for PeerId {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| CryptoError::InvalidPeerId(e.to_string()))?;
        if bytes.len() != PEER_ID_SIZE {
            return Err(CryptoError::InvalidPeerId(format!(
                "expected {} bytes, got {}",
                PEER_ID_SIZE,
                bytes.len()
            )));
        }
        let mut id = [0u8; PEER_ID_SIZE];
        id.copy_from_slice(&bytes);
        Ok(PeerId(id))
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PeerId::from_str(&s).map_err(D::Error::custom)
    }
}

/// Long-term relayer keypair. The secret never leaves this struct.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Load a hex-encoded secret from `path`, generating and persisting a
    /// fresh one if the file does not exist.
    pub fn load_or_generate<P: AsRef<Path>>(path: P) -> Result<Self, CryptoError> {
        let path = path.as_ref();
        if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            let bytes =
                hex::decode(raw.trim()).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
            let bytes: [u8; 32] = bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKey("secret must be 32 bytes".into()))?;
            return Ok(Self::from_secret_bytes(bytes));
        }
        let keypair = Self::generate();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, hex::encode(keypair.secret.to_bytes()))?;
        Ok(keypair)
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public)
    }

    pub fn diffie_hellman(&self, their_public: &PublicKey) -> SharedSecret {
        self.secret.diffie_hellman(their_public)
    }
}

pub fn sha3(data: &[u8]) -> [u8; 32] {
    Sha3_256::digest(data).into()
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// Left-pad `data` to `size` bytes with zeroes, truncating from the left
/// when longer (EVM word packing).
pub fn left_pad(data: &[u8], size: usize) -> Vec<u8> {
    let mut out = vec![0u8; size];
    if data.len() >= size {
        out.copy_from_slice(&data[data.len() - size..]);
    } else {
        out[size - data.len()..].copy_from_slice(data);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_roundtrip() {
        let kp = Keypair::generate();
        let id = kp.peer_id();
        let parsed: PeerId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn peer_id_is_stable() {
        let kp = Keypair::from_secret_bytes([7u8; 32]);
        assert_eq!(kp.peer_id(), PeerId::from_public_key(kp.public()));
    }

    #[test]
    fn left_pad_pads_and_truncates() {
        assert_eq!(left_pad(&[1, 2], 4), vec![0, 0, 1, 2]);
        assert_eq!(left_pad(&[1, 2, 3, 4, 5], 4), vec![2, 3, 4, 5]);
    }

    #[test]
    fn shared_secret_agreement() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let ab = a.diffie_hellman(b.public());
        let ba = b.diffie_hellman(a.public());
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }
}
