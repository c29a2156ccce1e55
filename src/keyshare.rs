//! Key-share files produced by keygen and consumed by signing.
//!
//! Shares live in JSON files next to the data directory. Reads and writes
//! serialise under one lock per store: keygen and resharing write, signing
//! reads, and nothing observes a half-written file.

use crate::crypto::PeerId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

#[derive(Error, Debug)]
pub enum KeyshareError {
    #[error("no key share at {0}")]
    Missing(PathBuf),
    #[error("key share file error: {0}")]
    File(#[from] std::io::Error),
    #[error("key share parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// ECDSA share used for EVM destinations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcdsaKeyshare {
    pub threshold: u16,
    pub peers: Vec<PeerId>,
    /// Group public key, chain-agnostic encoding.
    pub public_key: Vec<u8>,
    /// Opaque local share material owned by the MPC library.
    pub share: Vec<u8>,
}

/// FROST share used for auxiliary destinations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrostKeyshare {
    pub threshold: u16,
    pub peers: Vec<PeerId>,
    pub group_public_key: Vec<u8>,
    pub share: Vec<u8>,
}

pub struct KeyshareStore<T> {
    path: PathBuf,
    lock: Arc<RwLock<()>>,
    _marker: PhantomData<T>,
}

pub type EcdsaKeyshareStore = KeyshareStore<EcdsaKeyshare>;
pub type FrostKeyshareStore = KeyshareStore<FrostKeyshare>;

impl<T: Serialize + DeserializeOwned> KeyshareStore<T> {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Arc::new(RwLock::new(())),
            _marker: PhantomData,
        }
    }

    pub async fn get(&self) -> Result<T, KeyshareError> {
        let _guard = self.lock.read().await;
        if !self.path.exists() {
            return Err(KeyshareError::Missing(self.path.clone()));
        }
        let data = std::fs::read(&self.path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub async fn store(&self, share: &T) -> Result<(), KeyshareError> {
        let _guard = self.lock.write().await;
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let data = serde_json::to_vec_pretty(share)?;
        std::fs::write(&self.path, data)?;
        Ok(())
    }

    pub async fn exists(&self) -> bool {
        let _guard = self.lock.read().await;
        self.path.exists()
    }

    /// Hold the store exclusively for a longer operation (resharing).
    /// The guard must be dropped before calling [`store`](Self::store).
    pub async fn lock_exclusive(&self) -> OwnedRwLockWriteGuard<()> {
        self.lock.clone().write_owned().await
    }
}

/// Sink for a completed keygen: builds and persists the scheme-specific
/// share record. Lets one keygen process serve both signature schemes.
#[async_trait::async_trait]
pub trait KeyshareStorer: Send + Sync + 'static {
    async fn store_share(
        &self,
        threshold: u16,
        peers: Vec<PeerId>,
        public_key: Vec<u8>,
        share: Vec<u8>,
    ) -> Result<(), KeyshareError>;

    async fn has_share(&self) -> bool;
}

#[async_trait::async_trait]
impl KeyshareStorer for EcdsaKeyshareStore {
    async fn store_share(
        &self,
        threshold: u16,
        peers: Vec<PeerId>,
        public_key: Vec<u8>,
        share: Vec<u8>,
    ) -> Result<(), KeyshareError> {
        self.store(&EcdsaKeyshare { threshold, peers, public_key, share }).await
    }

    async fn has_share(&self) -> bool {
        self.exists().await
    }
}

#[async_trait::async_trait]
impl KeyshareStorer for FrostKeyshareStore {
    async fn store_share(
        &self,
        threshold: u16,
        peers: Vec<PeerId>,
        public_key: Vec<u8>,
        share: Vec<u8>,
    ) -> Result<(), KeyshareError> {
        self.store(&FrostKeyshare { threshold, peers, group_public_key: public_key, share }).await
    }

    async fn has_share(&self) -> bool {
        self.exists().await
    }
}
