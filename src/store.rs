//! Local persistence: last-processed block per domain and the proposal
//! status map used by the retry path.
//!
//! Status transitions form a DAG: `pending → executed` and
//! `pending → failed`, with `executed` terminal. The terminal rule is
//! enforced with a compare-and-swap loop so a late retry rewrite cannot
//! clobber a concurrent execution confirmation.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store error: {0}")]
    Db(#[from] sled::Error),
    #[error("corrupt store value for {0}")]
    Corrupt(String),
}

/// Lifecycle of one proposal on its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropStatus {
    /// Never dispatched (or unknown to this relayer).
    Missing,
    /// Dispatched, outcome unknown.
    Pending,
    /// Destination confirmed execution. Terminal.
    Executed,
    /// Session ended without execution; eligible for retry.
    Failed,
}

impl PropStatus {
    fn to_byte(self) -> u8 {
        match self {
            PropStatus::Missing => 0,
            PropStatus::Pending => 1,
            PropStatus::Executed => 2,
            PropStatus::Failed => 3,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => PropStatus::Missing,
            1 => PropStatus::Pending,
            2 => PropStatus::Executed,
            3 => PropStatus::Failed,
            _ => return None,
        })
    }
}

fn prop_key(source: u8, destination: u8, nonce: u64) -> Vec<u8> {
    format!("prop:{source}:{destination}:{nonce}").into_bytes()
}

fn block_key(domain: u8) -> Vec<u8> {
    format!("block:{domain}").into_bytes()
}

/// Proposal status map keyed by `(source, destination, nonce)`.
#[derive(Clone)]
pub struct PropStore {
    db: sled::Db,
}

impl PropStore {
    pub fn new(db: sled::Db) -> Self {
        Self { db }
    }

    /// Write `status`, refusing any transition out of `executed`.
    pub fn store_status(
        &self,
        source: u8,
        destination: u8,
        nonce: u64,
        status: PropStatus,
    ) -> Result<(), StoreError> {
        let key = prop_key(source, destination, nonce);
        loop {
            let current = self.db.get(&key)?;
            if let Some(bytes) = &current {
                if bytes.as_ref() == [PropStatus::Executed.to_byte()] {
                    return Ok(());
                }
            }
            let swap = self.db.compare_and_swap(
                &key,
                current,
                Some(vec![status.to_byte()]),
            )?;
            if swap.is_ok() {
                return Ok(());
            }
        }
    }

    pub fn status(&self, source: u8, destination: u8, nonce: u64) -> Result<PropStatus, StoreError> {
        let key = prop_key(source, destination, nonce);
        match self.db.get(&key)? {
            None => Ok(PropStatus::Missing),
            Some(bytes) => {
                let byte = bytes.first().copied().unwrap_or(u8::MAX);
                PropStatus::from_byte(byte)
                    .ok_or_else(|| StoreError::Corrupt(String::from_utf8_lossy(&key).into_owned()))
            }
        }
    }
}

/// Last processed block per domain.
#[derive(Clone)]
pub struct BlockStore {
    db: sled::Db,
}

impl BlockStore {
    pub fn new(db: sled::Db) -> Self {
        Self { db }
    }

    pub fn store_block(&self, domain: u8, block: u64) -> Result<(), StoreError> {
        self.db.insert(block_key(domain), block.to_be_bytes().to_vec())?;
        Ok(())
    }

    pub fn latest_block(&self, domain: u8) -> Result<Option<u64>, StoreError> {
        match self.db.get(block_key(domain))? {
            None => Ok(None),
            Some(bytes) => {
                let bytes: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| StoreError::Corrupt(format!("block:{domain}")))?;
                Ok(Some(u64::from_be_bytes(bytes)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db(name: &str) -> sled::Db {
        let path = std::env::temp_dir().join(format!("viaduct_store_{name}"));
        std::fs::remove_dir_all(&path).ok();
        sled::open(path).unwrap()
    }

    #[test]
    fn missing_proposal_reports_missing() {
        let store = PropStore::new(temp_db("missing"));
        assert_eq!(store.status(1, 2, 7).unwrap(), PropStatus::Missing);
    }

    #[test]
    fn pending_to_failed_and_back() {
        let store = PropStore::new(temp_db("retry"));
        store.store_status(1, 2, 7, PropStatus::Pending).unwrap();
        store.store_status(1, 2, 7, PropStatus::Failed).unwrap();
        assert_eq!(store.status(1, 2, 7).unwrap(), PropStatus::Failed);

        // Re-dispatch marks it pending again.
        store.store_status(1, 2, 7, PropStatus::Pending).unwrap();
        assert_eq!(store.status(1, 2, 7).unwrap(), PropStatus::Pending);
    }

    #[test]
    fn executed_is_terminal() {
        let store = PropStore::new(temp_db("terminal"));
        store.store_status(1, 2, 7, PropStatus::Pending).unwrap();
        store.store_status(1, 2, 7, PropStatus::Executed).unwrap();

        store.store_status(1, 2, 7, PropStatus::Failed).unwrap();
        assert_eq!(store.status(1, 2, 7).unwrap(), PropStatus::Executed);
    }

    #[test]
    fn block_store_roundtrip() {
        let store = BlockStore::new(temp_db("blocks"));
        assert_eq!(store.latest_block(3).unwrap(), None);
        store.store_block(3, 1234).unwrap();
        assert_eq!(store.latest_block(3).unwrap(), Some(1234));
        store.store_block(3, 1235).unwrap();
        assert_eq!(store.latest_block(3).unwrap(), Some(1235));
    }
}
