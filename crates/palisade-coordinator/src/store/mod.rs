//! State store
//!
//! A transactional key/value façade over the sealed state image. All
//! coordinator state lives here; every mutation is a single transaction
//! that either commits all touched keys or none. After a commit the full
//! image is resealed and flushed to `sealed.state` in the seal directory;
//! the host filesystem only ever sees ciphertext.

pub mod wrapper;

use palisade_core::seal::{self, SealError, Sealer};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::debug;

/// File name of the sealed state image inside the seal directory
pub const SEALED_STATE_FILE: &str = "sealed.state";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization failure: {0}")]
    Serialization(String),

    #[error("sealer failure: {0}")]
    Seal(#[from] SealError),
}

impl From<StoreError> for palisade_core::CoreError {
    fn from(err: StoreError) -> Self {
        palisade_core::CoreError::Internal(format!("store: {err}"))
    }
}

/// Result of opening the seal directory
pub enum LoadOutcome {
    /// No sealed state present; a brand-new deployment
    Fresh(SealedStore),
    /// Sealed state opened and restored
    Restored(SealedStore),
    /// Sealed state present but unopenable with the current sealing key;
    /// `parties` recovery shares are required
    NeedsRecovery { parties: usize },
}

/// In-memory store image, resealed to disk on every commit
pub struct SealedStore {
    sealer: Arc<dyn Sealer>,
    path: PathBuf,
    data: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl SealedStore {
    /// Open the sealed state in `seal_dir`, if any.
    pub fn open(sealer: Arc<dyn Sealer>, seal_dir: &Path) -> Result<LoadOutcome, StoreError> {
        let path = seal_dir.join(SEALED_STATE_FILE);
        if !path.exists() {
            debug!(path = %path.display(), "no sealed state, starting fresh");
            return Ok(LoadOutcome::Fresh(Self {
                sealer,
                path,
                data: RwLock::new(BTreeMap::new()),
            }));
        }

        let blob = fs::read(&path)?;
        match sealer.unseal(&blob) {
            Ok(plaintext) => {
                let data: BTreeMap<String, Vec<u8>> = serde_json::from_slice(&plaintext)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                debug!(keys = data.len(), "sealed state restored");
                Ok(LoadOutcome::Restored(Self {
                    sealer,
                    path,
                    data: RwLock::new(data),
                }))
            }
            // Unopenable either way; the caller enters recovery. The party
            // count is readable from the envelope without any key.
            Err(SealError::SealingKey) | Err(SealError::Integrity) => {
                let parties = seal::sealed_party_count(&blob).unwrap_or(0);
                Ok(LoadOutcome::NeedsRecovery { parties })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// An empty store not backed by any file; placeholder while the
    /// coordinator sits in recovery mode.
    pub fn detached(sealer: Arc<dyn Sealer>) -> Self {
        Self {
            sealer,
            path: PathBuf::new(),
            data: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.data.read().unwrap().get(key).cloned()
    }

    pub fn transaction(&self) -> StoreTx<'_> {
        StoreTx {
            store: self,
            writes: BTreeMap::new(),
        }
    }

    /// Serialize, seal, and atomically replace the on-disk image; swap the
    /// in-memory image only after the flush succeeded.
    fn persist_and_swap(&self, next: BTreeMap<String, Vec<u8>>) -> Result<(), StoreError> {
        let plaintext =
            serde_json::to_vec(&next).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let blob = self.sealer.seal(&plaintext)?;

        let tmp = self.path.with_extension("tmp");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&blob)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;

        *self.data.write().unwrap() = next;
        Ok(())
    }
}

/// A buffered transaction; nothing is visible or persisted until `commit`.
pub struct StoreTx<'a> {
    store: &'a SealedStore,
    writes: BTreeMap<String, Option<Vec<u8>>>,
}

impl StoreTx<'_> {
    /// Read-your-writes lookup
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        match self.writes.get(key) {
            Some(pending) => pending.clone(),
            None => self.store.get(key),
        }
    }

    pub fn put(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.writes.insert(key.into(), Some(value));
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.writes.insert(key.into(), None);
    }

    /// Apply all buffered writes and reseal. On any failure the in-memory
    /// image is left untouched.
    pub fn commit(self) -> Result<(), StoreError> {
        let mut next = self.store.data.read().unwrap().clone();
        for (key, value) in self.writes {
            match value {
                Some(v) => {
                    next.insert(key, v);
                }
                None => {
                    next.remove(&key);
                }
            }
        }
        self.store.persist_and_swap(next)
    }
}

/// JSON-typed read, shared by the store and open transactions
pub trait KvRead {
    fn get_raw(&self, key: &str) -> Option<Vec<u8>>;

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get_raw(key) {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }
}

impl KvRead for SealedStore {
    fn get_raw(&self, key: &str) -> Option<Vec<u8>> {
        self.get(key)
    }
}

impl KvRead for StoreTx<'_> {
    fn get_raw(&self, key: &str) -> Option<Vec<u8>> {
        self.get(key)
    }
}

impl StoreTx<'_> {
    pub fn put_json<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<(), StoreError> {
        let bytes =
            serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.put(key, bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_core::seal::AesGcmSealer;
    use tempfile::TempDir;

    fn fresh_store(dir: &TempDir, key: [u8; 32]) -> LoadOutcome {
        let sealer: Arc<dyn Sealer> = Arc::new(AesGcmSealer::new(key));
        SealedStore::open(sealer, dir.path()).unwrap()
    }

    #[test]
    fn empty_dir_is_fresh() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(fresh_store(&dir, [1; 32]), LoadOutcome::Fresh(_)));
    }

    #[test]
    fn committed_data_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let LoadOutcome::Fresh(store) = fresh_store(&dir, [1; 32]) else {
            panic!("expected fresh store");
        };

        let mut tx = store.transaction();
        tx.put("alpha", b"1".to_vec());
        tx.put("beta", b"2".to_vec());
        tx.commit().unwrap();

        let LoadOutcome::Restored(reopened) = fresh_store(&dir, [1; 32]) else {
            panic!("expected restored store");
        };
        assert_eq!(reopened.get("alpha"), Some(b"1".to_vec()));
        assert_eq!(reopened.get("beta"), Some(b"2".to_vec()));
    }

    #[test]
    fn uncommitted_writes_are_invisible() {
        let dir = TempDir::new().unwrap();
        let LoadOutcome::Fresh(store) = fresh_store(&dir, [1; 32]) else {
            panic!("expected fresh store");
        };

        let mut tx = store.transaction();
        tx.put("alpha", b"1".to_vec());
        assert_eq!(tx.get("alpha"), Some(b"1".to_vec()));
        assert_eq!(store.get("alpha"), None);
        drop(tx);
        assert_eq!(store.get("alpha"), None);
    }

    #[test]
    fn wrong_sealing_key_needs_recovery() {
        let dir = TempDir::new().unwrap();
        let LoadOutcome::Fresh(store) = fresh_store(&dir, [1; 32]) else {
            panic!("expected fresh store");
        };
        let mut tx = store.transaction();
        tx.put("alpha", b"1".to_vec());
        tx.commit().unwrap();

        assert!(matches!(
            fresh_store(&dir, [2; 32]),
            LoadOutcome::NeedsRecovery { .. }
        ));
    }

    #[test]
    fn plaintext_never_reaches_disk() {
        let dir = TempDir::new().unwrap();
        let LoadOutcome::Fresh(store) = fresh_store(&dir, [1; 32]) else {
            panic!("expected fresh store");
        };
        let mut tx = store.transaction();
        tx.put("needle", b"supersecretvalue".to_vec());
        tx.commit().unwrap();

        let raw = std::fs::read(dir.path().join(SEALED_STATE_FILE)).unwrap();
        let haystack = String::from_utf8_lossy(&raw);
        assert!(!haystack.contains("supersecretvalue"));
        assert!(!haystack.contains("needle"));
    }
}
