//! Typed accessors over the raw key/value store
//!
//! Namespaced key builders plus the record types the coordinator persists.
//! Everything below travels through one `StoreTx` per mutation, so a
//! half-written activation or manifest can never reach disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{KvRead, StoreError, StoreTx};

/// Store key namespaces
pub mod keys {
    pub const STATE: &str = "state";
    pub const MANIFEST_RAW: &str = "manifest:raw";
    pub const MANIFEST_EFFECTIVE: &str = "manifest:effective";
    pub const MANIFEST_GENERATION: &str = "manifest:generation";
    pub const MANIFEST_SIGNATURE: &str = "manifest:signature";
    pub const PKI: &str = "pki";
    pub const SERIAL: &str = "serial";

    /// Shared secret value
    pub fn secret(name: &str) -> String {
        format!("secrets:{name}")
    }

    /// Per-marble secret value
    pub fn marble_secret(name: &str, uuid: &str) -> String {
        format!("secrets:{name}:{uuid}")
    }

    /// Activation count for a marble
    pub fn activations(marble: &str) -> String {
        format!("activations:{marble}")
    }

    /// Issued certificate record for an activation UUID
    pub fn activation_cert(uuid: &str) -> String {
        format!("certs:{uuid}")
    }
}

/// Per-activation record, keyed by the marble-supplied UUID. Used to detect
/// duplicate activations and to answer idempotent retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationRecord {
    pub marble: String,
    /// PEM of the issued leaf certificate
    pub cert_pem: String,
    /// Hex SHA-256 over the CSR's SubjectPublicKeyInfo
    pub csr_pubkey_digest: String,
    pub activated_at: DateTime<Utc>,
}

/// First serial handed out by a fresh store
const SERIAL_START: u64 = 1;

/// Allocate the next certificate serial inside a transaction.
///
/// Read-your-writes makes repeated allocations within one transaction
/// strictly increasing; the commit persists the advanced counter together
/// with whatever consumed it.
pub fn next_serial(tx: &mut StoreTx<'_>) -> Result<u64, StoreError> {
    let current: u64 = tx.get_json(keys::SERIAL)?.unwrap_or(SERIAL_START);
    tx.put_json(keys::SERIAL, &(current + 1))?;
    Ok(current)
}

/// Activation count for a marble, zero if never activated
pub fn activation_count<R: KvRead>(reader: &R, marble: &str) -> Result<u64, StoreError> {
    Ok(reader.get_json(&keys::activations(marble))?.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LoadOutcome, SealedStore};
    use palisade_core::seal::{AesGcmSealer, Sealer};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> SealedStore {
        let sealer: Arc<dyn Sealer> = Arc::new(AesGcmSealer::new([1; 32]));
        match SealedStore::open(sealer, dir.path()).unwrap() {
            LoadOutcome::Fresh(store) => store,
            _ => panic!("expected fresh store"),
        }
    }

    #[test]
    fn serials_are_strictly_increasing_within_and_across_transactions() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let mut tx = store.transaction();
        let a = next_serial(&mut tx).unwrap();
        let b = next_serial(&mut tx).unwrap();
        assert!(b > a);
        tx.commit().unwrap();

        let mut tx = store.transaction();
        let c = next_serial(&mut tx).unwrap();
        assert!(c > b);
    }

    #[test]
    fn aborted_transaction_does_not_advance_serial() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let mut tx = store.transaction();
        let a = next_serial(&mut tx).unwrap();
        drop(tx);

        let mut tx = store.transaction();
        assert_eq!(next_serial(&mut tx).unwrap(), a);
    }

    #[test]
    fn activation_count_defaults_to_zero() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert_eq!(activation_count(&store, "backend").unwrap(), 0);
    }
}
