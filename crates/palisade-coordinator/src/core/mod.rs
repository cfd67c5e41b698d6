//! Coordinator core
//!
//! The trust state machine. The core exclusively owns the state store
//! handle and the PKI; quote issuance/validation and sealing are injected
//! capabilities. A single process-wide read/write lock serializes writers
//! (manifest ingestion, recovery, activation commits) while readers
//! (status, certificate fetch) run in parallel; the lock is held for at
//! most one store transaction.

mod manifest;
mod marble;
mod recover;

pub use manifest::ManifestInfo;
pub use marble::{ActivationRequest, ActivationResponse, DEFAULT_ACTIVATION_TIMEOUT};

use palisade_core::error::{CoreError, Result};
use palisade_core::manifest::Manifest;
use palisade_core::pki::{CertificateAuthority, PkiState};
use palisade_core::quote::{Issuer, Validator};
use palisade_core::recovery::RecoveryAssembly;
use palisade_core::seal::Sealer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, warn};

use crate::store::wrapper::{keys, next_serial};
use crate::store::{KvRead, LoadOutcome, SealedStore};

/// Lifecycle state, persisted in the store; restart resumes the same state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinatorState {
    /// Sealed state could not be opened; awaiting recovery shares
    Recovery,
    /// Root CA not yet generated
    Uninitialized,
    /// Ready to receive the first manifest
    AcceptingManifest,
    /// Manifest set; activating marbles
    AcceptingMarbles,
}

impl CoordinatorState {
    pub fn code(&self) -> u8 {
        match self {
            CoordinatorState::Uninitialized => 0,
            CoordinatorState::Recovery => 1,
            CoordinatorState::AcceptingManifest => 2,
            CoordinatorState::AcceptingMarbles => 3,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            CoordinatorState::Uninitialized => "coordinator is initializing",
            CoordinatorState::Recovery => {
                "coordinator is in recovery mode, waiting for recovery shares"
            }
            CoordinatorState::AcceptingManifest => "coordinator is ready to accept a manifest",
            CoordinatorState::AcceptingMarbles => "coordinator is running and accepting marbles",
        }
    }
}

/// `GET /status` payload
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Status {
    pub status_code: u8,
    pub state: String,
    pub manifest_generation: u64,
    pub message: String,
}

/// Coordinator self-attestation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct QuoteResponse {
    /// Quote over the SHA-256 of the intermediate certificate's public key
    #[serde(with = "b64_bytes")]
    pub quote: Vec<u8>,
    pub intermediate_cert: String,
    pub root_cert: String,
}

pub(crate) mod b64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

pub(crate) struct Inner {
    pub store: SealedStore,
    pub ca: Option<CertificateAuthority>,
    pub state: CoordinatorState,
    pub manifest: Option<Manifest>,
    pub raw_manifest: Vec<u8>,
    pub generation: u64,
    pub recovery: Option<RecoveryAssembly>,
    pub seal_dir: PathBuf,
}

/// The Coordinator core
pub struct Core {
    pub(crate) inner: RwLock<Inner>,
    pub(crate) validator: Arc<dyn Validator>,
    pub(crate) issuer: Arc<dyn Issuer>,
    pub(crate) sealer: Arc<dyn Sealer>,
}

impl Core {
    /// Construct the core from the seal directory.
    ///
    /// Fresh directory → generate the root and intermediate CA and start
    /// accepting a manifest. Existing sealed state → restore the persisted
    /// state. Unopenable sealed state → enter recovery mode.
    pub fn new(
        dns_names: &[String],
        validator: Arc<dyn Validator>,
        issuer: Arc<dyn Issuer>,
        sealer: Arc<dyn Sealer>,
        seal_dir: &Path,
    ) -> Result<Self> {
        let inner = match SealedStore::open(sealer.clone(), seal_dir)? {
            LoadOutcome::Fresh(store) => {
                info!(dns_names = ?dns_names, "no sealed state, generating root CA");
                let mut tx = store.transaction();
                let root_serial = next_serial(&mut tx)?;
                let intermediate_serial = next_serial(&mut tx)?;
                let ca =
                    CertificateAuthority::generate(dns_names, root_serial, intermediate_serial)?;
                tx.put_json(keys::PKI, &ca.to_state()?)?;
                tx.put_json(keys::STATE, &CoordinatorState::AcceptingManifest)?;
                tx.commit()?;

                Inner {
                    store,
                    ca: Some(ca),
                    state: CoordinatorState::AcceptingManifest,
                    manifest: None,
                    raw_manifest: Vec::new(),
                    generation: 0,
                    recovery: None,
                    seal_dir: seal_dir.to_path_buf(),
                }
            }
            LoadOutcome::Restored(store) => {
                let inner = Self::restore(store, seal_dir)?;
                info!(state = ?inner.state, generation = inner.generation, "sealed state restored");
                inner
            }
            LoadOutcome::NeedsRecovery { parties } => {
                warn!(parties, "sealed state cannot be opened, entering recovery mode");
                Inner {
                    store: SealedStore::detached(sealer.clone()),
                    ca: None,
                    state: CoordinatorState::Recovery,
                    manifest: None,
                    raw_manifest: Vec::new(),
                    generation: 0,
                    recovery: Some(RecoveryAssembly::new(parties)),
                    seal_dir: seal_dir.to_path_buf(),
                }
            }
        };

        Ok(Self {
            inner: RwLock::new(inner),
            validator,
            issuer,
            sealer,
        })
    }

    pub(crate) fn restore(store: SealedStore, seal_dir: &Path) -> Result<Inner> {
        let state: CoordinatorState = store
            .get_json(keys::STATE)?
            .ok_or_else(|| CoreError::Internal("sealed state carries no state tag".into()))?;
        let pki: PkiState = store
            .get_json(keys::PKI)?
            .ok_or_else(|| CoreError::Internal("sealed state carries no PKI material".into()))?;
        let ca = CertificateAuthority::from_state(&pki)?;
        let manifest: Option<Manifest> = store.get_json(keys::MANIFEST_EFFECTIVE)?;
        let raw_manifest = store.get(keys::MANIFEST_RAW).unwrap_or_default();
        let generation: u64 = store.get_json(keys::MANIFEST_GENERATION)?.unwrap_or(0);

        Ok(Inner {
            store,
            ca: Some(ca),
            state,
            manifest,
            raw_manifest,
            generation,
            recovery: None,
            seal_dir: seal_dir.to_path_buf(),
        })
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap()
    }

    /// Current state, manifest generation, and a human message
    pub fn status(&self) -> Status {
        let inner = self.read();
        Status {
            status_code: inner.state.code(),
            state: format!("{:?}", inner.state),
            manifest_generation: inner.generation,
            message: inner.state.message().to_string(),
        }
    }

    /// The Coordinator attests itself: a quote over the hash of the
    /// intermediate certificate's public key, plus the chain to verify it.
    pub fn get_quote(&self) -> Result<QuoteResponse> {
        let inner = self.read();
        if inner.state == CoordinatorState::Recovery {
            return Err(CoreError::Recovering);
        }
        let ca = inner.ca.as_ref().ok_or(CoreError::Recovering)?;
        let message = ca.intermediate_pubkey_digest()?;
        let quote = self
            .issuer
            .issue(&message)
            .map_err(|e| CoreError::Internal(format!("quote issuance: {e}")))?;
        Ok(QuoteResponse {
            quote,
            intermediate_cert: ca.intermediate_cert_pem()?,
            root_cert: ca.root_cert_pem()?,
        })
    }

    /// PEM of the root certificate; what clients pin
    pub fn root_cert_pem(&self) -> Result<String> {
        let inner = self.read();
        let ca = inner.ca.as_ref().ok_or(CoreError::Recovering)?;
        ca.root_cert_pem()
    }
}

/// Names of manifest users matching any of the presented DER certificates
pub(crate) fn authenticated_users(
    manifest: &Manifest,
    caller_certs: &[Vec<u8>],
) -> BTreeSet<String> {
    let mut signers = BTreeSet::new();
    for der in caller_certs {
        if let Some((name, _)) = manifest.user_by_certificate(der) {
            signers.insert(name.clone());
        }
    }
    signers
}

/// Role-based authorization: succeeds if some role covering the resource is
/// held by enough distinct signers to meet that role's threshold.
pub(crate) fn authorize(
    manifest: &Manifest,
    signers: &BTreeSet<String>,
    resource_type: &str,
    resource: &str,
    action: &str,
) -> Result<()> {
    for (role_name, role) in &manifest.roles {
        if !role.covers(resource_type, resource, action) {
            continue;
        }
        let holding = signers
            .iter()
            .filter(|signer| {
                manifest
                    .users
                    .get(*signer)
                    .map(|user| user.roles.contains(role_name))
                    .unwrap_or(false)
            })
            .count() as u32;
        if holding >= role.threshold() {
            return Ok(());
        }
    }
    warn!(resource_type, resource, action, "authorization denied");
    Err(CoreError::PermissionDenied("authorization"))
}
