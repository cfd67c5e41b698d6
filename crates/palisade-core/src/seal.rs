//! Sealer
//!
//! Persists a byte blob such that it can be read back only on the same
//! enclave instance, or via the recovery path. The payload is encrypted
//! under a random data key with AES-256-GCM; the data key itself travels
//! inside the blob, wrapped under the enclave-bound sealing key and,
//! when recovery parties are configured, additionally wrapped under each
//! party's public recovery key.
//!
//! A plain SHA-256 digest over the envelope lets `unseal` tell corruption
//! apart from a wrong sealing key: a damaged blob fails the digest check
//! (`Integrity`) before key unwrapping is attempted, so an unwrap failure
//! on an intact blob means the key is wrong (`SealingKey`). Authenticity
//! still rests on the AEAD tag; the digest is bound to the payload as
//! associated data.

use aes_gcm::aead::{Aead, KeyInit, OsRng as AeadOsRng, Payload};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Mutex;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::recovery;

const BLOB_VERSION: u32 = 1;
const NONCE_LEN: usize = 12;

/// Errors produced by seal/unseal
#[derive(Error, Debug)]
pub enum SealError {
    /// The sealing key cannot unwrap the sealed data key; likely a
    /// different enclave instance or a post-rekey blob
    #[error("sealing key cannot open the sealed data key")]
    SealingKey,

    /// Tampering or truncation of the sealed blob
    #[error("sealed state failed integrity verification")]
    Integrity,

    /// Key wrapping / unwrapping crypto failure
    #[error("seal crypto failure: {0}")]
    Crypto(String),
}

/// Seals and unseals the Coordinator state image
pub trait Sealer: Send + Sync {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SealError>;

    fn unseal(&self, blob: &[u8]) -> Result<Vec<u8>, SealError>;

    /// Wrap the current data key for each recovery party. Returns the
    /// wrapped shares; they are also embedded in every subsequent blob.
    fn generate_recovery_data(
        &self,
        recovery_keys: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, Vec<u8>>, SealError>;

    /// Inject a recovered data key, enabling `unseal` on a blob whose
    /// sealed key this instance cannot unwrap.
    fn set_data_key(&self, key: &[u8; 32]);
}

/// On-disk envelope. All binary fields are base64.
#[derive(Serialize, Deserialize)]
struct SealedBlob {
    version: u32,
    /// nonce‖ciphertext of the data key under the sealing key
    wrapped_key: String,
    /// party name → RSA-OAEP wrapped XOR share of the data key
    recovery_secrets: BTreeMap<String, String>,
    /// nonce‖ciphertext of the payload under the data key
    payload: String,
    /// SHA-256 over (version, wrapped_key, recovery_secrets, payload)
    digest: String,
}

impl SealedBlob {
    fn compute_digest(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(self.version.to_le_bytes());
        hasher.update(self.wrapped_key.as_bytes());
        for (name, share) in &self.recovery_secrets {
            hasher.update(name.as_bytes());
            hasher.update(share.as_bytes());
        }
        hasher.update(self.payload.as_bytes());
        hasher.finalize().to_vec()
    }
}

/// Number of recovery parties a sealed blob was wrapped for.
///
/// Readable without any key; the Coordinator uses it to size the share
/// assembly when it wakes up in recovery mode.
pub fn sealed_party_count(blob: &[u8]) -> Result<usize, SealError> {
    let envelope: SealedBlob = serde_json::from_slice(blob).map_err(|_| SealError::Integrity)?;
    Ok(envelope.recovery_secrets.len())
}

struct SealerState {
    data_key: Option<Zeroizing<[u8; 32]>>,
    recovery_wrapped: BTreeMap<String, Vec<u8>>,
}

/// AES-256-GCM sealer keyed by enclave sealing material
pub struct AesGcmSealer {
    sealing_key: Zeroizing<[u8; 32]>,
    state: Mutex<SealerState>,
}

impl AesGcmSealer {
    pub fn new(sealing_key: [u8; 32]) -> Self {
        Self {
            sealing_key: Zeroizing::new(sealing_key),
            state: Mutex::new(SealerState {
                data_key: None,
                recovery_wrapped: BTreeMap::new(),
            }),
        }
    }

    /// Derive the sealing key from raw key material via HKDF-SHA256.
    ///
    /// In an enclave build the material comes from the platform's sealing
    /// key derivation; outside an enclave it is read from the seal
    /// directory and binds the state to that directory only.
    pub fn from_key_material(material: &[u8]) -> Result<Self, SealError> {
        let hk = Hkdf::<Sha256>::new(Some(b"palisade-sealer"), material);
        let mut key = Zeroizing::new([0u8; 32]);
        hk.expand(b"sealing-key", key.as_mut())
            .map_err(|e| SealError::Crypto(e.to_string()))?;
        Ok(Self {
            sealing_key: key,
            state: Mutex::new(SealerState {
                data_key: None,
                recovery_wrapped: BTreeMap::new(),
            }),
        })
    }

    fn encrypt(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, SealError> {
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|e| SealError::Crypto(e.to_string()))?;
        let nonce = Aes256Gcm::generate_nonce(&mut AeadOsRng);
        let ciphertext = cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad })
            .map_err(|e| SealError::Crypto(e.to_string()))?;
        let mut out = nonce.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(key: &[u8; 32], blob: &[u8], aad: &[u8]) -> Option<Vec<u8>> {
        if blob.len() < NONCE_LEN {
            return None;
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new_from_slice(key).ok()?;
        cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
            .ok()
    }

    fn ensure_data_key(state: &mut SealerState) -> Zeroizing<[u8; 32]> {
        match &state.data_key {
            Some(key) => key.clone(),
            None => {
                let mut key = Zeroizing::new([0u8; 32]);
                use rand::RngCore;
                rand::rngs::OsRng.fill_bytes(key.as_mut());
                state.data_key = Some(key.clone());
                key
            }
        }
    }
}

impl Sealer for AesGcmSealer {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
        let mut state = self.state.lock().unwrap();
        let data_key = Self::ensure_data_key(&mut state);

        let wrapped_key = Self::encrypt(&self.sealing_key, data_key.as_slice(), &[])?;
        let mut blob = SealedBlob {
            version: BLOB_VERSION,
            wrapped_key: B64.encode(wrapped_key),
            recovery_secrets: state
                .recovery_wrapped
                .iter()
                .map(|(name, share)| (name.clone(), B64.encode(share)))
                .collect(),
            payload: String::new(),
            digest: String::new(),
        };

        // The digest is recomputed by the reader and doubles as the AEAD
        // associated data, binding the payload to the whole envelope.
        let mut pre = blob.compute_digest();
        let payload = Self::encrypt(&data_key, plaintext, &pre)?;
        blob.payload = B64.encode(payload);
        pre = blob.compute_digest();
        blob.digest = B64.encode(&pre);

        serde_json::to_vec(&blob).map_err(|e| SealError::Crypto(e.to_string()))
    }

    fn unseal(&self, raw: &[u8]) -> Result<Vec<u8>, SealError> {
        let blob: SealedBlob = serde_json::from_slice(raw).map_err(|_| SealError::Integrity)?;
        if blob.version != BLOB_VERSION {
            return Err(SealError::Integrity);
        }
        let digest = B64.decode(&blob.digest).map_err(|_| SealError::Integrity)?;
        if digest != blob.compute_digest() {
            return Err(SealError::Integrity);
        }

        let wrapped_key = B64.decode(&blob.wrapped_key).map_err(|_| SealError::Integrity)?;
        let payload = B64.decode(&blob.payload).map_err(|_| SealError::Integrity)?;

        // The payload AAD is the envelope digest with the payload field
        // empty, exactly as it was at encryption time.
        let aad = SealedBlob {
            payload: String::new(),
            digest: String::new(),
            wrapped_key: blob.wrapped_key.clone(),
            recovery_secrets: blob.recovery_secrets.clone(),
            version: blob.version,
        }
        .compute_digest();

        let mut state = self.state.lock().unwrap();
        let data_key = match Self::decrypt(&self.sealing_key, &wrapped_key, &[]) {
            Some(key_bytes) => {
                let key: [u8; 32] =
                    key_bytes.try_into().map_err(|_| SealError::Integrity)?;
                Zeroizing::new(key)
            }
            None => match &state.data_key {
                // a recovered key was injected; try it against the payload
                Some(injected) => injected.clone(),
                None => return Err(SealError::SealingKey),
            },
        };

        let plaintext =
            Self::decrypt(&data_key, &payload, &aad).ok_or(SealError::Integrity)?;

        // Remember the key so subsequent seals reuse it and recovery shares
        // stay valid across restarts.
        state.data_key = Some(data_key);
        state.recovery_wrapped = blob
            .recovery_secrets
            .iter()
            .map(|(name, share)| {
                B64.decode(share)
                    .map(|bytes| (name.clone(), bytes))
                    .map_err(|_| SealError::Integrity)
            })
            .collect::<Result<_, _>>()?;

        Ok(plaintext)
    }

    fn generate_recovery_data(
        &self,
        recovery_keys: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, Vec<u8>>, SealError> {
        let mut state = self.state.lock().unwrap();
        if recovery_keys.is_empty() {
            state.recovery_wrapped.clear();
            return Ok(BTreeMap::new());
        }

        let data_key = Self::ensure_data_key(&mut state);
        let shares = recovery::split_secret(&data_key, recovery_keys.len());

        let mut wrapped = BTreeMap::new();
        for ((name, pem), share) in recovery_keys.iter().zip(shares.iter()) {
            let sealed_share = recovery::wrap_share(pem, share.as_ref())
                .map_err(|e| SealError::Crypto(e.to_string()))?;
            wrapped.insert(name.clone(), sealed_share);
        }

        state.recovery_wrapped = wrapped.clone();
        Ok(wrapped)
    }

    fn set_data_key(&self, key: &[u8; 32]) {
        let mut state = self.state.lock().unwrap();
        state.data_key = Some(Zeroizing::new(*key));
    }
}
