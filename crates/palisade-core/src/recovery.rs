//! Recovery key primitives
//!
//! The sealer's data key is XOR-split into one share per designated
//! recovery party; every share is required to reassemble the key (k = n).
//! Each share is wrapped with RSA-OAEP under the party's public key from
//! the manifest, so only the key holder can produce the plaintext share
//! posted back during recovery.

use openssl::encrypt::{Decrypter, Encrypter};
use openssl::pkey::{PKey, Private, Public};
use openssl::rsa::Padding;
use rand::RngCore;
use thiserror::Error;

/// Length of the recovery secret (the sealer data key)
pub const SECRET_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("invalid recovery key: {0}")]
    InvalidKey(String),

    #[error("recovery crypto failure: {0}")]
    Crypto(String),

    #[error("recovery share has wrong length: {0}")]
    ShareLength(usize),

    #[error("recovery is already complete")]
    AlreadyComplete,
}

/// XOR-split `secret` into `parties` shares; XOR of all shares restores it.
pub fn split_secret(secret: &[u8; SECRET_LEN], parties: usize) -> Vec<[u8; SECRET_LEN]> {
    let mut shares = Vec::with_capacity(parties);
    let mut acc = *secret;
    for _ in 1..parties {
        let mut share = [0u8; SECRET_LEN];
        rand::rngs::OsRng.fill_bytes(&mut share);
        for (a, s) in acc.iter_mut().zip(share.iter()) {
            *a ^= s;
        }
        shares.push(share);
    }
    shares.push(acc);
    shares
}

/// Wrap a share with RSA-OAEP under a party's PEM-encoded public key
pub fn wrap_share(public_key_pem: &str, share: &[u8]) -> Result<Vec<u8>, RecoveryError> {
    let key: PKey<Public> = PKey::public_key_from_pem(public_key_pem.as_bytes())
        .map_err(|e| RecoveryError::InvalidKey(e.to_string()))?;
    let mut encrypter = Encrypter::new(&key).map_err(crypto_err)?;
    encrypter.set_rsa_padding(Padding::PKCS1_OAEP).map_err(crypto_err)?;
    let len = encrypter.encrypt_len(share).map_err(crypto_err)?;
    let mut wrapped = vec![0u8; len];
    let written = encrypter.encrypt(share, &mut wrapped).map_err(crypto_err)?;
    wrapped.truncate(written);
    Ok(wrapped)
}

/// Unwrap a share with the party's private key.
///
/// This runs on the recovery party's side; it is here so tests and the CLI
/// tooling share one implementation.
pub fn unwrap_share(key: &PKey<Private>, wrapped: &[u8]) -> Result<Vec<u8>, RecoveryError> {
    let mut decrypter = Decrypter::new(key).map_err(crypto_err)?;
    decrypter.set_rsa_padding(Padding::PKCS1_OAEP).map_err(crypto_err)?;
    let len = decrypter.decrypt_len(wrapped).map_err(crypto_err)?;
    let mut share = vec![0u8; len];
    let written = decrypter.decrypt(wrapped, &mut share).map_err(crypto_err)?;
    share.truncate(written);
    Ok(share)
}

fn crypto_err(err: openssl::error::ErrorStack) -> RecoveryError {
    RecoveryError::Crypto(err.to_string())
}

/// Accumulates plaintext shares posted by recovery parties and XORs them
/// back into the data key once every party has contributed.
pub struct RecoveryAssembly {
    acc: [u8; SECRET_LEN],
    required: usize,
    received: usize,
}

impl RecoveryAssembly {
    pub fn new(required: usize) -> Self {
        Self {
            acc: [0u8; SECRET_LEN],
            required: required.max(1),
            received: 0,
        }
    }

    /// Fold in one share; returns the number of shares still missing.
    pub fn add_share(&mut self, share: &[u8]) -> Result<usize, RecoveryError> {
        if self.received >= self.required {
            return Err(RecoveryError::AlreadyComplete);
        }
        if share.len() != SECRET_LEN {
            return Err(RecoveryError::ShareLength(share.len()));
        }
        for (a, s) in self.acc.iter_mut().zip(share.iter()) {
            *a ^= s;
        }
        self.received += 1;
        Ok(self.required - self.received)
    }

    pub fn remaining(&self) -> usize {
        self.required - self.received
    }

    /// The reassembled secret, once all shares are in
    pub fn secret(&self) -> Option<[u8; SECRET_LEN]> {
        (self.received == self.required).then_some(self.acc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::rsa::Rsa;

    #[test]
    fn split_xors_back_to_secret() {
        let secret = [0xABu8; SECRET_LEN];
        for parties in 1..5 {
            let shares = split_secret(&secret, parties);
            assert_eq!(shares.len(), parties);

            let mut assembly = RecoveryAssembly::new(parties);
            for share in &shares {
                assembly.add_share(share).unwrap();
            }
            assert_eq!(assembly.secret(), Some(secret));
        }
    }

    #[test]
    fn assembly_incomplete_without_all_shares() {
        let shares = split_secret(&[1u8; SECRET_LEN], 3);
        let mut assembly = RecoveryAssembly::new(3);
        assembly.add_share(&shares[0]).unwrap();
        assert_eq!(assembly.remaining(), 2);
        assert!(assembly.secret().is_none());
    }

    #[test]
    fn wrap_unwrap_round_trip() {
        let rsa = Rsa::generate(2048).unwrap();
        let pem = String::from_utf8(rsa.public_key_to_pem().unwrap()).unwrap();
        let key = PKey::from_rsa(rsa).unwrap();

        let share = [0x42u8; SECRET_LEN];
        let wrapped = wrap_share(&pem, &share).unwrap();
        assert_ne!(wrapped, share.to_vec());
        assert_eq!(unwrap_share(&key, &wrapped).unwrap(), share.to_vec());
    }

    #[test]
    fn wrap_rejects_garbage_key() {
        assert!(matches!(
            wrap_share("not a pem", &[0u8; SECRET_LEN]),
            Err(RecoveryError::InvalidKey(_))
        ));
    }

    #[test]
    fn bad_share_length_rejected() {
        let mut assembly = RecoveryAssembly::new(1);
        assert!(matches!(
            assembly.add_share(&[1, 2, 3]),
            Err(RecoveryError::ShareLength(3))
        ));
    }
}
