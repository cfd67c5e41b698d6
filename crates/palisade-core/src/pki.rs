//! Internal PKI
//!
//! A long-lived self-signed root CA, an intermediate CA that is rotated on
//! recovery, and leaf issuance for activated marbles and certificate-typed
//! secrets. Serial numbers are supplied by the caller from the monotone
//! counter in the state store, so concurrent issuances can never reuse one.
//!
//! Private keys never leave this type except serialized into the sealed
//! state image.

use openssl::asn1::{Asn1Integer, Asn1Time};
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{HasPublic, PKey, PKeyRef, Private};
use openssl::sign::{Signer, Verifier};
use openssl::x509::extension::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
};
use openssl::x509::{X509Builder, X509NameBuilder, X509Req, X509};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{CoreError, Result};

const ROOT_CN: &str = "Palisade Coordinator - Root CA";
const INTERMEDIATE_CN: &str = "Palisade Coordinator - Intermediate CA";
const ORGANIZATION: &str = "Palisade";

/// Root CA validity; the root outlives every mesh deployment it anchors.
const ROOT_VALIDITY_DAYS: u32 = 7300;
const INTERMEDIATE_VALIDITY_DAYS: u32 = 3650;

/// Default marble leaf validity when the manifest declares no TTL
pub const DEFAULT_MARBLE_TTL_HOURS: u64 = 24;

/// The Coordinator's certificate authority state
pub struct CertificateAuthority {
    root_key: PKey<Private>,
    root_cert: X509,
    intermediate_key: PKey<Private>,
    intermediate_cert: X509,
    dns_names: Vec<String>,
}

/// Serialized PKI material, part of the sealed state image
#[derive(Serialize, Deserialize)]
pub struct PkiState {
    pub root_key: String,
    pub root_cert: String,
    pub intermediate_key: String,
    pub intermediate_cert: String,
    pub dns_names: Vec<String>,
}

impl CertificateAuthority {
    /// Generate a fresh root and intermediate CA.
    ///
    /// The intermediate carries `dns_names` as SANs so it can also certify
    /// the Coordinator's own listeners.
    pub fn generate(dns_names: &[String], root_serial: u64, intermediate_serial: u64) -> Result<Self> {
        let root_key = generate_p256_key()?;
        let root_cert = build_root_cert(&root_key, root_serial)?;

        let intermediate_key = generate_p256_key()?;
        let intermediate_cert = build_intermediate_cert(
            &root_key,
            &root_cert,
            &intermediate_key,
            dns_names,
            intermediate_serial,
        )?;

        Ok(Self {
            root_key,
            root_cert,
            intermediate_key,
            intermediate_cert,
            dns_names: dns_names.to_vec(),
        })
    }

    /// Replace the intermediate CA under the unchanged root. Used after
    /// recovery so a compromised sealing environment cannot keep minting
    /// leaves from the old intermediate key.
    pub fn rotate_intermediate(&mut self, serial: u64) -> Result<()> {
        let key = generate_p256_key()?;
        let cert = build_intermediate_cert(
            &self.root_key,
            &self.root_cert,
            &key,
            &self.dns_names,
            serial,
        )?;
        self.intermediate_key = key;
        self.intermediate_cert = cert;
        Ok(())
    }

    /// Sign a marble leaf certificate from a CSR.
    ///
    /// CN is the marble name (not the CSR subject); SANs are the activation
    /// UUID plus the manifest-declared and caller-supplied names. Key usage
    /// is pinned to digitalSignature|keyEncipherment with clientAuth and
    /// serverAuth extended usage.
    pub fn issue_marble_cert(
        &self,
        marble_name: &str,
        csr_der: &[u8],
        uuid: &str,
        extra_sans: &[String],
        ttl_hours: u64,
        serial: u64,
    ) -> Result<X509> {
        let csr = X509Req::from_der(csr_der)
            .map_err(|e| CoreError::Invalid(format!("malformed CSR: {e}")))?;
        let csr_key = csr.public_key()?;
        if !csr.verify(&csr_key)? {
            return Err(CoreError::Invalid("CSR signature verification failed".into()));
        }

        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        let serial_num = asn1_serial(serial)?;
        builder.set_serial_number(&serial_num)?;
        let subject = subject_name(marble_name)?;
        builder.set_subject_name(&subject)?;
        builder.set_issuer_name(self.intermediate_cert.subject_name())?;
        builder.set_pubkey(&csr_key)?;
        let not_before = Asn1Time::days_from_now(0)?;
        builder.set_not_before(&not_before)?;
        let not_after = hours_from_now(ttl_hours)?;
        builder.set_not_after(&not_after)?;

        let mut san = SubjectAlternativeName::new();
        san.dns(uuid);
        for name in extra_sans {
            if name.parse::<std::net::IpAddr>().is_ok() {
                san.ip(name);
            } else {
                san.dns(name);
            }
        }
        let ctx = builder.x509v3_context(Some(&self.intermediate_cert), None);
        let san = san.build(&ctx)?;
        builder.append_extension(san)?;
        builder.append_extension(BasicConstraints::new().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .critical()
                .digital_signature()
                .key_encipherment()
                .build()?,
        )?;
        builder.append_extension(
            ExtendedKeyUsage::new().client_auth().server_auth().build()?,
        )?;

        builder.sign(&self.intermediate_key, MessageDigest::sha256())?;
        Ok(builder.build())
    }

    /// Sign a leaf certificate for a secret-engine generated key pair
    pub fn issue_secret_cert(
        &self,
        common_name: &str,
        key: &PKeyRef<impl HasPublic>,
        validity_days: u32,
        serial: u64,
    ) -> Result<X509> {
        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        let serial_num = asn1_serial(serial)?;
        builder.set_serial_number(&serial_num)?;
        let subject = subject_name(common_name)?;
        builder.set_subject_name(&subject)?;
        builder.set_issuer_name(self.intermediate_cert.subject_name())?;
        builder.set_pubkey(key)?;
        let not_before = Asn1Time::days_from_now(0)?;
        builder.set_not_before(&not_before)?;
        let not_after = Asn1Time::days_from_now(validity_days)?;
        builder.set_not_after(&not_after)?;
        builder.append_extension(BasicConstraints::new().build()?)?;
        builder.append_extension(
            KeyUsage::new().digital_signature().key_encipherment().build()?,
        )?;
        builder.sign(&self.intermediate_key, MessageDigest::sha256())?;
        Ok(builder.build())
    }

    /// `[intermediate, root]`, PEM encoded
    pub fn intermediate_chain_pem(&self) -> Result<Vec<String>> {
        Ok(vec![self.intermediate_cert_pem()?, self.root_cert_pem()?])
    }

    pub fn root_cert_pem(&self) -> Result<String> {
        pem(&self.root_cert)
    }

    pub fn intermediate_cert_pem(&self) -> Result<String> {
        pem(&self.intermediate_cert)
    }

    pub fn root_cert(&self) -> &X509 {
        &self.root_cert
    }

    pub fn intermediate_cert(&self) -> &X509 {
        &self.intermediate_cert
    }

    /// SHA-256 over the intermediate's SubjectPublicKeyInfo; the message the
    /// Coordinator embeds in its own quote.
    pub fn intermediate_pubkey_digest(&self) -> Result<Vec<u8>> {
        let der = self.intermediate_cert.public_key()?.public_key_to_der()?;
        Ok(Sha256::digest(der).to_vec())
    }

    /// ECDSA-SHA256 signature under the root key (manifest signatures)
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.root_key)?;
        signer.update(data)?;
        Ok(signer.sign_to_vec()?)
    }

    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<bool> {
        let public = self.root_cert.public_key()?;
        let mut verifier = Verifier::new(MessageDigest::sha256(), &public)?;
        verifier.update(data)?;
        Ok(verifier.verify(signature)?)
    }

    pub fn to_state(&self) -> Result<PkiState> {
        Ok(PkiState {
            root_key: key_pem(&self.root_key)?,
            root_cert: pem(&self.root_cert)?,
            intermediate_key: key_pem(&self.intermediate_key)?,
            intermediate_cert: pem(&self.intermediate_cert)?,
            dns_names: self.dns_names.clone(),
        })
    }

    pub fn from_state(state: &PkiState) -> Result<Self> {
        Ok(Self {
            root_key: PKey::private_key_from_pem(state.root_key.as_bytes())?,
            root_cert: X509::from_pem(state.root_cert.as_bytes())?,
            intermediate_key: PKey::private_key_from_pem(state.intermediate_key.as_bytes())?,
            intermediate_cert: X509::from_pem(state.intermediate_cert.as_bytes())?,
            dns_names: state.dns_names.clone(),
        })
    }
}

/// SHA-256 over the public key carried by a DER-encoded CSR.
///
/// This is the message a marble must have embedded in its quote; computing
/// it also verifies the CSR's self-signature.
pub fn csr_public_key_digest(csr_der: &[u8]) -> Result<Vec<u8>> {
    let csr = X509Req::from_der(csr_der)
        .map_err(|e| CoreError::Invalid(format!("malformed CSR: {e}")))?;
    let key = csr.public_key()?;
    if !csr.verify(&key)? {
        return Err(CoreError::Invalid("CSR signature verification failed".into()));
    }
    Ok(Sha256::digest(key.public_key_to_der()?).to_vec())
}

/// SHA-256 fingerprint of a certificate's DER encoding, hex encoded
pub fn cert_fingerprint(cert: &X509) -> Result<String> {
    Ok(hex::encode(&cert.digest(MessageDigest::sha256())?[..]))
}

pub(crate) fn generate_p256_key() -> Result<PKey<Private>> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    let key = EcKey::generate(&group)?;
    Ok(PKey::from_ec_key(key)?)
}

fn build_root_cert(key: &PKey<Private>, serial: u64) -> Result<X509> {
    let name = subject_name(ROOT_CN)?;
    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    let serial_num = asn1_serial(serial)?;
    builder.set_serial_number(&serial_num)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(key)?;
    let not_before = Asn1Time::days_from_now(0)?;
    builder.set_not_before(&not_before)?;
    let not_after = Asn1Time::days_from_now(ROOT_VALIDITY_DAYS)?;
    builder.set_not_after(&not_after)?;
    builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
    builder.append_extension(KeyUsage::new().critical().key_cert_sign().crl_sign().build()?)?;
    builder.sign(key, MessageDigest::sha256())?;
    Ok(builder.build())
}

fn build_intermediate_cert(
    root_key: &PKey<Private>,
    root_cert: &X509,
    key: &PKey<Private>,
    dns_names: &[String],
    serial: u64,
) -> Result<X509> {
    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    let serial_num = asn1_serial(serial)?;
    builder.set_serial_number(&serial_num)?;
    let subject = subject_name(INTERMEDIATE_CN)?;
    builder.set_subject_name(&subject)?;
    builder.set_issuer_name(root_cert.subject_name())?;
    builder.set_pubkey(key)?;
    let not_before = Asn1Time::days_from_now(0)?;
    builder.set_not_before(&not_before)?;
    let not_after = Asn1Time::days_from_now(INTERMEDIATE_VALIDITY_DAYS)?;
    builder.set_not_after(&not_after)?;
    builder.append_extension(BasicConstraints::new().critical().ca().pathlen(0).build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .digital_signature()
            .key_cert_sign()
            .crl_sign()
            .build()?,
    )?;
    if !dns_names.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for name in dns_names {
            if name.parse::<std::net::IpAddr>().is_ok() {
                san.ip(name);
            } else {
                san.dns(name);
            }
        }
        let ctx = builder.x509v3_context(Some(root_cert), None);
        let san = san.build(&ctx)?;
        builder.append_extension(san)?;
    }
    builder.sign(root_key, MessageDigest::sha256())?;
    Ok(builder.build())
}

fn subject_name(cn: &str) -> Result<openssl::x509::X509Name> {
    let mut builder = X509NameBuilder::new()?;
    builder.append_entry_by_text("O", ORGANIZATION)?;
    builder.append_entry_by_text("CN", cn)?;
    Ok(builder.build())
}

fn asn1_serial(serial: u64) -> Result<Asn1Integer> {
    let bn = BigNum::from_dec_str(&serial.to_string())?;
    Ok(bn.to_asn1_integer()?)
}

fn hours_from_now(hours: u64) -> Result<Asn1Time> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| CoreError::Internal(e.to_string()))?
        .as_secs();
    Ok(Asn1Time::from_unix((now + hours * 3600) as i64)?)
}

fn pem(cert: &X509) -> Result<String> {
    String::from_utf8(cert.to_pem()?).map_err(|e| CoreError::Internal(e.to_string()))
}

fn key_pem(key: &PKey<Private>) -> Result<String> {
    String::from_utf8(key.private_key_to_pem_pkcs8()?).map_err(|e| CoreError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::x509::X509ReqBuilder;

    fn test_csr() -> (PKey<Private>, Vec<u8>) {
        let key = generate_p256_key().unwrap();
        let mut builder = X509ReqBuilder::new().unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "marble").unwrap();
        builder.set_subject_name(&name.build()).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        let der = builder.build().to_der().unwrap();
        (key, der)
    }

    fn test_ca() -> CertificateAuthority {
        CertificateAuthority::generate(&["coordinator.mesh.local".into()], 1, 2).unwrap()
    }

    #[test]
    fn root_is_self_signed_and_signs_intermediate() {
        let ca = test_ca();
        let root_pub = ca.root_cert.public_key().unwrap();
        assert!(ca.root_cert.verify(&root_pub).unwrap());
        assert!(ca.intermediate_cert.verify(&root_pub).unwrap());
    }

    #[test]
    fn marble_cert_has_name_and_chains_to_intermediate() {
        let ca = test_ca();
        let (_, csr) = test_csr();
        let cert = ca
            .issue_marble_cert("backend", &csr, "1e2a-uuid", &[], 24, 10)
            .unwrap();

        let cn = cert
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .unwrap()
            .data()
            .as_utf8()
            .unwrap()
            .to_string();
        assert_eq!(cn, "backend");

        let intermediate_pub = ca.intermediate_cert.public_key().unwrap();
        assert!(cert.verify(&intermediate_pub).unwrap());
        assert_eq!(cert.serial_number().to_bn().unwrap(), BigNum::from_u32(10).unwrap());
    }

    #[test]
    fn corrupted_csr_is_rejected() {
        let ca = test_ca();
        let (_, mut csr) = test_csr();
        let len = csr.len();
        csr[len - 1] ^= 0xFF;
        assert!(ca.issue_marble_cert("backend", &csr, "u", &[], 24, 10).is_err());
    }

    #[test]
    fn csr_digest_matches_key() {
        let (key, csr) = test_csr();
        let digest = csr_public_key_digest(&csr).unwrap();
        let expected = Sha256::digest(key.public_key_to_der().unwrap()).to_vec();
        assert_eq!(digest, expected);
    }

    #[test]
    fn rotation_keeps_root_and_old_leaves_valid() {
        let mut ca = test_ca();
        let (_, csr) = test_csr();
        let leaf = ca.issue_marble_cert("m", &csr, "u", &[], 24, 3).unwrap();
        let old_intermediate = ca.intermediate_cert.clone();
        let root_pem_before = ca.root_cert_pem().unwrap();

        ca.rotate_intermediate(4).unwrap();

        assert_eq!(ca.root_cert_pem().unwrap(), root_pem_before);
        assert_ne!(
            ca.intermediate_cert_pem().unwrap(),
            String::from_utf8(old_intermediate.to_pem().unwrap()).unwrap()
        );
        // the old leaf still chains to the unchanged root via the old intermediate
        assert!(leaf.verify(&old_intermediate.public_key().unwrap()).unwrap());
        let root_pub = ca.root_cert.public_key().unwrap();
        assert!(ca.intermediate_cert.verify(&root_pub).unwrap());
    }

    #[test]
    fn manifest_signature_round_trip() {
        let ca = test_ca();
        let sig = ca.sign(b"manifest bytes").unwrap();
        assert!(ca.verify(b"manifest bytes", &sig).unwrap());
        assert!(!ca.verify(b"other bytes", &sig).unwrap());
    }

    #[test]
    fn state_round_trip() {
        let ca = test_ca();
        let state = ca.to_state().unwrap();
        let restored = CertificateAuthority::from_state(&state).unwrap();
        assert_eq!(restored.root_cert_pem().unwrap(), ca.root_cert_pem().unwrap());
        assert_eq!(
            restored.intermediate_cert_pem().unwrap(),
            ca.intermediate_cert_pem().unwrap()
        );
    }
}
