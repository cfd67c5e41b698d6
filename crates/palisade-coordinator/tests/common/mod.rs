//! Shared helpers for the coordinator integration tests

use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509Builder, X509NameBuilder, X509ReqBuilder, X509};
use palisade_core::pki::csr_public_key_digest;
use palisade_core::quote::{
    InfrastructureProperties, Issuer, MockIssuer, MockValidator, PackageProperties, Validator,
};
use palisade_core::seal::{AesGcmSealer, Sealer};
use palisade_coordinator::{ActivationRequest, Core};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// A coordinator instance wired against the mock quote stack
pub struct TestCoordinator {
    pub core: Core,
    pub validator: Arc<MockValidator>,
}

/// Start a coordinator over `seal_dir`; `sealing_key` models the enclave
/// identity, so a different key is a different enclave instance.
pub fn start_coordinator(seal_dir: &Path, sealing_key: [u8; 32]) -> TestCoordinator {
    let validator = Arc::new(MockValidator::new());
    let issuer: Arc<dyn Issuer> = Arc::new(MockIssuer::new());
    let sealer: Arc<dyn Sealer> = Arc::new(AesGcmSealer::new(sealing_key));
    let dyn_validator: Arc<dyn Validator> = validator.clone();

    let core = Core::new(
        &["localhost".to_string()],
        dyn_validator,
        issuer,
        sealer,
        seal_dir,
    )
    .expect("coordinator should start");

    TestCoordinator { core, validator }
}

/// The package properties the test marbles attest as
pub fn backend_package(security_version: u64) -> PackageProperties {
    PackageProperties {
        unique_id: None,
        signer_id: Some("c0ffee".to_string()),
        product_id: Some(13),
        security_version: Some(security_version),
        debug: false,
    }
}

/// A manifest with one marble (`backend-first`, max one activation) and a
/// 256-bit shared secret templated into its environment.
pub fn single_marble_manifest() -> Vec<u8> {
    serde_json::json!({
        "Packages": {
            "backend": { "SignerID": "c0ffee", "ProductID": 13, "SecurityVersion": 2 }
        },
        "Marbles": {
            "backend-first": {
                "Package": "backend",
                "MaxActivations": 1,
                "Parameters": {
                    "Env": { "API_KEY": "{{ .Secrets.apikey }}" },
                    "Argv": ["--serve"]
                }
            }
        },
        "Secrets": {
            "apikey": { "Type": "symmetric-key", "Size": 256, "Shared": true }
        }
    })
    .to_string()
    .into_bytes()
}

/// Generate a fresh P-256 key and a DER CSR carrying it
pub fn make_csr() -> (PKey<Private>, Vec<u8>) {
    let key = ec_key();
    let mut builder = X509ReqBuilder::new().unwrap();
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", "marble").unwrap();
    builder.set_subject_name(&name.build()).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    (key, builder.build().to_der().unwrap())
}

/// Register `quote` as valid for `csr_der` with the given attested claims
pub fn register_quote(
    validator: &MockValidator,
    quote: &[u8],
    csr_der: &[u8],
    attested: PackageProperties,
) {
    let message = csr_public_key_digest(csr_der).unwrap();
    validator.add_valid_quote(quote, &message, attested, InfrastructureProperties::default());
}

pub fn activation(quote: &[u8], csr_der: &[u8], uuid: Uuid, marble: &str) -> ActivationRequest {
    ActivationRequest {
        quote: quote.to_vec(),
        csr_der: csr_der.to_vec(),
        uuid,
        marble_type: marble.to_string(),
        deadline: None,
    }
}

/// A self-signed operator certificate; returns (PEM for the manifest,
/// DER as presented on the wire)
pub fn operator_cert(common_name: &str) -> (String, Vec<u8>) {
    let key = ec_key();
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", common_name).unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&openssl::asn1::Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&openssl::asn1::Asn1Time::days_from_now(365).unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    let cert = builder.build();

    (
        String::from_utf8(cert.to_pem().unwrap()).unwrap(),
        cert.to_der().unwrap(),
    )
}

/// Serial number of a PEM certificate as u64
pub fn cert_serial(pem: &str) -> u64 {
    let cert = X509::from_pem(pem.as_bytes()).unwrap();
    let bn = cert.serial_number().to_bn().unwrap();
    bn.to_dec_str().unwrap().parse().unwrap()
}

fn ec_key() -> PKey<Private> {
    let group =
        openssl::ec::EcGroup::from_curve_name(openssl::nid::Nid::X9_62_PRIME256V1).unwrap();
    PKey::from_ec_key(openssl::ec::EcKey::generate(&group).unwrap()).unwrap()
}
