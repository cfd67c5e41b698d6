//! Quote abstraction
//!
//! Attestation technology differs across platforms, so quote handling is
//! modeled as two capability traits injected at Coordinator construction:
//! [`Issuer`] wraps a message into a platform-attestable blob, [`Validator`]
//! checks a blob against an expected message and the compliance predicates.
//!
//! The predicates on [`PackageProperties`] and [`InfrastructureProperties`]
//! are the sole attestation policy; no other component inspects quote
//! internals.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

/// Errors produced by quote issuance and validation
#[derive(Error, Debug)]
pub enum QuoteError {
    #[error("quote issuance failed: {0}")]
    Issue(String),

    #[error("unknown quote")]
    UnknownQuote,

    #[error("quote message mismatch")]
    MessageMismatch,

    #[error("package does not comply")]
    PackageNonCompliant,

    #[error("infrastructure does not comply")]
    InfrastructureNonCompliant,
}

/// Issues quotes over caller-supplied messages
pub trait Issuer: Send + Sync {
    /// Wrap `message` (typically a public-key hash) into an attestable blob
    fn issue(&self, message: &[u8]) -> Result<Vec<u8>, QuoteError>;
}

/// Validates quotes against an expected message and compliance requirements
pub trait Validator: Send + Sync {
    /// Succeeds iff `quote` is cryptographically valid, embeds `message`,
    /// and its platform claims satisfy both compliance predicates.
    fn validate(
        &self,
        quote: &[u8],
        message: &[u8],
        pkg: &PackageProperties,
        infra: &InfrastructureProperties,
    ) -> Result<(), QuoteError>;
}

/// Enclave package identity: either an exact measurement (`UniqueID`) or a
/// measurement class (`SignerID` + `ProductID` + `SecurityVersion` + `Debug`).
///
/// Doubles as the manifest's package requirement and the claims a validator
/// extracts from a quote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PackageProperties {
    /// Exact enclave measurement, hex encoded
    #[serde(rename = "UniqueID", skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,
    /// Enclave signer measurement, hex encoded
    #[serde(rename = "SignerID", skip_serializing_if = "Option::is_none")]
    pub signer_id: Option<String>,
    #[serde(rename = "ProductID", skip_serializing_if = "Option::is_none")]
    pub product_id: Option<u64>,
    /// Minimum security version when used as a requirement
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_version: Option<u64>,
    pub debug: bool,
}

impl PackageProperties {
    /// Check these (attested) properties against a requirement.
    ///
    /// If the requirement pins a `UniqueID` only the exact measurement
    /// counts; otherwise signer and product must match, the security version
    /// must be at least the required floor, and a debug enclave is only
    /// admitted if the requirement allows debug.
    pub fn is_compliant(&self, req: &PackageProperties) -> bool {
        if let Some(unique_id) = &req.unique_id {
            return self.unique_id.as_deref() == Some(unique_id.as_str());
        }
        if req.signer_id.is_some() && self.signer_id != req.signer_id {
            return false;
        }
        if req.product_id.is_some() && self.product_id != req.product_id {
            return false;
        }
        if let Some(min) = req.security_version {
            match self.security_version {
                Some(v) if v >= min => {}
                _ => return false,
            }
        }
        // debug <= req.debug
        !self.debug || req.debug
    }
}

/// Opaque platform properties the validator compares against a quote's
/// platform claims. Containment: every field the requirement sets must be
/// matched by the attested value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct InfrastructureProperties {
    #[serde(rename = "QESVN", skip_serializing_if = "Option::is_none")]
    pub qe_svn: Option<u64>,
    #[serde(rename = "PCESVN", skip_serializing_if = "Option::is_none")]
    pub pce_svn: Option<u64>,
    #[serde(rename = "CPUSVN", skip_serializing_if = "Option::is_none")]
    pub cpu_svn: Option<String>,
    #[serde(rename = "RootCA", skip_serializing_if = "Option::is_none")]
    pub root_ca: Option<String>,
}

impl InfrastructureProperties {
    pub fn is_compliant(&self, req: &InfrastructureProperties) -> bool {
        if req.qe_svn.is_some() && self.qe_svn != req.qe_svn {
            return false;
        }
        if req.pce_svn.is_some() && self.pce_svn != req.pce_svn {
            return false;
        }
        if req.cpu_svn.is_some() && self.cpu_svn != req.cpu_svn {
            return false;
        }
        if req.root_ca.is_some() && self.root_ca != req.root_ca {
            return false;
        }
        true
    }
}

struct MockEntry {
    message: Vec<u8>,
    pkg: PackageProperties,
    infra: InfrastructureProperties,
}

/// Mock quote validator: an exact-match table keyed by quote bytes.
///
/// Part of the test surface; non-enclave builds of the Coordinator run
/// against this validator.
#[derive(Default)]
pub struct MockValidator {
    valid: Mutex<HashMap<Vec<u8>, MockEntry>>,
}

impl MockValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a quote the validator will accept, together with the message
    /// it embeds and the platform claims it attests.
    pub fn add_valid_quote(
        &self,
        quote: &[u8],
        message: &[u8],
        pkg: PackageProperties,
        infra: InfrastructureProperties,
    ) {
        let mut valid = self.valid.lock().unwrap();
        valid.insert(
            quote.to_vec(),
            MockEntry {
                message: message.to_vec(),
                pkg,
                infra,
            },
        );
    }
}

impl Validator for MockValidator {
    fn validate(
        &self,
        quote: &[u8],
        message: &[u8],
        pkg: &PackageProperties,
        infra: &InfrastructureProperties,
    ) -> Result<(), QuoteError> {
        let valid = self.valid.lock().unwrap();
        let entry = valid.get(quote).ok_or(QuoteError::UnknownQuote)?;
        if entry.message != message {
            return Err(QuoteError::MessageMismatch);
        }
        if !entry.pkg.is_compliant(pkg) {
            return Err(QuoteError::PackageNonCompliant);
        }
        if !entry.infra.is_compliant(infra) {
            return Err(QuoteError::InfrastructureNonCompliant);
        }
        Ok(())
    }
}

/// Mock quote issuer: the "quote" is the SHA-256 of the message
#[derive(Default)]
pub struct MockIssuer;

impl MockIssuer {
    pub fn new() -> Self {
        Self
    }
}

impl Issuer for MockIssuer {
    fn issue(&self, message: &[u8]) -> Result<Vec<u8>, QuoteError> {
        Ok(Sha256::digest(message).to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class_props(sv: u64, debug: bool) -> PackageProperties {
        PackageProperties {
            unique_id: None,
            signer_id: Some("c0ffee".into()),
            product_id: Some(7),
            security_version: Some(sv),
            debug,
        }
    }

    #[test]
    fn unique_id_requirement_ignores_class_fields() {
        let req = PackageProperties {
            unique_id: Some("abcd".into()),
            ..Default::default()
        };

        let mut attested = class_props(1, false);
        attested.unique_id = Some("abcd".into());
        assert!(attested.is_compliant(&req));

        attested.unique_id = Some("ffff".into());
        assert!(!attested.is_compliant(&req));
    }

    #[test]
    fn security_version_is_a_floor() {
        let req = class_props(2, false);

        assert!(!class_props(1, false).is_compliant(&req));
        assert!(class_props(2, false).is_compliant(&req));
        assert!(class_props(3, false).is_compliant(&req));
    }

    #[test]
    fn debug_enclave_needs_debug_requirement() {
        assert!(!class_props(2, true).is_compliant(&class_props(2, false)));
        assert!(class_props(2, true).is_compliant(&class_props(2, true)));
        // a production enclave always satisfies a debug-tolerant requirement
        assert!(class_props(2, false).is_compliant(&class_props(2, true)));
    }

    #[test]
    fn infrastructure_containment() {
        let req = InfrastructureProperties {
            qe_svn: Some(4),
            ..Default::default()
        };
        let attested = InfrastructureProperties {
            qe_svn: Some(4),
            pce_svn: Some(9),
            ..Default::default()
        };
        assert!(attested.is_compliant(&req));
        assert!(attested.is_compliant(&InfrastructureProperties::default()));
        assert!(!InfrastructureProperties::default().is_compliant(&req));
    }

    #[test]
    fn mock_validator_checks_in_order() {
        let validator = MockValidator::new();
        let pkg = class_props(2, false);
        let infra = InfrastructureProperties::default();
        validator.add_valid_quote(b"quote-1", b"msg", pkg.clone(), infra.clone());

        assert!(validator.validate(b"quote-1", b"msg", &pkg, &infra).is_ok());
        assert!(matches!(
            validator.validate(b"quote-2", b"msg", &pkg, &infra),
            Err(QuoteError::UnknownQuote)
        ));
        assert!(matches!(
            validator.validate(b"quote-1", b"other", &pkg, &infra),
            Err(QuoteError::MessageMismatch)
        ));
        assert!(matches!(
            validator.validate(b"quote-1", b"msg", &class_props(3, false), &infra),
            Err(QuoteError::PackageNonCompliant)
        ));
    }

    #[test]
    fn mock_issuer_is_deterministic() {
        let issuer = MockIssuer::new();
        let a = issuer.issue(b"hello").unwrap();
        let b = issuer.issue(b"hello").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }
}
