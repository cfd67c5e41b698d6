//! Manifest model
//!
//! The manifest is the operator-authored policy bound to a Coordinator at
//! first launch: which enclave measurements may join the mesh, under which
//! identity, with which secrets, and who may update what. It is immutable
//! after acceptance except through the narrow update rules below; every
//! accepted update produces a new manifest generation.
//!
//! The wire format is PascalCase JSON; the canonical manifest hash is the
//! SHA-256 of the raw bytes exactly as accepted.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::error::{CoreError, Result};
use crate::quote::{InfrastructureProperties, PackageProperties};
use crate::secrets::{Secret, SecretSpec, UserSecret};

/// Role actions understood by the authorization check
pub mod actions {
    pub const UPDATE_SECURITY_VERSION: &str = "UpdateSecurityVersion";
    pub const READ_SECRET: &str = "ReadSecret";
    pub const WRITE_SECRET: &str = "WriteSecret";
}

/// Role resource types
pub mod resources {
    pub const PACKAGES: &str = "Packages";
    pub const SECRETS: &str = "Secrets";
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Manifest {
    /// Enclave packages admitted to the mesh, by name
    pub packages: BTreeMap<String, PackageProperties>,
    /// Infrastructure requirements the validator may match quotes against
    pub infrastructures: BTreeMap<String, InfrastructureProperties>,
    /// Marble definitions, by name
    pub marbles: BTreeMap<String, Marble>,
    /// Declared secrets, by name
    pub secrets: BTreeMap<String, SecretSpec>,
    /// Named permission grants
    pub roles: BTreeMap<String, Role>,
    /// Authenticated operators, by name
    pub users: BTreeMap<String, User>,
    /// PEM-encoded RSA public keys of designated recovery parties
    pub recovery_keys: BTreeMap<String, String>,
    /// Extra SANs allowed on issued marble certificates, by marble name
    #[serde(rename = "TLS")]
    pub tls: BTreeMap<String, Vec<String>>,
    /// Marble leaf validity; defaults to 24h
    #[serde(rename = "CertTTLHours", skip_serializing_if = "Option::is_none")]
    pub cert_ttl_hours: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Marble {
    /// Name of the package this marble must attest as
    pub package: String,
    /// Maximum number of activations; 0 = unbounded
    pub max_activations: u64,
    pub parameters: Parameters,
}

/// What a marble receives on activation, before templating
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Parameters {
    /// Path → templated file content
    pub files: BTreeMap<String, String>,
    /// Name → templated value
    pub env: BTreeMap<String, String>,
    /// Argv prefix for the marble entrypoint
    pub argv: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Role {
    pub resource_type: String,
    pub resource_names: Vec<String>,
    pub actions: Vec<String>,
    /// Distinct signers required for updates covered by this role
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<u32>,
}

impl Role {
    pub fn covers(&self, resource_type: &str, name: &str, action: &str) -> bool {
        self.resource_type == resource_type
            && self.resource_names.iter().any(|n| n == name)
            && self.actions.iter().any(|a| a == action)
    }

    pub fn threshold(&self) -> u32 {
        self.threshold.unwrap_or(1).max(1)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct User {
    /// PEM-encoded authentication certificate
    pub certificate: String,
    pub roles: Vec<String>,
}

/// The only mutations an accepted manifest admits: raising a package's
/// security floor and replacing user-supplied secret values.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ManifestUpdate {
    pub packages: BTreeMap<String, PackageUpdate>,
    pub secrets: BTreeMap<String, UserSecret>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PackageUpdate {
    pub security_version: u64,
}

/// Canonical manifest hash: SHA-256 over the raw accepted bytes, base64
pub fn manifest_hash(raw: &[u8]) -> String {
    B64.encode(Sha256::digest(raw))
}

impl Manifest {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let manifest: Manifest = serde_json::from_slice(raw)
            .map_err(|e| CoreError::Invalid(format!("manifest does not parse: {e}")))?;
        manifest.check()?;
        Ok(manifest)
    }

    /// Structural invariants. Violations reject the manifest as a whole.
    pub fn check(&self) -> Result<()> {
        if self.marbles.is_empty() {
            return Err(CoreError::Invalid("manifest declares no marbles".into()));
        }
        for (name, marble) in &self.marbles {
            if !self.packages.contains_key(&marble.package) {
                return Err(CoreError::Invalid(format!(
                    "marble {name} references unknown package {}",
                    marble.package
                )));
            }
        }
        for (name, spec) in &self.secrets {
            spec.check(name)?;
        }
        for (name, role) in &self.roles {
            self.check_role(name, role)?;
        }
        for (name, user) in &self.users {
            if openssl::x509::X509::from_pem(user.certificate.as_bytes()).is_err() {
                return Err(CoreError::Invalid(format!(
                    "user {name} carries an unparsable certificate"
                )));
            }
            for role in &user.roles {
                if !self.roles.contains_key(role) {
                    return Err(CoreError::Invalid(format!(
                        "user {name} references unknown role {role}"
                    )));
                }
            }
        }
        for (name, pem) in &self.recovery_keys {
            if openssl::pkey::PKey::public_key_from_pem(pem.as_bytes()).is_err() {
                return Err(CoreError::Invalid(format!(
                    "recovery key {name} is not a valid public key"
                )));
            }
        }
        for marble in self.tls.keys() {
            if !self.marbles.contains_key(marble) {
                return Err(CoreError::Invalid(format!(
                    "TLS section references unknown marble {marble}"
                )));
            }
        }
        if self.cert_ttl_hours == Some(0) {
            return Err(CoreError::Invalid("CertTTLHours must be positive".into()));
        }
        Ok(())
    }

    fn check_role(&self, name: &str, role: &Role) -> Result<()> {
        let valid_actions: &[&str] = match role.resource_type.as_str() {
            resources::PACKAGES => &[actions::UPDATE_SECURITY_VERSION],
            resources::SECRETS => &[actions::READ_SECRET, actions::WRITE_SECRET],
            other => {
                return Err(CoreError::Invalid(format!(
                    "role {name} has unknown resource type {other}"
                )))
            }
        };
        for action in &role.actions {
            if !valid_actions.contains(&action.as_str()) {
                return Err(CoreError::Invalid(format!(
                    "role {name} grants unknown action {action}"
                )));
            }
        }
        for resource in &role.resource_names {
            let exists = match role.resource_type.as_str() {
                resources::PACKAGES => self.packages.contains_key(resource),
                _ => self.secrets.contains_key(resource),
            };
            if !exists {
                return Err(CoreError::Invalid(format!(
                    "role {name} names unknown resource {resource}"
                )));
            }
        }
        Ok(())
    }

    /// Apply an update delta.
    ///
    /// Only security-version raises and user-supplied secret replacements
    /// are admitted; anything else is rejected without touching the
    /// manifest. Returns the materialized replacement secrets so the caller
    /// can store them alongside the new generation.
    pub fn apply_update(&mut self, update: ManifestUpdate) -> Result<Vec<(String, Secret)>> {
        if update.packages.is_empty() && update.secrets.is_empty() {
            return Err(CoreError::Invalid("update delta is empty".into()));
        }

        // validate everything before mutating anything
        for (name, pkg_update) in &update.packages {
            let current = self.packages.get(name).ok_or_else(|| {
                CoreError::Invalid(format!("update names unknown package {name}"))
            })?;
            let floor = current.security_version.unwrap_or(0);
            if pkg_update.security_version <= floor {
                return Err(CoreError::Invalid(format!(
                    "security version of package {name} can only be raised (current {floor})"
                )));
            }
        }
        let mut replaced = Vec::new();
        for (name, value) in update.secrets {
            let spec = self.secrets.get(&name).ok_or_else(|| {
                CoreError::Invalid(format!("update names unknown secret {name}"))
            })?;
            if !spec.user_defined {
                return Err(CoreError::Invalid(format!(
                    "secret {name} is not user-supplied"
                )));
            }
            replaced.push((name.clone(), value.materialize(&name, spec)?));
        }

        for (name, pkg_update) in update.packages {
            if let Some(pkg) = self.packages.get_mut(&name) {
                pkg.security_version = Some(pkg_update.security_version);
            }
        }
        Ok(replaced)
    }

    /// Users whose certificate matches `cert_der`, by name
    pub fn user_by_certificate(&self, cert_der: &[u8]) -> Option<(&String, &User)> {
        self.users.iter().find(|(_, user)| {
            openssl::x509::X509::from_pem(user.certificate.as_bytes())
                .and_then(|c| c.to_der())
                .map(|der| der == cert_der)
                .unwrap_or(false)
        })
    }

    pub fn cert_ttl_hours(&self) -> u64 {
        self.cert_ttl_hours
            .unwrap_or(crate::pki::DEFAULT_MARBLE_TTL_HOURS)
    }

    /// Extra SANs declared for a marble
    pub fn marble_sans(&self, marble: &str) -> &[String] {
        self.tls.get(marble).map(Vec::as_slice).unwrap_or(&[])
    }
}
