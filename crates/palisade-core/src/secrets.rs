//! Secret engine
//!
//! Declared secrets are materialized once and cached in the state store:
//! `shared` secrets at manifest acceptance, per-marble secrets on the first
//! activation of that marble. Certificate-typed secrets are signed by the
//! intermediate CA with the validity the manifest declares.
//!
//! Templating is a minimal, sandboxed substitution language: references of
//! the form `{{ .Secrets.<name> }}` or `{{ .Secrets.<name>.<Field> }}` with
//! the fields `Raw` (hex), `Cert`, `Public`, `Private` (PEM). No
//! expressions, no file or environment escapes: the attack surface stays
//! within the manifest schema.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{CoreError, Result};
use crate::manifest::Parameters;
use crate::pki::CertificateAuthority;

/// Secret types a manifest may declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecretType {
    #[serde(rename = "symmetric-key")]
    SymmetricKey,
    #[serde(rename = "cert-ecdsa")]
    CertEcdsa,
    #[serde(rename = "cert-rsa")]
    CertRsa,
    /// Raw user-supplied bytes
    #[serde(rename = "plain")]
    Plain,
}

impl Default for SecretType {
    fn default() -> Self {
        SecretType::SymmetricKey
    }
}

const DEFAULT_CERT_VALIDITY_DAYS: u32 = 365;
const DEFAULT_RSA_BITS: u64 = 2048;

/// A secret as declared in the manifest
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SecretSpec {
    #[serde(rename = "Type")]
    pub kind: SecretType,
    /// Key length in bits
    pub size: u64,
    /// Shared across all marbles, or materialized per marble UUID
    pub shared: bool,
    /// Supplied by an operator instead of generated
    pub user_defined: bool,
    /// Validity of certificate-typed secrets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validity_days: Option<u32>,
}

impl SecretSpec {
    /// Structural invariants; every restricted type carries a bounded size.
    pub fn check(&self, name: &str) -> Result<()> {
        match self.kind {
            SecretType::SymmetricKey => {
                if self.size == 0 || self.size % 8 != 0 || !(16..=8192).contains(&self.size) {
                    return Err(CoreError::Invalid(format!(
                        "secret {name}: symmetric-key size must be a multiple of 8 in 16..=8192 bits"
                    )));
                }
            }
            SecretType::CertRsa => {
                if !matches!(self.size, 0 | 2048 | 3072 | 4096) {
                    return Err(CoreError::Invalid(format!(
                        "secret {name}: cert-rsa size must be one of 2048, 3072, 4096"
                    )));
                }
            }
            SecretType::CertEcdsa => {
                if !matches!(self.size, 0 | 256) {
                    return Err(CoreError::Invalid(format!(
                        "secret {name}: cert-ecdsa only supports P-256"
                    )));
                }
            }
            SecretType::Plain => {
                if !self.user_defined {
                    return Err(CoreError::Invalid(format!(
                        "secret {name}: plain secrets must be user-supplied"
                    )));
                }
            }
        }
        if self.user_defined && !self.shared {
            return Err(CoreError::Invalid(format!(
                "secret {name}: user-supplied secrets must be shared"
            )));
        }
        Ok(())
    }
}

/// A materialized secret value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Secret {
    /// Key or raw bytes; empty for certificate-typed secrets
    #[serde(with = "serde_bytes_base64")]
    pub raw: Vec<u8>,
    /// PEM certificate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert: Option<String>,
    /// PEM SubjectPublicKeyInfo
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public: Option<String>,
    /// PEM PKCS#8 private key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<String>,
}

mod serde_bytes_base64 {
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

/// An operator-supplied secret value, as posted in an update delta or to
/// `POST /secrets/{name}`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct UserSecret {
    /// Base64 key or raw bytes
    pub key: Option<String>,
    pub cert: Option<String>,
    pub private: Option<String>,
}

impl UserSecret {
    /// Validate against the declared spec and convert to a stored secret
    pub fn materialize(self, name: &str, spec: &SecretSpec) -> Result<Secret> {
        match spec.kind {
            SecretType::Plain | SecretType::SymmetricKey => {
                let key = self.key.ok_or_else(|| {
                    CoreError::Invalid(format!("secret {name}: Key value required"))
                })?;
                let raw = B64
                    .decode(&key)
                    .map_err(|_| CoreError::Invalid(format!("secret {name}: Key is not base64")))?;
                if spec.kind == SecretType::SymmetricKey && raw.len() as u64 * 8 != spec.size {
                    return Err(CoreError::Invalid(format!(
                        "secret {name}: expected {} bits, got {}",
                        spec.size,
                        raw.len() * 8
                    )));
                }
                Ok(Secret {
                    raw,
                    ..Default::default()
                })
            }
            SecretType::CertEcdsa | SecretType::CertRsa => {
                let cert_pem = self.cert.ok_or_else(|| {
                    CoreError::Invalid(format!("secret {name}: Cert value required"))
                })?;
                let private_pem = self.private.ok_or_else(|| {
                    CoreError::Invalid(format!("secret {name}: Private value required"))
                })?;
                let cert = openssl::x509::X509::from_pem(cert_pem.as_bytes())
                    .map_err(|_| CoreError::Invalid(format!("secret {name}: bad certificate")))?;
                PKey::private_key_from_pem(private_pem.as_bytes())
                    .map_err(|_| CoreError::Invalid(format!("secret {name}: bad private key")))?;
                let public = String::from_utf8(cert.public_key()?.public_key_to_pem()?)
                    .map_err(|e| CoreError::Internal(e.to_string()))?;
                Ok(Secret {
                    raw: Vec::new(),
                    cert: Some(cert_pem),
                    public: Some(public),
                    private: Some(private_pem),
                })
            }
        }
    }
}

/// Generate a declared (non-user-supplied) secret.
///
/// Certificate-typed secrets consume `serial` from the store's monotone
/// counter; key-typed secrets ignore it.
pub fn generate_secret(
    name: &str,
    spec: &SecretSpec,
    ca: &CertificateAuthority,
    serial: u64,
) -> Result<Secret> {
    if spec.user_defined {
        return Err(CoreError::Internal(format!(
            "secret {name} is user-supplied and cannot be generated"
        )));
    }
    match spec.kind {
        SecretType::SymmetricKey => {
            let mut raw = vec![0u8; (spec.size / 8) as usize];
            rand::rngs::OsRng.fill_bytes(&mut raw);
            Ok(Secret {
                raw,
                ..Default::default()
            })
        }
        SecretType::Plain => Err(CoreError::Internal(format!(
            "secret {name}: plain secrets are always user-supplied"
        ))),
        SecretType::CertEcdsa | SecretType::CertRsa => {
            let key = if spec.kind == SecretType::CertEcdsa {
                crate::pki::generate_p256_key()?
            } else {
                let bits = if spec.size == 0 { DEFAULT_RSA_BITS } else { spec.size };
                PKey::from_rsa(Rsa::generate(bits as u32)?)?
            };
            let validity = spec.validity_days.unwrap_or(DEFAULT_CERT_VALIDITY_DAYS);
            let cert = ca.issue_secret_cert(name, &key, validity, serial)?;
            Ok(Secret {
                raw: Vec::new(),
                cert: Some(String::from_utf8(cert.to_pem()?).map_err(internal)?),
                public: Some(String::from_utf8(key.public_key_to_pem()?).map_err(internal)?),
                private: Some(String::from_utf8(key.private_key_to_pem_pkcs8()?).map_err(internal)?),
            })
        }
    }
}

fn internal(err: impl std::fmt::Display) -> CoreError {
    CoreError::Internal(err.to_string())
}

/// Substitute secret references in a template string.
///
/// Any failure (unknown secret, unknown field, malformed braces) is fatal
/// to the enclosing activation; nothing is partially rendered.
pub fn render_template(template: &str, secrets: &BTreeMap<String, Secret>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| CoreError::Internal("template: unclosed {{".into()))?;
        out.push_str(&eval_reference(after[..end].trim(), secrets)?);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn eval_reference(expr: &str, secrets: &BTreeMap<String, Secret>) -> Result<String> {
    let path = expr.strip_prefix('.').unwrap_or(expr);
    let mut parts = path.split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some("Secrets"), Some(name), field, None) => {
            let secret = secrets.get(name).ok_or_else(|| {
                CoreError::Internal(format!("template references unknown secret {name}"))
            })?;
            let field = field.unwrap_or("Raw");
            let value = match field {
                "Raw" => {
                    if secret.raw.is_empty() {
                        return Err(CoreError::Internal(format!(
                            "secret {name} has no raw value"
                        )));
                    }
                    hex::encode(&secret.raw)
                }
                "Cert" => secret.cert.clone().ok_or_else(|| {
                    CoreError::Internal(format!("secret {name} has no certificate"))
                })?,
                "Public" => secret.public.clone().ok_or_else(|| {
                    CoreError::Internal(format!("secret {name} has no public key"))
                })?,
                "Private" => secret.private.clone().ok_or_else(|| {
                    CoreError::Internal(format!("secret {name} has no private key"))
                })?,
                other => {
                    return Err(CoreError::Internal(format!(
                        "template references unknown field {other}"
                    )))
                }
            };
            Ok(value)
        }
        _ => Err(CoreError::Internal(format!(
            "template reference {expr:?} is not of the form .Secrets.<name>[.<Field>]"
        ))),
    }
}

/// Render all templated marble parameters
pub fn render_parameters(
    params: &Parameters,
    secrets: &BTreeMap<String, Secret>,
) -> Result<Parameters> {
    let mut rendered = Parameters::default();
    for (path, content) in &params.files {
        rendered
            .files
            .insert(path.clone(), render_template(content, secrets)?);
    }
    for (name, value) in &params.env {
        rendered
            .env
            .insert(name.clone(), render_template(value, secrets)?);
    }
    for arg in &params.argv {
        rendered.argv.push(render_template(arg, secrets)?);
    }
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symmetric(bits: u64) -> SecretSpec {
        SecretSpec {
            kind: SecretType::SymmetricKey,
            size: bits,
            shared: true,
            user_defined: false,
            validity_days: None,
        }
    }

    fn test_ca() -> CertificateAuthority {
        CertificateAuthority::generate(&["localhost".into()], 1, 2).unwrap()
    }

    #[test]
    fn symmetric_key_has_declared_size() {
        let ca = test_ca();
        let secret = generate_secret("apikey", &symmetric(256), &ca, 3).unwrap();
        assert_eq!(secret.raw.len(), 32);
        assert!(secret.cert.is_none());
    }

    #[test]
    fn ecdsa_secret_is_signed_by_intermediate() {
        let ca = test_ca();
        let spec = SecretSpec {
            kind: SecretType::CertEcdsa,
            ..Default::default()
        };
        let secret = generate_secret("tls", &spec, &ca, 3).unwrap();

        let cert = openssl::x509::X509::from_pem(secret.cert.as_ref().unwrap().as_bytes()).unwrap();
        let issuer_pub = ca.intermediate_cert().public_key().unwrap();
        assert!(cert.verify(&issuer_pub).unwrap());
        assert!(secret.private.is_some());
        assert!(secret.public.is_some());
    }

    #[test]
    fn template_renders_raw_as_hex() {
        let mut secrets = BTreeMap::new();
        secrets.insert(
            "apikey".to_string(),
            Secret {
                raw: vec![0xAB; 32],
                ..Default::default()
            },
        );
        let out = render_template("key={{ .Secrets.apikey }}", &secrets).unwrap();
        assert_eq!(out, format!("key={}", "ab".repeat(32)));
        assert_eq!(out.len(), "key=".len() + 64);

        let explicit = render_template("{{ .Secrets.apikey.Raw }}", &secrets).unwrap();
        assert_eq!(explicit, "ab".repeat(32));
    }

    #[test]
    fn template_rejects_unknown_secret_and_field() {
        let secrets = BTreeMap::new();
        assert!(render_template("{{ .Secrets.ghost }}", &secrets).is_err());

        let mut secrets = BTreeMap::new();
        secrets.insert("s".to_string(), Secret::default());
        assert!(render_template("{{ .Secrets.s.Hex }}", &secrets).is_err());
        assert!(render_template("{{ .Env.PATH }}", &secrets).is_err());
    }

    #[test]
    fn template_rejects_unclosed_braces() {
        let secrets = BTreeMap::new();
        assert!(render_template("{{ .Secrets.x", &secrets).is_err());
    }

    #[test]
    fn literal_text_passes_through() {
        let secrets = BTreeMap::new();
        assert_eq!(
            render_template("plain text, no references", &secrets).unwrap(),
            "plain text, no references"
        );
    }

    #[test]
    fn user_secret_size_is_enforced() {
        let spec = SecretSpec {
            user_defined: true,
            shared: true,
            ..symmetric(256)
        };
        let wrong = UserSecret {
            key: Some(B64.encode([0u8; 16])),
            ..Default::default()
        };
        assert!(wrong.materialize("apikey", &spec).is_err());

        let right = UserSecret {
            key: Some(B64.encode([0u8; 32])),
            ..Default::default()
        };
        assert_eq!(right.materialize("apikey", &spec).unwrap().raw.len(), 32);
    }

    #[test]
    fn plain_must_be_user_defined() {
        let spec = SecretSpec {
            kind: SecretType::Plain,
            shared: true,
            user_defined: false,
            size: 0,
            validity_days: None,
        };
        assert!(spec.check("blob").is_err());
    }
}
