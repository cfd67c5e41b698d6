//! Marble activation
//!
//! The activation protocol: a marble proves its enclave identity with a
//! quote and a CSR; the Coordinator checks the quote against the manifest,
//! issues a leaf certificate, fills the marble's parameters with secrets,
//! and records the activation, all in one store transaction.
//!
//! Error mapping is deliberate: everything up to and including attestation
//! is `PermissionDenied` with only a category string, quota exhaustion is
//! `ResourceExhausted`, and failures while materializing the response are
//! `Internal` with full rollback.

use chrono::Utc;
use palisade_core::error::{CoreError, Result};
use palisade_core::manifest::{Manifest, Parameters};
use palisade_core::pki::csr_public_key_digest;
use palisade_core::quote::InfrastructureProperties;
use palisade_core::secrets::{generate_secret, render_parameters, Secret};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use super::{CoordinatorState, Core};
use crate::store::wrapper::{activation_count, keys, next_serial, ActivationRecord};
use crate::store::KvRead;

/// Default deadline for an activation request
pub const DEFAULT_ACTIVATION_TIMEOUT: Duration = Duration::from_secs(30);

/// One marble activation attempt
pub struct ActivationRequest {
    /// Platform quote over the hash of the CSR public key
    pub quote: Vec<u8>,
    /// DER-encoded certificate signing request
    pub csr_der: Vec<u8>,
    /// Marble-chosen activation UUID; retries must reuse it
    pub uuid: Uuid,
    /// Marble name, echoed from the quote's payload claim
    pub marble_type: String,
    /// Absolute deadline; `None` applies the 30s default
    pub deadline: Option<Instant>,
}

/// What an activated marble receives
#[derive(Debug, Clone)]
pub struct ActivationResponse {
    /// PEM leaf certificate, signed by the intermediate CA
    pub certificate: String,
    /// Templated files, env, and argv
    pub parameters: Parameters,
    /// PEM root certificate of the mesh
    pub root_cert: String,
}

impl Core {
    /// Activate a marble; see the module docs for the protocol.
    pub fn activate(&self, req: ActivationRequest) -> Result<ActivationResponse> {
        let deadline = req
            .deadline
            .unwrap_or_else(|| Instant::now() + DEFAULT_ACTIVATION_TIMEOUT);
        check_deadline(deadline)?;

        // Validation phase under the read lock; quote validation may call
        // out to platform services and must not block writers.
        let csr_digest = {
            let inner = self.read();
            match inner.state {
                CoordinatorState::Recovery => return Err(CoreError::Recovering),
                CoordinatorState::AcceptingMarbles => {}
                _ => return Err(CoreError::PermissionDenied("state")),
            }
            let manifest = inner
                .manifest
                .as_ref()
                .ok_or(CoreError::PermissionDenied("state"))?;
            let marble = manifest
                .marbles
                .get(&req.marble_type)
                .ok_or(CoreError::PermissionDenied("marble"))?;
            let package = manifest
                .packages
                .get(&marble.package)
                .ok_or(CoreError::PermissionDenied("package"))?;

            let message = csr_public_key_digest(&req.csr_der)
                .map_err(|_| CoreError::PermissionDenied("csr"))?;

            let attested = if manifest.infrastructures.is_empty() {
                self.validator
                    .validate(&req.quote, &message, package, &InfrastructureProperties::default())
                    .is_ok()
            } else {
                // any declared infrastructure may admit the quote
                manifest.infrastructures.values().any(|infra| {
                    self.validator
                        .validate(&req.quote, &message, package, infra)
                        .is_ok()
                })
            };
            if !attested {
                warn!(marble = %req.marble_type, "quote validation failed");
                return Err(CoreError::PermissionDenied("attestation"));
            }
            hex::encode(&message)
        };

        // Commit phase under the write lock.
        let mut inner = self.write();
        let inner = &mut *inner;
        if inner.state != CoordinatorState::AcceptingMarbles {
            return Err(CoreError::PermissionDenied("state"));
        }
        let manifest = inner
            .manifest
            .as_ref()
            .ok_or_else(|| CoreError::Internal("manifest missing in running state".into()))?;
        let marble = manifest
            .marbles
            .get(&req.marble_type)
            .ok_or(CoreError::PermissionDenied("marble"))?;
        let ca = inner
            .ca
            .as_ref()
            .ok_or_else(|| CoreError::Internal("no CA in running state".into()))?;
        let uuid = req.uuid.to_string();

        // Idempotent retry: the same (marble, UUID, CSR key) gets the
        // previously issued certificate back; a UUID reuse with a different
        // key is rejected before any state is touched.
        if let Some(record) = inner
            .store
            .get_json::<ActivationRecord>(&keys::activation_cert(&uuid))?
        {
            if record.marble != req.marble_type || record.csr_pubkey_digest != csr_digest {
                warn!(marble = %req.marble_type, uuid = %uuid, "activation UUID reuse rejected");
                return Err(CoreError::PermissionDenied("uuid"));
            }
            let secrets = collect_secrets(&inner.store, manifest, &uuid)?;
            let parameters = render_parameters(&marble.parameters, &secrets)?;
            info!(marble = %req.marble_type, uuid = %uuid, "activation replayed");
            return Ok(ActivationResponse {
                certificate: record.cert_pem,
                parameters,
                root_cert: ca.root_cert_pem()?,
            });
        }

        let count = activation_count(&inner.store, &req.marble_type)?;
        if marble.max_activations > 0 && count >= marble.max_activations {
            return Err(CoreError::ResourceExhausted(format!(
                "marble {} reached its activation limit of {}",
                req.marble_type, marble.max_activations
            )));
        }

        let mut tx = inner.store.transaction();

        // Per-marble secrets materialize on the first activation of this
        // UUID and are cached for retries.
        for (name, spec) in &manifest.secrets {
            if !spec.shared && !spec.user_defined {
                let key = keys::marble_secret(name, &uuid);
                if tx.get(&key).is_none() {
                    let serial = next_serial(&mut tx)?;
                    let secret = generate_secret(name, spec, ca, serial)?;
                    tx.put_json(key, &secret)?;
                }
            }
        }

        let secrets = collect_secrets(&tx, manifest, &uuid)?;
        let parameters = render_parameters(&marble.parameters, &secrets)?;

        let serial = next_serial(&mut tx)?;
        let cert = ca
            .issue_marble_cert(
                &req.marble_type,
                &req.csr_der,
                &uuid,
                manifest.marble_sans(&req.marble_type),
                manifest.cert_ttl_hours(),
                serial,
            )
            .map_err(|e| match e {
                // the CSR already parsed in the validation phase
                CoreError::Invalid(msg) => CoreError::Internal(msg),
                other => other,
            })?;
        let cert_pem = String::from_utf8(cert.to_pem()?)
            .map_err(|e| CoreError::Internal(e.to_string()))?;

        check_deadline(deadline)?;

        tx.put_json(keys::activations(&req.marble_type), &(count + 1))?;
        tx.put_json(
            keys::activation_cert(&uuid),
            &ActivationRecord {
                marble: req.marble_type.clone(),
                cert_pem: cert_pem.clone(),
                csr_pubkey_digest: csr_digest,
                activated_at: Utc::now(),
            },
        )?;
        tx.commit()?;

        info!(
            marble = %req.marble_type,
            uuid = %uuid,
            activations = count + 1,
            serial,
            "marble activated"
        );

        Ok(ActivationResponse {
            certificate: cert_pem,
            parameters,
            root_cert: ca.root_cert_pem()?,
        })
    }
}

fn check_deadline(deadline: Instant) -> Result<()> {
    if Instant::now() >= deadline {
        return Err(CoreError::DeadlineExceeded);
    }
    Ok(())
}

/// All secrets visible to one activation: shared values plus the per-marble
/// values cached under this UUID. User-supplied secrets not yet provided
/// are simply absent; templates referencing them fail the activation.
fn collect_secrets<R: KvRead>(
    reader: &R,
    manifest: &Manifest,
    uuid: &str,
) -> Result<BTreeMap<String, Secret>> {
    let mut secrets = BTreeMap::new();
    for (name, spec) in &manifest.secrets {
        let key = if spec.shared {
            keys::secret(name)
        } else {
            keys::marble_secret(name, uuid)
        };
        if let Some(secret) = reader.get_json::<Secret>(&key)? {
            secrets.insert(name.clone(), secret);
        }
    }
    Ok(secrets)
}
