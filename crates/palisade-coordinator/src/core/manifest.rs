//! Manifest ingestion, update, and secret access
//!
//! `set_manifest` is accepted only while the Coordinator is waiting for its
//! first manifest; updates afterwards are restricted to security-version
//! raises and user-supplied secret replacements, authorized through the
//! manifest's own roles.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use palisade_core::error::{CoreError, Result};
use palisade_core::manifest::{self, actions, resources, Manifest, ManifestUpdate};
use palisade_core::secrets::{generate_secret, Secret, UserSecret};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

use super::{authenticated_users, authorize, CoordinatorState, Core};
use crate::store::wrapper::{keys, next_serial};
use crate::store::KvRead;

/// `GET /manifest` payload: the canonical hash and the root signature over
/// the raw manifest as accepted
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ManifestInfo {
    pub manifest_hash: String,
    pub manifest_signature: String,
}

impl Core {
    /// Accept the first manifest: parse, check invariants, materialize all
    /// shared secrets, persist, and start accepting marbles.
    ///
    /// Returns the RSA-wrapped recovery shares, one per declared recovery
    /// party (empty when no recovery is configured).
    pub fn set_manifest(&self, raw: &[u8]) -> Result<BTreeMap<String, String>> {
        let mut inner = self.write();
        match inner.state {
            CoordinatorState::Recovery => return Err(CoreError::Recovering),
            CoordinatorState::AcceptingManifest => {}
            _ => {
                return Err(CoreError::FailedPrecondition(
                    "manifest already set".into(),
                ))
            }
        }

        let parsed = Manifest::parse(raw)?;
        let inner = &mut *inner;
        let ca = inner
            .ca
            .as_ref()
            .ok_or_else(|| CoreError::Internal("no CA while accepting manifest".into()))?;

        let mut tx = inner.store.transaction();
        for (name, spec) in &parsed.secrets {
            if spec.shared && !spec.user_defined {
                let serial = next_serial(&mut tx)?;
                let secret = generate_secret(name, spec, ca, serial)?;
                tx.put_json(keys::secret(name), &secret)?;
            }
        }

        let recovery_data: BTreeMap<String, String> = if parsed.recovery_keys.is_empty() {
            BTreeMap::new()
        } else {
            self.sealer
                .generate_recovery_data(&parsed.recovery_keys)
                .map_err(CoreError::from)?
                .into_iter()
                .map(|(party, wrapped)| (party, B64.encode(wrapped)))
                .collect()
        };

        let signature = ca.sign(raw)?;
        tx.put(keys::MANIFEST_RAW, raw.to_vec());
        tx.put_json(keys::MANIFEST_EFFECTIVE, &parsed)?;
        tx.put_json(keys::MANIFEST_GENERATION, &1u64)?;
        tx.put_json(keys::MANIFEST_SIGNATURE, &B64.encode(&signature))?;
        tx.put_json(keys::STATE, &CoordinatorState::AcceptingMarbles)?;
        tx.commit()?;

        info!(
            hash = %manifest::manifest_hash(raw),
            marbles = parsed.marbles.len(),
            recovery_parties = parsed.recovery_keys.len(),
            "manifest accepted"
        );

        inner.state = CoordinatorState::AcceptingMarbles;
        inner.manifest = Some(parsed);
        inner.raw_manifest = raw.to_vec();
        inner.generation = 1;
        Ok(recovery_data)
    }

    /// Apply a signed update delta. Every touched resource must be covered
    /// by a role held by enough authenticated signers; the manifest
    /// generation is bumped and future activations see the new floors.
    pub fn update_manifest(&self, raw_delta: &[u8], caller_certs: &[Vec<u8>]) -> Result<u64> {
        let mut inner = self.write();
        match inner.state {
            CoordinatorState::Recovery => return Err(CoreError::Recovering),
            CoordinatorState::AcceptingMarbles => {}
            _ => {
                return Err(CoreError::FailedPrecondition(
                    "no manifest to update".into(),
                ))
            }
        }
        let inner = &mut *inner;
        let current = inner
            .manifest
            .as_ref()
            .ok_or_else(|| CoreError::Internal("manifest missing in running state".into()))?;

        let signers = authenticated_users(current, caller_certs);
        if signers.is_empty() {
            return Err(CoreError::PermissionDenied("authorization"));
        }

        let delta: ManifestUpdate = serde_json::from_slice(raw_delta)
            .map_err(|e| CoreError::Invalid(format!("update delta does not parse: {e}")))?;
        for package in delta.packages.keys() {
            authorize(
                current,
                &signers,
                resources::PACKAGES,
                package,
                actions::UPDATE_SECURITY_VERSION,
            )?;
        }
        for secret in delta.secrets.keys() {
            authorize(
                current,
                &signers,
                resources::SECRETS,
                secret,
                actions::WRITE_SECRET,
            )?;
        }

        let mut updated = current.clone();
        let replaced = updated.apply_update(delta)?;
        let generation = inner.generation + 1;

        let mut tx = inner.store.transaction();
        tx.put_json(keys::MANIFEST_EFFECTIVE, &updated)?;
        tx.put_json(keys::MANIFEST_GENERATION, &generation)?;
        for (name, secret) in &replaced {
            tx.put_json(keys::secret(name), secret)?;
        }
        tx.commit()?;

        info!(
            generation,
            signers = signers.len(),
            replaced_secrets = replaced.len(),
            "manifest updated"
        );

        inner.manifest = Some(updated);
        inner.generation = generation;
        Ok(generation)
    }

    /// Canonical hash and signature of the active manifest
    pub fn manifest_info(&self) -> Result<ManifestInfo> {
        let inner = self.read();
        if inner.raw_manifest.is_empty() {
            return Err(CoreError::FailedPrecondition("no manifest set".into()));
        }
        let signature: String = inner
            .store
            .get_json(keys::MANIFEST_SIGNATURE)?
            .ok_or_else(|| CoreError::Internal("manifest signature missing".into()))?;
        Ok(ManifestInfo {
            manifest_hash: manifest::manifest_hash(&inner.raw_manifest),
            manifest_signature: signature,
        })
    }

    /// Read a materialized shared secret; gated by `ReadSecret`.
    pub fn read_secret(&self, name: &str, caller_certs: &[Vec<u8>]) -> Result<Secret> {
        let inner = self.read();
        match inner.state {
            CoordinatorState::Recovery => return Err(CoreError::Recovering),
            CoordinatorState::AcceptingMarbles => {}
            _ => return Err(CoreError::FailedPrecondition("no manifest set".into())),
        }
        let manifest = inner
            .manifest
            .as_ref()
            .ok_or_else(|| CoreError::Internal("manifest missing in running state".into()))?;
        if !manifest.secrets.contains_key(name) {
            return Err(CoreError::Invalid(format!("unknown secret {name}")));
        }
        let signers = authenticated_users(manifest, caller_certs);
        authorize(manifest, &signers, resources::SECRETS, name, actions::READ_SECRET)?;

        inner
            .store
            .get_json(&keys::secret(name))?
            .ok_or_else(|| CoreError::FailedPrecondition(format!("secret {name} not yet set")))
    }

    /// Replace a user-supplied secret; gated by `WriteSecret`.
    pub fn write_secret(
        &self,
        name: &str,
        value: UserSecret,
        caller_certs: &[Vec<u8>],
    ) -> Result<()> {
        let mut inner = self.write();
        match inner.state {
            CoordinatorState::Recovery => return Err(CoreError::Recovering),
            CoordinatorState::AcceptingMarbles => {}
            _ => return Err(CoreError::FailedPrecondition("no manifest set".into())),
        }
        let inner = &mut *inner;
        let manifest = inner
            .manifest
            .as_ref()
            .ok_or_else(|| CoreError::Internal("manifest missing in running state".into()))?;
        let spec = manifest
            .secrets
            .get(name)
            .ok_or_else(|| CoreError::Invalid(format!("unknown secret {name}")))?;
        if !spec.user_defined {
            return Err(CoreError::Invalid(format!(
                "secret {name} is not user-supplied"
            )));
        }
        let signers = authenticated_users(manifest, caller_certs);
        authorize(manifest, &signers, resources::SECRETS, name, actions::WRITE_SECRET)?;

        let secret = value.materialize(name, spec)?;
        let mut tx = inner.store.transaction();
        tx.put_json(keys::secret(name), &secret)?;
        tx.commit()?;
        info!(secret = name, "user secret replaced");
        Ok(())
    }
}
