//! Recovery
//!
//! When the sealed state cannot be opened at startup the Coordinator sits
//! in recovery mode and accepts decrypted key shares from the designated
//! recovery parties, one per call. Once every share has arrived the data
//! key is reassembled, the state is unsealed, the intermediate CA is
//! rotated, and everything is resealed under the current sealing key.

use palisade_core::error::{CoreError, Result};
use palisade_core::recovery::RecoveryAssembly;
use tracing::{info, warn};

use super::{CoordinatorState, Core};
use crate::store::wrapper::{keys, next_serial};
use crate::store::{LoadOutcome, SealedStore};

impl Core {
    /// Submit one recovery share. Returns the number of shares still
    /// missing; `0` means the Coordinator is running again.
    pub fn recover(&self, share: &[u8]) -> Result<usize> {
        let mut inner = self.write();
        if inner.state != CoordinatorState::Recovery {
            return Err(CoreError::FailedPrecondition(
                "coordinator is not in recovery mode".into(),
            ));
        }
        let assembly = inner
            .recovery
            .as_mut()
            .ok_or_else(|| CoreError::Internal("recovery state without assembly".into()))?;
        let remaining = assembly
            .add_share(share)
            .map_err(|e| CoreError::Invalid(e.to_string()))?;
        if remaining > 0 {
            info!(remaining, "recovery share accepted");
            return Ok(remaining);
        }
        let secret = assembly
            .secret()
            .ok_or_else(|| CoreError::Internal("recovery assembly incomplete".into()))?;

        // Try to open the sealed state with the reassembled data key.
        self.sealer.set_data_key(&secret);
        let seal_dir = inner.seal_dir.clone();
        match SealedStore::open(self.sealer.clone(), &seal_dir)? {
            LoadOutcome::Restored(store) => {
                let mut restored = Core::restore(store, &seal_dir)?;

                // Rotate the intermediate CA under the unchanged root and
                // reseal; the commit flushes the image under the current
                // sealing key.
                let ca = restored
                    .ca
                    .as_mut()
                    .ok_or_else(|| CoreError::Internal("restored state without CA".into()))?;
                let mut tx = restored.store.transaction();
                let serial = next_serial(&mut tx)?;
                ca.rotate_intermediate(serial)?;
                tx.put_json(keys::PKI, &ca.to_state()?)?;
                tx.put_json(keys::STATE, &CoordinatorState::AcceptingMarbles)?;
                tx.commit()?;

                restored.state = CoordinatorState::AcceptingMarbles;
                restored.recovery = None;
                *inner = restored;
                info!("recovery complete, accepting marbles again");
                Ok(0)
            }
            LoadOutcome::NeedsRecovery { parties } => {
                // wrong share material; allow the parties another round
                warn!("recovered key does not open the sealed state");
                inner.recovery = Some(RecoveryAssembly::new(parties));
                Err(CoreError::PermissionDenied("recovery"))
            }
            LoadOutcome::Fresh(_) => Err(CoreError::Internal(
                "sealed state disappeared during recovery".into(),
            )),
        }
    }
}
