//! # Palisade Core
//!
//! Leaf subsystems of the Palisade Coordinator, the control plane of a
//! confidential-computing service mesh:
//!
//! - **Quote abstraction**: pluggable issue/validate over opaque attestation
//!   blobs, plus the package and infrastructure compliance predicates that
//!   form the sole attestation policy.
//! - **Sealer**: authenticated encryption of state-at-rest, keyed by an
//!   enclave-bound key with a recovery path.
//! - **PKI**: root CA, intermediate CA, and marble leaf issuance.
//! - **Manifest**: the operator-authored policy bound to a Coordinator at
//!   first launch, with its structural invariants.
//! - **Secrets**: deterministic secret materialization and the sandboxed
//!   templating language used to fill marble parameters.
//! - **Recovery**: key splitting and wrapping for multi-party recovery.
//!
//! The Coordinator state machine itself lives in `palisade-coordinator`;
//! this crate carries only the security-critical leaves it composes.

pub mod error;
pub mod manifest;
pub mod pki;
pub mod quote;
pub mod recovery;
pub mod seal;
pub mod secrets;

pub use error::{CoreError, Result};
pub use manifest::{Manifest, ManifestUpdate, Marble, Parameters, Role, User};
pub use pki::CertificateAuthority;
pub use quote::{InfrastructureProperties, Issuer, MockIssuer, MockValidator, PackageProperties, Validator};
pub use seal::{AesGcmSealer, SealError, Sealer};
pub use secrets::{Secret, SecretSpec, SecretType, UserSecret};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
