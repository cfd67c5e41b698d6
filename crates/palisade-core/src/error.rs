//! Error taxonomy surfaced to clients and marbles

use thiserror::Error;

/// Result type alias using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced by Coordinator operations.
///
/// `PermissionDenied` deliberately carries only a coarse category string,
/// never which individual check failed: attestation rejections must be
/// indistinguishable from authorization rejections on the wire.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Attestation, authorization, or state-machine rejection
    #[error("permission denied: {0}")]
    PermissionDenied(&'static str),

    /// Activation quota reached
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Operation not legal in the current state
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Malformed input (manifest, update delta, secret value)
    #[error("invalid input: {0}")]
    Invalid(String),

    /// Sealer, storage, or key generation failure
    #[error("internal error: {0}")]
    Internal(String),

    /// The Coordinator is awaiting recovery; mutations are rejected
    #[error("coordinator is in recovery mode")]
    Recovering,

    /// The request deadline expired before commit
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl From<openssl::error::ErrorStack> for CoreError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        CoreError::Internal(format!("crypto failure: {err}"))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Invalid(err.to_string())
    }
}

impl From<crate::seal::SealError> for CoreError {
    fn from(err: crate::seal::SealError) -> Self {
        CoreError::Internal(format!("sealer: {err}"))
    }
}
