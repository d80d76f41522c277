//! Error types for the attestation subsystem.

use vouch_dsse::DsseError;

/// Errors from attestor orchestration and collection handling.
#[derive(Debug, thiserror::Error)]
pub enum AttestationError {
    /// An attestor returned an error and aborted the run.
    #[error("attestor `{name}` failed: {reason}")]
    AttestorFailed {
        /// Name of the failing attestor.
        name: String,
        /// Its error message.
        reason: String,
    },

    /// No attestor is registered under this name or type.
    #[error("unknown attestor `{0}`")]
    UnknownAttestor(String),

    /// An attestor name or type was registered twice.
    #[error("attestor `{0}` is already registered")]
    DuplicateAttestor(String),

    /// An attestor option was unknown or had the wrong shape.
    #[error("invalid option: {0}")]
    InvalidOption(String),

    /// An executed command exited unsuccessfully.
    #[error("command failed: {0}")]
    CommandFailed(String),

    /// Failed to capture git state.
    #[error("git state capture failed: {0}")]
    GitError(String),

    /// Signing inputs were missing or unusable.
    #[error("key error: {0}")]
    KeyError(String),

    /// Envelope signing failed.
    #[error(transparent)]
    Dsse(#[from] DsseError),

    /// I/O error during attestation operations.
    #[error("attestation I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to serialize or deserialize attestation state.
    #[error("failed to serialize attestation: {0}")]
    SerializeError(#[from] serde_json::Error),
}
