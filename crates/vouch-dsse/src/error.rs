//! Error types for envelope signing and verification.

use crate::envelope::PassedVerifier;

/// Errors from the DSSE and crypto primitives.
#[derive(Debug, thiserror::Error)]
pub enum DsseError {
    /// A caller-supplied option is out of range.
    #[error("invalid option: {0}")]
    InvalidOption(String),

    /// The envelope carries no signatures at all.
    #[error("no signatures in envelope")]
    NoSignatures,

    /// No signature validated through any verification path.
    #[error("no valid signatures for the provided verifiers or roots")]
    NoMatchingSigs,

    /// Some signatures validated, but fewer than required.
    ///
    /// The verifiers that did pass are carried so callers can report
    /// partial results.
    #[error("envelope verified by {} verifiers, threshold is {threshold}", passed.len())]
    ThresholdNotMet {
        /// The required number of passing verifiers.
        threshold: usize,
        /// The verifiers that passed.
        passed: Vec<PassedVerifier>,
    },

    /// Signing was requested without any signer.
    #[error("at least one signer is required")]
    NoSigners,

    /// A single signature failed to validate.
    #[error("signature verification failed: {0}")]
    InvalidSignature(String),

    /// Key load, parse, or generation failed.
    #[error("key error: {0}")]
    KeyError(String),

    /// A certificate could not be parsed or inspected.
    #[error("certificate error: {0}")]
    CertificateError(String),

    /// A certificate did not chain to the requested root.
    #[error("certificate chain error: {0}")]
    ChainError(String),

    /// Creating or verifying a timestamp failed.
    #[error("timestamp error: {0}")]
    TimestampError(String),

    /// A digest set referenced an algorithm we do not know.
    #[error("unknown digest algorithm `{0}`")]
    UnknownDigest(String),

    /// I/O error while hashing or loading key material.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}
