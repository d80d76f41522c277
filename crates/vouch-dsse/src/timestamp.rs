//! Timestamping seams.
//!
//! A timestamp token binds signature bytes to a point in time. Chain
//! validation for X.509 signatures then runs at that time instead of
//! "now", so short-lived signing certificates stay verifiable.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::sha256_bytes;
use crate::error::DsseError;

/// Produces timestamp tokens.
#[async_trait]
pub trait Timestamper: Send + Sync {
    /// Timestamp `data` (the raw signature bytes).
    async fn timestamp(&self, data: &[u8]) -> Result<Vec<u8>, DsseError>;
}

/// Checks timestamp tokens.
#[async_trait]
pub trait TimestampVerifier: Send + Sync + fmt::Debug {
    /// Verify `token` covers `signed_data` and return the attested time.
    async fn verify(&self, token: &[u8], signed_data: &[u8]) -> Result<DateTime<Utc>, DsseError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct FakeToken {
    time: DateTime<Utc>,
    sha256: String,
}

/// Timestamper that asserts a fixed time without any authority.
///
/// Tokens are JSON and carry no signature, so they must only be trusted
/// in tests and local experiments.
#[derive(Debug, Clone)]
pub struct FakeTimestamper {
    time: DateTime<Utc>,
}

impl FakeTimestamper {
    /// Stamp every token with `time`.
    #[must_use]
    pub const fn new(time: DateTime<Utc>) -> Self {
        Self { time }
    }
}

impl Default for FakeTimestamper {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

#[async_trait]
impl Timestamper for FakeTimestamper {
    async fn timestamp(&self, data: &[u8]) -> Result<Vec<u8>, DsseError> {
        let token = FakeToken {
            time: self.time,
            sha256: sha256_bytes(data),
        };
        Ok(serde_json::to_vec(&token)?)
    }
}

/// Accepts tokens produced by [`FakeTimestamper`].
#[derive(Debug, Clone, Default)]
pub struct FakeTimestampVerifier;

#[async_trait]
impl TimestampVerifier for FakeTimestampVerifier {
    async fn verify(&self, token: &[u8], signed_data: &[u8]) -> Result<DateTime<Utc>, DsseError> {
        let token: FakeToken = serde_json::from_slice(token)
            .map_err(|e| DsseError::TimestampError(format!("malformed token: {e}")))?;
        if token.sha256 != sha256_bytes(signed_data) {
            return Err(DsseError::TimestampError(
                "token does not cover signature".to_owned(),
            ));
        }
        Ok(token.time)
    }
}
