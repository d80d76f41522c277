//! DSSE envelopes: signing, serialization, and multi-track verification.
//!
//! Signatures are computed over the pre-authentication encoding (PAE) of
//! the payload type and payload, never over the payload alone.
//!
//! Verification runs two independent tracks per signature:
//!
//! - **Certificate chain**: an embedded certificate is chained to the
//!   caller's roots, either at the current time or at a time attested by
//!   a timestamp token.
//! - **Bare key**: every caller-supplied verifier is tried against PAE.
//!
//! Each success on either track contributes one [`PassedVerifier`].

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use x509_cert::Certificate;

use crate::crypto::{Signer, Verifier};
use crate::error::DsseError;
use crate::timestamp::{TimestampVerifier, Timestamper};
use crate::x509::{X509Verifier, parse_certificate};

/// Protocol tag prefixed to every PAE.
const PAE_PREFIX: &str = "DSSEv1";

/// Type tag for RFC 3161 style timestamp tokens.
pub const TIMESTAMP_TYPE_TSP: &str = "tsp";

/// Build the pre-authentication encoding:
/// `"DSSEv1" SP len(type) SP type SP len(payload) SP payload`.
#[must_use]
pub fn pae(payload_type: &str, payload: &[u8]) -> Vec<u8> {
    let header = format!(
        "{PAE_PREFIX} {} {payload_type} {} ",
        payload_type.len(),
        payload.len()
    );
    let mut out = Vec::with_capacity(header.len() + payload.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(payload);
    out
}

mod b64 {
    use super::{BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        BASE64.decode(text).map_err(serde::de::Error::custom)
    }
}

mod b64_list {
    use super::{BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(items: &[Vec<u8>], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(items.iter().map(|item| BASE64.encode(item)))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Vec<u8>>, D::Error> {
        Vec::<String>::deserialize(d)?
            .into_iter()
            .map(|text| BASE64.decode(text).map_err(serde::de::Error::custom))
            .collect()
    }
}

/// A signed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Raw payload bytes (base64 on the wire).
    #[serde(with = "b64")]
    pub payload: Vec<u8>,
    /// Type tag of the payload.
    #[serde(rename = "payloadType")]
    pub payload_type: String,
    /// Signatures over the PAE.
    #[serde(default)]
    pub signatures: Vec<Signature>,
}

/// One signature over an envelope's PAE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Identifier of the signing key.
    #[serde(default)]
    pub keyid: String,
    /// Raw signature bytes.
    #[serde(with = "b64")]
    pub sig: Vec<u8>,
    /// DER-encoded signing certificate, if any.
    #[serde(default, with = "b64", skip_serializing_if = "Vec::is_empty")]
    pub certificate: Vec<u8>,
    /// DER-encoded intermediates.
    #[serde(default, with = "b64_list", skip_serializing_if = "Vec::is_empty")]
    pub intermediates: Vec<Vec<u8>>,
    /// Timestamp tokens over `sig`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub timestamps: Vec<SignatureTimestamp>,
}

/// A timestamp token attached to a signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureTimestamp {
    /// Token kind, currently always [`TIMESTAMP_TYPE_TSP`].
    #[serde(rename = "type")]
    pub kind: String,
    /// Opaque token bytes.
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

/// Signing inputs.
#[derive(Default)]
pub struct SignOptions {
    /// At least one signer.
    pub signers: Vec<Arc<dyn Signer>>,
    /// Optional timestampers; each stamps every signature.
    pub timestampers: Vec<Arc<dyn Timestamper>>,
}

/// Verification inputs.
#[derive(Debug, Clone)]
pub struct VerificationOptions {
    /// Trusted roots for embedded certificates.
    pub roots: Vec<Certificate>,
    /// Extra intermediates available for chain building.
    pub intermediates: Vec<Certificate>,
    /// Bare verifiers tried against every signature.
    pub verifiers: Vec<Arc<dyn Verifier>>,
    /// Minimum number of passed verifiers.
    pub threshold: usize,
    /// Timestamp verifiers; when non-empty, chains are checked at
    /// attested times instead of now.
    pub timestamp_verifiers: Vec<Arc<dyn TimestampVerifier>>,
}

impl Default for VerificationOptions {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            intermediates: Vec::new(),
            verifiers: Vec::new(),
            threshold: 1,
            timestamp_verifiers: Vec::new(),
        }
    }
}

/// How a verifier validated a signature.
#[derive(Debug, Clone)]
pub enum VerificationPath {
    /// A caller-supplied verifier checked the signature directly.
    BareKey,
    /// The embedded certificate chained to a trusted root.
    ///
    /// Holds the timestamp verifiers whose attested time the chain was
    /// validated at; empty when validated at the current time.
    CertChain {
        /// Timestamp verifiers that passed for this signature.
        timestamp_verifiers: Vec<Arc<dyn TimestampVerifier>>,
    },
}

/// A verifier that validated at least one signature.
#[derive(Debug, Clone)]
pub struct PassedVerifier {
    /// The verifier itself.
    pub verifier: Arc<dyn Verifier>,
    /// Which track it passed on.
    pub path: VerificationPath,
}

impl PassedVerifier {
    /// Timestamp verifiers that attested the chain check, if any.
    #[must_use]
    pub fn timestamp_verifiers(&self) -> &[Arc<dyn TimestampVerifier>] {
        match &self.path {
            VerificationPath::BareKey => &[],
            VerificationPath::CertChain {
                timestamp_verifiers,
            } => timestamp_verifiers,
        }
    }
}

impl Envelope {
    /// Sign `payload` with every signer in `opts`.
    pub async fn sign(
        payload_type: &str,
        payload: Vec<u8>,
        opts: &SignOptions,
    ) -> Result<Self, DsseError> {
        if opts.signers.is_empty() {
            return Err(DsseError::NoSigners);
        }

        let pae = pae(payload_type, &payload);
        let mut signatures = Vec::with_capacity(opts.signers.len());

        for signer in &opts.signers {
            let sig = signer.sign(&pae)?;

            let mut timestamps = Vec::with_capacity(opts.timestampers.len());
            for timestamper in &opts.timestampers {
                timestamps.push(SignatureTimestamp {
                    kind: TIMESTAMP_TYPE_TSP.to_owned(),
                    data: timestamper.timestamp(&sig).await?,
                });
            }

            let chain = signer.certificate_chain().unwrap_or_default();
            tracing::debug!(
                key_id = %signer.key_id(),
                has_certificate = !chain.leaf.is_empty(),
                timestamps = timestamps.len(),
                "signed envelope"
            );

            signatures.push(Signature {
                keyid: signer.key_id(),
                sig,
                certificate: chain.leaf,
                intermediates: chain.intermediates,
                timestamps,
            });
        }

        Ok(Self {
            payload,
            payload_type: payload_type.to_owned(),
            signatures,
        })
    }

    /// PAE bytes for this envelope.
    #[must_use]
    pub fn pae(&self) -> Vec<u8> {
        pae(&self.payload_type, &self.payload)
    }

    /// Verify signatures and return every verifier that passed.
    ///
    /// # Errors
    ///
    /// - [`DsseError::InvalidOption`] when `threshold` is zero
    /// - [`DsseError::NoSignatures`] for an unsigned envelope
    /// - [`DsseError::NoMatchingSigs`] when nothing validated
    /// - [`DsseError::ThresholdNotMet`] with the partial result otherwise
    pub async fn verify(
        &self,
        opts: &VerificationOptions,
    ) -> Result<Vec<PassedVerifier>, DsseError> {
        if opts.threshold == 0 {
            return Err(DsseError::InvalidOption(
                "threshold must be at least 1".to_owned(),
            ));
        }
        if self.signatures.is_empty() {
            return Err(DsseError::NoSignatures);
        }

        let pae = self.pae();
        let mut passed = Vec::new();

        for sig in &self.signatures {
            if !sig.certificate.is_empty() {
                if let Some(pv) = verify_cert_chain(sig, &pae, opts).await {
                    passed.push(pv);
                }
            }

            for verifier in &opts.verifiers {
                match verifier.verify(&pae, &sig.sig) {
                    Ok(()) => passed.push(PassedVerifier {
                        verifier: Arc::clone(verifier),
                        path: VerificationPath::BareKey,
                    }),
                    Err(e) => tracing::trace!(
                        key_id = %verifier.key_id(),
                        error = %e,
                        "verifier did not match signature"
                    ),
                }
            }
        }

        if passed.is_empty() {
            return Err(DsseError::NoMatchingSigs);
        }
        if passed.len() < opts.threshold {
            return Err(DsseError::ThresholdNotMet {
                threshold: opts.threshold,
                passed,
            });
        }
        Ok(passed)
    }
}

/// Certificate-chain track for one signature.
///
/// Parse failures skip the signature on this track rather than failing
/// the whole envelope. Without trusted roots the track never passes.
async fn verify_cert_chain(
    sig: &Signature,
    pae: &[u8],
    opts: &VerificationOptions,
) -> Option<PassedVerifier> {
    if opts.roots.is_empty() {
        tracing::debug!(keyid = %sig.keyid, "no trusted roots; skipping certificate track");
        return None;
    }

    let mut intermediates = Vec::with_capacity(sig.intermediates.len() + opts.intermediates.len());
    for der in &sig.intermediates {
        match parse_certificate(der) {
            Ok(cert) => intermediates.push(cert),
            Err(e) => {
                tracing::warn!(keyid = %sig.keyid, error = %e, "skipping signature with unparseable intermediate");
                return None;
            }
        }
    }
    intermediates.extend_from_slice(&opts.intermediates);

    let verifier = match X509Verifier::new(&sig.certificate, intermediates, opts.roots.clone()) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(keyid = %sig.keyid, error = %e, "skipping signature with unparseable certificate");
            return None;
        }
    };

    if opts.timestamp_verifiers.is_empty() {
        return match verifier.verify(pae, &sig.sig) {
            Ok(()) => Some(PassedVerifier {
                verifier: Arc::new(verifier),
                path: VerificationPath::CertChain {
                    timestamp_verifiers: Vec::new(),
                },
            }),
            Err(e) => {
                tracing::debug!(keyid = %sig.keyid, error = %e, "certificate chain rejected");
                None
            }
        };
    }

    let mut passed_tsvs = Vec::new();
    let mut attested = None;
    // One entry per authority, however many of its tokens pass.
    for tsv in &opts.timestamp_verifiers {
        for ts in &sig.timestamps {
            let time = match tsv.verify(&ts.data, &sig.sig).await {
                Ok(time) => time,
                Err(e) => {
                    tracing::debug!(error = %e, "timestamp token rejected");
                    continue;
                }
            };
            let at_time = verifier.clone().with_trusted_time(time);
            match at_time.verify(pae, &sig.sig) {
                Ok(()) => {
                    passed_tsvs.push(Arc::clone(tsv));
                    attested.get_or_insert(at_time);
                    break;
                }
                Err(e) => {
                    tracing::debug!(%time, error = %e, "certificate chain rejected at attested time");
                }
            }
        }
    }

    attested.map(|verifier| PassedVerifier {
        verifier: Arc::new(verifier),
        path: VerificationPath::CertChain {
            timestamp_verifiers: passed_tsvs,
        },
    })
}
