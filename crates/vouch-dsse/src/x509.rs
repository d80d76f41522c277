//! X.509 signers and verifiers.
//!
//! An [`X509Verifier`] checks a signature with the leaf certificate's key
//! and, when roots are configured, that the leaf chains to one of them
//! through the supplied intermediates at a trusted point in time.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use aws_lc_rs::signature::{self, VerificationAlgorithm};
use chrono::{DateTime, Utc};
use der::asn1::{ObjectIdentifier, Utf8StringRef};
use der::{Decode, Encode};
use x509_cert::Certificate;
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::{BasicConstraints, SubjectAltName};
use x509_cert::name::Name;

use crate::crypto::{CertificateChain, KeyKind, Signer, SpkiKey, Verifier, key_id_for_spki};
use crate::error::DsseError;
use crate::pem::{pem_blocks, pem_or_der};

/// Longest chain (leaf excluded) walked before giving up.
const MAX_CHAIN_DEPTH: usize = 10;

const OID_COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");
const OID_ORGANIZATION: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.10");
const OID_SUBJECT_ALT_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.17");
const OID_BASIC_CONSTRAINTS: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.19");

const OID_ECDSA_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");
const OID_ECDSA_SHA384: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.3");
const OID_ED25519: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.101.112");
const OID_RSA_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.11");
const OID_RSA_SHA384: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.12");
const OID_RSA_SHA512: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.13");

/// Parse one certificate from PEM or DER bytes.
pub fn parse_certificate(bytes: &[u8]) -> Result<Certificate, DsseError> {
    Certificate::from_der(&pem_or_der(bytes))
        .map_err(|e| DsseError::CertificateError(format!("failed to parse certificate: {e}")))
}

/// Parse every certificate in a PEM bundle, or a single DER certificate.
pub fn parse_certificates(bytes: &[u8]) -> Result<Vec<Certificate>, DsseError> {
    let blocks = std::str::from_utf8(bytes)
        .ok()
        .filter(|text| text.contains("-----BEGIN "))
        .map(pem_blocks);

    match blocks {
        Some(blocks) => blocks
            .iter()
            .map(|der| parse_certificate(der))
            .collect(),
        None => Ok(vec![parse_certificate(bytes)?]),
    }
}

/// DER-encode a parsed certificate.
pub fn certificate_der(cert: &Certificate) -> Result<Vec<u8>, DsseError> {
    cert.to_der()
        .map_err(|e| DsseError::CertificateError(format!("failed to encode certificate: {e}")))
}

fn unix_time(duration: Duration) -> DateTime<Utc> {
    i64::try_from(duration.as_secs())
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn check_validity(cert: &Certificate, at: DateTime<Utc>) -> Result<(), DsseError> {
    let validity = &cert.tbs_certificate.validity;
    let not_before = unix_time(validity.not_before.to_unix_duration());
    let not_after = unix_time(validity.not_after.to_unix_duration());
    if at < not_before || at > not_after {
        return Err(DsseError::ChainError(format!(
            "certificate `{}` not valid at {at} (valid {not_before} to {not_after})",
            cert.tbs_certificate.subject
        )));
    }
    Ok(())
}

fn is_ca(cert: &Certificate) -> bool {
    let Some(ext) = cert
        .tbs_certificate
        .extensions
        .iter()
        .flatten()
        .find(|ext| ext.extn_id == OID_BASIC_CONSTRAINTS)
    else {
        // Legacy v1 roots carry no extensions at all.
        return true;
    };
    BasicConstraints::from_der(ext.extn_value.as_bytes()).is_ok_and(|bc| bc.ca)
}

fn signature_algorithm(
    sig_oid: ObjectIdentifier,
    issuer_kind: KeyKind,
) -> Result<&'static dyn VerificationAlgorithm, DsseError> {
    let alg: &'static dyn VerificationAlgorithm = match (sig_oid, issuer_kind) {
        (oid, KeyKind::EcdsaP256) if oid == OID_ECDSA_SHA256 => &signature::ECDSA_P256_SHA256_ASN1,
        (oid, KeyKind::EcdsaP256) if oid == OID_ECDSA_SHA384 => &signature::ECDSA_P256_SHA384_ASN1,
        (oid, KeyKind::EcdsaP384) if oid == OID_ECDSA_SHA256 => &signature::ECDSA_P384_SHA256_ASN1,
        (oid, KeyKind::EcdsaP384) if oid == OID_ECDSA_SHA384 => &signature::ECDSA_P384_SHA384_ASN1,
        (oid, KeyKind::Ed25519) if oid == OID_ED25519 => &signature::ED25519,
        (oid, KeyKind::Rsa) if oid == OID_RSA_SHA256 => &signature::RSA_PKCS1_2048_8192_SHA256,
        (oid, KeyKind::Rsa) if oid == OID_RSA_SHA384 => &signature::RSA_PKCS1_2048_8192_SHA384,
        (oid, KeyKind::Rsa) if oid == OID_RSA_SHA512 => &signature::RSA_PKCS1_2048_8192_SHA512,
        (oid, kind) => {
            return Err(DsseError::ChainError(format!(
                "unsupported certificate signature algorithm {oid} for {kind:?} issuer"
            )));
        }
    };
    Ok(alg)
}

/// Check that `issuer` signed `cert`.
fn check_issued_by(cert: &Certificate, issuer: &Certificate) -> Result<(), DsseError> {
    if cert.tbs_certificate.issuer != issuer.tbs_certificate.subject {
        return Err(DsseError::ChainError("issuer name mismatch".to_owned()));
    }
    let issuer_key = SpkiKey::from_spki(&issuer.tbs_certificate.subject_public_key_info)?;
    let algorithm = signature_algorithm(cert.signature_algorithm.oid, issuer_key.kind)?;
    let tbs = cert
        .tbs_certificate
        .to_der()
        .map_err(|e| DsseError::CertificateError(format!("failed to encode TBS: {e}")))?;
    let sig = cert.signature.as_bytes().ok_or_else(|| {
        DsseError::CertificateError("certificate signature has unused bits".to_owned())
    })?;
    issuer_key
        .verify_with(algorithm, &tbs, sig)
        .map_err(|e| DsseError::ChainError(format!("certificate signature invalid: {e}")))
}

/// Walk from `cert` to any of `roots`, trying every intermediate whose
/// subject matches the current issuer.
fn chain_to_roots(
    cert: &Certificate,
    intermediates: &[Certificate],
    roots: &[Certificate],
    at: DateTime<Utc>,
    depth: usize,
) -> Result<(), DsseError> {
    if depth > MAX_CHAIN_DEPTH {
        return Err(DsseError::ChainError("certificate chain too long".to_owned()));
    }

    for root in roots {
        if check_issued_by(cert, root).is_ok() && check_validity(root, at).is_ok() {
            return Ok(());
        }
    }

    for candidate in intermediates {
        if candidate == cert || !is_ca(candidate) {
            continue;
        }
        if check_issued_by(cert, candidate).is_err() || check_validity(candidate, at).is_err() {
            continue;
        }
        if chain_to_roots(candidate, intermediates, roots, at, depth + 1).is_ok() {
            return Ok(());
        }
    }

    Err(DsseError::ChainError(format!(
        "no path from `{}` to a trusted root",
        cert.tbs_certificate.subject
    )))
}

fn name_attribute(name: &Name, oid: ObjectIdentifier) -> Vec<String> {
    name.0
        .iter()
        .flat_map(|rdn| rdn.0.iter())
        .filter(|atv| atv.oid == oid)
        .filter_map(|atv| std::str::from_utf8(atv.value.value()).ok())
        .map(str::to_owned)
        .collect()
}

/// Verifier backed by an X.509 leaf certificate.
#[derive(Clone)]
pub struct X509Verifier {
    cert: Certificate,
    cert_der: Vec<u8>,
    key: SpkiKey,
    key_id: String,
    intermediates: Vec<Certificate>,
    roots: Vec<Certificate>,
    trusted_time: Option<DateTime<Utc>>,
}

impl X509Verifier {
    /// Build a verifier for `cert` (PEM or DER).
    ///
    /// [`Verifier::verify`] rejects every signature when `roots` is
    /// empty; use [`X509Verifier::verify_signature`] for a key-only check.
    pub fn new(
        cert: &[u8],
        intermediates: Vec<Certificate>,
        roots: Vec<Certificate>,
    ) -> Result<Self, DsseError> {
        let cert_der = pem_or_der(cert);
        let parsed = Certificate::from_der(&cert_der)
            .map_err(|e| DsseError::CertificateError(format!("failed to parse certificate: {e}")))?;
        let spki = &parsed.tbs_certificate.subject_public_key_info;
        let key = SpkiKey::from_spki(spki)?;
        let spki_der = spki
            .to_der()
            .map_err(|e| DsseError::CertificateError(format!("failed to encode SPKI: {e}")))?;
        Ok(Self {
            key,
            key_id: key_id_for_spki(&spki_der),
            cert: parsed,
            cert_der,
            intermediates,
            roots,
            trusted_time: None,
        })
    }

    /// Validate the chain at `time` instead of the current time.
    #[must_use]
    pub fn with_trusted_time(mut self, time: DateTime<Utc>) -> Self {
        self.trusted_time = Some(time);
        self
    }

    /// The leaf certificate.
    #[must_use]
    pub const fn certificate(&self) -> &Certificate {
        &self.cert
    }

    /// The leaf certificate, DER-encoded.
    #[must_use]
    pub fn certificate_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// Intermediates available for chain building.
    #[must_use]
    pub fn intermediates(&self) -> &[Certificate] {
        &self.intermediates
    }

    /// The time chain validation runs at.
    #[must_use]
    pub fn trusted_time(&self) -> Option<DateTime<Utc>> {
        self.trusted_time
    }

    /// Check `sig` against the leaf public key without chain validation.
    pub fn verify_signature(&self, data: &[u8], sig: &[u8]) -> Result<(), DsseError> {
        let algorithm: &'static dyn VerificationAlgorithm = match self.key.kind {
            KeyKind::EcdsaP256 => &signature::ECDSA_P256_SHA256_ASN1,
            KeyKind::EcdsaP384 => &signature::ECDSA_P384_SHA384_ASN1,
            KeyKind::Ed25519 => &signature::ED25519,
            KeyKind::Rsa => &signature::RSA_PKCS1_2048_8192_SHA256,
        };
        self.key.verify_with(algorithm, data, sig)
    }

    /// Whether the leaf chains to `root` through our intermediates plus
    /// `extra_intermediates`.
    pub fn belongs_to_root(
        &self,
        root: &Certificate,
        extra_intermediates: &[Certificate],
    ) -> Result<(), DsseError> {
        let mut intermediates = self.intermediates.clone();
        intermediates.extend_from_slice(extra_intermediates);
        let at = self.trusted_time.unwrap_or_else(Utc::now);
        check_validity(&self.cert, at)?;
        chain_to_roots(
            &self.cert,
            &intermediates,
            std::slice::from_ref(root),
            at,
            0,
        )
    }

    /// Subject common name, or an empty string.
    #[must_use]
    pub fn common_name(&self) -> String {
        name_attribute(&self.cert.tbs_certificate.subject, OID_COMMON_NAME)
            .into_iter()
            .next()
            .unwrap_or_default()
    }

    /// Subject organization names.
    #[must_use]
    pub fn organizations(&self) -> Vec<String> {
        name_attribute(&self.cert.tbs_certificate.subject, OID_ORGANIZATION)
    }

    fn subject_alt_names(&self) -> Vec<GeneralName> {
        self.extension_value(&OID_SUBJECT_ALT_NAME.to_string())
            .and_then(|raw| SubjectAltName::from_der(&raw).ok())
            .map(|san| san.0)
            .unwrap_or_default()
    }

    /// SAN DNS names.
    #[must_use]
    pub fn dns_names(&self) -> Vec<String> {
        self.subject_alt_names()
            .into_iter()
            .filter_map(|name| match name {
                GeneralName::DnsName(dns) => Some(dns.to_string()),
                _ => None,
            })
            .collect()
    }

    /// SAN email addresses.
    #[must_use]
    pub fn email_addresses(&self) -> Vec<String> {
        self.subject_alt_names()
            .into_iter()
            .filter_map(|name| match name {
                GeneralName::Rfc822Name(email) => Some(email.to_string()),
                _ => None,
            })
            .collect()
    }

    /// SAN URIs.
    #[must_use]
    pub fn uris(&self) -> Vec<String> {
        self.subject_alt_names()
            .into_iter()
            .filter_map(|name| match name {
                GeneralName::UniformResourceIdentifier(uri) => Some(uri.to_string()),
                _ => None,
            })
            .collect()
    }

    /// Raw value of the extension with dotted `oid`, if present.
    #[must_use]
    pub fn extension_value(&self, oid: &str) -> Option<Vec<u8>> {
        let oid = ObjectIdentifier::new(oid).ok()?;
        self.cert
            .tbs_certificate
            .extensions
            .iter()
            .flatten()
            .find(|ext| ext.extn_id == oid)
            .map(|ext| ext.extn_value.as_bytes().to_vec())
    }

    /// Extension value read as a string.
    ///
    /// Newer extensions wrap the value in a DER `UTF8String`; older ones
    /// store raw UTF-8 bytes. Both are accepted.
    #[must_use]
    pub fn extension_string(&self, oid: &str) -> Option<String> {
        let raw = self.extension_value(oid)?;
        if let Ok(s) = Utf8StringRef::from_der(&raw) {
            return Some(s.as_str().to_owned());
        }
        String::from_utf8(raw).ok()
    }
}

impl fmt::Debug for X509Verifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("X509Verifier")
            .field("subject", &self.cert.tbs_certificate.subject.to_string())
            .field("key_id", &self.key_id)
            .field("intermediates", &self.intermediates.len())
            .field("roots", &self.roots.len())
            .field("trusted_time", &self.trusted_time)
            .finish_non_exhaustive()
    }
}

impl Verifier for X509Verifier {
    fn key_id(&self) -> String {
        self.key_id.clone()
    }

    fn verify(&self, data: &[u8], sig: &[u8]) -> Result<(), DsseError> {
        if self.roots.is_empty() {
            return Err(DsseError::ChainError("no trusted roots configured".to_owned()));
        }
        self.verify_signature(data, sig)?;

        let at = self.trusted_time.unwrap_or_else(Utc::now);
        check_validity(&self.cert, at)?;
        chain_to_roots(&self.cert, &self.intermediates, &self.roots, at, 0)
    }

    fn as_x509(&self) -> Option<&X509Verifier> {
        Some(self)
    }
}

/// Signer that pairs a key with its certificate chain.
pub struct X509Signer {
    inner: Arc<dyn Signer>,
    chain: CertificateChain,
}

impl X509Signer {
    /// Wrap `inner`, whose public key must be the one in `leaf`.
    pub fn new(
        inner: Arc<dyn Signer>,
        leaf: &[u8],
        intermediates: Vec<Vec<u8>>,
    ) -> Result<Self, DsseError> {
        let leaf = pem_or_der(leaf);
        let verifier = X509Verifier::new(&leaf, Vec::new(), Vec::new())?;
        if verifier.key_id() != inner.key_id() {
            return Err(DsseError::KeyError(
                "signing key does not match certificate public key".to_owned(),
            ));
        }
        Ok(Self {
            inner,
            chain: CertificateChain {
                leaf,
                intermediates: intermediates.iter().map(|i| pem_or_der(i)).collect(),
            },
        })
    }
}

impl Signer for X509Signer {
    fn key_id(&self) -> String {
        self.inner.key_id()
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, DsseError> {
        self.inner.sign(data)
    }

    /// Key-only verifier for the leaf key; chain trust comes from the
    /// roots handed to envelope verification.
    fn verifier(&self) -> Result<Arc<dyn Verifier>, DsseError> {
        self.inner.verifier()
    }

    fn certificate_chain(&self) -> Option<CertificateChain> {
        Some(self.chain.clone())
    }
}
