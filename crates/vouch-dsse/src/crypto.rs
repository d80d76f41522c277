//! Signer and verifier capabilities.
//!
//! Uses `aws-lc-rs` as the cryptographic provider. Local signers hold
//! ECDSA P-256 or Ed25519 keys; verifiers are built from any
//! `SubjectPublicKeyInfo` and detect the key algorithm from its OIDs.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use aws_lc_rs::rand::SystemRandom;
use aws_lc_rs::signature::{
    self, ECDSA_P256_SHA256_ASN1_SIGNING, EcdsaKeyPair, Ed25519KeyPair, KeyPair,
    VerificationAlgorithm,
};
use der::Decode;
use der::asn1::ObjectIdentifier;
use x509_cert::spki::SubjectPublicKeyInfoOwned;

use crate::digest::sha256_bytes;
use crate::error::DsseError;
use crate::pem::{der_to_pem, encode_ed25519_spki, encode_p256_spki, pem_or_der, pem_to_der};
use crate::x509::X509Verifier;

const OID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const OID_CURVE_P256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.3.1.7");
const OID_CURVE_P384: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.34");
const OID_ED25519: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.101.112");
const OID_RSA_ENCRYPTION: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");

/// A leaf certificate and its intermediates, DER-encoded.
#[derive(Debug, Clone, Default)]
pub struct CertificateChain {
    /// The signing certificate.
    pub leaf: Vec<u8>,
    /// Intermediates between the leaf and a root, leaf-side first.
    pub intermediates: Vec<Vec<u8>>,
}

/// Something that can produce signatures.
pub trait Signer: Send + Sync {
    /// Stable identifier of the signing key.
    fn key_id(&self) -> String;

    /// Sign `data`.
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, DsseError>;

    /// The verifier matching this signer.
    fn verifier(&self) -> Result<Arc<dyn Verifier>, DsseError>;

    /// Certificate chain to embed next to signatures, if any.
    fn certificate_chain(&self) -> Option<CertificateChain> {
        None
    }
}

/// Something that can check signatures.
pub trait Verifier: Send + Sync + fmt::Debug {
    /// Stable identifier of the verification key.
    fn key_id(&self) -> String;

    /// Check `signature` over `data`.
    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), DsseError>;

    /// Downcast to an X.509 verifier.
    fn as_x509(&self) -> Option<&X509Verifier> {
        None
    }
}

/// Key ID used throughout: SHA-256 of the PEM-encoded SPKI.
#[must_use]
pub fn key_id_for_spki(spki_der: &[u8]) -> String {
    sha256_bytes(der_to_pem(spki_der, "PUBLIC KEY").as_bytes())
}

// ── Signers ──────────────────────────────────────────────────────────

/// Local ECDSA P-256 signer backed by `aws-lc-rs`.
///
/// Keys are stored as PKCS#8 DER wrapped in PEM. Newly generated key
/// files are created with mode `0o600`.
pub struct EcdsaSigner {
    key_pair: EcdsaKeyPair,
    rng: SystemRandom,
    key_id: String,
}

impl EcdsaSigner {
    /// Generate a fresh in-memory key.
    pub fn generate() -> Result<Self, DsseError> {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &rng)
            .map_err(|e| DsseError::KeyError(format!("failed to generate key: {e}")))?;
        Self::from_pkcs8_der(pkcs8.as_ref())
    }

    /// Load a key from PKCS#8 DER bytes.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, DsseError> {
        let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, der)
            .map_err(|e| DsseError::KeyError(format!("failed to parse PKCS#8 key: {e}")))?;
        let key_id = key_id_for_spki(&encode_p256_spki(key_pair.public_key().as_ref()));
        Ok(Self {
            key_pair,
            rng: SystemRandom::new(),
            key_id,
        })
    }

    /// Load a key from a PKCS#8 PEM string.
    pub fn from_pkcs8_pem(pem: &str) -> Result<Self, DsseError> {
        let der = pem_to_der(pem)
            .ok_or_else(|| DsseError::KeyError("invalid PEM format".to_owned()))?;
        Self::from_pkcs8_der(&der)
    }

    /// Load an existing key from `key_path`, or generate a new one if
    /// the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`DsseError::KeyError`] if:
    /// - The key file exists but cannot be parsed as PKCS#8
    /// - The key file cannot be created or written
    pub fn load_or_generate(key_path: &Path) -> Result<Self, DsseError> {
        if key_path.exists() {
            let pem = std::fs::read_to_string(key_path)
                .map_err(|e| DsseError::KeyError(format!("failed to read key file: {e}")))?;
            let signer = Self::from_pkcs8_pem(&pem)?;
            tracing::info!(path = %key_path.display(), key_id = %signer.key_id, "loaded existing signing key");
            return Ok(signer);
        }

        let rng = SystemRandom::new();
        let pkcs8_doc = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &rng)
            .map_err(|e| DsseError::KeyError(format!("failed to generate key: {e}")))?;

        if let Some(parent) = key_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DsseError::KeyError(format!(
                    "failed to create key directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let pem = der_to_pem(pkcs8_doc.as_ref(), "PRIVATE KEY");
        std::fs::write(key_path, pem.as_bytes())
            .map_err(|e| DsseError::KeyError(format!("failed to write key file: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(key_path, perms).map_err(|e| {
                DsseError::KeyError(format!("failed to set key file permissions: {e}"))
            })?;
        }

        let signer = Self::from_pkcs8_der(pkcs8_doc.as_ref())?;
        tracing::info!(path = %key_path.display(), key_id = %signer.key_id, "generated new signing key");
        Ok(signer)
    }

    /// The public key as PEM-encoded SPKI.
    #[must_use]
    pub fn public_key_pem(&self) -> String {
        der_to_pem(
            &encode_p256_spki(self.key_pair.public_key().as_ref()),
            "PUBLIC KEY",
        )
    }
}

impl Signer for EcdsaSigner {
    fn key_id(&self) -> String {
        self.key_id.clone()
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, DsseError> {
        let sig = self
            .key_pair
            .sign(&self.rng, data)
            .map_err(|e| DsseError::KeyError(format!("ECDSA sign failed: {e}")))?;
        Ok(sig.as_ref().to_vec())
    }

    fn verifier(&self) -> Result<Arc<dyn Verifier>, DsseError> {
        let spki = encode_p256_spki(self.key_pair.public_key().as_ref());
        Ok(Arc::new(PublicKeyVerifier::from_spki_der(&spki)?))
    }
}

/// Local Ed25519 signer.
pub struct Ed25519Signer {
    key_pair: Ed25519KeyPair,
    key_id: String,
}

impl Ed25519Signer {
    /// Generate a fresh in-memory key.
    pub fn generate() -> Result<Self, DsseError> {
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&SystemRandom::new())
            .map_err(|e| DsseError::KeyError(format!("failed to generate key: {e}")))?;
        Self::from_pkcs8_der(pkcs8.as_ref())
    }

    /// Load a key from PKCS#8 DER bytes.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, DsseError> {
        let key_pair = Ed25519KeyPair::from_pkcs8(der)
            .map_err(|e| DsseError::KeyError(format!("failed to parse Ed25519 key: {e}")))?;
        let key_id = key_id_for_spki(&encode_ed25519_spki(key_pair.public_key().as_ref()));
        Ok(Self { key_pair, key_id })
    }
}

impl Signer for Ed25519Signer {
    fn key_id(&self) -> String {
        self.key_id.clone()
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, DsseError> {
        Ok(self.key_pair.sign(data).as_ref().to_vec())
    }

    fn verifier(&self) -> Result<Arc<dyn Verifier>, DsseError> {
        let spki = encode_ed25519_spki(self.key_pair.public_key().as_ref());
        Ok(Arc::new(PublicKeyVerifier::from_spki_der(&spki)?))
    }
}

// ── Verifiers ────────────────────────────────────────────────────────

/// Key algorithms recognised in a `SubjectPublicKeyInfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// ECDSA over P-256 with SHA-256.
    EcdsaP256,
    /// ECDSA over P-384 with SHA-384.
    EcdsaP384,
    /// Ed25519.
    Ed25519,
    /// RSA PKCS#1 v1.5 with SHA-256.
    Rsa,
}

impl KeyKind {
    fn algorithm(self) -> &'static dyn VerificationAlgorithm {
        match self {
            Self::EcdsaP256 => &signature::ECDSA_P256_SHA256_ASN1,
            Self::EcdsaP384 => &signature::ECDSA_P384_SHA384_ASN1,
            Self::Ed25519 => &signature::ED25519,
            Self::Rsa => &signature::RSA_PKCS1_2048_8192_SHA256,
        }
    }
}

/// Raw key material extracted from an SPKI.
#[derive(Clone)]
pub(crate) struct SpkiKey {
    pub(crate) kind: KeyKind,
    pub(crate) raw: Vec<u8>,
}

impl SpkiKey {
    pub(crate) fn from_spki(spki: &SubjectPublicKeyInfoOwned) -> Result<Self, DsseError> {
        let raw = spki.subject_public_key.raw_bytes().to_vec();
        let kind = if spki.algorithm.oid == OID_EC_PUBLIC_KEY {
            let curve = spki
                .algorithm
                .parameters
                .as_ref()
                .and_then(|p| p.decode_as::<ObjectIdentifier>().ok())
                .ok_or_else(|| DsseError::KeyError("EC key without named curve".to_owned()))?;
            if curve == OID_CURVE_P256 {
                KeyKind::EcdsaP256
            } else if curve == OID_CURVE_P384 {
                KeyKind::EcdsaP384
            } else {
                return Err(DsseError::KeyError(format!("unsupported EC curve {curve}")));
            }
        } else if spki.algorithm.oid == OID_ED25519 {
            KeyKind::Ed25519
        } else if spki.algorithm.oid == OID_RSA_ENCRYPTION {
            KeyKind::Rsa
        } else {
            return Err(DsseError::KeyError(format!(
                "unsupported key algorithm {}",
                spki.algorithm.oid
            )));
        };
        Ok(Self { kind, raw })
    }

    pub(crate) fn verify_with(
        &self,
        algorithm: &'static dyn VerificationAlgorithm,
        data: &[u8],
        sig: &[u8],
    ) -> Result<(), DsseError> {
        signature::UnparsedPublicKey::new(algorithm, &self.raw)
            .verify(data, sig)
            .map_err(|e| DsseError::InvalidSignature(format!("{:?} verification failed: {e}", self.kind)))
    }
}

/// Verifier over a bare public key.
#[derive(Clone)]
pub struct PublicKeyVerifier {
    key: SpkiKey,
    key_id: String,
    spki_der: Vec<u8>,
}

impl PublicKeyVerifier {
    /// Build from SPKI DER bytes.
    pub fn from_spki_der(der: &[u8]) -> Result<Self, DsseError> {
        let spki = SubjectPublicKeyInfoOwned::from_der(der)
            .map_err(|e| DsseError::KeyError(format!("failed to parse public key: {e}")))?;
        Ok(Self {
            key: SpkiKey::from_spki(&spki)?,
            key_id: key_id_for_spki(der),
            spki_der: der.to_vec(),
        })
    }

    /// Build from PEM (or raw DER) bytes.
    pub fn from_pem(bytes: &[u8]) -> Result<Self, DsseError> {
        Self::from_spki_der(&pem_or_der(bytes))
    }

    /// Key algorithm of this verifier.
    #[must_use]
    pub const fn kind(&self) -> KeyKind {
        self.key.kind
    }

    /// The public key as PEM-encoded SPKI.
    #[must_use]
    pub fn public_key_pem(&self) -> String {
        der_to_pem(&self.spki_der, "PUBLIC KEY")
    }
}

impl fmt::Debug for PublicKeyVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKeyVerifier")
            .field("kind", &self.key.kind)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl Verifier for PublicKeyVerifier {
    fn key_id(&self) -> String {
        self.key_id.clone()
    }

    fn verify(&self, data: &[u8], sig: &[u8]) -> Result<(), DsseError> {
        if sig.is_empty() {
            return Err(DsseError::InvalidSignature("empty signature".to_owned()));
        }
        self.key.verify_with(self.key.kind.algorithm(), data, sig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_key_in_tempdir() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let key_path = tmp.path().join("keys/local.pem");

        let _signer = EcdsaSigner::load_or_generate(&key_path).expect("key gen should succeed");
        assert!(key_path.exists(), "key file should be created");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let meta = std::fs::metadata(&key_path).expect("metadata");
            assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        }
    }

    #[test]
    fn load_existing_key() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let key_path = tmp.path().join("local.pem");

        let signer1 = EcdsaSigner::load_or_generate(&key_path).expect("gen");
        let signer2 = EcdsaSigner::load_or_generate(&key_path).expect("load");

        assert_eq!(signer1.public_key_pem(), signer2.public_key_pem());
        assert_eq!(signer1.key_id(), signer2.key_id());
    }

    #[test]
    fn ecdsa_sign_then_verify() {
        let signer = EcdsaSigner::generate().expect("gen");
        let sig = signer.sign(b"hello world").expect("sign");
        let verifier = signer.verifier().expect("verifier");

        verifier.verify(b"hello world", &sig).expect("should verify");
        assert_eq!(verifier.key_id(), signer.key_id());
        assert!(verifier.verify(b"tampered", &sig).is_err());
    }

    #[test]
    fn ed25519_sign_then_verify() {
        let signer = Ed25519Signer::generate().expect("gen");
        let sig = signer.sign(b"payload").expect("sign");
        let verifier = signer.verifier().expect("verifier");

        verifier.verify(b"payload", &sig).expect("should verify");
        assert_eq!(verifier.key_id(), signer.key_id());
    }

    #[test]
    fn verifier_from_pem_detects_algorithm() {
        let signer = EcdsaSigner::generate().expect("gen");
        let verifier =
            PublicKeyVerifier::from_pem(signer.public_key_pem().as_bytes()).expect("parse");
        assert_eq!(verifier.kind(), KeyKind::EcdsaP256);
        assert_eq!(verifier.key_id(), signer.key_id());
    }

    #[test]
    fn wrong_key_fails() {
        let signer = EcdsaSigner::generate().expect("gen");
        let other = EcdsaSigner::generate().expect("gen");
        let sig = signer.sign(b"payload").expect("sign");
        let result = other.verifier().expect("verifier").verify(b"payload", &sig);
        assert!(result.is_err());
    }

    #[test]
    fn empty_signature_rejected_early() {
        let signer = EcdsaSigner::generate().expect("gen");
        let err = signer
            .verifier()
            .expect("verifier")
            .verify(b"payload", &[])
            .unwrap_err();
        assert!(err.to_string().contains("empty signature"), "got: {err}");
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Tampered payloads always fail verification.
            #[test]
            fn tampered_payload_always_fails(
                payload in prop::collection::vec(any::<u8>(), 1..512),
                flip_idx in any::<prop::sample::Index>(),
            ) {
                let signer = EcdsaSigner::generate().unwrap();
                let sig = signer.sign(&payload).unwrap();
                let mut tampered = payload;
                let idx = flip_idx.index(tampered.len());
                tampered[idx] ^= 0xFF;
                prop_assert!(signer.verifier().unwrap().verify(&tampered, &sig).is_err());
            }
        }
    }
}
