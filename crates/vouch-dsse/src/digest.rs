//! Multi-algorithm digest sets.
//!
//! A [`DigestSet`] records several digests of the same content, keyed by
//! [`DigestValue`] (hash algorithm plus whether the value is a gitoid).
//! Two sets describe the same content when they agree on at least one
//! common key; see [`DigestSet::matches`].

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::path::Path;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::DsseError;

/// A hash algorithm usable in a [`DigestSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HashAlgorithm {
    /// SHA-256.
    Sha256,
    /// SHA-1 (git object ids).
    Sha1,
}

impl HashAlgorithm {
    const fn name(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha1 => "sha1",
        }
    }

    fn hex_digest(self, data: &[u8]) -> String {
        match self {
            Self::Sha256 => hex::encode(Sha256::digest(data)),
            Self::Sha1 => hex::encode(Sha1::digest(data)),
        }
    }
}

/// Key of a [`DigestSet`] entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DigestValue {
    /// Underlying hash algorithm.
    pub algorithm: HashAlgorithm,
    /// Whether the value is a gitoid URI rather than a bare hex digest.
    pub gitoid: bool,
}

impl DigestValue {
    /// Plain SHA-256.
    pub const SHA256: Self = Self::new(HashAlgorithm::Sha256, false);
    /// Plain SHA-1.
    pub const SHA1: Self = Self::new(HashAlgorithm::Sha1, false);
    /// Gitoid over SHA-256.
    pub const GITOID_SHA256: Self = Self::new(HashAlgorithm::Sha256, true);
    /// Gitoid over SHA-1.
    pub const GITOID_SHA1: Self = Self::new(HashAlgorithm::Sha1, true);

    /// Construct a digest key.
    #[must_use]
    pub const fn new(algorithm: HashAlgorithm, gitoid: bool) -> Self {
        Self { algorithm, gitoid }
    }

    /// The JSON key for this digest (`sha256`, `gitoid:sha1`, ...).
    #[must_use]
    pub const fn name(self) -> &'static str {
        match (self.algorithm, self.gitoid) {
            (HashAlgorithm::Sha256, false) => "sha256",
            (HashAlgorithm::Sha1, false) => "sha1",
            (HashAlgorithm::Sha256, true) => "gitoid:sha256",
            (HashAlgorithm::Sha1, true) => "gitoid:sha1",
        }
    }

    /// Parse a JSON key back into a digest key.
    pub fn from_name(name: &str) -> Result<Self, DsseError> {
        match name {
            "sha256" => Ok(Self::SHA256),
            "sha1" => Ok(Self::SHA1),
            "gitoid:sha256" => Ok(Self::GITOID_SHA256),
            "gitoid:sha1" => Ok(Self::GITOID_SHA1),
            other => Err(DsseError::UnknownDigest(other.to_owned())),
        }
    }

    /// Compute this digest over `data`.
    #[must_use]
    pub fn compute(self, data: &[u8]) -> String {
        if self.gitoid {
            gitoid(self.algorithm, data)
        } else {
            self.algorithm.hex_digest(data)
        }
    }
}

impl fmt::Display for DigestValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Compute a gitoid URI (`gitoid:blob:<alg>:<hex>`) for blob content.
#[must_use]
pub fn gitoid(algorithm: HashAlgorithm, data: &[u8]) -> String {
    let mut framed = format!("blob {}\0", data.len()).into_bytes();
    framed.extend_from_slice(data);
    format!(
        "gitoid:blob:{}:{}",
        algorithm.name(),
        algorithm.hex_digest(&framed)
    )
}

/// Compute the SHA-256 hex digest of a byte slice.
#[must_use]
pub fn sha256_bytes(data: &[u8]) -> String {
    HashAlgorithm::Sha256.hex_digest(data)
}

/// A set of digests of one piece of content.
///
/// `PartialEq` is structural. Use [`DigestSet::matches`] when comparing
/// evidence: it implements the "at least one common digest agrees" law.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestSet(BTreeMap<DigestValue, String>);

impl DigestSet {
    /// An empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// A set holding a single SHA-256 value.
    #[must_use]
    pub fn sha256(hex: impl Into<String>) -> Self {
        let mut set = Self::new();
        set.insert(DigestValue::SHA256, hex);
        set
    }

    /// Insert or replace one digest.
    pub fn insert(&mut self, key: DigestValue, value: impl Into<String>) {
        self.0.insert(key, value.into());
    }

    /// Look up one digest.
    #[must_use]
    pub fn get(&self, key: DigestValue) -> Option<&str> {
        self.0.get(&key).map(String::as_str)
    }

    /// Iterate over entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (DigestValue, &str)> {
        self.0.iter().map(|(k, v)| (*k, v.as_str()))
    }

    /// Iterate over the digest values only.
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.0.values().map(String::as_str)
    }

    /// Number of digests held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set holds no digests.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True iff both sets share at least one key with equal values.
    ///
    /// Sets computed with disjoint algorithms never match, even when
    /// they describe the same file.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        self.0
            .iter()
            .any(|(key, value)| other.0.get(key).is_some_and(|v| v == value))
    }

    /// Digest `data` with every requested algorithm.
    #[must_use]
    pub fn calculate_from_bytes(data: &[u8], hashes: &[DigestValue]) -> Self {
        Self(
            hashes
                .iter()
                .map(|key| (*key, key.compute(data)))
                .collect(),
        )
    }

    /// Read `reader` to the end and digest its content.
    pub fn calculate_from_reader<R: Read>(
        mut reader: R,
        hashes: &[DigestValue],
    ) -> Result<Self, DsseError> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Ok(Self::calculate_from_bytes(&data, hashes))
    }

    /// Digest the content of a file.
    pub fn calculate_from_file(path: &Path, hashes: &[DigestValue]) -> Result<Self, DsseError> {
        let file = std::fs::File::open(path)?;
        Self::calculate_from_reader(file, hashes)
    }

    /// Convert to the JSON-keyed representation.
    #[must_use]
    pub fn to_name_map(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .map(|(k, v)| (k.name().to_owned(), v.clone()))
            .collect()
    }

    /// Build from the JSON-keyed representation.
    pub fn from_name_map(map: &BTreeMap<String, String>) -> Result<Self, DsseError> {
        map.iter()
            .map(|(name, value)| Ok((DigestValue::from_name(name)?, value.clone())))
            .collect::<Result<BTreeMap<_, _>, DsseError>>()
            .map(Self)
    }
}

impl FromIterator<(DigestValue, String)> for DigestSet {
    fn from_iter<T: IntoIterator<Item = (DigestValue, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Serialize for DigestSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_name_map().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DigestSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = BTreeMap::<String, String>::deserialize(deserializer)?;
        Self::from_name_map(&map).map_err(D::Error::custom)
    }
}
