//! in-toto v1 attestation statements.
//!
//! See: <https://github.com/in-toto/attestation/blob/main/spec/v1/statement.md>

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use vouch_dsse::DigestSet;

/// The canonical statement type URI.
pub const STATEMENT_TYPE: &str = "https://in-toto.io/Statement/v1";

/// Predicate type of a signed [`Collection`](crate::collection::Collection).
pub const COLLECTION_PREDICATE_TYPE: &str = "https://vouch.dev/attestation-collection/v0.1";

/// DSSE payload type for statements.
pub const PAYLOAD_TYPE: &str = "application/vnd.in-toto+json";

/// An in-toto v1 attestation statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    /// Always [`STATEMENT_TYPE`].
    #[serde(rename = "_type")]
    pub statement_type: String,
    /// What the statement is about.
    #[serde(default)]
    pub subject: Vec<Subject>,
    /// Schema of `predicate`.
    #[serde(rename = "predicateType")]
    pub predicate_type: String,
    /// The predicate body.
    #[serde(default)]
    pub predicate: serde_json::Value,
}

/// A subject of a statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    /// Subject name (`file:<path>`, `commithash:<sha>`, ...).
    pub name: String,
    /// Content digests.
    pub digest: DigestSet,
}

impl Statement {
    /// Build a statement from named subjects.
    #[must_use]
    pub fn new(
        subjects: BTreeMap<String, DigestSet>,
        predicate_type: &str,
        predicate: serde_json::Value,
    ) -> Self {
        Self {
            statement_type: STATEMENT_TYPE.to_owned(),
            subject: subjects
                .into_iter()
                .map(|(name, digest)| Subject { name, digest })
                .collect(),
            predicate_type: predicate_type.to_owned(),
            predicate,
        }
    }

    /// Every digest value of every subject.
    pub fn subject_digest_values(&self) -> impl Iterator<Item = &str> {
        self.subject.iter().flat_map(|s| s.digest.values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statement_wire_shape() {
        let subjects = BTreeMap::from([("file:app".to_owned(), DigestSet::sha256("abc"))]);
        let statement = Statement::new(
            subjects,
            COLLECTION_PREDICATE_TYPE,
            serde_json::json!({"name": "build"}),
        );

        let json = serde_json::to_value(&statement).unwrap();
        assert_eq!(json["_type"], STATEMENT_TYPE);
        assert_eq!(json["predicateType"], COLLECTION_PREDICATE_TYPE);
        assert_eq!(json["subject"][0]["name"], "file:app");
        assert_eq!(json["subject"][0]["digest"]["sha256"], "abc");

        let values: Vec<_> = statement.subject_digest_values().collect();
        assert_eq!(values, vec!["abc"]);
    }
}
