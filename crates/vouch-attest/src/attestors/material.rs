//! Material attestor: hashes the working directory before the step runs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use vouch_dsse::DigestSet;

use super::hash_tree;
use crate::attestor::{Attestor, Materialer, RunType};
use crate::context::AttestationContext;
use crate::error::AttestationError;

/// Registry name.
pub const NAME: &str = "material";
/// Predicate type URI.
pub const TYPE_URI: &str = "https://vouch.dev/attestations/material/v0.1";

/// Input files keyed by relative path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaterialAttestor {
    /// Path to digests.
    #[serde(default)]
    pub materials: BTreeMap<String, DigestSet>,
}

impl Attestor for MaterialAttestor {
    fn name(&self) -> &str {
        NAME
    }

    fn type_uri(&self) -> &str {
        TYPE_URI
    }

    fn run_type(&self) -> RunType {
        RunType::Material
    }

    fn attest(&mut self, ctx: &AttestationContext) -> Result<(), AttestationError> {
        self.materials = hash_tree(ctx.working_dir(), ctx.hashes())?;
        tracing::info!(count = self.materials.len(), "recorded materials");
        Ok(())
    }

    fn as_materialer(&self) -> Option<&dyn Materialer> {
        Some(self)
    }
}

impl Materialer for MaterialAttestor {
    fn materials(&self) -> BTreeMap<String, DigestSet> {
        self.materials.clone()
    }
}
