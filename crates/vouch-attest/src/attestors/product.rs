//! Product attestor: records files created or changed by the step.
//!
//! Re-hashes the working directory and compares against the materials
//! the context collected earlier. A file is a product when it is new or
//! its digests no longer match.

use std::collections::BTreeMap;

use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use vouch_dsse::DigestSet;

use super::hash_tree;
use crate::attestor::{Attestor, Producer, Product, RunType, Subjecter};
use crate::context::AttestationContext;
use crate::error::AttestationError;
use crate::registry::AttestorOption;

/// Registry name.
pub const NAME: &str = "product";
/// Predicate type URI.
pub const TYPE_URI: &str = "https://vouch.dev/attestations/product/v0.1";

/// Output files keyed by relative path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductAttestor {
    /// Path to product.
    #[serde(default)]
    pub products: BTreeMap<String, Product>,

    #[serde(skip)]
    include_glob: String,
    #[serde(skip)]
    exclude_glob: String,
}

impl Default for ProductAttestor {
    fn default() -> Self {
        Self {
            products: BTreeMap::new(),
            include_glob: "*".to_owned(),
            exclude_glob: String::new(),
        }
    }
}

pub(crate) fn options() -> Vec<AttestorOption> {
    vec![
        AttestorOption::new(
            "include-glob",
            "Only record products whose path matches this glob",
            "*".to_owned(),
            |a: &mut ProductAttestor, v: String| {
                compile(&v)?;
                a.include_glob = v;
                Ok(())
            },
        ),
        AttestorOption::new(
            "exclude-glob",
            "Skip products whose path matches this glob",
            String::new(),
            |a: &mut ProductAttestor, v: String| {
                if !v.is_empty() {
                    compile(&v)?;
                }
                a.exclude_glob = v;
                Ok(())
            },
        ),
    ]
}

fn compile(pattern: &str) -> Result<GlobMatcher, AttestationError> {
    Glob::new(pattern)
        .map(|g| g.compile_matcher())
        .map_err(|e| AttestationError::InvalidOption(format!("bad glob `{pattern}`: {e}")))
}

/// Best-effort MIME type from the file extension.
fn guess_mime_type(path: &str) -> &'static str {
    let ext = path.rsplit_once('.').map_or("", |(_, ext)| ext);
    match ext.to_ascii_lowercase().as_str() {
        "txt" | "md" | "log" => "text/plain",
        "json" => "application/json",
        "html" | "htm" => "text/html",
        "xml" => "application/xml",
        "toml" => "application/toml",
        "yaml" | "yml" => "application/yaml",
        "tar" => "application/x-tar",
        "gz" | "tgz" => "application/gzip",
        "zip" => "application/zip",
        "sh" => "application/x-sh",
        _ => "application/octet-stream",
    }
}

impl ProductAttestor {
    /// Attestor with explicit include and exclude globs.
    pub fn with_globs(include: &str, exclude: &str) -> Result<Self, AttestationError> {
        compile(include)?;
        if !exclude.is_empty() {
            compile(exclude)?;
        }
        Ok(Self {
            include_glob: include.to_owned(),
            exclude_glob: exclude.to_owned(),
            ..Self::default()
        })
    }
}

impl Attestor for ProductAttestor {
    fn name(&self) -> &str {
        NAME
    }

    fn type_uri(&self) -> &str {
        TYPE_URI
    }

    fn run_type(&self) -> RunType {
        RunType::Product
    }

    fn attest(&mut self, ctx: &AttestationContext) -> Result<(), AttestationError> {
        let include = compile(&self.include_glob)?;
        let exclude = if self.exclude_glob.is_empty() {
            None
        } else {
            Some(compile(&self.exclude_glob)?)
        };

        let current = hash_tree(ctx.working_dir(), ctx.hashes())?;
        let materials = ctx.materials();

        self.products = current
            .into_iter()
            .filter(|(path, digest)| {
                materials
                    .get(path)
                    .is_none_or(|before| !before.matches(digest))
            })
            .filter(|(path, _)| include.is_match(path))
            .filter(|(path, _)| !exclude.as_ref().is_some_and(|ex| ex.is_match(path)))
            .map(|(path, digest)| {
                let product = Product {
                    mime_type: guess_mime_type(&path).to_owned(),
                    digest,
                };
                (path, product)
            })
            .collect();

        tracing::info!(count = self.products.len(), "recorded products");
        Ok(())
    }

    fn as_producer(&self) -> Option<&dyn Producer> {
        Some(self)
    }

    fn as_subjecter(&self) -> Option<&dyn Subjecter> {
        Some(self)
    }
}

impl Producer for ProductAttestor {
    fn products(&self) -> BTreeMap<String, Product> {
        self.products.clone()
    }
}

impl Subjecter for ProductAttestor {
    fn subjects(&self) -> BTreeMap<String, DigestSet> {
        self.products
            .iter()
            .map(|(path, product)| (format!("file:{path}"), product.digest.clone()))
            .collect()
    }
}
