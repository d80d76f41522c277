//! Build environment attestor.
//!
//! Records the OS, hostname, user, and environment variables. Variables
//! whose names match a sensitive pattern are dropped unless filtering
//! is disabled.

use std::collections::BTreeMap;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::attestor::{Attestor, RunType};
use crate::context::AttestationContext;
use crate::error::AttestationError;
use crate::metadata::{capture_hostname, capture_username};
use crate::registry::AttestorOption;

/// Registry name.
pub const NAME: &str = "environment";
/// Predicate type URI.
pub const TYPE_URI: &str = "https://vouch.dev/attestations/environment/v0.1";

/// Variable name patterns dropped by default.
pub const DEFAULT_SENSITIVE_PATTERNS: &[&str] = &[
    "*TOKEN*",
    "*SECRET*",
    "*PASSWORD*",
    "*PASSWD*",
    "*API_KEY*",
    "*APIKEY*",
    "*PRIVATE_KEY*",
    "*CREDENTIAL*",
    "AWS_ACCESS_KEY_ID",
    "AWS_SESSION_TOKEN",
];

/// Snapshot of the process environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentAttestor {
    /// Operating system family.
    pub os: String,
    /// Machine hostname, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Current user, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Captured environment variables.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,

    #[serde(skip)]
    filter_sensitive: bool,
    #[serde(skip)]
    sensitive_patterns: Vec<String>,
}

impl Default for EnvironmentAttestor {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_owned(),
            hostname: None,
            username: None,
            variables: BTreeMap::new(),
            filter_sensitive: true,
            sensitive_patterns: DEFAULT_SENSITIVE_PATTERNS
                .iter()
                .map(|p| (*p).to_owned())
                .collect(),
        }
    }
}

pub(crate) fn options() -> Vec<AttestorOption> {
    vec![
        AttestorOption::new(
            "filter-sensitive-vars",
            "Drop environment variables whose names look like secrets",
            true,
            |a: &mut EnvironmentAttestor, v: bool| {
                a.filter_sensitive = v;
                Ok(())
            },
        ),
        AttestorOption::new(
            "sensitive-patterns",
            "Glob patterns naming sensitive environment variables",
            DEFAULT_SENSITIVE_PATTERNS
                .iter()
                .map(|p| (*p).to_owned())
                .collect::<Vec<_>>(),
            |a: &mut EnvironmentAttestor, v: Vec<String>| {
                build_matcher(&v)?;
                a.sensitive_patterns = v;
                Ok(())
            },
        ),
    ]
}

fn build_matcher(patterns: &[String]) -> Result<GlobSet, AttestationError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| AttestationError::InvalidOption(format!("bad pattern `{pattern}`: {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| AttestationError::InvalidOption(format!("bad pattern set: {e}")))
}

impl EnvironmentAttestor {
    /// Record `vars`, applying the sensitive-variable filter.
    pub fn capture_from<I>(&mut self, vars: I) -> Result<(), AttestationError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let matcher = build_matcher(&self.sensitive_patterns)?;
        let filter = self.filter_sensitive;
        let mut dropped = 0usize;
        self.variables = vars
            .into_iter()
            .filter(|(name, _)| {
                let sensitive = filter && matcher.is_match(name);
                dropped += usize::from(sensitive);
                !sensitive
            })
            .collect();
        tracing::debug!(
            captured = self.variables.len(),
            dropped,
            "captured environment variables"
        );
        Ok(())
    }
}

impl Attestor for EnvironmentAttestor {
    fn name(&self) -> &str {
        NAME
    }

    fn type_uri(&self) -> &str {
        TYPE_URI
    }

    fn run_type(&self) -> RunType {
        RunType::PreMaterial
    }

    fn attest(&mut self, _ctx: &AttestationContext) -> Result<(), AttestationError> {
        self.os = std::env::consts::OS.to_owned();
        self.hostname = capture_hostname();
        self.username = capture_username();
        self.capture_from(std::env::vars())
    }
}
