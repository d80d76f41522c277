//! Certificate constraints for X.509 functionaries.
//!
//! Each field lists allowed values as globs:
//!
//! - `["*"]` accepts anything, including an absent value
//! - `[""]` (or an empty list) requires the value to be absent
//! - otherwise every observed value must match some allowed glob, and at
//!   least one value must be present

use std::collections::BTreeMap;

use globset::{GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};
use vouch_dsse::X509Verifier;

use crate::error::PolicyError;
use crate::policy::TrustBundle;

/// Accepts any value.
pub const ALLOW_ALL: &str = "*";

fn allow_all() -> Vec<String> {
    vec![ALLOW_ALL.to_owned()]
}

fn allow_all_single() -> String {
    ALLOW_ALL.to_owned()
}

/// Identity constraints on a signing certificate.
///
/// Omitted fields default to `*`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertConstraint {
    /// Subject common name.
    #[serde(default = "allow_all_single", rename = "commonname")]
    pub common_name: String,
    /// SAN DNS names.
    #[serde(default = "allow_all", rename = "dnsnames")]
    pub dns_names: Vec<String>,
    /// SAN email addresses.
    #[serde(default = "allow_all")]
    pub emails: Vec<String>,
    /// Subject organizations.
    #[serde(default = "allow_all")]
    pub organizations: Vec<String>,
    /// SAN URIs.
    #[serde(default = "allow_all")]
    pub uris: Vec<String>,
    /// Names of policy roots the certificate may chain to.
    #[serde(default = "allow_all")]
    pub roots: Vec<String>,
    /// Fulcio extension constraints.
    #[serde(default)]
    pub extensions: FulcioExtensions,
}

impl Default for CertConstraint {
    fn default() -> Self {
        Self {
            common_name: allow_all_single(),
            dns_names: allow_all(),
            emails: allow_all(),
            organizations: allow_all(),
            uris: allow_all(),
            roots: allow_all(),
            extensions: FulcioExtensions::default(),
        }
    }
}

/// Fulcio certificate extensions; an empty field is unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[expect(missing_docs, reason = "field names mirror the Fulcio extension names")]
pub struct FulcioExtensions {
    pub issuer: String,
    pub github_workflow_trigger: String,
    #[serde(rename = "githubWorkflowSHA")]
    pub github_workflow_sha: String,
    pub github_workflow_name: String,
    pub github_workflow_repository: String,
    pub github_workflow_ref: String,
    #[serde(rename = "buildSignerURI")]
    pub build_signer_uri: String,
    pub build_signer_digest: String,
    pub runner_environment: String,
    #[serde(rename = "sourceRepositoryURI")]
    pub source_repository_uri: String,
    pub source_repository_digest: String,
    pub source_repository_ref: String,
    pub source_repository_identifier: String,
    #[serde(rename = "sourceRepositoryOwnerURI")]
    pub source_repository_owner_uri: String,
    pub source_repository_owner_identifier: String,
    #[serde(rename = "buildConfigURI")]
    pub build_config_uri: String,
    pub build_config_digest: String,
    pub build_trigger: String,
    #[serde(rename = "runInvocationURI")]
    pub run_invocation_uri: String,
    pub source_repository_visibility_at_signing: String,
}

const FULCIO_ARC: &str = "1.3.6.1.4.1.57264.1";

impl FulcioExtensions {
    /// Populated constraints as (name, extension arcs, allowed glob).
    ///
    /// Arcs are tried in order; the first present extension is checked.
    fn populated(&self) -> Vec<(&'static str, &'static [u32], &str)> {
        let all: [(&'static str, &'static [u32], &str); 20] = [
            ("issuer", &[8, 1], self.issuer.as_str()),
            ("githubWorkflowTrigger", &[2], self.github_workflow_trigger.as_str()),
            ("githubWorkflowSHA", &[3], self.github_workflow_sha.as_str()),
            ("githubWorkflowName", &[4], self.github_workflow_name.as_str()),
            ("githubWorkflowRepository", &[5], self.github_workflow_repository.as_str()),
            ("githubWorkflowRef", &[6], self.github_workflow_ref.as_str()),
            ("buildSignerURI", &[9], self.build_signer_uri.as_str()),
            ("buildSignerDigest", &[10], self.build_signer_digest.as_str()),
            ("runnerEnvironment", &[11], self.runner_environment.as_str()),
            ("sourceRepositoryURI", &[12], self.source_repository_uri.as_str()),
            ("sourceRepositoryDigest", &[13], self.source_repository_digest.as_str()),
            ("sourceRepositoryRef", &[14], self.source_repository_ref.as_str()),
            ("sourceRepositoryIdentifier", &[15], self.source_repository_identifier.as_str()),
            ("sourceRepositoryOwnerURI", &[16], self.source_repository_owner_uri.as_str()),
            (
                "sourceRepositoryOwnerIdentifier",
                &[17],
                self.source_repository_owner_identifier.as_str(),
            ),
            ("buildConfigURI", &[18], self.build_config_uri.as_str()),
            ("buildConfigDigest", &[19], self.build_config_digest.as_str()),
            ("buildTrigger", &[20], self.build_trigger.as_str()),
            ("runInvocationURI", &[21], self.run_invocation_uri.as_str()),
            (
                "sourceRepositoryVisibilityAtSigning",
                &[22],
                self.source_repository_visibility_at_signing.as_str(),
            ),
        ];
        all.into_iter().filter(|(_, _, v)| !v.is_empty()).collect()
    }

    fn check(&self, cert: &X509Verifier) -> Result<(), PolicyError> {
        for (name, arcs, allowed) in self.populated() {
            let observed = arcs
                .iter()
                .find_map(|arc| cert.extension_string(&format!("{FULCIO_ARC}.{arc}")));
            let Some(observed) = observed else {
                return Err(PolicyError::ConstraintFailed(format!(
                    "certificate has no {name} extension"
                )));
            };
            if !glob(allowed)?.is_match(&observed) {
                return Err(PolicyError::ConstraintFailed(format!(
                    "{name} `{observed}` does not match `{allowed}`"
                )));
            }
        }
        Ok(())
    }
}

fn glob(pattern: &str) -> Result<GlobMatcher, PolicyError> {
    GlobBuilder::new(pattern)
        .literal_separator(false)
        .build()
        .map(|g| g.compile_matcher())
        .map_err(|e| PolicyError::InvalidOption(format!("bad constraint pattern `{pattern}`: {e}")))
}

/// Check `observed` values of `field` against `allowed` globs.
pub fn check_values(field: &str, allowed: &[String], observed: &[String]) -> Result<(), PolicyError> {
    if allowed.iter().any(|a| a == ALLOW_ALL) {
        return Ok(());
    }

    let allowed: Vec<&String> = allowed.iter().filter(|a| !a.is_empty()).collect();
    if allowed.is_empty() {
        return if observed.is_empty() {
            Ok(())
        } else {
            Err(PolicyError::ConstraintFailed(format!(
                "{field} must be absent, found {observed:?}"
            )))
        };
    }
    if observed.is_empty() {
        return Err(PolicyError::ConstraintFailed(format!(
            "{field} is required but the certificate has none"
        )));
    }

    let matchers = allowed
        .iter()
        .map(|a| glob(a))
        .collect::<Result<Vec<_>, _>>()?;
    for value in observed {
        if !matchers.iter().any(|m| m.is_match(value)) {
            return Err(PolicyError::ConstraintFailed(format!(
                "{field} `{value}` is not allowed"
            )));
        }
    }
    Ok(())
}

impl CertConstraint {
    /// Check `cert` against every field and the allowed roots.
    pub fn check(
        &self,
        cert: &X509Verifier,
        bundles: &BTreeMap<String, TrustBundle>,
    ) -> Result<(), PolicyError> {
        let common_name: Vec<String> = Some(cert.common_name())
            .filter(|cn| !cn.is_empty())
            .into_iter()
            .collect();
        check_values(
            "common name",
            std::slice::from_ref(&self.common_name),
            &common_name,
        )?;
        check_values("DNS name", &self.dns_names, &cert.dns_names())?;
        check_values("email", &self.emails, &cert.email_addresses())?;
        check_values("organization", &self.organizations, &cert.organizations())?;
        check_values("URI", &self.uris, &cert.uris())?;
        self.check_roots(cert, bundles)?;
        self.extensions.check(cert)
    }

    fn check_roots(
        &self,
        cert: &X509Verifier,
        bundles: &BTreeMap<String, TrustBundle>,
    ) -> Result<(), PolicyError> {
        let any_root = self.roots.iter().any(|r| r == ALLOW_ALL);
        let candidates = bundles
            .iter()
            .filter(|(name, _)| any_root || self.roots.contains(*name));
        for (name, bundle) in candidates {
            match cert.belongs_to_root(&bundle.root, &bundle.intermediates) {
                Ok(()) => return Ok(()),
                Err(e) => tracing::debug!(root = %name, error = %e, "certificate does not chain to root"),
            }
        }
        Err(PolicyError::ConstraintFailed(format!(
            "certificate `{}` does not chain to an allowed root",
            cert.common_name()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestCa, bundle};

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn glob_prefix_matches_common_name() {
        let observed = strings(&["foo"]);
        check_values("cn", &strings(&["foo*"]), &observed).unwrap();
        assert!(check_values("cn", &strings(&["bar"]), &observed).is_err());
        check_values("cn", &strings(&["*"]), &observed).unwrap();
    }

    #[test]
    fn empty_constraint_requires_absence() {
        check_values("email", &strings(&[""]), &[]).unwrap();
        check_values("email", &[], &[]).unwrap();
        assert!(check_values("email", &strings(&[""]), &strings(&["a@b.c"])).is_err());
    }

    #[test]
    fn wildcard_accepts_absence_but_patterns_do_not() {
        check_values("uri", &strings(&["*"]), &[]).unwrap();
        let err = check_values("uri", &strings(&["https://*"]), &[]).unwrap_err();
        assert!(matches!(err, PolicyError::ConstraintFailed(_)));
    }

    #[test]
    fn every_observed_value_must_be_allowed() {
        let allowed = strings(&["*.example.com"]);
        check_values("dns", &allowed, &strings(&["a.example.com", "b.example.com"])).unwrap();
        assert!(check_values("dns", &allowed, &strings(&["a.example.com", "evil.org"])).is_err());
    }

    #[test]
    fn certificate_checked_against_named_roots() {
        let ca = TestCa::root("Policy Root");
        let other = TestCa::root("Other Root");
        let (_, der) = ca.leaf("builder-1", "Example Org", "build.example.com", &[]);
        let cert = X509Verifier::new(&der, Vec::new(), Vec::new()).unwrap();
        let bundles = BTreeMap::from([
            ("main".to_owned(), bundle(&ca)),
            ("other".to_owned(), bundle(&other)),
        ]);

        let constraint = CertConstraint {
            common_name: "builder-*".to_owned(),
            organizations: strings(&["Example Org"]),
            dns_names: strings(&["*.example.com"]),
            emails: strings(&[""]),
            roots: strings(&["main"]),
            ..CertConstraint::default()
        };
        constraint.check(&cert, &bundles).unwrap();

        let wrong_root = CertConstraint {
            roots: strings(&["other"]),
            ..constraint.clone()
        };
        assert!(wrong_root.check(&cert, &bundles).is_err());

        let wrong_org = CertConstraint {
            organizations: strings(&["Evil Corp"]),
            ..constraint
        };
        assert!(wrong_org.check(&cert, &bundles).is_err());
    }

    #[test]
    fn fulcio_extension_globs() {
        let ca = TestCa::root("Fulcio Root");
        let issuer = (format!("{FULCIO_ARC}.8"), "https://token.actions.example.com");
        let (_, der) = ca.leaf("ci", "CI", "ci.example.com", &[issuer]);
        let cert = X509Verifier::new(&der, Vec::new(), Vec::new()).unwrap();
        let bundles = BTreeMap::from([("fulcio".to_owned(), bundle(&ca))]);

        let mut constraint = CertConstraint::default();
        constraint.extensions.issuer = "https://token.actions.*".to_owned();
        constraint.check(&cert, &bundles).unwrap();

        constraint.extensions.issuer = "https://accounts.example.org".to_owned();
        assert!(constraint.check(&cert, &bundles).is_err());

        constraint.extensions.issuer = String::new();
        constraint.extensions.build_trigger = "push".to_owned();
        assert!(constraint.check(&cert, &bundles).is_err());
    }

    #[test]
    fn omitted_fields_default_to_wildcard() {
        let constraint: CertConstraint =
            serde_json::from_str(r#"{"commonname": "foo*"}"#).unwrap();
        assert_eq!(constraint.common_name, "foo*");
        assert_eq!(constraint.roots, vec!["*"]);
        assert_eq!(constraint.emails, vec!["*"]);
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn wildcard_accepts_any_values(values in proptest::collection::vec("[a-z.@]{0,16}", 0..4)) {
                prop_assert!(check_values("field", &["*".to_owned()], &values).is_ok());
            }

            #[test]
            fn literal_constraint_accepts_itself(value in "[a-z0-9.]{1,16}") {
                prop_assert!(check_values("field", &[value.clone()], &[value]).is_ok());
            }
        }
    }
}
