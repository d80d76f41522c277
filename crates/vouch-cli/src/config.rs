//! CLI configuration file.
//!
//! Resolution: an explicit `--config` path must exist; otherwise
//! `<XDG config dir>/vouch/config.toml` is read when present. Command
//! line flags override file values, which override built-in defaults.

use std::path::{Path, PathBuf};

use color_eyre::eyre::{Result, WrapErr, eyre};
use serde::Deserialize;

/// Attestors run when neither flags nor config name any.
pub(crate) const DEFAULT_ATTESTORS: &[&str] = &["environment", "material", "product"];

/// Settings read from `config.toml`.
#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct Config {
    /// PKCS#8 PEM signing key; generated on first use.
    pub(crate) signing_key: Option<PathBuf>,
    /// Digest algorithms (`sha256`, `sha1`, `gitoid:sha256`, ...).
    pub(crate) hashes: Vec<String>,
    /// Attestors for `vouch run`.
    pub(crate) attestors: Vec<String>,
    /// Policy search depth for `vouch verify`.
    pub(crate) search_depth: Option<usize>,
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("dev", "vouch", "vouch")
}

/// Default config path: `~/.config/vouch/config.toml`.
pub(crate) fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Default key path: `~/.config/vouch/keys/local.pem`.
pub(crate) fn default_key_path() -> PathBuf {
    project_dirs().map_or_else(
        || {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_owned());
            PathBuf::from(home).join(".config/vouch/keys/local.pem")
        },
        |dirs| dirs.config_dir().join("keys/local.pem"),
    )
}

impl Config {
    /// Load from `explicit`, or from the default location if it exists.
    pub(crate) fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(eyre!("config file {} not found", path.display()));
            }
            return Self::from_file(path);
        }
        match default_config_path() {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .wrap_err_with(|| format!("invalid config {}", path.display()))?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Signing key: flag, then config, then the default path.
    pub(crate) fn signing_key(&self, flag: Option<PathBuf>) -> PathBuf {
        flag.or_else(|| self.signing_key.clone())
            .unwrap_or_else(default_key_path)
    }

    /// Hash names: flags, then config, then `sha256`.
    pub(crate) fn hashes(&self, flags: &[String]) -> Vec<String> {
        if !flags.is_empty() {
            flags.to_vec()
        } else if !self.hashes.is_empty() {
            self.hashes.clone()
        } else {
            vec!["sha256".to_owned()]
        }
    }

    /// Attestor names: flags, then config, then [`DEFAULT_ATTESTORS`].
    pub(crate) fn attestors(&self, flags: &[String]) -> Vec<String> {
        if !flags.is_empty() {
            flags.to_vec()
        } else if !self.attestors.is_empty() {
            self.attestors.clone()
        } else {
            DEFAULT_ATTESTORS.iter().map(|s| (*s).to_owned()).collect()
        }
    }

    /// Search depth: flag, then config, then the library default.
    pub(crate) fn search_depth(&self, flag: Option<usize>) -> usize {
        flag.or(self.search_depth)
            .unwrap_or(vouch_policy::policy::DEFAULT_SEARCH_DEPTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_field() {
        let config: Config = toml::from_str(
            r#"
signing_key = "/keys/ci.pem"
hashes = ["sha256", "gitoid:sha256"]
attestors = ["git", "material"]
search_depth = 5
"#,
        )
        .unwrap();
        assert_eq!(config.signing_key, Some(PathBuf::from("/keys/ci.pem")));
        assert_eq!(config.hashes.len(), 2);
        assert_eq!(config.search_depth(None), 5);
    }

    #[test]
    fn flags_override_file_values() {
        let config = Config {
            attestors: vec!["git".to_owned()],
            search_depth: Some(5),
            ..Config::default()
        };
        assert_eq!(config.attestors(&[]), vec!["git"]);
        assert_eq!(config.attestors(&["product".to_owned()]), vec!["product"]);
        assert_eq!(config.search_depth(Some(1)), 1);
        assert_eq!(config.hashes(&[]), vec!["sha256"]);
        assert_eq!(
            config.signing_key(Some(PathBuf::from("k.pem"))),
            PathBuf::from("k.pem")
        );
    }

    #[test]
    fn defaults_when_empty() {
        let config = Config::default();
        assert_eq!(config.attestors(&[]).len(), DEFAULT_ATTESTORS.len());
        assert_eq!(
            config.search_depth(None),
            vouch_policy::policy::DEFAULT_SEARCH_DEPTH
        );
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("signing_kee = \"x\"").is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(Config::load(Some(&tmp.path().join("nope.toml"))).is_err());

        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "search_depth = 2\n").unwrap();
        assert_eq!(Config::load(Some(&path)).unwrap().search_depth, Some(2));
    }
}
