//! Git state attestor.
//!
//! Records the HEAD commit, its tree and parents, the author, branch,
//! origin remote, and per-path working tree status. The commit hash is
//! both a subject and a back reference, so policy search can hop from a
//! build step to anything else attested about the same commit.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;

use serde::{Deserialize, Serialize};
use vouch_dsse::{DigestSet, DigestValue};

use crate::attestor::{Attestor, BackReffer, RunType, Subjecter};
use crate::context::AttestationContext;
use crate::error::AttestationError;

/// Registry name.
pub const NAME: &str = "git";
/// Predicate type URI.
pub const TYPE_URI: &str = "https://vouch.dev/attestations/git/v0.1";

/// Repository state at attestation time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitAttestor {
    /// HEAD commit id (hex).
    pub commit_hash: String,
    /// Tree id of the HEAD commit.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tree_hash: String,
    /// Parent commit ids; empty for a root commit.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parent_hashes: Vec<String>,
    /// Author name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
    /// Author email.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author_email: String,
    /// First line of the commit message.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub commit_message: String,
    /// Checked-out branch; `None` on a detached HEAD.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Fetch URL of `origin`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    /// Whether any path differs from HEAD.
    #[serde(default)]
    pub dirty: bool,
    /// Two-letter porcelain status code by path, for changed paths only.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub status: BTreeMap<String, String>,
}

fn git_error(what: &str, e: impl std::fmt::Display) -> AttestationError {
    AttestationError::GitError(format!("{what}: {e}"))
}

/// Parse `git status --porcelain=v1` output into path -> status code.
///
/// Renames (`R  old -> new`) are keyed by the new path.
pub(crate) fn parse_porcelain(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter(|line| line.len() > 3)
        .filter_map(|line| {
            let (code, path) = line.split_at(2);
            let path = path.trim_start();
            let path = path.rsplit_once(" -> ").map_or(path, |(_, new)| new);
            (!path.is_empty()).then(|| (path.to_owned(), code.trim().to_owned()))
        })
        .collect()
}

fn working_tree_status(dir: &Path) -> BTreeMap<String, String> {
    match Command::new("git")
        .args(["status", "--porcelain=v1", "--untracked-files=all"])
        .current_dir(dir)
        .output()
    {
        Ok(out) if out.status.success() => parse_porcelain(&String::from_utf8_lossy(&out.stdout)),
        Ok(out) => {
            tracing::warn!(status = %out.status, "git status failed; recording no changes");
            BTreeMap::new()
        }
        Err(e) => {
            tracing::warn!(error = %e, "git not runnable; recording no changes");
            BTreeMap::new()
        }
    }
}

impl GitAttestor {
    /// Read repository state for `dir` (or its enclosing repository).
    ///
    /// Object data comes from `gix`; working tree status shells out to
    /// `git`, which the `basic` gix feature set does not cover.
    pub fn capture(dir: &Path) -> Result<Self, AttestationError> {
        let repo = gix::discover(dir).map_err(|e| git_error("not a git repository", e))?;
        let head = repo
            .head_commit()
            .map_err(|e| git_error("cannot resolve HEAD", e))?;

        let tree_hash = head
            .tree_id()
            .map_err(|e| git_error("cannot read tree", e))?
            .to_string();
        let parent_hashes = head.parent_ids().map(|id| id.to_string()).collect();
        let (author, author_email) = head
            .author()
            .map(|sig| (sig.name.to_string(), sig.email.to_string()))
            .map_err(|e| git_error("cannot read author", e))?;
        let commit_message = head
            .message()
            .map(|msg| msg.title.to_string().trim().to_owned())
            .unwrap_or_default();

        let branch = repo
            .head_name()
            .map_err(|e| git_error("cannot read HEAD ref", e))?
            .map(|name| name.shorten().to_string());
        let remote_url = repo
            .find_remote("origin")
            .ok()
            .and_then(|remote| remote.url(gix::remote::Direction::Fetch).map(|u| u.to_bstring().to_string()));

        let status = working_tree_status(dir);
        Ok(Self {
            commit_hash: head.id.to_string(),
            tree_hash,
            parent_hashes,
            author,
            author_email,
            commit_message,
            branch,
            remote_url,
            dirty: !status.is_empty(),
            status,
        })
    }

    fn sha1(hash: &str) -> DigestSet {
        let mut digest = DigestSet::new();
        digest.insert(DigestValue::SHA1, hash.to_owned());
        digest
    }
}

impl Attestor for GitAttestor {
    fn name(&self) -> &str {
        NAME
    }

    fn type_uri(&self) -> &str {
        TYPE_URI
    }

    fn run_type(&self) -> RunType {
        RunType::PreMaterial
    }

    fn attest(&mut self, ctx: &AttestationContext) -> Result<(), AttestationError> {
        *self = Self::capture(ctx.working_dir())?;
        tracing::info!(
            commit = %self.commit_hash,
            dirty = self.dirty,
            "captured git state"
        );
        Ok(())
    }

    fn as_subjecter(&self) -> Option<&dyn Subjecter> {
        Some(self)
    }

    fn as_back_reffer(&self) -> Option<&dyn BackReffer> {
        Some(self)
    }
}

impl Subjecter for GitAttestor {
    fn subjects(&self) -> BTreeMap<String, DigestSet> {
        let mut subjects = self.back_refs();
        if !self.tree_hash.is_empty() {
            subjects.insert(format!("treehash:{}", self.tree_hash), Self::sha1(&self.tree_hash));
        }
        subjects
    }
}

impl BackReffer for GitAttestor {
    fn back_refs(&self) -> BTreeMap<String, DigestSet> {
        if self.commit_hash.is_empty() {
            return BTreeMap::new();
        }
        BTreeMap::from([(
            format!("commithash:{}", self.commit_hash),
            Self::sha1(&self.commit_hash),
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git(dir: &Path, args: &[&str]) {
        let out = Command::new("git").args(args).current_dir(dir).output().unwrap();
        assert!(out.status.success(), "git {args:?} failed: {out:?}");
    }

    fn repo_with_commit(dir: &Path) {
        git(dir, &["init", "-q", "-b", "main"]);
        git(dir, &["config", "user.email", "builder@example.com"]);
        git(dir, &["config", "user.name", "Builder"]);
        std::fs::write(dir.join("lib.rs"), "fn main() {}\n").unwrap();
        git(dir, &["add", "."]);
        git(dir, &["commit", "-q", "-m", "first commit"]);
    }

    #[test]
    fn captures_head_commit() {
        let tmp = tempfile::tempdir().unwrap();
        repo_with_commit(tmp.path());

        let state = GitAttestor::capture(tmp.path()).unwrap();
        assert_eq!(state.commit_hash.len(), 40);
        assert_eq!(state.tree_hash.len(), 40);
        assert!(state.parent_hashes.is_empty());
        assert_eq!(state.author, "Builder");
        assert_eq!(state.author_email, "builder@example.com");
        assert_eq!(state.commit_message, "first commit");
        assert_eq!(state.branch.as_deref(), Some("main"));
        assert!(!state.dirty);
    }

    #[test]
    fn second_commit_records_parent() {
        let tmp = tempfile::tempdir().unwrap();
        repo_with_commit(tmp.path());
        let first = GitAttestor::capture(tmp.path()).unwrap().commit_hash;
        std::fs::write(tmp.path().join("lib.rs"), "fn main() { }\n").unwrap();
        git(tmp.path(), &["commit", "-q", "-am", "second"]);

        let state = GitAttestor::capture(tmp.path()).unwrap();
        assert_eq!(state.parent_hashes, vec![first]);
    }

    #[test]
    fn untracked_and_modified_paths_reported() {
        let tmp = tempfile::tempdir().unwrap();
        repo_with_commit(tmp.path());
        std::fs::write(tmp.path().join("new.txt"), "x").unwrap();
        std::fs::write(tmp.path().join("lib.rs"), "changed").unwrap();

        let state = GitAttestor::capture(tmp.path()).unwrap();
        assert!(state.dirty);
        assert_eq!(state.status.get("new.txt").map(String::as_str), Some("??"));
        assert_eq!(state.status.get("lib.rs").map(String::as_str), Some("M"));
    }

    #[test]
    fn outside_a_repository_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let err = GitAttestor::capture(tmp.path()).unwrap_err();
        assert!(matches!(err, AttestationError::GitError(_)));
    }

    #[test]
    fn porcelain_parsing() {
        let status = parse_porcelain(" M src/a.rs\n?? b.txt\nR  old.rs -> new.rs\n\n");
        assert_eq!(status.len(), 3);
        assert_eq!(status["src/a.rs"], "M");
        assert_eq!(status["b.txt"], "??");
        assert_eq!(status["new.rs"], "R");
    }

    #[test]
    fn commit_is_back_ref_and_tree_is_subject_only() {
        let state = GitAttestor {
            commit_hash: "abc123".to_owned(),
            tree_hash: "def456".to_owned(),
            ..GitAttestor::default()
        };

        let refs = state.back_refs();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs["commithash:abc123"].get(DigestValue::SHA1), Some("abc123"));

        let subjects = state.subjects();
        assert_eq!(subjects.len(), 2);
        assert!(subjects.contains_key("treehash:def456"));
    }

    #[test]
    fn uncaptured_state_has_no_subjects() {
        assert!(GitAttestor::default().subjects().is_empty());
    }
}
