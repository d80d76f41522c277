//! Built-in attestors.

pub mod command_run;
pub mod environment;
pub mod git;
pub mod material;
pub mod product;

use std::collections::BTreeMap;
use std::path::Path;

use vouch_dsse::{DigestSet, DigestValue};

use crate::error::AttestationError;
use crate::registry::Registry;

pub use command_run::CommandRunAttestor;
pub use environment::EnvironmentAttestor;
pub use git::GitAttestor;
pub use material::MaterialAttestor;
pub use product::ProductAttestor;

/// Register every built-in attestor with its options.
pub fn register_builtins(registry: &mut Registry) -> Result<(), AttestationError> {
    registry.register::<EnvironmentAttestor>(environment::options())?;
    registry.register::<GitAttestor>(Vec::new())?;
    registry.register::<MaterialAttestor>(Vec::new())?;
    registry.register::<CommandRunAttestor>(command_run::options())?;
    registry.register::<ProductAttestor>(product::options())?;
    Ok(())
}

/// Hash every regular file under `root`, keyed by `/`-separated path
/// relative to `root`. `.git` directories are skipped.
pub(crate) fn hash_tree(
    root: &Path,
    hashes: &[DigestValue],
) -> Result<BTreeMap<String, DigestSet>, AttestationError> {
    let mut out = BTreeMap::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;

            if file_type.is_dir() {
                if entry.file_name() != ".git" {
                    pending.push(path);
                }
                continue;
            }
            if !file_type.is_file() {
                continue;
            }

            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.insert(key, DigestSet::calculate_from_file(&path, hashes)?);
        }
    }

    Ok(out)
}
