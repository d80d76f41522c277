//! Command-run attestor: executes the step's command and records its
//! output.

use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::attestor::{Attestor, RunType};
use crate::context::AttestationContext;
use crate::error::AttestationError;
use crate::registry::AttestorOption;

/// Registry name.
pub const NAME: &str = "command-run";
/// Predicate type URI.
pub const TYPE_URI: &str = "https://vouch.dev/attestations/command-run/v0.1";

/// The executed command and what it produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRunAttestor {
    /// Program and arguments.
    #[serde(default)]
    pub cmd: Vec<String>,
    /// Captured standard output (lossy UTF-8).
    #[serde(default)]
    pub stdout: String,
    /// Captured standard error (lossy UTF-8).
    #[serde(default)]
    pub stderr: String,
    /// Exit code; `-1` when terminated by a signal.
    #[serde(default)]
    pub exit_code: i32,
}

pub(crate) fn options() -> Vec<AttestorOption> {
    vec![AttestorOption::new(
        "cmd",
        "Command and arguments to run",
        Vec::<String>::new(),
        |a: &mut CommandRunAttestor, v: Vec<String>| {
            a.cmd = v;
            Ok(())
        },
    )]
}

impl CommandRunAttestor {
    /// Attestor preconfigured with `cmd`.
    #[must_use]
    pub fn new(cmd: Vec<String>) -> Self {
        Self {
            cmd,
            ..Self::default()
        }
    }
}

impl Attestor for CommandRunAttestor {
    fn name(&self) -> &str {
        NAME
    }

    fn type_uri(&self) -> &str {
        TYPE_URI
    }

    fn run_type(&self) -> RunType {
        RunType::Execute
    }

    fn attest(&mut self, ctx: &AttestationContext) -> Result<(), AttestationError> {
        let Some((program, args)) = self.cmd.split_first() else {
            return Err(AttestationError::InvalidOption(
                "command-run requires a command".to_owned(),
            ));
        };

        tracing::info!(program = %program, args = ?args, "running command");
        let output = Command::new(program)
            .args(args)
            .current_dir(ctx.working_dir())
            .output()
            .map_err(|e| AttestationError::CommandFailed(format!("failed to spawn `{program}`: {e}")))?;

        self.stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        self.stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        self.exit_code = output.status.code().unwrap_or(-1);

        if !output.status.success() {
            return Err(AttestationError::CommandFailed(format!(
                "`{program}` exited with {}",
                output.status
            )));
        }
        Ok(())
    }
}
