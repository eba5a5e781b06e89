//! Native content steps
//!
//! The built-in step list points at two content steps: one that installs
//! package repository definitions and one that installs and runs the salt
//! agent. Both are implemented here so the `systemprep` binary can act as
//! its own step executable (`systemprep yum-repos ...`,
//! `systemprep salt-install ...`).

pub mod packages;
pub mod repos;
pub mod salt;

pub use repos::{Release, RepoEntry, RepoPaths, YumRepoParams, install_repos};
pub use salt::{SaltInstall, SaltInstallParams, SaltPaths};

use crate::error::StepExecutionError;
use crate::runner::ExecutionResult;
use crate::runner::executor::{display_command, run_program};

/// Run `program` with `args` directly (no shell), failing on a non-zero exit
pub(crate) async fn run_command(
    program: &str,
    args: &[String],
) -> Result<ExecutionResult, StepExecutionError> {
    let result = run_program(program, args).await?;
    if !result.success() {
        return Err(StepExecutionError::NonZeroExit {
            command: display_command(program, args),
            code: result.exit_code,
        });
    }
    Ok(result)
}
