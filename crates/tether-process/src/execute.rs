//! Process execution primitives.
//!
//! A child is always launched with an explicit environment: the inherited
//! variables are cleared and replaced by the mapping carried in the
//! [`LaunchSpec`].

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tether_common::{ProcessError, ProcessResult};
use tokio::process::{Child, Command};
use tracing::debug;

use crate::validation::{resolve_executable, validate_working_directory};

/// Where a child's stdout or stderr goes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OutputTarget {
    /// Share the supervisor's stream
    #[default]
    Inherit,
    /// Discard output
    Null,
    /// Append to a file, creating it if missing
    Append(PathBuf),
}

impl OutputTarget {
    pub fn to_stdio(&self) -> std::io::Result<Stdio> {
        match self {
            OutputTarget::Inherit => Ok(Stdio::inherit()),
            OutputTarget::Null => Ok(Stdio::null()),
            OutputTarget::Append(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Ok(Stdio::from(file))
            }
        }
    }
}

/// Everything needed to launch one child process.
#[derive(Debug, Clone, Copy)]
pub struct LaunchSpec<'a> {
    pub program: &'a str,
    pub args: &'a [String],
    pub working_directory: &'a Path,
    pub environment: &'a BTreeMap<String, String>,
    pub stdout: &'a OutputTarget,
    pub stderr: &'a OutputTarget,
}

/// Build the command for a launch spec without spawning it.
pub fn build_command(spec: &LaunchSpec<'_>) -> std::io::Result<Command> {
    let mut cmd = Command::new(spec.program);
    cmd.args(spec.args)
        .current_dir(spec.working_directory)
        .env_clear()
        .envs(spec.environment)
        .stdin(Stdio::null())
        .stdout(spec.stdout.to_stdio()?)
        .stderr(spec.stderr.to_stdio()?)
        .kill_on_drop(true);
    Ok(cmd)
}

/// Validate and spawn a child process.
///
/// Fails with `SpawnFailed` when the working directory does not exist, the
/// executable cannot be found, or the OS refuses to start the process.
pub fn spawn_child(id: &str, spec: &LaunchSpec<'_>) -> ProcessResult<Child> {
    validate_working_directory(id, spec.working_directory)?;
    let resolved = resolve_executable(
        id,
        spec.program,
        spec.working_directory,
        spec.environment.get("PATH").map(String::as_str),
    )?;
    debug!("Resolved executable for {}: {}", id, resolved.display());

    let mut cmd = build_command(spec).map_err(|e| {
        ProcessError::spawn_failed(id, format!("failed to open output file: {}", e))
    })?;

    cmd.spawn().map_err(|e| {
        ProcessError::spawn_failed(id, format!("failed to spawn {}: {}", spec.program, e))
    })
}
