//! Pre-spawn validation.
//!
//! Spawning reports a missing working directory and a missing executable
//! with the same `ENOENT`, so both are checked up front to give the operator
//! a precise `SpawnFailed` reason.

use std::path::{Path, PathBuf};
use tether_common::{ProcessError, ProcessResult};

/// Validate process ID format.
pub fn validate_process_id(id: &str) -> ProcessResult<()> {
    if id.is_empty() {
        return Err(ProcessError::configuration("validation", "Process ID cannot be empty"));
    }

    if id.len() > 64 {
        return Err(ProcessError::configuration(
            id,
            "Process ID too long (max 64 characters)",
        ));
    }

    if !id.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.') {
        return Err(ProcessError::configuration(
            id,
            "Process ID can only contain alphanumeric characters, dots, hyphens, and underscores",
        ));
    }

    Ok(())
}

/// Check that the working directory exists and is a directory.
pub fn validate_working_directory(id: &str, path: &Path) -> ProcessResult<()> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(ProcessError::spawn_failed(
            id,
            format!("working directory does not exist: {}", path.display()),
        ))
    }
}

/// Locate the executable the way `execvp` would.
///
/// A program containing a path separator is resolved against the working
/// directory; a bare name is searched in `search_path` (the child's `PATH`).
pub fn resolve_executable(
    id: &str,
    program: &str,
    working_directory: &Path,
    search_path: Option<&str>,
) -> ProcessResult<PathBuf> {
    if program.is_empty() {
        return Err(ProcessError::spawn_failed(id, "executable path cannot be empty"));
    }

    if program.contains(std::path::MAIN_SEPARATOR) || program.contains('/') {
        let candidate = working_directory.join(program);
        return if is_executable(&candidate) {
            Ok(candidate)
        } else {
            Err(ProcessError::spawn_failed(
                id,
                format!("executable not found: {}", candidate.display()),
            ))
        };
    }

    search_path
        .into_iter()
        .flat_map(std::env::split_paths)
        .map(|dir| {
            if dir.as_os_str().is_empty() {
                working_directory.join(program)
            } else {
                dir.join(program)
            }
        })
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| {
            ProcessError::spawn_failed(id, format!("executable not found in PATH: {}", program))
        })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
