//! Process existence checking.

use tether_common::ProcessResult;

/// Check if a process with the given PID exists.
///
/// On Unix this uses `kill(pid, 0)`, which sends no signal but reports
/// whether the process exists.
///
/// # Returns
///
/// * `Ok(true)` - Process exists (possibly owned by another user)
/// * `Ok(false)` - Process does not exist
/// * `Err(_)` - The check itself failed
///
/// # Examples
///
/// ```rust,no_run
/// use tether_process::process_exists;
///
/// if process_exists(1234).unwrap() {
///     println!("Process 1234 is running");
/// }
/// ```
pub fn process_exists(pid: u32) -> ProcessResult<bool> {
    #[cfg(unix)]
    {
        process_exists_unix(pid)
    }

    #[cfg(not(unix))]
    {
        Err(tether_common::ProcessError::monitoring(
            pid.to_string(),
            "process existence check is only supported on Unix",
        ))
    }
}

#[cfg(unix)]
fn process_exists_unix(pid: u32) -> ProcessResult<bool> {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| {
        tether_common::ProcessError::monitoring(pid.to_string(), "PID out of range")
    })?;

    match kill(Pid::from_raw(raw), None) {
        Ok(_) => Ok(true),
        Err(nix::errno::Errno::ESRCH) => Ok(false),
        Err(nix::errno::Errno::EPERM) => Ok(true),
        Err(e) => Err(tether_common::ProcessError::monitoring(
            pid.to_string(),
            format!("Failed to check process: {}", e),
        )),
    }
}
