//! Process termination primitives.

use std::fmt;
use std::str::FromStr;
use tether_common::{ProcessError, ProcessResult};

/// Signal used to ask a managed process to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KillSignal {
    #[default]
    Term,
    Int,
    Hup,
    Quit,
    Usr1,
    Usr2,
    Kill,
}

impl KillSignal {
    pub fn name(&self) -> &'static str {
        match self {
            KillSignal::Term => "SIGTERM",
            KillSignal::Int => "SIGINT",
            KillSignal::Hup => "SIGHUP",
            KillSignal::Quit => "SIGQUIT",
            KillSignal::Usr1 => "SIGUSR1",
            KillSignal::Usr2 => "SIGUSR2",
            KillSignal::Kill => "SIGKILL",
        }
    }

    #[cfg(unix)]
    fn to_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;

        match self {
            KillSignal::Term => Signal::SIGTERM,
            KillSignal::Int => Signal::SIGINT,
            KillSignal::Hup => Signal::SIGHUP,
            KillSignal::Quit => Signal::SIGQUIT,
            KillSignal::Usr1 => Signal::SIGUSR1,
            KillSignal::Usr2 => Signal::SIGUSR2,
            KillSignal::Kill => Signal::SIGKILL,
        }
    }
}

impl FromStr for KillSignal {
    type Err = String;

    /// Accepts `SIGTERM`, `TERM` and `sigterm` alike.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
        match bare {
            "TERM" => Ok(KillSignal::Term),
            "INT" => Ok(KillSignal::Int),
            "HUP" => Ok(KillSignal::Hup),
            "QUIT" => Ok(KillSignal::Quit),
            "USR1" => Ok(KillSignal::Usr1),
            "USR2" => Ok(KillSignal::Usr2),
            "KILL" => Ok(KillSignal::Kill),
            _ => Err(format!("unsupported kill signal: {}", s)),
        }
    }
}

impl fmt::Display for KillSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ask a process to shut down with the given signal.
pub fn terminate_gracefully(pid: u32, signal: KillSignal) -> ProcessResult<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let raw = i32::try_from(pid)
            .map_err(|_| ProcessError::stop_failed(pid.to_string(), "PID out of range"))?;
        kill(Pid::from_raw(raw), signal.to_nix())
            .map_err(|e| ProcessError::stop_failed(pid.to_string(), format!("{}: {}", signal, e)))
    }

    #[cfg(not(unix))]
    {
        Err(ProcessError::stop_failed(
            pid.to_string(),
            format!("{} delivery is only supported on Unix", signal),
        ))
    }
}

/// Force kill a process (SIGKILL).
pub fn force_kill(pid: u32) -> ProcessResult<()> {
    #[cfg(unix)]
    {
        terminate_gracefully(pid, KillSignal::Kill)
    }

    #[cfg(not(unix))]
    {
        Err(ProcessError::stop_failed(
            pid.to_string(),
            "force kill by PID is only supported on Unix",
        ))
    }
}
