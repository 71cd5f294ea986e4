//! # Tether Resource Limits
//!
//! Memory sampling and ceiling enforcement for supervised processes.
//!
//! This crate provides:
//! - The [`MemoryProbe`] seam used by the supervisor to sample resident memory
//! - A sysinfo-backed probe for real processes
//! - The memory ceiling check ([`check_memory_ceiling`])

pub mod policy;

use parking_lot::Mutex;
use sysinfo::{Pid, ProcessRefreshKind, System};
use tether_common::{ByteSize, ProcessResult};
use tracing::debug;

pub use policy::{check_memory_ceiling, MemoryViolation};

/// Source of resident memory samples.
///
/// Sampling is synchronous and short, so implementations are plain
/// `Send + Sync` objects shared behind an `Arc`.
pub trait MemoryProbe: Send + Sync {
    /// Resident set size of `pid`.
    ///
    /// Returns `Ok(None)` when the process no longer exists; an exit that
    /// races the sample is not an error.
    fn resident_memory(&self, pid: u32) -> ProcessResult<Option<ByteSize>>;
}

/// Memory probe backed by `sysinfo`.
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn resident_memory(&self, pid: u32) -> ProcessResult<Option<ByteSize>> {
        let mut system = self.system.lock();

        // Only memory is refreshed; without an explicit refresh kind sysinfo
        // reports stale values.
        let sysinfo_pid = Pid::from_u32(pid);
        if !system.refresh_process_specifics(sysinfo_pid, ProcessRefreshKind::new().with_memory()) {
            debug!("PID {} vanished before its memory could be sampled", pid);
            return Ok(None);
        }

        let resident = system
            .process(sysinfo_pid)
            .map(|process| ByteSize::from_bytes(process.memory()));

        if let Some(size) = resident {
            debug!("Resident memory for PID {}: {} ({} bytes)", pid, size, size.as_bytes());
        }

        Ok(resident)
    }
}
