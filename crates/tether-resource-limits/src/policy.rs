//! Memory ceiling policy and violation details

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tether_common::{ByteSize, ProcessError};

/// A resident memory sample that went over the configured ceiling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryViolation {
    /// Process ID where violation occurred
    pub process_id: String,

    /// Resident memory at sampling time
    pub resident: ByteSize,

    /// Ceiling that was exceeded
    pub ceiling: ByteSize,

    /// When the sample was taken
    pub timestamp: DateTime<Utc>,
}

impl MemoryViolation {
    pub fn new(process_id: impl Into<String>, resident: ByteSize, ceiling: ByteSize) -> Self {
        Self {
            process_id: process_id.into(),
            resident,
            ceiling,
            timestamp: Utc::now(),
        }
    }

    /// How far over the ceiling the sample was.
    pub fn excess(&self) -> ByteSize {
        ByteSize::from_bytes(self.resident.as_bytes().saturating_sub(self.ceiling.as_bytes()))
    }

    pub fn into_error(self) -> ProcessError {
        ProcessError::memory_limit_exceeded(self.process_id, self.resident, self.ceiling)
    }
}

impl fmt::Display for MemoryViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "memory violation for {}: resident {} ({} bytes) exceeds ceiling {} ({} bytes)",
            self.process_id,
            self.resident,
            self.resident.as_bytes(),
            self.ceiling,
            self.ceiling.as_bytes()
        )
    }
}

/// Compare a sample with the ceiling.
///
/// Only a sample strictly above the ceiling is a violation; no ceiling means
/// no limit.
pub fn check_memory_ceiling(
    process_id: &str,
    resident: ByteSize,
    ceiling: Option<ByteSize>,
) -> Option<MemoryViolation> {
    let ceiling = ceiling?;
    (resident > ceiling).then(|| MemoryViolation::new(process_id, resident, ceiling))
}
