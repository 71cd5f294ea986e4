//! Restart policy and backoff bookkeeping.

use std::time::Duration;
use tether_common::{ProcessError, ProcessResult};
use tracing::{debug, warn};

const DEFAULT_BACKOFF_MULTIPLIER: f64 = 1.5;
const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(15);

/// Delay applied before each restart
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl Backoff {
    /// Exponential backoff starting at `initial`, growing by 1.5x up to 15s.
    pub fn exponential(initial: Duration) -> Self {
        Backoff::Exponential {
            initial,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max: DEFAULT_BACKOFF_MAX.max(initial),
        }
    }

    /// Delay before restart number `attempt` (zero-based) of a streak.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let factor = multiplier.powi(attempt.min(i32::MAX as u32) as i32);
                let nanos = (initial.as_nanos() as f64 * factor).round();
                if !nanos.is_finite() || nanos >= max.as_nanos() as f64 {
                    max
                } else {
                    Duration::from_nanos(nanos as u64)
                }
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed(Duration::from_secs(1))
    }
}

/// How a process is restarted after an unexpected exit
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    /// Maximum consecutive restarts of unstable runs
    pub max_restarts: u32,
    /// A run lasting at least this long resets the consecutive counter
    pub min_uptime: Duration,
    pub backoff: Backoff,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 16,
            min_uptime: Duration::from_secs(1),
            backoff: Backoff::default(),
        }
    }
}

/// Tracks consecutive restarts of one process.
#[derive(Debug, Clone)]
pub struct RestartTracker {
    process_id: String,
    policy: RestartPolicy,
    consecutive_restarts: u32,
}

impl RestartTracker {
    pub fn new(process_id: impl Into<String>, policy: RestartPolicy) -> Self {
        Self {
            process_id: process_id.into(),
            policy,
            consecutive_restarts: 0,
        }
    }

    /// Record how long the last run lasted; a stable run resets the streak.
    pub fn record_run(&mut self, uptime: Duration) {
        if uptime >= self.policy.min_uptime {
            if self.consecutive_restarts > 0 {
                debug!(
                    "Process {} ran for {:?}, resetting restart counter",
                    self.process_id, uptime
                );
            }
            self.consecutive_restarts = 0;
        }
    }

    /// Backoff that the next restart would wait.
    pub fn next_delay(&self) -> Duration {
        self.policy.backoff.delay_for(self.consecutive_restarts)
    }

    /// Claim the next restart slot and return its delay.
    ///
    /// Fails with `MaxRestartsExceeded` once the streak reached
    /// `max_restarts`.
    pub fn try_begin_restart(&mut self) -> ProcessResult<Duration> {
        if self.consecutive_restarts >= self.policy.max_restarts {
            warn!(
                "Process {} has exceeded maximum restart attempts ({}/{})",
                self.process_id, self.consecutive_restarts, self.policy.max_restarts
            );
            return Err(ProcessError::max_restarts_exceeded(
                &self.process_id,
                self.consecutive_restarts,
                self.policy.max_restarts,
            ));
        }

        let delay = self.next_delay();
        self.consecutive_restarts += 1;
        Ok(delay)
    }

    pub fn consecutive_restarts(&self) -> u32 {
        self.consecutive_restarts
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }
}
