//! # Tether Process State
//!
//! Lifecycle state of one supervised process:
//!
//! ```text
//! INIT -> RUNNING -> {RESTARTING -> RUNNING}* -> STOPPED
//! ```
//!
//! The current state lives in a single atomic field so that handles can read
//! it from any task, and transitions are compare-and-swap operations. Two
//! racing callers can therefore never both move a process out of RUNNING,
//! which keeps at most one restart in flight per process.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use tether_common::{ProcessError, ProcessResult};

const MAX_HISTORY: usize = 100;

/// Supervisor state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    /// Descriptor loaded, child never started
    Init,
    /// Child process is running
    Running,
    /// Child is gone and a restart is scheduled after backoff
    Restarting,
    /// Supervision ended; no child and no pending restart
    Stopped,
}

impl SupervisorState {
    fn as_u8(self) -> u8 {
        match self {
            SupervisorState::Init => 0,
            SupervisorState::Running => 1,
            SupervisorState::Restarting => 2,
            SupervisorState::Stopped => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => SupervisorState::Init,
            1 => SupervisorState::Running,
            2 => SupervisorState::Restarting,
            _ => SupervisorState::Stopped,
        }
    }

    /// Check if the supervisor reached its terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, SupervisorState::Stopped)
    }

    /// Check whether moving from `self` to `target` is allowed
    pub fn can_transition_to(&self, target: SupervisorState) -> bool {
        match (*self, target) {
            (SupervisorState::Init, SupervisorState::Running) => true,
            (SupervisorState::Init, SupervisorState::Restarting) => true, // first spawn failed
            (SupervisorState::Init, SupervisorState::Stopped) => true,

            (SupervisorState::Running, SupervisorState::Restarting) => true,
            (SupervisorState::Running, SupervisorState::Stopped) => true,

            (SupervisorState::Restarting, SupervisorState::Running) => true,
            (SupervisorState::Restarting, SupervisorState::Restarting) => true, // respawn failed again
            (SupervisorState::Restarting, SupervisorState::Stopped) => true,

            (SupervisorState::Stopped, SupervisorState::Stopped) => true,

            _ => false,
        }
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorState::Init => write!(f, "init"),
            SupervisorState::Running => write!(f, "running"),
            SupervisorState::Restarting => write!(f, "restarting"),
            SupervisorState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Represents a state transition with timestamp and optional reason
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from_state: SupervisorState,
    pub to_state: SupervisorState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Shared state machine for one supervised process.
///
/// Intended to be wrapped in an `Arc` and shared between the supervisor task
/// and any number of handles.
#[derive(Debug)]
pub struct StateMachine {
    process_id: String,
    state: AtomicU8,
    history: Mutex<VecDeque<StateTransition>>,
    last_transition_time: Mutex<DateTime<Utc>>,
}

impl StateMachine {
    /// Create a new state machine in `Init`
    pub fn new(process_id: &str) -> Self {
        Self {
            process_id: process_id.to_string(),
            state: AtomicU8::new(SupervisorState::Init.as_u8()),
            history: Mutex::new(VecDeque::new()),
            last_transition_time: Mutex::new(Utc::now()),
        }
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// Get the current state
    pub fn current_state(&self) -> SupervisorState {
        SupervisorState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Atomically move from `expected` to `target`.
    ///
    /// Fails with `InvalidState` if the current state is not `expected` or if
    /// the transition is not part of the lifecycle.
    pub fn transition(
        &self,
        expected: SupervisorState,
        target: SupervisorState,
        reason: Option<String>,
    ) -> ProcessResult<()> {
        if !expected.can_transition_to(target) {
            return Err(ProcessError::invalid_state(
                &self.process_id,
                format!("transition {} -> {}", expected, target),
                expected.to_string(),
            ));
        }

        self.state
            .compare_exchange(
                expected.as_u8(),
                target.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|actual| {
                ProcessError::invalid_state(
                    &self.process_id,
                    expected.to_string(),
                    SupervisorState::from_u8(actual).to_string(),
                )
            })?;

        self.record(expected, target, reason);
        Ok(())
    }

    /// Move to `target` from whatever the current state is, as long as the
    /// transition is valid. Returns the state that was left.
    pub fn transition_to(&self, target: SupervisorState, reason: Option<String>) -> ProcessResult<SupervisorState> {
        let mut current = self.current_state();
        loop {
            if !current.can_transition_to(target) {
                return Err(ProcessError::invalid_state(
                    &self.process_id,
                    format!("a state that can move to {}", target),
                    current.to_string(),
                ));
            }

            match self.state.compare_exchange(
                current.as_u8(),
                target.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.record(current, target, reason);
                    return Ok(current);
                }
                Err(actual) => current = SupervisorState::from_u8(actual),
            }
        }
    }

    fn record(&self, from_state: SupervisorState, to_state: SupervisorState, reason: Option<String>) {
        let now = Utc::now();
        *self.last_transition_time.lock() = now;

        let mut history = self.history.lock();
        history.push_back(StateTransition {
            from_state,
            to_state,
            timestamp: now,
            reason,
        });
        if history.len() > MAX_HISTORY {
            history.pop_front();
        }

        tracing::debug!(
            "Process {} transitioned from {} to {}",
            self.process_id,
            from_state,
            to_state
        );
    }

    /// Snapshot of the recorded transitions, oldest first
    pub fn history(&self) -> Vec<StateTransition> {
        self.history.lock().iter().cloned().collect()
    }

    /// Get the time spent in the current state
    pub fn time_in_current_state(&self) -> chrono::Duration {
        Utc::now() - *self.last_transition_time.lock()
    }
}
