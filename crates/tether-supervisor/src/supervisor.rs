//! Supervision of a single process instance.
//!
//! A [`Supervisor`] runs as one tokio task that exclusively owns the child
//! process. Everything else talks to it through a [`SupervisorHandle`]: the
//! state machine and statistics are shared read-only, and a stop request is
//! a `CancellationToken` the task selects on.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_common::{ByteSize, ProcessError, ProcessResult};
use tether_process::{force_kill, spawn_child, terminate_gracefully};
use tether_process_state::{StateMachine, StateTransition, SupervisorState};
use tether_resource_limits::{check_memory_ceiling, MemoryProbe, MemoryViolation};
use tokio::process::Child;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::descriptor::ProcessDescriptor;
use crate::lifecycle::RestartTracker;
use crate::watch::FileWatcher;

const FORCE_KILL_TIMEOUT: Duration = Duration::from_secs(3);

/// Counters for one supervised process
#[derive(Debug, Clone, Default, Serialize)]
pub struct SupervisorStats {
    /// PID of the running child, if any
    pub pid: Option<u32>,
    /// Successful spawns
    pub starts: u32,
    /// Restarts scheduled for any reason
    pub restarts: u32,
    pub memory_restarts: u32,
    pub watch_restarts: u32,
    /// `None` when the child was killed by a signal
    pub last_exit_code: Option<i32>,
    pub last_memory_sample: Option<ByteSize>,
    pub last_started_at: Option<DateTime<Utc>>,
}

/// Why supervision of a process ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorOutcome {
    /// Stopped on request
    Stopped,
    /// The child exited and the restart policy said not to restart it
    Exited { code: Option<i32> },
    /// The child could not be started and `autorestart` is off
    SpawnFailed(ProcessError),
    /// The child went over its memory ceiling and `autorestart` is off
    MemoryLimitExceeded { resident: ByteSize, ceiling: ByteSize },
    /// Too many consecutive restarts
    MaxRestartsExceeded { restarts: u32 },
    /// The supervisor task itself failed
    Aborted { reason: String },
}

impl SupervisorOutcome {
    /// Outcomes that the operator must hear about.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            SupervisorOutcome::SpawnFailed(_)
                | SupervisorOutcome::MaxRestartsExceeded { .. }
                | SupervisorOutcome::Aborted { .. }
        )
    }
}

impl fmt::Display for SupervisorOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorOutcome::Stopped => write!(f, "stopped on request"),
            SupervisorOutcome::Exited { code } => write!(f, "{}", describe_exit(*code)),
            SupervisorOutcome::SpawnFailed(err) => write!(f, "{}", err),
            SupervisorOutcome::MemoryLimitExceeded { resident, ceiling } => write!(
                f,
                "memory limit exceeded: resident {} over ceiling {}",
                resident, ceiling
            ),
            SupervisorOutcome::MaxRestartsExceeded { restarts } => {
                write!(f, "gave up after {} consecutive restarts", restarts)
            }
            SupervisorOutcome::Aborted { reason } => write!(f, "supervisor aborted: {}", reason),
        }
    }
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with code {}", code),
        None => "terminated by signal".to_string(),
    }
}

/// How one run of the child ended
#[derive(Debug)]
enum RunEnd {
    Exited(Option<i32>),
    MemoryLimit(MemoryViolation),
    FilesChanged(PathBuf),
    StopRequested,
}

/// What the lifecycle loop does next
enum Next {
    Restart(String, RestartCause),
    RestartNow(String, RestartCause),
    Finish(SupervisorOutcome),
}

/// Which counter a restart is booked under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RestartCause {
    Failure,
    Memory,
    Watch,
}

/// Lifecycle loop for one process descriptor.
pub struct Supervisor {
    descriptor: Arc<ProcessDescriptor>,
    probe: Arc<dyn MemoryProbe>,
    memory_check_interval: Duration,
    state: Arc<StateMachine>,
    stats: Arc<Mutex<SupervisorStats>>,
    cancel: CancellationToken,
    tracker: RestartTracker,
}

impl Supervisor {
    pub fn new(
        descriptor: Arc<ProcessDescriptor>,
        probe: Arc<dyn MemoryProbe>,
        memory_check_interval: Duration,
    ) -> Self {
        Self {
            state: Arc::new(StateMachine::new(&descriptor.id)),
            stats: Arc::new(Mutex::new(SupervisorStats::default())),
            cancel: CancellationToken::new(),
            tracker: RestartTracker::new(&descriptor.id, descriptor.restart.clone()),
            descriptor,
            probe,
            memory_check_interval,
        }
    }

    /// Start supervising on the current tokio runtime.
    pub fn spawn(self) -> SupervisorHandle {
        let descriptor = Arc::clone(&self.descriptor);
        let state = Arc::clone(&self.state);
        let stats = Arc::clone(&self.stats);
        let cancel = self.cancel.clone();

        let task = tokio::spawn(self.run());

        let task_state = Arc::clone(&state);
        let id = descriptor.id.clone();
        let outcome = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Supervisor task for {} failed: {}", id, e);
                    let _ = task_state.transition_to(SupervisorState::Stopped, Some(e.to_string()));
                    SupervisorOutcome::Aborted {
                        reason: e.to_string(),
                    }
                }
            }
        }
        .boxed()
        .shared();

        SupervisorHandle {
            descriptor,
            state,
            stats,
            cancel,
            outcome,
        }
    }

    async fn run(mut self) -> SupervisorOutcome {
        let id = self.descriptor.id.clone();
        info!("Supervising {}: {}", id, self.descriptor.command_line());

        let outcome = self.supervise().await;

        if let Err(e) = self
            .state
            .transition_to(SupervisorState::Stopped, Some(outcome.to_string()))
        {
            debug!("Final transition for {} skipped: {}", id, e);
        }
        self.stats.lock().pid = None;

        match &outcome {
            o if o.is_failure() => error!("Supervision of {} ended: {}", id, o),
            SupervisorOutcome::MemoryLimitExceeded { .. } => {
                warn!("Supervision of {} ended: {}", id, outcome)
            }
            _ => info!("Supervision of {} ended: {}", id, outcome),
        }
        outcome
    }

    async fn supervise(&mut self) -> SupervisorOutcome {
        let mut watcher = match &self.descriptor.watch {
            Some(spec) => Some(FileWatcher::new(spec).await),
            None => None,
        };

        loop {
            if self.cancel.is_cancelled() {
                return SupervisorOutcome::Stopped;
            }

            let mut child = match self.start() {
                Ok(child) => child,
                Err(err) => {
                    error!("Failed to start {}: {}", self.descriptor.id, err);
                    if !self.descriptor.autorestart {
                        return SupervisorOutcome::SpawnFailed(err);
                    }
                    if let Err(outcome) = self
                        .restart_after_backoff(err.to_string(), RestartCause::Failure)
                        .await
                    {
                        return outcome;
                    }
                    continue;
                }
            };
            let started = Instant::now();

            let next = match self.monitor(&mut child, watcher.as_mut()).await {
                RunEnd::StopRequested => {
                    self.shutdown_child(&mut child).await;
                    Next::Finish(SupervisorOutcome::Stopped)
                }
                RunEnd::Exited(code) => {
                    self.record_exit(code);
                    self.tracker.record_run(started.elapsed());
                    self.on_exit(code)
                }
                RunEnd::MemoryLimit(violation) => {
                    warn!("{} ({} over)", violation, violation.excess());
                    self.shutdown_child(&mut child).await;
                    self.tracker.record_run(started.elapsed());

                    let (resident, ceiling) = (violation.resident, violation.ceiling);
                    let error = violation.into_error();
                    if self.descriptor.autorestart {
                        Next::Restart(error.to_string(), RestartCause::Memory)
                    } else {
                        warn!("Not restarting {}: {}", self.descriptor.id, error);
                        Next::Finish(SupervisorOutcome::MemoryLimitExceeded { resident, ceiling })
                    }
                }
                RunEnd::FilesChanged(path) => {
                    info!(
                        "Change detected in {}, restarting {}",
                        path.display(),
                        self.descriptor.id
                    );
                    self.shutdown_child(&mut child).await;
                    Next::RestartNow(format!("file changed: {}", path.display()), RestartCause::Watch)
                }
            };

            let proceed = match next {
                Next::Finish(outcome) => return outcome,
                Next::Restart(reason, cause) => self.restart_after_backoff(reason, cause).await,
                Next::RestartNow(reason, cause) => self.enter_restarting(reason, cause),
            };
            if let Err(outcome) = proceed {
                return outcome;
            }
        }
    }

    /// Spawn the child and move to RUNNING.
    fn start(&self) -> ProcessResult<Child> {
        let id = &self.descriptor.id;
        let child = spawn_child(id, &self.descriptor.launch_spec())?;
        let pid = child.id();

        // The child is killed on drop if the transition is refused.
        self.state.transition_to(
            SupervisorState::Running,
            Some(pid.map_or_else(|| "started".to_string(), |pid| format!("started with PID {}", pid))),
        )?;

        {
            let mut stats = self.stats.lock();
            stats.starts += 1;
            stats.pid = pid;
            stats.last_started_at = Some(Utc::now());
        }

        info!("Started {} (PID: {:?}) in {}", id, pid, self.descriptor.working_directory.display());
        Ok(child)
    }

    /// Watch one run of the child until something ends it.
    async fn monitor(&self, child: &mut Child, mut watcher: Option<&mut FileWatcher>) -> RunEnd {
        let id = &self.descriptor.id;
        let pid = child.id();

        let mut memory_tick = interval(self.memory_check_interval);
        memory_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let watch_delay = self
            .descriptor
            .watch
            .as_ref()
            .map_or(Duration::from_secs(1), |spec| spec.delay);
        let mut watch_tick = interval(watch_delay);
        watch_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; the baseline is already fresh.
        watch_tick.tick().await;

        loop {
            tokio::select! {
                result = child.wait() => {
                    return match result {
                        Ok(status) => RunEnd::Exited(status.code()),
                        Err(e) => {
                            error!("Failed to wait for {}: {}", id, e);
                            RunEnd::Exited(None)
                        }
                    };
                }
                _ = self.cancel.cancelled() => {
                    return RunEnd::StopRequested;
                }
                _ = memory_tick.tick() => {
                    if let Some(violation) = pid.and_then(|pid| self.sample_memory(pid)) {
                        return RunEnd::MemoryLimit(violation);
                    }
                }
                _ = watch_tick.tick(), if watcher.is_some() => {
                    if let Some(watcher) = watcher.as_deref_mut() {
                        if let Some(path) = watcher.poll().await {
                            return RunEnd::FilesChanged(path);
                        }
                    }
                }
            }
        }
    }

    fn sample_memory(&self, pid: u32) -> Option<MemoryViolation> {
        let id = &self.descriptor.id;
        match self.probe.resident_memory(pid) {
            Ok(Some(resident)) => {
                self.stats.lock().last_memory_sample = Some(resident);
                check_memory_ceiling(id, resident, self.descriptor.memory_ceiling)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Memory sample failed for {}: {}", id, e);
                None
            }
        }
    }

    /// Decide what follows an exit the supervisor did not cause.
    fn on_exit(&self, code: Option<i32>) -> Next {
        let id = &self.descriptor.id;
        if code == Some(0) {
            info!("Process {} {}", id, describe_exit(code));
        } else {
            warn!("Process {} {}", id, describe_exit(code));
        }

        if self.descriptor.is_stop_exit_code(code) {
            info!("Exit code of {} is listed in stop_exit_codes, not restarting", id);
            return Next::Finish(SupervisorOutcome::Exited { code });
        }

        if !self.descriptor.autorestart {
            return Next::Finish(SupervisorOutcome::Exited { code });
        }

        Next::Restart(describe_exit(code), RestartCause::Failure)
    }

    /// Claim a restart slot, move to RESTARTING and wait out the backoff.
    async fn restart_after_backoff(
        &mut self,
        reason: String,
        cause: RestartCause,
    ) -> Result<(), SupervisorOutcome> {
        if self.cancel.is_cancelled() {
            return Err(SupervisorOutcome::Stopped);
        }

        let delay = self.tracker.try_begin_restart().map_err(|e| {
            error!("Not restarting {}: {}", self.descriptor.id, e);
            SupervisorOutcome::MaxRestartsExceeded {
                restarts: self.tracker.consecutive_restarts(),
            }
        })?;

        self.enter_restarting(reason, cause)?;
        info!(
            "Restarting process {} in {:?} (attempt {}/{})",
            self.descriptor.id,
            delay,
            self.tracker.consecutive_restarts(),
            self.tracker.policy().max_restarts
        );

        tokio::select! {
            _ = sleep(delay) => Ok(()),
            _ = self.cancel.cancelled() => {
                info!("Stop requested for {} during restart backoff", self.descriptor.id);
                Err(SupervisorOutcome::Stopped)
            }
        }
    }

    /// Move to RESTARTING and book the restart under `cause`.
    fn enter_restarting(&self, reason: String, cause: RestartCause) -> Result<(), SupervisorOutcome> {
        if self.cancel.is_cancelled() {
            return Err(SupervisorOutcome::Stopped);
        }

        self.state
            .transition_to(SupervisorState::Restarting, Some(reason))
            .map_err(|e| {
                warn!("Cannot restart {}: {}", self.descriptor.id, e);
                SupervisorOutcome::Stopped
            })?;
        let mut stats = self.stats.lock();
        stats.restarts += 1;
        match cause {
            RestartCause::Memory => stats.memory_restarts += 1,
            RestartCause::Watch => stats.watch_restarts += 1,
            RestartCause::Failure => {}
        }
        Ok(())
    }

    /// Terminate the child and record how it ended.
    async fn shutdown_child(&self, child: &mut Child) -> Option<i32> {
        let code = match self.terminate(child).await {
            Ok(code) => code,
            Err(e) => {
                error!("Failed to stop {}: {}", self.descriptor.id, e);
                None
            }
        };
        self.record_exit(code);
        code
    }

    /// Send the kill signal, wait `kill_timeout`, then force kill.
    async fn terminate(&self, child: &mut Child) -> ProcessResult<Option<i32>> {
        let id = &self.descriptor.id;
        let Some(pid) = child.id() else {
            debug!("Process {} already exited", id);
            return Ok(None);
        };

        let signal = self.descriptor.kill_signal;
        let kill_timeout = self.descriptor.kill_timeout;
        info!("Sending {} to {} (PID: {})", signal, id, pid);

        match terminate_gracefully(pid, signal) {
            Ok(()) => match timeout(kill_timeout, child.wait()).await {
                Ok(Ok(status)) => {
                    info!("Process {} terminated gracefully", id);
                    return Ok(status.code());
                }
                Ok(Err(e)) => return Err(ProcessError::stop_failed(id, e.to_string())),
                Err(_) => warn!(
                    "Graceful shutdown timed out for {} (PID: {}), attempting force kill",
                    id, pid
                ),
            },
            Err(e) => warn!("Failed to send {} to {}: {}", signal, id, e),
        }

        if let Err(e) = force_kill(pid) {
            warn!("Force kill by PID failed for {}: {}", id, e);
            child
                .start_kill()
                .map_err(|e| ProcessError::stop_failed(id, e.to_string()))?;
        }

        match timeout(FORCE_KILL_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                info!("Process {} terminated after force kill", id);
                Ok(status.code())
            }
            Ok(Err(e)) => Err(ProcessError::stop_failed(id, e.to_string())),
            Err(_) => Err(ProcessError::timeout(
                id,
                format!(
                    "stop (did not exit after kill timeout {:?} + force-kill timeout {:?})",
                    kill_timeout, FORCE_KILL_TIMEOUT
                ),
            )),
        }
    }

    fn record_exit(&self, code: Option<i32>) {
        let mut stats = self.stats.lock();
        stats.pid = None;
        stats.last_exit_code = code;
    }
}

/// Shared view of a running [`Supervisor`].
///
/// Cheap to clone; every clone observes the same process.
#[derive(Clone)]
pub struct SupervisorHandle {
    descriptor: Arc<ProcessDescriptor>,
    state: Arc<StateMachine>,
    stats: Arc<Mutex<SupervisorStats>>,
    cancel: CancellationToken,
    outcome: Shared<BoxFuture<'static, SupervisorOutcome>>,
}

impl SupervisorHandle {
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &Arc<ProcessDescriptor> {
        &self.descriptor
    }

    pub fn state(&self) -> SupervisorState {
        self.state.current_state()
    }

    pub fn stats(&self) -> SupervisorStats {
        self.stats.lock().clone()
    }

    /// State transitions, oldest first
    pub fn history(&self) -> Vec<StateTransition> {
        self.state.history()
    }

    /// Time since the last state transition
    pub fn time_in_state(&self) -> chrono::Duration {
        self.state.time_in_current_state()
    }

    /// Ask the supervisor to stop without waiting for it.
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    /// Stop the process and wait until supervision has ended.
    ///
    /// Safe to call from any task, any number of times; every call returns
    /// the same outcome.
    pub async fn stop(&self) -> SupervisorOutcome {
        self.request_stop();
        self.wait().await
    }

    /// Wait until supervision ends on its own (or because of a stop request).
    pub async fn wait(&self) -> SupervisorOutcome {
        self.outcome.clone().await
    }
}

impl fmt::Debug for SupervisorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisorHandle")
            .field("id", &self.descriptor.id)
            .field("state", &self.state())
            .finish()
    }
}
