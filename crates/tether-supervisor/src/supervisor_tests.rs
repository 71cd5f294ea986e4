//! Supervisor lifecycle tests against real child processes.
//!
//! Memory samples come from a scripted probe so that ceiling violations are
//! deterministic; everything else (spawn, exit codes, signals) is real.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tether_common::{ByteSize, ProcessError, ProcessResult};
use tether_process_state::SupervisorState;
use tether_resource_limits::MemoryProbe;

use crate::descriptor::{Environment, ProcessDescriptor, WatchSpec};
use crate::lifecycle::{Backoff, RestartPolicy};
use crate::supervisor::{Supervisor, SupervisorHandle, SupervisorOutcome};

/// Probe that replays a fixed list of samples, then repeats a steady value.
pub(crate) struct ScriptedProbe {
    samples: Mutex<VecDeque<u64>>,
    steady: u64,
    sampled_at: Mutex<Vec<Instant>>,
}

impl ScriptedProbe {
    pub(crate) fn new(samples: &[u64], steady: u64) -> Arc<Self> {
        Arc::new(Self {
            samples: Mutex::new(samples.iter().copied().collect()),
            steady,
            sampled_at: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn steady(bytes: u64) -> Arc<Self> {
        Self::new(&[], bytes)
    }

    pub(crate) fn calls(&self) -> usize {
        self.sampled_at.lock().len()
    }

    /// When the `n`th sample (zero-based) was taken
    pub(crate) fn sampled_at(&self, n: usize) -> Option<Instant> {
        self.sampled_at.lock().get(n).copied()
    }
}

impl MemoryProbe for ScriptedProbe {
    fn resident_memory(&self, _pid: u32) -> ProcessResult<Option<ByteSize>> {
        self.sampled_at.lock().push(Instant::now());
        let bytes = self.samples.lock().pop_front().unwrap_or(self.steady);
        Ok(Some(ByteSize::from_bytes(bytes)))
    }
}

/// `sh -c <script>` in `cwd` with a fast restart policy.
pub(crate) fn shell_descriptor(id: &str, script: &str, cwd: &Path) -> ProcessDescriptor {
    let mut env = BTreeMap::new();
    env.insert(
        "PATH".to_string(),
        std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".to_string()),
    );

    let mut descriptor = ProcessDescriptor::new(id, "sh", cwd);
    descriptor.args = vec!["-c".to_string(), script.to_string()];
    descriptor.environment = Environment::from(env);
    descriptor.restart = RestartPolicy {
        max_restarts: 16,
        min_uptime: Duration::from_secs(1),
        backoff: Backoff::Fixed(Duration::from_millis(20)),
    };
    descriptor.kill_timeout = Duration::from_millis(500);
    descriptor
}

pub(crate) fn spawn_with(descriptor: ProcessDescriptor, probe: Arc<dyn MemoryProbe>) -> SupervisorHandle {
    Supervisor::new(Arc::new(descriptor), probe, Duration::from_millis(25)).spawn()
}

pub(crate) async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for: {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn within<T>(limit: Duration, fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(limit, fut)
        .await
        .expect("operation did not finish in time")
}

#[tokio::test]
async fn test_memory_ceiling_triggers_exactly_one_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut descriptor = shell_descriptor("d1", "exec sleep 30", dir.path());
    descriptor.memory_ceiling = Some(ByteSize::from_bytes(1_000_000_000));

    // First sample is 1.2GB, every later one is well below the ceiling
    let probe = ScriptedProbe::new(&[1_200_000_000], 100_000_000);
    let handle = spawn_with(descriptor, probe.clone());

    eventually("second start", || handle.stats().starts == 2).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let stats = handle.stats();
    assert_eq!(stats.starts, 2);
    assert_eq!(stats.restarts, 1);
    assert_eq!(stats.memory_restarts, 1);
    assert_eq!(stats.last_memory_sample, Some(ByteSize::from_bytes(100_000_000)));
    assert_eq!(handle.state(), SupervisorState::Running);
    assert!(probe.calls() > 2);

    let states: Vec<_> = handle.history().iter().map(|t| t.to_state).collect();
    assert_eq!(
        states,
        [
            SupervisorState::Running,
            SupervisorState::Restarting,
            SupervisorState::Running
        ]
    );
    let reason = handle.history()[1].reason.clone().unwrap();
    assert!(reason.contains("memory limit exceeded"), "{}", reason);

    assert_eq!(within(Duration::from_secs(5), handle.stop()).await, SupervisorOutcome::Stopped);
}

#[tokio::test]
async fn test_memory_violation_terminates_within_one_interval() {
    let dir = tempfile::tempdir().unwrap();
    let mut descriptor = shell_descriptor("d1", "exec sleep 30", dir.path());
    descriptor.memory_ceiling = Some(ByteSize::from_bytes(1_000_000_000));
    descriptor.autorestart = false;
    let kill_timeout = descriptor.kill_timeout;

    // Two samples under the ceiling, then the child goes over it
    let probe = ScriptedProbe::new(&[100_000_000, 100_000_000], 1_200_000_000);
    let handle = spawn_with(descriptor, probe.clone());

    eventually("child started", || handle.stats().pid.is_some()).await;
    let pid = handle.stats().pid.unwrap();

    let outcome = within(Duration::from_secs(5), handle.wait()).await;
    let ended = Instant::now();
    assert!(matches!(outcome, SupervisorOutcome::MemoryLimitExceeded { .. }));

    let violating_sample = probe.sampled_at(2).unwrap();
    let bound = Duration::from_millis(25) + kill_timeout;
    assert!(
        ended.duration_since(violating_sample) < bound,
        "terminated {:?} after the violating sample, bound {:?}",
        ended.duration_since(violating_sample),
        bound
    );
    assert!(!tether_process::process_exists(pid).unwrap());
}

#[tokio::test]
async fn test_memory_restart_not_counted_past_max_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let mut descriptor = shell_descriptor("d1", "exec sleep 30", dir.path());
    descriptor.memory_ceiling = Some(ByteSize::from_bytes(1_000_000_000));
    descriptor.restart.max_restarts = 1;

    // Every sample is over the ceiling
    let handle = spawn_with(descriptor, ScriptedProbe::steady(1_200_000_000));

    let outcome = within(Duration::from_secs(5), handle.wait()).await;
    assert_eq!(outcome, SupervisorOutcome::MaxRestartsExceeded { restarts: 1 });

    let stats = handle.stats();
    assert_eq!(stats.starts, 2);
    assert_eq!(stats.restarts, 1);
    assert_eq!(stats.memory_restarts, 1);
}

#[tokio::test]
async fn test_memory_ceiling_without_autorestart_stops() {
    let dir = tempfile::tempdir().unwrap();
    let mut descriptor = shell_descriptor("d1", "exec sleep 30", dir.path());
    descriptor.memory_ceiling = Some(ByteSize::from_bytes(1_000_000_000));
    descriptor.autorestart = false;

    let handle = spawn_with(descriptor, ScriptedProbe::steady(1_200_000_000));

    let outcome = within(Duration::from_secs(5), handle.wait()).await;
    assert_eq!(
        outcome,
        SupervisorOutcome::MemoryLimitExceeded {
            resident: ByteSize::from_bytes(1_200_000_000),
            ceiling: ByteSize::from_bytes(1_000_000_000),
        }
    );
    assert!(!outcome.is_failure());
    assert_eq!(handle.state(), SupervisorState::Stopped);
    assert_eq!(handle.stats().starts, 1);
}

#[tokio::test]
async fn test_exit_without_autorestart_stops() {
    let dir = tempfile::tempdir().unwrap();
    let mut descriptor = shell_descriptor("once", "exit 3", dir.path());
    descriptor.autorestart = false;

    let handle = spawn_with(descriptor, ScriptedProbe::steady(0));

    let outcome = within(Duration::from_secs(5), handle.wait()).await;
    assert_eq!(outcome, SupervisorOutcome::Exited { code: Some(3) });
    assert_eq!(handle.state(), SupervisorState::Stopped);

    let stats = handle.stats();
    assert_eq!(stats.starts, 1);
    assert_eq!(stats.restarts, 0);
    assert_eq!(stats.last_exit_code, Some(3));
}

#[tokio::test]
async fn test_crash_loop_is_bounded_by_max_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let mut descriptor = shell_descriptor("crashy", "exit 1", dir.path());
    descriptor.restart.max_restarts = 2;

    let handle = spawn_with(descriptor, ScriptedProbe::steady(0));

    let outcome = within(Duration::from_secs(5), handle.wait()).await;
    assert_eq!(outcome, SupervisorOutcome::MaxRestartsExceeded { restarts: 2 });
    assert!(outcome.is_failure());

    // Initial start plus exactly one start per allowed restart
    let stats = handle.stats();
    assert_eq!(stats.starts, 3);
    assert_eq!(stats.restarts, 2);
    assert_eq!(handle.state(), SupervisorState::Stopped);
}

#[tokio::test]
async fn test_stop_exit_codes_are_not_restarted() {
    let dir = tempfile::tempdir().unwrap();
    let mut descriptor = shell_descriptor("job", "exit 0", dir.path());
    descriptor.stop_exit_codes = vec![0];

    let handle = spawn_with(descriptor, ScriptedProbe::steady(0));

    let outcome = within(Duration::from_secs(5), handle.wait()).await;
    assert_eq!(outcome, SupervisorOutcome::Exited { code: Some(0) });
    assert_eq!(handle.stats().starts, 1);
}

#[tokio::test]
async fn test_invalid_working_directory_fails_to_spawn() {
    let mut descriptor = shell_descriptor("d1", "exit 0", Path::new("/no/such/working/dir"));
    descriptor.autorestart = false;

    let handle = spawn_with(descriptor, ScriptedProbe::steady(0));

    let outcome = within(Duration::from_secs(5), handle.wait()).await;
    assert!(matches!(
        outcome,
        SupervisorOutcome::SpawnFailed(ProcessError::SpawnFailed { .. })
    ));
    assert_eq!(handle.state(), SupervisorState::Stopped);
    assert_eq!(handle.stats().starts, 0);

    let states: Vec<_> = handle.history().iter().map(|t| t.to_state).collect();
    assert_eq!(states, [SupervisorState::Stopped]);
}

#[tokio::test]
async fn test_invalid_working_directory_with_autorestart_gives_up() {
    let mut descriptor = shell_descriptor("d1", "exit 0", Path::new("/no/such/working/dir"));
    descriptor.restart.max_restarts = 3;

    let handle = spawn_with(descriptor, ScriptedProbe::steady(0));

    let outcome = within(Duration::from_secs(5), handle.wait()).await;
    assert_eq!(outcome, SupervisorOutcome::MaxRestartsExceeded { restarts: 3 });
    assert_eq!(handle.stats().starts, 0);
    assert_eq!(handle.stats().restarts, 3);
}

#[tokio::test]
async fn test_stop_is_idempotent_and_final() {
    let dir = tempfile::tempdir().unwrap();
    let descriptor = shell_descriptor("web", "exec sleep 30", dir.path());
    let handle = spawn_with(descriptor, ScriptedProbe::steady(0));

    eventually("running", || handle.state() == SupervisorState::Running).await;
    let pid = handle.stats().pid.unwrap();

    let other = handle.clone();
    let started = Instant::now();
    let (first, second) = tokio::join!(handle.stop(), other.stop());
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(first, SupervisorOutcome::Stopped);
    assert_eq!(second, SupervisorOutcome::Stopped);
    assert_eq!(handle.stop().await, SupervisorOutcome::Stopped);

    assert_eq!(handle.state(), SupervisorState::Stopped);
    assert!(!tether_process::process_exists(pid).unwrap());

    // No restart is scheduled after a stop
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stats = handle.stats();
    assert_eq!(stats.starts, 1);
    assert_eq!(stats.restarts, 0);
    assert_eq!(stats.pid, None);
}

#[tokio::test]
async fn test_stop_escalates_to_force_kill() {
    let dir = tempfile::tempdir().unwrap();
    let mut descriptor = shell_descriptor("stubborn", "trap '' TERM; exec sleep 30", dir.path());
    descriptor.kill_timeout = Duration::from_millis(200);
    let handle = spawn_with(descriptor, ScriptedProbe::steady(0));

    eventually("running", || handle.state() == SupervisorState::Running).await;
    // Give the shell time to install the trap before exec
    tokio::time::sleep(Duration::from_millis(100)).await;

    let outcome = within(Duration::from_secs(5), handle.stop()).await;
    assert_eq!(outcome, SupervisorOutcome::Stopped);
    // SIGKILL leaves no exit code
    assert_eq!(handle.stats().last_exit_code, None);
}

#[tokio::test]
async fn test_stop_during_backoff_cancels_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut descriptor = shell_descriptor("slow", "exit 1", dir.path());
    descriptor.restart.backoff = Backoff::Fixed(Duration::from_secs(30));
    let handle = spawn_with(descriptor, ScriptedProbe::steady(0));

    eventually("restarting", || handle.state() == SupervisorState::Restarting).await;

    let outcome = within(Duration::from_secs(2), handle.stop()).await;
    assert_eq!(outcome, SupervisorOutcome::Stopped);
    assert_eq!(handle.stats().starts, 1);
    assert_eq!(handle.state(), SupervisorState::Stopped);
}

#[tokio::test]
async fn test_stop_before_start_runs() {
    let dir = tempfile::tempdir().unwrap();
    let descriptor = shell_descriptor("never", "exec sleep 30", dir.path());
    let handle = spawn_with(descriptor, ScriptedProbe::steady(0));
    handle.request_stop();

    let outcome = within(Duration::from_secs(5), handle.wait()).await;
    assert_eq!(outcome, SupervisorOutcome::Stopped);
    assert_eq!(handle.state(), SupervisorState::Stopped);
}

#[tokio::test]
async fn test_file_change_restarts_without_counting_against_max_restarts() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("app.py"), "v1").unwrap();

    let mut descriptor = shell_descriptor("watched", "exec sleep 30", dir.path());
    descriptor.restart.max_restarts = 0;
    descriptor.watch = Some(WatchSpec {
        roots: vec![dir.path().to_path_buf()],
        ignore: vec![],
        delay: Duration::from_millis(50),
    });
    let handle = spawn_with(descriptor, ScriptedProbe::steady(0));

    eventually("running", || handle.state() == SupervisorState::Running).await;
    std::fs::write(dir.path().join("app.py"), "version 2").unwrap();

    eventually("restart after change", || handle.stats().starts == 2).await;
    let stats = handle.stats();
    assert_eq!(stats.watch_restarts, 1);
    assert_eq!(handle.state(), SupervisorState::Running);

    assert_eq!(within(Duration::from_secs(5), handle.stop()).await, SupervisorOutcome::Stopped);
}

#[tokio::test]
async fn test_child_sees_merged_environment() {
    let dir = tempfile::tempdir().unwrap();
    let mut descriptor = shell_descriptor("env", "echo \"$GREETING\" > seen.txt", dir.path());
    descriptor.autorestart = false;

    let mut vars = descriptor.environment.as_map().clone();
    vars.insert("GREETING".to_string(), "hello from tether".to_string());
    descriptor.environment = Environment::from(vars);

    let handle = spawn_with(descriptor, ScriptedProbe::steady(0));
    assert_eq!(
        within(Duration::from_secs(5), handle.wait()).await,
        SupervisorOutcome::Exited { code: Some(0) }
    );

    let seen = std::fs::read_to_string(dir.path().join("seen.txt")).unwrap();
    assert_eq!(seen.trim(), "hello from tether");
}
