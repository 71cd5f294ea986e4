//! Process manager: one independent supervisor per descriptor instance.
//!
//! Supervisors share nothing mutable; a failure in one never reaches
//! another. The manager only starts them, stops them and reports on them.

use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tether_common::{ByteSize, ProcessError, ProcessResult};
use tether_process_state::SupervisorState;
use tether_resource_limits::{MemoryProbe, SysinfoProbe};
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::config::{ConfigResult, SupervisorOptions, TetherConfig};
use crate::descriptor::ProcessDescriptor;
use crate::supervisor::{Supervisor, SupervisorHandle, SupervisorOutcome};

/// Process manager overall state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessManagerState {
    Initializing,
    Running,
    Stopping,
    Stopped,
}

/// Process information structure for external queries
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub id: String,
    pub state: SupervisorState,
    pub pid: Option<u32>,
    pub start_time: Option<chrono::DateTime<chrono::Utc>>,
    pub starts: u32,
    pub restart_count: u32,
    pub last_exit_code: Option<i32>,
    pub memory_usage: Option<ByteSize>,
    pub memory_ceiling: Option<ByteSize>,
    pub time_in_state: Duration,
}

/// Owns the supervisors of every configured process
pub struct ProcessManager {
    options: SupervisorOptions,
    descriptors: Vec<Arc<ProcessDescriptor>>,
    probe: Arc<dyn MemoryProbe>,
    handles: Vec<SupervisorHandle>,
    state: Mutex<ProcessManagerState>,
}

impl ProcessManager {
    /// Build descriptors for every app instance in `config`.
    pub fn new(config: TetherConfig) -> ConfigResult<Self> {
        let descriptors = config.descriptors()?;
        Ok(Self::from_descriptors(
            config.supervisor,
            descriptors,
            Arc::new(SysinfoProbe::new()),
        ))
    }

    pub fn from_descriptors(
        options: SupervisorOptions,
        descriptors: Vec<ProcessDescriptor>,
        probe: Arc<dyn MemoryProbe>,
    ) -> Self {
        Self {
            options,
            descriptors: descriptors.into_iter().map(Arc::new).collect(),
            probe,
            handles: Vec::new(),
            state: Mutex::new(ProcessManagerState::Initializing),
        }
    }

    pub fn descriptors(&self) -> &[Arc<ProcessDescriptor>] {
        &self.descriptors
    }

    pub fn get_manager_state(&self) -> ProcessManagerState {
        *self.state.lock()
    }

    /// Start a supervisor for every descriptor.
    ///
    /// Must be called from within a tokio runtime. Calling it again is a
    /// no-op.
    pub fn start(&mut self) {
        if !self.handles.is_empty() {
            warn!("Process manager already started");
            return;
        }

        info!("Starting {} supervised processes", self.descriptors.len());
        self.handles = self
            .descriptors
            .iter()
            .map(|descriptor| {
                Supervisor::new(
                    Arc::clone(descriptor),
                    Arc::clone(&self.probe),
                    self.options.memory_check_interval,
                )
                .spawn()
            })
            .collect();
        *self.state.lock() = ProcessManagerState::Running;
    }

    pub fn handle(&self, process_id: &str) -> Option<&SupervisorHandle> {
        self.handles.iter().find(|h| h.id() == process_id)
    }

    /// Stop a single process.
    pub async fn stop_process(&self, process_id: &str) -> ProcessResult<SupervisorOutcome> {
        let handle = self
            .handle(process_id)
            .ok_or_else(|| ProcessError::not_found(process_id))?;
        Ok(handle.stop().await)
    }

    /// Current state of every process, by id
    pub fn states(&self) -> BTreeMap<String, SupervisorState> {
        self.handles
            .iter()
            .map(|h| (h.id().to_string(), h.state()))
            .collect()
    }

    pub fn get_process_info(&self, process_id: &str) -> ProcessResult<ProcessInfo> {
        self.handle(process_id)
            .map(process_info)
            .ok_or_else(|| ProcessError::not_found(process_id))
    }

    pub fn get_all_process_info(&self) -> Vec<ProcessInfo> {
        self.handles.iter().map(process_info).collect()
    }

    /// Resolve once every supervisor has ended on its own.
    pub async fn wait_all(&self) -> BTreeMap<String, SupervisorOutcome> {
        let outcomes = join_all(self.handles.iter().map(|h| h.wait())).await;
        *self.state.lock() = ProcessManagerState::Stopped;
        self.collect(outcomes)
    }

    /// Stop every process concurrently, bounded by `shutdown_timeout`.
    pub async fn shutdown(&self) -> ProcessResult<BTreeMap<String, SupervisorOutcome>> {
        *self.state.lock() = ProcessManagerState::Stopping;
        let shutdown_timeout = self.options.shutdown_timeout;
        info!(
            "Stopping {} supervised processes (timeout {:?})",
            self.handles.len(),
            shutdown_timeout
        );

        let stops = join_all(self.handles.iter().map(|h| h.stop()));
        match timeout(shutdown_timeout, stops).await {
            Ok(outcomes) => {
                *self.state.lock() = ProcessManagerState::Stopped;
                info!("All supervised processes stopped");
                Ok(self.collect(outcomes))
            }
            Err(_) => {
                let pending: Vec<_> = self
                    .handles
                    .iter()
                    .filter(|h| !h.state().is_terminal())
                    .map(|h| h.id().to_string())
                    .collect();
                error!("Shutdown timed out; still running: {:?}", pending);
                Err(ProcessError::timeout(
                    "process-manager",
                    format!("shutdown after {:?} ({} still running)", shutdown_timeout, pending.len()),
                ))
            }
        }
    }

    fn collect(&self, outcomes: Vec<SupervisorOutcome>) -> BTreeMap<String, SupervisorOutcome> {
        self.handles
            .iter()
            .map(|h| h.id().to_string())
            .zip(outcomes)
            .collect()
    }
}

fn process_info(handle: &SupervisorHandle) -> ProcessInfo {
    let stats = handle.stats();
    ProcessInfo {
        id: handle.id().to_string(),
        state: handle.state(),
        pid: stats.pid,
        start_time: stats.last_started_at,
        starts: stats.starts,
        restart_count: stats.restarts,
        last_exit_code: stats.last_exit_code,
        memory_usage: stats.last_memory_sample,
        memory_ceiling: handle.descriptor().memory_ceiling,
        time_in_state: handle.time_in_state().to_std().unwrap_or_default(),
    }
}
