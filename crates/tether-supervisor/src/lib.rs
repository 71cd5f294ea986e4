//! # Tether Supervisor
//!
//! Process supervision for tether.
//!
//! This crate provides:
//! - Configuration loading and validation (PM2-style `apps` files)
//! - Immutable per-instance process descriptors
//! - Restart policy with bounded retries and backoff
//! - The per-process [`Supervisor`] task and its [`SupervisorHandle`]
//! - A polling file watcher
//! - [`ProcessManager`], which runs one supervisor per descriptor

pub mod config;
pub mod descriptor;
pub mod lifecycle;
pub mod manager;
pub mod supervisor;
pub mod watch;

#[cfg(all(test, unix))]
mod supervisor_tests;

// Re-export main types
pub use config::{AppConfig, ArgList, ConfigError, ConfigResult, SupervisorOptions, TetherConfig, WatchSetting};
pub use descriptor::{Environment, ProcessDescriptor, WatchSpec};
pub use lifecycle::{Backoff, RestartPolicy, RestartTracker};
pub use manager::{ProcessInfo, ProcessManager, ProcessManagerState};
pub use supervisor::{Supervisor, SupervisorHandle, SupervisorOutcome, SupervisorStats};
pub use watch::FileWatcher;

pub use tether_process_state::SupervisorState;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
