//! # Tether Process
//!
//! Low-level process operations for tether.
//!
//! This crate provides the primitives the supervisor is built on:
//! - Command building with an explicit environment
//! - Pre-spawn validation (working directory, executable lookup)
//! - Signal delivery and force kill
//! - Process existence verification

pub mod check;
pub mod execute;
pub mod terminate;
pub mod validation;

// Re-export main types
pub use check::*;
pub use execute::*;
pub use terminate::*;
pub use validation::*;
