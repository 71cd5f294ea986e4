//! # Tether Common
//!
//! Common types shared across the tether crates.
//!
//! This crate provides the foundational pieces that all other tether
//! crates build upon: the process error type and the value types that are
//! parsed once at configuration-load time (`ByteSize`).

pub mod errors;
pub mod types;

// Re-export commonly used items
pub use errors::{ProcessError, ProcessResult};
pub use types::{ByteSize, ByteSizeParseError};
