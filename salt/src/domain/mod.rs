//! Domain model for salt
//!
//! This module contains core domain types and errors that provide:
//! - Compile-time safety via newtype pattern
//! - Self-documenting function signatures
//! - Structured error handling

pub mod errors;
pub mod types;

// Re-export common types for convenience
pub use types::{Address, AllocationEvent, EventKind, Pid};

pub use errors::{
    BackendError, ExportError, FilterError, FilterTarget, LayoutError, SessionError,
};
