//! Structured error types for salt
//!
//! Using thiserror for automatic Display implementation and error chaining.

use super::types::Address;
use std::fmt;
use thiserror::Error;

/// Failures reported by a memory/symbol backend
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("Memory fault reading {len} bytes at {address}")]
    MemoryFault { address: Address, len: usize },

    #[error("Remote protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures while resolving structure layouts from target metadata
#[derive(Error, Debug)]
pub enum LayoutError {
    #[error("struct {0} not found in debug info")]
    MissingStruct(String),

    #[error("struct {structure} has no field {field}")]
    MissingField { structure: String, field: String },

    #[error("field {structure}.{field} has unsupported width {width}")]
    UnsupportedWidth { structure: String, field: String, width: u64 },

    #[error("Failed to parse kernel image: {0}")]
    Object(String),

    #[error(transparent)]
    Dwarf(#[from] gimli::Error),
}

/// Which filter set a name belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterTarget {
    Process,
    Cache,
}

impl fmt::Display for FilterTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterTarget::Process => f.write_str("processes"),
            FilterTarget::Cache => f.write_str("caches"),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FilterError {
    #[error("Malformed filter expression: {0}")]
    MalformedExpression(String),

    #[error("'{name}' is not among filtered {target}.")]
    UnknownFilterTarget { target: FilterTarget, name: String },
}

/// Errors surfaced by a tracing session
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Layout(#[from] LayoutError),
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_fault_display() {
        let err = BackendError::MemoryFault { address: Address(0xffff_8880_0000_1000), len: 8 };
        assert_eq!(err.to_string(), "Memory fault reading 8 bytes at 0xffff888000001000");
    }

    #[test]
    fn test_unknown_filter_target_wording() {
        let err =
            FilterError::UnknownFilterTarget { target: FilterTarget::Cache, name: "dentry".into() };
        assert_eq!(err.to_string(), "'dentry' is not among filtered caches.");
    }

    #[test]
    fn test_session_error_wraps_backend() {
        let err: SessionError = BackendError::SymbolNotFound("slab_caches".into()).into();
        assert!(err.to_string().contains("slab_caches"));
    }
}
