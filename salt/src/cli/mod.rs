//! Command-line surface
//!
//! - [`args`]: process arguments
//! - [`commands`]: the interactive command language read from stdin while
//!   tracing

pub mod args;
pub mod commands;

pub use args::Args;
pub use commands::{execute, parse_command, Command, Outcome};
