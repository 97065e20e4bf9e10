//! Kernel image, structure layouts and per-session kernel context

pub mod context;
pub mod dwarf;
pub mod image;
pub mod layout;

pub use context::{KernelContext, TaskIdentity};
pub use image::{KernelImage, SymbolTable};
pub use layout::{KernelLayout, StructLayout};
