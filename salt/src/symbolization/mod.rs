//! # Call-site symbolization
//!
//! Turns the return address captured at a probe hit into the kernel
//! function, file and line that called the allocator.
//!
//! ## KASLR
//!
//! vmlinux DWARF describes link-time addresses. A randomized kernel runs
//! every text address shifted by one constant slide:
//!
//! ```text
//! Runtime Address = Link Address + Slide
//! Link Address    = Runtime Address - Slide
//! ```
//!
//! The slide is the one given with `--kaslr-offset` and already applied to
//! the [`SymbolTable`](crate::kernel::SymbolTable). [`Symbolizer`] removes it
//! before looking the address up.
//!
//! **Libraries used**:
//! - `addr2line`: address to frames, inline chains included
//! - `gimli`: DWARF sections, loaded through [`KernelImage`](crate::kernel::KernelImage)
//!
//! ## Limitations
//!
//! - Requires `CONFIG_DEBUG_INFO`; without it every frame is `<unknown>`
//! - Module text is not covered, only the core image

pub mod symbolizer;

pub use symbolizer::{InlinedFrame, ResolvedFrame, SourceLocation, Symbolizer};
