//! # salt - Live SLUB Allocator Tracer
//!
//! salt attaches to a Linux kernel halted under a GDB remote stub (QEMU's
//! `-s`, KGDB) and shows what the SLUB allocator is doing: which caches
//! exist, which objects sit on their free lists, and which process is
//! allocating from or freeing into which cache.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 Traced Kernel (QEMU / KGDB)                     │
//! │   __kmalloc · kmalloc_slab · kfree · kmem_cache_alloc/free ·    │
//! │   new_slab                                                      │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ GDB remote serial protocol (TCP)
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       salt (This Crate)                         │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐        │
//! │  │   Backend    │──▶│  Correlator  │──▶│    Filter    │        │
//! │  │ (gdb_remote) │   │   (probes)   │   │ simple/expr  │        │
//! │  └──────────────┘   └──────────────┘   └──────┬───────┘        │
//! │         │                                     ▼                 │
//! │         │           ┌──────────────┐   ┌──────────────┐        │
//! │         ├──────────▶│    Walker    │   │   History    │        │
//! │         │           │ (slab_caches)│   └──────┬───────┘        │
//! │         │           └──────┬───────┘          ▼                 │
//! │         ▼                  ▼           ┌──────────────┐        │
//! │  ┌──────────────┐   ┌──────────────┐   │    Export    │        │
//! │  │    Kernel    │   │    Render    │   │ (history.json)│       │
//! │  │ (vmlinux,    │   │ text/json/   │   └──────────────┘        │
//! │  │  DWARF)      │   │ html         │                            │
//! │  └──────────────┘   └──────────────┘                            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! ### Target Access
//!
//! - [`backend`]: the [`Backend`](backend::Backend) trait over a halted
//!   target: memory reads, symbols, registers and interceptions
//!   - `gdb_remote`: GDB RSP client with software breakpoints
//!   - `synthetic`: in-memory target used by the tests
//!
//! - [`kernel`]: what salt knows about the kernel being traced
//!   - `image`: vmlinux symbol table and DWARF sections
//!   - `dwarf`: struct layouts (`kmem_cache`, `kmem_cache_cpu`, ...)
//!   - `context`: per-cpu base, current task, object-to-cache resolution
//!
//! ### Core Pipeline
//!
//! - [`walker`]: snapshot of every cache and CPU 0's free chain
//! - [`correlator`]: turns probe hits into allocator events; pairs
//!   `__kmalloc` with the `kmalloc_slab` return that picked the cache
//! - [`filter`]: process/cache sets under OR/AND, or a compiled expression
//! - [`history`]: recorded events
//! - [`session`]: owns all of the above for one attached target
//!
//! ### Output
//!
//! - [`render`]: snapshot drawings (text, JSON, HTML) and trace sentences
//! - [`export`]: history as a JSON document
//! - [`symbolization`]: call-site addresses to kernel functions
//!
//! ### Surface
//!
//! - [`cli`]: process arguments and the interactive command language
//! - [`preflight`]: image and stub-address checks with actionable errors
//! - [`domain`]: addresses, pids, event kinds and error types
//!
//! ## Typical Usage
//!
//! ```bash
//! # Kernel booted with: qemu-system-x86_64 -s -append nokaslr ...
//! salt --vmlinux ./vmlinux --walk text
//!
//! # Follow one process, record its events, save them on exit
//! salt --vmlinux ./vmlinux --trace bash --record --export history.json
//! ```
//!
//! ## Key Concepts
//!
//! - **SLUB**: the kernel's default slab allocator; one `kmem_cache` per
//!   object type or size class
//! - **Free chain**: free objects link through a pointer stored at
//!   `kmem_cache.offset` inside each object
//! - **Hardened free lists**: with `CONFIG_SLAB_FREELIST_HARDENED` the stored
//!   pointer is `next ^ random ^ swab(slot)`
//! - **KASLR**: text and data symbols shift by one slide; per-cpu symbols do
//!   not

// Expose modules for testing
pub mod backend;
pub mod cli;
pub mod correlator;
pub mod domain;
pub mod export;
pub mod filter;
pub mod history;
pub mod kernel;
pub mod preflight;
pub mod render;
pub mod session;
pub mod symbolization;
pub mod walker;
