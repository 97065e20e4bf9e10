//! # Memory/Symbol Backend
//!
//! The only boundary the tracing core depends on. A backend:
//! - resolves global symbols to addresses,
//! - reads raw bytes (and, through provided helpers, typed values) from the
//!   halted target,
//! - exposes the register set of the stopped execution context,
//! - plants one-shot interceptions on routine entry and on the return of one
//!   specific invocation.
//!
//! Interceptions are reported back as [`Hit`] values. The session looks the
//! probe up in the correlator's registry and runs the bound handler
//! synchronously while the target is still halted.
//!
//! Two implementations ship with the crate:
//! - [`gdb_remote::GdbRemote`]: GDB Remote Serial Protocol client (QEMU `-s`)
//! - [`synthetic::SyntheticTarget`]: in-memory target for tests and demos

pub mod gdb_remote;
pub mod synthetic;

use std::collections::BTreeMap;
use std::fmt;

use crate::domain::{Address, BackendError};
use crate::kernel::layout::{StructLayout, StructView};

pub use gdb_remote::GdbRemote;
pub use synthetic::SyntheticTarget;

/// Identifier the correlator binds a handler to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProbeId(pub u32);

/// Handle of one pending return interception
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReturnToken(pub u64);

impl fmt::Display for ReturnToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ret#{}", self.0)
    }
}

/// Identity of one routine invocation, captured at its entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallContext {
    /// Stack pointer at entry (points at the return address on x86_64)
    pub stack_pointer: Address,
    /// Where the invocation will return to; also the caller's call site
    pub return_address: Address,
}

/// An interception that fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hit {
    Entry { probe: ProbeId, call: CallContext },
    Return { probe: ProbeId, token: ReturnToken, call: CallContext },
}

impl Hit {
    #[must_use]
    pub fn probe(&self) -> ProbeId {
        match self {
            Hit::Entry { probe, .. } | Hit::Return { probe, .. } => *probe,
        }
    }
}

/// Register name → value for the stopped execution context
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registers {
    values: BTreeMap<String, u64>,
}

impl Registers {
    /// x86_64 general purpose register names in GDB `g` packet order
    pub const X86_64_ORDER: [&'static str; 17] = [
        "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15", "rip",
    ];

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: &str, value: u64) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: u64) {
        self.values.insert(name.to_string(), value);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<u64> {
        self.values.get(name).copied()
    }

    /// # Errors
    /// `BackendError::Protocol` when the backend did not report this register
    pub fn require(&self, name: &str) -> Result<u64, BackendError> {
        self.get(name).ok_or_else(|| BackendError::Protocol(format!("register {name} unavailable")))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Access to a halted target's symbols, memory, registers and interceptions
pub trait Backend {
    /// # Errors
    /// `BackendError::SymbolNotFound`
    fn resolve_symbol(&self, name: &str) -> Result<Address, BackendError>;

    /// Fill `buf` from target memory starting at `address`
    ///
    /// # Errors
    /// `BackendError::MemoryFault` for unmapped or unreadable memory
    fn read_memory(&mut self, address: Address, buf: &mut [u8]) -> Result<(), BackendError>;

    /// # Errors
    /// Backend failure while fetching registers
    fn current_registers(&mut self) -> Result<Registers, BackendError>;

    /// Stop every time `symbol` is entered, reporting `probe`
    ///
    /// # Errors
    /// `SymbolNotFound` or a backend failure planting the interception
    fn intercept_entry(&mut self, symbol: &str, probe: ProbeId) -> Result<(), BackendError>;

    /// Stop once when the invocation identified by `call` returns
    ///
    /// # Errors
    /// Backend failure planting the interception
    fn intercept_return(
        &mut self,
        call: &CallContext,
        probe: ProbeId,
    ) -> Result<ReturnToken, BackendError>;

    /// # Errors
    /// `MemoryFault`
    fn read_u64(&mut self, address: Address) -> Result<u64, BackendError> {
        let mut buf = [0u8; 8];
        self.read_memory(address, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Little-endian unsigned integer of `width` bytes (1..=8)
    ///
    /// # Errors
    /// `MemoryFault`, or `Protocol` for a width outside 1..=8
    fn read_uint(&mut self, address: Address, width: usize) -> Result<u64, BackendError> {
        if !(1..=8).contains(&width) {
            return Err(BackendError::Protocol(format!("unsupported integer width {width}")));
        }
        let mut buf = [0u8; 8];
        self.read_memory(address, &mut buf[..width])?;
        Ok(u64::from_le_bytes(buf))
    }

    /// # Errors
    /// `MemoryFault`
    fn read_address(&mut self, address: Address) -> Result<Address, BackendError> {
        self.read_u64(address).map(Address)
    }

    /// Read a typed structure instance; fields are decoded by offset afterwards
    ///
    /// # Errors
    /// `MemoryFault`
    fn read_struct(
        &mut self,
        address: Address,
        layout: &StructLayout,
    ) -> Result<StructView, BackendError> {
        let len = usize::try_from(layout.size)
            .map_err(|_| BackendError::Protocol(format!("struct {} too large", layout.name)))?;
        let mut bytes = vec![0u8; len];
        self.read_memory(address, &mut bytes)?;
        Ok(StructView::new(address, bytes))
    }

    /// Read a NUL-terminated string of at most `max_len` bytes
    ///
    /// Reads in chunks; a chunk that faults is retried byte by byte so a
    /// string ending right before unmapped memory is still returned.
    ///
    /// # Errors
    /// `MemoryFault` when not even the first byte is readable
    fn read_cstring(&mut self, address: Address, max_len: usize) -> Result<String, BackendError> {
        const CHUNK: usize = 32;
        let mut out = Vec::new();
        while out.len() < max_len {
            let want = CHUNK.min(max_len - out.len());
            let at = address.offset(out.len() as u64);
            let mut buf = vec![0u8; want];
            let chunk = match self.read_memory(at, &mut buf) {
                Ok(()) => buf,
                Err(e) => {
                    let mut partial = Vec::with_capacity(want);
                    for i in 0..want {
                        let mut byte = [0u8; 1];
                        if self.read_memory(at.offset(i as u64), &mut byte).is_err() {
                            break;
                        }
                        partial.push(byte[0]);
                        if byte[0] == 0 {
                            break;
                        }
                    }
                    if partial.is_empty() && out.is_empty() {
                        return Err(e);
                    }
                    partial
                }
            };
            if let Some(nul) = chunk.iter().position(|&b| b == 0) {
                out.extend_from_slice(&chunk[..nul]);
                break;
            }
            let truncated = chunk.len() < want;
            out.extend_from_slice(&chunk);
            if truncated {
                break;
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registers_require() {
        let regs = Registers::new().with("rdi", 7);
        assert_eq!(regs.require("rdi").unwrap(), 7);
        assert!(regs.require("rsi").is_err());
    }

    #[test]
    fn test_read_uint_widths() {
        let mut target = SyntheticTarget::new();
        target.write_u32(Address(0x200), 0xdead_beef);
        assert_eq!(target.read_uint(Address(0x200), 2).unwrap(), 0xbeef);
        assert_eq!(target.read_uint(Address(0x200), 4).unwrap(), 0xdead_beef);
        assert!(target.read_uint(Address(0x200), 9).is_err());
    }

    #[test]
    fn test_read_cstring_stops_at_mapping_end() {
        let mut target = SyntheticTarget::new();
        target.write_bytes(Address(0x1000), b"kmalloc-64");
        // no terminator mapped: the string runs straight into unmapped memory
        let name = target.read_cstring(Address(0x1000), 64).unwrap();
        assert_eq!(name, "kmalloc-64");
    }

    #[test]
    fn test_read_cstring_fault_on_first_chunk() {
        let mut target = SyntheticTarget::new();
        assert!(matches!(
            target.read_cstring(Address(0x5000), 16),
            Err(BackendError::MemoryFault { .. })
        ));
    }
}
