//! In-memory target
//!
//! Byte-addressed sparse memory, a symbol table and a settable register file.
//! Interceptions are recorded rather than planted; scenarios are driven with
//! [`SyntheticTarget::fire_entry`] and [`SyntheticTarget::fire_return`], which
//! produce the same [`Hit`] values a live backend reports.

use std::collections::{BTreeMap, HashMap};

use super::{Backend, CallContext, Hit, ProbeId, Registers, ReturnToken};
use crate::domain::{Address, BackendError};

#[derive(Debug, Default)]
pub struct SyntheticTarget {
    symbols: HashMap<String, Address>,
    memory: HashMap<u64, u8>,
    registers: Registers,
    entries: BTreeMap<String, ProbeId>,
    returns: BTreeMap<ReturnToken, (ProbeId, CallContext)>,
    next_token: u64,
}

impl SyntheticTarget {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define_symbol(&mut self, name: &str, address: Address) {
        self.symbols.insert(name.to_string(), address);
    }

    pub fn write_bytes(&mut self, address: Address, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            self.memory.insert(address.0.wrapping_add(i as u64), *byte);
        }
    }

    pub fn write_u64(&mut self, address: Address, value: u64) {
        self.write_bytes(address, &value.to_le_bytes());
    }

    pub fn write_u32(&mut self, address: Address, value: u32) {
        self.write_bytes(address, &value.to_le_bytes());
    }

    /// Write `text` followed by a NUL terminator
    pub fn write_cstr(&mut self, address: Address, text: &str) {
        self.write_bytes(address, text.as_bytes());
        self.write_bytes(address.offset(text.len() as u64), &[0]);
    }

    /// Map `len` zero bytes
    pub fn map_zeroed(&mut self, address: Address, len: u64) {
        for i in 0..len {
            self.memory.insert(address.0.wrapping_add(i), 0);
        }
    }

    pub fn unmap(&mut self, address: Address, len: u64) {
        for i in 0..len {
            self.memory.remove(&address.0.wrapping_add(i));
        }
    }

    pub fn set_registers(&mut self, registers: Registers) {
        self.registers = registers;
    }

    #[must_use]
    pub fn is_intercepted(&self, symbol: &str) -> bool {
        self.entries.contains_key(symbol)
    }

    #[must_use]
    pub fn pending_returns(&self) -> usize {
        self.returns.len()
    }

    /// Most recently planted return interception
    #[must_use]
    pub fn last_return_token(&self) -> Option<ReturnToken> {
        self.returns.keys().next_back().copied()
    }

    /// Simulate entry into `symbol` with the given register file
    ///
    /// Returns `None` when nothing intercepts the routine, like a live target
    /// that would simply keep running.
    pub fn fire_entry(
        &mut self,
        symbol: &str,
        registers: Registers,
        return_address: Address,
    ) -> Option<Hit> {
        let probe = *self.entries.get(symbol)?;
        let stack_pointer = Address(registers.get("rsp").unwrap_or(0));
        self.registers = registers;
        Some(Hit::Entry { probe, call: CallContext { stack_pointer, return_address } })
    }

    /// Simulate the return of an intercepted invocation with `rax` as result
    pub fn fire_return(&mut self, token: ReturnToken, rax: u64) -> Option<Hit> {
        let (probe, call) = self.returns.remove(&token)?;
        self.registers.set("rax", rax);
        self.registers.set("rsp", call.stack_pointer.0.wrapping_add(8));
        self.registers.set("rip", call.return_address.0);
        Some(Hit::Return { probe, token, call })
    }
}

impl Backend for SyntheticTarget {
    fn resolve_symbol(&self, name: &str) -> Result<Address, BackendError> {
        self.symbols.get(name).copied().ok_or_else(|| BackendError::SymbolNotFound(name.into()))
    }

    fn read_memory(&mut self, address: Address, buf: &mut [u8]) -> Result<(), BackendError> {
        let len = buf.len();
        for (i, slot) in buf.iter_mut().enumerate() {
            let at = address.0.wrapping_add(i as u64);
            *slot = *self.memory.get(&at).ok_or(BackendError::MemoryFault { address, len })?;
        }
        Ok(())
    }

    fn current_registers(&mut self) -> Result<Registers, BackendError> {
        Ok(self.registers.clone())
    }

    fn intercept_entry(&mut self, symbol: &str, probe: ProbeId) -> Result<(), BackendError> {
        self.resolve_symbol(symbol)?;
        self.entries.insert(symbol.to_string(), probe);
        Ok(())
    }

    fn intercept_return(
        &mut self,
        call: &CallContext,
        probe: ProbeId,
    ) -> Result<ReturnToken, BackendError> {
        self.next_token += 1;
        let token = ReturnToken(self.next_token);
        self.returns.insert(token, (probe, *call));
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_spanning_unmapped_byte_faults() {
        let mut target = SyntheticTarget::new();
        target.write_u64(Address(0x100), 0x1122_3344_5566_7788);
        assert_eq!(target.read_u64(Address(0x100)).unwrap(), 0x1122_3344_5566_7788);
        let err = target.read_u64(Address(0x104)).unwrap_err();
        assert!(matches!(err, BackendError::MemoryFault { address: Address(0x104), len: 8 }));
    }

    #[test]
    fn test_entry_requires_symbol() {
        let mut target = SyntheticTarget::new();
        assert!(matches!(
            target.intercept_entry("kfree", ProbeId(1)),
            Err(BackendError::SymbolNotFound(_))
        ));
        target.define_symbol("kfree", Address(0xffff_ffff_8100_0000));
        target.intercept_entry("kfree", ProbeId(1)).unwrap();
        assert!(target.is_intercepted("kfree"));
        assert!(target.fire_entry("kmalloc", Registers::new(), Address(0)).is_none());
    }

    #[test]
    fn test_return_is_one_shot() {
        let mut target = SyntheticTarget::new();
        let call = CallContext { stack_pointer: Address(0x8000), return_address: Address(0x42) };
        let token = target.intercept_return(&call, ProbeId(3)).unwrap();
        let hit = target.fire_return(token, 0x10).unwrap();
        assert_eq!(hit.probe(), ProbeId(3));
        assert_eq!(target.current_registers().unwrap().get("rax"), Some(0x10));
        assert!(target.fire_return(token, 0x10).is_none());
    }
}
