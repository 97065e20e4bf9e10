//! # Cache Walker
//!
//! Enumerates every `kmem_cache` on the global `slab_caches` list and, for
//! each one, the chain of free objects in CPU 0's active slab.
//!
//! ```text
//!   slab_caches ──▶ kmem_cache.list ──▶ kmem_cache.list ──▶ … ──▶ slab_caches
//!                        │
//!                        ├─ cpu_slab + __per_cpu_offset[0] ──▶ kmem_cache_cpu.freelist
//!                        │                                          │
//!                        │            ┌─────────────────────────────┘
//!                        ▼            ▼
//!                   offset ──▶  obj ─(obj + offset)─▶ obj ─▶ … ─▶ NULL
//! ```
//!
//! Traversal ends when the next node is the list head again, compared by
//! address. A fault reading the list head fails the walk. Any other fault
//! ends the affected chain (or the list) and is recorded on the snapshot,
//! which is then only best-effort.

use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

use crate::backend::Backend;
use crate::domain::{Address, BackendError};
use crate::kernel::context::MAX_CACHE_NAME;
use crate::kernel::layout::{FieldLayout, ResolvedOffsets, StructLayout, StructView};
use crate::kernel::KernelContext;

/// Name given to the list-head entry of every snapshot
pub const ROOT_NAME: &str = "slab_caches";

/// Width of a free pointer stored inside a free object
const FREE_POINTER_WIDTH: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WalkFaultKind {
    /// Target memory could not be read
    MemoryFault,
    /// A cache or free object was reached twice
    Cycle,
    /// The free-pointer offset does not fit inside the object slot
    SuspectLayout,
}

impl fmt::Display for WalkFaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalkFaultKind::MemoryFault => f.write_str("memory fault"),
            WalkFaultKind::Cycle => f.write_str("cycle"),
            WalkFaultKind::SuspectLayout => f.write_str("suspect layout"),
        }
    }
}

/// Where and why part of a walk was cut short
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalkFault {
    pub kind: WalkFaultKind,
    /// Cache being walked, or `None` when the cache itself was unreadable
    pub cache: Option<String>,
    pub address: Address,
}

impl fmt::Display for WalkFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cache {
            Some(cache) => write!(f, "{} in {cache} at {}", self.kind, self.address),
            None => write!(f, "{} at {}", self.kind, self.address),
        }
    }
}

/// One entry of a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheSnapshot {
    pub name: String,
    #[serde(rename = "objsize", skip_serializing_if = "Option::is_none")]
    pub object_size: Option<u32>,
    #[serde(rename = "offset", skip_serializing_if = "Option::is_none")]
    pub free_pointer_offset: Option<u32>,
    /// `kmem_cache` address, or the list head for the root entry
    pub address: Address,
    pub first_free: Address,
    /// Head to tail; the terminating NULL is not included
    #[serde(rename = "freelist")]
    pub free_chain: Vec<Address>,
    pub next: Address,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<WalkFault>,
}

impl CacheSnapshot {
    fn root(head: Address, first: Address) -> Self {
        Self {
            name: ROOT_NAME.to_string(),
            object_size: None,
            free_pointer_offset: None,
            address: head,
            first_free: Address::NULL,
            free_chain: Vec::new(),
            next: first,
            fault: None,
        }
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.object_size.is_none() && self.name == ROOT_NAME
    }
}

/// Root entry followed by every cache in list order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SlabSnapshot {
    pub caches: Vec<CacheSnapshot>,
    pub faults: Vec<WalkFault>,
}

impl SlabSnapshot {
    /// Some part of the walk was cut short
    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.faults.is_empty()
    }

    #[must_use]
    pub fn root(&self) -> Option<&CacheSnapshot> {
        self.caches.first()
    }

    /// Every entry except the root
    #[must_use]
    pub fn entries(&self) -> &[CacheSnapshot] {
        self.caches.get(1..).unwrap_or(&[])
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<&CacheSnapshot> {
        self.entries().iter().find(|c| c.name == name)
    }

    /// Root plus the caches named in `targets` (all of them when `None`)
    #[must_use]
    pub fn select(&self, targets: Option<&[String]>) -> Vec<&CacheSnapshot> {
        self.caches
            .iter()
            .enumerate()
            .filter(|(idx, c)| *idx == 0 || targets.map_or(true, |t| t.iter().any(|n| *n == c.name)))
            .map(|(_, c)| c)
            .collect()
    }
}

/// Reads the cache list and free chains from a halted target
#[derive(Debug, Clone)]
pub struct CacheWalker {
    offsets: ResolvedOffsets,
    kmem_cache: StructLayout,
    slab_caches: Address,
    per_cpu_offset: u64,
}

impl CacheWalker {
    #[must_use]
    pub fn new(context: &KernelContext) -> Self {
        Self {
            offsets: context.offsets,
            kmem_cache: context.layout.kmem_cache.clone(),
            slab_caches: context.slab_caches,
            per_cpu_offset: context.per_cpu_offset,
        }
    }

    /// Take a snapshot of every cache
    ///
    /// # Errors
    /// `MemoryFault` when the `slab_caches` list head itself is unreadable
    pub fn walk(&self, backend: &mut dyn Backend) -> Result<SlabSnapshot, BackendError> {
        let list_offset = self.offsets.cache.list.offset;
        let root = self.slab_caches.container_of(list_offset);
        let first = backend
            .read_address(self.slab_caches.offset(self.offsets.list_next.offset))?
            .container_of(list_offset);

        let mut snapshot = SlabSnapshot::default();
        snapshot.caches.push(CacheSnapshot::root(self.slab_caches, first));

        let mut visited = HashSet::new();
        let mut current = first;
        while current != root {
            if !visited.insert(current) {
                snapshot.faults.push(WalkFault {
                    kind: WalkFaultKind::Cycle,
                    cache: None,
                    address: current,
                });
                break;
            }
            let view = match backend.read_struct(current, &self.kmem_cache) {
                Ok(view) => view,
                Err(e) => {
                    log::warn!("walk stopped at kmem_cache {current}: {e}");
                    snapshot.faults.push(WalkFault {
                        kind: WalkFaultKind::MemoryFault,
                        cache: None,
                        address: current,
                    });
                    break;
                }
            };
            let cache = self.snapshot_cache(backend, &view);
            if let Some(fault) = &cache.fault {
                snapshot.faults.push(fault.clone());
            }
            current = cache.next;
            snapshot.caches.push(cache);
        }

        log::debug!(
            "walked {} caches ({} faults)",
            snapshot.entries().len(),
            snapshot.faults.len()
        );
        Ok(snapshot)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn snapshot_cache(&self, backend: &mut dyn Backend, view: &StructView) -> CacheSnapshot {
        let fields = &self.offsets.cache;
        let address = view.address;
        let object_size = view.uint(fields.object_size) as u32;
        let free_offset = view.uint(fields.offset) as u32;
        let next = view
            .address_at(FieldLayout {
                offset: fields.list.offset + self.offsets.list_next.offset,
                width: self.offsets.list_next.width,
            })
            .container_of(fields.list.offset);

        let name_ptr = view.address_at(fields.name);
        let readable_name = backend.read_cstring(name_ptr, MAX_CACHE_NAME).ok();
        let name = readable_name.clone().unwrap_or_else(|| format!("<cache@{address}>"));

        let mut snapshot = CacheSnapshot {
            name: name.clone(),
            object_size: Some(object_size),
            free_pointer_offset: Some(free_offset),
            address,
            first_free: Address::NULL,
            free_chain: Vec::new(),
            next,
            fault: None,
        };
        let mark = |kind, at| Some(WalkFault { kind, cache: Some(name.clone()), address: at });
        if readable_name.is_none() {
            snapshot.fault = mark(WalkFaultKind::MemoryFault, name_ptr);
            return snapshot;
        }

        let per_cpu = view.address_at(fields.cpu_slab).offset(self.per_cpu_offset);
        let first_free = match backend.read_address(per_cpu.offset(self.offsets.freelist.offset)) {
            Ok(first) => first,
            Err(_) => {
                snapshot.fault = mark(WalkFaultKind::MemoryFault, per_cpu);
                return snapshot;
            }
        };
        snapshot.first_free = first_free;

        if let Some(size) = fields.size.map(|f| view.uint(f)) {
            if u64::from(free_offset) + FREE_POINTER_WIDTH > size {
                log::warn!("{name}: free pointer offset {free_offset} outside {size}-byte slot");
                snapshot.fault = mark(WalkFaultKind::SuspectLayout, address);
                return snapshot;
            }
        }

        let random = fields.random.map(|f| view.uint(f));
        let (chain, chain_fault) = follow_chain(backend, first_free, u64::from(free_offset), random);
        snapshot.free_chain = chain;
        if let Some((kind, at)) = chain_fault {
            snapshot.fault = mark(kind, at);
        }
        snapshot
    }
}

/// Follow `next = *(obj + offset)` from `head` until NULL
///
/// With `random` set the stored pointers are hardened:
/// `stored ^ random ^ swab64(slot address)`.
fn follow_chain(
    backend: &mut dyn Backend,
    head: Address,
    offset: u64,
    random: Option<u64>,
) -> (Vec<Address>, Option<(WalkFaultKind, Address)>) {
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut current = head;
    while !current.is_null() {
        if !seen.insert(current) {
            return (chain, Some((WalkFaultKind::Cycle, current)));
        }
        chain.push(current);
        let slot = current.offset(offset);
        let stored = match backend.read_u64(slot) {
            Ok(stored) => stored,
            Err(_) => return (chain, Some((WalkFaultKind::MemoryFault, slot))),
        };
        current = Address(decode_free_pointer(stored, random, slot));
    }
    (chain, None)
}

/// Undo CONFIG_SLAB_FREELIST_HARDENED obfuscation
#[must_use]
pub fn decode_free_pointer(stored: u64, random: Option<u64>, slot: Address) -> u64 {
    match random {
        Some(random) => stored ^ random ^ slot.0.swap_bytes(),
        None => stored,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_free_pointer_roundtrip() {
        let slot = Address(0xffff_8880_0123_4568);
        let random = 0x5a5a_1234_dead_beef;
        let next = 0xffff_8880_0123_4600u64;
        let stored = next ^ random ^ slot.0.swap_bytes();
        assert_eq!(decode_free_pointer(stored, Some(random), slot), next);
        assert_eq!(decode_free_pointer(next, None, slot), next);
    }

    #[test]
    fn test_select_keeps_root() {
        let mut snapshot = SlabSnapshot::default();
        snapshot.caches.push(CacheSnapshot::root(Address(0x100), Address(0x200)));
        for name in ["kmalloc-64", "dentry"] {
            snapshot.caches.push(CacheSnapshot {
                name: name.into(),
                object_size: Some(64),
                free_pointer_offset: Some(0),
                address: Address(0x200),
                first_free: Address::NULL,
                free_chain: vec![],
                next: Address(0x100),
                fault: None,
            });
        }
        let targets = vec!["dentry".to_string()];
        let picked: Vec<&str> =
            snapshot.select(Some(&targets)).iter().map(|c| c.name.as_str()).collect();
        assert_eq!(picked, vec![ROOT_NAME, "dentry"]);
        assert_eq!(snapshot.select(None).len(), 3);
        assert!(snapshot.caches[0].is_root());
    }

    #[test]
    fn test_fault_display() {
        let fault = WalkFault {
            kind: WalkFaultKind::Cycle,
            cache: Some("kmalloc-8".into()),
            address: Address(0x40),
        };
        assert_eq!(fault.to_string(), "cycle in kmalloc-8 at 0x40");
    }
}
