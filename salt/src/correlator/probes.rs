//! Probe registry: interception points bound to handler functions
//!
//! Every allocator routine salt watches is a [`ProbePoint`]. Registering a
//! point hands out the [`ProbeId`] the backend reports when it fires; the
//! session looks the id up here and calls the bound handler while the target
//! is still halted.

use std::collections::{BTreeMap, HashMap};

use super::{Correlator, Observation};
use crate::backend::{Backend, Hit, ProbeId};
use crate::domain::BackendError;
use crate::kernel::KernelContext;

/// Handler invoked synchronously for a fired probe
pub type Handler = fn(
    &mut Correlator,
    &mut dyn Backend,
    &KernelContext,
    &Hit,
) -> Result<Option<Observation>, BackendError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProbePoint {
    /// `__kmalloc` entry: arms the correlation flag
    KmallocEntry,
    /// `kmalloc_slab` entry: consumes the flag
    KmallocSlabEntry,
    /// Return of a flagged `kmalloc_slab` invocation
    KmallocSlabReturn,
    KfreeEntry,
    KfreeReturn,
    CacheAllocEntry,
    CacheFreeEntry,
    NewSlabEntry,
}

impl ProbePoint {
    /// Kernel routine for entry probes; `None` for return probes
    #[must_use]
    pub fn symbol(self) -> Option<&'static str> {
        match self {
            ProbePoint::KmallocEntry => Some("__kmalloc"),
            ProbePoint::KmallocSlabEntry => Some("kmalloc_slab"),
            ProbePoint::KfreeEntry => Some("kfree"),
            ProbePoint::CacheAllocEntry => Some("kmem_cache_alloc"),
            ProbePoint::CacheFreeEntry => Some("kmem_cache_free"),
            ProbePoint::NewSlabEntry => Some("new_slab"),
            ProbePoint::KmallocSlabReturn | ProbePoint::KfreeReturn => None,
        }
    }
}

#[derive(Clone, Copy)]
pub struct Probe {
    pub point: ProbePoint,
    pub handler: Handler,
}

impl std::fmt::Debug for Probe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Probe").field("point", &self.point).finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct ProbeRegistry {
    probes: BTreeMap<ProbeId, Probe>,
    by_point: HashMap<ProbePoint, ProbeId>,
}

impl ProbeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `point`; re-registering replaces the handler
    pub fn register(&mut self, point: ProbePoint, handler: Handler) -> ProbeId {
        if let Some(&id) = self.by_point.get(&point) {
            self.probes.insert(id, Probe { point, handler });
            return id;
        }
        let id = ProbeId(u32::try_from(self.probes.len()).unwrap_or(u32::MAX));
        self.probes.insert(id, Probe { point, handler });
        self.by_point.insert(point, id);
        id
    }

    #[must_use]
    pub fn get(&self, id: ProbeId) -> Option<Probe> {
        self.probes.get(&id).copied()
    }

    #[must_use]
    pub fn id_of(&self, point: ProbePoint) -> Option<ProbeId> {
        self.by_point.get(&point).copied()
    }

    /// Registered entry probes with their kernel symbols
    pub fn entry_points(&self) -> impl Iterator<Item = (ProbeId, &'static str)> + '_ {
        self.probes.iter().filter_map(|(id, p)| p.point.symbol().map(|s| (*id, s)))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.probes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(
        _: &mut Correlator,
        _: &mut dyn Backend,
        _: &KernelContext,
        _: &Hit,
    ) -> Result<Option<Observation>, BackendError> {
        Ok(None)
    }

    #[test]
    fn test_register_is_idempotent_per_point() {
        let mut registry = ProbeRegistry::new();
        let a = registry.register(ProbePoint::KfreeEntry, noop);
        let b = registry.register(ProbePoint::KfreeReturn, noop);
        assert_ne!(a, b);
        assert_eq!(registry.register(ProbePoint::KfreeEntry, noop), a);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.id_of(ProbePoint::KfreeReturn), Some(b));
    }

    #[test]
    fn test_entry_points_skip_returns() {
        let mut registry = ProbeRegistry::new();
        registry.register(ProbePoint::KmallocSlabReturn, noop);
        let id = registry.register(ProbePoint::NewSlabEntry, noop);
        let entries: Vec<_> = registry.entry_points().collect();
        assert_eq!(entries, vec![(id, "new_slab")]);
    }
}
