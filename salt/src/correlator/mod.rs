//! # Event Correlator
//!
//! Turns raw probe hits into allocator observations. Most routines map one
//! entry hit to one observation, but `kmalloc` needs two interception points
//! tied together:
//!
//! ```text
//! __kmalloc entry ──▶ flag armed
//!                        │
//! kmalloc_slab entry ────┴─▶ flag consumed ──▶ return interception planted
//!                                                   │
//! kmalloc_slab return ◀─────────────────────────────┘
//!     rax == ZERO_SIZE_PTR  → kmalloc_zero_size
//!     rax == 0              → nothing
//!     otherwise             → kmalloc from cache *rax
//! ```
//!
//! The flag is read-then-cleared. A flag that sat armed for more than
//! [`PENDING_STOP_WINDOW`] stops (the `__kmalloc` call was served without
//! reaching `kmalloc_slab`) is discarded as stale instead of being attributed
//! to an unrelated `kmalloc_slab` call later.
//!
//! `kfree` resolves the freed object's owning cache at entry, while the
//! object is still live, and reports at return.
//!
//! The first argument is read from `rdi` (x86_64 SysV) and the result from
//! `rax`.

pub mod probes;

use serde::Serialize;
use std::collections::HashMap;

use crate::backend::{Backend, CallContext, Hit, ProbeId, ReturnToken};
use crate::domain::{Address, BackendError, EventKind};
use crate::kernel::KernelContext;
pub use probes::{Handler, Probe, ProbePoint, ProbeRegistry};

/// Returned by `kmalloc(0)` instead of a real object
pub const ZERO_SIZE_PTR: u64 = 0x10;

/// Stops an armed kmalloc flag may wait for its `kmalloc_slab`
pub const PENDING_STOP_WINDOW: u64 = 16;

/// Correlated allocator activity, before process identity and filtering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub kind: EventKind,
    /// Owning `kmem_cache`; `None` for zero-size requests
    pub cache: Option<Address>,
    pub cache_name: Option<String>,
    /// Return address into the caller of the traced routine
    pub call_site: Address,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CorrelatorStats {
    pub hits: u64,
    pub observations: u64,
    pub stale_flags: u64,
    pub unmatched_returns: u64,
    /// `kfree` calls on NULL, `ZERO_SIZE_PTR` or non-slab memory
    pub skipped_frees: u64,
}

#[derive(Debug, Clone, Copy)]
struct PendingFlag {
    armed_at: u64,
    call_site: Address,
}

#[derive(Debug, Clone)]
struct PendingFree {
    cache: Address,
    cache_name: String,
    call_site: Address,
}

#[derive(Debug)]
pub struct Correlator {
    registry: ProbeRegistry,
    flag: Option<PendingFlag>,
    kmalloc_returns: HashMap<ReturnToken, Address>,
    kfree_returns: HashMap<ReturnToken, PendingFree>,
    stops: u64,
    stats: CorrelatorStats,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    #[must_use]
    pub fn new() -> Self {
        let mut registry = ProbeRegistry::new();
        registry.register(ProbePoint::KmallocEntry, Self::on_kmalloc);
        registry.register(ProbePoint::KmallocSlabEntry, Self::on_kmalloc_slab);
        registry.register(ProbePoint::KmallocSlabReturn, Self::on_kmalloc_slab_return);
        registry.register(ProbePoint::KfreeEntry, Self::on_kfree);
        registry.register(ProbePoint::KfreeReturn, Self::on_kfree_return);
        registry.register(ProbePoint::CacheAllocEntry, Self::on_cache_alloc);
        registry.register(ProbePoint::CacheFreeEntry, Self::on_cache_free);
        registry.register(ProbePoint::NewSlabEntry, Self::on_new_slab);
        Self {
            registry,
            flag: None,
            kmalloc_returns: HashMap::new(),
            kfree_returns: HashMap::new(),
            stops: 0,
            stats: CorrelatorStats::default(),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &ProbeRegistry {
        &self.registry
    }

    #[must_use]
    pub fn stats(&self) -> CorrelatorStats {
        self.stats
    }

    /// The kmalloc correlation flag is armed
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.flag.is_some()
    }

    /// Plant every entry probe
    ///
    /// Routines missing from this kernel are skipped with a warning; the
    /// names of the armed ones are returned.
    ///
    /// # Errors
    /// Backend failure other than a missing symbol
    pub fn arm(&self, backend: &mut dyn Backend) -> Result<Vec<&'static str>, BackendError> {
        let mut armed = Vec::new();
        for (id, symbol) in self.registry.entry_points() {
            match backend.intercept_entry(symbol, id) {
                Ok(()) => armed.push(symbol),
                Err(BackendError::SymbolNotFound(_)) => {
                    log::warn!("{symbol} not found, its events will not be traced");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(armed)
    }

    /// Run the handler bound to the fired probe
    ///
    /// # Errors
    /// Backend failures inside the handler (register or memory reads)
    pub fn on_hit(
        &mut self,
        backend: &mut dyn Backend,
        context: &KernelContext,
        hit: &Hit,
    ) -> Result<Option<Observation>, BackendError> {
        self.stops += 1;
        self.stats.hits += 1;
        let Some(probe) = self.registry.get(hit.probe()) else {
            log::debug!("hit on unregistered probe {}", hit.probe().0);
            return Ok(None);
        };
        let observation = (probe.handler)(self, backend, context, hit)?;
        if observation.is_some() {
            self.stats.observations += 1;
        }
        Ok(observation)
    }

    fn probe_id(&self, point: ProbePoint) -> Result<ProbeId, BackendError> {
        self.registry
            .id_of(point)
            .ok_or_else(|| BackendError::Protocol(format!("probe {point:?} not registered")))
    }

    fn plant_return(
        &self,
        backend: &mut dyn Backend,
        call: &CallContext,
        point: ProbePoint,
    ) -> Result<ReturnToken, BackendError> {
        let id = self.probe_id(point)?;
        backend.intercept_return(call, id)
    }

    fn on_kmalloc(
        &mut self,
        _backend: &mut dyn Backend,
        _context: &KernelContext,
        hit: &Hit,
    ) -> Result<Option<Observation>, BackendError> {
        if let Hit::Entry { call, .. } = hit {
            if self.flag.is_some() {
                log::debug!("kmalloc flag re-armed before kmalloc_slab");
            }
            self.flag = Some(PendingFlag { armed_at: self.stops, call_site: call.return_address });
        }
        Ok(None)
    }

    fn on_kmalloc_slab(
        &mut self,
        backend: &mut dyn Backend,
        _context: &KernelContext,
        hit: &Hit,
    ) -> Result<Option<Observation>, BackendError> {
        let Hit::Entry { call, .. } = hit else {
            return Ok(None);
        };
        let Some(flag) = self.flag.take() else {
            return Ok(None);
        };
        if self.stops - flag.armed_at > PENDING_STOP_WINDOW {
            self.stats.stale_flags += 1;
            log::debug!("discarding kmalloc flag armed {} stops ago", self.stops - flag.armed_at);
            return Ok(None);
        }
        let token = self.plant_return(backend, call, ProbePoint::KmallocSlabReturn)?;
        self.kmalloc_returns.insert(token, flag.call_site);
        Ok(None)
    }

    fn on_kmalloc_slab_return(
        &mut self,
        backend: &mut dyn Backend,
        context: &KernelContext,
        hit: &Hit,
    ) -> Result<Option<Observation>, BackendError> {
        let Hit::Return { token, .. } = hit else {
            return Ok(None);
        };
        let Some(call_site) = self.kmalloc_returns.remove(token) else {
            self.stats.unmatched_returns += 1;
            return Ok(None);
        };
        let rax = backend.current_registers()?.require("rax")?;
        match rax {
            0 => Ok(None),
            ZERO_SIZE_PTR => Ok(Some(Observation {
                kind: EventKind::KmallocZeroSize,
                cache: None,
                cache_name: None,
                call_site,
            })),
            cache => {
                let cache = Address(cache);
                let name = context.cache_name(backend, cache)?;
                Ok(Some(Observation {
                    kind: EventKind::Kmalloc,
                    cache: Some(cache),
                    cache_name: Some(name),
                    call_site,
                }))
            }
        }
    }

    fn on_kfree(
        &mut self,
        backend: &mut dyn Backend,
        context: &KernelContext,
        hit: &Hit,
    ) -> Result<Option<Observation>, BackendError> {
        let Hit::Entry { call, .. } = hit else {
            return Ok(None);
        };
        let object = Address(backend.current_registers()?.require("rdi")?);
        if object.0 <= ZERO_SIZE_PTR {
            self.stats.skipped_frees += 1;
            return Ok(None);
        }
        let owner = context
            .object_cache(backend, object)
            .ok()
            .flatten()
            .and_then(|cache| context.cache_name(backend, cache).ok().map(|name| (cache, name)));
        let Some((cache, cache_name)) = owner else {
            log::debug!("kfree({object}) is not a slab object");
            self.stats.skipped_frees += 1;
            return Ok(None);
        };
        let token = self.plant_return(backend, call, ProbePoint::KfreeReturn)?;
        self.kfree_returns
            .insert(token, PendingFree { cache, cache_name, call_site: call.return_address });
        Ok(None)
    }

    fn on_kfree_return(
        &mut self,
        _backend: &mut dyn Backend,
        _context: &KernelContext,
        hit: &Hit,
    ) -> Result<Option<Observation>, BackendError> {
        let Hit::Return { token, .. } = hit else {
            return Ok(None);
        };
        let Some(free) = self.kfree_returns.remove(token) else {
            self.stats.unmatched_returns += 1;
            return Ok(None);
        };
        Ok(Some(Observation {
            kind: EventKind::Kfree,
            cache: Some(free.cache),
            cache_name: Some(free.cache_name),
            call_site: free.call_site,
        }))
    }

    /// Shared by the routines whose first argument is the `kmem_cache`
    fn cache_argument(
        kind: EventKind,
        backend: &mut dyn Backend,
        context: &KernelContext,
        hit: &Hit,
    ) -> Result<Option<Observation>, BackendError> {
        let Hit::Entry { call, .. } = hit else {
            return Ok(None);
        };
        let cache = Address(backend.current_registers()?.require("rdi")?);
        let name = context.cache_name(backend, cache)?;
        Ok(Some(Observation {
            kind,
            cache: Some(cache),
            cache_name: Some(name),
            call_site: call.return_address,
        }))
    }

    fn on_cache_alloc(
        &mut self,
        backend: &mut dyn Backend,
        context: &KernelContext,
        hit: &Hit,
    ) -> Result<Option<Observation>, BackendError> {
        Self::cache_argument(EventKind::CacheAlloc, backend, context, hit)
    }

    fn on_cache_free(
        &mut self,
        backend: &mut dyn Backend,
        context: &KernelContext,
        hit: &Hit,
    ) -> Result<Option<Observation>, BackendError> {
        Self::cache_argument(EventKind::CacheFree, backend, context, hit)
    }

    fn on_new_slab(
        &mut self,
        backend: &mut dyn Backend,
        context: &KernelContext,
        hit: &Hit,
    ) -> Result<Option<Observation>, BackendError> {
        Self::cache_argument(EventKind::NewSlab, backend, context, hit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_point_registered() {
        let correlator = Correlator::new();
        assert_eq!(correlator.registry().len(), 8);
        let symbols: Vec<_> = correlator.registry().entry_points().map(|(_, s)| s).collect();
        assert_eq!(
            symbols,
            vec!["__kmalloc", "kmalloc_slab", "kfree", "kmem_cache_alloc", "kmem_cache_free", "new_slab"]
        );
    }

    #[test]
    fn test_stats_serialize() {
        let json = serde_json::to_string(&CorrelatorStats::default()).unwrap();
        assert!(json.contains("\"stale_flags\":0"));
    }
}
