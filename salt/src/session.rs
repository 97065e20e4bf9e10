//! Tracing session
//!
//! Owns everything that used to be process-wide state in a tracer: the
//! resolved kernel context, the filter, the history and the correlator's
//! pending state. Several sessions can coexist (tests build one per case).
//! The backend is passed into each call, so the caller keeps control of
//! resuming and halting the target.

use serde::Serialize;

use crate::backend::{Backend, Hit};
use crate::correlator::{Correlator, CorrelatorStats};
use crate::domain::{AllocationEvent, BackendError, SessionError};
use crate::filter::{FilterEngine, FilterRule};
use crate::history::History;
use crate::kernel::{KernelContext, KernelLayout};
use crate::walker::{CacheWalker, SlabSnapshot};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Events that passed the filter
    pub accepted: u64,
    /// Events the filter rejected
    pub filtered: u64,
    /// Hits whose handling failed on a backend error
    pub failed: u64,
}

#[derive(Debug)]
pub struct Session {
    context: KernelContext,
    walker: CacheWalker,
    filter: FilterEngine,
    history: History,
    correlator: Correlator,
    armed: Vec<&'static str>,
    stats: SessionStats,
}

impl Session {
    /// Resolve the kernel context and plant every entry probe
    ///
    /// # Errors
    /// Layout validation, missing required symbols, or a backend failure
    /// while planting probes
    pub fn new(backend: &mut dyn Backend, layout: KernelLayout) -> Result<Self, SessionError> {
        let context = KernelContext::discover(backend, layout)?;
        let correlator = Correlator::new();
        let armed = correlator.arm(backend)?;
        log::info!("armed {} probes: {}", armed.len(), armed.join(", "));
        Ok(Self {
            walker: CacheWalker::new(&context),
            context,
            filter: FilterEngine::new(),
            history: History::new(),
            correlator,
            armed,
            stats: SessionStats::default(),
        })
    }

    #[must_use]
    pub fn context(&self) -> &KernelContext {
        &self.context
    }

    /// Routines whose entry probes were planted
    #[must_use]
    pub fn armed_probes(&self) -> &[&'static str] {
        &self.armed
    }

    /// # Errors
    /// `MemoryFault` when the `slab_caches` head is unreadable
    pub fn walk(&self, backend: &mut dyn Backend) -> Result<SlabSnapshot, BackendError> {
        self.walker.walk(backend)
    }

    #[must_use]
    pub fn current_filter(&self) -> FilterRule {
        self.filter.current_filter()
    }

    pub fn set_filter(&mut self, rule: FilterRule) {
        self.filter.set_filter(rule);
    }

    #[must_use]
    pub fn filter(&self) -> &FilterEngine {
        &self.filter
    }

    pub fn filter_mut(&mut self) -> &mut FilterEngine {
        &mut self.filter
    }

    #[must_use]
    pub fn history(&self) -> &[AllocationEvent] {
        self.history.events()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub fn set_recording(&mut self, on: bool) {
        self.history.set_recording(on);
    }

    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.history.is_recording()
    }

    /// Follow only `processes`: filter reset and enabled with just these
    /// names, history cleared, recording on
    pub fn trace_processes(&mut self, processes: &[String]) {
        self.filter.reset();
        for name in processes {
            self.filter.add_process(name);
        }
        self.filter.enable();
        self.history.clear();
        self.history.set_recording(true);
    }

    #[must_use]
    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// A `__kmalloc` entry is waiting for its `kmalloc_slab`
    #[must_use]
    pub fn kmalloc_pending(&self) -> bool {
        self.correlator.is_armed()
    }

    #[must_use]
    pub fn correlator_stats(&self) -> CorrelatorStats {
        self.correlator.stats()
    }

    /// Handle one fired probe while the target is halted
    ///
    /// Returns the event when it passed the filter (and was recorded if
    /// recording is on).
    ///
    /// # Errors
    /// Backend failure reading registers or target memory
    pub fn dispatch(
        &mut self,
        backend: &mut dyn Backend,
        hit: &Hit,
    ) -> Result<Option<AllocationEvent>, SessionError> {
        let observation = match self.correlator.on_hit(backend, &self.context, hit) {
            Ok(Some(observation)) => observation,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.stats.failed += 1;
                return Err(e.into());
            }
        };
        let task = self.context.current_task(backend).inspect_err(|_| self.stats.failed += 1)?;

        if !self.filter.evaluate(&task.name, observation.cache_name.as_deref()) {
            self.stats.filtered += 1;
            return Ok(None);
        }
        let event = AllocationEvent {
            kind: observation.kind,
            cache_name: observation.cache_name,
            process_name: task.name,
            pid: task.pid,
            call_site: Some(observation.call_site),
        };
        self.history.record(&event);
        self.stats.accepted += 1;
        Ok(Some(event))
    }
}
