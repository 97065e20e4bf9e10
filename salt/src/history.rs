//! # History/Recorder
//!
//! Ordered log of accepted events, appended only while recording is on.
//!
//! There is no capacity bound. A long recording session on a busy kernel
//! grows this without limit; clear it (`record clear`) or export and restart
//! when that matters.

use crate::domain::AllocationEvent;

#[derive(Debug, Clone, Default)]
pub struct History {
    events: Vec<AllocationEvent>,
    recording: bool,
}

impl History {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_recording(&mut self, on: bool) {
        self.recording = on;
    }

    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Append `event` when recording; returns whether it was kept
    pub fn record(&mut self, event: &AllocationEvent) -> bool {
        if self.recording {
            self.events.push(event.clone());
        }
        self.recording
    }

    #[must_use]
    pub fn events(&self) -> &[AllocationEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
