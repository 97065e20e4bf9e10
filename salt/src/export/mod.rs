//! History export
//!
//! Writes the recorded events as one pretty-printed JSON document:
//!
//! ```json
//! {
//!   "events": [
//!     { "kind": "kmalloc", "cache_name": "kmalloc-64", "process_name": "bash", "pid": 812,
//!       "call_site": "0xffffffff8123abcd", "caller": "alloc_pipe_info (pipe.c:790)" }
//!   ],
//!   "count": 1
//! }
//! ```
//!
//! `caller` is present only when a [`Symbolizer`] is attached.

use serde::Serialize;
use std::io::Write;

use crate::domain::{AllocationEvent, ExportError};
use crate::symbolization::Symbolizer;

#[derive(Serialize)]
struct ExportedEvent<'a> {
    #[serde(flatten)]
    event: &'a AllocationEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    caller: Option<String>,
}

#[derive(Serialize)]
struct ExportDocument<'a> {
    events: Vec<ExportedEvent<'a>>,
    count: usize,
}

pub struct HistoryExporter<'a> {
    events: &'a [AllocationEvent],
    symbolizer: Option<&'a Symbolizer>,
}

impl<'a> HistoryExporter<'a> {
    #[must_use]
    pub fn new(events: &'a [AllocationEvent]) -> Self {
        Self { events, symbolizer: None }
    }

    /// Annotate each event's call site with its calling function
    #[must_use]
    pub fn with_symbolizer(mut self, symbolizer: &'a Symbolizer) -> Self {
        self.symbolizer = Some(symbolizer);
        self
    }

    /// # Errors
    /// Serialization or write failure on `writer`
    pub fn export<W: Write>(&self, mut writer: W) -> Result<(), ExportError> {
        let events: Vec<ExportedEvent<'_>> = self
            .events
            .iter()
            .map(|event| ExportedEvent {
                event,
                caller: self.symbolizer.zip(event.call_site).map(|(s, site)| s.resolve(site).short()),
            })
            .collect();
        let document = ExportDocument { count: events.len(), events };
        serde_json::to_writer_pretty(&mut writer, &document)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}
