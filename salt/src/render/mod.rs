//! Presentation of snapshots and events
//!
//! - [`text`]: ASCII list drawing and one-line trace sentences
//! - [`html`]: standalone page with a table per cache
//! - [`json`]: array of cache entries, root first
//!
//! Every snapshot renderer takes an optional list of cache names; the
//! `slab_caches` root is always shown.

pub mod html;
pub mod json;
pub mod text;

use clap::ValueEnum;

use crate::walker::SlabSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WalkFormat {
    Text,
    Json,
    Html,
}

/// Render `snapshot` in `format`, restricted to `targets` when given
///
/// # Errors
/// JSON serialization failure
pub fn render_snapshot(
    format: WalkFormat,
    snapshot: &SlabSnapshot,
    targets: Option<&[String]>,
) -> Result<String, serde_json::Error> {
    match format {
        WalkFormat::Text => Ok(text::render_snapshot(snapshot, targets)),
        WalkFormat::Json => json::render_snapshot(snapshot, targets),
        WalkFormat::Html => Ok(html::render_snapshot(snapshot, targets)),
    }
}
