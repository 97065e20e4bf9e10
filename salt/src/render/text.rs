// String formatting intentionally uses format! for clarity
#![allow(clippy::format_push_string)]

use crate::correlator::CorrelatorStats;
use crate::domain::{AllocationEvent, EventKind};
use crate::session::SessionStats;
use crate::walker::SlabSnapshot;

const RAIL: &str = " |             |";
const ARROW: &str = " |             v";
const GAP: &str = " |            ...";

/// ASCII drawing of the cache list, following `next` down the page
#[must_use]
pub fn render_snapshot(snapshot: &SlabSnapshot, targets: Option<&[String]>) -> String {
    let mut out = String::new();
    out.push_str("  --------------\n");
    out.push_str(RAIL);
    out.push('\n');
    out.push_str(" |        slab_caches\n");
    out.push_str(RAIL);
    out.push('\n');
    if targets.is_some() {
        out.push_str(GAP);
        out.push('\n');
        out.push_str(RAIL);
        out.push('\n');
    }
    out.push_str(ARROW);
    out.push('\n');

    for cache in snapshot.select(targets).into_iter().skip(1) {
        out.push_str(&format!(" |   name: {}\n", cache.name));
        if let (Some(size), Some(offset)) = (cache.object_size, cache.free_pointer_offset) {
            out.push_str(&format!(" |   size: {size}  offset: {offset}\n"));
        }
        out.push_str(&format!(" |   first_free: {}\n", cache.first_free));
        let mut chain = cache.free_chain.iter();
        if let Some(head) = chain.next() {
            out.push_str(&format!(" |   freelist: {head}\n"));
        }
        for object in chain {
            out.push_str(&format!(" |             {object}\n"));
        }
        if let Some(fault) = &cache.fault {
            out.push_str(&format!(" |   fault: {fault}\n"));
        }
        out.push_str(&format!(" |   next: {}\n", cache.next));
        out.push_str(RAIL);
        out.push('\n');
        if targets.is_some() {
            out.push_str(GAP);
            out.push('\n');
        }
        out.push_str(ARROW);
        out.push('\n');
    }
    out.push_str("  <-------------\n");

    if snapshot.is_partial() {
        out.push_str(&format!("partial snapshot, {} fault(s):\n", snapshot.faults.len()));
        for fault in &snapshot.faults {
            out.push_str(&format!("  {fault}\n"));
        }
    }
    out
}

/// One-sentence description of an accepted event
#[must_use]
pub fn trace_line(event: &AllocationEvent) -> String {
    let who = format!("process \"{}\", pid {}", event.process_name, event.pid.0);
    let cache = event.cache_name.as_deref().unwrap_or("?");
    match event.kind {
        EventKind::KmallocZeroSize => format!("kmalloc has been called with argument size=0 by {who}"),
        EventKind::Kmalloc => format!("kmalloc is accessing cache {cache} on behalf of {who}"),
        EventKind::Kfree => format!("kfree is freeing an object from cache {cache} on behalf of {who}"),
        EventKind::CacheAlloc => {
            format!("kmem_cache_alloc is accessing cache {cache} on behalf of {who}")
        }
        EventKind::CacheFree => {
            format!("kmem_cache_free is freeing from cache {cache} on behalf of {who}")
        }
        EventKind::NewSlab => format!("a new slab is being created for {cache} on behalf of {who}"),
    }
}

/// Row of `record show`
#[must_use]
pub fn history_line(index: usize, event: &AllocationEvent) -> String {
    format!(
        "{index:>5}  {:<18} {:<24} {:<16} {}",
        event.kind.label(),
        event.cache_name.as_deref().unwrap_or("-"),
        event.process_name,
        event.pid
    )
}

/// `stats` report
#[must_use]
pub fn stats_lines(session: &SessionStats, correlator: &CorrelatorStats, recorded: usize) -> Vec<String> {
    vec![
        format!("probe hits:        {}", correlator.hits),
        format!("observations:      {}", correlator.observations),
        format!("accepted:          {}", session.accepted),
        format!("filtered out:      {}", session.filtered),
        format!("failed:            {}", session.failed),
        format!("stale kmalloc:     {}", correlator.stale_flags),
        format!("unmatched returns: {}", correlator.unmatched_returns),
        format!("skipped kfree:     {}", correlator.skipped_frees),
        format!("recorded:          {recorded}"),
    ]
}
