//! Single-page HTML rendering of a snapshot
//!
//! One table per cache; caches with free objects get a button that shows
//! or hides the chain.

#![allow(clippy::format_push_string)]

use crate::walker::{CacheSnapshot, SlabSnapshot};

const HEADER: &str = "<html> <body> <style> th, .mytd { padding:10px; border: 1px solid black; \
border-collapse: collapse; } th { text-align:center; } </style>\n\n";
const BREAK: &str = "\n<br></br>\n";

#[must_use]
pub fn render_snapshot(snapshot: &SlabSnapshot, targets: Option<&[String]>) -> String {
    let mut out = String::from(HEADER);
    out.push_str("<table width=\"300px\">\n<tr><th colspan=\"4\">slab_caches</th></tr>\n</table>");
    out.push_str(BREAK);

    for (n, cache) in snapshot.select(targets).into_iter().skip(1).enumerate() {
        if cache.free_chain.is_empty() {
            out.push_str(&summary_table(cache));
            out.push_str(BREAK);
            continue;
        }
        out.push_str("<table><tr><td>\n");
        out.push_str(&summary_table(cache));
        out.push_str("</td>\n");
        out.push_str(&format!(
            "<td><table width=\"50px\"><tr><button title=\"Click to show/hide content\" type=\"button\" \
onclick=\"var s=document.getElementById('spoiler{n}'); s.style.display = s.style.display=='none' ? '' : 'none'\">\
Show/hide freelist</button>\n</tr></table></td>\n"
        ));
        out.push_str(&format!("<td><div id=\"spoiler{n}\" style=\"display:none\">\n<table>"));
        for object in &cache.free_chain {
            out.push_str(&format!("\n<td class=\"mytd\">{object}</td>"));
        }
        out.push_str("\n</table></div></td></tr></table>");
        out.push_str(BREAK);
    }

    if snapshot.is_partial() {
        out.push_str("<p>partial snapshot:</p>\n<ul>\n");
        for fault in &snapshot.faults {
            out.push_str(&format!("<li>{}</li>\n", escape(&fault.to_string())));
        }
        out.push_str("</ul>\n");
    }
    out.push_str("\n\n</body></html>\n");
    out
}

fn summary_table(cache: &CacheSnapshot) -> String {
    let number = |v: Option<u32>| v.map_or_else(|| "?".to_string(), |v| v.to_string());
    format!(
        "<table width=\"300px\">\n\
<tr><th colspan=\"4\">{}</th></tr>\n\
<tr><td class=\"mytd\">size</td><td class=\"mytd\">{}</td><td class=\"mytd\">offset</td><td class=\"mytd\">{}</td></tr>\n\
<tr><td class=\"mytd\">freelist</td><td class=\"mytd\" colspan=\"3\">{}</td></tr>\n\
<tr><td class=\"mytd\">next</td><td class=\"mytd\" colspan=\"3\">{}</td></tr>\n\
</table>",
        escape(&cache.name),
        number(cache.object_size),
        number(cache.free_pointer_offset),
        cache.first_free,
        cache.next
    )
}

/// Cache names come from target memory
fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
