// String formatting intentionally uses format! for clarity
#![allow(clippy::format_push_string)]

use addr2line::Context;
use anyhow::{Context as _, Result};
use std::cell::RefCell;
use std::collections::HashMap;

use crate::domain::Address;
use crate::kernel::image::DwarfReader;
use crate::kernel::KernelImage;

/// Resolves runtime kernel text addresses to source locations
///
/// Results are cached per address; allocator call sites repeat heavily.
pub struct Symbolizer {
    ctx: Context<DwarfReader>,
    slide: u64,
    cache: RefCell<HashMap<u64, ResolvedFrame>>,
}

impl std::fmt::Debug for Symbolizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Symbolizer")
            .field("slide", &format_args!("{:#x}", self.slide))
            .field("cached", &self.cache.borrow().len())
            .finish_non_exhaustive()
    }
}

impl Symbolizer {
    /// # Errors
    /// The image's DWARF sections cannot be loaded
    pub fn new(image: &KernelImage, slide: u64) -> Result<Self> {
        let dwarf = image.dwarf().context("Failed to load vmlinux DWARF sections")?;
        let ctx = Context::from_dwarf(dwarf).context("Failed to index vmlinux debug information")?;
        Ok(Self { ctx, slide, cache: RefCell::new(HashMap::new()) })
    }

    /// Resolve a runtime address; unknown addresses give one `<unknown>` frame
    pub fn resolve(&self, address: Address) -> ResolvedFrame {
        let addr = address.0.wrapping_sub(self.slide);
        if let Some(cached) = self.cache.borrow().get(&addr) {
            return cached.clone();
        }

        let mut frames = Vec::new();
        if let Ok(mut iter) = self.ctx.find_frames(addr).skip_all_loads() {
            while let Ok(Some(frame)) = iter.next() {
                let function = frame
                    .function
                    .and_then(|f| f.raw_name().ok().map(|s| s.to_string()))
                    .unwrap_or_else(|| "<unknown>".to_string());
                let location = frame.location.map(|loc| SourceLocation {
                    file: loc.file.map(std::string::ToString::to_string),
                    line: loc.line,
                    column: loc.column,
                });
                frames.push(InlinedFrame { function, location });
            }
        }
        if frames.is_empty() {
            frames.push(InlinedFrame { function: "<unknown>".to_string(), location: None });
        }

        let resolved = ResolvedFrame { address, frames };
        self.cache.borrow_mut().insert(addr, resolved.clone());
        resolved
    }
}

/// One call site; inlined callers follow the innermost function
#[derive(Debug, Clone)]
pub struct ResolvedFrame {
    pub address: Address,
    pub frames: Vec<InlinedFrame>,
}

#[derive(Debug, Clone)]
pub struct InlinedFrame {
    pub function: String,
    pub location: Option<SourceLocation>,
}

#[derive(Debug, Clone)]
pub struct SourceLocation {
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl ResolvedFrame {
    /// Outermost non-inlined function, the one that owns the call
    #[must_use]
    pub fn function(&self) -> &str {
        self.frames.last().map_or("<unknown>", |f| f.function.as_str())
    }

    /// `function (file:line)` of the innermost frame, for one-line output
    #[must_use]
    pub fn short(&self) -> String {
        let Some(inner) = self.frames.first() else {
            return format!("{} <unknown>", self.address);
        };
        let mut out = format!("{} {}", self.address, inner.function);
        if let Some(SourceLocation { file: Some(file), line, .. }) = &inner.location {
            let base = file.rsplit('/').next().unwrap_or(file);
            out.push_str(&format!(" ({base}"));
            if let Some(line) = line {
                out.push_str(&format!(":{line}"));
            }
            out.push(')');
        }
        out
    }

    /// Multi-line rendering with every inlined frame
    #[must_use]
    pub fn format(&self) -> String {
        let mut output = String::new();
        for (idx, inlined) in self.frames.iter().enumerate() {
            if idx == 0 {
                output.push_str(&format!("{:#018x} {}", self.address.0, inlined.function));
            } else {
                output.push_str(&format!("\n  (inlined by) {}", inlined.function));
            }
            if let Some(SourceLocation { file: Some(file), line, column }) = &inlined.location {
                output.push_str(&format!("\n      at {file}"));
                if let Some(line) = line {
                    output.push_str(&format!(":{line}"));
                    if let Some(col) = column {
                        output.push_str(&format!(":{col}"));
                    }
                }
            }
        }
        output
    }
}
