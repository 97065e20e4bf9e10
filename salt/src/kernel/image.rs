//! vmlinux ELF image: symbol table and DWARF sections

use gimli::{EndianRcSlice, RunTimeEndian};
use object::{Object, ObjectSection, ObjectSymbol, SymbolKind};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::domain::{Address, LayoutError};

/// DWARF reader type shared by layout discovery and the symbolizer
pub type DwarfReader = EndianRcSlice<RunTimeEndian>;

/// Section holding per-CPU variables; their "addresses" are offsets into
/// each CPU's area and are never relocated by KASLR
const PERCPU_SECTION: &str = ".data..percpu";

#[derive(Debug, Clone, Copy)]
struct SymbolEntry {
    address: u64,
    relocatable: bool,
    global: bool,
}

/// Name → link-time address, plus the KASLR slide applied on lookup
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: HashMap<String, SymbolEntry>,
    slide: u64,
}

impl SymbolTable {
    #[must_use]
    pub fn with_slide(mut self, slide: u64) -> Self {
        self.slide = slide;
        self
    }

    pub fn insert(&mut self, name: &str, address: u64, relocatable: bool, global: bool) {
        let entry = SymbolEntry { address, relocatable, global };
        match self.symbols.get(name) {
            // a global definition beats a file-local one of the same name
            Some(existing) if existing.global || !global => {}
            _ => {
                self.symbols.insert(name.to_string(), entry);
            }
        }
    }

    /// Runtime address of `name`
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Address> {
        self.symbols.get(name).map(|entry| {
            if entry.relocatable {
                Address(entry.address.wrapping_add(self.slide))
            } else {
                Address(entry.address)
            }
        })
    }

    #[must_use]
    pub fn slide(&self) -> u64 {
        self.slide
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// Raw bytes of a vmlinux with debug info
pub struct KernelImage {
    path: PathBuf,
    data: Vec<u8>,
}

impl KernelImage {
    /// # Errors
    /// The file cannot be read or is not a parseable object file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LayoutError> {
        let path = path.as_ref().to_path_buf();
        let data = fs::read(&path)
            .map_err(|e| LayoutError::Object(format!("{}: {e}", path.display())))?;
        object::File::parse(&*data)
            .map_err(|e| LayoutError::Object(format!("{}: {e}", path.display())))?;
        Ok(Self { path, data })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse(&self) -> Result<object::File<'_>, LayoutError> {
        object::File::parse(&*self.data).map_err(|e| LayoutError::Object(e.to_string()))
    }

    /// Collect function and data symbols from `.symtab`
    ///
    /// # Errors
    /// `LayoutError::Object` if the ELF cannot be parsed
    pub fn symbols(&self) -> Result<SymbolTable, LayoutError> {
        let obj = self.parse()?;
        let mut table = SymbolTable::default();
        for sym in obj.symbols() {
            if !matches!(sym.kind(), SymbolKind::Text | SymbolKind::Data | SymbolKind::Unknown) {
                continue;
            }
            let Ok(name) = sym.name() else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            let percpu = sym
                .section_index()
                .and_then(|idx| obj.section_by_index(idx).ok())
                .and_then(|section| section.name().ok().map(|n| n == PERCPU_SECTION))
                .unwrap_or(false);
            table.insert(name, sym.address(), !percpu, sym.is_global());
        }
        log::info!("loaded {} symbols from {}", table.len(), self.path.display());
        Ok(table)
    }

    /// `.debug_info` is present and non-empty
    #[must_use]
    pub fn has_debug_info(&self) -> bool {
        self.parse()
            .ok()
            .and_then(|obj| obj.section_by_name(".debug_info").map(|s| s.size() > 0))
            .unwrap_or(false)
    }

    /// Load all DWARF sections
    ///
    /// # Errors
    /// `LayoutError::Object` / `LayoutError::Dwarf`
    pub fn dwarf(&self) -> Result<gimli::Dwarf<DwarfReader>, LayoutError> {
        let obj = self.parse()?;
        let endian = if obj.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };

        let load_section = |id: gimli::SectionId| -> Result<DwarfReader, gimli::Error> {
            let data = obj
                .section_by_name(id.name())
                .and_then(|section| section.uncompressed_data().ok())
                .unwrap_or(std::borrow::Cow::Borrowed(&[][..]));
            Ok(EndianRcSlice::new(Rc::from(&*data), endian))
        };

        Ok(gimli::Dwarf::load(&load_section)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slide_skips_percpu_symbols() {
        let mut table = SymbolTable::default();
        table.insert("slab_caches", 0xffff_ffff_8200_0000, true, true);
        table.insert("current_task", 0x1fbc0, false, true);
        let table = table.with_slide(0x1000_0000);
        assert_eq!(table.lookup("slab_caches"), Some(Address(0xffff_ffff_9200_0000)));
        assert_eq!(table.lookup("current_task"), Some(Address(0x1fbc0)));
        assert_eq!(table.lookup("missing"), None);
    }

    #[test]
    fn test_global_symbol_wins() {
        let mut table = SymbolTable::default();
        table.insert("new_slab", 0x10, true, false);
        table.insert("new_slab", 0x20, true, true);
        table.insert("new_slab", 0x30, true, false);
        assert_eq!(table.lookup("new_slab"), Some(Address(0x20)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = KernelImage::load("/nonexistent/vmlinux").err().unwrap();
        assert!(err.to_string().contains("/nonexistent/vmlinux"));
    }

    #[test]
    fn test_load_own_binary() {
        // any ELF works for the symbol table path
        let exe = std::env::current_exe().unwrap();
        let image = KernelImage::load(&exe).unwrap();
        let symbols = image.symbols().unwrap();
        assert!(!symbols.is_empty());
    }
}
