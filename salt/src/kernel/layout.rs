//! Typed layout descriptors for the kernel structures salt decodes
//!
//! Layouts are resolved once at startup (from DWARF, or built by hand in tests)
//! and validated into [`ResolvedOffsets`]. Everything after that is plain offset
//! arithmetic on raw bytes read from the target.

use std::collections::BTreeMap;

use crate::domain::{Address, LayoutError};

/// Byte offset and width of one structure member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLayout {
    pub offset: u64,
    pub width: u64,
}

impl FieldLayout {
    #[must_use]
    pub fn end(self) -> u64 {
        self.offset + self.width
    }
}

/// Field name → offset/width map for one C structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructLayout {
    pub name: String,
    pub size: u64,
    fields: BTreeMap<String, FieldLayout>,
}

impl StructLayout {
    #[must_use]
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self { name: name.into(), size, fields: BTreeMap::new() }
    }

    /// Builder-style field insertion; grows `size` to cover the field
    #[must_use]
    pub fn with_field(mut self, name: &str, offset: u64, width: u64) -> Self {
        self.insert_field(name, offset, width);
        self
    }

    pub fn insert_field(&mut self, name: &str, offset: u64, width: u64) {
        let field = FieldLayout { offset, width };
        self.size = self.size.max(field.end());
        self.fields.entry(name.to_string()).or_insert(field);
    }

    /// # Errors
    /// `LayoutError::MissingField` when the structure has no such member
    pub fn field(&self, name: &str) -> Result<FieldLayout, LayoutError> {
        self.fields.get(name).copied().ok_or_else(|| LayoutError::MissingField {
            structure: self.name.clone(),
            field: name.to_string(),
        })
    }

    #[must_use]
    pub fn optional_field(&self, name: &str) -> Option<FieldLayout> {
        self.fields.get(name).copied()
    }

    /// Like [`StructLayout::field`] but also requires an integer-sized width
    ///
    /// # Errors
    /// Missing field or a width other than 1, 2, 4 or 8 bytes
    pub fn scalar_field(&self, name: &str) -> Result<FieldLayout, LayoutError> {
        let field = self.field(name)?;
        check_scalar(&self.name, name, field)?;
        Ok(field)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}

fn check_scalar(structure: &str, name: &str, field: FieldLayout) -> Result<(), LayoutError> {
    if matches!(field.width, 1 | 2 | 4 | 8) {
        Ok(())
    } else {
        Err(LayoutError::UnsupportedWidth {
            structure: structure.to_string(),
            field: name.to_string(),
            width: field.width,
        })
    }
}

/// Raw bytes of one structure instance read from the target
#[derive(Debug, Clone)]
pub struct StructView {
    pub address: Address,
    bytes: Vec<u8>,
}

impl StructView {
    #[must_use]
    pub fn new(address: Address, bytes: Vec<u8>) -> Self {
        Self { address, bytes }
    }

    /// Bytes backing `field`; empty if the field lies outside the view
    #[must_use]
    pub fn bytes(&self, field: FieldLayout) -> &[u8] {
        usize::try_from(field.offset)
            .ok()
            .zip(usize::try_from(field.end()).ok())
            .and_then(|(start, end)| self.bytes.get(start..end))
            .unwrap_or(&[])
    }

    /// Little-endian unsigned integer of the field's width
    #[must_use]
    pub fn uint(&self, field: FieldLayout) -> u64 {
        let mut buf = [0u8; 8];
        let raw = self.bytes(field);
        let len = raw.len().min(8);
        buf[..len].copy_from_slice(&raw[..len]);
        u64::from_le_bytes(buf)
    }

    #[must_use]
    pub fn address_at(&self, field: FieldLayout) -> Address {
        Address(self.uint(field))
    }

    /// NUL-terminated string stored inline (e.g. `task_struct.comm`)
    #[must_use]
    pub fn inline_str(&self, field: FieldLayout) -> String {
        let raw = self.bytes(field);
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        String::from_utf8_lossy(&raw[..end]).into_owned()
    }
}

/// Structure layouts needed by the walker and the correlator
#[derive(Debug, Clone)]
pub struct KernelLayout {
    pub list_head: StructLayout,
    pub kmem_cache: StructLayout,
    pub kmem_cache_cpu: StructLayout,
    pub task_struct: StructLayout,
    /// `struct page`, for resolving freed objects back to their cache
    pub page: Option<StructLayout>,
    /// `struct slab` (5.17+); overlays `struct page`
    pub slab: Option<StructLayout>,
    /// `struct pcpu_hot` (6.2+), where `current_task` moved on x86_64
    pub pcpu_hot: Option<StructLayout>,
}

/// Offsets of every kmem_cache member the walker reads
#[derive(Debug, Clone, Copy)]
pub struct CacheFields {
    pub list: FieldLayout,
    pub name: FieldLayout,
    pub object_size: FieldLayout,
    pub offset: FieldLayout,
    pub cpu_slab: FieldLayout,
    /// Full slot size; enables the free-pointer bounds check
    pub size: Option<FieldLayout>,
    /// Present on CONFIG_SLAB_FREELIST_HARDENED kernels
    pub random: Option<FieldLayout>,
}

/// Offsets needed to map an object pointer to its owning cache
#[derive(Debug, Clone, Copy)]
pub struct OwnerFields {
    pub page_size: u64,
    pub compound_head: FieldLayout,
    pub slab_cache: FieldLayout,
}

/// Validated, offset-only view of a [`KernelLayout`]
#[derive(Debug, Clone, Copy)]
pub struct ResolvedOffsets {
    pub list_next: FieldLayout,
    pub cache: CacheFields,
    pub freelist: FieldLayout,
    pub task_comm: FieldLayout,
    pub task_pid: FieldLayout,
    pub owner: Option<OwnerFields>,
    pub pcpu_current_task: Option<FieldLayout>,
}

impl KernelLayout {
    /// Check every required member and collapse to offsets
    ///
    /// # Errors
    /// `LayoutError::MissingField` / `UnsupportedWidth` for required members.
    /// Optional structures that are incomplete are dropped with a warning.
    pub fn resolve(&self) -> Result<ResolvedOffsets, LayoutError> {
        let kc = &self.kmem_cache;
        let cache = CacheFields {
            list: kc.field("list")?,
            name: kc.scalar_field("name")?,
            object_size: kc.scalar_field("object_size")?,
            offset: kc.scalar_field("offset")?,
            cpu_slab: kc.scalar_field("cpu_slab")?,
            size: kc.scalar_field("size").ok(),
            random: kc.scalar_field("random").ok(),
        };

        let task_comm = self.task_struct.field("comm")?;
        let task_pid = self.task_struct.scalar_field("pid")?;

        Ok(ResolvedOffsets {
            list_next: self.list_head.scalar_field("next")?,
            cache,
            freelist: self.kmem_cache_cpu.scalar_field("freelist")?,
            task_comm,
            task_pid,
            owner: self.owner_fields(),
            pcpu_current_task: self
                .pcpu_hot
                .as_ref()
                .and_then(|hot| hot.scalar_field("current_task").ok()),
        })
    }

    fn owner_fields(&self) -> Option<OwnerFields> {
        let page = self.page.as_ref()?;
        let compound_head = page.scalar_field("compound_head").ok()?;
        let slab_cache = self
            .slab
            .as_ref()
            .and_then(|slab| slab.scalar_field("slab_cache").ok())
            .or_else(|| page.scalar_field("slab_cache").ok());
        match slab_cache {
            Some(slab_cache) => Some(OwnerFields { page_size: page.size, compound_head, slab_cache }),
            None => {
                log::warn!("no slab_cache member in struct slab/page, kfree tracing disabled");
                None
            }
        }
    }
}
