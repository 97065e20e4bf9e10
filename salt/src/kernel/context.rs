//! Symbols and offsets resolved once per session
//!
//! Everything here is read from the target at most once during
//! [`KernelContext::discover`]; afterwards the walker and the correlator only
//! do offset arithmetic plus the reads they actually need.

use super::layout::{FieldLayout, KernelLayout, ResolvedOffsets, StructView};
use crate::backend::Backend;
use crate::domain::{Address, BackendError, Pid, SessionError};

/// Longest cache name salt will read; kernel names are far shorter
pub const MAX_CACHE_NAME: usize = 64;

/// x86_64 direct map base without KASLR memory randomization
const DEFAULT_PAGE_OFFSET_BASE: u64 = 0xffff_8880_0000_0000;
/// x86_64 `struct page` array base without KASLR memory randomization
const DEFAULT_VMEMMAP_BASE: u64 = 0xffff_ea00_0000_0000;

const PAGE_SHIFT: u64 = 12;

/// Name and PID of the task that was current when the target stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskIdentity {
    pub name: String,
    pub pid: Pid,
}

#[derive(Debug, Clone)]
pub struct KernelContext {
    pub layout: KernelLayout,
    pub offsets: ResolvedOffsets,
    /// Address of the `slab_caches` list head
    pub slab_caches: Address,
    /// CPU 0's per-CPU area offset (`__per_cpu_offset[0]`)
    pub per_cpu_offset: u64,
    /// Per-CPU address of the current task pointer, before adding the offset
    current_task: Address,
    page_offset_base: u64,
    vmemmap_base: u64,
}

impl KernelContext {
    /// Validate `layout` and resolve the global symbols salt reads
    ///
    /// # Errors
    /// `LayoutError` for an incomplete layout, `SymbolNotFound` for a missing
    /// required symbol, `MemoryFault` when `__per_cpu_offset` is unreadable
    pub fn discover(backend: &mut dyn Backend, layout: KernelLayout) -> Result<Self, SessionError> {
        let offsets = layout.resolve()?;
        let slab_caches = backend.resolve_symbol("slab_caches")?;
        let per_cpu_table = backend.resolve_symbol("__per_cpu_offset")?;
        let per_cpu_offset = backend.read_u64(per_cpu_table)?;

        let current_task = match backend.resolve_symbol("current_task") {
            Ok(address) => address,
            Err(BackendError::SymbolNotFound(_)) => {
                // 6.2+ keeps it in struct pcpu_hot
                let field = offsets
                    .pcpu_current_task
                    .ok_or_else(|| BackendError::SymbolNotFound("current_task".into()))?;
                backend.resolve_symbol("pcpu_hot")?.offset(field.offset)
            }
            Err(e) => return Err(e.into()),
        };

        let page_offset_base =
            read_optional_base(backend, "page_offset_base", DEFAULT_PAGE_OFFSET_BASE)?;
        let vmemmap_base = read_optional_base(backend, "vmemmap_base", DEFAULT_VMEMMAP_BASE)?;

        log::info!(
            "slab_caches at {slab_caches}, per-cpu offset {per_cpu_offset:#x}, current_task at {current_task}"
        );
        Ok(Self {
            layout,
            offsets,
            slab_caches,
            per_cpu_offset,
            current_task,
            page_offset_base,
            vmemmap_base,
        })
    }

    /// CPU 0's instance of a per-CPU pointer
    #[must_use]
    pub fn per_cpu(&self, address: Address) -> Address {
        address.offset(self.per_cpu_offset)
    }

    /// `comm` and `pid` of CPU 0's current task
    ///
    /// # Errors
    /// `MemoryFault`
    pub fn current_task(&self, backend: &mut dyn Backend) -> Result<TaskIdentity, BackendError> {
        let task = backend.read_address(self.per_cpu(self.current_task))?;
        let comm = self.offsets.task_comm;
        let mut raw = vec![0u8; usize::try_from(comm.width).unwrap_or(16)];
        backend.read_memory(task.offset(comm.offset), &mut raw)?;
        let name =
            StructView::new(task, raw).inline_str(FieldLayout { offset: 0, width: comm.width });

        let pid_field = self.offsets.task_pid;
        let pid_width = usize::try_from(pid_field.width).unwrap_or(4);
        let raw_pid = backend.read_uint(task.offset(pid_field.offset), pid_width)?;
        #[allow(clippy::cast_possible_truncation)]
        let pid = Pid(raw_pid as u32);
        Ok(TaskIdentity { name, pid })
    }

    /// Name of the `kmem_cache` at `cache`
    ///
    /// # Errors
    /// `MemoryFault` on the cache or its name string
    pub fn cache_name(&self, backend: &mut dyn Backend, cache: Address) -> Result<String, BackendError> {
        let name = backend.read_address(cache.offset(self.offsets.cache.name.offset))?;
        backend.read_cstring(name, MAX_CACHE_NAME)
    }

    /// Owning `kmem_cache` of a slab object, through its page descriptor
    ///
    /// `None` when owner resolution is unavailable for this kernel, the
    /// pointer is outside the direct map, or the page carries no cache.
    ///
    /// # Errors
    /// `MemoryFault` while reading the page descriptor
    pub fn object_cache(
        &self,
        backend: &mut dyn Backend,
        object: Address,
    ) -> Result<Option<Address>, BackendError> {
        let Some(owner) = self.offsets.owner else {
            return Ok(None);
        };
        if object.0 < self.page_offset_base {
            return Ok(None);
        }
        let pfn = (object.0 - self.page_offset_base) >> PAGE_SHIFT;
        let mut page = Address(self.vmemmap_base.wrapping_add(pfn.wrapping_mul(owner.page_size)));

        let head = backend.read_u64(page.offset(owner.compound_head.offset))?;
        if head & 1 == 1 {
            page = Address(head - 1);
        }
        let cache = backend.read_address(page.offset(owner.slab_cache.offset))?;
        Ok(if cache.is_null() { None } else { Some(cache) })
    }
}

fn read_optional_base(
    backend: &mut dyn Backend,
    symbol: &str,
    default: u64,
) -> Result<u64, BackendError> {
    match backend.resolve_symbol(symbol) {
        Ok(address) => backend.read_u64(address),
        Err(BackendError::SymbolNotFound(_)) => {
            log::debug!("{symbol} not present, using {default:#x}");
            Ok(default)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SyntheticTarget;
    use crate::kernel::layout::StructLayout;

    fn layout() -> KernelLayout {
        KernelLayout {
            list_head: StructLayout::new("list_head", 16).with_field("next", 0, 8),
            kmem_cache: StructLayout::new("kmem_cache", 0x100)
                .with_field("cpu_slab", 0, 8)
                .with_field("object_size", 0x0c, 4)
                .with_field("offset", 0x10, 4)
                .with_field("name", 0x60, 8)
                .with_field("list", 0x68, 16),
            kmem_cache_cpu: StructLayout::new("kmem_cache_cpu", 0x20).with_field("freelist", 0, 8),
            task_struct: StructLayout::new("task_struct", 0x40)
                .with_field("pid", 0x10, 4)
                .with_field("comm", 0x20, 16),
            page: Some(
                StructLayout::new("page", 0x40)
                    .with_field("compound_head", 0x08, 8)
                    .with_field("slab_cache", 0x18, 8),
            ),
            slab: None,
            pcpu_hot: Some(StructLayout::new("pcpu_hot", 0x40).with_field("current_task", 0, 8)),
        }
    }

    fn target() -> SyntheticTarget {
        let mut t = SyntheticTarget::new();
        t.define_symbol("slab_caches", Address(0xffff_ffff_8200_0000));
        t.define_symbol("__per_cpu_offset", Address(0xffff_ffff_8210_0000));
        t.write_u64(Address(0xffff_ffff_8210_0000), 0xffff_8880_7fc0_0000);
        t
    }

    #[test]
    fn test_current_task_from_pcpu_hot() {
        let mut t = target();
        t.define_symbol("pcpu_hot", Address(0x1_f000));
        let task = Address(0xffff_8880_0400_0000);
        t.write_u64(Address(0xffff_8880_7fc0_0000 + 0x1_f000), task.0);
        t.write_u32(task.offset(0x10), 4242);
        t.write_bytes(task.offset(0x20), b"bash\0\0\0\0\0\0\0\0\0\0\0\0");

        let ctx = KernelContext::discover(&mut t, layout()).unwrap();
        let who = ctx.current_task(&mut t).unwrap();
        assert_eq!(who, TaskIdentity { name: "bash".into(), pid: Pid(4242) });
    }

    #[test]
    fn test_missing_current_task_is_fatal() {
        let mut t = target();
        let err = KernelContext::discover(&mut t, layout()).unwrap_err();
        assert!(err.to_string().contains("pcpu_hot"));
    }

    #[test]
    fn test_object_cache_follows_compound_head() {
        let mut t = target();
        t.define_symbol("current_task", Address(0x1_f000));
        let ctx = KernelContext::discover(&mut t, layout()).unwrap();

        // object in pfn 0x4001, a tail page of the compound page at pfn 0x4000
        let object = Address(DEFAULT_PAGE_OFFSET_BASE + 0x4001_080);
        let tail = Address(DEFAULT_VMEMMAP_BASE + 0x4001 * 0x40);
        let head = Address(DEFAULT_VMEMMAP_BASE + 0x4000 * 0x40);
        t.write_u64(tail.offset(0x08), head.0 | 1);
        t.write_u64(head.offset(0x08), 0);
        t.write_u64(head.offset(0x18), 0xffff_8880_0100_0000);

        assert_eq!(ctx.object_cache(&mut t, object).unwrap(), Some(Address(0xffff_8880_0100_0000)));
        assert_eq!(ctx.object_cache(&mut t, Address(0x1000)).unwrap(), None);
    }
}
