//! Fake kernel memory image shared by the integration tests
//!
//! Builds a [`SyntheticTarget`] laid out like a small x86_64 SLUB kernel:
//! a `slab_caches` list, per-cpu `kmem_cache_cpu` instances for CPU 0, a
//! current task and page descriptors for kfree owner resolution.

#![allow(dead_code)]

use salt::backend::{Hit, Registers, SyntheticTarget};
use salt::domain::Address;
use salt::kernel::{KernelLayout, StructLayout};
use salt::session::Session;

pub const SLAB_CACHES: Address = Address(0xffff_ffff_8260_0000);
pub const PER_CPU_TABLE: Address = Address(0xffff_ffff_8270_0000);
pub const PER_CPU_OFFSET: u64 = 0xffff_8880_7fc0_0000;
/// Per-cpu symbol, not an address by itself
pub const CURRENT_TASK: Address = Address(0x1_f000);
pub const TASK: Address = Address(0xffff_8880_0400_0000);

pub const PAGE_OFFSET_BASE: u64 = 0xffff_8880_0000_0000;
pub const VMEMMAP_BASE: u64 = 0xffff_ea00_0000_0000;
pub const PAGE_SIZE: u64 = 0x40;

const CACHE_BASE: u64 = 0xffff_8880_0100_0000;
const CACHE_STRIDE: u64 = 0x200;
const CPU_SLAB_BASE: u64 = 0x2_a000;

pub const LIST: u64 = 0x68;
pub const RANDOM: u64 = 0x18;

pub const ROUTINES: [&str; 6] =
    ["__kmalloc", "kmalloc_slab", "kfree", "kmem_cache_alloc", "kmem_cache_free", "new_slab"];

pub const STACK: u64 = 0xffff_c900_0001_7e00;
pub const CALLER: Address = Address(0xffff_ffff_8133_7000);

pub fn layout(hardened: bool) -> KernelLayout {
    let mut kmem_cache = StructLayout::new("kmem_cache", 0x100)
        .with_field("cpu_slab", 0, 8)
        .with_field("size", 0x08, 4)
        .with_field("object_size", 0x0c, 4)
        .with_field("offset", 0x10, 4)
        .with_field("name", 0x60, 8)
        .with_field("list", LIST, 16);
    if hardened {
        kmem_cache.insert_field("random", RANDOM, 8);
    }
    KernelLayout {
        list_head: StructLayout::new("list_head", 16).with_field("next", 0, 8).with_field("prev", 8, 8),
        kmem_cache,
        kmem_cache_cpu: StructLayout::new("kmem_cache_cpu", 0x20).with_field("freelist", 0, 8),
        task_struct: StructLayout::new("task_struct", 0x40)
            .with_field("pid", 0x10, 4)
            .with_field("comm", 0x20, 16),
        page: Some(
            StructLayout::new("page", PAGE_SIZE)
                .with_field("compound_head", 0x08, 8)
                .with_field("slab_cache", 0x18, 8),
        ),
        slab: None,
        pcpu_hot: None,
    }
}

pub struct FakeKernel {
    pub target: SyntheticTarget,
    pub caches: Vec<Address>,
    random: Option<u64>,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Free pointers stored as `next ^ random ^ swab(slot)`
    pub fn hardened(random: u64) -> Self {
        Self::build(Some(random))
    }

    fn build(random: Option<u64>) -> Self {
        let mut target = SyntheticTarget::new();
        target.define_symbol("slab_caches", SLAB_CACHES);
        target.define_symbol("__per_cpu_offset", PER_CPU_TABLE);
        target.define_symbol("current_task", CURRENT_TASK);
        target.write_u64(PER_CPU_TABLE, PER_CPU_OFFSET);
        target.write_u64(SLAB_CACHES, SLAB_CACHES.0);
        target.write_u64(SLAB_CACHES.offset(8), SLAB_CACHES.0);
        for (i, routine) in ROUTINES.iter().enumerate() {
            target.define_symbol(routine, Address(0xffff_ffff_8120_0000 + (i as u64) * 0x100));
        }
        let mut kernel = Self { target, caches: Vec::new(), random };
        kernel.set_current("swapper/0", 0);
        kernel
    }

    /// Append a cache whose CPU 0 free chain is `free`, in order
    pub fn add_cache(&mut self, name: &str, object_size: u32, offset: u32, free: &[Address]) -> Address {
        let n = self.caches.len() as u64;
        let cache = Address(CACHE_BASE + n * CACHE_STRIDE);
        self.target.map_zeroed(cache, CACHE_STRIDE);

        let cpu_slab = CPU_SLAB_BASE + n * 0x40;
        self.target.write_u64(cache, cpu_slab);
        self.target.write_u32(cache.offset(0x08), object_size);
        self.target.write_u32(cache.offset(0x0c), object_size);
        self.target.write_u32(cache.offset(0x10), offset);
        if let Some(random) = self.random {
            self.target.write_u64(cache.offset(RANDOM), random);
        }
        let name_at = cache.offset(0x180);
        self.target.write_cstr(name_at, name);
        self.target.write_u64(cache.offset(0x60), name_at.0);

        let first = free.first().copied().unwrap_or(Address::NULL);
        self.target.write_u64(Address(cpu_slab + PER_CPU_OFFSET), first.0);
        for (i, object) in free.iter().enumerate() {
            let next = free.get(i + 1).copied().unwrap_or(Address::NULL);
            let slot = object.offset(u64::from(offset));
            let stored = match self.random {
                Some(random) => next.0 ^ random ^ slot.0.swap_bytes(),
                None => next.0,
            };
            self.target.write_u64(slot, stored);
        }

        self.caches.push(cache);
        self.relink();
        cache
    }

    /// Rewrite every `list.next` so the caches form a ring through the head
    fn relink(&mut self) {
        let links: Vec<Address> = self.caches.iter().map(|c| c.offset(LIST)).collect();
        let mut prev = SLAB_CACHES;
        for link in links.iter().copied().chain(std::iter::once(SLAB_CACHES)) {
            self.target.write_u64(prev, link.0);
            prev = link;
        }
    }

    /// Point the last cache back at the first instead of the list head
    pub fn make_list_cycle(&mut self) {
        if let (Some(first), Some(last)) = (self.caches.first(), self.caches.last()) {
            self.target.write_u64(last.offset(LIST), first.offset(LIST).0);
        }
    }

    pub fn set_current(&mut self, comm: &str, pid: u32) {
        self.target.map_zeroed(TASK, 0x40);
        let mut raw = [0u8; 16];
        let len = comm.len().min(15);
        raw[..len].copy_from_slice(&comm.as_bytes()[..len]);
        self.target.write_bytes(TASK.offset(0x20), &raw);
        self.target.write_u32(TASK.offset(0x10), pid);
        self.target.write_u64(CURRENT_TASK.offset(PER_CPU_OFFSET), TASK.0);
    }

    /// A live object on a slab page owned by `cache`
    pub fn slab_object(&mut self, cache: Address, pfn: u64) -> Address {
        let page = Address(VMEMMAP_BASE + pfn * PAGE_SIZE);
        self.target.map_zeroed(page, PAGE_SIZE);
        self.target.write_u64(page.offset(0x18), cache.0);
        Address(PAGE_OFFSET_BASE + (pfn << 12) + 0x80)
    }

    pub fn session(&mut self) -> Session {
        Session::new(&mut self.target, layout(self.random.is_some())).unwrap()
    }

    /// Enter `routine` with `rdi` as first argument
    pub fn enter(&mut self, routine: &str, rdi: u64) -> Hit {
        let registers = Registers::new().with("rdi", rdi).with("rsp", STACK);
        self.target.fire_entry(routine, registers, CALLER).unwrap()
    }

    /// Return from the most recently intercepted invocation
    pub fn leave(&mut self, rax: u64) -> Hit {
        let token = self.target.last_return_token().unwrap();
        self.target.fire_return(token, rax).unwrap()
    }
}

/// Objects `count` slots apart in the direct map
pub fn objects(base: u64, stride: u64, count: usize) -> Vec<Address> {
    (0..count as u64).map(|i| Address(PAGE_OFFSET_BASE + base + i * stride)).collect()
}
