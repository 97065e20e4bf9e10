mod common;

use common::{objects, FakeKernel, LIST, SLAB_CACHES};
use salt::domain::Address;
use salt::render::{self, WalkFormat};
use salt::walker::{WalkFaultKind, ROOT_NAME};

#[test]
fn test_walk_lists_root_then_every_cache() {
    let mut kernel = FakeKernel::new();
    let a = kernel.add_cache("kmalloc-8", 8, 0, &objects(0x10_0000, 8, 3));
    let b = kernel.add_cache("dentry", 192, 64, &[]);
    let c = kernel.add_cache("kmalloc-1k", 1024, 512, &objects(0x20_0000, 1024, 1));
    let session = kernel.session();

    let snapshot = session.walk(&mut kernel.target).unwrap();
    assert_eq!(snapshot.caches.len(), 4);
    assert!(!snapshot.is_partial());

    let root = snapshot.root().unwrap();
    assert_eq!(root.name, ROOT_NAME);
    assert_eq!(root.address, SLAB_CACHES);
    assert_eq!(root.next, a);

    let names: Vec<&str> = snapshot.entries().iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["kmalloc-8", "dentry", "kmalloc-1k"]);
    assert_eq!(snapshot.entries()[0].next, b);
    assert_eq!(snapshot.entries()[1].next, c);
    // the last entry points back at the head's container
    assert_eq!(snapshot.entries()[2].next, SLAB_CACHES.container_of(LIST));
}

#[test]
fn test_walk_has_one_entry_per_cache_plus_root() {
    for n in 0..=40u64 {
        let mut kernel = FakeKernel::new();
        let mut expected = Vec::new();
        for i in 0..n {
            let free = objects(0x1000_0000 + i * 0x1000, 0x40, (i % 4) as usize);
            let name = format!("cache-{i}");
            let cache = kernel.add_cache(&name, 0x40, 0, &free);
            expected.push((cache, name, free));
        }
        let session = kernel.session();

        let snapshot = session.walk(&mut kernel.target).unwrap();
        assert_eq!(snapshot.caches.len() as u64, n + 1, "n = {n}");
        assert_eq!(snapshot.root().unwrap().name, ROOT_NAME);
        assert!(!snapshot.is_partial());
        for (entry, (cache, name, free)) in snapshot.entries().iter().zip(&expected) {
            assert_eq!(entry.address, *cache);
            assert_eq!(&entry.name, name);
            assert_eq!(&entry.free_chain, free);
        }
    }
}

#[test]
fn test_free_chain_lengths() {
    let mut kernel = FakeKernel::new();
    let free = objects(0x10_0000, 64, 5);
    kernel.add_cache("kmalloc-64", 64, 32, &free);
    kernel.add_cache("empty", 64, 32, &[]);
    let session = kernel.session();

    let snapshot = session.walk(&mut kernel.target).unwrap();
    let busy = snapshot.find("kmalloc-64").unwrap();
    assert_eq!(busy.first_free, free[0]);
    assert_eq!(busy.free_chain, free);
    assert_eq!(busy.object_size, Some(64));
    assert_eq!(busy.free_pointer_offset, Some(32));

    let empty = snapshot.find("empty").unwrap();
    assert_eq!(empty.first_free, Address::NULL);
    assert!(empty.free_chain.is_empty());
}

#[test]
fn test_hardened_free_pointers_are_decoded() {
    let mut kernel = FakeKernel::hardened(0x1bad_cafe_f00d_d00d);
    let free = objects(0x30_0000, 128, 4);
    kernel.add_cache("filp", 128, 64, &free);
    let session = kernel.session();

    let snapshot = session.walk(&mut kernel.target).unwrap();
    assert_eq!(snapshot.find("filp").unwrap().free_chain, free);
}

#[test]
fn test_list_cycle_is_reported_not_followed() {
    let mut kernel = FakeKernel::new();
    for name in ["a", "b", "c"] {
        kernel.add_cache(name, 16, 0, &[]);
    }
    kernel.make_list_cycle();
    let session = kernel.session();

    let snapshot = session.walk(&mut kernel.target).unwrap();
    assert_eq!(snapshot.caches.len(), 4);
    assert!(snapshot.is_partial());
    assert_eq!(snapshot.faults[0].kind, WalkFaultKind::Cycle);
}

#[test]
fn test_free_chain_cycle_stops() {
    let mut kernel = FakeKernel::new();
    let free = objects(0x40_0000, 32, 3);
    kernel.add_cache("kmalloc-32", 32, 0, &free);
    // last object points back at the first
    kernel.target.write_u64(free[2], free[0].0);
    let session = kernel.session();

    let snapshot = session.walk(&mut kernel.target).unwrap();
    let cache = snapshot.find("kmalloc-32").unwrap();
    assert_eq!(cache.free_chain, free);
    assert_eq!(cache.fault.as_ref().map(|f| f.kind), Some(WalkFaultKind::Cycle));
}

#[test]
fn test_unreadable_object_truncates_chain_only() {
    let mut kernel = FakeKernel::new();
    let free = objects(0x50_0000, 32, 4);
    kernel.add_cache("kmalloc-32", 32, 8, &free);
    kernel.add_cache("after", 16, 0, &[]);
    kernel.target.unmap(free[2].offset(8), 8);
    let session = kernel.session();

    let snapshot = session.walk(&mut kernel.target).unwrap();
    assert!(snapshot.is_partial());
    let cache = snapshot.find("kmalloc-32").unwrap();
    assert_eq!(cache.free_chain, free[..3].to_vec());
    let fault = cache.fault.as_ref().unwrap();
    assert_eq!(fault.kind, WalkFaultKind::MemoryFault);
    assert_eq!(fault.address, free[2].offset(8));
    // the walk went on to the next cache
    assert!(snapshot.find("after").is_some());
}

#[test]
fn test_offset_outside_slot_is_suspect() {
    let mut kernel = FakeKernel::new();
    kernel.add_cache("tiny", 8, 8, &objects(0x60_0000, 8, 2));
    let session = kernel.session();

    let snapshot = session.walk(&mut kernel.target).unwrap();
    let cache = snapshot.find("tiny").unwrap();
    assert!(cache.free_chain.is_empty());
    assert_eq!(cache.fault.as_ref().map(|f| f.kind), Some(WalkFaultKind::SuspectLayout));
}

#[test]
fn test_unreadable_list_head_fails() {
    let mut kernel = FakeKernel::new();
    kernel.add_cache("a", 16, 0, &[]);
    let session = kernel.session();
    kernel.target.unmap(SLAB_CACHES, 8);
    assert!(session.walk(&mut kernel.target).is_err());
}

#[test]
fn test_rendered_selection() {
    let mut kernel = FakeKernel::new();
    kernel.add_cache("kmalloc-8", 8, 0, &objects(0x10_0000, 8, 2));
    kernel.add_cache("dentry", 192, 64, &[]);
    let session = kernel.session();
    let snapshot = session.walk(&mut kernel.target).unwrap();
    let targets = vec!["dentry".to_string()];

    let json = render::render_snapshot(WalkFormat::Json, &snapshot, Some(&targets)).unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    let names: Vec<&str> = value.as_array().unwrap().iter().map(|e| e["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec![ROOT_NAME, "dentry"]);

    let text = render::render_snapshot(WalkFormat::Text, &snapshot, Some(&targets)).unwrap();
    assert!(text.contains("name: dentry"));
    assert!(!text.contains("kmalloc-8"));
    assert!(text.contains("..."));

    let html = render::render_snapshot(WalkFormat::Html, &snapshot, None).unwrap();
    assert_eq!(html.matches("Show/hide freelist").count(), 1);
}
