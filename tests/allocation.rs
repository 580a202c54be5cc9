//! End-to-end behavior of both heap variants over a 1 KiB region.

use segalloc::{BlockInfo, BlockState, ExplicitHeap, ImplicitHeap, Storage};

fn free(size: usize) -> BlockInfo {
    BlockInfo {
        size,
        state: BlockState::Free,
    }
}

fn used(size: usize) -> BlockInfo {
    BlockInfo {
        size,
        state: BlockState::Used,
    }
}

#[test]
fn bootstrap_walk_implicit() {
    let mut storage = Storage::<1024>::new();
    let heap = ImplicitHeap::new(storage.bytes_mut()).unwrap();

    assert!(heap.validate().is_ok());
    assert_eq!(heap.blocks().collect::<Vec<_>>(), [free(1016)]);
}

#[test]
fn bootstrap_walk_explicit() {
    let mut storage = Storage::<1024>::new();
    let heap = ExplicitHeap::new(storage.bytes_mut()).unwrap();

    assert!(heap.validate().is_ok());
    assert_eq!(heap.blocks().collect::<Vec<_>>(), [free(1016)]);
    assert_eq!(heap.free_list().count(), 1);
}

#[test]
fn split_then_free_keeps_the_hole_implicit() {
    let mut storage = Storage::<1024>::new();
    let mut heap = ImplicitHeap::new(storage.bytes_mut()).unwrap();

    let p = heap.allocate(64).unwrap();
    assert_eq!(heap.blocks().collect::<Vec<_>>(), [used(64), free(944)]);

    unsafe { heap.free(p.as_ptr()) };
    assert_eq!(heap.blocks().collect::<Vec<_>>(), [free(64), free(944)]);
    assert_eq!(heap.used_bytes(), 16);
    assert!(heap.validate().is_ok());
}

#[test]
fn split_then_free_coalesces_explicit() {
    let mut storage = Storage::<1024>::new();
    let mut heap = ExplicitHeap::new(storage.bytes_mut()).unwrap();

    let p = heap.allocate(64).unwrap();
    assert_eq!(heap.blocks().collect::<Vec<_>>(), [used(64), free(944)]);

    unsafe { heap.free(p.as_ptr()) };
    assert_eq!(heap.blocks().collect::<Vec<_>>(), [free(1016)]);
    assert_eq!(heap.free_list().count(), 1);
    assert!(heap.validate().is_ok());
}

#[test]
fn the_tail_still_serves_large_requests_explicit() {
    let mut storage = Storage::<1024>::new();
    let mut heap = ExplicitHeap::new(storage.bytes_mut()).unwrap();

    let a = heap.allocate(64).unwrap();
    let _b = heap.allocate(64).unwrap();
    let c = heap.allocate(64).unwrap();
    unsafe {
        heap.free(a.as_ptr());
        heap.free(c.as_ptr());
    }

    // freeing `c` merged it with the 800-byte tail, so 800 bytes still fit
    assert!(heap.allocate(800).is_some());
    assert!(heap.validate().is_ok());
}

#[test]
fn fragmentation_blocks_reuse_explicit() {
    let mut storage = Storage::<1024>::new();
    let mut heap = ExplicitHeap::new(storage.bytes_mut()).unwrap();

    let a = heap.allocate(64).unwrap();
    let _b = heap.allocate(64).unwrap();
    let c = heap.allocate(64).unwrap();
    let _d = heap.allocate(800).unwrap(); // exhausts the tail

    unsafe {
        heap.free(a.as_ptr());
        heap.free(c.as_ptr());
    }

    // only two 64-byte holes are left; no single block holds 128 bytes
    assert!(heap.allocate(128).is_none());
    assert!(heap.validate().is_ok());
}

#[test]
fn fragmentation_blocks_reuse_implicit() {
    let mut storage = Storage::<1024>::new();
    let mut heap = ImplicitHeap::new(storage.bytes_mut()).unwrap();

    let a = heap.allocate(400).unwrap();
    let b = heap.allocate(400).unwrap();
    unsafe {
        heap.free(a.as_ptr());
        heap.free(b.as_ptr());
    }

    // two adjacent 400-byte holes never merge in the implicit variant
    assert!(heap.allocate(800).is_none());
    assert!(heap.validate().is_ok());
}

#[test]
fn realloc_grow_copies_the_payload() {
    let mut storage = Storage::<1024>::new();
    let mut heap = ImplicitHeap::new(storage.bytes_mut()).unwrap();

    let p = heap.allocate(16).unwrap();
    for i in 0..16_u8 {
        unsafe { p.as_ptr().add(i as usize).write(i) };
    }

    let q = unsafe { heap.reallocate(p.as_ptr(), 64) }.unwrap();
    for i in 0..16_u8 {
        assert_eq!(unsafe { q.as_ptr().add(i as usize).read() }, i);
    }
    assert!(heap.validate().is_ok());
}

#[test]
fn lifo_free_list_order_explicit() {
    let mut storage = Storage::<1024>::new();
    let mut heap = ExplicitHeap::new(storage.bytes_mut()).unwrap();

    let a = heap.allocate(16).unwrap();
    let b = heap.allocate(16).unwrap();
    unsafe {
        heap.free(a.as_ptr());
        heap.free(b.as_ptr());
    }

    // most recently freed first: `b` heads the list (having absorbed the
    // free tail behind it), then `a`
    let list: Vec<_> = heap.free_list().collect();
    assert_eq!(list, [b, a]);
    assert_eq!(heap.blocks().collect::<Vec<_>>(), [free(16), free(992)]);
    assert!(heap.validate().is_ok());
}

#[test]
fn payloads_are_word_aligned() {
    let mut storage = Storage::<1024>::new();
    let mut heap = ExplicitHeap::new(storage.bytes_mut()).unwrap();

    for request in [1, 3, 16, 17, 63, 100] {
        let p = heap.allocate(request).unwrap();
        assert_eq!(p.as_ptr() as usize % 8, 0, "request {}", request);
    }
    assert!(heap.validate().is_ok());
}

#[test]
fn payload_sizes_have_a_floor() {
    let mut storage = Storage::<1024>::new();
    let mut heap = ImplicitHeap::new(storage.bytes_mut()).unwrap();

    heap.allocate(1).unwrap();
    heap.allocate(9).unwrap();
    heap.allocate(17).unwrap();

    let sizes: Vec<_> = heap
        .blocks()
        .filter(|block| block.state == BlockState::Used)
        .map(|block| block.size)
        .collect();
    assert_eq!(sizes, [16, 16, 24]);
}

#[test]
fn null_is_polymorphic() {
    let mut storage = Storage::<1024>::new();
    let mut heap = ExplicitHeap::new(storage.bytes_mut()).unwrap();

    // free(null) is a no-op, reallocate(null, n) is allocate(n)
    unsafe { heap.free(std::ptr::null_mut()) };
    assert!(heap.validate().is_ok());

    let p = unsafe { heap.reallocate(std::ptr::null_mut(), 32) }.unwrap();
    assert_eq!(heap.allocated_blocks(), 1);
    unsafe { heap.free(p.as_ptr()) };
    assert_eq!(heap.allocated_blocks(), 0);
}

#[test]
fn shrinking_reallocation_is_identity() {
    let mut storage = Storage::<1024>::new();
    let mut heap = ExplicitHeap::new(storage.bytes_mut()).unwrap();

    let p = heap.allocate(64).unwrap();
    for new_size in [64, 32, 1] {
        let q = unsafe { heap.reallocate(p.as_ptr(), new_size) }.unwrap();
        assert_eq!(q, p);
    }
    assert!(heap.validate().is_ok());
}

#[test]
fn accounting_survives_a_workout() {
    let mut storage = Storage::<1024>::new();
    let mut heap = ExplicitHeap::new(storage.bytes_mut()).unwrap();

    let mut live = Vec::new();
    for request in [24, 100, 8, 56, 16, 240] {
        live.push(heap.allocate(request).unwrap());
        assert!(heap.validate().is_ok());
    }
    assert_eq!(heap.allocated_blocks(), live.len());

    // free every other allocation, then the rest
    for p in live.iter().step_by(2) {
        unsafe { heap.free(p.as_ptr()) };
        assert!(heap.validate().is_ok());
    }
    for p in live.iter().skip(1).step_by(2) {
        unsafe { heap.free(p.as_ptr()) };
        assert!(heap.validate().is_ok());
    }
    assert_eq!(heap.allocated_blocks(), 0);
}

#[test]
fn dump_reflects_the_walk() {
    let mut storage = Storage::<1024>::new();
    let mut heap = ExplicitHeap::new(storage.bytes_mut()).unwrap();
    heap.allocate(64).unwrap();
    heap.allocate(112).unwrap();

    let mut out = String::new();
    heap.dump(&mut out).unwrap();
    let lines: Vec<_> = out.lines().collect();
    assert_eq!(lines.len(), heap.blocks().count());
    assert!(lines[0].contains("64 bytes, used"));
    assert!(lines[1].contains("112 bytes, used"));
    assert!(lines[2].contains("free"));
}
