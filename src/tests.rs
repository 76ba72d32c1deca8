use std::sync::atomic::{AtomicUsize, Ordering};

use memmap2::MmapMut;
use scoped_threadpool::Pool;

use crate::concurrent_mark::{Claim, ConcurrentMark, MarkOptions};
use crate::heap::{Address, HeapLayout, ObjectModel, WORD_SIZE};
use crate::satb::SatbBuffer;

/// Test heap: bump allocation into an anonymous mapping, two-word headers.
/// Word 0 is the object size in words; word 1 packs `len << 1 | is_array`,
/// where `len` counts reference slots. Slots follow the header.
struct TestHeap {
    #[allow(dead_code)]
    map: MmapMut,
    base: Address,
    region_size: usize,
    num_regions: usize,
    cursors: Box<[AtomicUsize]>,
}

impl TestHeap {
    fn new(num_regions: usize, region_size: usize) -> Self {
        assert!(region_size.is_power_of_two());
        let len = (num_regions * region_size).max(4096);
        let mut map = MmapMut::map_anon(len).unwrap();
        let base = map.as_mut_ptr() as Address;
        let cursors = (0..num_regions)
            .map(|i| AtomicUsize::new(base + i * region_size))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            map,
            base,
            region_size,
            num_regions,
            cursors,
        }
    }

    fn layout(&self) -> HeapLayout {
        let layout = HeapLayout::new(self.base, self.num_regions, self.region_size);
        self.sync_layout(&layout);
        layout
    }

    fn sync_layout(&self, layout: &HeapLayout) {
        for region in 0..self.num_regions {
            layout.set_region_top(region, self.cursors[region].load(Ordering::Relaxed));
        }
    }

    fn top(&self, region: usize) -> Address {
        self.cursors[region].load(Ordering::Relaxed)
    }

    fn alloc(&self, region: usize, len: usize, is_array: bool) -> Address {
        let size_words = 2 + len;
        let bytes = size_words * WORD_SIZE;
        let addr = self.cursors[region].fetch_add(bytes, Ordering::Relaxed);
        assert!(addr + bytes <= self.base + (region + 1) * self.region_size);
        unsafe {
            *(addr as *mut usize) = size_words;
            *((addr + WORD_SIZE) as *mut usize) = (len << 1) | (is_array as usize);
            std::ptr::write_bytes((addr + 2 * WORD_SIZE) as *mut u8, 0, len * WORD_SIZE);
        }
        addr
    }

    fn alloc_obj(&self, region: usize, nrefs: usize) -> Address {
        self.alloc(region, nrefs, false)
    }

    fn alloc_array(&self, region: usize, len: usize) -> Address {
        self.alloc(region, len, true)
    }

    fn set_ref(&self, obj: Address, slot: usize, target: Address) {
        unsafe {
            *((obj + (2 + slot) * WORD_SIZE) as *mut usize) = target;
        }
    }
}

impl ObjectModel for TestHeap {
    fn size_words(&self, obj: Address) -> usize {
        unsafe { *(obj as *const usize) }
    }

    fn is_obj_array(&self, obj: Address) -> bool {
        unsafe { *((obj + WORD_SIZE) as *const usize) & 1 == 1 }
    }

    fn obj_array_length(&self, obj: Address) -> usize {
        unsafe { *((obj + WORD_SIZE) as *const usize) >> 1 }
    }

    fn array_data_start(&self, obj: Address) -> Address {
        obj + 2 * WORD_SIZE
    }

    fn block_start(&self, addr: Address) -> Address {
        let region = (addr - self.base) / self.region_size;
        let mut cur = self.base + region * self.region_size;
        loop {
            let next = cur + self.size_words(cur) * WORD_SIZE;
            if addr < next {
                return cur;
            }
            cur = next;
        }
    }

    fn iterate_refs<F: FnMut(Address)>(&self, obj: Address, mut f: F) {
        let len = self.obj_array_length(obj);
        let data = obj + 2 * WORD_SIZE;
        for slot in 0..len {
            let value = unsafe { *((data + slot * WORD_SIZE) as *const usize) };
            if value != 0 {
                f(value);
            }
        }
    }

    fn iterate_array_refs<F: FnMut(Address)>(
        &self,
        _obj: Address,
        from: Address,
        to: Address,
        mut f: F,
    ) {
        let mut cur = from;
        while cur < to {
            let value = unsafe { *(cur as *const usize) };
            if value != 0 {
                f(value);
            }
            cur += WORD_SIZE;
        }
    }
}

fn engine(heap: &TestHeap, options: MarkOptions) -> ConcurrentMark {
    ConcurrentMark::new(heap.layout(), options).unwrap()
}

#[test]
fn linear_chain_marks_transitive_closure() {
    let heap = TestHeap::new(1, 1 << 20);
    let a = heap.alloc_obj(0, 1);
    let b = heap.alloc_obj(0, 1);
    let c = heap.alloc_obj(0, 1);
    let d = heap.alloc_obj(0, 0);
    heap.set_ref(a, 0, b);
    heap.set_ref(b, 0, c);
    heap.set_ref(c, 0, d);

    let cm = engine(&heap, MarkOptions::default());
    let mut pool = Pool::new(2);
    cm.pre_concurrent_start("chain").unwrap();
    assert!(cm.mark_in_bitmap(&heap, a));
    assert!(cm.run_cycle(&mut pool, &heap));

    for &obj in &[a, b, c, d] {
        assert!(cm.is_marked(obj), "object {:#x} not marked", obj);
    }
    assert_eq!(cm.live_bytes(0), (3 + 3 + 3 + 2) * WORD_SIZE);
    assert!(cm.incoming_refs(0) >= 3);
    assert!(cm.mark_stack_is_empty());
    assert_eq!(cm.completed_mark_cycles(), 1);
    assert_eq!(cm.cleanup(), (3 + 3 + 3 + 2) * WORD_SIZE);
}

#[test]
fn reference_above_tams_is_implicitly_live() {
    let heap = TestHeap::new(1, 1 << 20);
    let a = heap.alloc_obj(0, 1);

    let cm = engine(&heap, MarkOptions::default());
    let mut pool = Pool::new(2);
    cm.pre_concurrent_start("above-tams").unwrap();

    // Allocated after the snapshot: above TAMS, never marked or scanned.
    let x = heap.alloc_obj(0, 0);
    heap.sync_layout(cm.layout());
    heap.set_ref(a, 0, x);

    assert!(cm.mark_in_bitmap(&heap, a));
    assert!(cm.run_cycle(&mut pool, &heap));

    assert!(cm.is_marked(a));
    assert!(!cm.is_marked(x));
    assert!(cm.obj_allocated_since_mark_start(x));
    assert_eq!(cm.live_bytes(0), 3 * WORD_SIZE);
}

#[test]
fn object_exactly_at_tams_is_not_marked() {
    let heap = TestHeap::new(1, 1 << 20);
    let a = heap.alloc_obj(0, 1);

    let cm = engine(&heap, MarkOptions::default());
    let mut pool = Pool::new(2);
    cm.pre_concurrent_start("at-tams").unwrap();

    let b = heap.alloc_obj(0, 0);
    assert_eq!(b, cm.top_at_mark_start(0));
    heap.sync_layout(cm.layout());
    heap.set_ref(a, 0, b);

    // TAMS is an exclusive upper bound; marking b must be refused.
    assert!(!cm.mark_in_bitmap(&heap, b));
    assert!(cm.mark_in_bitmap(&heap, a));
    assert!(cm.run_cycle(&mut pool, &heap));
    assert!(!cm.is_marked(b));
}

#[test]
fn large_obj_array_is_sliced_and_fully_scanned() {
    const N: usize = 100_000;
    let heap = TestHeap::new(2, 2 << 20);
    let mut targets = Vec::new();
    let arr = heap.alloc_array(1, N);
    for slot in 0..N {
        if slot % 2 == 0 {
            let target = heap.alloc_obj(0, 0);
            heap.set_ref(arr, slot, target);
            targets.push(target);
        }
    }

    let options = MarkOptions {
        obj_array_stride_refs: 512,
        ..Default::default()
    };
    let cm = engine(&heap, options);
    let mut pool = Pool::new(2);
    cm.pre_concurrent_start("obj-array").unwrap();
    assert!(cm.mark_in_bitmap(&heap, arr));
    assert!(cm.run_cycle(&mut pool, &heap));

    for &target in &targets {
        assert!(cm.is_marked(target));
    }
    assert_eq!(cm.live_bytes(1), (2 + N) * WORD_SIZE);
    assert_eq!(cm.live_bytes(0), targets.len() * 2 * WORD_SIZE);
    assert!(cm.mark_stack_is_empty());
    for worker_id in 0..2 {
        assert!(cm.task_queue(worker_id).is_empty());
    }
}

#[test]
fn mark_stack_overflow_restarts_and_still_completes() {
    const CHILDREN: usize = 8000;
    let heap = TestHeap::new(1, 1 << 22);

    // Leaves first, then their parents, then the root array: every
    // discovered reference sits behind the sweep and must be pushed, so a
    // two-chunk global stack overflows.
    let mut leaves = Vec::new();
    for _ in 0..2 * CHILDREN {
        leaves.push(heap.alloc_obj(0, 0));
    }
    let mut children = Vec::new();
    for i in 0..CHILDREN {
        let child = heap.alloc_obj(0, 2);
        heap.set_ref(child, 0, leaves[2 * i]);
        heap.set_ref(child, 1, leaves[2 * i + 1]);
        children.push(child);
    }
    let root = heap.alloc_array(0, CHILDREN);
    for (slot, &child) in children.iter().enumerate() {
        heap.set_ref(root, slot, child);
    }

    let options = MarkOptions {
        num_workers: 1,
        mark_stack_capacity: 2,
        mark_stack_max_capacity: 1024,
        ..Default::default()
    };
    let cm = engine(&heap, options);
    let mut pool = Pool::new(1);
    cm.pre_concurrent_start("overflow").unwrap();
    assert!(cm.mark_in_bitmap(&heap, root));
    assert!(cm.run_cycle(&mut pool, &heap));

    assert!(
        cm.counters().overflow_restarts() >= 1,
        "expected at least one overflow restart"
    );
    for &leaf in &leaves {
        assert!(cm.is_marked(leaf));
    }
    // Liveness is exactly-once even across restarts.
    let expected_words = (2 + CHILDREN) + CHILDREN * 4 + 2 * CHILDREN * 2;
    assert_eq!(cm.live_bytes(0), expected_words * WORD_SIZE);
    assert!(cm.mark_stack_is_empty());
    assert_eq!(cm.completed_mark_cycles(), 1);
}

#[test]
fn abort_unwinds_cycle_without_completion() {
    let heap = TestHeap::new(1, 1 << 20);
    let a = heap.alloc_obj(0, 1);
    let b = heap.alloc_obj(0, 0);
    heap.set_ref(a, 0, b);

    let cm = engine(&heap, MarkOptions::default());
    let mut pool = Pool::new(2);
    cm.pre_concurrent_start("abort").unwrap();
    assert!(cm.mark_in_bitmap(&heap, a));
    assert!(cm.concurrent_cycle_abort());
    assert!(!cm.run_cycle(&mut pool, &heap));

    assert_eq!(cm.completed_mark_cycles(), 0);
    // The bitmap may be partially populated; the next cycle's reset wipes it.
    cm.cleanup_for_next_mark(&mut pool);
    assert!(!cm.is_marked(a));
    assert!(!cm.concurrent_cycle_abort());
}

#[test]
fn work_spreads_from_a_single_seeded_region() {
    const N: usize = 10_000;
    let heap = TestHeap::new(1, 1 << 22);
    let mut children = Vec::new();
    for _ in 0..N {
        children.push(heap.alloc_obj(0, 0));
    }
    let root = heap.alloc_array(0, N);
    for (slot, &child) in children.iter().enumerate() {
        heap.set_ref(root, slot, child);
    }

    let options = MarkOptions {
        num_workers: 4,
        ..Default::default()
    };
    let cm = engine(&heap, options);
    let mut pool = Pool::new(4);
    cm.pre_concurrent_start("steal").unwrap();
    assert!(cm.mark_in_bitmap(&heap, root));
    assert!(cm.run_cycle(&mut pool, &heap));

    for &child in &children {
        assert!(cm.is_marked(child));
    }
    // Every entry was scanned exactly once.
    let expected_words = (2 + N) + N * 2;
    assert_eq!(cm.live_bytes(0), expected_words * WORD_SIZE);
    assert!(cm.mark_stack_is_empty());
    for worker_id in 0..4 {
        assert!(cm.task_queue(worker_id).is_empty());
    }
}

#[test]
fn empty_heap_cycle_completes_immediately() {
    let heap = TestHeap::new(0, 1 << 20);
    let cm = engine(&heap, MarkOptions::default());
    let mut pool = Pool::new(2);
    cm.pre_concurrent_start("empty").unwrap();
    assert!(cm.run_cycle(&mut pool, &heap));
    assert_eq!(cm.cleanup(), 0);
    assert_eq!(cm.completed_mark_cycles(), 1);
}

#[test]
fn claim_region_skips_empty_regions_one_at_a_time() {
    let heap = TestHeap::new(3, 1 << 20);
    // Region 1 is the only one with contents at snapshot time.
    heap.alloc_obj(1, 0);

    let cm = engine(&heap, MarkOptions::default());
    cm.pre_concurrent_start("claim").unwrap();

    assert_eq!(cm.claim_region(0), Claim::Retry);
    assert_eq!(cm.claim_region(0), Claim::Region(1));
    assert_eq!(cm.claim_region(0), Claim::Retry);
    assert_eq!(cm.claim_region(0), Claim::OutOfRegions);
    assert!(cm.out_of_regions());
    cm.concurrent_cycle_end(false);
}

#[test]
fn satb_logged_reference_is_marked() {
    let heap = TestHeap::new(1, 1 << 20);
    let a = heap.alloc_obj(0, 1);
    let b = heap.alloc_obj(0, 0);
    heap.set_ref(a, 0, b);

    let cm = engine(&heap, MarkOptions::default());
    let mut pool = Pool::new(2);
    cm.pre_concurrent_start("satb").unwrap();
    assert!(cm.satb().is_active());
    assert!(cm.mark_in_bitmap(&heap, a));

    // The mutator clears a's field before any marker sees it; the write
    // barrier logs the previous value.
    heap.set_ref(a, 0, 0);
    let mut buffer = SatbBuffer::new();
    buffer.push(b);
    buffer.flush(cm.satb());

    assert!(cm.run_cycle(&mut pool, &heap));
    assert!(cm.is_marked(b), "snapshot-reachable object lost");
    assert!(cm.counters().satb_buffers_drained() >= 1);
}

#[test]
fn root_regions_are_scanned_before_marking() {
    let heap = TestHeap::new(2, 1 << 20);
    let t1 = heap.alloc_obj(0, 0);
    let t2 = heap.alloc_obj(0, 0);

    let cm = engine(&heap, MarkOptions::default());
    let mut pool = Pool::new(2);
    cm.pre_concurrent_start("root-regions").unwrap();

    // Survivor-style contents: objects placed after the snapshot whose
    // references must still be treated as roots.
    let r1 = heap.alloc_obj(1, 1);
    heap.set_ref(r1, 0, t1);
    let r2 = heap.alloc_obj(1, 1);
    heap.set_ref(r2, 0, t2);
    heap.sync_layout(cm.layout());
    cm.add_root_region(r1, heap.top(1));

    assert!(cm.run_cycle(&mut pool, &heap));
    assert!(cm.is_marked(t1));
    assert!(cm.is_marked(t2));
    // The root objects themselves are above TAMS: implicitly live, unmarked.
    assert!(!cm.is_marked(r1));
    assert!(!cm.is_marked(r2));
    assert!(!cm.root_regions().scan_in_progress());
}

#[test]
fn remark_grows_the_stack_in_line() {
    const CHILDREN: usize = 8000;
    let heap = TestHeap::new(1, 1 << 22);
    let mut leaves = Vec::new();
    for _ in 0..2 * CHILDREN {
        leaves.push(heap.alloc_obj(0, 0));
    }
    let mut children = Vec::new();
    for i in 0..CHILDREN {
        let child = heap.alloc_obj(0, 2);
        heap.set_ref(child, 0, leaves[2 * i]);
        heap.set_ref(child, 1, leaves[2 * i + 1]);
        children.push(child);
    }
    let hidden = heap.alloc_array(0, CHILDREN);
    for (slot, &child) in children.iter().enumerate() {
        heap.set_ref(hidden, slot, child);
    }
    let root = heap.alloc_obj(0, 0);

    let options = MarkOptions {
        num_workers: 1,
        mark_stack_capacity: 2,
        mark_stack_max_capacity: 256,
        ..Default::default()
    };
    let cm = engine(&heap, options);
    let mut pool = Pool::new(1);
    cm.pre_concurrent_start("remark-grow").unwrap();
    assert!(cm.mark_in_bitmap(&heap, root));

    cm.scan_root_regions(&mut pool, &heap);
    cm.mark_from_roots(&mut pool, &heap);
    assert!(!cm.has_overflown());
    assert_eq!(cm.mark_stack_capacity_chunks(), 2);

    // The last reference to `hidden` was overwritten during marking; only
    // the SATB log knows about it when remark runs.
    let mut buffer = SatbBuffer::new();
    buffer.push(hidden);
    buffer.flush(cm.satb());

    cm.remark(&mut pool, &heap);
    assert!(!cm.restart_for_overflow());
    assert!(cm.mark_stack_capacity_chunks() > 2, "stack did not grow");
    assert!(cm.is_marked(hidden));
    for &leaf in &leaves {
        assert!(cm.is_marked(leaf));
    }
    assert!(cm.needs_remembered_set_rebuild());
    assert_eq!(cm.top_at_rebuild_start(0), Some(heap.top(0)));
    cm.concurrent_cycle_end(true);
    assert_eq!(cm.completed_mark_cycles(), 1);
}

#[test]
fn remark_overflow_at_max_capacity_restarts_marking() {
    const CHILDREN: usize = 8000;
    let heap = TestHeap::new(1, 1 << 22);
    let mut children = Vec::new();
    for _ in 0..CHILDREN {
        children.push(heap.alloc_obj(0, 0));
    }
    let hidden = heap.alloc_array(0, CHILDREN);
    for (slot, &child) in children.iter().enumerate() {
        heap.set_ref(hidden, slot, child);
    }
    let root = heap.alloc_obj(0, 0);

    // The stack cannot grow at all: remark overflow must fall back to
    // another concurrent marking round.
    let options = MarkOptions {
        num_workers: 1,
        mark_stack_capacity: 2,
        mark_stack_max_capacity: 2,
        ..Default::default()
    };
    let cm = engine(&heap, options);
    let mut pool = Pool::new(1);
    cm.pre_concurrent_start("remark-overflow").unwrap();
    assert!(cm.mark_in_bitmap(&heap, root));

    cm.scan_root_regions(&mut pool, &heap);
    cm.mark_from_roots(&mut pool, &heap);
    let mut buffer = SatbBuffer::new();
    buffer.push(hidden);
    buffer.flush(cm.satb());
    cm.remark(&mut pool, &heap);
    assert!(cm.restart_for_overflow());

    // Drive the retry the way the cycle driver would.
    assert!(cm.run_cycle(&mut pool, &heap));
    assert!(cm.is_marked(hidden));
    for &child in &children {
        assert!(cm.is_marked(child));
    }
    assert_eq!(cm.completed_mark_cycles(), 1);
}

#[test]
fn restart_reset_is_idempotent() {
    let heap = TestHeap::new(1, 1 << 20);
    heap.alloc_obj(0, 0);
    let cm = engine(&heap, MarkOptions::default());
    cm.pre_concurrent_start("reset").unwrap();

    assert_eq!(cm.claim_region(0), Claim::Region(0));
    cm.reset_marking_for_restart();
    cm.reset_marking_for_restart();
    assert_eq!(cm.finger(), cm.layout().base());
    assert!(cm.mark_stack_is_empty());
    // The finger is back at the bottom; the region can be claimed again.
    assert_eq!(cm.claim_region(0), Claim::Region(0));
    cm.concurrent_cycle_end(false);
}

#[test]
fn overlapping_cycles_are_refused() {
    let heap = TestHeap::new(1, 1 << 20);
    let cm = engine(&heap, MarkOptions::default());
    cm.pre_concurrent_start("first").unwrap();
    assert!(cm.pre_concurrent_start("second").is_err());
    cm.concurrent_cycle_end(false);
    cm.pre_concurrent_start("third").unwrap();
    cm.concurrent_cycle_end(false);
}

#[test]
fn second_cycle_after_cleanup_marks_same_heap() {
    let heap = TestHeap::new(1, 1 << 20);
    let a = heap.alloc_obj(0, 1);
    let b = heap.alloc_obj(0, 0);
    heap.set_ref(a, 0, b);

    let cm = engine(&heap, MarkOptions::default());
    let mut pool = Pool::new(2);

    for cycle in 1..=2 {
        heap.sync_layout(cm.layout());
        cm.pre_concurrent_start("repeat").unwrap();
        assert!(cm.mark_in_bitmap(&heap, a));
        assert!(cm.run_cycle(&mut pool, &heap));
        assert!(cm.is_marked(b));
        assert_eq!(cm.live_bytes(0), 5 * WORD_SIZE);
        assert_eq!(cm.completed_mark_cycles(), cycle);
        cm.cleanup_for_next_mark(&mut pool);
        assert!(!cm.is_marked(a));
    }
}
