use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use rand::distributions::{Distribution, Uniform};
use rand::thread_rng;
use scoped_threadpool::Pool;
use thiserror::Error;
use tracing::debug;

use crate::barrier::BarrierSync;
use crate::bitmap::MarkBitmap;
use crate::heap::{Address, HeapLayout, ObjectModel, WORD_SIZE};
use crate::mark_stack::{MarkStack, ENTRIES_PER_CHUNK};
use crate::root_regions::RootRegions;
use crate::safepoint::SafepointGate;
use crate::satb::SatbQueueSet;
use crate::stats::RegionMarkStats;
use crate::task::MarkTask;
use crate::taskqueue::{TaskEntry, TaskQueue};
use crate::terminator::Terminator;

/// Step target used for the stop-the-world remark drain, effectively "no
/// deadline".
const REMARK_STEP_TARGET_MS: f64 = 1.0e9;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to reserve mark bitmap backing store: {0}")]
    BitmapReserve(#[from] std::io::Error),
    #[error("marking cycle already in progress")]
    CycleInProgress,
}

/// Engine tunables, in the spirit of the collector option blocks elsewhere
/// in this family of crates.
#[derive(Clone, Copy, Debug)]
pub struct MarkOptions {
    /// Number of marking workers; the borrowed pool must have at least as
    /// many threads for all of them to run concurrently.
    pub num_workers: usize,
    /// Initial global mark stack capacity, in chunks. Power of two.
    pub mark_stack_capacity: usize,
    /// Upper bound the mark stack may ever grow to, in chunks.
    pub mark_stack_max_capacity: usize,
    /// Soft deadline of one concurrent marking step, in milliseconds.
    pub target_step_ms: f64,
    /// Words scanned between two regular clock calls.
    pub words_scanned_period: usize,
    /// References visited between two regular clock calls.
    pub refs_reached_period: usize,
    /// Entries in the per-worker region stats cache. Power of two.
    pub stats_cache_size: usize,
    /// Reference slots processed per large-array slice.
    pub obj_array_stride_refs: usize,
    /// Capacity of each task-local queue. Power of two, and large enough to
    /// absorb a refilled global chunk on top of the drain watermark.
    pub task_queue_capacity: usize,
}

impl Default for MarkOptions {
    fn default() -> Self {
        Self {
            num_workers: 2,
            mark_stack_capacity: 32,
            mark_stack_max_capacity: 1024,
            target_step_ms: 10.0,
            words_scanned_period: 12 * 1024,
            refs_reached_period: 1024,
            stats_cache_size: 1024,
            obj_array_stride_refs: 2048,
            task_queue_capacity: 4096,
        }
    }
}

/// Outcome of one region claim attempt. `Retry` means the claimed region
/// was empty and was skipped; the caller gets back to its clock before
/// asking again, keeping each call bounded.
#[derive(Debug, PartialEq, Eq)]
pub enum Claim {
    Region(usize),
    Retry,
    OutOfRegions,
}

/// Cycle-wide observability counters.
pub struct CycleCounters {
    marking_steps: AtomicUsize,
    overflow_restarts: AtomicUsize,
    steals: AtomicUsize,
    satb_buffers_drained: AtomicUsize,
    tasks_retired: AtomicUsize,
    stats_cache_hits: AtomicUsize,
    stats_cache_misses: AtomicUsize,
}

impl CycleCounters {
    fn new() -> Self {
        Self {
            marking_steps: AtomicUsize::new(0),
            overflow_restarts: AtomicUsize::new(0),
            steals: AtomicUsize::new(0),
            satb_buffers_drained: AtomicUsize::new(0),
            tasks_retired: AtomicUsize::new(0),
            stats_cache_hits: AtomicUsize::new(0),
            stats_cache_misses: AtomicUsize::new(0),
        }
    }

    fn reset_for_cycle(&self) {
        self.marking_steps.store(0, Ordering::Relaxed);
        self.overflow_restarts.store(0, Ordering::Relaxed);
        self.steals.store(0, Ordering::Relaxed);
        self.satb_buffers_drained.store(0, Ordering::Relaxed);
        self.tasks_retired.store(0, Ordering::Relaxed);
        self.stats_cache_hits.store(0, Ordering::Relaxed);
        self.stats_cache_misses.store(0, Ordering::Relaxed);
    }

    pub(crate) fn record_step(&self) {
        self.marking_steps.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_overflow_restart(&self) {
        self.overflow_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_steal(&self) {
        self.steals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_satb_buffer(&self) {
        self.satb_buffers_drained.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_task_retired(&self, hits: usize, misses: usize) {
        self.tasks_retired.fetch_add(1, Ordering::Relaxed);
        self.stats_cache_hits.fetch_add(hits, Ordering::Relaxed);
        self.stats_cache_misses.fetch_add(misses, Ordering::Relaxed);
    }

    pub fn marking_steps(&self) -> usize {
        self.marking_steps.load(Ordering::Relaxed)
    }

    pub fn overflow_restarts(&self) -> usize {
        self.overflow_restarts.load(Ordering::Relaxed)
    }

    pub fn steals(&self) -> usize {
        self.steals.load(Ordering::Relaxed)
    }

    pub fn satb_buffers_drained(&self) -> usize {
        self.satb_buffers_drained.load(Ordering::Relaxed)
    }

    pub fn stats_cache_hits(&self) -> usize {
        self.stats_cache_hits.load(Ordering::Relaxed)
    }

    pub fn stats_cache_misses(&self) -> usize {
        self.stats_cache_misses.load(Ordering::Relaxed)
    }
}

/// The marking engine. Owns the mark bitmap, the TAMS/TARS tables, the
/// per-region liveness statistics, the global chunked mark stack, the
/// task-local queues and the root-region set, and drives the cycle through
/// its phases:
///
/// pre_concurrent_start -> scan_root_regions -> mark_from_roots -> remark
/// -> cleanup -> concurrent_cycle_end
///
/// Overflow of the global stack during concurrent marking restarts the
/// marking phase in place through a two-barrier rendezvous; overflow during
/// remark grows the stack in line and, if it still cannot finish, re-runs
/// the concurrent phase. An external full collection aborts the cycle
/// through `concurrent_cycle_abort`.
pub struct ConcurrentMark {
    layout: HeapLayout,
    options: MarkOptions,
    bitmap: MarkBitmap,
    global_mark_stack: MarkStack,
    task_queues: Box<[TaskQueue]>,
    region_stats: Box<[RegionMarkStats]>,
    tams: Box<[AtomicUsize]>,
    tars: Box<[AtomicUsize]>,
    root_regions: RootRegions,
    satb: SatbQueueSet,
    safepoint: SafepointGate,

    /// Region-aligned; always the end of the last claimed region.
    finger: CachePadded<AtomicUsize>,

    terminator: Terminator,
    first_overflow_barrier: BarrierSync,
    second_overflow_barrier: BarrierSync,

    num_active_tasks: AtomicUsize,
    concurrent: AtomicBool,
    has_overflown: AtomicBool,
    has_aborted: AtomicBool,
    restart_for_overflow: AtomicBool,
    in_progress: AtomicBool,
    needs_remembered_set_rebuild: AtomicBool,
    completed_mark_cycles: AtomicU32,
    counters: CycleCounters,
}

impl ConcurrentMark {
    pub fn new(layout: HeapLayout, options: MarkOptions) -> Result<Self, Error> {
        assert!(options.num_workers > 0);
        assert!(options.task_queue_capacity > ENTRIES_PER_CHUNK + crate::task::LOCAL_DRAIN_TARGET);
        let bitmap = MarkBitmap::new(layout.base(), layout.capacity())?;
        let global_mark_stack =
            MarkStack::new(options.mark_stack_capacity, options.mark_stack_max_capacity);
        let task_queues = (0..options.num_workers)
            .map(|_| TaskQueue::new(options.task_queue_capacity))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let num_regions = layout.num_regions();
        let region_stats = (0..num_regions)
            .map(|_| RegionMarkStats::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let tams = (0..num_regions)
            .map(|i| AtomicUsize::new(layout.region_bottom(i)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let tars = (0..num_regions)
            .map(|_| AtomicUsize::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let finger = CachePadded::new(AtomicUsize::new(layout.base()));
        Ok(Self {
            root_regions: RootRegions::new(num_regions.max(1)),
            satb: SatbQueueSet::new(),
            safepoint: SafepointGate::new(),
            terminator: Terminator::new(options.num_workers),
            first_overflow_barrier: BarrierSync::new(),
            second_overflow_barrier: BarrierSync::new(),
            num_active_tasks: AtomicUsize::new(0),
            concurrent: AtomicBool::new(false),
            has_overflown: AtomicBool::new(false),
            has_aborted: AtomicBool::new(false),
            restart_for_overflow: AtomicBool::new(false),
            in_progress: AtomicBool::new(false),
            needs_remembered_set_rebuild: AtomicBool::new(false),
            completed_mark_cycles: AtomicU32::new(0),
            counters: CycleCounters::new(),
            layout,
            options,
            bitmap,
            global_mark_stack,
            task_queues,
            region_stats,
            tams,
            tars,
            finger,
        })
    }

    // ------------------------------------------------------------------
    // Accessors shared with the tasks and exposed to collaborators

    #[inline]
    pub fn layout(&self) -> &HeapLayout {
        &self.layout
    }

    #[inline]
    pub fn options(&self) -> &MarkOptions {
        &self.options
    }

    #[inline]
    pub fn bitmap(&self) -> &MarkBitmap {
        &self.bitmap
    }

    #[inline]
    pub fn satb(&self) -> &SatbQueueSet {
        &self.satb
    }

    #[inline]
    pub fn safepoint(&self) -> &SafepointGate {
        &self.safepoint
    }

    #[inline]
    pub fn counters(&self) -> &CycleCounters {
        &self.counters
    }

    #[inline]
    pub(crate) fn region_stats(&self) -> &[RegionMarkStats] {
        &self.region_stats
    }

    #[inline]
    pub(crate) fn task_queue(&self, worker_id: usize) -> &TaskQueue {
        &self.task_queues[worker_id]
    }

    #[inline]
    pub(crate) fn terminator(&self) -> &Terminator {
        &self.terminator
    }

    #[inline]
    pub fn has_aborted(&self) -> bool {
        self.has_aborted.load(Ordering::Acquire)
    }

    #[inline]
    pub fn has_overflown(&self) -> bool {
        self.has_overflown.load(Ordering::Acquire)
    }

    pub(crate) fn set_has_overflown(&self) {
        self.has_overflown.store(true, Ordering::Release);
    }

    fn clear_has_overflown(&self) {
        self.has_overflown.store(false, Ordering::Release);
    }

    #[inline]
    pub fn concurrent(&self) -> bool {
        self.concurrent.load(Ordering::Acquire)
    }

    #[inline]
    pub fn restart_for_overflow(&self) -> bool {
        self.restart_for_overflow.load(Ordering::Acquire)
    }

    pub fn completed_mark_cycles(&self) -> u32 {
        self.completed_mark_cycles.load(Ordering::Acquire)
    }

    pub fn needs_remembered_set_rebuild(&self) -> bool {
        self.needs_remembered_set_rebuild.load(Ordering::Acquire)
    }

    #[inline]
    pub fn finger(&self) -> Address {
        self.finger.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // TAMS / TARS

    #[inline]
    pub fn top_at_mark_start(&self, region_idx: usize) -> Address {
        self.tams[region_idx].load(Ordering::Acquire)
    }

    pub fn update_top_at_mark_start(&self, region_idx: usize) {
        self.tams[region_idx].store(self.layout.region_top(region_idx), Ordering::Release);
    }

    pub fn reset_top_at_mark_start(&self, region_idx: usize) {
        self.tams[region_idx].store(self.layout.region_bottom(region_idx), Ordering::Release);
    }

    /// Whether `obj` was allocated after the cycle snapshot, making it
    /// implicitly live.
    #[inline]
    pub fn obj_allocated_since_mark_start(&self, obj: Address) -> bool {
        obj >= self.top_at_mark_start(self.layout.region_index(obj))
    }

    /// TARS of the given region; None when the region was not selected for
    /// remembered set rebuilding.
    pub fn top_at_rebuild_start(&self, region_idx: usize) -> Option<Address> {
        match self.tars[region_idx].load(Ordering::Acquire) {
            0 => None,
            addr => Some(addr),
        }
    }

    // ------------------------------------------------------------------
    // Liveness statistics

    pub fn live_bytes(&self, region_idx: usize) -> usize {
        self.region_stats[region_idx].live_bytes()
    }

    pub fn set_live_bytes(&self, region_idx: usize, live_bytes: usize) {
        self.region_stats[region_idx].set_live_words(live_bytes / WORD_SIZE);
    }

    pub fn contains_live_object(&self, region_idx: usize) -> bool {
        self.region_stats[region_idx].live_words() != 0
    }

    pub fn incoming_refs(&self, region_idx: usize) -> usize {
        self.region_stats[region_idx].incoming_refs()
    }

    // ------------------------------------------------------------------
    // Bitmap surface

    #[inline]
    pub fn is_marked(&self, obj: Address) -> bool {
        self.bitmap.is_marked(obj)
    }

    /// Mark `obj` if it is below its region's TAMS, accounting liveness on
    /// the 0 -> 1 transition. Used by root-region scanning and by external
    /// callers such as evacuation-failure handling.
    pub fn mark_in_bitmap<M: ObjectModel>(&self, model: &M, obj: Address) -> bool {
        let region_idx = self.layout.region_index(obj);
        if obj >= self.top_at_mark_start(region_idx) {
            return false;
        }
        if !self.bitmap.mark_atomic(obj) {
            return false;
        }
        self.region_stats[region_idx].add_live_words(model.size_words(obj));
        true
    }

    /// Clear the marks of a single region. Safepoint only.
    pub fn clear_bitmap_for_region(&self, region_idx: usize) {
        self.bitmap.clear_range(
            self.layout.region_bottom(region_idx),
            self.layout.region_end(region_idx),
        );
    }

    // ------------------------------------------------------------------
    // Global mark stack surface used by the tasks

    /// Push a chunk buffer; on failure flags the global overflow condition
    /// and returns false.
    pub(crate) fn mark_stack_push(&self, buffer: &[TaskEntry; ENTRIES_PER_CHUNK]) -> bool {
        if !self.global_mark_stack.par_push_chunk(buffer) {
            self.set_has_overflown();
            return false;
        }
        true
    }

    pub(crate) fn mark_stack_pop(&self, buffer: &mut [TaskEntry; ENTRIES_PER_CHUNK]) -> bool {
        self.global_mark_stack.par_pop_chunk(buffer)
    }

    #[inline]
    pub(crate) fn mark_stack_is_empty(&self) -> bool {
        self.global_mark_stack.is_empty()
    }

    #[inline]
    pub(crate) fn mark_stack_size_entries(&self) -> usize {
        self.global_mark_stack.size_entries()
    }

    #[inline]
    pub(crate) fn partial_mark_stack_target(&self) -> usize {
        self.global_mark_stack.capacity_chunks() * ENTRIES_PER_CHUNK / 3
    }

    pub fn mark_stack_capacity_chunks(&self) -> usize {
        self.global_mark_stack.capacity_chunks()
    }

    /// Test hook for the stack-balance invariant: all chunks ever handed
    /// out are parked on the free list once marking is done.
    pub fn mark_stack_free_chunks(&self) -> usize {
        self.global_mark_stack.free_list_len()
    }

    // ------------------------------------------------------------------
    // Region claiming

    /// Claim the next region for `worker_id`. Empty regions (bottom equals
    /// TAMS) are skipped one at a time so the caller returns to its clock
    /// between skips.
    pub fn claim_region(&self, _worker_id: usize) -> Claim {
        loop {
            let finger = self.finger.load(Ordering::Acquire);
            if finger >= self.layout.end() {
                return Claim::OutOfRegions;
            }
            let region_idx = self.layout.region_index(finger);
            let next = self.layout.region_end(region_idx);
            if self
                .finger
                .compare_exchange(finger, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if self.layout.region_bottom(region_idx) == self.top_at_mark_start(region_idx) {
                    return Claim::Retry;
                }
                return Claim::Region(region_idx);
            }
            // Lost the race for this region; the next one may be free.
        }
    }

    pub fn out_of_regions(&self) -> bool {
        self.finger() >= self.layout.end()
    }

    // ------------------------------------------------------------------
    // Stealing

    /// One round of steal attempts against randomly chosen peers.
    pub(crate) fn try_stealing(&self, worker_id: usize) -> Option<TaskEntry> {
        let n = self.num_active_tasks.load(Ordering::Relaxed);
        if n <= 1 {
            return None;
        }
        let mut rng = thread_rng();
        let range = Uniform::new(0, n);
        for _ in 0..2 * n {
            let mut victim = worker_id;
            while victim == worker_id {
                victim = range.sample(&mut rng);
            }
            if let Some(entry) = self.task_queues[victim].steal() {
                self.counters.record_steal();
                return Some(entry);
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Overflow recovery

    pub(crate) fn enter_first_overflow_barrier(&self, _worker_id: usize) -> bool {
        self.first_overflow_barrier.enter()
    }

    pub(crate) fn enter_second_overflow_barrier(&self, _worker_id: usize) -> bool {
        self.second_overflow_barrier.enter()
    }

    /// Re-initialize the global marking state for a restart from the
    /// current bitmap. Marks and liveness survive; the stack contents and
    /// the finger do not. Idempotent.
    pub fn reset_marking_for_restart(&self) {
        self.global_mark_stack.set_empty();
        self.clear_has_overflown();
        self.finger.store(self.layout.base(), Ordering::Release);
        self.counters.record_overflow_restart();
        debug!("marking restarting after mark stack overflow");
    }

    fn reset_at_marking_complete(&self) {
        self.num_active_tasks.store(0, Ordering::Relaxed);
        self.concurrent.store(false, Ordering::Release);
    }

    fn set_concurrency_and_phase(&self, active_tasks: usize, concurrent: bool) {
        debug_assert!(active_tasks <= self.task_queues.len());
        self.num_active_tasks.store(active_tasks, Ordering::Relaxed);
        self.terminator.reset(active_tasks);
        self.first_overflow_barrier.set_n_workers(active_tasks);
        self.second_overflow_barrier.set_n_workers(active_tasks);
        self.concurrent.store(concurrent, Ordering::Release);
    }

    fn calc_active_marking_workers(&self, pool: &Pool) -> usize {
        self.options
            .num_workers
            .min(pool.thread_count() as usize)
            .max(1)
    }

    // ------------------------------------------------------------------
    // Cycle lifecycle

    /// Snapshot the heap for a new cycle: capture TAMS for every region,
    /// clear cycle state and activate the SATB barrier contract. Fails if a
    /// cycle is already running.
    pub fn pre_concurrent_start(&self, cause: &str) -> Result<(), Error> {
        if self.in_progress.swap(true, Ordering::AcqRel) {
            return Err(Error::CycleInProgress);
        }
        debug!(cause, "concurrent mark cycle starting");
        self.has_aborted.store(false, Ordering::Release);
        self.clear_has_overflown();
        self.restart_for_overflow.store(false, Ordering::Release);
        self.needs_remembered_set_rebuild.store(false, Ordering::Release);
        self.concurrent.store(true, Ordering::Release);
        for region_idx in 0..self.layout.num_regions() {
            self.update_top_at_mark_start(region_idx);
            self.tars[region_idx].store(0, Ordering::Relaxed);
            self.region_stats[region_idx].clear();
        }
        self.finger.store(self.layout.base(), Ordering::Release);
        self.global_mark_stack.set_empty();
        self.global_mark_stack.set_should_grow(false);
        for queue in self.task_queues.iter() {
            queue.set_empty();
        }
        self.root_regions.reset();
        self.satb.set_active(true);
        self.counters.reset_for_cycle();
        Ok(())
    }

    pub fn add_root_region(&self, start: Address, end: Address) {
        self.root_regions.add(start, end);
    }

    pub fn root_regions(&self) -> &RootRegions {
        &self.root_regions
    }

    pub fn wait_until_root_region_scan_finished(&self) -> bool {
        self.root_regions.wait_until_scan_finished()
    }

    pub fn root_region_scan_abort_and_wait(&self) {
        self.root_regions.abort();
        self.root_regions.wait_until_scan_finished();
    }

    /// Pre-scan the root ranges: every reference found below TAMS is marked
    /// so ordinary marking starts from a complete snapshot.
    pub fn scan_root_regions<M: ObjectModel>(&self, pool: &mut Pool, model: &M) {
        self.root_regions.prepare_for_scan();
        if self.root_regions.num_root_regions() == 0 {
            self.root_regions.scan_finished();
            return;
        }
        let num_workers = self.calc_active_marking_workers(pool);
        debug!(
            workers = num_workers,
            regions = self.root_regions.num_root_regions(),
            "root region scan"
        );
        pool.scoped(|scope| {
            for _ in 0..num_workers {
                scope.execute(move || {
                    while let Some((start, end)) = self.root_regions.claim_next() {
                        self.scan_root_region(model, start, end);
                        if self.safepoint.should_yield() {
                            self.safepoint.do_yield();
                        }
                        if self.has_aborted() {
                            break;
                        }
                    }
                });
            }
        });
        self.root_regions.scan_finished();
    }

    fn scan_root_region<M: ObjectModel>(&self, model: &M, start: Address, end: Address) {
        let mut cur = start;
        while cur < end {
            model.iterate_refs(cur, |r| {
                if r != 0 && self.layout.contains(r) {
                    self.mark_in_bitmap(model, r);
                }
            });
            cur += model.size_words(cur) * WORD_SIZE;
        }
    }

    /// The concurrent phase proper: run the marking tasks until they all
    /// terminate. Overflow restarts happen inside the worker loops through
    /// the two-barrier protocol, so when this returns either marking is
    /// globally done or the cycle was aborted.
    pub fn mark_from_roots<M: ObjectModel>(&self, pool: &mut Pool, model: &M) {
        let num_workers = self.calc_active_marking_workers(pool);
        self.set_concurrency_and_phase(num_workers, true);
        debug!(workers = num_workers, "mark from roots");
        pool.scoped(|scope| {
            for worker_id in 0..num_workers {
                scope.execute(move || {
                    let mut task = MarkTask::new(worker_id, self, model);
                    loop {
                        task.do_marking_step(self.options.target_step_ms, true, false);
                        if self.safepoint.should_yield() {
                            self.safepoint.do_yield();
                        }
                        if self.has_aborted() || !task.has_aborted() {
                            break;
                        }
                    }
                    task.flush();
                });
            }
        });
    }

    /// Stop-the-world finalization. The caller guarantees mutators are
    /// stopped and their SATB buffers are flushed into the queue set.
    pub fn remark<M: ObjectModel>(&self, pool: &mut Pool, model: &M) {
        self.remark_with(pool, model, |_| {});
    }

    /// Remark with a reference-processing hook: after the parallel drain,
    /// `ref_work` may grey additional objects (reference discovery keep
    /// alive work) through the serial task handed to it; the engine then
    /// drains again. The stack grows in line during this pause.
    pub fn remark_with<M, F>(&self, pool: &mut Pool, model: &M, ref_work: F)
    where
        M: ObjectModel,
        F: FnOnce(&mut MarkTask<'_, M>),
    {
        if self.has_aborted() {
            return;
        }
        debug!("remark pause");
        self.restart_for_overflow.store(false, Ordering::Release);
        self.global_mark_stack.set_should_grow(true);

        let num_workers = self.calc_active_marking_workers(pool);
        self.set_concurrency_and_phase(num_workers, false);
        pool.scoped(|scope| {
            for worker_id in 0..num_workers {
                scope.execute(move || {
                    let mut task = MarkTask::new(worker_id, self, model);
                    loop {
                        task.do_marking_step(REMARK_STEP_TARGET_MS, true, num_workers == 1);
                        if self.has_aborted() || self.has_overflown() || !task.has_aborted() {
                            break;
                        }
                    }
                    task.flush();
                });
            }
        });

        if !self.has_overflown() && !self.has_aborted() {
            // Reference processing sub-phase, serial. Anything it greys is
            // drained with the stack still allowed to grow.
            self.set_concurrency_and_phase(1, false);
            let mut task = MarkTask::new(0, self, model);
            ref_work(&mut task);
            task.do_marking_step(REMARK_STEP_TARGET_MS, true, true);
            task.flush();
        }

        if self.has_aborted() {
            return;
        }
        if self.has_overflown() {
            // Could not finish even with in-line growth; run another round
            // of concurrent marking with the larger stack.
            self.restart_for_overflow.store(true, Ordering::Release);
            self.reset_marking_for_restart();
            debug!("remark overflowed, concurrent marking will restart");
            return;
        }

        let mut selected = 0;
        for region_idx in 0..self.layout.num_regions() {
            if self.contains_live_object(region_idx) && !self.layout.is_humongous(region_idx) {
                self.tars[region_idx].store(self.layout.region_top(region_idx), Ordering::Release);
                selected += 1;
            }
        }
        self.needs_remembered_set_rebuild
            .store(selected > 0, Ordering::Release);
        self.reset_at_marking_complete();
        debug!(rebuild_regions = selected, "remark complete");
    }

    /// Post-marking accounting: total live bytes below TAMS as seen by this
    /// cycle. Region reclamation and heap resizing are the embedding
    /// heap's business.
    pub fn cleanup(&self) -> usize {
        let total = (0..self.layout.num_regions())
            .map(|region_idx| self.live_bytes(region_idx))
            .sum();
        debug!(total_live_bytes = total, "cleanup");
        total
    }

    /// Concurrently clear the bitmap and per-cycle tables for the next
    /// cycle, yielding to safepoint requests between stripes.
    pub fn cleanup_for_next_mark(&self, pool: &mut Pool) {
        self.bitmap.clear_parallel(pool, &self.safepoint, true);
        for region_idx in 0..self.layout.num_regions() {
            self.region_stats[region_idx].clear();
            self.reset_top_at_mark_start(region_idx);
            self.tars[region_idx].store(0, Ordering::Relaxed);
        }
    }

    pub fn concurrent_cycle_end(&self, mark_cycle_completed: bool) {
        self.satb.set_active(false);
        if mark_cycle_completed {
            self.completed_mark_cycles.fetch_add(1, Ordering::AcqRel);
        } else {
            self.satb.abandon_partial_marking();
        }
        self.in_progress.store(false, Ordering::Release);
        debug!(
            completed = mark_cycle_completed,
            restarts = self.counters.overflow_restarts(),
            steps = self.counters.marking_steps(),
            "concurrent mark cycle end"
        );
    }

    /// Abandon the cycle (a full collection took over). Best effort: tasks
    /// notice at their next clock, root-region scanning winds down, barrier
    /// waiters are released.
    pub fn concurrent_cycle_abort(&self) -> bool {
        if !self.in_progress.load(Ordering::Acquire) {
            return false;
        }
        self.has_aborted.store(true, Ordering::Release);
        self.root_regions.abort();
        self.first_overflow_barrier.abort();
        self.second_overflow_barrier.abort();
        debug!("concurrent mark cycle aborted");
        true
    }

    /// Drive a whole marking attempt after `pre_concurrent_start` and root
    /// registration: root scan, concurrent mark, remark, retrying the
    /// concurrent phase when remark overflows. Returns whether marking
    /// completed. `concurrent_cycle_end` is invoked either way.
    pub fn run_cycle<M: ObjectModel>(&self, pool: &mut Pool, model: &M) -> bool {
        self.scan_root_regions(pool, model);
        self.root_regions.wait_until_scan_finished();
        let mut remark_overflows = 0;
        while !self.has_aborted() {
            self.mark_from_roots(pool, model);
            if self.has_aborted() {
                break;
            }
            self.remark(pool, model);
            if self.restart_for_overflow.swap(false, Ordering::AcqRel) {
                remark_overflows += 1;
                if remark_overflows >= 2 {
                    // Two remark overflows in a row; restarting at the same
                    // size would just repeat them.
                    self.global_mark_stack.expand();
                }
                continue;
            }
            break;
        }
        let completed = !self.has_aborted();
        self.concurrent_cycle_end(completed);
        completed
    }
}
