use std::time::{Duration, Instant};

use tracing::trace;

use crate::concurrent_mark::{Claim, ConcurrentMark};
use crate::heap::{Address, ObjectModel, WORD_SIZE};
use crate::mark_stack::ENTRIES_PER_CHUNK;
use crate::taskqueue::{TaskEntry, TaskQueue};

/// Local queue watermark for partial drains; below it the task goes back to
/// sweeping its region.
pub(crate) const LOCAL_DRAIN_TARGET: usize = 64;

/// Per-worker marking task. One task owns one work-stealing deque and a
/// write-combining stats cache; everything else it touches is shared engine
/// state reached through the coordinator handle.
///
/// A task makes progress in bounded marking steps: sweep the bitmap of the
/// claimed region between the local finger and the region's TAMS, drain the
/// local queue, pull chunks from the global stack, drain SATB buffers, steal
/// from peers and finally offer termination. An adaptive clock bounds the
/// work between checks of the shared abort/overflow/SATB conditions.
pub struct MarkTask<'a, M: ObjectModel> {
    worker_id: usize,
    cm: &'a ConcurrentMark,
    model: &'a M,
    queue: &'a TaskQueue,
    stats_cache: crate::stats::MarkStatsCache<'a>,

    curr_region: Option<usize>,
    finger: Address,
    region_limit: Address,

    words_scanned: usize,
    words_scanned_limit: usize,
    real_words_scanned_limit: usize,
    refs_reached: usize,
    refs_reached_limit: usize,
    real_refs_reached_limit: usize,

    has_aborted: bool,
    has_timed_out: bool,
    draining_satb_buffers: bool,

    step_start: Instant,
    time_target: Duration,
    calls: usize,
    steps: usize,
    step_time_total: Duration,
}

impl<'a, M: ObjectModel> MarkTask<'a, M> {
    pub fn new(worker_id: usize, cm: &'a ConcurrentMark, model: &'a M) -> Self {
        let options = cm.options();
        Self {
            worker_id,
            cm,
            model,
            queue: cm.task_queue(worker_id),
            stats_cache: crate::stats::MarkStatsCache::new(
                cm.region_stats(),
                options.stats_cache_size,
            ),
            curr_region: None,
            finger: 0,
            region_limit: 0,
            words_scanned: 0,
            words_scanned_limit: options.words_scanned_period,
            real_words_scanned_limit: options.words_scanned_period,
            refs_reached: 0,
            refs_reached_limit: options.refs_reached_period,
            real_refs_reached_limit: options.refs_reached_period,
            has_aborted: false,
            has_timed_out: false,
            draining_satb_buffers: false,
            step_start: Instant::now(),
            time_target: Duration::ZERO,
            calls: 0,
            steps: 0,
            step_time_total: Duration::ZERO,
        }
    }

    #[inline]
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    #[inline]
    pub fn has_aborted(&self) -> bool {
        self.has_aborted
    }

    #[inline]
    pub fn has_timed_out(&self) -> bool {
        self.has_timed_out
    }

    /// Flush per-task caches into the shared tables. Called when the task
    /// retires at the end of a phase.
    pub fn flush(&mut self) {
        let (hits, misses) = self.stats_cache.flush_all();
        self.cm.counters().record_task_retired(hits, misses);
    }

    // ------------------------------------------------------------------
    // Adaptive clock

    fn recalculate_limits(&mut self) {
        let options = self.cm.options();
        self.real_words_scanned_limit = self.words_scanned + options.words_scanned_period;
        self.words_scanned_limit = self.real_words_scanned_limit;
        self.real_refs_reached_limit = self.refs_reached + options.refs_reached_period;
        self.refs_reached_limit = self.real_refs_reached_limit;
    }

    /// Pull the next clock check closer after an expensive operation
    /// (global stack transfer, SATB drain, region claim).
    fn decrease_limits(&mut self) {
        let options = self.cm.options();
        self.words_scanned_limit = self
            .real_words_scanned_limit
            .saturating_sub(3 * options.words_scanned_period / 4);
        self.refs_reached_limit = self
            .real_refs_reached_limit
            .saturating_sub(3 * options.refs_reached_period / 4);
    }

    /// Evaluate every condition that ends the current marking step. Returns
    /// false when the step must abort.
    fn regular_clock_call(&mut self) -> bool {
        if self.cm.has_aborted() {
            return false;
        }
        self.calls += 1;

        if self.step_start.elapsed() > self.time_target {
            self.has_timed_out = true;
            return false;
        }
        if self.cm.has_overflown() {
            return false;
        }
        if !self.draining_satb_buffers && self.cm.satb().completed_buffers_exist() {
            return false;
        }
        true
    }

    #[inline]
    fn abort_marking_if_regular_check_fail(&mut self) {
        if !self.regular_clock_call() {
            self.has_aborted = true;
        }
    }

    #[inline]
    fn check_limits(&mut self) {
        if self.words_scanned >= self.words_scanned_limit
            || self.refs_reached >= self.refs_reached_limit
        {
            self.abort_marking_if_regular_check_fail();
            if !self.has_aborted {
                self.recalculate_limits();
            }
        }
    }

    // ------------------------------------------------------------------
    // Grey-set discipline

    /// Mark `obj` in the bitmap; on the 0 -> 1 transition account its size
    /// to the region's liveness through the cache.
    fn mark_in_bitmap(&mut self, obj: Address, region_idx: usize) -> bool {
        debug_assert!(obj < self.cm.top_at_mark_start(region_idx));
        if !self.cm.bitmap().mark_atomic(obj) {
            return false;
        }
        let size = self.model.size_words(obj);
        self.stats_cache.add_live_words(region_idx, size);
        true
    }

    /// Would the bitmap sweep still visit `obj`? Everything below the
    /// global finger must be pushed: the sweep consumes a cached copy of
    /// each bitmap word, so a bit set in a word it already loaded - even
    /// one ahead of the local finger in the current region - is never seen
    /// by it again.
    fn is_below_finger(&self, obj: Address, global_finger: Address) -> bool {
        obj < global_finger
    }

    /// Grey `obj`: mark it, and push it if the sweep would otherwise miss
    /// it. Returns whether this call set the mark bit.
    fn make_reference_grey(&mut self, obj: Address, region_idx: usize) -> bool {
        if !self.mark_in_bitmap(obj, region_idx) {
            return false;
        }
        // No explicit ordering is needed between the mark and this finger
        // read; the compare-and-swap in mark_atomic orders the bit store
        // ahead of the load, so a sweep that claimed past obj after this
        // point observes the bit.
        let global_finger = self.cm.finger();
        if self.is_below_finger(obj, global_finger) {
            self.push(TaskEntry::from_obj(obj));
        }
        true
    }

    /// Process one outgoing reference of a scanned object.
    fn deal_with_reference(&mut self, obj: Address) {
        self.refs_reached += 1;
        if obj == 0 {
            return;
        }
        debug_assert!(self.cm.layout().contains(obj), "stray reference {:#x}", obj);
        let region_idx = self.cm.layout().region_index(obj);
        if obj >= self.cm.top_at_mark_start(region_idx) {
            // Allocated since the cycle started; implicitly live.
            return;
        }
        self.stats_cache.inc_incoming_refs(region_idx);
        self.make_reference_grey(obj, region_idx);
    }

    /// SATB entries go through the same filter but may reference any part
    /// of the heap, including objects the barrier logged redundantly.
    fn deal_with_satb_entry(&mut self, prev: Address) {
        if prev == 0 || !self.cm.layout().contains(prev) {
            return;
        }
        self.deal_with_reference(prev);
    }

    // ------------------------------------------------------------------
    // Object scanning

    /// Scan one grey entry: visit the references of an object, or one slice
    /// of a large reference array.
    fn scan_task_entry(&mut self, entry: TaskEntry) {
        let words = if entry.is_array_slice() {
            self.process_slice(entry.slice())
        } else {
            let obj = entry.obj();
            debug_assert!(self.cm.bitmap().is_marked(obj));
            let size = self.model.size_words(obj);
            if self.should_be_sliced(obj, size) {
                self.process_obj_array(obj)
            } else {
                let model = self.model;
                model.iterate_refs(obj, |r| self.deal_with_reference(r));
                size
            }
        };
        self.words_scanned += words;
        self.check_limits();
    }

    fn should_be_sliced(&self, obj: Address, size_words: usize) -> bool {
        self.model.is_obj_array(obj) && size_words >= 2 * self.cm.options().obj_array_stride_refs
    }

    /// First contact with a large reference array: scan the first stride
    /// and leave the rest as a tagged continuation.
    fn process_obj_array(&mut self, obj: Address) -> usize {
        let data = self.model.array_data_start(obj);
        let end = data + self.model.obj_array_length(obj) * WORD_SIZE;
        // The header part up to the first element counts as scanned too.
        let header_words = (data - obj) / WORD_SIZE;
        header_words + self.process_array_slice(obj, data, end)
    }

    /// Continuation entry: recover the array from the slice address and
    /// scan one more stride.
    fn process_slice(&mut self, slice: Address) -> usize {
        let obj = self.model.block_start(slice);
        debug_assert!(self.model.is_obj_array(obj));
        debug_assert!(slice >= self.model.array_data_start(obj));
        let end = self.model.array_data_start(obj) + self.model.obj_array_length(obj) * WORD_SIZE;
        self.process_array_slice(obj, slice, end)
    }

    /// Scan `[from, min(from + stride, end))` of the array at `obj`. The
    /// next continuation is pushed before scanning so the clock stays
    /// responsive even on huge arrays.
    fn process_array_slice(&mut self, obj: Address, from: Address, end: Address) -> usize {
        let stride_bytes = self.cm.options().obj_array_stride_refs * WORD_SIZE;
        let to = (from + stride_bytes).min(end);
        if to < end {
            self.push(TaskEntry::from_slice(to));
        }
        let model = self.model;
        model.iterate_array_refs(obj, from, to, |r| self.deal_with_reference(r));
        (to - from) / WORD_SIZE
    }

    // ------------------------------------------------------------------
    // Queue plumbing

    /// Push onto the local queue, spilling a chunk to the global stack when
    /// it is full.
    fn push(&mut self, entry: TaskEntry) {
        if !self.queue.push(entry) {
            self.move_entries_to_global_stack();
            let pushed = self.queue.push(entry);
            debug_assert!(pushed, "local queue full after spill");
        }
    }

    /// Move up to a chunk's worth of local entries to the global stack.
    fn move_entries_to_global_stack(&mut self) {
        let mut buffer = [TaskEntry::EMPTY; ENTRIES_PER_CHUNK];
        let mut n = 0;
        while n < ENTRIES_PER_CHUNK {
            match self.queue.pop() {
                Some(entry) => {
                    buffer[n] = entry;
                    n += 1;
                }
                None => break,
            }
        }
        if n > 0 && !self.cm.mark_stack_push(&buffer) {
            // Global overflow; this cycle attempt is over.
            self.has_aborted = true;
        }
        self.decrease_limits();
    }

    /// Refill the local queue from one global chunk. Only called when the
    /// local queue is at or below its drain target, so the entries fit.
    fn get_entries_from_global_stack(&mut self) -> bool {
        let mut buffer = [TaskEntry::EMPTY; ENTRIES_PER_CHUNK];
        if !self.cm.mark_stack_pop(&mut buffer) {
            return false;
        }
        for &entry in buffer.iter() {
            if entry.is_empty() {
                break;
            }
            let pushed = self.queue.push(entry);
            debug_assert!(pushed, "local queue cannot hold a refilled chunk");
        }
        self.decrease_limits();
        true
    }

    fn drain_local_queue(&mut self, partially: bool) {
        let target = if partially { LOCAL_DRAIN_TARGET } else { 0 };
        while !self.has_aborted && self.queue.len() > target {
            match self.queue.pop() {
                Some(entry) => self.scan_task_entry(entry),
                None => break,
            }
        }
    }

    fn drain_global_stack(&mut self, partially: bool) {
        let target = if partially {
            self.cm.partial_mark_stack_target()
        } else {
            0
        };
        while !self.has_aborted && self.cm.mark_stack_size_entries() > target {
            if self.queue.len() > LOCAL_DRAIN_TARGET {
                // Local queue must have room before pulling a chunk.
                self.drain_local_queue(partially);
                continue;
            }
            if self.get_entries_from_global_stack() {
                self.drain_local_queue(partially);
            } else {
                break;
            }
        }
    }

    /// Keep taking completed SATB buffers until none remain. The flag keeps
    /// the clock from aborting the step for the very buffers being drained.
    fn drain_satb_buffers(&mut self) {
        if self.has_aborted {
            return;
        }
        self.draining_satb_buffers = true;
        while !self.has_aborted {
            match self.cm.satb().pop_completed() {
                Some(buffer) => {
                    for prev in buffer {
                        self.deal_with_satb_entry(prev);
                    }
                    self.cm.counters().record_satb_buffer();
                    self.abort_marking_if_regular_check_fail();
                }
                None => break,
            }
        }
        self.draining_satb_buffers = false;
        self.drain_local_queue(true);
        self.decrease_limits();
    }

    // ------------------------------------------------------------------
    // Region sweeping

    fn setup_for_region(&mut self, region_idx: usize) {
        self.curr_region = Some(region_idx);
        self.finger = self.cm.layout().region_bottom(region_idx);
        self.region_limit = self.cm.top_at_mark_start(region_idx);
        debug_assert!(self.finger < self.region_limit);
    }

    fn giveup_current_region(&mut self) {
        self.clear_region_fields();
    }

    pub(crate) fn clear_region_fields(&mut self) {
        self.curr_region = None;
        self.finger = 0;
        self.region_limit = 0;
    }

    /// Sweep the bitmap of the current region from the local finger up to
    /// TAMS, scanning every marked object. Aborting mid-region keeps the
    /// region and the finger; the next step resumes where this one stopped
    /// (re-scanning the finger object is benign, its children are marked).
    fn process_current_region(&mut self) {
        debug_assert!(self.curr_region.is_some());
        let cm = self.cm;
        let (start, limit) = (self.finger, self.region_limit);
        let finished = cm.bitmap().iterate_marked(start, limit, |addr| {
            self.finger = addr;
            self.scan_task_entry(TaskEntry::from_obj(addr));
            self.drain_local_queue(true);
            self.drain_global_stack(true);
            !self.has_aborted
        });
        if finished {
            self.giveup_current_region();
        } else {
            debug_assert!(self.has_aborted);
        }
    }

    fn claim_new_region(&mut self) {
        while !self.has_aborted && self.curr_region.is_none() {
            match self.cm.claim_region(self.worker_id) {
                Claim::Region(region_idx) => {
                    self.setup_for_region(region_idx);
                    self.decrease_limits();
                }
                Claim::Retry => {
                    // Empty region skipped; go back to the clock before
                    // trying for the next one.
                    self.abort_marking_if_regular_check_fail();
                }
                Claim::OutOfRegions => break,
            }
        }
    }

    // ------------------------------------------------------------------
    // Stealing and termination

    fn attempt_stealing(&mut self) {
        while !self.has_aborted {
            match self.cm.try_stealing(self.worker_id) {
                Some(entry) => {
                    self.scan_task_entry(entry);
                    self.drain_local_queue(false);
                    self.drain_global_stack(false);
                }
                None => break,
            }
        }
    }

    fn should_exit_termination(&mut self) -> bool {
        if !self.regular_clock_call() {
            return true;
        }
        !self.cm.mark_stack_is_empty() || !self.queue.is_empty()
    }

    fn attempt_termination(&mut self, is_serial: bool) {
        let finished = if is_serial {
            true
        } else {
            let terminator = self.cm.terminator();
            terminator.offer_termination(|| self.should_exit_termination())
        };
        if !finished {
            // Either new work appeared or a shared condition fired; abort
            // the step, the outer loop re-enters with a fresh budget.
            self.has_aborted = true;
        }
    }

    fn handle_abort(&mut self) {
        if self.has_timed_out {
            trace!(worker = self.worker_id, "marking step timed out");
        }
        if !self.cm.has_overflown() || self.cm.has_aborted() {
            return;
        }
        if self.cm.concurrent() {
            // Two-barrier restart: after the first barrier no worker
            // touches the global structures; worker 0 resets them, every
            // worker resets its own, and the second barrier releases the
            // restarted marking.
            if !self.cm.enter_first_overflow_barrier(self.worker_id) {
                return;
            }
            if self.worker_id == 0 {
                self.cm.reset_marking_for_restart();
            }
            self.clear_region_fields();
            self.queue.set_empty();
            self.cm.enter_second_overflow_barrier(self.worker_id);
        }
    }

    // ------------------------------------------------------------------

    /// One bounded marking step; see the type docs for the phases. The task
    /// exits early (with `has_aborted` set) on deadline, global overflow,
    /// pending SATB buffers or an external abort.
    pub fn do_marking_step(&mut self, target_ms: f64, do_termination: bool, is_serial: bool) {
        debug_assert!(!is_serial || self.worker_id == 0);
        self.step_start = Instant::now();
        self.time_target = Duration::from_secs_f64(target_ms.max(0.0) / 1000.0);
        self.has_aborted = self.cm.has_aborted();
        self.has_timed_out = false;
        self.draining_satb_buffers = false;
        self.words_scanned = 0;
        self.refs_reached = 0;
        self.recalculate_limits();

        self.drain_satb_buffers();
        self.drain_local_queue(true);
        self.drain_global_stack(true);

        loop {
            if !self.has_aborted && self.curr_region.is_some() {
                self.process_current_region();
            }
            self.claim_new_region();
            if self.has_aborted || self.curr_region.is_none() {
                break;
            }
        }

        if !self.has_aborted {
            // All regions are swept; whatever SATB logged so far is drained
            // here rather than waiting for the next step.
            self.drain_satb_buffers();
        }
        self.drain_local_queue(false);
        self.drain_global_stack(false);

        if !self.has_aborted {
            self.attempt_stealing();
        }

        if do_termination && !self.has_aborted {
            self.attempt_termination(is_serial);
        }

        self.steps += 1;
        self.step_time_total += self.step_start.elapsed();
        self.cm.counters().record_step();

        if self.has_aborted {
            self.stats_cache.flush_all();
            self.handle_abort();
        }
    }
}
