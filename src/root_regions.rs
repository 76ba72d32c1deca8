use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::heap::Address;

/// Address ranges that must be scanned before ordinary marking starts to
/// keep the start-of-cycle snapshot intact (survivor contents and objects
/// copied into old regions during the pause). Workers claim ranges through a
/// fetch-add cursor; completion is signaled through a condvar so concurrent
/// phases can block on it.
pub struct RootRegions {
    ranges: Box<[UnsafeCell<(Address, Address)>]>,
    num_ranges: AtomicUsize,
    claimed: AtomicUsize,
    scan_in_progress: AtomicBool,
    should_abort: AtomicBool,
    lock: Mutex<()>,
    scan_done: Condvar,
}

// Range slots are only written through `add` before `prepare_for_scan`
// publishes them; claimed slots are read-only afterwards.
unsafe impl Send for RootRegions {}
unsafe impl Sync for RootRegions {}

impl RootRegions {
    pub fn new(max_ranges: usize) -> Self {
        let ranges = (0..max_ranges)
            .map(|_| UnsafeCell::new((0, 0)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            ranges,
            num_ranges: AtomicUsize::new(0),
            claimed: AtomicUsize::new(0),
            scan_in_progress: AtomicBool::new(false),
            should_abort: AtomicBool::new(false),
            lock: Mutex::new(()),
            scan_done: Condvar::new(),
        }
    }

    /// Reset for a new cycle so ranges can be added again.
    pub fn reset(&self) {
        debug_assert!(!self.scan_in_progress());
        self.num_ranges.store(0, Ordering::Relaxed);
        self.claimed.store(0, Ordering::Relaxed);
        self.should_abort.store(false, Ordering::Relaxed);
    }

    pub fn add(&self, start: Address, end: Address) {
        debug_assert!(start < end);
        debug_assert!(!self.scan_in_progress());
        let idx = self.num_ranges.fetch_add(1, Ordering::Relaxed);
        assert!(idx < self.ranges.len(), "root region set overflow");
        unsafe {
            *self.ranges[idx].get() = (start, end);
        }
    }

    pub fn prepare_for_scan(&self) {
        debug_assert!(!self.scan_in_progress());
        self.claimed.store(0, Ordering::Relaxed);
        self.scan_in_progress.store(true, Ordering::Release);
    }

    pub fn num_root_regions(&self) -> usize {
        self.num_ranges.load(Ordering::Relaxed)
    }

    /// Forces subsequent claims to return None so the scan winds down.
    pub fn abort(&self) {
        self.should_abort.store(true, Ordering::Release);
    }

    #[inline]
    pub fn scan_in_progress(&self) -> bool {
        self.scan_in_progress.load(Ordering::Acquire)
    }

    /// Claim the next unscanned range, or None once all are claimed or the
    /// scan was aborted.
    pub fn claim_next(&self) -> Option<(Address, Address)> {
        if self.should_abort.load(Ordering::Acquire) {
            return None;
        }
        let num = self.num_ranges.load(Ordering::Relaxed);
        if self.claimed.load(Ordering::Relaxed) >= num {
            return None;
        }
        let idx = self.claimed.fetch_add(1, Ordering::Relaxed);
        if idx < num {
            Some(unsafe { *self.ranges[idx].get() })
        } else {
            None
        }
    }

    pub fn contains(&self, start: Address, end: Address) -> bool {
        let num = self.num_ranges.load(Ordering::Relaxed);
        (0..num).any(|i| unsafe { *self.ranges[i].get() } == (start, end))
    }

    /// Flag the scan finished and wake anyone blocked on it. With no abort
    /// pending every range must have been claimed.
    pub fn scan_finished(&self) {
        debug_assert!(
            self.should_abort.load(Ordering::Relaxed)
                || self.claimed.load(Ordering::Relaxed) >= self.num_ranges.load(Ordering::Relaxed)
        );
        let guard = self.lock.lock();
        self.scan_in_progress.store(false, Ordering::Release);
        self.scan_done.notify_all();
        drop(guard);
    }

    pub fn cancel_scan(&self) {
        self.abort();
        self.scan_finished();
    }

    /// Block until the scan is finished. Returns true if it had to wait.
    pub fn wait_until_scan_finished(&self) -> bool {
        if !self.scan_in_progress() {
            return false;
        }
        let mut guard = self.lock.lock();
        while self.scan_in_progress() {
            self.scan_done.wait(&mut guard);
        }
        true
    }
}
