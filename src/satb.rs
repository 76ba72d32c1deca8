use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::heap::Address;

/// Default capacity of a mutator-side buffer of captured pre-overwrite
/// references.
pub const SATB_BUFFER_CAPACITY: usize = 1024;

/// Thread-local buffer the write barrier fills with the previous values of
/// overwritten reference slots. When full it is handed to the global queue
/// set as a completed buffer.
pub struct SatbBuffer {
    entries: Vec<Address>,
    capacity: usize,
}

impl SatbBuffer {
    pub fn new() -> Self {
        Self::with_capacity(SATB_BUFFER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Record one pre-overwrite value. Returns false when the buffer is
    /// full and must be flushed first.
    pub fn push(&mut self, prev: Address) -> bool {
        if self.entries.len() == self.capacity {
            return false;
        }
        self.entries.push(prev);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hand the buffered entries to the queue set, leaving this buffer
    /// empty for reuse.
    pub fn flush(&mut self, set: &SatbQueueSet) {
        if self.entries.is_empty() {
            return;
        }
        let mut drained = Vec::with_capacity(self.capacity);
        std::mem::swap(&mut drained, &mut self.entries);
        set.enqueue_completed(drained);
    }
}

impl Default for SatbBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Global queue of completed SATB buffers. The write barrier side enqueues;
/// marking tasks poll `completed_buffers_exist` at their clock and drain
/// with `pop_completed`. The barrier is only obliged to log while `active`.
pub struct SatbQueueSet {
    completed: Mutex<VecDeque<Vec<Address>>>,
    num_completed: AtomicUsize,
    active: AtomicBool,
}

impl SatbQueueSet {
    pub fn new() -> Self {
        Self {
            completed: Mutex::new(VecDeque::new()),
            num_completed: AtomicUsize::new(0),
            active: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn set_active(&self, value: bool) {
        self.active.store(value, Ordering::Release);
    }

    pub fn enqueue_completed(&self, buffer: Vec<Address>) {
        if buffer.is_empty() {
            return;
        }
        let mut completed = self.completed.lock();
        completed.push_back(buffer);
        self.num_completed.fetch_add(1, Ordering::Release);
    }

    /// Fast poll used by the marking clock; racy by design.
    #[inline]
    pub fn completed_buffers_exist(&self) -> bool {
        self.num_completed.load(Ordering::Acquire) != 0
    }

    pub fn pop_completed(&self) -> Option<Vec<Address>> {
        let mut completed = self.completed.lock();
        let buffer = completed.pop_front()?;
        self.num_completed.fetch_sub(1, Ordering::Release);
        Some(buffer)
    }

    /// Drop all pending buffers, e.g. when a cycle is abandoned.
    pub fn abandon_partial_marking(&self) {
        let mut completed = self.completed.lock();
        completed.clear();
        self.num_completed.store(0, Ordering::Release);
    }
}

impl Default for SatbQueueSet {
    fn default() -> Self {
        Self::new()
    }
}
