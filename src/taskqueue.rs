use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::heap::Address;

/// One word of marking work: either an object reference or an array-slice
/// continuation address, discriminated by the low bit. Object references are
/// at least word aligned so the tag bit never collides with a real address.
/// Null is reserved as the empty slot / chunk terminator.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct TaskEntry(usize);

const ARRAY_SLICE_BIT: usize = 1;

impl TaskEntry {
    pub const EMPTY: TaskEntry = TaskEntry(0);

    #[inline]
    pub fn from_obj(obj: Address) -> Self {
        debug_assert!(obj != 0, "null is not a pushable entry");
        debug_assert!(obj & ARRAY_SLICE_BIT == 0, "unaligned object address");
        TaskEntry(obj)
    }

    #[inline]
    pub fn from_slice(addr: Address) -> Self {
        debug_assert!(addr & ARRAY_SLICE_BIT == 0);
        TaskEntry(addr | ARRAY_SLICE_BIT)
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn is_array_slice(self) -> bool {
        self.0 & ARRAY_SLICE_BIT != 0
    }

    #[inline]
    pub fn is_obj(self) -> bool {
        !self.is_empty() && !self.is_array_slice()
    }

    #[inline]
    pub fn obj(self) -> Address {
        debug_assert!(self.is_obj(), "reading entry {:#x} as object", self.0);
        self.0
    }

    #[inline]
    pub fn slice(self) -> Address {
        debug_assert!(self.is_array_slice(), "reading entry {:#x} as slice", self.0);
        self.0 & !ARRAY_SLICE_BIT
    }
}

/// Fixed-capacity work-stealing deque of task entries. The owning worker
/// pushes and pops at the bottom without synchronization; thieves steal from
/// the top with a CAS. Chase-Lev discipline: the only contended transition
/// is the last-element race, resolved by a CAS on `top`.
pub struct TaskQueue {
    buffer: Box<[UnsafeCell<TaskEntry>]>,
    mask: usize,
    bottom: CachePadded<AtomicUsize>,
    top: CachePadded<AtomicUsize>,
}

// Slot accesses are guarded by the bottom/top protocol: push writes a slot
// only while it is outside the [top, bottom) window, and the release store
// of bottom publishes it before any thief can read it.
unsafe impl Send for TaskQueue {}
unsafe impl Sync for TaskQueue {}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two());
        let buffer = (0..capacity)
            .map(|_| UnsafeCell::new(TaskEntry::EMPTY))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buffer,
            mask: capacity - 1,
            bottom: CachePadded::new(AtomicUsize::new(0)),
            top: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Owner-side push. Returns false when the queue is full.
    pub fn push(&self, entry: TaskEntry) -> bool {
        debug_assert!(!entry.is_empty());
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);

        if b.wrapping_sub(t) >= self.capacity() {
            return false;
        }

        unsafe {
            *self.buffer[b & self.mask].get() = entry;
        }
        // Publish the slot before advancing bottom so a thief that observes
        // the new bottom also observes the entry.
        self.bottom.store(b.wrapping_add(1), Ordering::Release);
        true
    }

    /// Owner-side pop (LIFO end).
    pub fn pop(&self) -> Option<TaskEntry> {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        if b == t {
            return None;
        }

        let new_b = b.wrapping_sub(1);
        self.bottom.store(new_b, Ordering::Release);
        // Thieves racing with this pop must see the decremented bottom
        // before the top CAS below decides the last-element race.
        std::sync::atomic::fence(Ordering::SeqCst);

        let entry = unsafe { *self.buffer[new_b & self.mask].get() };

        let t = self.top.load(Ordering::Acquire);
        if new_b != t {
            return Some(entry);
        }

        // Last element: decide against concurrent thieves.
        let won = self
            .top
            .compare_exchange(t, t.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        self.bottom.store(t.wrapping_add(1), Ordering::Release);
        if won {
            Some(entry)
        } else {
            None
        }
    }

    /// Thief-side steal (FIFO end). May be called from any thread.
    pub fn steal(&self) -> Option<TaskEntry> {
        let t = self.top.load(Ordering::Acquire);
        std::sync::atomic::fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);
        if (b.wrapping_sub(t) as isize) <= 0 {
            return None;
        }

        let entry = unsafe { *self.buffer[t & self.mask].get() };
        if self
            .top
            .compare_exchange(t, t.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        Some(entry)
    }

    #[inline]
    pub fn len(&self) -> usize {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        b.wrapping_sub(t)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reset to empty. Only valid while all workers are quiesced (overflow
    /// barrier, or between cycles).
    pub fn set_empty(&self) {
        self.bottom.store(0, Ordering::Relaxed);
        self.top.store(0, Ordering::Relaxed);
    }
}
