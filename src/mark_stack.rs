use std::ptr::{self, null_mut};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use tracing::debug;

use crate::taskqueue::TaskEntry;
use crate::utils::find_highest_bit;

/// Entries per chunk; one slot of the 1024-word allocation pays for the
/// intrusive next pointer.
pub const ENTRIES_PER_CHUNK: usize = 1024 - 1;

#[repr(C)]
pub struct Chunk {
    next: *mut Chunk,
    data: [TaskEntry; ENTRIES_PER_CHUNK],
}

impl Chunk {
    fn empty() -> Self {
        Self {
            next: null_mut(),
            data: [TaskEntry::EMPTY; ENTRIES_PER_CHUNK],
        }
    }
}

/// Growable chunk arena behind the global mark stack. An array of arrays:
/// bucket 0 holds the first `min_capacity` chunks and every further bucket
/// doubles the total capacity, so chunks never move once handed out. A flat
/// chunk index maps to (bucket, offset) with two highest-bit computations.
struct ChunkAllocator {
    min_capacity: usize,
    max_capacity: usize,
    capacity: AtomicUsize,
    should_grow: AtomicBool,
    buckets: Box<[AtomicPtr<Chunk>]>,
    num_reserved_buckets: AtomicUsize,
    growth_lock: Mutex<()>,
    size: CachePadded<AtomicUsize>,
}

impl ChunkAllocator {
    fn new(initial_capacity: usize, max_capacity: usize) -> Self {
        assert!(initial_capacity.is_power_of_two());
        assert!(max_capacity >= initial_capacity);
        let max_capacity = initial_capacity * (max_capacity / initial_capacity).next_power_of_two();
        let num_buckets = find_highest_bit(max_capacity / initial_capacity) as usize + 1;
        let buckets = (0..num_buckets)
            .map(|_| AtomicPtr::new(null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let this = Self {
            min_capacity: initial_capacity,
            max_capacity,
            capacity: AtomicUsize::new(0),
            should_grow: AtomicBool::new(false),
            buckets,
            num_reserved_buckets: AtomicUsize::new(0),
            growth_lock: Mutex::new(()),
            size: CachePadded::new(AtomicUsize::new(0)),
        };
        let grew = this.try_expand();
        debug_assert!(grew);
        this
    }

    fn bucket_size(&self, bucket: usize) -> usize {
        if bucket == 0 {
            self.min_capacity
        } else {
            self.min_capacity << (bucket - 1)
        }
    }

    fn get_bucket(&self, idx: usize) -> usize {
        if idx < self.min_capacity {
            0
        } else {
            (find_highest_bit(idx) - find_highest_bit(self.min_capacity) + 1) as usize
        }
    }

    fn get_bucket_index(&self, idx: usize) -> usize {
        if idx < self.min_capacity {
            idx
        } else {
            idx - (1usize << find_highest_bit(idx))
        }
    }

    fn chunk_at(&self, idx: usize) -> *mut Chunk {
        let bucket = self.get_bucket(idx);
        let offset = self.get_bucket_index(idx);
        let base = self.buckets[bucket].load(Ordering::Acquire);
        debug_assert!(!base.is_null());
        unsafe { base.add(offset) }
    }

    fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    fn set_should_grow(&self, value: bool) {
        self.should_grow.store(value, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.size.store(0, Ordering::Relaxed);
        self.should_grow.store(false, Ordering::Relaxed);
    }

    /// Reserve the next bucket, doubling capacity. Serialized by the growth
    /// lock; never moves already handed out chunks.
    fn try_expand(&self) -> bool {
        let _guard = self.growth_lock.lock();
        let cur = self.capacity.load(Ordering::Relaxed);
        if cur >= self.max_capacity {
            return false;
        }
        let bucket = self.num_reserved_buckets.load(Ordering::Relaxed);
        let len = self.bucket_size(bucket);
        let mut chunks = Vec::with_capacity(len);
        chunks.resize_with(len, Chunk::empty);
        let raw = Box::into_raw(chunks.into_boxed_slice()) as *mut Chunk;
        self.buckets[bucket].store(raw, Ordering::Release);
        self.num_reserved_buckets.store(bucket + 1, Ordering::Relaxed);
        self.capacity.store(cur + len, Ordering::Release);
        debug!(
            old_capacity = cur,
            new_capacity = cur + len,
            "mark stack capacity grown"
        );
        true
    }

    fn allocate_new_chunk(&self) -> *mut Chunk {
        loop {
            let cur = self.size.fetch_add(1, Ordering::Relaxed);
            if cur >= self.max_capacity {
                return null_mut();
            }
            if cur < self.capacity.load(Ordering::Acquire) {
                return self.chunk_at(cur);
            }
            if !self.should_grow.load(Ordering::Relaxed) || !self.try_expand() {
                return null_mut();
            }
            if cur < self.capacity.load(Ordering::Acquire) {
                return self.chunk_at(cur);
            }
            // Raced past the grown capacity; the skipped index stays a hole
            // until the next reset.
        }
    }
}

impl Drop for ChunkAllocator {
    fn drop(&mut self) {
        for bucket in 0..self.num_reserved_buckets.load(Ordering::Relaxed) {
            let raw = self.buckets[bucket].load(Ordering::Relaxed);
            if !raw.is_null() {
                unsafe {
                    drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                        raw,
                        self.bucket_size(bucket),
                    )));
                }
            }
        }
    }
}

/// Global overflow stack shared by all marking tasks. Chunks are the unit
/// of transfer with the task-local queues; partially filled chunks are null
/// terminated. Two lock-free lists: occupied chunks and free chunks.
///
/// The CAS pop is safe against ABA because chunks are never freed during a
/// cycle; a chunk only moves between these two lists, and the lists are only
/// bulk-reset while every worker is quiesced at the overflow barriers.
pub struct MarkStack {
    chunk_allocator: ChunkAllocator,
    free_list: CachePadded<AtomicPtr<Chunk>>,
    chunk_list: CachePadded<AtomicPtr<Chunk>>,
    chunks_in_chunk_list: AtomicUsize,
}

unsafe impl Send for MarkStack {}
unsafe impl Sync for MarkStack {}

impl MarkStack {
    pub fn new(initial_capacity_chunks: usize, max_capacity_chunks: usize) -> Self {
        Self {
            chunk_allocator: ChunkAllocator::new(initial_capacity_chunks, max_capacity_chunks),
            free_list: CachePadded::new(AtomicPtr::new(null_mut())),
            chunk_list: CachePadded::new(AtomicPtr::new(null_mut())),
            chunks_in_chunk_list: AtomicUsize::new(0),
        }
    }

    fn add_chunk_to_list(list: &AtomicPtr<Chunk>, elem: *mut Chunk) {
        let mut old = list.load(Ordering::Relaxed);
        loop {
            unsafe {
                (*elem).next = old;
            }
            match list.compare_exchange_weak(old, elem, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => return,
                Err(cur) => old = cur,
            }
        }
    }

    fn remove_chunk_from_list(list: &AtomicPtr<Chunk>) -> *mut Chunk {
        let mut cur = list.load(Ordering::Acquire);
        while !cur.is_null() {
            let next = unsafe { (*cur).next };
            match list.compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return cur,
                Err(newer) => cur = newer,
            }
        }
        null_mut()
    }

    /// Push a buffer of up to `ENTRIES_PER_CHUNK` entries; fewer entries
    /// must be terminated by a null entry. Returns false when no chunk can
    /// be acquired, in which case the caller flags global overflow.
    pub fn par_push_chunk(&self, buffer: &[TaskEntry; ENTRIES_PER_CHUNK]) -> bool {
        let mut new_chunk = Self::remove_chunk_from_list(&self.free_list);
        if new_chunk.is_null() {
            new_chunk = self.chunk_allocator.allocate_new_chunk();
            if new_chunk.is_null() {
                return false;
            }
        }
        unsafe {
            (*new_chunk).data = *buffer;
        }
        Self::add_chunk_to_list(&self.chunk_list, new_chunk);
        self.chunks_in_chunk_list.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Pop one chunk into `buffer`. Returns false iff the chunk list is
    /// empty. The popped chunk is recycled onto the free list.
    pub fn par_pop_chunk(&self, buffer: &mut [TaskEntry; ENTRIES_PER_CHUNK]) -> bool {
        let chunk = Self::remove_chunk_from_list(&self.chunk_list);
        if chunk.is_null() {
            return false;
        }
        self.chunks_in_chunk_list.fetch_sub(1, Ordering::Relaxed);
        unsafe {
            *buffer = (*chunk).data;
        }
        Self::add_chunk_to_list(&self.free_list, chunk);
        true
    }

    /// Racy emptiness probe, exact once all workers are quiesced.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.chunk_list.load(Ordering::Acquire).is_null()
    }

    /// Approximate entry count; racy for the same reason as `is_empty`.
    #[inline]
    pub fn size_entries(&self) -> usize {
        self.chunks_in_chunk_list.load(Ordering::Relaxed) * ENTRIES_PER_CHUNK
    }

    #[inline]
    pub fn capacity_chunks(&self) -> usize {
        self.chunk_allocator.capacity()
    }

    pub fn set_should_grow(&self, value: bool) {
        self.chunk_allocator.set_should_grow(value);
    }

    /// Double the capacity. Only while stopped-the-world and empty.
    pub fn expand(&self) -> bool {
        debug_assert!(self.is_empty());
        self.chunk_allocator.try_expand()
    }

    /// Bulk reset both lists and the allocator bump index. Only while every
    /// worker is quiesced (overflow barriers, or between cycles).
    pub fn set_empty(&self) {
        self.chunk_list.store(null_mut(), Ordering::Relaxed);
        self.free_list.store(null_mut(), Ordering::Relaxed);
        self.chunks_in_chunk_list.store(0, Ordering::Relaxed);
        self.chunk_allocator.reset();
    }

    /// Number of chunks currently parked on the free list. Walks the list;
    /// quiesced callers only.
    pub fn free_list_len(&self) -> usize {
        let mut n = 0;
        let mut cur = self.free_list.load(Ordering::Acquire);
        while !cur.is_null() {
            n += 1;
            cur = unsafe { (*cur).next };
        }
        n
    }

    /// Apply `f` to every entry on the stack. The stack must not be
    /// modified while iterating.
    pub fn iterate<F: FnMut(TaskEntry)>(&self, mut f: F) {
        let mut cur = self.chunk_list.load(Ordering::Acquire);
        while !cur.is_null() {
            unsafe {
                for &entry in (*cur).data.iter() {
                    if entry.is_empty() {
                        break;
                    }
                    f(entry);
                }
                cur = (*cur).next;
            }
        }
    }
}
