use std::io;
use std::mem::size_of;
use std::sync::atomic::AtomicUsize;

use atomic::{Atomic, Ordering};
use memmap2::MmapMut;
use scoped_threadpool::Pool;

use crate::heap::Address;
use crate::safepoint::SafepointGate;
use crate::utils::align_up;

/// Bytes of heap covered by one mark bit.
pub const GRANULE: usize = 8;

const BITS_PER_WORD: usize = size_of::<usize>() * 8;

/// Heap bytes cleared per stripe of the parallel clear. One stripe covers a
/// cache-line-aligned run of bitmap words, so stripes never share a word.
const CLEAR_STRIPE_BYTES: usize = 256 * 1024;

/// One mark bit per 8-byte heap granule over `[heap_begin, heap_limit)`.
/// Bit for address A is `(A - heap_begin) / GRANULE`. Setting is a CAS loop
/// over the containing word; reads are plain atomic loads.
pub struct MarkBitmap {
    #[allow(dead_code)]
    mem_map: MmapMut,
    bitmap_begin: *mut Atomic<usize>,
    bitmap_size: usize,
    heap_begin: usize,
    heap_limit: usize,
}

// The raw bitmap pointer targets the anonymous mapping owned by `mem_map`;
// all accesses through it are atomic.
unsafe impl Send for MarkBitmap {}
unsafe impl Sync for MarkBitmap {}

impl MarkBitmap {
    pub fn new(heap_begin: Address, heap_capacity: usize) -> io::Result<Self> {
        let bitmap_size = Self::compute_bitmap_size(heap_capacity);
        let mut mem_map = MmapMut::map_anon(bitmap_size.max(size_of::<usize>()))?;
        let bitmap_begin = mem_map.as_mut_ptr() as *mut Atomic<usize>;
        Ok(Self {
            mem_map,
            bitmap_begin,
            bitmap_size,
            heap_begin,
            heap_limit: heap_begin + heap_capacity,
        })
    }

    pub fn compute_bitmap_size(capacity: usize) -> usize {
        let bytes_covered_per_word = GRANULE * BITS_PER_WORD;
        (align_up(capacity, bytes_covered_per_word) / bytes_covered_per_word) * size_of::<usize>()
    }

    #[inline]
    pub fn heap_begin(&self) -> usize {
        self.heap_begin
    }

    #[inline]
    pub fn heap_limit(&self) -> usize {
        self.heap_limit
    }

    #[inline]
    fn offset_to_index(offset: usize) -> usize {
        offset / GRANULE / BITS_PER_WORD
    }

    #[inline]
    fn index_to_offset(index: usize) -> usize {
        index * GRANULE * BITS_PER_WORD
    }

    #[inline]
    fn offset_bit_index(offset: usize) -> usize {
        (offset / GRANULE) % BITS_PER_WORD
    }

    #[inline]
    fn offset_to_mask(offset: usize) -> usize {
        1 << Self::offset_bit_index(offset)
    }

    #[inline]
    fn word(&self, index: usize) -> &Atomic<usize> {
        debug_assert!(
            index < self.bitmap_size / size_of::<usize>(),
            "bitmap_size: {}",
            self.bitmap_size
        );
        unsafe { &*self.bitmap_begin.add(index) }
    }

    /// Set the bit for `addr`. Returns true iff this call moved it 0 -> 1;
    /// exactly one caller observes true under concurrent attempts. The
    /// successful CAS is a release so readers of the bit see the object as
    /// it existed at mark time.
    #[inline]
    pub fn mark_atomic(&self, addr: Address) -> bool {
        debug_assert!(addr >= self.heap_begin && addr < self.heap_limit);
        let offset = addr - self.heap_begin;
        let index = Self::offset_to_index(offset);
        let mask = Self::offset_to_mask(offset);
        let entry = self.word(index);

        let mut old_word = entry.load(Ordering::Relaxed);
        loop {
            if (old_word & mask) != 0 {
                return false;
            }
            match entry.compare_exchange_weak(
                old_word,
                old_word | mask,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(w) => old_word = w,
            }
        }
    }

    #[inline]
    pub fn is_marked(&self, addr: Address) -> bool {
        debug_assert!(addr >= self.heap_begin && addr < self.heap_limit);
        let offset = addr - self.heap_begin;
        (self.word(Self::offset_to_index(offset)).load(Ordering::Acquire)
            & Self::offset_to_mask(offset))
            != 0
    }

    #[inline]
    pub fn clear_bit(&self, addr: Address) {
        let offset = addr - self.heap_begin;
        let entry = self.word(Self::offset_to_index(offset));
        let old = entry.load(Ordering::Relaxed);
        entry.store(old & !Self::offset_to_mask(offset), Ordering::Relaxed);
    }

    /// Clear all bits covering `[begin, end)`. Only valid while no marker is
    /// running (safepoint, or through the striped parallel clear).
    pub fn clear_range(&self, begin: Address, end: Address) {
        let mut begin_offset = begin - self.heap_begin;
        let mut end_offset = end - self.heap_begin;
        while begin_offset < end_offset && Self::offset_bit_index(begin_offset) != 0 {
            self.clear_bit(self.heap_begin + begin_offset);
            begin_offset += GRANULE;
        }
        while begin_offset < end_offset && Self::offset_bit_index(end_offset) != 0 {
            end_offset -= GRANULE;
            self.clear_bit(self.heap_begin + end_offset);
        }
        let index_begin = Self::offset_to_index(begin_offset);
        let index_end = Self::offset_to_index(end_offset);
        for index in index_begin..index_end {
            self.word(index).store(0, Ordering::Relaxed);
        }
    }

    pub fn clear_all(&self) {
        if self.heap_begin < self.heap_limit {
            self.clear_range(self.heap_begin, self.heap_limit);
        }
    }

    /// Clear the whole bitmap with the given pool, one stripe at a time.
    /// Workers poll the safepoint gate between stripes when `may_yield`.
    pub fn clear_parallel(&self, pool: &mut Pool, gate: &SafepointGate, may_yield: bool) {
        let num_stripes =
            (self.heap_limit - self.heap_begin + CLEAR_STRIPE_BYTES - 1) / CLEAR_STRIPE_BYTES;
        if num_stripes == 0 {
            return;
        }
        let cursor = AtomicUsize::new(0);
        let n_threads = pool.thread_count() as usize;
        pool.scoped(|scope| {
            for _ in 0..n_threads {
                let cursor = &cursor;
                scope.execute(move || loop {
                    let stripe = cursor.fetch_add(1, Ordering::Relaxed);
                    if stripe >= num_stripes {
                        break;
                    }
                    let begin = self.heap_begin + stripe * CLEAR_STRIPE_BYTES;
                    let end = (begin + CLEAR_STRIPE_BYTES).min(self.heap_limit);
                    self.clear_range(begin, end);
                    if may_yield && gate.should_yield() {
                        gate.do_yield();
                    }
                });
            }
        });
    }

    /// Visit marked granule addresses in `[visit_begin, visit_end)` in
    /// address order. The visitor returns false to stop early; the return
    /// value is false iff the walk was stopped.
    ///
    /// Bits may be set concurrently while visiting; each word is loaded once
    /// and newly set bits in an already consumed word are not reported.
    pub fn iterate_marked<F: FnMut(Address) -> bool>(
        &self,
        visit_begin: Address,
        visit_end: Address,
        mut visitor: F,
    ) -> bool {
        if visit_begin >= visit_end {
            return true;
        }
        let offset_start = visit_begin - self.heap_begin;
        let offset_last = visit_end - GRANULE - self.heap_begin;
        let index_start = Self::offset_to_index(offset_start);
        let index_last = Self::offset_to_index(offset_last);

        for index in index_start..=index_last {
            let mut w = self.word(index).load(Ordering::Acquire);
            if index == index_start {
                w &= !((1usize << Self::offset_bit_index(offset_start)) - 1);
            }
            if index == index_last {
                let last_bit = Self::offset_bit_index(offset_last);
                if last_bit + 1 < BITS_PER_WORD {
                    w &= (1usize << (last_bit + 1)) - 1;
                }
            }
            let ptr_base = Self::index_to_offset(index) + self.heap_begin;
            while w != 0 {
                let shift = w.trailing_zeros() as usize;
                let addr = ptr_base + shift * GRANULE;
                if !visitor(addr) {
                    return false;
                }
                w &= w - 1;
            }
        }
        true
    }
}
