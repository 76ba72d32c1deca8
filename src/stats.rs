use std::sync::atomic::{AtomicUsize, Ordering};

use crate::heap::WORD_SIZE;

/// Liveness numbers a marking cycle gathers per region: words of marked
/// objects below TAMS and an approximate count of references found pointing
/// into the region.
pub struct RegionMarkStats {
    live_words: AtomicUsize,
    incoming_refs: AtomicUsize,
}

impl RegionMarkStats {
    pub fn new() -> Self {
        Self {
            live_words: AtomicUsize::new(0),
            incoming_refs: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn add_live_words(&self, words: usize) {
        self.live_words.fetch_add(words, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_incoming_refs(&self, refs: usize) {
        self.incoming_refs.fetch_add(refs, Ordering::Relaxed);
    }

    #[inline]
    pub fn live_words(&self) -> usize {
        self.live_words.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn live_bytes(&self) -> usize {
        self.live_words() * WORD_SIZE
    }

    #[inline]
    pub fn incoming_refs(&self) -> usize {
        self.incoming_refs.load(Ordering::Relaxed)
    }

    pub fn set_live_words(&self, words: usize) {
        self.live_words.store(words, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        self.live_words.store(0, Ordering::Relaxed);
        self.incoming_refs.store(0, Ordering::Relaxed);
    }
}

impl Default for RegionMarkStats {
    fn default() -> Self {
        Self::new()
    }
}

const INVALID_REGION: usize = usize::MAX;

#[derive(Clone, Copy)]
struct CacheEntry {
    region_idx: usize,
    live_words: usize,
    incoming_refs: usize,
}

/// Per-worker write-combining cache in front of the global region stats.
/// Direct mapped by `region_idx mod N`; a miss flushes the evicted entry
/// into the global table with atomic adds and installs the new region.
pub struct MarkStatsCache<'a> {
    global: &'a [RegionMarkStats],
    entries: Box<[CacheEntry]>,
    mask: usize,
    hits: usize,
    misses: usize,
}

impl<'a> MarkStatsCache<'a> {
    pub fn new(global: &'a [RegionMarkStats], num_entries: usize) -> Self {
        assert!(num_entries.is_power_of_two());
        let entries = vec![
            CacheEntry {
                region_idx: INVALID_REGION,
                live_words: 0,
                incoming_refs: 0,
            };
            num_entries
        ]
        .into_boxed_slice();
        Self {
            global,
            entries,
            mask: num_entries - 1,
            hits: 0,
            misses: 0,
        }
    }

    #[inline]
    fn entry_for(&mut self, region_idx: usize) -> &mut CacheEntry {
        let slot = region_idx & self.mask;
        if self.entries[slot].region_idx == region_idx {
            self.hits += 1;
        } else {
            self.misses += 1;
            self.evict(slot);
            self.entries[slot].region_idx = region_idx;
        }
        &mut self.entries[slot]
    }

    #[inline]
    pub fn add_live_words(&mut self, region_idx: usize, words: usize) {
        self.entry_for(region_idx).live_words += words;
    }

    #[inline]
    pub fn inc_incoming_refs(&mut self, region_idx: usize) {
        self.entry_for(region_idx).incoming_refs += 1;
    }

    fn evict(&mut self, slot: usize) {
        let entry = &mut self.entries[slot];
        if entry.region_idx == INVALID_REGION {
            return;
        }
        if entry.live_words != 0 {
            self.global[entry.region_idx].add_live_words(entry.live_words);
        }
        if entry.incoming_refs != 0 {
            self.global[entry.region_idx].add_incoming_refs(entry.incoming_refs);
        }
        entry.region_idx = INVALID_REGION;
        entry.live_words = 0;
        entry.incoming_refs = 0;
    }

    /// Drain every entry into the global table. Returns the accumulated
    /// (hits, misses) of this cache.
    pub fn flush_all(&mut self) -> (usize, usize) {
        for slot in 0..self.entries.len() {
            self.evict(slot);
        }
        (self.hits, self.misses)
    }
}
