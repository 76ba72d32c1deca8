//! # Cinder
//!
//! Cinder is a concurrent, incremental, mostly-parallel mark engine for
//! region-partitioned managed heaps. It computes the transitive closure of
//! live objects while the application keeps mutating the object graph,
//! using a snapshot-at-the-beginning (SATB) discipline: every reference the
//! mutator overwrites after the cycle snapshot is logged by a write barrier
//! and re-examined by the markers, so the cycle marks the graph as it was
//! when the cycle started. Objects allocated during the cycle sit above
//! their region's top-at-mark-start (TAMS) and are implicitly live.
//!
//! The engine is built from:
//! - a 1-bit-per-granule concurrent [mark bitmap](bitmap::MarkBitmap),
//! - fixed-capacity [work-stealing deques](taskqueue::TaskQueue) feeding a
//!   lock-free [chunked global mark stack](mark_stack::MarkStack),
//! - per-worker [marking tasks](task::MarkTask) with adaptive time/work
//!   budgets,
//! - a [coordinator](concurrent_mark::ConcurrentMark) owning the cycle:
//!   root-region scanning, the region claim finger, stop-the-world remark,
//!   and overflow recovery through a two-barrier restart protocol.
//!
//! The embedding heap supplies the ambient contracts: region geometry
//! ([heap::HeapLayout]), the object model ([heap::ObjectModel]), safepoint
//! polling ([safepoint::SafepointGate]) and the SATB buffer producer
//! ([satb::SatbQueueSet]). Region allocation, evacuation and reference
//! processing policy stay outside.

pub mod barrier;
pub mod bitmap;
pub mod concurrent_mark;
pub mod heap;
pub mod mark_stack;
pub mod root_regions;
pub mod safepoint;
pub mod satb;
pub mod stats;
pub mod task;
pub mod taskqueue;
pub mod terminator;
pub mod utils;

#[cfg(test)]
mod tests;

pub use concurrent_mark::{Claim, ConcurrentMark, CycleCounters, Error, MarkOptions};
pub use heap::{Address, HeapLayout, ObjectModel, WORD_SIZE};
pub use task::MarkTask;
