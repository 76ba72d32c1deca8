use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

struct BarrierState {
    arrived: usize,
    generation: usize,
}

/// Unanimous rendezvous for the marking workers. The generation counter
/// lets the same barrier be entered again and again (the overflow protocol
/// enters its two barriers once per restart) without reallocation and
/// without a departing waiter racing a fresh arrival.
pub struct BarrierSync {
    state: Mutex<BarrierState>,
    cv: Condvar,
    n_workers: AtomicUsize,
    aborted: AtomicBool,
}

impl BarrierSync {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
            }),
            cv: Condvar::new(),
            n_workers: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
        }
    }

    /// Set the number of workers that must arrive before anyone is
    /// released. Only between phases, never while workers may be waiting.
    pub fn set_n_workers(&self, n: usize) {
        debug_assert!(n > 0);
        let state = self.state.lock();
        debug_assert_eq!(state.arrived, 0);
        self.n_workers.store(n, Ordering::Relaxed);
        self.aborted.store(false, Ordering::Relaxed);
        drop(state);
    }

    /// Wait until all workers arrive. Returns false when the barrier was
    /// aborted, in which case waiters are released without rendezvous.
    pub fn enter(&self) -> bool {
        if self.aborted.load(Ordering::Acquire) {
            return false;
        }
        let mut state = self.state.lock();
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.n_workers.load(Ordering::Relaxed) {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.cv.notify_all();
            return !self.aborted.load(Ordering::Relaxed);
        }
        while state.generation == generation && !self.aborted.load(Ordering::Relaxed) {
            self.cv.wait(&mut state);
        }
        !self.aborted.load(Ordering::Relaxed)
    }

    /// Release everyone waiting and make subsequent `enter` calls fail
    /// until the next `set_n_workers`.
    pub fn abort(&self) {
        let state = self.state.lock();
        self.aborted.store(true, Ordering::Release);
        self.cv.notify_all();
        drop(state);
    }
}

impl Default for BarrierSync {
    fn default() -> Self {
        Self::new()
    }
}
