use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

/// Safepoint polling surface consumed by the marking workers. A control
/// thread arms the gate when it needs the workers parked; workers poll
/// `should_yield` at coarse boundaries (between regions, between bitmap
/// stripes) and park in `do_yield` until the gate is released.
pub struct SafepointGate {
    requested: AtomicBool,
    parked: Mutex<usize>,
    cv_release: Condvar,
    cv_parked: Condvar,
}

impl SafepointGate {
    pub fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
            parked: Mutex::new(0),
            cv_release: Condvar::new(),
            cv_parked: Condvar::new(),
        }
    }

    #[inline]
    pub fn should_yield(&self) -> bool {
        self.requested.load(Ordering::Relaxed)
    }

    /// Park until the pending request is released. Returns immediately if
    /// no request is pending.
    pub fn do_yield(&self) {
        if !self.should_yield() {
            return;
        }
        let mut parked = self.parked.lock();
        *parked += 1;
        self.cv_parked.notify_all();
        while self.requested.load(Ordering::Acquire) {
            self.cv_release.wait(&mut parked);
        }
        *parked -= 1;
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
    }

    /// Block until at least `count` workers are parked at the gate.
    pub fn wait_for_parked(&self, count: usize) {
        let mut parked = self.parked.lock();
        while *parked < count {
            self.cv_parked.wait(&mut parked);
        }
    }

    pub fn release(&self) {
        let parked = self.parked.lock();
        self.requested.store(false, Ordering::Release);
        self.cv_release.notify_all();
        drop(parked);
    }
}

impl Default for SafepointGate {
    fn default() -> Self {
        Self::new()
    }
}
