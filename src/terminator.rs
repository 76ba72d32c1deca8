use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// Unanimous termination protocol for the marking workers. A worker with no
/// work offers termination; the offer only succeeds once every worker has
/// offered. A caller-supplied predicate pulls the worker back out when work
/// reappears (stolen entries landing on the global stack, SATB buffers) or
/// when the cycle must unwind (overflow, abort).
pub struct Terminator {
    const_nworkers: AtomicUsize,
    nworkers: AtomicUsize,
}

impl Terminator {
    pub fn new(number_workers: usize) -> Terminator {
        Terminator {
            const_nworkers: AtomicUsize::new(number_workers),
            nworkers: AtomicUsize::new(number_workers),
        }
    }

    /// Re-arm for a phase with `n` active workers.
    pub fn reset(&self, n: usize) {
        self.const_nworkers.store(n, Ordering::Relaxed);
        self.nworkers.store(n, Ordering::Relaxed);
    }

    /// Returns true when all workers agreed to terminate; false when the
    /// exit predicate fired first and the caller should resume working.
    pub fn offer_termination(&self, mut should_exit: impl FnMut() -> bool) -> bool {
        if self.const_nworkers.load(Ordering::Relaxed) == 1 {
            return true;
        }

        if self.decrease_workers() {
            return true;
        }

        loop {
            thread::sleep(Duration::from_micros(1));

            if self.nworkers.load(Ordering::Relaxed) == 0 {
                return true;
            }

            if should_exit() {
                // Re-register unless everyone else finished in the meantime.
                return self.zero_or_increase_workers();
            }
        }
    }

    fn decrease_workers(&self) -> bool {
        self.nworkers.fetch_sub(1, Ordering::Relaxed) == 1
    }

    fn zero_or_increase_workers(&self) -> bool {
        let mut nworkers = self.nworkers.load(Ordering::Relaxed);

        loop {
            if nworkers == 0 {
                return true;
            }

            let result = self.nworkers.compare_exchange(
                nworkers,
                nworkers + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            );

            match result {
                Ok(_) => {
                    // Successfully re-registered; there is work left.
                    return false;
                }

                Err(prev_nworkers) => {
                    nworkers = prev_nworkers;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn single_worker_terminates_immediately() {
        let t = Terminator::new(1);
        assert!(t.offer_termination(|| false));
    }

    #[test]
    fn all_workers_agree() {
        let t = Arc::new(Terminator::new(4));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let t = t.clone();
            handles.push(std::thread::spawn(move || t.offer_termination(|| false)));
        }
        for h in handles {
            assert!(h.join().unwrap());
        }
    }

    #[test]
    fn exit_predicate_pulls_worker_back() {
        let t = Arc::new(Terminator::new(2));
        let work_appeared = Arc::new(AtomicBool::new(false));

        // One worker sits in the protocol until the flag fires; the other
        // never offers, so unanimous termination is impossible.
        let result = {
            let t = t.clone();
            let flag = work_appeared.clone();
            std::thread::spawn(move || t.offer_termination(|| flag.load(Ordering::Relaxed)))
        };
        std::thread::sleep(Duration::from_millis(10));
        work_appeared.store(true, Ordering::Relaxed);
        assert!(!result.join().unwrap());

        // The worker re-registered, so a full round still terminates.
        let t2 = t.clone();
        let other = std::thread::spawn(move || t2.offer_termination(|| false));
        assert!(t.offer_termination(|| false));
        assert!(other.join().unwrap());
    }

    #[test]
    fn reset_rearms_for_next_phase() {
        let t = Terminator::new(3);
        t.reset(1);
        assert!(t.offer_termination(|| false));
    }
}
