//! Spin-waiting with an explicit, testable contract.
//!
//! Every hot-path wait in this pipeline is a spin with a CPU-yield hint, bounded only by an external stop flag.  That
//! is a deliberate latency-over-efficiency tradeoff: a condition variable or a sleep trades bounded tail latency for
//! average CPU use, which is the wrong trade for a sample stream that underruns if a single deadline is missed.
//! Rather than scattering ad-hoc loops through the pipeline, the wait is expressed once here so the real-time contract
//! is visible at every call site.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::utils::Backoff;

/// Spin until `predicate` returns true or `stop` is set.
///
/// Returns true if the predicate was satisfied, false if the wait was abandoned because the stop flag tripped.  The
/// predicate is re-evaluated on every iteration; it should be cheap (a cursor comparison, an atomic load).
///
/// The backoff starts with busy spins and escalates to `thread::yield_now` hints.  It never sleeps and never parks.
pub fn spin_until<F: FnMut() -> bool>(mut predicate: F, stop: &AtomicBool) -> bool {
    let backoff = Backoff::new();
    loop {
        if predicate() {
            return true;
        }
        if stop.load(Ordering::Acquire) {
            return false;
        }
        backoff.snooze();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    #[test]
    fn test_satisfied_immediately() {
        let stop = AtomicBool::new(false);
        assert!(spin_until(|| true, &stop));
    }

    #[test]
    fn test_stop_abandons() {
        let stop = AtomicBool::new(true);
        assert!(!spin_until(|| false, &stop));
    }

    #[test]
    fn test_cross_thread_wakeup() {
        let stop = Arc::new(AtomicBool::new(false));
        let counter = Arc::new(AtomicU64::new(0));

        let bg = {
            let counter = counter.clone();
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    counter.fetch_add(1, Ordering::Release);
                }
            })
        };

        assert!(spin_until(
            || counter.load(Ordering::Acquire) == 1000,
            &stop
        ));
        bg.join().unwrap();
    }
}
