//! Trigger state cells and id allocation.
//!
//! A [TriggerCell] is the per-stream published trigger state: the most recent external start trigger (id and device
//! time) written by the manager, and the end-trigger id the stream has most recently reached, read and acknowledged
//! by outer layers.  Everything is individually published atomics; no locks, no channels.

use std::sync::atomic::{AtomicU64, Ordering};

/// Sentinel for "no end trigger published".  Trigger ids start at 1.
pub(crate) const NO_TRIGGER: u64 = 0;

#[derive(Debug, Default)]
pub(crate) struct TriggerCell {
    /// Count of external start-trigger events observed, as forwarded by the manager.
    start_id: AtomicU64,

    /// Device time (sub-blocks) of the most recent start trigger.
    start_time: AtomicU64,

    /// End-trigger id the stream has reached and published; cleared by the consumer's acknowledgement.
    end_published: AtomicU64,
}

impl TriggerCell {
    /// Publish an external start trigger.  Manager side.
    pub fn set_start(&self, id: u64, time: u64) {
        // Time first: a reader that sees the new id must also see its time.
        self.start_time.store(time, Ordering::Release);
        self.start_id.store(id, Ordering::Release);
    }

    /// The most recent start trigger as `(id, time)`.  Stream side.
    pub fn start(&self) -> (u64, u64) {
        let id = self.start_id.load(Ordering::Acquire);
        let time = self.start_time.load(Ordering::Acquire);
        (id, time)
    }

    /// Publish a reached end trigger if the previous one has been acknowledged.  Returns whether it was taken.
    pub fn try_publish_end(&self, id: u64) -> bool {
        self.end_published
            .compare_exchange(NO_TRIGGER, id, Ordering::Release, Ordering::Relaxed)
            .is_ok()
    }

    /// The currently published end-trigger id, or [NO_TRIGGER].
    pub fn end_published(&self) -> u64 {
        self.end_published.load(Ordering::Acquire)
    }

    /// Acknowledge (clear) the published end trigger, making room for the next pending one.
    pub fn ack_end(&self) {
        self.end_published.store(NO_TRIGGER, Ordering::Release);
    }

    pub fn reset(&self) {
        self.start_id.store(0, Ordering::Release);
        self.start_time.store(0, Ordering::Release);
        self.end_published.store(NO_TRIGGER, Ordering::Release);
    }
}

/// Monotonic allocators for start- and end-trigger ids, handed to the RPC front-end.
///
/// Ids are per-manager and never reused; 0 is reserved as "none".
#[derive(Debug)]
pub struct TriggerIdAllocator {
    next_start: AtomicU64,
    next_end: AtomicU64,
}

impl Default for TriggerIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl TriggerIdAllocator {
    pub fn new() -> Self {
        Self {
            next_start: AtomicU64::new(1),
            next_end: AtomicU64::new(1),
        }
    }

    pub fn get_start_id(&self) -> u64 {
        self.next_start.fetch_add(1, Ordering::Relaxed)
    }

    pub fn get_end_id(&self) -> u64 {
        self.next_end.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_publish_requires_ack() {
        let cell = TriggerCell::default();

        assert!(cell.try_publish_end(3));
        assert!(!cell.try_publish_end(4));
        assert_eq!(cell.end_published(), 3);

        cell.ack_end();
        assert!(cell.try_publish_end(4));
        assert_eq!(cell.end_published(), 4);
    }

    #[test]
    fn test_start_roundtrip() {
        let cell = TriggerCell::default();
        cell.set_start(5, 1000);
        assert_eq!(cell.start(), (5, 1000));
    }

    #[test]
    fn test_id_allocators_monotonic() {
        let alloc = TriggerIdAllocator::new();
        let a = alloc.get_start_id();
        let b = alloc.get_start_id();
        assert!(b > a);
        assert!(a >= 1);

        let e1 = alloc.get_end_id();
        let e2 = alloc.get_end_id();
        assert!(e2 > e1);
    }
}
