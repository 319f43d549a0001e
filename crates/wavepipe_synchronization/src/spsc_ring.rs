//! A bounded SPSC ring buffer with an explicit reserve/commit contract.
//!
//! This ring connects every producer/consumer pair in the synthesis pipeline: command queues (elements are command
//! values, moved one at a time) and sample queues (elements are samples, moved a sub-block at a time).  The writer
//! reserves a contiguous run, fills it, then commits a count; the reader observes committed elements as a contiguous
//! run and releases what it consumed.  Handing out contiguous slices is the point: synthesis code fills the run
//! directly and pays for atomics only at the run boundaries.
//!
//! The single-producer/single-consumer restriction is enforced by ownership: exactly one [RingWriter] and one
//! [RingReader] exist per ring, neither is `Clone`, and neither is `Sync`.
//!
//! Each half caches the other half's cursor and re-reads it (an acquire load) only when the cached value shows too
//! little room or too little data.  In steady state a side therefore performs no cross-side atomic traffic at all
//! until it actually runs dry.  Nothing here blocks: a caller that finds insufficient space or data is expected to
//! spin via [crate::spin::spin_until] and retry.
//!
//! After `u64::MAX` elements have passed through, the ring panics.
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;

// Implementation:
//
// The standard two-cursor scheme, except the cursors never wrap: both are u64 element counts, `read <= write`, so
// `write - read` is the committed-and-unreleased element count and `capacity - (write - read)` is the free space.
// The backing index is `cursor & mask`, which requires the capacity to be a power of two; every capacity in this
// pipeline is a fixed system parameter, so the restriction costs nothing and saves a division on the hot path.
//
// Storage is default-initialized at construction.  Elements may carry enums and function pointers for which no
// all-zero bit pattern is valid, so uninitialized storage plus a byte-level trait bound is not an option here; a
// one-time `T::default()` fill at construction keeps every slice hand-out safe without `MaybeUninit` at the API
// boundary.
//
// If both sides always move in multiples of some divisor of the capacity, every contiguous run they observe is also a
// multiple of that divisor.  The sample path relies on this: with the capacity a multiple of the sub-block width and
// both sides moving whole sub-blocks, a full sub-block is always contiguous.

struct RingShared<T> {
    read: CachePadded<AtomicU64>,
    write: CachePadded<AtomicU64>,
    data: Box<[UnsafeCell<T>]>,
    mask: u64,
}

// Safety: the cursor discipline guarantees the regions the two sides touch are disjoint; the halves are each confined
// to one thread by not being Sync or Clone.
unsafe impl<T: Copy + Send> Sync for RingShared<T> {}
unsafe impl<T: Copy + Send> Send for RingShared<T> {}

impl<T: Copy + Default> RingShared<T> {
    fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Pointer to the element at a (wrapped) cursor position.
    fn slot_ptr(&self, cursor: u64) -> *mut T {
        let index = (cursor & self.mask) as usize;
        self.data[index].get()
    }

    /// Contiguous run length starting at `cursor`, capped by `len` and by the distance to the end of the backing
    /// array.
    fn contiguous(&self, cursor: u64, len: usize) -> usize {
        let index = (cursor & self.mask) as usize;
        len.min(self.capacity() - index)
    }
}

/// The writing half of a ring.  See [create_ring].
pub struct RingWriter<T: Copy + Default + Send + 'static> {
    ring: Arc<RingShared<T>>,

    /// Cached copy of the reader's cursor; refreshed only when it shows insufficient space.
    read_cache: u64,

    /// Length of the most recent [RingWriter::reserve] run, for commit validation.
    last_reserved: usize,

    /// Elements written past the committed cursor by [RingWriter::stage] but not yet published.
    staged: usize,
}

/// The reading half of a ring.  See [create_ring].
pub struct RingReader<T: Copy + Default + Send + 'static> {
    ring: Arc<RingShared<T>>,

    /// Cached copy of the writer's cursor; refreshed only when it shows insufficient data.
    write_cache: u64,
}

/// Allocate a ring with the given capacity.
///
/// # Panics
///
/// Panics unless `capacity` is a nonzero power of two.
pub fn create_ring<T: Copy + Default + Send + 'static>(
    capacity: usize,
) -> (RingReader<T>, RingWriter<T>) {
    assert!(
        capacity != 0 && capacity.is_power_of_two(),
        "ring capacities must be nonzero powers of two, got {capacity}"
    );

    let data = (0..capacity)
        .map(|_| UnsafeCell::new(T::default()))
        .collect::<Vec<_>>()
        .into_boxed_slice();

    let shared = Arc::new(RingShared {
        read: CachePadded::new(AtomicU64::new(0)),
        write: CachePadded::new(AtomicU64::new(0)),
        data,
        mask: capacity as u64 - 1,
    });

    (
        RingReader {
            ring: shared.clone(),
            write_cache: 0,
        },
        RingWriter {
            ring: shared,
            read_cache: 0,
            last_reserved: 0,
            staged: 0,
        },
    )
}

impl<T: Copy + Default + Send + 'static> RingWriter<T> {
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Free space as seen through the cached reader cursor, refreshing the cache if it shows less than `want`.
    ///
    /// The refresh is the acquire load the reader's releases pair with; doing it lazily is what keeps the steady-state
    /// hot path free of cross-side traffic.
    fn free(&mut self, want: usize) -> usize {
        let write = self.ring.write.load(Ordering::Relaxed);
        let mut free = self.capacity() - (write - self.read_cache) as usize;
        if free < want {
            self.read_cache = self.ring.read.load(Ordering::Acquire);
            free = self.capacity() - (write - self.read_cache) as usize;
        }
        free
    }

    /// Hint at how much space is available for writing.  An actual write will see at least this much.
    pub fn available(&mut self) -> usize {
        self.free(usize::MAX)
    }

    /// Does the ring currently have room for `n` more elements?
    pub fn can_write(&mut self, n: usize) -> bool {
        self.free(n) >= n
    }

    /// Reserve a contiguous run of up to `max` elements for writing.
    ///
    /// The returned slice may be shorter than `max` (it stops at the wrap point or at the reader's cursor) and may be
    /// empty.  Nothing is visible to the reader until [RingWriter::commit] is called with the count actually filled.
    ///
    /// Must not be interleaved with staged single-element writes; commit or discard those first.
    pub fn reserve(&mut self, max: usize) -> &mut [T] {
        assert!(self.staged == 0, "reserve during a staged write run");

        let write = self.ring.write.load(Ordering::Relaxed);
        let free = self.free(max);
        let run = self.ring.contiguous(write, free.min(max));
        self.last_reserved = run;

        // Safety: the run lies entirely in free space, which the reader will not touch until a commit publishes it.
        unsafe { std::slice::from_raw_parts_mut(self.ring.slot_ptr(write), run) }
    }

    /// Publish the first `n` elements of the most recent reservation.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the most recently reserved run, or if the ring has carried more than `u64::MAX`
    /// elements.
    pub fn commit(&mut self, n: usize) {
        assert!(
            n <= self.last_reserved,
            "commit of {n} exceeds reservation of {}",
            self.last_reserved
        );
        self.last_reserved = 0;

        let old = self.ring.write.fetch_add(n as u64, Ordering::Release);
        old.checked_add(n as u64).expect("the ring wrapped");
    }

    /// Write one element past any previously staged ones, without publishing it.
    ///
    /// Returns false if the ring has no room.  Staged elements become visible to the reader only on
    /// [RingWriter::commit_staged]; this is what lets a distributor fill a partial batch and flush it as a unit.
    pub fn stage(&mut self, item: T) -> bool {
        if self.free(self.staged + 1) < self.staged + 1 {
            return false;
        }

        let write = self.ring.write.load(Ordering::Relaxed) + self.staged as u64;
        // Safety: this slot is beyond the committed cursor and within free space.
        unsafe { self.ring.slot_ptr(write).write(item) };
        self.staged += 1;
        true
    }

    /// Publish all staged elements, returning how many there were.
    pub fn commit_staged(&mut self) -> usize {
        let n = std::mem::take(&mut self.staged);
        if n != 0 {
            let old = self.ring.write.fetch_add(n as u64, Ordering::Release);
            old.checked_add(n as u64).expect("the ring wrapped");
        }
        n
    }

    /// Number of elements currently staged but unpublished.
    pub fn staged(&self) -> usize {
        self.staged
    }

    /// Convenience: copy as much of `src` as fits, committing immediately.  Returns the count written.
    pub fn write_from_slice(&mut self, src: &[T]) -> usize {
        let mut written = 0;
        while written < src.len() {
            let run = self.reserve(src.len() - written);
            if run.is_empty() {
                break;
            }
            let n = run.len();
            run.copy_from_slice(&src[written..written + n]);
            self.commit(n);
            written += n;
        }
        written
    }
}

impl<T: Copy + Default + Send + 'static> RingReader<T> {
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Committed elements as seen through the cached writer cursor, refreshing the cache if it shows less than
    /// `want`.
    fn filled(&mut self, want: usize) -> usize {
        let read = self.ring.read.load(Ordering::Relaxed);
        let mut filled = (self.write_cache - read) as usize;
        if filled < want {
            self.write_cache = self.ring.write.load(Ordering::Acquire);
            filled = (self.write_cache - read) as usize;
        }
        filled
    }

    /// Hint at how much data is available for reading.  An actual read will see at least this much.
    pub fn available(&mut self) -> usize {
        self.filled(usize::MAX)
    }

    /// Does the ring currently hold at least `n` elements?
    pub fn can_read(&mut self, n: usize) -> bool {
        self.filled(n) >= n
    }

    /// The contiguous run of committed elements, up to `max` long.
    ///
    /// May be shorter than the total available (it stops at the wrap point) and may be empty.  The elements remain in
    /// the ring until [RingReader::release].
    pub fn readable(&mut self, max: usize) -> &[T] {
        let read = self.ring.read.load(Ordering::Relaxed);
        let filled = self.filled(max);
        let run = self.ring.contiguous(read, filled.min(max));

        // Safety: the run is committed data the writer will not touch until it is released.
        unsafe { std::slice::from_raw_parts(self.ring.slot_ptr(read), run) }
    }

    /// Copy of the oldest unreleased element, if any.
    pub fn peek(&mut self) -> Option<T> {
        self.readable(1).first().copied()
    }

    /// Release `n` consumed elements back to the writer.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds what is available, or if the ring has carried more than `u64::MAX` elements.
    pub fn release(&mut self, n: usize) {
        let filled = self.filled(n);
        assert!(filled >= n, "release of {n} exceeds available {filled}");

        let old = self.ring.read.fetch_add(n as u64, Ordering::Release);
        old.checked_add(n as u64).expect("the ring wrapped");
    }

    /// Convenience: read as much as possible into `dst`, releasing immediately.  Returns the count read.
    pub fn read_to_slice(&mut self, dst: &mut [T]) -> usize {
        let mut read = 0;
        while read < dst.len() {
            let run = self.readable(dst.len() - read);
            if run.is_empty() {
                break;
            }
            let n = run.len();
            dst[read..read + n].copy_from_slice(run);
            self.release(n);
            read += n;
        }
        read
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread::spawn;

    use pretty_assertions::assert_eq;

    // Note on strategy: model checkers dislike what is in effect a spinlock, and this ring is entirely that.  So we
    // hammer it with real threads and assert the data survives intact, plus proptest over single-threaded interleaved
    // batch patterns.

    #[test]
    fn test_write_read_single() {
        let (mut reader, mut writer) = create_ring::<u64>(8);

        for i in 0..32u64 {
            assert!(writer.stage(i));
            writer.commit_staged();
            assert_eq!(reader.peek(), Some(i));
            reader.release(1);
        }
    }

    #[test]
    fn test_fills_and_rejects() {
        let (mut reader, mut writer) = create_ring::<u64>(4);

        for i in 0..4u64 {
            assert!(writer.stage(i));
        }
        assert!(!writer.stage(99));
        assert_eq!(writer.commit_staged(), 4);

        assert_eq!(reader.available(), 4);
        reader.release(4);
        assert!(writer.can_write(4));
    }

    #[test]
    fn test_staged_invisible_until_commit() {
        let (mut reader, mut writer) = create_ring::<u64>(8);

        assert!(writer.stage(1));
        assert!(writer.stage(2));
        assert_eq!(reader.available(), 0);

        writer.commit_staged();
        assert_eq!(reader.available(), 2);
        assert_eq!(reader.readable(8), &[1, 2]);
    }

    #[test]
    fn test_reserve_commit_partial() {
        let (mut reader, mut writer) = create_ring::<u32>(16);

        let run = writer.reserve(16);
        assert_eq!(run.len(), 16);
        run[..3].copy_from_slice(&[7, 8, 9]);
        writer.commit(3);

        assert_eq!(reader.readable(16), &[7, 8, 9]);
        reader.release(3);
    }

    /// With the capacity a multiple of the batch size and both sides moving whole batches, every run is contiguous
    /// and batch-aligned.
    #[test]
    fn test_block_multiples_stay_contiguous() {
        const BATCH: usize = 8;
        let (mut reader, mut writer) = create_ring::<u32>(32);

        for round in 0..64u32 {
            let run = writer.reserve(BATCH);
            assert_eq!(run.len() % BATCH, 0);
            for (i, slot) in run[..BATCH].iter_mut().enumerate() {
                *slot = round * BATCH as u32 + i as u32;
            }
            writer.commit(BATCH);

            let got = reader.readable(BATCH);
            assert_eq!(got.len(), BATCH);
            for (i, &v) in got.iter().enumerate() {
                assert_eq!(v, round * BATCH as u32 + i as u32);
            }
            reader.release(BATCH);
        }
    }

    #[test]
    fn test_hammer_multithreaded() {
        const TOTAL: u64 = 100_000;
        let (mut reader, mut writer) = create_ring::<u64>(64);

        let bg = spawn(move || {
            let mut next = 0u64;
            while next < TOTAL {
                if writer.stage(next) {
                    writer.commit_staged();
                    next += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        });

        let mut expected = 0u64;
        while expected < TOTAL {
            match reader.peek() {
                Some(v) => {
                    assert_eq!(v, expected);
                    reader.release(1);
                    expected += 1;
                }
                None => std::thread::yield_now(),
            }
        }

        bg.join().unwrap();
    }

    #[test]
    fn test_hammer_batched_multithreaded() {
        const TOTAL: usize = 90_000;
        const WRITE_BATCH: usize = 48;
        const READ_BATCH: usize = 32;

        let (mut reader, mut writer) = create_ring::<u64>(256);

        let bg = spawn(move || {
            let mut next = 0usize;
            while next < TOTAL {
                let batch: Vec<u64> = (next..(next + WRITE_BATCH).min(TOTAL))
                    .map(|x| x as u64)
                    .collect();
                let mut done = 0;
                while done < batch.len() {
                    done += writer.write_from_slice(&batch[done..]);
                    if done < batch.len() {
                        std::thread::yield_now();
                    }
                }
                next += batch.len();
            }
        });

        let mut got = Vec::with_capacity(TOTAL);
        let mut buf = [0u64; READ_BATCH];
        while got.len() < TOTAL {
            let n = reader.read_to_slice(&mut buf);
            if n == 0 {
                std::thread::yield_now();
                continue;
            }
            got.extend_from_slice(&buf[..n]);
        }

        assert_eq!(got, (0..TOTAL as u64).collect::<Vec<_>>());
        bg.join().unwrap();
    }

    mod properties {
        use super::*;

        use proptest::prelude::*;

        proptest! {
            /// For any interleaving of bounded write and read batches, the reader observes exactly the written
            /// sequence, in order, with no loss.
            #[test]
            fn round_trip(batches in proptest::collection::vec((1usize..20, 1usize..20), 1..60)) {
                let (mut reader, mut writer) = create_ring::<u64>(32);

                let mut written: Vec<u64> = vec![];
                let mut read_back: Vec<u64> = vec![];
                let mut next = 0u64;

                for (write_n, read_n) in batches {
                    let batch: Vec<u64> = (next..next + write_n as u64).collect();
                    let accepted = writer.write_from_slice(&batch);
                    written.extend_from_slice(&batch[..accepted]);
                    next += accepted as u64;

                    let mut buf = vec![0u64; read_n];
                    let got = reader.read_to_slice(&mut buf);
                    read_back.extend_from_slice(&buf[..got]);
                }

                // Drain the remainder.
                let mut buf = [0u64; 32];
                loop {
                    let got = reader.read_to_slice(&mut buf);
                    if got == 0 {
                        break;
                    }
                    read_back.extend_from_slice(&buf[..got]);
                }

                prop_assert_eq!(read_back, written);
            }
        }
    }
}
