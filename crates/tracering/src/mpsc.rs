use crate::invariants::{
    debug_assert_bounded_count, debug_assert_free_stamp, debug_assert_written_stamp,
};
use crate::{Metrics, MetricsSnapshot, PushError};
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

// =============================================================================
// SLOT STAMP PROTOCOL
// =============================================================================
//
// Bounded multi-producer queue in the style of Vyukov's array queue, with one
// consumer. Positions are unbounded u64 sequence numbers; the slot for
// position `p` is `p % capacity`, so any capacity ≥ 1 works.
//
// Every slot carries a stamp that says what the slot is ready for:
//
//   stamp == 2p       slot is free for the producer claiming position p
//   stamp == 2p + 1   slot holds the value written at position p
//
// Producer: load `tail`, look at the slot stamp.
//   - stamp == 2·tail       → CAS tail to tail+1; the winner owns the slot,
//                             writes the value, stores stamp 2·tail+1 (Release)
//   - stamp <  2·tail       → slot still holds a value from the previous lap:
//                             the queue is full, fail immediately
//   - stamp >  2·tail       → another producer won; reload tail and retry
//
// Consumer: the slot at `head` is readable iff stamp == 2·head+1 (Acquire).
// It moves the value out and stores stamp 2·(head+capacity) (Release), which
// frees the slot for the producer one lap later.
//
// Doubling the positions keeps "free for p+1" and "written at p" distinct
// even when capacity is 1.
//
// A failed push never waits on another thread: it either observes a full
// slot or loses a CAS to a producer that made progress.
//
// Close: a producer bumps `pushing` before it checks `closed`, and drops it
// only after the slot is stamped. `close` stores `closed` before anyone reads
// `pushing`. With both sides SeqCst, a push either sees the ring closed or is
// counted by `is_sealed`, so a consumer that waits for `is_sealed` and then
// drains finds every admitted item.
//
// =============================================================================

struct Slot<T> {
    stamp: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Stores the "written" stamp when dropped, so a panicking inspector cannot
/// leave a claimed slot unpublished.
struct PublishOnDrop<'a> {
    stamp: &'a AtomicU64,
    written_at: u64,
}

impl Drop for PublishOnDrop<'_> {
    fn drop(&mut self) {
        self.stamp.store(self.written_at, Ordering::Release);
    }
}

/// Marks one push in progress for as long as it lives.
struct PushInProgress<'a>(&'a AtomicUsize);

impl<'a> PushInProgress<'a> {
    fn enter(pushing: &'a AtomicUsize) -> Self {
        pushing.fetch_add(1, Ordering::SeqCst);
        Self(pushing)
    }
}

impl Drop for PushInProgress<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Bounded multi-producer single-consumer ring buffer.
///
/// Any number of threads may [`push`](MpscRing::push) concurrently; a push
/// never blocks and fails fast when the ring is full or closed. Exactly one
/// thread may consume at a time.
pub struct MpscRing<T> {
    /// Next position to claim (CAS by producers)
    tail: CachePadded<AtomicU64>,
    /// Next position to read (written by the consumer only)
    head: CachePadded<AtomicU64>,
    /// Pushes between the closed check and the stamp store
    pushing: CachePadded<AtomicUsize>,
    closed: AtomicBool,
    enable_metrics: bool,
    metrics: Metrics,
    slots: Box<[Slot<T>]>,
}

// Safety: values are moved between threads through slots whose ownership is
// transferred by the stamp protocol; T: Send is all that is required.
unsafe impl<T: Send> Send for MpscRing<T> {}
unsafe impl<T: Send> Sync for MpscRing<T> {}

impl<T> MpscRing<T> {
    /// Creates a ring with exactly `capacity` slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize, enable_metrics: bool) -> Self {
        assert!(capacity > 0, "MpscRing capacity must be at least 1");

        let slots = (0..capacity as u64)
            .map(|pos| Slot {
                stamp: AtomicU64::new(pos * 2),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            tail: CachePadded::new(AtomicU64::new(0)),
            head: CachePadded::new(AtomicU64::new(0)),
            pushing: CachePadded::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
            enable_metrics,
            metrics: Metrics::new(),
            slots,
        }
    }

    #[inline]
    fn slot(&self, pos: u64) -> &Slot<T> {
        &self.slots[(pos % self.slots.len() as u64) as usize]
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Approximate number of queued items (exact when quiescent).
    #[inline]
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (tail.saturating_sub(head) as usize).min(self.capacity())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Free slots, as seen by a producer right now.
    #[inline]
    pub fn remaining_capacity(&self) -> usize {
        self.capacity() - self.len()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the ring. Items already pushed stay readable.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// True once the ring is closed and no push is still under way.
    ///
    /// From then on the set of admitted items is final and every one of them
    /// is readable, so draining until [`pop`](MpscRing::pop) returns `None`
    /// consumes all of them.
    pub fn is_sealed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) && self.pushing.load(Ordering::SeqCst) == 0
    }

    // ---------------------------------------------------------------------
    // PRODUCER API (any thread)
    // ---------------------------------------------------------------------

    /// Push without waiting. On failure the item is handed back.
    pub fn push(&self, item: T) -> Result<(), PushError<T>> {
        self.push_inspect(item, |_| {})
    }

    /// Push without waiting, letting `inspect` borrow the item after it has
    /// been admitted but before the consumer can see it.
    ///
    /// `inspect` runs only when the push succeeds. It holds up the consumer
    /// at this slot, so keep it short. The slot is published even if
    /// `inspect` panics.
    pub fn push_inspect<F>(&self, item: T, inspect: F) -> Result<(), PushError<T>>
    where
        F: FnOnce(&T),
    {
        let _in_progress = PushInProgress::enter(&self.pushing);
        if self.closed.load(Ordering::SeqCst) {
            self.record_rejected();
            return Err(PushError::Closed(item));
        }

        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = self.slot(pos);
            let stamp = slot.stamp.load(Ordering::Acquire);
            let free_for_pos = pos.wrapping_mul(2);
            let diff = stamp.wrapping_sub(free_for_pos) as i64;

            if diff == 0 {
                match self.tail.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        debug_assert_free_stamp!(stamp, pos);
                        // SAFETY: winning the CAS for `pos` while the stamp
                        // said "free for pos" gives this thread exclusive
                        // access to the slot until the stamp is advanced.
                        let written = unsafe { (*slot.value.get()).write(item) };
                        let _publish = PublishOnDrop {
                            stamp: &slot.stamp,
                            written_at: free_for_pos + 1,
                        };
                        inspect(&*written);
                        if self.enable_metrics {
                            self.metrics.add_messages_sent(1);
                        }
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                self.record_rejected();
                return Err(PushError::Full(item));
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    #[inline]
    fn record_rejected(&self) {
        if self.enable_metrics {
            self.metrics.add_rejected(1);
        }
    }

    // ---------------------------------------------------------------------
    // CONSUMER API (one thread at a time)
    // ---------------------------------------------------------------------

    /// Pops the oldest item, if its producer has finished writing it.
    pub fn pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let slot = self.slot(head);
        let stamp = slot.stamp.load(Ordering::Acquire);
        if stamp != head.wrapping_mul(2).wrapping_add(1) {
            return None;
        }
        debug_assert_written_stamp!(stamp, head);

        // SAFETY: the "written at head" stamp was published with Release by
        // the producer after the value was written; only the consumer reads
        // slots, and it releases the slot below.
        let item = unsafe { (*slot.value.get()).assume_init_read() };
        let next_lap = head.wrapping_add(self.capacity() as u64);
        slot.stamp.store(next_lap.wrapping_mul(2), Ordering::Release);
        self.head.store(head.wrapping_add(1), Ordering::Release);

        debug_assert_bounded_count!(
            self.tail.load(Ordering::Relaxed).saturating_sub(head) as usize,
            self.capacity()
        );
        Some(item)
    }

    /// Consume up to `max_items` in arrival order, transferring ownership.
    ///
    /// Stops early at the first slot whose producer has claimed but not yet
    /// written it, which keeps FIFO order intact.
    pub fn consume_up_to_owned<F>(&self, max_items: usize, mut handler: F) -> usize
    where
        F: FnMut(T),
    {
        let mut count = 0;
        while count < max_items {
            match self.pop() {
                Some(item) => {
                    handler(item);
                    count += 1;
                }
                None => break,
            }
        }

        if count > 0 && self.enable_metrics {
            self.metrics.add_messages_received(count as u64);
            self.metrics.add_batches_received(1);
        }
        count
    }

    /// Consume everything currently readable.
    pub fn consume_batch_owned<F>(&self, handler: F) -> usize
    where
        F: FnMut(T),
    {
        self.consume_up_to_owned(self.capacity(), handler)
    }

    /// Snapshot of the ring counters (zeroes when metrics are disabled).
    pub fn metrics(&self) -> MetricsSnapshot {
        if self.enable_metrics {
            self.metrics.snapshot()
        } else {
            MetricsSnapshot::default()
        }
    }
}

impl<T> Drop for MpscRing<T> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        let capacity = self.slots.len() as u64;

        let mut pos = head;
        while pos != tail {
            let slot = &mut self.slots[(pos % capacity) as usize];
            if *slot.stamp.get_mut() == pos.wrapping_mul(2).wrapping_add(1) {
                // SAFETY: the stamp marks this slot as holding the value
                // written at `pos`, which the consumer never moved out.
                unsafe {
                    slot.value.get_mut().assume_init_drop();
                }
            }
            pos = pos.wrapping_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_push_pop_fifo() {
        let ring = MpscRing::new(8, false);
        for i in 0..5u64 {
            ring.push(i).unwrap();
        }
        assert_eq!(ring.len(), 5);
        assert_eq!(ring.remaining_capacity(), 3);

        let mut seen = Vec::new();
        assert_eq!(ring.consume_batch_owned(|item| seen.push(item)), 5);
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_capacity_one() {
        let ring = MpscRing::new(1, true);
        ring.push("a").unwrap();
        assert_eq!(ring.push("b"), Err(PushError::Full("b")));

        assert_eq!(ring.pop(), Some("a"));
        assert_eq!(ring.pop(), None);

        ring.push("c").unwrap();
        assert_eq!(ring.push("d"), Err(PushError::Full("d")));
        assert_eq!(ring.pop(), Some("c"));

        let m = ring.metrics();
        assert_eq!(m.messages_sent, 2);
        assert_eq!(m.rejected, 2);
    }

    #[test]
    fn test_non_power_of_two_capacity_wraps() {
        let ring = MpscRing::new(3, false);
        let mut next = 0u64;
        let mut expected = 0u64;

        for _ in 0..10 {
            while ring.push(next).is_ok() {
                next += 1;
            }
            assert_eq!(ring.len(), 3);
            ring.consume_up_to_owned(2, |item| {
                assert_eq!(item, expected);
                expected += 1;
            });
        }
    }

    #[test]
    fn test_push_inspect_sees_admitted_item_only() {
        let ring = MpscRing::new(1, false);
        let mut seen = Vec::new();

        ring.push_inspect(7u32, |v| seen.push(*v)).unwrap();
        assert!(ring.push_inspect(8, |v| seen.push(*v)).is_err());
        assert_eq!(seen, vec![7]);
        assert_eq!(ring.pop(), Some(7));
    }

    #[test]
    fn test_push_inspect_panic_still_publishes() {
        let ring = MpscRing::new(2, false);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = ring.push_inspect(1u32, |_| panic!("inspector failed"));
        }));
        assert!(result.is_err());

        ring.push(2).unwrap();
        assert_eq!(ring.pop(), Some(1));
        assert_eq!(ring.pop(), Some(2));
    }

    #[test]
    fn test_closed_rejects_but_drains() {
        let ring = MpscRing::new(4, false);
        ring.push(1u32).unwrap();
        ring.close();

        assert_eq!(ring.push(2), Err(PushError::Closed(2)));
        assert_eq!(ring.pop(), Some(1));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn test_sealed_waits_for_push_in_progress() {
        use std::sync::mpsc;

        let ring = Arc::new(MpscRing::new(4, false));
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                ring.push_inspect(9u32, |_| {
                    entered_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                })
            })
        };

        entered_rx.recv().unwrap();
        ring.close();
        // Claimed but not yet stamped: neither readable nor sealed.
        assert!(!ring.is_sealed());
        assert_eq!(ring.pop(), None);

        release_tx.send(()).unwrap();
        assert!(producer.join().unwrap().is_ok());
        assert!(ring.is_sealed());
        assert_eq!(ring.pop(), Some(9));
        assert_eq!(ring.push(10), Err(PushError::Closed(10)));
    }

    #[test]
    fn test_open_ring_is_never_sealed() {
        let ring = MpscRing::<u32>::new(2, false);
        assert!(!ring.is_sealed());
        ring.close();
        assert!(ring.is_sealed());
    }

    #[test]
    fn test_concurrent_producers_no_loss() {
        const PRODUCERS: u64 = 8;
        const PER_PRODUCER: u64 = 10_000;

        let ring = Arc::new(MpscRing::new(64, false));
        let mut handles = Vec::new();
        for producer_id in 0..PRODUCERS {
            let ring = Arc::clone(&ring);
            handles.push(thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    let mut item = (producer_id << 32) | seq;
                    loop {
                        match ring.push(item) {
                            Ok(()) => break,
                            Err(e) => {
                                item = e.into_inner();
                                thread::yield_now();
                            }
                        }
                    }
                }
            }));
        }

        let mut last_seq = vec![None::<u64>; PRODUCERS as usize];
        let mut received = 0u64;
        while received < PRODUCERS * PER_PRODUCER {
            received += ring.consume_batch_owned(|item| {
                let producer = (item >> 32) as usize;
                let seq = item & 0xFFFF_FFFF;
                if let Some(prev) = last_seq[producer] {
                    assert!(seq > prev, "producer {} out of order", producer);
                }
                last_seq[producer] = Some(seq);
            }) as u64;
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(ring.is_empty());
        assert!(last_seq.iter().all(|s| *s == Some(PER_PRODUCER - 1)));
    }

    #[test]
    fn test_drop_releases_pending_items() {
        static DROP_COUNT: AtomicUsize = AtomicUsize::new(0);

        struct DropTracker;

        impl Drop for DropTracker {
            fn drop(&mut self) {
                DROP_COUNT.fetch_add(1, Ordering::SeqCst);
            }
        }

        DROP_COUNT.store(0, Ordering::SeqCst);
        {
            let ring = MpscRing::new(5, false);
            for _ in 0..4 {
                assert!(ring.push(DropTracker).is_ok());
            }
            drop(ring.pop());
            assert_eq!(DROP_COUNT.load(Ordering::SeqCst), 1);
        }
        assert_eq!(DROP_COUNT.load(Ordering::SeqCst), 4);
    }
}
