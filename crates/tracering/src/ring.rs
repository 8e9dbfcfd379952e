use crate::invariants::{
    debug_assert_bounded_count, debug_assert_head_not_past_tail, debug_assert_initialized_read,
    debug_assert_monotonic,
};
use crate::{Backoff, Config, Metrics, MetricsSnapshot, PushError, Reservation};
use crossbeam_utils::sync::{Parker, Unparker};
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

// =============================================================================
// MEMORY ORDERING & SYNCHRONIZATION STRATEGY
// =============================================================================
//
// Classic SPSC protocol over unbounded u64 sequence numbers; the slot index
// is `sequence & mask`, so ABA cannot happen in practice.
//
// **Producer:** load `tail` Relaxed (sole writer), consult `cached_head`,
// refresh it from `head` with Acquire only when the cache says "full", write
// slots, publish with a Release store of `tail`.
//
// **Consumer:** mirror image over `head` / `cached_tail`.
//
// ## Blocking producer
//
// `push_blocking` spins with `Backoff`, then parks. Before parking it sets
// `producer_parked` (SeqCst) and re-tries the push; the consumer swaps the flag
// (SeqCst) after every head advance and unparks when it was set. Either the
// producer sees the freed slot or the consumer sees the flag. Parks are also
// bounded by `PARK_TIMEOUT` so a missed wake-up costs latency, never liveness.
//
// =============================================================================

/// Upper bound on a single park inside [`Ring::push_blocking`].
const PARK_TIMEOUT: Duration = Duration::from_millis(10);

/// SPSC ring buffer.
///
/// One producer thread, one consumer thread. Used as the serialized-payload
/// stage of a pipeline: the producer may block when the ring is full, which
/// pushes backpressure upstream without ever dropping work already done.
pub struct Ring<T> {
    // === PRODUCER HOT ===
    /// Tail index (written by producer, read by consumer)
    tail: CachePadded<AtomicU64>,
    /// Producer's cached view of head
    cached_head: CachePadded<UnsafeCell<u64>>,

    // === CONSUMER HOT ===
    /// Head index (written by consumer, read by producer)
    head: CachePadded<AtomicU64>,
    /// Consumer's cached view of tail
    cached_tail: CachePadded<UnsafeCell<u64>>,

    // === COLD STATE ===
    closed: AtomicBool,
    producer_parked: AtomicBool,
    parked_producer: Mutex<Option<Unparker>>,
    metrics: Metrics,
    config: Config,

    buffer: UnsafeCell<Box<[MaybeUninit<T>]>>,
}

// Safety: Ring is Send + Sync as long as T is Send; the atomics above order
// every slot hand-off between the single producer and the single consumer.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    /// Creates a new ring buffer with the given configuration.
    pub fn new(config: Config) -> Self {
        let capacity = config.capacity();
        let mut buffer = Vec::with_capacity(capacity);
        buffer.resize_with(capacity, MaybeUninit::uninit);

        Self {
            tail: CachePadded::new(AtomicU64::new(0)),
            cached_head: CachePadded::new(UnsafeCell::new(0)),
            head: CachePadded::new(AtomicU64::new(0)),
            cached_tail: CachePadded::new(UnsafeCell::new(0)),
            closed: AtomicBool::new(false),
            producer_parked: AtomicBool::new(false),
            parked_producer: Mutex::new(None),
            metrics: Metrics::new(),
            config,
            buffer: UnsafeCell::new(buffer.into_boxed_slice()),
        }
    }

    // ---------------------------------------------------------------------
    // STATUS
    // ---------------------------------------------------------------------

    #[inline]
    pub fn capacity(&self) -> usize {
        self.config.capacity()
    }

    #[inline]
    fn mask(&self) -> usize {
        self.config.mask()
    }

    /// Returns the current number of items in the ring.
    #[inline]
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // ---------------------------------------------------------------------
    // PRODUCER API
    // ---------------------------------------------------------------------

    /// Reserve n slots for zero-copy writing. Returns None if full/closed.
    ///
    /// The reservation may hold fewer than `n` slots when it would wrap.
    /// Fast path uses the cached head; the slow path refreshes it.
    pub fn reserve(&self, n: usize) -> Option<Reservation<'_, T>> {
        if n == 0 || n > self.capacity() || self.is_closed() {
            return None;
        }

        let tail = self.tail.load(Ordering::Relaxed);

        // SAFETY: cached_head is only touched by the producer.
        let cached_head = unsafe { *self.cached_head.get() };
        let space = self
            .capacity()
            .saturating_sub(tail.wrapping_sub(cached_head) as usize);
        if space >= n {
            return Some(self.make_reservation(tail, n));
        }

        let head = self.head.load(Ordering::Acquire);
        // SAFETY: cached_head is only touched by the producer; the Acquire
        // load above synchronizes with the consumer's Release store.
        unsafe {
            *self.cached_head.get() = head;
        }

        let space = self.capacity().saturating_sub(tail.wrapping_sub(head) as usize);
        if space < n {
            return None;
        }
        Some(self.make_reservation(tail, n))
    }

    fn make_reservation(&self, tail: u64, n: usize) -> Reservation<'_, T> {
        let idx = (tail as usize) & self.mask();
        let contiguous = n.min(self.capacity() - idx);

        // SAFETY: idx..idx+contiguous is in bounds and lies beyond the
        // current tail, so the consumer cannot be reading it; only the single
        // producer writes there until commit publishes it.
        let slice = unsafe {
            let buffer = &mut *self.buffer.get();
            &mut buffer[idx..idx + contiguous]
        };
        Reservation::new(slice, self)
    }

    /// Publishes `n` written slots. Called by [`Reservation`].
    pub(crate) fn commit_internal(&self, n: usize) {
        let tail = self.tail.load(Ordering::Relaxed);
        let new_tail = tail.wrapping_add(n as u64);
        let head = self.head.load(Ordering::Relaxed);

        debug_assert_bounded_count!(new_tail.wrapping_sub(head) as usize, self.capacity());
        debug_assert_monotonic!("tail", tail, new_tail);

        self.tail.store(new_tail, Ordering::Release);

        if self.config.enable_metrics {
            self.metrics.add_messages_sent(n as u64);
            self.metrics.add_batches_sent(1);
        }
    }

    /// Pushes a single item without waiting.
    pub fn try_push(&self, item: T) -> Result<(), PushError<T>> {
        if self.is_closed() {
            return Err(PushError::Closed(item));
        }
        match self.reserve(1) {
            Some(mut reservation) => {
                reservation.as_mut_slice()[0] = MaybeUninit::new(item);
                reservation.commit();
                Ok(())
            }
            None => {
                if self.config.enable_metrics {
                    self.metrics.add_rejected(1);
                }
                Err(PushError::Full(item))
            }
        }
    }

    /// Pushes a single item, waiting for room while the ring is full.
    ///
    /// Spins and yields first, then parks the calling thread on `parker`
    /// until the consumer frees a slot. Returns the item only if the ring is
    /// (or becomes) closed.
    pub fn push_blocking(&self, item: T, parker: &Parker) -> Result<(), T> {
        let mut item = item;
        let mut backoff = Backoff::new();

        loop {
            match self.try_push(item) {
                Ok(()) => return Ok(()),
                Err(PushError::Closed(rejected)) => return Err(rejected),
                Err(PushError::Full(rejected)) => item = rejected,
            }

            if backoff.snooze() {
                continue;
            }

            self.register_parked_producer(parker.unparker());
            self.producer_parked.store(true, Ordering::SeqCst);
            fence(Ordering::SeqCst);

            // Re-check after announcing ourselves so a concurrent drain
            // cannot slip between the failed push and the park.
            match self.try_push(item) {
                Ok(()) => {
                    self.producer_parked.store(false, Ordering::SeqCst);
                    return Ok(());
                }
                Err(PushError::Closed(rejected)) => {
                    self.producer_parked.store(false, Ordering::SeqCst);
                    return Err(rejected);
                }
                Err(PushError::Full(rejected)) => item = rejected,
            }

            if self.config.enable_metrics {
                self.metrics.add_producer_parks(1);
            }
            parker.park_timeout(PARK_TIMEOUT);
            backoff.reset();
        }
    }

    fn register_parked_producer(&self, unparker: &Unparker) {
        if let Ok(mut slot) = self.parked_producer.lock() {
            if slot.is_none() {
                *slot = Some(unparker.clone());
            }
        }
    }

    fn wake_producer(&self) {
        if self.producer_parked.swap(false, Ordering::SeqCst) {
            if let Ok(slot) = self.parked_producer.lock() {
                if let Some(unparker) = slot.as_ref() {
                    unparker.unpark();
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // CONSUMER API
    // ---------------------------------------------------------------------

    /// Consume up to `max_items`, transferring ownership, with a single
    /// head update. Wakes a parked producer when anything was consumed.
    pub fn consume_up_to_owned<F>(&self, max_items: usize, mut handler: F) -> usize
    where
        F: FnMut(T),
    {
        if max_items == 0 {
            return 0;
        }

        let head = self.head.load(Ordering::Relaxed);
        // SAFETY: cached_tail is only touched by the consumer.
        let mut tail = unsafe { *self.cached_tail.get() };
        if tail.wrapping_sub(head) == 0 {
            tail = self.tail.load(Ordering::Acquire);
            // SAFETY: as above; the Acquire load pairs with commit_internal.
            unsafe {
                *self.cached_tail.get() = tail;
            }
        }

        let avail = tail.wrapping_sub(head) as usize;
        if avail == 0 {
            return 0;
        }

        let to_consume = avail.min(max_items);
        let mask = self.mask();
        let mut pos = head;

        for _ in 0..to_consume {
            debug_assert_initialized_read!(pos, head, tail);

            let idx = (pos as usize) & mask;
            // SAFETY: [head, tail) was fully written and published by the
            // producer's Release store; assume_init_read moves the value out
            // and the slot is considered empty once head advances.
            let item = unsafe {
                let buffer = &*self.buffer.get();
                buffer[idx].assume_init_read()
            };
            handler(item);
            pos = pos.wrapping_add(1);
        }

        let new_head = head.wrapping_add(to_consume as u64);
        debug_assert_head_not_past_tail!(new_head, tail);
        debug_assert_monotonic!("head", head, new_head);
        self.head.store(new_head, Ordering::Release);

        if self.config.enable_metrics {
            self.metrics.add_messages_received(to_consume as u64);
            self.metrics.add_batches_received(1);
        }

        self.wake_producer();
        to_consume
    }

    /// Consume everything currently available, transferring ownership.
    pub fn consume_batch_owned<F>(&self, handler: F) -> usize
    where
        F: FnMut(T),
    {
        self.consume_up_to_owned(self.capacity(), handler)
    }

    // ---------------------------------------------------------------------
    // LIFECYCLE
    // ---------------------------------------------------------------------

    /// Close the ring. Pending items stay readable; pushes fail and a parked
    /// producer is released.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.producer_parked.store(true, Ordering::SeqCst);
        self.wake_producer();
    }

    /// Snapshot of the ring counters (zeroes when metrics are disabled).
    pub fn metrics(&self) -> MetricsSnapshot {
        if self.config.enable_metrics {
            self.metrics.snapshot()
        } else {
            MetricsSnapshot::default()
        }
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        let count = tail.wrapping_sub(head) as usize;
        let mask = self.mask();
        let buffer = self.buffer.get_mut();

        for i in 0..count {
            let idx = ((head as usize).wrapping_add(i)) & mask;
            // SAFETY: slots in [head, tail) hold initialized values that were
            // never moved out.
            unsafe {
                ptr::drop_in_place(buffer[idx].as_mut_ptr());
            }
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
    fn test_ring_push_and_consume() {
        let ring = Ring::<u64>::new(Config::new(4, false));
        for i in 0..10 {
            ring.try_push(i * 10).unwrap();
        }
        assert_eq!(ring.len(), 10);

        let mut sum = 0u64;
        let consumed = ring.consume_batch_owned(|item| sum += item);
        assert_eq!(consumed, 10);
        assert_eq!(sum, 450);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_ring_consume_up_to() {
        let ring = Ring::<u64>::new(Config::default());
        for i in 0..10 {
            ring.try_push(i).unwrap();
        }

        let mut seen = Vec::new();
        assert_eq!(ring.consume_up_to_owned(4, |item| seen.push(item)), 4);
        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert_eq!(ring.len(), 6);

        assert_eq!(ring.consume_up_to_owned(100, |item| seen.push(item)), 6);
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_ring_full() {
        let ring = Ring::<u64>::new(Config::new(2, false)); // 4 slots
        for i in 0..4 {
            ring.try_push(i).unwrap();
        }
        assert!(ring.is_full());
        assert_eq!(ring.try_push(99), Err(PushError::Full(99)));
    }

    #[test]
    fn test_ring_closed_rejects() {
        let ring = Ring::<u64>::new(Config::default());
        ring.try_push(1).unwrap();
        ring.close();

        assert_eq!(ring.try_push(2), Err(PushError::Closed(2)));
        // Items pushed before close are still readable.
        let mut seen = Vec::new();
        ring.consume_batch_owned(|item| seen.push(item));
        assert_eq!(seen, vec![1]);
    }

    #[test]
    fn test_push_blocking_waits_for_consumer() {
        let ring = Arc::new(Ring::<u64>::new(Config::new(1, true))); // 2 slots
        let producer_ring = Arc::clone(&ring);

        let producer = thread::spawn(move || {
            let parker = Parker::new();
            for i in 0..100 {
                producer_ring.push_blocking(i, &parker).unwrap();
            }
        });

        let mut received = Vec::new();
        while received.len() < 100 {
            ring.consume_batch_owned(|item| received.push(item));
            thread::yield_now();
        }
        producer.join().unwrap();

        assert_eq!(received, (0..100).collect::<Vec<_>>());
        assert_eq!(ring.metrics().messages_received, 100);
    }

    #[test]
    fn test_push_blocking_released_by_close() {
        let ring = Arc::new(Ring::<u64>::new(Config::new(0, false))); // 1 slot
        ring.try_push(1).unwrap();

        let producer_ring = Arc::clone(&ring);
        let producer = thread::spawn(move || {
            let parker = Parker::new();
            producer_ring.push_blocking(2, &parker)
        });

        thread::sleep(Duration::from_millis(50));
        ring.close();

        assert_eq!(producer.join().unwrap(), Err(2));
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
            let ring = Ring::<DropTracker>::new(Config::new(3, false));
            for _ in 0..5 {
                assert!(ring.try_push(DropTracker).is_ok());
            }
            ring.consume_up_to_owned(2, drop);
            assert_eq!(DROP_COUNT.load(Ordering::SeqCst), 2);
        }
        assert_eq!(DROP_COUNT.load(Ordering::SeqCst), 5);
    }
}
