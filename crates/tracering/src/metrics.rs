use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe ring counters.
///
/// All updates are `Relaxed`: the counters are purely statistical and never
/// guard other data.
#[derive(Debug, Default)]
pub struct Metrics {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    batches_sent: AtomicU64,
    batches_received: AtomicU64,
    rejected: AtomicU64,
    producer_parks: AtomicU64,
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub batches_sent: u64,
    pub batches_received: u64,
    /// Pushes refused because the ring was full or closed.
    pub rejected: u64,
    /// Times a blocking producer had to park.
    pub producer_parks: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn add_messages_sent(&self, n: u64) {
        self.messages_sent.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_batches_sent(&self, n: u64) {
        self.batches_sent.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_messages_received(&self, n: u64) {
        self.messages_received.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_batches_received(&self, n: u64) {
        self.batches_received.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_rejected(&self, n: u64) {
        self.rejected.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_producer_parks(&self, n: u64) {
        self.producer_parks.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            batches_received: self.batches_received.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            producer_parks: self.producer_parks.load(Ordering::Relaxed),
        }
    }
}
