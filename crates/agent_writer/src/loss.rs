use std::sync::atomic::{AtomicU32, Ordering};

/// Counts traces dropped at admission since the last root trace was accepted.
///
/// The next admitted root trace claims the whole count and reports it as
/// extra weight, so the agent can extrapolate what was lost.
#[derive(Debug, Default)]
pub struct LossCounter {
    dropped: AtomicU32,
}

impl LossCounter {
    pub const fn new() -> Self {
        Self {
            dropped: AtomicU32::new(0),
        }
    }

    /// Record one more trace the writer accepted but could not keep.
    pub fn increment(&self) {
        self.add(1);
    }

    /// Give back a count that was claimed by a trace which then failed to
    /// be admitted.
    pub fn add(&self, n: u32) {
        if n == 0 {
            return;
        }
        // Saturating: the count never wraps back to a small number.
        let _ = self
            .dropped
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(n))
            });
    }

    /// Atomically read and reset the count.
    pub fn take(&self) -> u32 {
        self.dropped.swap(0, Ordering::AcqRel)
    }

    pub fn get(&self) -> u32 {
        self.dropped.load(Ordering::Acquire)
    }
}
