use crate::Ring;
use std::mem::MaybeUninit;

/// Zero-copy reservation for writing directly into a [`Ring`].
///
/// The producer obtains a reservation, writes into the slice, then commits to
/// make the data visible to the consumer. A reservation may be shorter than
/// requested when it would wrap past the end of the buffer.
///
/// Dropping a reservation without committing publishes nothing; any value
/// written into the slice is leaked, not dropped.
pub struct Reservation<'a, T> {
    slice: &'a mut [MaybeUninit<T>],
    ring: &'a Ring<T>,
}

impl<'a, T> Reservation<'a, T> {
    pub(crate) fn new(slice: &'a mut [MaybeUninit<T>], ring: &'a Ring<T>) -> Self {
        Self { slice, ring }
    }

    /// Returns a mutable slice for writing data.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [MaybeUninit<T>] {
        self.slice
    }

    /// Returns the number of reserved slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.slice.len()
    }

    /// Returns true if the reservation is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slice.is_empty()
    }

    /// Commits every reserved slot.
    ///
    /// Every slot in the slice must have been written.
    pub fn commit(self) {
        let len = self.slice.len();
        self.ring.commit_internal(len);
    }

    /// Commits the first `n` slots, saturating at `len()`.
    ///
    /// Returns the number of items actually committed.
    pub fn commit_up_to(self, n: usize) -> usize {
        let to_commit = n.min(self.slice.len());
        self.ring.commit_internal(to_commit);
        to_commit
    }
}
