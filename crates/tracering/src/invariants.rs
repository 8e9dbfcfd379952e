//! Debug assertion macros for ring invariants.
//!
//! Active only in debug builds (`#[cfg(debug_assertions)]`), so release builds
//! pay nothing. Used by both `Ring<T>` and `MpscRing<T>`.

// =============================================================================
// Sequence bounds (both rings)
// =============================================================================

/// Assert that the number of items held does not exceed capacity.
///
/// **Invariant**: `0 ≤ (tail - head) ≤ capacity`
macro_rules! debug_assert_bounded_count {
    ($count:expr, $capacity:expr) => {
        debug_assert!(
            $count <= $capacity,
            "bounded count violated: count {} exceeds capacity {}",
            $count,
            $capacity
        )
    };
}

/// Assert that head does not advance past tail.
///
/// **Invariant**: `head ≤ tail` (after advance)
macro_rules! debug_assert_head_not_past_tail {
    ($new_head:expr, $tail:expr) => {
        debug_assert!(
            $new_head <= $tail,
            "advancing head {} beyond tail {}",
            $new_head,
            $tail
        )
    };
}

/// Assert that a sequence number only increases.
macro_rules! debug_assert_monotonic {
    ($name:literal, $old:expr, $new:expr) => {
        debug_assert!(
            $new >= $old,
            "{} decreased from {} to {}",
            $name,
            $old,
            $new
        )
    };
}

/// Assert that we're reading from an initialized slot.
///
/// **Invariant**: `buffer[i] is initialized ⟺ head ≤ sequence(i) < tail`
macro_rules! debug_assert_initialized_read {
    ($pos:expr, $head:expr, $tail:expr) => {
        debug_assert!(
            $pos >= $head && $pos < $tail,
            "reading slot at seq {} outside initialized range [{}, {})",
            $pos,
            $head,
            $tail
        )
    };
}

// =============================================================================
// Slot stamps (MpscRing)
// =============================================================================

/// Assert that a slot the consumer is about to release carried the
/// "written" stamp for its position.
///
/// **Invariant**: `stamp(slot) == 2·pos + 1` while the value is live
macro_rules! debug_assert_written_stamp {
    ($stamp:expr, $pos:expr) => {
        debug_assert!(
            $stamp == $pos.wrapping_mul(2).wrapping_add(1),
            "slot stamp {} does not mark position {} as written",
            $stamp,
            $pos
        )
    };
}

/// Assert that a producer only claims a slot whose stamp marks it free for
/// exactly the claimed position.
///
/// **Invariant**: `stamp(slot) == 2·pos` when claimed
macro_rules! debug_assert_free_stamp {
    ($stamp:expr, $pos:expr) => {
        debug_assert!(
            $stamp == $pos.wrapping_mul(2),
            "claimed slot stamp {} is not free for position {}",
            $stamp,
            $pos
        )
    };
}

pub(crate) use debug_assert_bounded_count;
pub(crate) use debug_assert_free_stamp;
pub(crate) use debug_assert_head_not_past_tail;
pub(crate) use debug_assert_initialized_read;
pub(crate) use debug_assert_monotonic;
pub(crate) use debug_assert_written_stamp;
