use crossbeam_utils::sync::Parker;
use std::hint;
use std::thread;
use std::time::Duration;

/// Escalating wait for a thread with nothing to do: busy-spin in growing
/// rounds, then yield to the OS, then park.
///
/// The spin and yield phases are a fixed budget. Once it is spent
/// [`snooze`](Backoff::snooze) returns `false` and the caller is expected to
/// park, either itself (when it must re-check state first, as
/// [`Ring::push_blocking`](crate::Ring::push_blocking) does) or through
/// [`wait_or_park`](Backoff::wait_or_park).
#[derive(Debug, Default)]
pub struct Backoff {
    round: u32,
}

impl Backoff {
    /// Rounds spent spinning; round `n` spins `2^n` times.
    const SPIN_ROUNDS: u32 = 6;
    /// Round after which the budget is spent.
    const LAST_ROUND: u32 = 10;

    #[inline]
    pub fn new() -> Self {
        Self { round: 0 }
    }

    /// Waits one round. Returns `false`, without waiting, once the spin and
    /// yield budget is spent.
    #[inline]
    pub fn snooze(&mut self) -> bool {
        if self.round > Self::LAST_ROUND {
            return false;
        }
        if self.round <= Self::SPIN_ROUNDS {
            for _ in 0..1u32 << self.round {
                hint::spin_loop();
            }
        } else {
            thread::yield_now();
        }
        self.round += 1;
        true
    }

    /// Snoozes while budget remains, otherwise parks on `parker` for at most
    /// `timeout` and starts a fresh budget. Returns whether it parked.
    pub fn wait_or_park(&mut self, parker: &Parker, timeout: Duration) -> bool {
        if self.snooze() {
            return false;
        }
        parker.park_timeout(timeout);
        self.reset();
        true
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        self.round > Self::LAST_ROUND
    }

    /// Progress was made; the next wait starts from the cheapest round.
    #[inline]
    pub fn reset(&mut self) {
        self.round = 0;
    }
}
