/// Configuration for [`Ring`](crate::Ring).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Ring buffer size as power of 2 (default: 10 = 1024 slots)
    pub ring_bits: u8,
    /// Enable metrics collection (slight overhead)
    pub enable_metrics: bool,
}

impl Config {
    /// Largest supported `ring_bits` (1M slots).
    pub const MAX_RING_BITS: u8 = 20;

    /// Creates a new configuration with custom settings.
    pub const fn new(ring_bits: u8, enable_metrics: bool) -> Self {
        Self {
            ring_bits,
            enable_metrics,
        }
    }

    /// Smallest configuration holding at least `items` slots.
    ///
    /// Capacity is rounded up to the next power of two and clamped to
    /// `1 << MAX_RING_BITS`.
    pub fn for_capacity(items: usize, enable_metrics: bool) -> Self {
        let rounded = items.max(1).next_power_of_two();
        let bits = (rounded.trailing_zeros() as u8).min(Self::MAX_RING_BITS);
        Self::new(bits, enable_metrics)
    }

    /// Returns the capacity of the ring buffer.
    #[inline]
    pub const fn capacity(&self) -> usize {
        1 << self.ring_bits
    }

    /// Returns the mask for index wrapping.
    #[inline]
    pub const fn mask(&self) -> usize {
        self.capacity() - 1
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ring_bits: 10,
            enable_metrics: false,
        }
    }
}
