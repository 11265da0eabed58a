use std::time::Duration;

/// Default tick duration used when the requested value is out of range.
pub const DEFAULT_TICK_DURATION: Duration = Duration::from_millis(100);
/// Default wheel size (ticks per wheel) used when the requested value is
/// out of range.
pub const DEFAULT_TICKS_PER_WHEEL: usize = 512;
/// Upper bound on wheel size; requests above this fall back to the default.
pub const MAX_TICKS_PER_WHEEL: usize = 1 << 20;
/// Lower bound on tick duration; requests below this fall back to the default.
pub const MIN_TICK_DURATION: Duration = Duration::from_millis(1);
/// Upper bound on tick duration; requests above this fall back to the default.
pub const MAX_TICK_DURATION: Duration = Duration::from_secs(365 * 24 * 3600);

/// Initial segment capacity for the submission and cancellation staging
/// queues.
pub const DEFAULT_QUEUE_SEGMENT_CAPACITY: usize = 128;

/// Upper bound on timeouts drained from the submission queue per tick, to
/// cap worker latency under a submission storm.
pub const DEFAULT_TRANSFER_BUDGET: usize = 100_000;

/// Configuration for a [`crate::WheelTimer`].
///
/// Unlike the ring-buffer `Config` this crate's `ring-decomposed` ancestor
/// used to validate with an assertion, every field here is *silently
/// normalized* to a safe default on out-of-range input (spec §3, §7): a
/// misconfigured timer should never refuse to start.
#[derive(Debug, Clone, Copy)]
pub struct WheelConfig {
    tick_duration: Duration,
    ticks_per_wheel: usize,
    /// Enable lightweight pending-count metrics on the staging queues.
    pub enable_metrics: bool,
}

impl WheelConfig {
    /// Creates a configuration, clamping `tick_duration` to
    /// `[1ms, 365d]` and rounding `ticks_per_wheel` up to the next power of
    /// two (falling back to the defaults when either input is out of
    /// range).
    #[must_use]
    pub fn new(tick_duration: Duration, ticks_per_wheel: usize) -> Self {
        let tick_duration = if tick_duration < MIN_TICK_DURATION || tick_duration > MAX_TICK_DURATION {
            DEFAULT_TICK_DURATION
        } else {
            tick_duration
        };

        let ticks_per_wheel = if ticks_per_wheel < 1 || ticks_per_wheel > MAX_TICKS_PER_WHEEL {
            DEFAULT_TICKS_PER_WHEEL
        } else {
            ticks_per_wheel.next_power_of_two()
        };

        Self {
            tick_duration,
            ticks_per_wheel,
            enable_metrics: false,
        }
    }

    /// Enables the pending-submission / pending-cancellation counters.
    #[must_use]
    pub fn with_metrics(mut self, enable: bool) -> Self {
        self.enable_metrics = enable;
        self
    }

    /// The (clamped) tick duration.
    #[inline]
    #[must_use]
    pub fn tick_duration(&self) -> Duration {
        self.tick_duration
    }

    /// The tick duration in nanoseconds, as used by the tick-loop arithmetic.
    #[inline]
    #[must_use]
    pub fn tick_duration_nanos(&self) -> i64 {
        i64::try_from(self.tick_duration.as_nanos()).unwrap_or(i64::MAX)
    }

    /// The wheel size (always a power of two).
    #[inline]
    #[must_use]
    pub fn wheel_size(&self) -> usize {
        self.ticks_per_wheel
    }

    /// `wheel_size() - 1`, used to mask a tick counter down to a slot index.
    #[inline]
    #[must_use]
    pub fn mask(&self) -> usize {
        self.ticks_per_wheel - 1
    }
}

impl Default for WheelConfig {
    fn default() -> Self {
        Self::new(DEFAULT_TICK_DURATION, DEFAULT_TICKS_PER_WHEEL)
    }
}
