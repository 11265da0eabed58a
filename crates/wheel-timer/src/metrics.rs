/// Optional, zero-cost-when-disabled snapshot of staging queue depth.
///
/// Mirrors the ring-buffer ancestor's `Metrics`/`MetricsSnapshot` split: a
/// plain `Copy` struct callers can poll, gated by
/// [`crate::WheelConfig::enable_metrics`]. The engine does no logging of
/// its own (see `SPEC_FULL.md`); this is the one observability surface it
/// offers, and it costs nothing when `enable_metrics` is `false`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Estimated number of timeouts awaiting placement into a bucket.
    pub pending_submissions: i64,
    /// Estimated number of cancellations awaiting processing.
    pub pending_cancellations: i64,
}
