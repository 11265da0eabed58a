use thiserror::Error;

/// A structural invariant violation: the engine observed state that its own
/// protocol should make impossible (spec §7).
///
/// These are programming defects, not runtime conditions — they never cross
/// the library boundary as a `Result`. The worker thread panics with one of
/// these as the payload, which unwinds only the worker (a caller who joined
/// the thread, or who calls `new_timeout`/`cancel`/`stop` afterwards, simply
/// observes the engine stuck in whatever state it was last in; nothing about
/// `FatalError` is recoverable).
#[derive(Debug, Clone, Error)]
pub enum FatalError {
    /// The expiry walk reached a timeout whose `remaining_rounds` hit zero
    /// but whose deadline is still in the future relative to the tick that
    /// is firing it (spec §4.B).
    #[error(
        "bucket expiry walked a timeout with deadline {deadline_ns}ns, \
         which is after the firing tick's deadline {current_deadline_ns}ns"
    )]
    DeadlineNotYetReached {
        /// The timeout's recorded deadline.
        deadline_ns: i64,
        /// The deadline of the tick currently expiring the bucket.
        current_deadline_ns: i64,
    },

    /// The staging queue's consumer advanced past the producer index, which
    /// the CAS protocol guarantees cannot happen (spec §4.A, INV-Q-01).
    #[error("staging queue consumer_index {consumer_index} exceeded producer_index {producer_index}")]
    QueueConsumerOvertookProducer {
        /// The consumer index observed.
        consumer_index: i64,
        /// The producer index observed.
        producer_index: i64,
    },

    /// A segment's reserved link cell was read as `JUMP` a second time after
    /// already being swapped to `CONSUMED` (spec §4.A, INV-Q-02).
    #[error("staging queue re-entered an already-consumed segment link cell")]
    QueueSegmentReconsumed,
}
