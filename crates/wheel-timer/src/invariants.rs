//! Debug assertion macros for staging-queue, bucket, and wheel invariants.
//!
//! These are only active in debug builds (`#[cfg(debug_assertions)]`), so
//! there is zero overhead in release builds. The invariant tags (`INV-*`)
//! are referenced from `SPEC_FULL.md` and from the module that exercises
//! each check.

// =============================================================================
// INV-Q-01: consumer never outruns producer
// =============================================================================

/// Assert that the consumer index never passes the producer index.
///
/// **Invariant**: `consumer_index <= producer_index` at all times.
macro_rules! debug_assert_consumer_not_past_producer {
    ($consumer:expr, $producer:expr) => {
        debug_assert!(
            $consumer <= $producer,
            "INV-Q-01 violated: consumer_index {} exceeds producer_index {}",
            $consumer,
            $producer
        )
    };
}

// =============================================================================
// INV-Q-02: JUMP is followed by CONSUMED exactly once
// =============================================================================

/// Assert that a link cell has not already been marked consumed before a
/// segment hand-off.
///
/// **Invariant**: the reserved link cell of a segment is read by the
/// consumer exactly once (JUMP -> follow link -> CONSUMED); reading it twice
/// means the consumer revisited an already-retired segment.
macro_rules! debug_assert_link_not_already_consumed {
    ($already_consumed:expr) => {
        debug_assert!(
            !$already_consumed,
            "INV-Q-02 violated: re-entered a segment whose link cell was already CONSUMED"
        )
    };
}

// =============================================================================
// INV-B-01: bucket membership is exclusive
// =============================================================================

/// Assert that a timeout about to be appended to a bucket isn't already
/// linked into one.
///
/// **Invariant**: `timeout.bucket == None` before `Bucket::append`.
macro_rules! debug_assert_not_already_bucketed {
    ($bucket:expr) => {
        debug_assert!(
            $bucket.is_none(),
            "INV-B-01 violated: timeout appended while already linked into a bucket"
        )
    };
}

// =============================================================================
// INV-B-02: expired deadlines never exceed the tick boundary that fired them
// =============================================================================

/// Assert the placement invariant: a timeout reaching `remaining_rounds <= 0`
/// must have a deadline at or before the tick that is expiring it.
macro_rules! debug_assert_deadline_reached {
    ($deadline_ns:expr, $current_deadline_ns:expr) => {
        debug_assert!(
            $deadline_ns <= $current_deadline_ns,
            "INV-B-02 violated: expiring timeout with deadline {} > current deadline {}",
            $deadline_ns,
            $current_deadline_ns
        )
    };
}

// =============================================================================
// INV-T-01: terminal states are sticky
// =============================================================================

/// Assert that a state transition only ever moves INIT -> {CANCELLED,
/// EXPIRED}, never out of a terminal state.
macro_rules! debug_assert_terminal_transition {
    ($from:expr, $init:expr) => {
        debug_assert!(
            $from == $init,
            "INV-T-01 violated: transitioned out of a non-INIT state"
        )
    };
}

pub(crate) use debug_assert_consumer_not_past_producer;
pub(crate) use debug_assert_deadline_reached;
pub(crate) use debug_assert_link_not_already_consumed;
pub(crate) use debug_assert_not_already_bucketed;
pub(crate) use debug_assert_terminal_transition;
