//! Unbounded multi-producer / single-consumer array-linked queue.
//!
//! A Rust translation of the JCTools-style `MpscUnboundedArrayQueue`
//! algorithm described in `SPEC_FULL.md` §3/§4.A: producers race on a CAS
//! over `producer_index` to reserve a slot in the current segment; when a
//! segment fills, the producer that wins a second CAS (setting the index's
//! low bit — the "grow-lock") allocates the next segment, links it, and
//! marks the exhausted slot with the `JUMP` sentinel so the consumer knows
//! to follow the link instead of waiting on that slot forever.
//!
//! Two adaptations from the Go source this was ported from, both load-bearing
//! for Rust's memory model (neither changes the observable protocol):
//!
//! - `producer_segment`/`consumer_segment` are tracked as single atomic
//!   pointers-to-segment rather than a `(buffer, mask)` pair of plain
//!   fields, because segment capacity never changes after construction
//!   (every grown segment has the same capacity as its predecessor) and a
//!   single pointer avoids the torn-read hazard of two independently
//!   updated fields.
//! - segment retirement is deferred to the whole queue's `Drop`, which
//!   walks the full segment chain and frees each one. The reference
//!   implementation relies on GC to reclaim a segment once nothing points
//!   to it; a hand-rolled Rust equivalent would need hazard pointers or
//!   epoch-based reclamation, which is out of scope here.

use crate::backoff::Backoff;
use crate::invariants::{debug_assert_consumer_not_past_producer, debug_assert_link_not_already_consumed};
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicI64, AtomicPtr, AtomicU8, Ordering};

const CELL_EMPTY: u8 = 0;
const CELL_VALUE: u8 = 1;
const CELL_JUMP: u8 = 2;

/// Fallback segment capacity used only when the requested capacity is too
/// small to hold anything (mirrors the reference's `capacity < 2 => 128`);
/// any explicit capacity `>= 2` is honored as requested (subject to the
/// power-of-two rounding in `Segment::new`).
const MIN_SEGMENT_CAPACITY: usize = 128;

struct Cell<T> {
    tag: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Cell<T> {
    fn new() -> Self {
        Self {
            tag: AtomicU8::new(CELL_EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

struct Segment<T> {
    capacity: usize,
    cells: Box<[Cell<T>]>,
    /// Link to the next segment, installed exactly once by the resize
    /// winner. `null` until installed.
    next: AtomicPtr<Segment<T>>,
}

impl<T> Segment<T> {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(2);
        let cells = (0..capacity).map(|_| Cell::new()).collect();
        Self {
            capacity,
            cells,
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// `(capacity - 1) << 1`: the index mask under the ×2 (low-bit-reserved)
    /// counter encoding.
    #[inline]
    fn mask(&self) -> i64 {
        ((self.capacity - 1) as i64) << 1
    }

    #[inline]
    fn offset(index: i64, mask: i64) -> usize {
        ((index & mask) >> 1) as usize
    }

    /// Writes `value` into `offset` and publishes it with a `Release` tag
    /// store. Must only be called on a cell this caller exclusively
    /// reserved via a successful `producer_index` CAS.
    ///
    /// # Safety
    /// `offset` must be in bounds and not concurrently written by another
    /// producer (guaranteed by the index CAS protocol).
    unsafe fn store_value(&self, offset: usize, value: T) {
        let cell = &self.cells[offset];
        // SAFETY: exclusive writer for this offset per the CAS protocol.
        unsafe { (*cell.value.get()).write(value) };
        cell.tag.store(CELL_VALUE, Ordering::Release);
    }

    /// Marks `offset` with the `JUMP` sentinel, telling the consumer to
    /// follow `next` instead of waiting on this slot.
    fn mark_jump(&self, offset: usize) {
        self.cells[offset].tag.store(CELL_JUMP, Ordering::Release);
    }

    /// Acquire-loads the tag at `offset`.
    #[inline]
    fn tag(&self, offset: usize) -> u8 {
        self.cells[offset].tag.load(Ordering::Acquire)
    }

    /// Reads and retires the value at `offset`, resetting its tag to
    /// `EMPTY`. Must only be called by the single consumer, and only after
    /// observing `tag(offset) == CELL_VALUE`.
    ///
    /// # Safety
    /// Caller must have observed `CELL_VALUE` at `offset` via an `Acquire`
    /// load (or a happens-before-equivalent), and must be the queue's sole
    /// consumer.
    unsafe fn take_value(&self, offset: usize) -> T {
        let cell = &self.cells[offset];
        // SAFETY: tag == CELL_VALUE guarantees the slot was initialized by
        // `store_value`, and the consumer is the only reader/retirer.
        let value = unsafe { (*cell.value.get()).assume_init_read() };
        cell.tag.store(CELL_EMPTY, Ordering::Relaxed);
        value
    }
}

impl<T> Drop for Segment<T> {
    fn drop(&mut self) {
        for cell in self.cells.iter_mut() {
            if *cell.tag.get_mut() == CELL_VALUE {
                // SAFETY: tag says this cell still holds an initialized,
                // never-consumed value; drop it in place.
                unsafe { cell.value.get_mut().assume_init_drop() };
            }
        }
    }
}

/// The unbounded MPSC staging queue (spec §3/§4.A).
pub(crate) struct MpscQueue<T> {
    producer_index: CachePadded<AtomicI64>,
    producer_limit: CachePadded<AtomicI64>,
    producer_segment: CachePadded<AtomicPtr<Segment<T>>>,

    consumer_index: CachePadded<AtomicI64>,
    /// Single-writer (the sole consumer) cell holding the segment currently
    /// being polled from. Not atomic: only the one permitted caller of
    /// `poll` ever touches it, mirroring the ring-buffer ancestor's
    /// `cached_head`/`cached_tail` `UnsafeCell` fields.
    consumer_segment: UnsafeCell<*mut Segment<T>>,

    /// Head of the full segment chain, retained only so `Drop` can walk and
    /// free every segment ever allocated (see module docs).
    first_segment: *mut Segment<T>,
}

// SAFETY: all cross-thread access to shared state goes through the atomics
// above; `T: Send` is required because values cross from producer threads
// to the single consumer thread.
unsafe impl<T: Send> Send for MpscQueue<T> {}
unsafe impl<T: Send> Sync for MpscQueue<T> {}

enum SlowPathOutcome {
    ContinueToCas,
    Retry,
    Resized,
}

impl<T> MpscQueue<T> {
    /// Creates a queue whose first segment holds `initial_capacity` slots
    /// (rounded up to a power of two). Only capacities below 2 fall back to
    /// [`MIN_SEGMENT_CAPACITY`]; any explicit capacity `>= 2` is honored.
    pub(crate) fn new(initial_capacity: usize) -> Self {
        let capacity = if initial_capacity < 2 {
            MIN_SEGMENT_CAPACITY
        } else {
            initial_capacity
        };
        let segment = Box::into_raw(Box::new(Segment::new(capacity)));
        // SAFETY: segment was just allocated by us, exclusively owned here.
        let mask = unsafe { (*segment).mask() };
        Self {
            producer_index: CachePadded::new(AtomicI64::new(0)),
            producer_limit: CachePadded::new(AtomicI64::new(mask)),
            producer_segment: CachePadded::new(AtomicPtr::new(segment)),
            consumer_index: CachePadded::new(AtomicI64::new(0)),
            consumer_segment: UnsafeCell::new(segment),
            first_segment: segment,
        }
    }

    /// Enqueues `value`. Never reports "queue full": this queue is
    /// unbounded and always succeeds (the `bool` return matches the spec's
    /// `offer(elem) -> bool` surface and stays `true` in every reachable
    /// path — `false` would only occur on a `QUEUE_FULL` slow-path outcome
    /// that, per spec §9, this algorithm makes unreachable).
    pub(crate) fn offer(&self, value: T) -> bool {
        let mut pending = Some(value);
        loop {
            let producer_limit = self.producer_limit.load(Ordering::Relaxed);
            let p_index = self.producer_index.load(Ordering::Acquire);
            if p_index & 1 == 1 {
                // A resize is in flight; retry until the winner clears the lock.
                std::hint::spin_loop();
                continue;
            }

            let segment_ptr = self.producer_segment.load(Ordering::Acquire);
            // SAFETY: producer_segment always points at a live segment
            // owned by this queue until the whole queue drops.
            let segment = unsafe { &*segment_ptr };
            let mask = segment.mask();

            if producer_limit <= p_index {
                match self.offer_slow_path(segment, mask, p_index, producer_limit, &mut pending) {
                    SlowPathOutcome::ContinueToCas => {}
                    SlowPathOutcome::Retry => continue,
                    SlowPathOutcome::Resized => return true,
                }
            }

            if self
                .producer_index
                .compare_exchange(p_index, p_index + 2, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let offset = Segment::<T>::offset(p_index, mask);
                let value = pending.take().expect("offer: pending value missing at CAS success");
                // SAFETY: this producer exclusively reserved `offset` via
                // the CAS above (spec §4.A offer protocol step 2).
                unsafe { segment.store_value(offset, value) };
                return true;
            }
        }
    }

    fn offer_slow_path(
        &self,
        segment: &Segment<T>,
        mask: i64,
        p_index: i64,
        producer_limit: i64,
        pending: &mut Option<T>,
    ) -> SlowPathOutcome {
        let consumer_index = self.consumer_index.load(Ordering::Acquire);
        // Per spec §9's resolved open question: the segment's slot count is
        // `mask/2`, but because both indices advance by 2 this comparison
        // against `mask` directly is correct; kept as-is from the source.
        let buffer_capacity = mask;

        if buffer_capacity > p_index - consumer_index {
            match self.producer_limit.compare_exchange(
                producer_limit,
                consumer_index + buffer_capacity,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => SlowPathOutcome::ContinueToCas,
                Err(_) => SlowPathOutcome::Retry,
            }
        } else {
            match self.producer_index.compare_exchange(
                p_index,
                p_index + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    let value = pending.take().expect("offer: pending value missing entering resize");
                    self.resize(segment, mask, p_index, value);
                    SlowPathOutcome::Resized
                }
                Err(_) => SlowPathOutcome::Retry,
            }
        }
    }

    /// Performs the resize: the grow-lock winner's job. Allocates a new
    /// segment of the same capacity, writes `value` into it, links it from
    /// the old segment, republishes the producer-visible segment pointer
    /// and limit, clears the grow-lock, and finally marks the old segment's
    /// slot with `JUMP`. This order matters (spec §4.A): a consumer that
    /// observes `JUMP` must already be able to see the link and the new
    /// segment's published value.
    fn resize(&self, old_segment: &Segment<T>, old_mask: i64, p_index: i64, value: T) {
        let new_segment_ptr = Box::into_raw(Box::new(Segment::new(old_segment.capacity)));
        // SAFETY: freshly allocated, exclusively owned by this call until
        // published below.
        let new_segment = unsafe { &*new_segment_ptr };
        let new_mask = new_segment.mask();

        let new_offset = Segment::<T>::offset(p_index, new_mask);
        // SAFETY: sole writer to this brand-new segment before publication.
        unsafe { new_segment.store_value(new_offset, value) };

        // Link before anything else becomes visible to the consumer.
        old_segment.next.store(new_segment_ptr, Ordering::Release);
        self.producer_segment.store(new_segment_ptr, Ordering::Release);

        let consumer_index = self.consumer_index.load(Ordering::Acquire);
        // The reference's `availableInQueue` is always `MaxInt64` (queue is
        // unbounded); kept as an unreachable branch per spec §9's resolved
        // open question rather than a live path.
        let available_in_queue = i64::MAX;
        let new_limit = if available_in_queue < new_mask {
            p_index + available_in_queue
        } else {
            p_index + new_mask
        };
        self.producer_limit.store(new_limit, Ordering::Release);

        // Clear the grow-lock and advance past the inserted element.
        self.producer_index.store(p_index + 2, Ordering::Release);

        let old_offset = Segment::<T>::offset(p_index, old_mask);
        old_segment.mark_jump(old_offset);
    }

    /// Dequeues the oldest value, or `None` if the queue is currently
    /// empty. Must only be called by the queue's single designated
    /// consumer.
    pub(crate) fn poll(&self) -> Option<T> {
        // SAFETY: single consumer invariant — see struct docs.
        let segment_ptr = unsafe { *self.consumer_segment.get() };
        // SAFETY: consumer_segment always points at a live, still-owned
        // segment (freed only when the whole queue drops).
        let mut segment = unsafe { &*segment_ptr };
        let consumer_index = self.consumer_index.load(Ordering::Relaxed);
        let mut mask = segment.mask();
        let mut offset = Segment::<T>::offset(consumer_index, mask);

        let mut tag = segment.tag(offset);
        if tag == CELL_EMPTY {
            let producer_index = self.producer_index.load(Ordering::Acquire);
            debug_assert_consumer_not_past_producer!(consumer_index, producer_index);
            if consumer_index == producer_index {
                return None;
            }
            // The producer has reserved this slot but hasn't finished its
            // store yet; bounded in practice by the CAS-then-store window.
            let mut backoff = Backoff::new();
            loop {
                tag = segment.tag(offset);
                if tag != CELL_EMPTY {
                    break;
                }
                backoff.snooze();
            }
        }

        if tag == CELL_JUMP {
            let next_ptr = self.follow_link(segment);
            // SAFETY: the resize protocol never links to a segment it
            // hasn't itself initialized.
            segment = unsafe { &*next_ptr };
            // SAFETY: single consumer invariant.
            unsafe { *self.consumer_segment.get() = next_ptr };
            mask = segment.mask();
            offset = Segment::<T>::offset(consumer_index, mask);
            // The new segment's cell for this index was published before
            // the old segment's JUMP marker (resize's write order); wait
            // for it the same bounded way.
            let mut backoff = Backoff::new();
            while segment.tag(offset) == CELL_EMPTY {
                backoff.snooze();
            }
        }

        // SAFETY: tag confirmed CELL_VALUE (directly or after following a
        // JUMP), and only the single consumer reads/retires cells.
        let value = unsafe { segment.take_value(offset) };
        self.consumer_index.store(consumer_index + 2, Ordering::Release);
        Some(value)
    }

    /// Follows `segment.next`, spinning if the link hasn't become visible
    /// yet (it is written strictly before the `JUMP` tag the caller just
    /// observed, so this should resolve immediately in practice).
    fn follow_link(&self, segment: &Segment<T>) -> *mut Segment<T> {
        let mut backoff = Backoff::new();
        loop {
            let next = segment.next.load(Ordering::Acquire);
            if !next.is_null() {
                // A segment is only ever linked-from once: the resize that
                // retired it is the sole writer of `next`, and the consumer
                // only calls this once per JUMP it observes.
                debug_assert_link_not_already_consumed!(next == (segment as *const Segment<T>).cast_mut());
                return next;
            }
            backoff.snooze();
        }
    }

    /// `true` iff no values are currently staged.
    pub(crate) fn is_empty(&self) -> bool {
        self.consumer_index.load(Ordering::Acquire) == self.producer_index.load(Ordering::Acquire)
    }

    /// A best-effort, possibly-stale count of staged values. Takes a
    /// consistent `(producer, consumer)` snapshot by retrying until two
    /// consumer-index reads straddling a producer-index read agree (same
    /// technique as the reference implementation).
    ///
    /// Note: the reference computes `producerIndex - consumerIndex/2`,
    /// dividing only one side of the ×2-encoded counters by two; that is a
    /// dimensional error (size would scale with the raw producer index
    /// rather than the element count). This keeps the symmetric
    /// `(producer - consumer) / 2` instead.
    pub(crate) fn size(&self) -> i64 {
        let mut after = self.consumer_index.load(Ordering::Acquire);
        loop {
            let before = after;
            let producer_index = self.producer_index.load(Ordering::Acquire);
            after = self.consumer_index.load(Ordering::Acquire);
            if before == after {
                let size = (producer_index - after) / 2;
                return size.clamp(0, i64::MAX);
            }
        }
    }
}

impl<T> Drop for MpscQueue<T> {
    fn drop(&mut self) {
        let mut current = self.first_segment;
        while !current.is_null() {
            // SAFETY: every segment in the chain was allocated by
            // `Box::into_raw` and is freed exactly once, here, when the
            // whole queue drops; nothing else ever frees a segment.
            let boxed = unsafe { Box::from_raw(current) };
            current = boxed.next.load(Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_single_producer() {
        let queue = MpscQueue::<i32>::new(4);
        for i in 1..=5 {
            assert!(queue.offer(i));
        }
        for expected in 1..=5 {
            assert_eq!(queue.poll(), Some(expected));
        }
        assert_eq!(queue.poll(), None);
    }

    #[test]
    fn grows_across_segment_boundaries() {
        // An explicit capacity of 2 is honored as-is (only requests below 2
        // fall back to MIN_SEGMENT_CAPACITY), so this segment genuinely
        // holds a single data slot and every offer past the first forces a
        // resize, exercising many segment boundaries within this test.
        let queue = MpscQueue::<i32>::new(2);
        let n = 1000;
        for i in 0..n {
            assert!(queue.offer(i));
        }
        for expected in 0..n {
            assert_eq!(queue.poll(), Some(expected));
        }
        assert_eq!(queue.poll(), None);
    }

    /// Spec §8 S4: `Queue(init capacity 2)`: offer 1,2,3,4,5 (forcing
    /// repeated resizes since a capacity-2 segment holds a single data
    /// slot); poll five times. Expect 1,2,3,4,5 in order; a sixth poll
    /// returns none.
    #[test]
    fn s4_tiny_capacity_forces_resizes_then_drains_in_order() {
        let queue = MpscQueue::<i32>::new(2);
        for i in 1..=5 {
            assert!(queue.offer(i));
        }
        for expected in 1..=5 {
            assert_eq!(queue.poll(), Some(expected));
        }
        assert_eq!(queue.poll(), None);
    }

    #[test]
    fn is_empty_reflects_state() {
        let queue = MpscQueue::<i32>::new(8);
        assert!(queue.is_empty());
        queue.offer(1);
        assert!(!queue.is_empty());
        queue.poll();
        assert!(queue.is_empty());
    }

    #[test]
    fn size_matches_offered_minus_polled() {
        let queue = MpscQueue::<i32>::new(8);
        for i in 0..10 {
            queue.offer(i);
        }
        assert_eq!(queue.size(), 10);
        for _ in 0..4 {
            queue.poll();
        }
        assert_eq!(queue.size(), 6);
    }

    #[test]
    fn mpsc_linearizes_with_no_loss_or_duplication() {
        let queue = Arc::new(MpscQueue::<(usize, u32)>::new(16));
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: u32 = 5_000;

        let handles: Vec<_> = (0..PRODUCERS)
            .map(|id| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        queue.offer((id, i));
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        let mut last_seen = vec![None::<u32>; PRODUCERS];
        let mut total = 0;
        while let Some((id, value)) = queue.poll() {
            if let Some(last) = last_seen[id] {
                assert!(value > last, "producer {id} FIFO violated: {last} then {value}");
            }
            last_seen[id] = Some(value);
            total += 1;
        }
        assert_eq!(total, PRODUCERS * PER_PRODUCER as usize);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property 1: single-producer FIFO — whatever order a lone
            /// producer offers values in, the consumer polls them back in
            /// that exact order, regardless of segment size or value count.
            #[test]
            fn prop_single_producer_fifo(
                initial_capacity in 2usize..64,
                values in prop::collection::vec(any::<i64>(), 0..500),
            ) {
                let queue = MpscQueue::<i64>::new(initial_capacity);
                for &v in &values {
                    prop_assert!(queue.offer(v));
                }
                for &expected in &values {
                    prop_assert_eq!(queue.poll(), Some(expected));
                }
                prop_assert_eq!(queue.poll(), None);
            }

            /// Property 3: unbounded growth — offering N values with no
            /// intervening polls, for N far past the initial segment size,
            /// leaves every value reachable in order across however many
            /// segment boundaries that required.
            #[test]
            fn prop_unbounded_growth_preserves_order(
                initial_capacity in 2usize..8,
                n in 200usize..2_000,
            ) {
                let queue = MpscQueue::<usize>::new(initial_capacity);
                for i in 0..n {
                    prop_assert!(queue.offer(i));
                }
                for expected in 0..n {
                    prop_assert_eq!(queue.poll(), Some(expected));
                }
                prop_assert_eq!(queue.poll(), None);
            }
        }

        /// Property 2: MPSC linearization — K producers each offering a
        /// disjoint, strictly increasing value set; the consumer must see
        /// exactly K*M values with no loss or duplication, each producer's
        /// own subsequence still in order.
        #[test]
        fn prop_mpsc_linearizes_across_many_producer_counts() {
            for &producers in &[1usize, 2, 3, 6] {
                let per_producer = 2_000u32;
                let queue = Arc::new(MpscQueue::<(usize, u32)>::new(16));
                let handles: Vec<_> = (0..producers)
                    .map(|id| {
                        let queue = Arc::clone(&queue);
                        thread::spawn(move || {
                            for i in 0..per_producer {
                                queue.offer((id, i));
                            }
                        })
                    })
                    .collect();
                for h in handles {
                    h.join().unwrap();
                }

                let mut last_seen = vec![None::<u32>; producers];
                let mut total = 0usize;
                while let Some((id, value)) = queue.poll() {
                    if let Some(last) = last_seen[id] {
                        assert!(value > last, "producer {id} FIFO violated: {last} then {value}");
                    }
                    last_seen[id] = Some(value);
                    total += 1;
                }
                assert_eq!(total, producers * per_producer as usize);
            }
        }
    }

    #[test]
    fn drop_frees_chain_without_leaking_pending_values() {
        struct DropTracker(Arc<std::sync::atomic::AtomicUsize>);
        impl Drop for DropTracker {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        {
            let queue = MpscQueue::<DropTracker>::new(4);
            for _ in 0..50 {
                queue.offer(DropTracker(Arc::clone(&counter)));
            }
            // leave everything unpolled so Drop must clean up live cells
        }
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }
}
