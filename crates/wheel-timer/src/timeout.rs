//! Per-timer record, its publicly-handed-out handle, and the generational
//! arena that backs the bucket intrusive lists.
//!
//! A timeout's lifecycle splits across two pieces of storage:
//!
//! - [`TimeoutShared`] — `Arc`-shared, created on the calling producer
//!   thread the moment [`crate::WheelTimer::new_timeout`] is called. Holds
//!   the atomic `state` (the only field any thread besides the worker ever
//!   touches) and the task body. Exists for the lifetime of every
//!   [`TimeoutHandle`] clone plus, while placed, the arena entry that owns
//!   an additional clone of it.
//! - [`Arena`] entries — worker-only, created lazily when the tick loop
//!   drains the submission queue and actually places a timeout into a
//!   bucket. `prev`/`next`/`bucket` links live here as arena indices, not
//!   as reference-counted pointers, which is what lets a bucket's doubly
//!   linked list exist without an `Rc<RefCell<_>>` cycle: indices are
//!   `Copy` and carry no ownership.
//!
//! `TimeoutShared::arena_slot` is the bridge between the two: the worker
//! stamps it in when placing a timeout and clears it when removing one, so
//! a cancellation arriving for a timeout that was never placed (or already
//! removed) is a cheap, correct no-op rather than a linear scan.

use crate::invariants::debug_assert_terminal_transition;
use std::cell::UnsafeCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_INIT: u8 = 0;
const STATE_CANCELLED: u8 = 1;
const STATE_EXPIRED: u8 = 2;

/// The capability every admitted timeout invokes once it fires.
///
/// The return value is observed only by whatever the caller does with it
/// (e.g. logging); the engine itself discards it, matching spec §6.
pub trait Task: Send + 'static {
    /// Runs the task body. `handle` is the same handle the caller that
    /// admitted this timeout received, allowing the body to inspect its own
    /// deadline or submit a follow-up timeout via [`TimeoutHandle::timer`].
    fn run(&self, handle: &TimeoutHandle) -> bool;
}

impl<F> Task for F
where
    F: Fn(&TimeoutHandle) -> bool + Send + 'static,
{
    fn run(&self, handle: &TimeoutHandle) -> bool {
        self(handle)
    }
}

/// A generational index into an [`Arena`]: stale copies of a recycled
/// slot's old identity are distinguishable from its new occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimeoutId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

enum ArenaSlot<T> {
    Occupied { generation: u32, value: T },
    Free { generation: u32, next_free: Option<u32> },
}

/// Single-writer slab of `T`, addressed by [`TimeoutId`]. Never touched
/// except from the engine's worker thread.
pub(crate) struct Arena<T> {
    slots: Vec<ArenaSlot<T>>,
    free_head: Option<u32>,
}

impl<T> Arena<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
        }
    }

    pub(crate) fn insert(&mut self, value: T) -> TimeoutId {
        if let Some(index) = self.free_head {
            let slot = &mut self.slots[index as usize];
            let (generation, next_free) = match *slot {
                ArenaSlot::Free { generation, next_free } => (generation, next_free),
                ArenaSlot::Occupied { .. } => {
                    unreachable!("free list pointed at an occupied slot")
                }
            };
            self.free_head = next_free;
            *slot = ArenaSlot::Occupied { generation, value };
            TimeoutId { index, generation }
        } else {
            let index = u32::try_from(self.slots.len()).expect("arena exceeded u32::MAX entries");
            self.slots.push(ArenaSlot::Occupied { generation: 0, value });
            TimeoutId { index, generation: 0 }
        }
    }

    pub(crate) fn get(&self, id: TimeoutId) -> Option<&T> {
        match self.slots.get(id.index as usize)? {
            ArenaSlot::Occupied { generation, value } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, id: TimeoutId) -> Option<&mut T> {
        match self.slots.get_mut(id.index as usize)? {
            ArenaSlot::Occupied { generation, value } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    pub(crate) fn remove(&mut self, id: TimeoutId) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        match slot {
            ArenaSlot::Occupied { generation, .. } if *generation == id.generation => {
                let next_free = self.free_head;
                let taken = std::mem::replace(
                    slot,
                    ArenaSlot::Free {
                        generation: id.generation.wrapping_add(1),
                        next_free,
                    },
                );
                self.free_head = Some(id.index);
                match taken {
                    ArenaSlot::Occupied { value, .. } => Some(value),
                    ArenaSlot::Free { .. } => None,
                }
            }
            _ => None,
        }
    }
}

/// The arena-resident half of a placed timeout: the intrusive list links
/// and round counter. Never touched off the worker thread.
pub(crate) struct ArenaEntry {
    pub(crate) shared: Arc<TimeoutShared>,
    pub(crate) remaining_rounds: u64,
    pub(crate) bucket: Option<usize>,
    pub(crate) prev: Option<TimeoutId>,
    pub(crate) next: Option<TimeoutId>,
}

/// The seam a [`TimeoutHandle`] uses to reach back into the engine that
/// admitted it, without making the handle generic over the engine's clock
/// and spawner type parameters.
pub(crate) trait EngineHandle: Send + Sync {
    fn submit_cancellation(&self, shared: Arc<TimeoutShared>);
    fn new_timeout(self: Arc<Self>, task: Box<dyn Task>, delay_ns: i64) -> TimeoutHandle;
}

/// A lightweight reference to the engine, handed to a running task so it
/// can submit a follow-up timeout (spec §6: "the handle passed to `run`
/// exposes the engine, permitting re-scheduling").
#[derive(Clone)]
pub struct Timer(pub(crate) Arc<dyn EngineHandle>);

impl Timer {
    /// Admits a new timeout on the same engine that owns this handle.
    pub fn new_timeout(&self, task: impl Task, delay: Duration) -> TimeoutHandle {
        let delay_ns = i64::try_from(delay.as_nanos()).unwrap_or(i64::MAX);
        Arc::clone(&self.0).new_timeout(Box::new(task), delay_ns)
    }
}

/// The `Arc`-shared state every [`TimeoutHandle`] clone and, while placed,
/// the owning arena entry, point at.
pub(crate) struct TimeoutShared {
    state: AtomicU8,
    deadline_ns: i64,
    task: Box<dyn Task>,
    /// Worker-only: `Some(id)` while this timeout occupies an arena slot
    /// (and therefore a bucket), `None` before placement and after removal.
    ///
    /// # Safety
    /// Only the engine's single worker thread reads or writes this cell.
    arena_slot: UnsafeCell<Option<TimeoutId>>,
}

// SAFETY: `arena_slot` is only ever touched from the engine's worker
// thread; every other field is either immutable after construction
// (`deadline_ns`, `task`) or itself atomic (`state`).
unsafe impl Send for TimeoutShared {}
unsafe impl Sync for TimeoutShared {}

impl TimeoutShared {
    pub(crate) fn new(task: Box<dyn Task>, deadline_ns: i64) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(STATE_INIT),
            deadline_ns,
            task,
            arena_slot: UnsafeCell::new(None),
        })
    }

    pub(crate) fn deadline_ns(&self) -> i64 {
        self.deadline_ns
    }

    pub(crate) fn task(&self) -> &dyn Task {
        &*self.task
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_CANCELLED
    }

    pub(crate) fn is_expired(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_EXPIRED
    }

    /// `Some(id)` iff this timeout currently occupies an arena slot.
    /// Worker-thread only.
    pub(crate) fn arena_slot(&self) -> Option<TimeoutId> {
        // SAFETY: worker-thread-only field, see struct docs.
        unsafe { *self.arena_slot.get() }
    }

    /// Records the arena slot this timeout was just placed into.
    /// Worker-thread only.
    pub(crate) fn set_arena_slot(&self, id: Option<TimeoutId>) {
        // SAFETY: worker-thread-only field, see struct docs.
        unsafe { *self.arena_slot.get() = id };
    }

    /// Attempts `INIT -> EXPIRED`. On success runs the task body, isolating
    /// a panic inside it so one failing task cannot bring down the worker
    /// (spec §7). Returns `true` iff this call actually fired the task.
    pub(crate) fn expire(self: &Arc<Self>, handle: &TimeoutHandle) -> bool {
        match self
            .state
            .compare_exchange(STATE_INIT, STATE_EXPIRED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(prev) => debug_assert_terminal_transition!(prev, STATE_INIT),
            Err(_) => return false,
        }
        // A task panicking must not prevent the rest of this tick's bucket
        // walk or cancel-queue drain from completing.
        let _ = panic::catch_unwind(AssertUnwindSafe(|| self.task.run(handle)));
        true
    }

    /// Attempts `INIT -> CANCELLED`. Returns `true` on success.
    pub(crate) fn cancel(&self) -> bool {
        match self
            .state
            .compare_exchange(STATE_INIT, STATE_CANCELLED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(prev) => {
                debug_assert_terminal_transition!(prev, STATE_INIT);
                true
            }
            Err(_) => false,
        }
    }
}

/// The public, cloneable reference to an admitted timeout.
///
/// State queries go through the shared atomic cell directly; they never
/// walk back through the arena, so a handle remains meaningful even long
/// after its timeout fired or was cancelled and its arena slot recycled.
#[derive(Clone)]
pub struct TimeoutHandle {
    pub(crate) shared: Arc<TimeoutShared>,
    engine: Arc<dyn EngineHandle>,
}

impl TimeoutHandle {
    pub(crate) fn new(shared: Arc<TimeoutShared>, engine: Arc<dyn EngineHandle>) -> Self {
        Self { shared, engine }
    }

    /// Attempts to cancel this timeout. Returns `true` iff this call was the
    /// one that transitioned `INIT -> CANCELLED`; a losing race (already
    /// cancelled or already fired) returns `false`.
    ///
    /// The worker unlinks the timeout from its bucket at the next tick
    /// boundary, not synchronously with this call.
    pub fn cancel(&self) -> bool {
        let cancelled = self.shared.cancel();
        if cancelled {
            self.engine.submit_cancellation(Arc::clone(&self.shared));
        }
        cancelled
    }

    /// `true` iff this timeout has fired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.shared.is_expired()
    }

    /// `true` iff this timeout was cancelled before firing.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// The timeout's deadline, in nanoseconds relative to engine start.
    #[must_use]
    pub fn deadline(&self) -> i64 {
        self.shared.deadline_ns()
    }

    /// The task this timeout was admitted with (spec §4.C / §6's `Task()`
    /// accessor).
    #[must_use]
    pub fn task(&self) -> &dyn Task {
        self.shared.task()
    }

    /// A handle to the engine that owns this timeout, for re-scheduling.
    #[must_use]
    pub fn timer(&self) -> Timer {
        Timer(Arc::clone(&self.engine))
    }

    /// Time remaining until `deadline()`, given the current monotonic
    /// `now_nanos` reading, or `None` if the deadline has already passed.
    ///
    /// Not present in the distilled spec's accessor table; added as the
    /// natural companion to [`TimeoutHandle::deadline`] for callers that
    /// want to display "fires in N ms" without re-deriving the
    /// subtraction/saturation themselves.
    #[must_use]
    pub fn remaining(&self, now_nanos: i64) -> Option<Duration> {
        let delta = self.shared.deadline_ns().saturating_sub(now_nanos);
        if delta <= 0 {
            None
        } else {
            Some(Duration::from_nanos(delta as u64))
        }
    }
}
