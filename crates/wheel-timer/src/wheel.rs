//! The tick loop, the circular bucket array, and the [`WheelTimer`] public
//! entry point (spec §4.D, §6).
//!
//! `Inner<C, S>` is the shared, `Arc`-held state every producer thread
//! touches (`new_timeout`, `cancel`, `stop`) and that the single worker
//! thread drives (the tick loop). Two different access disciplines share
//! one allocation:
//!
//! - `config`, `clock`, `spawner`, the two staging queues, `state`, and
//!   `start_time_ns` are reached from arbitrary threads and are therefore
//!   atomics or otherwise safely `Sync` on their own.
//! - `worker`, wrapping [`WorkerState`] (the bucket array, the timeout
//!   arena, and the tick counter) in an `UnsafeCell`, is touched only by the
//!   single spawned worker thread for the engine's entire lifetime (spec
//!   §5: "Bucket lists, tick, start_time... and wheel are worker-only").
//!   The `unsafe impl Sync` below is the one place that discipline is
//!   asserted rather than enforced by the type system.

use crate::bucket::Bucket;
use crate::clock::{Clock, SystemClock};
use crate::config::{WheelConfig, DEFAULT_QUEUE_SEGMENT_CAPACITY, DEFAULT_TRANSFER_BUDGET};
use crate::metrics::MetricsSnapshot;
use crate::queue::MpscQueue;
use crate::spawner::{Spawner, ThreadSpawner};
use crate::timeout::{Arena, ArenaEntry, EngineHandle, Task, TimeoutHandle, TimeoutShared};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const ENGINE_INIT: u8 = 0;
const ENGINE_STARTED: u8 = 1;
const ENGINE_SHUTDOWN: u8 = 2;

/// The worker-thread-only half of the engine: the bucket array, the
/// timeout arena backing every bucket's intrusive list, and the tick
/// counter. See the module docs for the single-writer discipline.
struct WorkerState {
    wheel: Vec<Bucket>,
    arena: Arena<ArenaEntry>,
    tick: u64,
}

impl WorkerState {
    fn new(wheel_size: usize) -> Self {
        Self {
            wheel: (0..wheel_size).map(|_| Bucket::new()).collect(),
            arena: Arena::new(),
            tick: 0,
        }
    }
}

struct Inner<C, S> {
    config: WheelConfig,
    clock: C,
    spawner: S,
    submission_queue: MpscQueue<Arc<TimeoutShared>>,
    cancel_queue: MpscQueue<Arc<TimeoutShared>>,
    state: AtomicU8,
    start_time_ns: AtomicI64,
    /// Set exactly once, by the CAS winner in [`Inner::ensure_started`],
    /// right after `start_time_ns` is published. Lets the CAS losers
    /// (concurrent callers of `new_timeout` racing the very first
    /// admission) wait for a stable epoch instead of reading a
    /// possibly-default `start_time_ns` (spec §4.D's resolved open
    /// question: sample the epoch once, in the winning branch).
    start_time_ready: AtomicBool,
    worker: UnsafeCell<WorkerState>,
}

// SAFETY: every field except `worker` is reached concurrently through its
// own atomic or internally-synchronized type. `worker` is only ever
// dereferenced from the single thread `ensure_started` spawns, for the
// lifetime of the engine (spec §5).
unsafe impl<C: Clock, S: Spawner> Sync for Inner<C, S> {}

impl<C: Clock, S: Spawner> Inner<C, S> {
    fn new(config: WheelConfig, clock: C, spawner: S) -> Self {
        let wheel_size = config.wheel_size();
        Self {
            config,
            clock,
            spawner,
            submission_queue: MpscQueue::new(DEFAULT_QUEUE_SEGMENT_CAPACITY),
            cancel_queue: MpscQueue::new(DEFAULT_QUEUE_SEGMENT_CAPACITY),
            state: AtomicU8::new(ENGINE_INIT),
            start_time_ns: AtomicI64::new(0),
            start_time_ready: AtomicBool::new(false),
            worker: UnsafeCell::new(WorkerState::new(wheel_size)),
        }
    }

    /// Worker-only access to the bucket array / arena / tick counter.
    ///
    /// # Safety
    /// Must only be called from the single worker thread spawned in
    /// `ensure_started`.
    #[allow(clippy::mut_from_ref)]
    unsafe fn worker_state(&self) -> &mut WorkerState {
        unsafe { &mut *self.worker.get() }
    }

    /// Idempotently starts the worker thread (spec §4.D). The winning CAS
    /// samples `start_time` once; every other caller — whether racing the
    /// very first call or arriving long after — just observes `STARTED`
    /// and returns.
    fn ensure_started(self: &Arc<Self>) {
        if self.state.load(Ordering::Acquire) != ENGINE_INIT {
            return;
        }
        match self
            .state
            .compare_exchange(ENGINE_INIT, ENGINE_STARTED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                let now = self.clock.now_nanos();
                let start = if now == 0 { 1 } else { now };
                self.start_time_ns.store(start, Ordering::Release);
                self.start_time_ready.store(true, Ordering::Release);
                let worker_engine = Arc::clone(self);
                self.spawner.spawn(Box::new(move || worker_engine.run()));
            }
            Err(ENGINE_SHUTDOWN) => {}
            Err(_) => {
                // Another thread's CAS won; spin until it publishes the
                // epoch before this caller computes a deadline off it.
                while !self.start_time_ready.load(Ordering::Acquire) {
                    std::hint::spin_loop();
                }
            }
        }
    }

    fn stop(&self) {
        if self.state.load(Ordering::Acquire) == ENGINE_SHUTDOWN {
            return;
        }
        if self
            .state
            .compare_exchange(ENGINE_STARTED, ENGINE_SHUTDOWN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return;
        }
        // Was still INIT (never started): force to SHUTDOWN directly.
        self.state.store(ENGINE_SHUTDOWN, Ordering::Release);
    }

    /// The tick loop (spec §4.D). Runs on the single worker thread for the
    /// engine's lifetime.
    fn run(self: Arc<Self>) {
        while self.state.load(Ordering::Acquire) == ENGINE_STARTED {
            let now = self.wait_for_next_tick();
            // SAFETY: called only from this worker thread.
            let worker = unsafe { self.worker_state() };
            self.drain_cancellations(worker);
            self.transfer_submissions(worker);

            let slot = (worker.tick as usize) & self.config.mask();
            let engine: Arc<dyn EngineHandle> = Arc::clone(&self) as Arc<dyn EngineHandle>;
            worker.wheel[slot].expire(&mut worker.arena, now, &engine);
            worker.tick += 1;
        }
        // SAFETY: worker thread is the sole caller here too; the loop has
        // already exited so there is no concurrent tick in progress.
        let worker = unsafe { self.worker_state() };
        self.drain_cancellations(worker);
    }

    /// Sleeps until the boundary of the next tick, returning the elapsed
    /// time (relative to `start_time_ns`) at which it woke. Sleeps in
    /// millisecond granularity, rounding up, per spec §4.D / §9.
    fn wait_for_next_tick(&self) -> i64 {
        // SAFETY: `tick` is worker-owned; reading it here is safe because
        // this method is only ever called from the worker thread.
        let tick = unsafe { (*self.worker.get()).tick };
        let tick_duration_ns = self.config.tick_duration_nanos();
        let target = tick_duration_ns.saturating_mul(tick as i64 + 1);
        loop {
            let start = self.start_time_ns.load(Ordering::Acquire);
            let now = self.clock.now_nanos().saturating_sub(start);
            if now >= target {
                return now;
            }
            let remaining_ns = target - now;
            let sleep_ms = (remaining_ns + 999_999) / 1_000_000;
            thread::sleep(Duration::from_millis(sleep_ms.max(1) as u64));
        }
    }

    /// Drains the cancel queue completely, unlinking each cancelled
    /// timeout from its bucket if it has one (spec §4.D step 2).
    fn drain_cancellations(&self, worker: &mut WorkerState) {
        while let Some(shared) = self.cancel_queue.poll() {
            let Some(id) = shared.arena_slot() else {
                // Never placed, or already removed by a prior pass — the
                // same idempotent no-op the source's `timeout.remove()`
                // performs when `bucket == nil` (spec §4.C).
                continue;
            };
            let Some(bucket_index) = worker.arena.get(id).and_then(|entry| entry.bucket) else {
                continue;
            };
            worker.wheel[bucket_index].remove(&mut worker.arena, id);
            worker.arena.remove(id);
            shared.set_arena_slot(None);
        }
    }

    /// Drains up to [`DEFAULT_TRANSFER_BUDGET`] submissions, placing each
    /// into its computed `(round, slot)` bucket (spec §4.D step 3).
    fn transfer_submissions(&self, worker: &mut WorkerState) {
        let tick_duration_ns = self.config.tick_duration_nanos();
        let wheel_len = worker.wheel.len() as i64;
        let mask = self.config.mask();

        for _ in 0..DEFAULT_TRANSFER_BUDGET {
            let Some(shared) = self.submission_queue.poll() else {
                break;
            };
            if shared.is_cancelled() {
                continue;
            }

            let calculated = shared.deadline_ns() / tick_duration_ns;
            let tick = worker.tick as i64;
            let remaining_rounds = ((calculated - tick) / wheel_len).max(0) as u64;
            let slot = (calculated.max(tick) as usize) & mask;

            let id = worker.arena.insert(ArenaEntry {
                shared: Arc::clone(&shared),
                remaining_rounds,
                bucket: None,
                prev: None,
                next: None,
            });
            worker.wheel[slot].append(&mut worker.arena, id, slot);
            shared.set_arena_slot(Some(id));
        }
    }

    fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            pending_submissions: self.submission_queue.size(),
            pending_cancellations: self.cancel_queue.size(),
        }
    }
}

impl<C: Clock, S: Spawner> EngineHandle for Inner<C, S> {
    fn submit_cancellation(&self, shared: Arc<TimeoutShared>) {
        self.cancel_queue.offer(shared);
    }

    fn new_timeout(self: Arc<Self>, task: Box<dyn Task>, delay_ns: i64) -> TimeoutHandle {
        self.ensure_started();

        let now = self.clock.now_nanos();
        let start = self.start_time_ns.load(Ordering::Acquire);
        let elapsed = now.saturating_sub(start);
        let sum = elapsed.wrapping_add(delay_ns);
        // Mirrors the source's overflow check: a positive delay that wraps
        // the sum negative saturates to the maximum deadline (spec §3, §7).
        let deadline_ns = if delay_ns > 0 && sum < 0 { i64::MAX } else { sum };

        let shared = TimeoutShared::new(task, deadline_ns);
        self.submission_queue.offer(Arc::clone(&shared));
        TimeoutHandle::new(shared, self)
    }
}

/// A hashed wheel timer: admits timeouts from any thread, fires each once
/// on the single tick worker (spec §1, §6).
///
/// Generic over the clock and spawn primitives the distilled spec treats as
/// external collaborators (`SPEC_FULL.md`'s clock/spawner supplement);
/// [`WheelTimer::new`] defaults both to the real ones and is the only
/// constructor most callers need.
pub struct WheelTimer<C: Clock = SystemClock, S: Spawner = ThreadSpawner> {
    inner: Arc<Inner<C, S>>,
}

impl<C: Clock, S: Spawner> Clone for WheelTimer<C, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl WheelTimer<SystemClock, ThreadSpawner> {
    /// Creates a timer with the given tick duration and wheel size, both
    /// clamped per spec §3. No worker thread is spawned yet; the first
    /// call to [`WheelTimer::new_timeout`] starts it.
    #[must_use]
    pub fn new(tick_duration: Duration, ticks_per_wheel: usize) -> Self {
        Self::with_config(WheelConfig::new(tick_duration, ticks_per_wheel))
    }

    /// Creates a timer from an already-built [`WheelConfig`].
    #[must_use]
    pub fn with_config(config: WheelConfig) -> Self {
        Self::with_clock_and_spawner(config, SystemClock::new(), ThreadSpawner)
    }
}

impl Default for WheelTimer<SystemClock, ThreadSpawner> {
    fn default() -> Self {
        Self::with_config(WheelConfig::default())
    }
}

impl<C: Clock, S: Spawner> WheelTimer<C, S> {
    /// Creates a timer with an injected clock and spawn primitive — the
    /// seam tests use to drive the tick loop deterministically instead of
    /// against wall-clock time (`SPEC_FULL.md`'s clock/spawner supplement).
    #[must_use]
    pub fn with_clock_and_spawner(config: WheelConfig, clock: C, spawner: S) -> Self {
        Self {
            inner: Arc::new(Inner::new(config, clock, spawner)),
        }
    }

    /// Admits a new timeout, starting the worker on first call (spec §6).
    /// `delay` may be zero or negative-equivalent (any `Duration` is
    /// non-negative, but a deadline already in the past still fires on the
    /// very next tick per spec §4.D).
    pub fn new_timeout(&self, task: impl Task, delay: Duration) -> TimeoutHandle {
        let delay_ns = i64::try_from(delay.as_nanos()).unwrap_or(i64::MAX);
        Arc::clone(&self.inner).new_timeout(Box::new(task), delay_ns)
    }

    /// Idempotently shuts the engine down. The worker exits after its
    /// current sleep completes; in-flight submissions are not guaranteed
    /// to be flushed (spec §4.D).
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// The configuration this timer was constructed with.
    #[must_use]
    pub fn config(&self) -> WheelConfig {
        self.inner.config
    }

    /// A snapshot of pending-submission / pending-cancellation counts, or
    /// `None` if [`WheelConfig::enable_metrics`] was left off (the default;
    /// spec's ambient metrics surface, zero overhead when disabled).
    #[must_use]
    pub fn metrics(&self) -> Option<MetricsSnapshot> {
        self.inner.config.enable_metrics.then(|| self.inner.metrics())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::tests::FakeClock;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    /// A spawner that runs the worker inline on a dedicated thread but
    /// hands the test a join handle, so tests can `stop()` and wait for
    /// the worker to actually exit instead of racing it.
    struct JoinableSpawner {
        handle: std::sync::Mutex<Option<thread::JoinHandle<()>>>,
    }

    impl JoinableSpawner {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                handle: std::sync::Mutex::new(None),
            })
        }

        fn join(&self) {
            if let Some(h) = self.handle.lock().unwrap().take() {
                h.join().unwrap();
            }
        }
    }

    impl Spawner for JoinableSpawner {
        fn spawn(&self, task: Box<dyn FnOnce() + Send + 'static>) {
            let handle = thread::spawn(task);
            *self.handle.lock().unwrap() = Some(handle);
        }
    }

    fn tiny_wheel(tick_ms: u64, ticks: usize) -> (WheelTimer<Arc<FakeClock>, Arc<JoinableSpawner>>, Arc<FakeClock>, Arc<JoinableSpawner>) {
        let clock = Arc::new(FakeClock::new());
        let spawner = JoinableSpawner::new();
        let config = WheelConfig::new(Duration::from_millis(tick_ms), ticks);
        let timer = WheelTimer::with_clock_and_spawner(config, Arc::clone(&clock), Arc::clone(&spawner));
        (timer, clock, spawner)
    }

    #[test]
    fn fires_once_past_its_deadline() {
        let (timer, clock, spawner) = tiny_wheel(1, 4);
        let (tx, rx) = mpsc::channel();
        let handle = timer.new_timeout(
            move |_: &TimeoutHandle| {
                tx.send(()).unwrap();
                true
            },
            Duration::from_millis(5),
        );

        let mut fired = false;
        for _ in 0..50 {
            clock.advance(1_000_000);
            thread::sleep(Duration::from_millis(2));
            if rx.try_recv().is_ok() {
                fired = true;
                break;
            }
        }
        // Jump far past any tick boundary the worker could currently be
        // sleeping toward, so `stop` takes effect on its very next wakeup
        // instead of this test hanging on a fake clock that never again
        // advances once the worker observes SHUTDOWN is wanted.
        clock.advance(10_000_000_000);
        timer.stop();
        spawner.join();
        assert!(fired, "timeout never fired within the deadline window");
        assert!(handle.is_expired());
        assert_eq!(rx.try_recv(), Err(mpsc::TryRecvError::Empty));
    }

    #[test]
    fn cancel_before_firing_suppresses_the_task() {
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        let (timer, clock, spawner) = tiny_wheel(1, 16);
        let handle = timer.new_timeout(
            |_: &TimeoutHandle| {
                FIRED.fetch_add(1, Ordering::SeqCst);
                true
            },
            Duration::from_millis(50),
        );
        assert!(handle.cancel());
        assert!(handle.is_cancelled());

        for _ in 0..60 {
            clock.advance(1_000_000);
            thread::sleep(Duration::from_millis(1));
        }
        clock.advance(10_000_000_000);
        timer.stop();
        spawner.join();
        assert_eq!(FIRED.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn zero_delay_fires_on_the_very_next_tick() {
        let (timer, clock, spawner) = tiny_wheel(10, 4);
        let (tx, rx) = mpsc::channel();
        let _handle = timer.new_timeout(
            move |_: &TimeoutHandle| {
                tx.send(()).unwrap();
                true
            },
            Duration::from_millis(0),
        );

        let mut fired = false;
        for _ in 0..30 {
            clock.advance(10_000_000);
            thread::sleep(Duration::from_millis(2));
            if rx.try_recv().is_ok() {
                fired = true;
                break;
            }
        }
        clock.advance(10_000_000_000);
        timer.stop();
        spawner.join();
        assert!(fired, "zero-delay timeout never fired");
    }

    #[test]
    fn stop_is_idempotent() {
        let (timer, _clock, spawner) = tiny_wheel(1, 4);
        timer.stop();
        timer.stop();
        spawner.join();
    }

    #[test]
    fn metrics_are_none_when_disabled() {
        let (timer, _clock, _spawner) = tiny_wheel(1, 4);
        assert!(timer.metrics().is_none());
    }
}
