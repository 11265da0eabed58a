//! wheel-timer - Lock-Free Hashed Wheel Timer
//!
//! A hashed wheel timer in the style of Netty's `HashedWheelTimer`: timeouts
//! are admitted from any number of producer threads through lock-free MPSC
//! staging queues, and a single dedicated worker thread ticks a circular
//! bucket array, firing each timeout's task exactly once when its deadline's
//! tick comes around.
//!
//! # Key Features
//!
//! - O(1) admission, cancellation, and per-tick expiry (amortized) — no
//!   per-timeout heap, no O(log n) reschedule
//! - Lock-free MPSC admission and cancellation queues (a JCTools-style
//!   unbounded array-linked queue, not a mutex)
//! - A single tick-loop worker owns the bucket wheel outright; no locking on
//!   the hot expiry path
//! - Deadlines further out than one revolution are handled by a per-timeout
//!   round counter, not a bigger wheel
//!
//! # Example
//!
//! ```
//! use wheel_timer::WheelTimer;
//! use std::time::Duration;
//!
//! let timer = WheelTimer::new(Duration::from_millis(100), 512);
//! let handle = timer.new_timeout(
//!     |_handle| {
//!         println!("fired");
//!         true
//!     },
//!     Duration::from_millis(250),
//! );
//! assert!(!handle.is_expired());
//! timer.stop();
//! ```

mod backoff;
mod bucket;
mod clock;
mod config;
mod error;
mod invariants;
mod metrics;
mod queue;
mod spawner;
mod timeout;
mod wheel;

pub use clock::{Clock, SystemClock};
pub use config::WheelConfig;
pub use error::FatalError;
pub use metrics::MetricsSnapshot;
pub use spawner::{Spawner, ThreadSpawner};
pub use timeout::{Task, Timer, TimeoutHandle};
pub use wheel::WheelTimer;
