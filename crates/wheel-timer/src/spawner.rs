use std::thread;

/// Primitive for starting the single tick-loop worker.
///
/// The distilled spec treats thread/goroutine spawning as an external
/// collaborator; making it a trait lets a caller embedding this timer in a
/// runtime that manages its own thread pool supply a non-default spawner
/// (e.g. one that parks the worker on a dedicated, pinned OS thread).
pub trait Spawner: Send + Sync + 'static {
    /// Runs `task` to completion on a new worker. The tick loop never
    /// returns until `WheelTimer::stop` is called, so in practice this
    /// spawns a dedicated thread and returns immediately.
    fn spawn(&self, task: Box<dyn FnOnce() + Send + 'static>);
}

/// The default [`Spawner`], backed by [`std::thread::spawn`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSpawner;

impl Spawner for ThreadSpawner {
    fn spawn(&self, task: Box<dyn FnOnce() + Send + 'static>) {
        thread::Builder::new()
            .name("wheel-timer-worker".to_string())
            .spawn(task)
            .expect("failed to spawn wheel timer worker thread");
    }
}

impl<T: Spawner + ?Sized> Spawner for std::sync::Arc<T> {
    fn spawn(&self, task: Box<dyn FnOnce() + Send + 'static>) {
        (**self).spawn(task);
    }
}
