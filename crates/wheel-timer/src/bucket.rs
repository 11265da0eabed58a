//! A wheel slot's doubly linked list of placed timeouts.
//!
//! Unlike the Go ancestor's `head`/`tail` pointers into the GC'd heap, this
//! list is intrusive over the [`crate::timeout::Arena`]: `head`/`tail` and
//! every `prev`/`next` link are [`TimeoutId`]s, so the bucket owns its
//! members only in the sense that it is the sole path by which the worker
//! reaches them — dropping a bucket never needs to walk and free anything,
//! the arena does that.
//!
//! Single-writer: only the engine's tick-loop worker ever touches a
//! `Bucket`, matching spec §5 ("Buckets are single-writer... bucket
//! iteration requires no locking").

use crate::error::FatalError;
use crate::invariants::{debug_assert_deadline_reached, debug_assert_not_already_bucketed};
use crate::timeout::{Arena, ArenaEntry, EngineHandle, TimeoutHandle, TimeoutId};
use std::sync::Arc;

/// One wheel slot: a FIFO intrusive list of timeouts that all fire on ticks
/// congruent to this slot's index modulo the wheel size (spec §4.B).
#[derive(Default)]
pub(crate) struct Bucket {
    head: Option<TimeoutId>,
    tail: Option<TimeoutId>,
}

impl Bucket {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// `true` iff the bucket currently holds no timeouts.
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Appends `id` at the tail. Precondition: `arena[id].bucket` is `None`
    /// (spec §4.B, INV-B-01).
    pub(crate) fn append(&mut self, arena: &mut Arena<ArenaEntry>, id: TimeoutId, bucket_index: usize) {
        let entry = arena.get_mut(id).expect("append: timeout id not in arena");
        debug_assert_not_already_bucketed!(entry.bucket);
        entry.bucket = Some(bucket_index);
        entry.prev = self.tail;
        entry.next = None;

        match self.tail {
            Some(tail_id) => {
                arena.get_mut(tail_id).expect("append: stale tail id").next = Some(id);
            }
            None => self.head = Some(id),
        }
        self.tail = Some(id);
    }

    /// Unlinks `id` from the list, clearing its `prev`/`next`/`bucket`
    /// fields, and returns the id that followed it (so a walk in progress
    /// can continue from where it left off, spec §4.B).
    pub(crate) fn remove(&mut self, arena: &mut Arena<ArenaEntry>, id: TimeoutId) -> Option<TimeoutId> {
        let (prev, next) = {
            let entry = arena.get(id).expect("remove: timeout id not in arena");
            (entry.prev, entry.next)
        };

        if let Some(prev_id) = prev {
            arena.get_mut(prev_id).expect("remove: stale prev id").next = next;
        }
        if let Some(next_id) = next {
            arena.get_mut(next_id).expect("remove: stale next id").prev = prev;
        }

        if self.head == Some(id) {
            self.head = if self.tail == Some(id) {
                self.tail = None;
                None
            } else {
                next
            };
        } else if self.tail == Some(id) {
            self.tail = prev;
        }

        let entry = arena.get_mut(id).expect("remove: timeout id not in arena");
        entry.prev = None;
        entry.next = None;
        entry.bucket = None;
        next
    }

    /// Walks every timeout currently in this slot once, per spec §4.B:
    /// timeouts whose `remaining_rounds` has reached zero fire (or are
    /// dropped, if cancelled), everything else has its round counter
    /// decremented. `current_deadline_ns` is the firing tick's deadline,
    /// used to assert the placement invariant on timeouts that fire.
    pub(crate) fn expire(
        &mut self,
        arena: &mut Arena<ArenaEntry>,
        current_deadline_ns: i64,
        engine: &Arc<dyn EngineHandle>,
    ) {
        let mut cursor = self.head;
        while let Some(id) = cursor {
            let remaining_rounds = arena.get(id).expect("expire: timeout id not in arena").remaining_rounds;

            if remaining_rounds == 0 {
                let next = self.remove(arena, id);
                let entry = arena.remove(id).expect("expire: timeout id not in arena");
                let deadline_ns = entry.shared.deadline_ns();
                debug_assert_deadline_reached!(deadline_ns, current_deadline_ns);
                if deadline_ns > current_deadline_ns {
                    panic!(
                        "{}",
                        FatalError::DeadlineNotYetReached {
                            deadline_ns,
                            current_deadline_ns,
                        }
                    );
                }
                let handle = TimeoutHandle::new(Arc::clone(&entry.shared), Arc::clone(engine));
                entry.shared.expire(&handle);
                cursor = next;
            } else if arena.get(id).expect("expire: timeout id not in arena").shared.is_cancelled() {
                cursor = self.remove(arena, id);
                arena.remove(id);
            } else {
                arena.get_mut(id).expect("expire: timeout id not in arena").remaining_rounds -= 1;
                cursor = arena.get(id).expect("expire: timeout id not in arena").next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeout::{Task, TimeoutHandle, TimeoutShared};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct NoopEngine;
    impl EngineHandle for NoopEngine {
        fn submit_cancellation(&self, _shared: Arc<crate::timeout::TimeoutShared>) {}
        fn new_timeout(self: Arc<Self>, _task: Box<dyn Task>, _delay_ns: i64) -> TimeoutHandle {
            unimplemented!("not exercised by these unit tests")
        }
    }

    fn engine() -> Arc<dyn EngineHandle> {
        Arc::new(NoopEngine)
    }

    fn push(arena: &mut Arena<ArenaEntry>, deadline_ns: i64, remaining_rounds: u64) -> TimeoutId {
        let shared = TimeoutShared::new(Box::new(|_: &TimeoutHandle| true), deadline_ns);
        arena.insert(ArenaEntry {
            shared,
            remaining_rounds,
            bucket: None,
            prev: None,
            next: None,
        })
    }

    #[test]
    fn append_and_expire_fires_in_fifo_order() {
        let mut arena: Arena<ArenaEntry> = Arena::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut make = |n: i64| {
            let order = Arc::clone(&order);
            let shared = TimeoutShared::new(
                Box::new(move |_: &TimeoutHandle| {
                    order.lock().unwrap().push(n);
                    true
                }),
                n,
            );
            arena.insert(ArenaEntry {
                shared,
                remaining_rounds: 0,
                bucket: None,
                prev: None,
                next: None,
            })
        };

        let a = make(1);
        let b = make(2);
        let c = make(3);

        let mut bucket = Bucket::new();
        bucket.append(&mut arena, a, 0);
        bucket.append(&mut arena, b, 0);
        bucket.append(&mut arena, c, 0);

        bucket.expire(&mut arena, 3, &engine());
        assert!(bucket.is_empty());
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn decrements_remaining_rounds_instead_of_firing() {
        let mut arena: Arena<ArenaEntry> = Arena::new();
        let id = push(&mut arena, 10, 2);
        let mut bucket = Bucket::new();
        bucket.append(&mut arena, id, 0);

        bucket.expire(&mut arena, 0, &engine());
        assert!(!bucket.is_empty());
        assert_eq!(arena.get(id).unwrap().remaining_rounds, 1);

        bucket.expire(&mut arena, 0, &engine());
        assert_eq!(arena.get(id).unwrap().remaining_rounds, 0);
        assert!(!bucket.is_empty());
    }

    #[test]
    fn cancelled_entry_is_dropped_without_firing() {
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        let mut arena: Arena<ArenaEntry> = Arena::new();
        let shared = TimeoutShared::new(
            Box::new(|_: &TimeoutHandle| {
                FIRED.fetch_add(1, Ordering::SeqCst);
                true
            }),
            0,
        );
        assert!(shared.cancel());
        let id = arena.insert(ArenaEntry {
            shared,
            remaining_rounds: 0,
            bucket: None,
            prev: None,
            next: None,
        });
        let mut bucket = Bucket::new();
        bucket.append(&mut arena, id, 0);

        bucket.expire(&mut arena, 0, &engine());
        assert!(bucket.is_empty());
        assert_eq!(FIRED.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn remove_mid_list_preserves_neighbors() {
        let mut arena: Arena<ArenaEntry> = Arena::new();
        let a = push(&mut arena, 0, 5);
        let b = push(&mut arena, 0, 5);
        let c = push(&mut arena, 0, 5);
        let mut bucket = Bucket::new();
        bucket.append(&mut arena, a, 0);
        bucket.append(&mut arena, b, 0);
        bucket.append(&mut arena, c, 0);

        let next = bucket.remove(&mut arena, b);
        assert_eq!(next, Some(c));
        assert_eq!(arena.get(a).unwrap().next, Some(c));
        assert_eq!(arena.get(c).unwrap().prev, Some(a));
        assert!(arena.get(b).unwrap().bucket.is_none());
    }

    #[test]
    fn remove_head_and_tail_empties_bucket() {
        let mut arena: Arena<ArenaEntry> = Arena::new();
        let a = push(&mut arena, 0, 5);
        let mut bucket = Bucket::new();
        bucket.append(&mut arena, a, 0);
        bucket.remove(&mut arena, a);
        assert!(bucket.is_empty());
    }
}
