//! Lock-free epoch-based safe reclamation.
//!
//! Generalizes the role the teacher's `scheduler_epoch`/`runqueue_epoch` crates
//! play for task scheduling into a reusable primitive: many threads
//! `enter()`/`exit()` a shared epoch while reading or mutating memory, and
//! deferred actions (releasing a page back to an allocator, shifting a
//! boundary address) only run once every thread that was protecting the
//! epoch at the time the action was queued has left it.
//!
//! This is deliberately simpler than a full hazard-pointer scheme: the only
//! things ever reclaimed by callers of this crate are fixed-size ring slots,
//! not arbitrary heap objects, so a single monotonic epoch counter plus a
//! per-thread "currently protecting" slot is enough.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::trace;
use parking_lot::Mutex;

const UNPROTECTED: u64 = u64::MAX;

struct Slot {
    /// The epoch this thread is currently protecting, or `UNPROTECTED`.
    protected_epoch: AtomicU64,
}

thread_local! {
    static LOCAL: Arc<Slot> = Arc::new(Slot { protected_epoch: AtomicU64::new(UNPROTECTED) });
    static NEST_COUNT: Cell<u32> = const { Cell::new(0) };
}

struct DeferredAction {
    epoch: u64,
    action: Box<dyn FnOnce() + Send>,
}

/// Shared epoch state: a global counter, a registry of every thread that has
/// ever called [`enter`](EpochProtector::enter), and a queue of actions
/// waiting for their epoch to drain.
pub struct EpochProtector {
    global_epoch: AtomicU64,
    registry: Mutex<Vec<Weak<Slot>>>,
    deferred: Mutex<Vec<DeferredAction>>,
}

impl Default for EpochProtector {
    fn default() -> Self {
        Self::new()
    }
}

impl EpochProtector {
    pub fn new() -> Self {
        EpochProtector {
            global_epoch: AtomicU64::new(1),
            registry: Mutex::new(Vec::new()),
            deferred: Mutex::new(Vec::new()),
        }
    }

    /// Marks the calling thread as protecting the current global epoch and
    /// returns a guard that unmarks it on drop. Nests per thread: only the
    /// outermost `enter()` call actually registers the thread.
    pub fn enter(&self) -> EpochGuard<'_> {
        let already_nested = NEST_COUNT.with(|c| {
            let n = c.get();
            c.set(n + 1);
            n > 0
        });
        if !already_nested {
            LOCAL.with(|slot| {
                slot.protected_epoch
                    .store(self.global_epoch.load(Ordering::SeqCst), Ordering::SeqCst);
                self.register(slot);
            });
        }
        EpochGuard { protector: self }
    }

    fn register(&self, slot: &Arc<Slot>) {
        let mut registry = self.registry.lock();
        if !registry.iter().any(|w| w.as_ptr() == Arc::as_ptr(slot)) {
            registry.push(Arc::downgrade(slot));
        }
    }

    fn exit(&self) {
        let now_unprotected = NEST_COUNT.with(|c| {
            let n = c.get();
            debug_assert!(n > 0, "epoch_guard: exit() without a matching enter()");
            let n = n.saturating_sub(1);
            c.set(n);
            n == 0
        });
        if now_unprotected {
            LOCAL.with(|slot| slot.protected_epoch.store(UNPROTECTED, Ordering::SeqCst));
        }
    }

    /// Advances the global epoch, returning the epoch that was current just
    /// before the bump (the one any actions deferred up to this point must
    /// wait to drain).
    pub fn bump(&self) -> u64 {
        self.global_epoch.fetch_add(1, Ordering::SeqCst)
    }

    /// Queues `action` to run once every thread that was protecting the
    /// epoch current at the time of this call has exited it. Implicitly
    /// bumps the global epoch so that newly-entering threads don't block
    /// this action indefinitely.
    pub fn defer(&self, action: impl FnOnce() + Send + 'static) {
        let epoch = self.bump();
        self.deferred.lock().push(DeferredAction {
            epoch,
            action: Box::new(action),
        });
        trace!("deferred an action until epoch {epoch} drains");
    }

    /// The oldest epoch any live thread is still protecting, or `u64::MAX`
    /// if nobody is currently inside a protected region.
    fn min_protected_epoch(&self) -> u64 {
        let mut registry = self.registry.lock();
        registry.retain(|w| w.strong_count() > 0);
        registry
            .iter()
            .filter_map(|w| w.upgrade())
            .map(|s| s.protected_epoch.load(Ordering::SeqCst))
            .filter(|&e| e != UNPROTECTED)
            .min()
            .unwrap_or(u64::MAX)
    }

    /// Polls for and executes every deferred action whose epoch has fully
    /// drained (no thread is still protecting it or an older epoch).
    /// Returns the number of actions run.
    pub fn drain(&self) -> usize {
        let min_protected = self.min_protected_epoch();
        let mut ready = Vec::new();
        {
            let mut pending = self.deferred.lock();
            let mut i = 0;
            while i < pending.len() {
                if pending[i].epoch < min_protected {
                    ready.push(pending.remove(i));
                } else {
                    i += 1;
                }
            }
        }
        let count = ready.len();
        if count > 0 {
            trace!("draining {count} action(s), min protected epoch {min_protected}");
        }
        for deferred in ready {
            (deferred.action)();
        }
        count
    }

    /// Spins, yielding the thread and draining, until every action deferred
    /// up to the point this is called has run.
    pub fn drain_blocking(&self) {
        // Snapshot the current epoch: anything deferred at or before this
        // point has an epoch strictly less than `target`.
        let target = self.bump();
        loop {
            self.drain();
            if self.deferred.lock().iter().all(|d| d.epoch >= target) {
                break;
            }
            std::thread::yield_now();
        }
    }
}

/// RAII guard returned by [`EpochProtector::enter`]. Drop to exit the epoch.
pub struct EpochGuard<'a> {
    protector: &'a EpochProtector,
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        self.protector.exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn deferred_action_waits_for_protecting_thread() {
        let protector = Arc::new(EpochProtector::new());
        let ran = Arc::new(AtomicBool::new(false));

        let guard = protector.enter();

        let ran_clone = ran.clone();
        protector.defer(move || ran_clone.store(true, Ordering::SeqCst));

        // The deferring thread is still protecting the old epoch, so the
        // action must not have run yet.
        protector.drain();
        assert!(!ran.load(Ordering::SeqCst));

        drop(guard);
        protector.drain();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn nested_enter_only_registers_once() {
        let protector = EpochProtector::new();
        let outer = protector.enter();
        let inner = protector.enter();
        assert_eq!(protector.min_protected_epoch(), 1);
        drop(inner);
        // Still protecting: the outer guard hasn't been dropped.
        assert_eq!(protector.min_protected_epoch(), 1);
        drop(outer);
        assert_eq!(protector.min_protected_epoch(), u64::MAX);
    }

    #[test]
    fn drain_blocking_runs_everything_deferred_so_far() {
        let protector = EpochProtector::new();
        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));
        for _ in 0..5 {
            let counter = counter.clone();
            protector.defer(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        protector.drain_blocking();
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn independent_threads_each_get_their_own_slot() {
        let protector = Arc::new(EpochProtector::new());
        let p2 = protector.clone();
        let handle = std::thread::spawn(move || {
            let _g = p2.enter();
            std::thread::sleep(std::time::Duration::from_millis(20));
        });
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(protector.min_protected_epoch(), 1);
        handle.join().unwrap();
        protector.drain(); // prune dead weak refs
        assert_eq!(protector.min_protected_epoch(), u64::MAX);
    }
}
