//! Idle policies: what a worker does when a full scan finds no work.
//!
//! The two pool variants share every other part of the scheduler and differ
//! only here. Busy workers spin; lazy workers spin for a bounded steal
//! budget and then park on a condition variable under a protocol that rules
//! out lost wakeups.

use crate::scheduler::pool::PoolConfig;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Park/wake capability of a pool variant.
///
/// `probe` re-checks for runnable work (or shutdown) and must be consulted
/// before a worker is allowed to sleep.
pub trait IdlePolicy: Send + Sync + 'static {
    /// Build the policy from the pool configuration.
    fn from_config(config: &PoolConfig) -> Self
    where
        Self: Sized;

    /// Called after the `attempt`-th consecutive fruitless scan. May spin,
    /// yield, or block until woken; must not sleep while `probe` is true.
    fn idle(&self, attempt: usize, probe: &dyn Fn() -> bool);

    /// Wake one parked worker, if any. Called on every push and on the last
    /// retirement of a join.
    fn notify_one(&self);

    /// Wake every parked worker; used at shutdown and when global idleness
    /// is suspected.
    fn notify_all(&self);
}

/// Spin forever: lowest latency, highest CPU. Intended for
/// microbenchmark-scale workloads.
pub struct Busy;

impl IdlePolicy for Busy {
    fn from_config(_: &PoolConfig) -> Self {
        Busy
    }

    fn idle(&self, attempt: usize, _probe: &dyn Fn() -> bool) {
        if attempt % 64 == 0 {
            std::thread::yield_now();
        } else {
            std::hint::spin_loop();
        }
    }

    fn notify_one(&self) {}

    fn notify_all(&self) {}
}

/// Park after a bounded number of failed steal rounds.
pub struct Lazy {
    /// Fruitless scans tolerated before parking.
    budget: usize,
    /// Number of workers inside the parking protocol. SeqCst pairs with the
    /// SeqCst load in `notify_one`: either the pusher sees the sleeper, or
    /// the sleeper's probe sees the pushed work.
    sleeping: AtomicUsize,
    lock: Mutex<()>,
    wakeup: Condvar,
}

impl IdlePolicy for Lazy {
    fn from_config(config: &PoolConfig) -> Self {
        Self {
            budget: config.steal_budget.max(1),
            sleeping: AtomicUsize::new(0),
            lock: Mutex::new(()),
            wakeup: Condvar::new(),
        }
    }

    fn idle(&self, attempt: usize, probe: &dyn Fn() -> bool) {
        if attempt < self.budget {
            if attempt % 16 == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
            return;
        }
        let mut guard = self.lock.lock();
        self.sleeping.fetch_add(1, Ordering::SeqCst);
        // Re-check under the sleeper count: a push that raced us will either
        // show up here or observe the count and take the lock to wake us.
        if probe() {
            self.sleeping.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        self.wakeup.wait(&mut guard);
        self.sleeping.fetch_sub(1, Ordering::SeqCst);
    }

    fn notify_one(&self) {
        if self.sleeping.load(Ordering::SeqCst) == 0 {
            return;
        }
        let _guard = self.lock.lock();
        self.wakeup.notify_one();
    }

    fn notify_all(&self) {
        let _guard = self.lock.lock();
        self.wakeup.notify_all();
    }
}
