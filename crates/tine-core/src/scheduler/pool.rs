//! Worker pools.
//!
//! A pool owns a fixed set of workers that start immediately and run until
//! shutdown. The two variants share everything but the idle policy:
//! [`BusyPool`] spins, [`LazyPool`] parks. Root work is submitted with
//! [`Pool::sync_wait`], which blocks the calling thread until the
//! computation retires and surfaces its outcome.

use crate::frame::{FrameHandle, RootFrame};
use crate::scheduler::idle::{Busy, IdlePolicy, Lazy};
use crate::scheduler::worker::Worker;
use crate::scope::Scope;
use crate::TaskResult;
use crossbeam_deque::{Injector, Stealer, Worker as CbWorker};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

/// Default per-worker virtual stack capacity: 1 MiB.
const DEFAULT_STACK_CAPACITY: usize = 1 << 20;

/// Construction-time pool knobs.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Worker thread count; `0` means one per available CPU.
    pub workers: usize,
    /// Per-worker virtual stack capacity in bytes (power of two).
    pub stack_capacity: usize,
    /// Fruitless steal scans a lazy worker tolerates before parking.
    /// Ignored by busy pools.
    pub steal_budget: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            stack_capacity: DEFAULT_STACK_CAPACITY,
            steal_budget: 64,
        }
    }
}

/// Monotonic pool counters.
#[derive(Default)]
pub(crate) struct Counters {
    forked: AtomicU64,
    retired: AtomicU64,
    stolen: AtomicU64,
    roots: AtomicU64,
}

impl Counters {
    pub(crate) fn note_fork(&self) {
        self.forked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_retire(&self) {
        self.retired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_steal(&self) {
        self.stolen.fetch_add(1, Ordering::Relaxed);
    }

    fn note_root(&self) {
        self.roots.fetch_add(1, Ordering::Relaxed);
    }
}

/// A point-in-time snapshot of the pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Children pushed onto worker deques.
    pub tasks_forked: u64,
    /// Forked children that have retired.
    pub tasks_retired: u64,
    /// Forked children that were stolen rather than owner-popped.
    pub tasks_stolen: u64,
    /// Root submissions accepted.
    pub roots_submitted: u64,
}

/// State shared by every worker of one pool.
pub(crate) struct Shared {
    pub(crate) injector: Arc<Injector<FrameHandle>>,
    pub(crate) stealers: Vec<Stealer<FrameHandle>>,
    pub(crate) idle: Box<dyn IdlePolicy>,
    pub(crate) shutdown: AtomicBool,
    pub(crate) counters: Counters,
    pub(crate) stack_capacity: usize,
}

impl Shared {
    /// Whether any queue observably holds work. Used as the park probe; a
    /// racing push re-checks this under the sleeper protocol.
    pub(crate) fn has_work(&self) -> bool {
        !self.injector.is_empty() || self.stealers.iter().any(|s| !s.is_empty())
    }
}

/// A fork-join worker pool, generic over its idle policy.
pub struct Pool<P: IdlePolicy> {
    shared: Arc<Shared>,
    workers: Vec<thread::JoinHandle<()>>,
    _policy: PhantomData<P>,
}

/// Pool whose idle workers spin on the steal loop.
pub type BusyPool = Pool<Busy>;

/// Pool whose idle workers park after a bounded number of failed steals.
pub type LazyPool = Pool<Lazy>;

impl<P: IdlePolicy> Pool<P> {
    /// Start a pool with `workers` threads (`0` = one per CPU).
    pub fn new(workers: usize) -> Self {
        Self::with_config(PoolConfig {
            workers,
            ..PoolConfig::default()
        })
    }

    /// Start a pool from an explicit configuration.
    pub fn with_config(config: PoolConfig) -> Self {
        let worker_count = if config.workers == 0 {
            num_cpus::get()
        } else {
            config.workers
        };
        let locals: Vec<CbWorker<FrameHandle>> =
            (0..worker_count).map(|_| CbWorker::new_lifo()).collect();
        let stealers: Vec<Stealer<FrameHandle>> = locals.iter().map(|w| w.stealer()).collect();
        let injector = Arc::new(Injector::new());
        let shared = Arc::new(Shared {
            injector: injector.clone(),
            stealers: stealers.clone(),
            idle: Box::new(P::from_config(&config)),
            shutdown: AtomicBool::new(false),
            counters: Counters::default(),
            stack_capacity: config.stack_capacity,
        });
        tracing::debug!(workers = worker_count, "starting pool");
        let workers = locals
            .into_iter()
            .enumerate()
            .map(|(index, local)| {
                let shared = shared.clone();
                let injector = injector.clone();
                let others: Vec<Stealer<FrameHandle>> = stealers
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != index)
                    .map(|(_, s)| s.clone())
                    .collect();
                thread::Builder::new()
                    .name(format!("tine-worker-{index}"))
                    .spawn(move || Worker::new(index, local, others, injector, shared).run())
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Self {
            shared,
            workers,
            _policy: PhantomData,
        }
    }

    /// Submit a root task and block the calling thread until it completes,
    /// surfacing the first failure observed on the join path.
    ///
    /// The body runs on a pool worker; the outcome slot lives in the
    /// submitter's storage. The pool stays usable after a failed
    /// submission. Calling this from inside a task body deadlocks the
    /// worker; submit roots only from outside the pool.
    pub fn sync_wait<'env, T, F>(&self, body: F) -> TaskResult<T>
    where
        F: FnOnce(&Scope<'env>) -> TaskResult<T> + Send + 'env,
        T: Send + 'env,
    {
        self.shared.counters.note_root();
        let frame = RootFrame::new(body);
        self.shared.injector.push(frame.handle());
        self.shared.idle.notify_one();
        frame.wait()
    }

    /// Number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.shared.stealers.len()
    }

    /// Snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        let c = &self.shared.counters;
        PoolStats {
            tasks_forked: c.forked.load(Ordering::Relaxed),
            tasks_retired: c.retired.load(Ordering::Relaxed),
            tasks_stolen: c.stolen.load(Ordering::Relaxed),
            roots_submitted: c.roots.load(Ordering::Relaxed),
        }
    }

    /// Stop and join every worker. Submitting work that is still pending at
    /// teardown is a programming error (debug-asserted). Idempotent; `Drop`
    /// delegates here.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        debug_assert!(
            self.shared.injector.is_empty(),
            "root submissions still pending at pool teardown"
        );
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.idle.notify_all();
        for handle in self.workers.drain(..) {
            handle.join().expect("failed to join worker thread");
        }
        debug_assert!(
            self.shared.stealers.iter().all(|s| s.is_empty()),
            "forked tasks still pending at pool teardown"
        );
        tracing::debug!("pool stopped");
    }
}

impl<P: IdlePolicy> Drop for Pool<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
