//! Worker threads.
//!
//! Each worker owns a virtual stack and the bottom of its submission deque,
//! and runs the scheduling loop: execute local work, steal otherwise, defer
//! to the pool's idle policy when a full scan comes up empty. A worker that
//! is waiting on a join does not idle: it keeps running pool work through
//! [`Worker::help_until`].

use crate::frame::FrameHandle;
use crate::scheduler::deque::{WorkSource, WorkerDeque};
use crate::scheduler::pool::Shared;
use crate::stack::{StackHandle, VirtualStack};
use crossbeam_deque::{Injector, Stealer, Worker as CbWorker};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub(crate) struct Worker {
    index: usize,
    stack: VirtualStack,
    deque: WorkerDeque,
    shared: Arc<Shared>,
}

impl Worker {
    pub(crate) fn new(
        index: usize,
        local: CbWorker<FrameHandle>,
        stealers: Vec<Stealer<FrameHandle>>,
        injector: Arc<Injector<FrameHandle>>,
        shared: Arc<Shared>,
    ) -> Self {
        let stack = VirtualStack::new(shared.stack_capacity);
        let deque = WorkerDeque::new(local, stealers, injector, SmallRng::from_entropy());
        Self {
            index,
            stack,
            deque,
            shared,
        }
    }

    /// The scheduling loop, run until pool shutdown.
    pub(crate) fn run(self) {
        tracing::trace!(worker = self.index, "worker started");
        let mut attempts = 0usize;
        loop {
            if self.shared.shutdown.load(Ordering::Acquire) {
                break;
            }
            match self.deque.find_work() {
                Some((handle, source)) => {
                    attempts = 0;
                    self.note_source(source);
                    unsafe { handle.run(&self) };
                }
                None => {
                    attempts += 1;
                    self.shared.idle.idle(attempts, &|| {
                        self.shared.has_work() || self.shared.shutdown.load(Ordering::Acquire)
                    });
                }
            }
        }
        debug_assert!(
            self.stack.is_empty(),
            "worker stack still holds frames at shutdown"
        );
        tracing::trace!(worker = self.index, "worker stopped");
    }

    /// Schedule a freshly forked child and wake a parked worker for it.
    pub(crate) fn push(&self, handle: FrameHandle) {
        self.shared.counters.note_fork();
        self.deque.push(handle);
        self.shared.idle.notify_one();
    }

    /// The virtual stack frames forked by bodies on this worker land on.
    pub(crate) fn stack_handle(&self) -> StackHandle {
        self.stack.handle()
    }

    /// Work the pool until `done` holds; used while a frame awaits its join.
    pub(crate) fn help_until(&self, done: &dyn Fn() -> bool) {
        let mut spins = 0u32;
        while !done() {
            if let Some((handle, source)) = self.deque.find_work() {
                spins = 0;
                self.note_source(source);
                unsafe { handle.run(self) };
            } else {
                spins = spins.wrapping_add(1);
                if spins % 64 == 0 {
                    std::thread::yield_now();
                } else {
                    std::hint::spin_loop();
                }
            }
        }
    }

    /// Bookkeeping after a forked child retired on this worker. The last
    /// retirement of a join performs a wake-one, like any other completion.
    pub(crate) fn on_retire(&self, was_last: bool) {
        self.shared.counters.note_retire();
        if was_last {
            self.shared.idle.notify_one();
        }
    }

    fn note_source(&self, source: WorkSource) {
        if source == WorkSource::Stolen {
            self.shared.counters.note_steal();
        }
    }
}
