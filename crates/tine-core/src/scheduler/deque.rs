//! Per-worker submission queue.
//!
//! Each worker owns the bottom of a lock-free deque: pushes and pops are
//! private to the owner, thieves take from the top, and root submissions
//! arrive through a shared injector. Spurious `Empty` observations under
//! contention are benign; callers simply rescan.

use crate::frame::FrameHandle;
use crossbeam_deque::{Injector, Steal, Stealer, Worker as CbWorker};
use rand::rngs::SmallRng;
use rand::Rng;
use std::cell::RefCell;
use std::sync::Arc;

/// Where a dequeued frame came from, for the pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkSource {
    /// Popped from the owner's bottom.
    Local,
    /// Stolen from another worker's top.
    Stolen,
    /// Taken from the root-submission injector.
    Injected,
}

/// A worker's view of the scheduling queues: its own deque, stealers for
/// every other worker, and the global injector.
pub(crate) struct WorkerDeque {
    local: CbWorker<FrameHandle>,
    /// Stealers for the other workers only.
    stealers: Vec<Stealer<FrameHandle>>,
    injector: Arc<Injector<FrameHandle>>,
    /// Victim selection state; single-threaded within the owning worker.
    rng: RefCell<SmallRng>,
}

impl WorkerDeque {
    pub(crate) fn new(
        local: CbWorker<FrameHandle>,
        stealers: Vec<Stealer<FrameHandle>>,
        injector: Arc<Injector<FrameHandle>>,
        rng: SmallRng,
    ) -> Self {
        Self {
            local,
            stealers,
            injector,
            rng: RefCell::new(rng),
        }
    }

    /// Push a frame on the owner's bottom (LIFO).
    pub(crate) fn push(&self, handle: FrameHandle) {
        self.local.push(handle);
    }

    /// Try to get work: own bottom first, then steal, then the injector.
    pub(crate) fn find_work(&self) -> Option<(FrameHandle, WorkSource)> {
        if let Some(handle) = self.local.pop() {
            return Some((handle, WorkSource::Local));
        }
        loop {
            if let Some(handle) = self.steal_from_others() {
                return Some((handle, WorkSource::Stolen));
            }
            match self.injector.steal() {
                Steal::Success(handle) => return Some((handle, WorkSource::Injected)),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
        None
    }

    /// Steal from a victim chosen at random, sweeping the rest on failure.
    fn steal_from_others(&self) -> Option<FrameHandle> {
        if self.stealers.is_empty() {
            return None;
        }
        let start = self.rng.borrow_mut().gen_range(0..self.stealers.len());
        for i in 0..self.stealers.len() {
            let stealer = &self.stealers[(start + i) % self.stealers.len()];
            loop {
                match stealer.steal() {
                    Steal::Success(handle) => return Some(handle),
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }
        None
    }
}
