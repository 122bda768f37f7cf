//! Tine fork-join runtime core.
//!
//! This crate provides the runtime for structured divide-and-conquer
//! parallelism:
//! - Per-worker virtual stacks (bump arenas for task frames)
//! - Task frames and the fork/call/join protocol
//! - Work-stealing scheduler with busy and lazy pool variants
//! - Result binding and failure propagation along join edges
//!
//! A computation is submitted with [`Pool::sync_wait`]; the body receives a
//! [`Scope`] through which it forks children onto the pool, descends into
//! them inline, and joins them before returning.
//!
//! ```
//! use tine_core::{LazyPool, Scope, TaskResult};
//!
//! fn fib(s: &Scope<'_>, n: u64) -> TaskResult<u64> {
//!     if n < 2 {
//!         return Ok(n);
//!     }
//!     let a = s.fork(move |s| fib(s, n - 1))?;
//!     let b = s.call(move |s| fib(s, n - 2))?;
//!     s.join()?;
//!     Ok(a.take().expect("joined") + b)
//! }
//!
//! let pool = LazyPool::new(2);
//! assert_eq!(pool.sync_wait(|s| fib(s, 10)).unwrap(), 55);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod frame;
pub mod scheduler;
pub mod scope;
pub mod stack;

pub use scheduler::{Busy, BusyPool, IdlePolicy, Lazy, LazyPool, Pool, PoolConfig, PoolStats};
pub use scope::{Forked, Scope};
pub use stack::{StackHandle, VirtualStack, MAX_ALIGN};

/// Runtime errors surfaced by task bodies and the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// A virtual stack could not satisfy a frame allocation.
    #[error("virtual stack overflow: {requested} bytes requested, {available} available")]
    StackOverflow {
        /// Bytes the allocation asked for (before alignment rounding).
        requested: usize,
        /// Bytes left on the stack at the time of the request.
        available: usize,
    },

    /// A task body reported an in-band failure.
    #[error("task failed: {0}")]
    Failure(String),

    /// A task body panicked; the payload is captured as a message.
    #[error("task panicked: {0}")]
    Panic(String),
}

impl TaskError {
    /// Shorthand for an in-band task failure.
    pub fn failure(message: impl Into<String>) -> Self {
        TaskError::Failure(message.into())
    }
}

/// Result type used by task bodies and the runtime.
pub type TaskResult<T> = Result<T, TaskError>;
