//! Work-stealing scheduler: submission queues, idle policies, workers, and
//! the two pool variants.

pub(crate) mod deque;
pub mod idle;
pub mod pool;
pub(crate) mod worker;

pub use idle::{Busy, IdlePolicy, Lazy};
pub use pool::{BusyPool, LazyPool, Pool, PoolConfig, PoolStats};
