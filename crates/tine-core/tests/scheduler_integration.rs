//! End-to-end scheduler tests: recursive fork/call/join workloads across
//! worker counts and both pool variants, failure surfacing, and the
//! conservation counters.

use std::sync::atomic::{AtomicU64, Ordering};
use tine_core::{BusyPool, LazyPool, Scope, TaskError, TaskResult};

fn fib(s: &Scope<'_>, n: u64) -> TaskResult<u64> {
    if n < 2 {
        return Ok(n);
    }
    let a = s.fork(move |s| fib(s, n - 1))?;
    let b = s.call(move |s| fib(s, n - 2))?;
    s.join()?;
    Ok(a.take().expect("joined") + b)
}

fn fib_seq(n: u64) -> u64 {
    if n < 2 {
        n
    } else {
        fib_seq(n - 1) + fib_seq(n - 2)
    }
}

#[test]
fn test_fib_matches_sequential_oracle() {
    let pool = LazyPool::new(4);
    for n in 0..=15 {
        assert_eq!(pool.sync_wait(move |s| fib(s, n)).unwrap(), fib_seq(n));
    }
}

#[test]
fn test_fib_30_busy_pool_all_worker_counts() {
    for workers in [1, 2, 4, 8] {
        let pool = BusyPool::new(workers);
        assert_eq!(pool.sync_wait(|s| fib(s, 30)).unwrap(), 832_040);
    }
}

#[test]
fn test_fib_30_lazy_pool_all_worker_counts() {
    for workers in [1, 2, 4, 8] {
        let pool = LazyPool::new(workers);
        assert_eq!(pool.sync_wait(|s| fib(s, 30)).unwrap(), 832_040);
    }
}

#[test]
#[cfg_attr(debug_assertions, ignore = "expensive without optimizations")]
fn test_fib_35_both_pools() {
    let lazy = LazyPool::new(8);
    assert_eq!(lazy.sync_wait(|s| fib(s, 35)).unwrap(), 9_227_465);
    let busy = BusyPool::new(8);
    assert_eq!(busy.sync_wait(|s| fib(s, 35)).unwrap(), 9_227_465);
}

#[test]
#[ignore = "expensive; run on demand"]
fn test_fib_40() {
    let pool = LazyPool::new(8);
    assert_eq!(pool.sync_wait(|s| fib(s, 40)).unwrap(), 102_334_155);
}

fn count_leaves<'s>(s: &Scope<'s>, n: u64, hits: &'s AtomicU64) -> TaskResult<()> {
    if n < 2 {
        hits.fetch_add(1, Ordering::Relaxed);
        return Ok(());
    }
    s.fork(move |s| count_leaves(s, n - 1, hits))?;
    s.call(move |s| count_leaves(s, n - 2, hits))?;
    s.join()
}

#[test]
fn test_leaf_count_independent_of_worker_count() {
    // L(n) = L(n-1) + L(n-2), L(0) = L(1) = 1; L(15) = 987.
    for workers in [1, 2, 4, 8] {
        for lazy in [false, true] {
            let hits = AtomicU64::new(0);
            if lazy {
                let pool = LazyPool::new(workers);
                pool.sync_wait(|s| count_leaves(s, 15, &hits)).unwrap();
            } else {
                let pool = BusyPool::new(workers);
                pool.sync_wait(|s| count_leaves(s, 15, &hits)).unwrap();
            }
            assert_eq!(hits.load(Ordering::Relaxed), 987);
        }
    }
}

#[test]
fn test_join_completeness_counters() {
    let pool = LazyPool::new(4);
    pool.sync_wait(|s| fib(s, 20)).unwrap();
    let stats = pool.stats();
    // Every internal node forks exactly once: fib_seq(21) - 1 pushes, all of
    // which must have retired before the root completed.
    assert_eq!(stats.tasks_forked, fib_seq(21) - 1);
    assert_eq!(stats.tasks_forked, stats.tasks_retired);
    assert!(stats.tasks_stolen <= stats.tasks_forked);
    assert_eq!(stats.roots_submitted, 1);
}

#[test]
fn test_root_failure_after_successful_children() {
    let pool = LazyPool::new(2);
    let err = pool
        .sync_wait::<u64, _>(|s| {
            s.fork(|_| Ok(1u64))?;
            s.fork(|_| Ok(2u64))?;
            s.join()?;
            Err(TaskError::failure("root failed"))
        })
        .unwrap_err();
    assert_eq!(err, TaskError::failure("root failed"));
    // The pool accepts further submissions without a restart.
    assert_eq!(pool.sync_wait(|s| fib(s, 10)).unwrap(), 55);
}

#[test]
fn test_single_sibling_failure_surfaces() {
    let pool = LazyPool::new(4);
    let err = pool
        .sync_wait::<u64, _>(|s| {
            s.fork(|_| Ok(10u64))?;
            s.fork::<u64, _>(|_| Err(TaskError::failure("sibling down")))?;
            s.fork(|_| Ok(30u64))?;
            s.join()?;
            Ok(0)
        })
        .unwrap_err();
    assert_eq!(err, TaskError::failure("sibling down"));
}

#[test]
fn test_multiple_sibling_failures_coalesce_to_one() {
    let pool = LazyPool::new(4);
    let err = pool
        .sync_wait::<u64, _>(|s| {
            s.fork::<u64, _>(|_| Err(TaskError::failure("first")))?;
            s.fork::<u64, _>(|_| Err(TaskError::failure("second")))?;
            s.join()?;
            Ok(0)
        })
        .unwrap_err();
    assert!(
        err == TaskError::failure("first") || err == TaskError::failure("second"),
        "unexpected error: {err}"
    );
}

#[test]
fn test_call_failure_returns_to_caller() {
    let pool = LazyPool::new(2);
    let out = pool.sync_wait(|s| {
        let inline: TaskResult<u64> = s.call(|_| Err(TaskError::failure("inline")));
        assert_eq!(inline.unwrap_err(), TaskError::failure("inline"));
        // The caller recovers; nothing propagates to the join path.
        Ok(5u64)
    });
    assert_eq!(out.unwrap(), 5);
}

#[test]
fn test_fork_ignored_discards_values() {
    let pool = LazyPool::new(2);
    let hits = AtomicU64::new(0);
    let hits_ref = &hits;
    pool.sync_wait(|s| {
        for _ in 0..16 {
            s.fork_ignored(move |_| {
                hits_ref.fetch_add(1, Ordering::Relaxed);
                Ok(123u64)
            })?;
        }
        s.join()
    })
    .unwrap();
    assert_eq!(hits.load(Ordering::Relaxed), 16);
}

#[test]
fn test_panicking_body_surfaces_as_error() {
    let pool = LazyPool::new(2);
    let err = pool
        .sync_wait::<(), _>(|_| panic!("body blew up"))
        .unwrap_err();
    assert_eq!(err, TaskError::Panic("body blew up".into()));
}

#[test]
fn test_taking_result_before_join_is_a_misuse_panic() {
    // One worker: the forked child cannot run while its parent still does,
    // so the early take deterministically observes an unretired frame.
    let pool = LazyPool::new(1);
    let err = pool
        .sync_wait::<u64, _>(|s| {
            let pending = s.fork(|_| Ok(1u64))?;
            let _ = pending.take(); // too early, panics
            s.join()?;
            Ok(0)
        })
        .unwrap_err();
    match err {
        TaskError::Panic(msg) => assert!(msg.contains("before join"), "got: {msg}"),
        other => panic!("expected a panic error, got {other}"),
    }
}

#[test]
fn test_forked_bodies_observe_captured_state() {
    let pool = LazyPool::new(4);
    for round in 0..200u64 {
        let payload: [u64; 8] = std::array::from_fn(|i| round * 31 + i as u64);
        let expected: u64 = payload.iter().sum();
        let out = pool
            .sync_wait(move |s| {
                let a = s.fork(move |_| Ok(payload.iter().sum::<u64>()))?;
                s.join()?;
                Ok(a.take().expect("joined"))
            })
            .unwrap();
        assert_eq!(out, expected);
    }
}

#[test]
fn test_fork_join_combinator() {
    let pool = LazyPool::new(4);
    let mut items: Vec<u64> = (0..64).collect();
    let total = pool
        .sync_wait(|s| {
            let (left, right) = items.split_at_mut(32);
            let (a, b) = s.fork_join(
                |_| Ok(left.iter().sum::<u64>()),
                |_| Ok(right.iter().sum::<u64>()),
            )?;
            Ok(a + b)
        })
        .unwrap();
    assert_eq!(total, (0..64).sum::<u64>());
}
