//! Parallel in-place mutation over a 10'000-element sequence: every grain
//! shape from the reference scenario, repeated applications included.

use tine_algo::for_each;
use tine_core::{BusyPool, LazyPool};

fn check(values: &[i64], offset: i64) {
    for (i, &value) in values.iter().enumerate() {
        assert_eq!(value, i as i64 + offset, "index {i} after offset {offset}");
    }
}

#[test]
fn test_parallel_increment_all_grains() {
    let pool = LazyPool::new(4);
    let mut values: Vec<i64> = (0..10_000).collect();
    let mut rounds = 0i64;
    check(&values, rounds);

    // grain = 1, grain dividing the length, grain not dividing it, and
    // grain larger than the whole slice.
    for grain in [1usize, 100, 300, 20_000] {
        for _ in 0..10 {
            pool.sync_wait(|s| for_each(s, &mut values, grain, |v| *v += 1))
                .unwrap();
            rounds += 1;
        }
        check(&values, rounds);
    }
}

#[test]
fn test_parallel_increment_busy_pool() {
    let pool = BusyPool::new(4);
    let mut values: Vec<i64> = (0..10_000).collect();
    for round in 1..=10 {
        pool.sync_wait(|s| for_each(s, &mut values, 300, |v| *v += 1))
            .unwrap();
        check(&values, round);
    }
}

#[test]
fn test_result_independent_of_worker_count() {
    for workers in [1, 2, 8] {
        let pool = LazyPool::new(workers);
        let mut values: Vec<i64> = (0..10_000).collect();
        pool.sync_wait(|s| for_each(s, &mut values, 1, |v| *v += 1))
            .unwrap();
        check(&values, 1);
    }
}
