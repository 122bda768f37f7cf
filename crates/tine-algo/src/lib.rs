//! Divide-and-conquer slice algorithms built on the tine task API.
//!
//! These helpers only use the public [`Scope`] surface; they are the
//! "caller" side of the runtime, not part of it.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

use tine_core::{Scope, TaskResult};

/// Apply `f` to every element of `items` in parallel.
///
/// The slice is split in halves until chunks are at most `grain` elements
/// long; each chunk is then processed sequentially on whichever worker picks
/// it up. A `grain` of zero is treated as one, and a grain no smaller than
/// the slice degrades to a single sequential chunk.
///
/// ```
/// use tine_algo::for_each;
/// use tine_core::LazyPool;
///
/// let pool = LazyPool::new(2);
/// let mut values: Vec<i64> = (0..1000).collect();
/// pool.sync_wait(|s| for_each(s, &mut values, 100, |v| *v += 1)).unwrap();
/// assert_eq!(values[10], 11);
/// ```
pub fn for_each<T, F>(scope: &Scope<'_>, items: &mut [T], grain: usize, f: F) -> TaskResult<()>
where
    T: Send,
    F: Fn(&mut T) + Send + Sync,
{
    split(scope, items, grain.max(1), &f)
}

fn split<T, F>(scope: &Scope<'_>, items: &mut [T], grain: usize, f: &F) -> TaskResult<()>
where
    T: Send,
    F: Fn(&mut T) + Send + Sync,
{
    if items.len() <= grain {
        for item in items.iter_mut() {
            f(item);
        }
        return Ok(());
    }
    let mid = items.len() / 2;
    let (left, right) = items.split_at_mut(mid);
    scope.fork_join(
        move |s| split(s, left, grain, f),
        move |s| split(s, right, grain, f),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tine_core::LazyPool;

    #[test]
    fn test_empty_slice_is_a_no_op() {
        let pool = LazyPool::new(1);
        let mut values: [i32; 0] = [];
        pool.sync_wait(|s| for_each(s, &mut values, 1, |_| unreachable!()))
            .unwrap();
    }

    #[test]
    fn test_grain_larger_than_slice_is_one_chunk() {
        let pool = LazyPool::new(1);
        let mut values = [1i32, 2, 3];
        pool.sync_wait(|s| for_each(s, &mut values, 10, |v| *v *= 2))
            .unwrap();
        assert_eq!(values, [2, 4, 6]);
    }

    #[test]
    fn test_zero_grain_is_treated_as_one() {
        let pool = LazyPool::new(2);
        let mut values = [5i32; 8];
        pool.sync_wait(|s| for_each(s, &mut values, 0, |v| *v += 1))
            .unwrap();
        assert_eq!(values, [6i32; 8]);
    }
}
