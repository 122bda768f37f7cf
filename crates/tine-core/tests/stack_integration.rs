//! Virtual stack behavior that crosses module or thread boundaries:
//! address-mask recovery from another worker, and overflow surfacing
//! through a running pool.

use tine_core::{
    LazyPool, PoolConfig, Scope, StackHandle, TaskError, TaskResult, VirtualStack,
};

#[test]
fn test_address_to_stack_lookup_across_threads() {
    let stack = VirtualStack::new(4096);
    let ptr = stack.allocate(64).unwrap();
    let addr = ptr.as_ptr() as usize;
    let owner = stack.handle();

    let recovered = std::thread::spawn(move || {
        // Recover the owning stack from the interior pointer alone.
        let handle = unsafe { StackHandle::from_address(addr as *const u8, 4096) };
        assert_eq!(handle, owner);
        handle.record_failure(TaskError::failure("recorded remotely"));
        handle
    })
    .join()
    .expect("lookup thread");

    assert_eq!(recovered, stack.handle());
    assert_eq!(
        stack.take_failure(),
        Some(TaskError::failure("recorded remotely"))
    );
    stack.deallocate(ptr, 64);
    assert!(stack.is_empty());
}

fn deep_forks(s: &Scope<'_>, depth: u32) -> TaskResult<u32> {
    if depth == 0 {
        return Ok(0);
    }
    let child = s.fork(move |s| deep_forks(s, depth - 1))?;
    s.join()?;
    Ok(child.take().expect("joined") + 1)
}

#[test]
fn test_overflow_surfaces_as_task_failure() {
    // A 2 KiB stack cannot hold a thousand nested frames; the allocation
    // failure must come back through sync_wait like any task failure.
    let pool = LazyPool::with_config(PoolConfig {
        workers: 1,
        stack_capacity: 2048,
        ..PoolConfig::default()
    });
    let err = pool.sync_wait(|s| deep_forks(s, 1_000)).unwrap_err();
    assert!(matches!(err, TaskError::StackOverflow { .. }));
    // The pool is still usable with workloads that fit.
    assert_eq!(pool.sync_wait(|s| deep_forks(s, 2)).unwrap(), 2);
}

#[test]
fn test_overflow_scenario_small_stack() {
    let stack = VirtualStack::new(128);
    let ptr = stack.allocate(10).unwrap();
    let err = stack.allocate(128).unwrap_err();
    assert!(matches!(err, TaskError::StackOverflow { requested: 128, .. }));
    stack.deallocate(ptr, 10);
    assert!(stack.is_empty());
}
