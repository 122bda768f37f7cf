//! The fork/call/join control handle.
//!
//! Every task body receives a [`Scope`] as its first argument. Through it
//! the body forks children onto the pool, descends into children inline,
//! and joins everything it forked. Forked results come back through
//! [`Forked`] handles, the caller-side view of the child's return slot.
//!
//! The lifetime parameter `'scope` is the region the surrounding
//! submission's data lives for: a forked body and anything it captures must
//! outlive it. Borrow checking is what enforces the rule that a forked task
//! can never reference a temporary that dies before the join.

use crate::frame::{
    collect_child_failure, exec_inline_only, reclaim_inline_only, run_body,
    take_error_inline_only, ForkFrame, FrameHandle, FrameHead, FrameKind, FrameStatus,
};
use crate::scheduler::worker::Worker;
use crate::stack::MAX_ALIGN;
use crate::TaskResult;
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;

/// Control handle carrying a task's frame context.
///
/// `Scope` is deliberately neither `Send` nor `Sync`: it belongs to the body
/// it was handed to, and a forked child always receives its own.
pub struct Scope<'scope> {
    frame: NonNull<FrameHead>,
    worker: NonNull<Worker>,
    _marker: PhantomData<*mut &'scope ()>,
}

impl<'scope> Scope<'scope> {
    /// # Safety
    ///
    /// `frame` and `worker` must stay valid for as long as the scope is
    /// used; the caller picks `'scope` and vouches that every value a body
    /// forks under it outlives the frame's last join.
    pub(crate) unsafe fn new(frame: NonNull<FrameHead>, worker: NonNull<Worker>) -> Self {
        Self {
            frame,
            worker,
            _marker: PhantomData,
        }
    }

    fn worker(&self) -> &Worker {
        // Valid for the whole body execution; the scope cannot escape it.
        unsafe { self.worker.as_ref() }
    }

    fn head(&self) -> &FrameHead {
        unsafe { self.frame.as_ref() }
    }

    /// Fork a child task: allocate its frame on the current worker's virtual
    /// stack, enqueue it, and keep running. The child's result is available
    /// from the returned handle after the next [`join`](Scope::join).
    ///
    /// Fails with [`TaskError::StackOverflow`](crate::TaskError) when the
    /// virtual stack cannot hold the frame.
    pub fn fork<T, F>(&self, body: F) -> TaskResult<Forked<'scope, T>>
    where
        F: FnOnce(&Scope<'scope>) -> TaskResult<T> + Send + 'scope,
        T: Send + 'scope,
    {
        // The 'scope bounds above are what make the raw fork safe here.
        unsafe { self.fork_raw(body) }
    }

    /// Fork a child whose produced value is discarded (the ignore return
    /// slot). The child is still joined like any other fork; only its value
    /// goes unobserved, so `T` needs no `Send` bound.
    pub fn fork_ignored<T, F>(&self, body: F) -> TaskResult<()>
    where
        F: FnOnce(&Scope<'scope>) -> TaskResult<T> + Send + 'scope,
        T: 'scope,
    {
        let _ = unsafe { self.fork_raw(move |s: &Scope<'scope>| body(s).map(|_| ())) }?;
        Ok(())
    }

    /// Descend into a child inline: the caller is suspended until the child
    /// completes, and the child's result (or failure) is returned directly.
    ///
    /// Because the child finishes before `call` returns, its body may borrow
    /// the caller's locals.
    pub fn call<T, F>(&self, body: F) -> TaskResult<T>
    where
        F: FnOnce(&Scope<'scope>) -> TaskResult<T>,
    {
        unsafe { self.call_raw(body) }
    }

    /// Wait until every child forked by this frame has retired, helping with
    /// pool work instead of idling. Surfaces the first child failure;
    /// sibling failures are coalesced.
    pub fn join(&self) -> TaskResult<()> {
        let head = self.head();
        if head.pending_children() != 0 {
            head.set_status(FrameStatus::AwaitingJoin);
            self.worker().help_until(&|| head.pending_children() == 0);
            head.set_status(FrameStatus::Running);
        }
        match unsafe { collect_child_failure(self.frame) } {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Fork `left`, run `right` inline, and join before returning.
    ///
    /// Unlike [`fork`](Scope::fork), the two bodies may borrow the caller's
    /// locals: neither can still be running when `fork_join` returns. This
    /// is the building block the slice algorithms use to thread borrowed
    /// data down a divide-and-conquer tree.
    ///
    /// Note that the internal join drains *all* outstanding children of the
    /// current frame, including earlier plain forks.
    pub fn fork_join<RA, RB, A, B>(&self, left: A, right: B) -> TaskResult<(RA, RB)>
    where
        A: FnOnce(&Scope<'scope>) -> TaskResult<RA> + Send,
        RA: Send,
        B: FnOnce(&Scope<'scope>) -> TaskResult<RB>,
    {
        // Safe because the join below cannot be skipped: `left` has finished
        // before any borrow it captured can die.
        let forked = unsafe { self.fork_raw(left) }?;
        let right_out = unsafe { self.call_raw(right) };
        let joined = self.join();
        match (right_out, joined) {
            (Ok(right_value), Ok(())) => {
                let left_value = forked
                    .take()
                    .expect("forked branch joined without a result");
                Ok((left_value, right_value))
            }
            (Err(error), joined) => {
                if let Err(dropped) = joined {
                    tracing::debug!(%dropped, "sibling failure coalesced at fork_join");
                }
                Err(error)
            }
            (Ok(_), Err(error)) => Err(error),
        }
    }

    /// Fork without lifetime bounds. Callers must guarantee that the child
    /// retires before any borrow captured by `body` (or the returned
    /// handle's slot) becomes invalid, either via the `'scope` bounds of
    /// [`fork`](Scope::fork) or by joining before returning, as
    /// [`fork_join`](Scope::fork_join) does.
    unsafe fn fork_raw<T, F>(&self, body: F) -> TaskResult<Forked<'scope, T>>
    where
        F: FnOnce(&Scope<'scope>) -> TaskResult<T> + Send,
    {
        assert!(
            mem::align_of::<ForkFrame<'scope, F, T>>() <= MAX_ALIGN,
            "task frame alignment exceeds the virtual stack guarantee"
        );
        let worker = self.worker();
        let stack = worker.stack_handle();
        let raw = stack.allocate(mem::size_of::<ForkFrame<'scope, F, T>>())?;
        let child = ForkFrame::<'scope, F, T>::initialize(raw, body, self.frame, stack);
        let head = ForkFrame::head_ptr(child);
        self.head().add_child(head);
        worker.push(FrameHandle(head));
        Ok(Forked {
            head,
            result: ForkFrame::result_ptr(child),
            _marker: PhantomData,
        })
    }

    /// Call without lifetime bounds; the child completes within this call.
    unsafe fn call_raw<T, F>(&self, body: F) -> TaskResult<T>
    where
        F: FnOnce(&Scope<'scope>) -> TaskResult<T>,
    {
        let worker = self.worker();
        let stack = worker.stack_handle();
        let raw = stack.allocate(mem::size_of::<FrameHead>())?;
        let child = raw.cast::<FrameHead>();
        child.as_ptr().write(FrameHead::new(
            FrameKind::Call,
            Some(self.frame),
            Some(stack),
            exec_inline_only,
            take_error_inline_only,
            reclaim_inline_only,
        ));
        let out = run_body(child, worker, body);
        child.as_ref().set_status(if out.is_err() {
            FrameStatus::Failed
        } else {
            FrameStatus::Completed
        });
        stack.deallocate(raw, mem::size_of::<FrameHead>());
        out
    }
}

/// Caller-side handle to a forked child's return slot.
///
/// The value may be taken only once the child has retired, i.e. after the
/// caller's next [`Scope::join`]; taking it earlier is a contract violation
/// and panics. A handle that is never consumed simply lets the runtime drop
/// the value when the frame is reclaimed.
pub struct Forked<'scope, T> {
    head: NonNull<FrameHead>,
    result: NonNull<UnsafeCell<Option<TaskResult<T>>>>,
    _marker: PhantomData<&'scope ()>,
}

impl<'scope, T> Forked<'scope, T> {
    /// Move the child's value out of the return slot.
    ///
    /// Returns `None` if the child failed (the failure itself surfaces from
    /// the join) or the value was already taken.
    ///
    /// # Panics
    ///
    /// Panics if the child has not retired yet; results must only be read
    /// after the join.
    pub fn take(self) -> Option<T> {
        match unsafe { self.head.as_ref() }.status() {
            FrameStatus::Completed => {
                match unsafe { (*self.result.as_ref().get()).take() } {
                    Some(Ok(value)) => Some(value),
                    _ => None,
                }
            }
            FrameStatus::Failed => None,
            _ => panic!("forked task result taken before join"),
        }
    }
}
