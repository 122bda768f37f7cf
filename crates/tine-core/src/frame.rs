//! Task frames.
//!
//! A frame is the reified state of one in-flight task: parent link, join
//! counter, return slot, owning stack, and the erased hooks the scheduler
//! drives it through. Frames are laid out header-first (`repr(C)`) so a
//! `FrameHead` pointer can be cast back to the concrete frame type inside
//! the monomorphized hooks.
//!
//! Forked and call frames live on a worker's virtual stack; root frames are
//! heap allocated and carry the submitter-owned outcome slot.

use crate::scheduler::worker::Worker;
use crate::scope::Scope;
use crate::stack::StackHandle;
use crate::{TaskError, TaskResult};
use parking_lot::{Condvar, Mutex};
use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::mem::{self, ManuallyDrop};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// How a frame was created, which drives its return binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum FrameKind {
    /// Submitted from outside the pool; heap allocated, outcome in
    /// submitter storage.
    Root,
    /// Descended into inline; result returned directly to the caller.
    Call,
    /// Scheduled onto the owner's deque; result bound through the frame's
    /// slot at the caller's next join.
    Fork,
}

/// Lifecycle of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum FrameStatus {
    Ready = 0,
    Running = 1,
    AwaitingJoin = 2,
    Completed = 3,
    Failed = 4,
}

impl FrameStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => FrameStatus::Ready,
            1 => FrameStatus::Running,
            2 => FrameStatus::AwaitingJoin,
            3 => FrameStatus::Completed,
            4 => FrameStatus::Failed,
            _ => unreachable!("invalid frame status"),
        }
    }
}

/// Executes the frame's body on the given worker. Only fork and root frames
/// are ever dispatched through this hook.
pub(crate) type ExecFn = unsafe fn(NonNull<FrameHead>, &Worker);

/// Moves a retired child's failure (if any) out of its slot.
pub(crate) type TakeErrorFn = unsafe fn(NonNull<FrameHead>) -> Option<TaskError>;

/// Drops whatever is left in a retired child's slot and releases its stack
/// allocation. The frame is invalid afterwards.
pub(crate) type ReclaimFn = unsafe fn(NonNull<FrameHead>);

/// Type-erased frame header. Always the first field of a concrete frame.
#[repr(C)]
pub(crate) struct FrameHead {
    kind: FrameKind,
    status: AtomicU8,
    /// Outstanding forked children not yet retired.
    join_count: AtomicUsize,
    parent: Option<NonNull<FrameHead>>,
    /// Stack the frame was allocated on; `None` for heap-allocated roots.
    stack: Option<StackHandle>,
    /// Newest-first chain of children forked by this frame, reclaimed in the
    /// frame epilogue. Only the frame's executor touches these cells.
    first_child: Cell<Option<NonNull<FrameHead>>>,
    next_sibling: Cell<Option<NonNull<FrameHead>>>,
    exec: ExecFn,
    take_error: TakeErrorFn,
    reclaim: ReclaimFn,
}

impl FrameHead {
    pub(crate) fn new(
        kind: FrameKind,
        parent: Option<NonNull<FrameHead>>,
        stack: Option<StackHandle>,
        exec: ExecFn,
        take_error: TakeErrorFn,
        reclaim: ReclaimFn,
    ) -> Self {
        Self {
            kind,
            status: AtomicU8::new(FrameStatus::Ready as u8),
            join_count: AtomicUsize::new(0),
            parent,
            stack,
            first_child: Cell::new(None),
            next_sibling: Cell::new(None),
            exec,
            take_error,
            reclaim,
        }
    }

    pub(crate) fn kind(&self) -> FrameKind {
        self.kind
    }

    pub(crate) fn status(&self) -> FrameStatus {
        FrameStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: FrameStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Forked children still in flight.
    pub(crate) fn pending_children(&self) -> usize {
        self.join_count.load(Ordering::Acquire)
    }

    /// Link a freshly allocated child and bump the join counter. Must run on
    /// the frame's executing worker, before the child is published.
    pub(crate) fn add_child(&self, child: NonNull<FrameHead>) {
        unsafe { child.as_ref() }.next_sibling.set(self.first_child.get());
        self.first_child.set(Some(child));
        self.join_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Erased, sendable pointer to a schedulable frame.
pub(crate) struct FrameHandle(pub(crate) NonNull<FrameHead>);

// Frames are accessed by whichever worker dequeues the handle; the frame
// protocol serializes that access.
unsafe impl Send for FrameHandle {}

impl FrameHandle {
    /// Run the frame's body to retirement on `worker`.
    ///
    /// # Safety
    ///
    /// The handle must have been obtained from a live, not-yet-executed
    /// frame.
    pub(crate) unsafe fn run(self, worker: &Worker) {
        debug_assert!(
            matches!(self.0.as_ref().kind(), FrameKind::Root | FrameKind::Fork),
            "only root and fork frames are scheduled"
        );
        let exec = self.0.as_ref().exec;
        exec(self.0, worker);
    }
}

/// Turn a panic payload into a message for [`TaskError::Panic`].
fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

/// Run a task body under the frame protocol: mark the frame running, hand
/// the body its scope, and make sure every forked child has retired before
/// the frame itself does, even when the body fails or panics, so sibling
/// work completes (and is discarded) rather than dangling.
pub(crate) unsafe fn run_body<'scope, T, F>(
    head: NonNull<FrameHead>,
    worker: &Worker,
    body: F,
) -> TaskResult<T>
where
    F: FnOnce(&Scope<'scope>) -> TaskResult<T>,
{
    let frame = head.as_ref();
    frame.set_status(FrameStatus::Running);
    let scope = Scope::new(head, NonNull::from(worker));
    let out = match catch_unwind(AssertUnwindSafe(|| body(&scope))) {
        Ok(out) => out,
        Err(payload) => Err(TaskError::Panic(panic_message(payload))),
    };
    if frame.pending_children() != 0 {
        // A body that returns cleanly with unjoined forks is a structure
        // violation; a failing body legitimately unwinds past its join.
        debug_assert!(
            out.is_err(),
            "task body returned with forked children still unjoined"
        );
        frame.set_status(FrameStatus::AwaitingJoin);
        worker.help_until(&|| frame.pending_children() == 0);
        frame.set_status(FrameStatus::Running);
    }
    let residual = reclaim_children(head);
    match (out, residual) {
        (Err(first), residual) => {
            if let Some(dropped) = residual {
                tracing::debug!(%dropped, "sibling failure coalesced at frame exit");
            }
            Err(first)
        }
        (Ok(_), Some(error)) => Err(error),
        (Ok(value), None) => Ok(value),
    }
}

/// Error-only sweep over the frame's retired children, frames retained.
/// Used by an explicit join; the first failure survives.
pub(crate) unsafe fn collect_child_failure(head: NonNull<FrameHead>) -> Option<TaskError> {
    let mut first = None;
    let mut cursor = head.as_ref().first_child.get();
    while let Some(child) = cursor {
        let child_ref = child.as_ref();
        if let Some(error) = (child_ref.take_error)(child) {
            if first.is_none() {
                first = Some(error);
            } else {
                tracing::debug!(dropped = %error, "additional sibling failure discarded");
            }
        }
        cursor = child_ref.next_sibling.get();
    }
    first
}

/// Reclaim every retired child: surface the first still-unseen failure, drop
/// unconsumed results, and release the stack allocations. The chain is
/// newest-first, which is exactly reverse allocation order, so the releases
/// pair up LIFO on the owning stack.
unsafe fn reclaim_children(head: NonNull<FrameHead>) -> Option<TaskError> {
    let mut first = None;
    let mut cursor = head.as_ref().first_child.get();
    head.as_ref().first_child.set(None);
    while let Some(child) = cursor {
        let child_ref = child.as_ref();
        let next = child_ref.next_sibling.get();
        if let Some(error) = (child_ref.take_error)(child) {
            if first.is_none() {
                first = Some(error);
            } else {
                tracing::debug!(dropped = %error, "additional sibling failure discarded");
            }
        }
        (child_ref.reclaim)(child);
        cursor = next;
    }
    first
}

// ---------------------------------------------------------------------------
// Fork frames
// ---------------------------------------------------------------------------

/// A forked child: body plus the return slot its value is bound through.
/// Lives on the forking worker's virtual stack until the parent's epilogue.
#[repr(C)]
pub(crate) struct ForkFrame<'scope, F, T> {
    head: FrameHead,
    body: UnsafeCell<ManuallyDrop<F>>,
    /// Written by the child's executor before the release decrement of the
    /// parent's join counter; read by the parent only after it observes
    /// zero.
    result: UnsafeCell<Option<TaskResult<T>>>,
    _scope: PhantomData<&'scope ()>,
}

impl<'scope, F, T> ForkFrame<'scope, F, T>
where
    F: FnOnce(&Scope<'scope>) -> TaskResult<T>,
{
    /// Construct a fork frame in the given stack allocation and return its
    /// erased head.
    ///
    /// # Safety
    ///
    /// `at` must be a live allocation of at least `size_of::<Self>()` bytes
    /// on `stack`, aligned for `Self`.
    pub(crate) unsafe fn initialize(
        at: NonNull<u8>,
        body: F,
        parent: NonNull<FrameHead>,
        stack: StackHandle,
    ) -> NonNull<Self> {
        let frame = at.cast::<Self>();
        frame.as_ptr().write(Self {
            head: FrameHead::new(
                FrameKind::Fork,
                Some(parent),
                Some(stack),
                Self::exec,
                Self::take_error,
                Self::reclaim,
            ),
            body: UnsafeCell::new(ManuallyDrop::new(body)),
            result: UnsafeCell::new(None),
            _scope: PhantomData,
        });
        frame
    }

    pub(crate) fn head_ptr(frame: NonNull<Self>) -> NonNull<FrameHead> {
        frame.cast::<FrameHead>()
    }

    pub(crate) fn result_ptr(frame: NonNull<Self>) -> NonNull<UnsafeCell<Option<TaskResult<T>>>> {
        unsafe { NonNull::new_unchecked(std::ptr::addr_of_mut!((*frame.as_ptr()).result)) }
    }

    unsafe fn exec(head: NonNull<FrameHead>, worker: &Worker) {
        let frame = head.cast::<Self>();
        let body = ManuallyDrop::take(&mut *frame.as_ref().body.get());
        let out = run_body(head, worker, body);
        let failed = out.is_err();
        *frame.as_ref().result.get() = Some(out);
        head.as_ref().set_status(if failed {
            FrameStatus::Failed
        } else {
            FrameStatus::Completed
        });
        let parent = head
            .as_ref()
            .parent
            .expect("forked frame without a parent");
        // The parent may reclaim this frame the moment it observes the
        // decrement; no access past this point.
        let remaining = parent.as_ref().join_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(remaining >= 1, "join counter underflow");
        worker.on_retire(remaining == 1);
    }

    unsafe fn take_error(head: NonNull<FrameHead>) -> Option<TaskError> {
        let frame = head.cast::<Self>();
        let slot = &mut *frame.as_ref().result.get();
        match slot.take() {
            Some(Err(error)) => Some(error),
            Some(Ok(value)) => {
                *slot = Some(Ok(value));
                None
            }
            None => None,
        }
    }

    unsafe fn reclaim(head: NonNull<FrameHead>) {
        let frame = head.cast::<Self>();
        debug_assert!(matches!(
            head.as_ref().status(),
            FrameStatus::Completed | FrameStatus::Failed
        ));
        // Drop a result the parent never consumed (or chose to ignore).
        let _ = (*frame.as_ref().result.get()).take();
        let stack = head.as_ref().stack.expect("fork frame without a stack");
        stack.deallocate(head.cast::<u8>(), mem::size_of::<Self>());
    }
}

// ---------------------------------------------------------------------------
// Call frames
// ---------------------------------------------------------------------------

/// Call frames are bare headers: the body runs inline and its result is
/// returned directly, so there is nothing to store and nothing to reclaim
/// later. These hooks exist only to fill the header's vtable slots.
pub(crate) unsafe fn exec_inline_only(_: NonNull<FrameHead>, _: &Worker) {
    unreachable!("call frames execute inline and are never scheduled");
}

pub(crate) unsafe fn take_error_inline_only(_: NonNull<FrameHead>) -> Option<TaskError> {
    unreachable!("call frames propagate their error on return");
}

pub(crate) unsafe fn reclaim_inline_only(_: NonNull<FrameHead>) {
    unreachable!("call frames are released when the call returns");
}

// ---------------------------------------------------------------------------
// Root frames
// ---------------------------------------------------------------------------

/// A root submission: heap allocated, with the outcome slot and completion
/// signal in submitter-owned storage.
#[repr(C)]
pub(crate) struct RootFrame<'env, F, T> {
    head: FrameHead,
    body: UnsafeCell<Option<F>>,
    outcome: Mutex<Option<TaskResult<T>>>,
    completed: Condvar,
    _env: PhantomData<&'env ()>,
}

impl<'env, F, T> RootFrame<'env, F, T>
where
    F: FnOnce(&Scope<'env>) -> TaskResult<T>,
{
    pub(crate) fn new(body: F) -> Box<Self> {
        Box::new(Self {
            head: FrameHead::new(
                FrameKind::Root,
                None,
                None,
                Self::exec,
                take_error_inline_only,
                reclaim_inline_only,
            ),
            body: UnsafeCell::new(Some(body)),
            outcome: Mutex::new(None),
            completed: Condvar::new(),
            _env: PhantomData,
        })
    }

    pub(crate) fn handle(&self) -> FrameHandle {
        FrameHandle(NonNull::from(&self.head))
    }

    unsafe fn exec(head: NonNull<FrameHead>, worker: &Worker) {
        let frame = &*(head.as_ptr() as *const Self);
        let body = (*frame.body.get())
            .take()
            .expect("root body executed twice");
        let out = run_body(head, worker, body);
        let failed = out.is_err();
        let mut slot = frame.outcome.lock();
        *slot = Some(out);
        head.as_ref().set_status(if failed {
            FrameStatus::Failed
        } else {
            FrameStatus::Completed
        });
        frame.completed.notify_one();
        // The submitter owns the frame and may free it once the lock drops.
    }

    /// Block the submitting thread until the root retires, then surface its
    /// outcome.
    pub(crate) fn wait(&self) -> TaskResult<T> {
        let mut slot = self.outcome.lock();
        while slot.is_none() {
            self.completed.wait(&mut slot);
        }
        slot.take().expect("root outcome missing")
    }
}
