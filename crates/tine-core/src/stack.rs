//! Per-worker virtual stacks.
//!
//! A virtual stack is a fixed-capacity bump arena that task frames are
//! allocated on. Release is strictly LIFO, matching the call discipline of
//! fork/call/join. The buffer is allocated with alignment equal to its
//! capacity so that any interior pointer can be masked back to the owning
//! stack ([`StackHandle::from_address`]); frames handed to other workers
//! therefore never need copying.
//!
//! Host discipline: the bump pointer is only ever touched by the worker that
//! owns the stack. The failure slot is the one cross-thread part and is
//! mutex-protected.

use crate::{TaskError, TaskResult};
use parking_lot::Mutex;
use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::fmt;
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Alignment every allocation is rounded to: the platform's maximum scalar
/// alignment, the same guarantee the global allocator gives `new`-ed objects.
pub const MAX_ALIGN: usize = 16;

/// Control block living at the base of every stack buffer.
#[repr(C)]
struct Header {
    /// Bump offset from the buffer base; `HEADER_BYTES` when empty.
    top: AtomicUsize,
    capacity: usize,
    /// One-slot failure channel; the first failure wins.
    failure: Mutex<Option<TaskError>>,
}

/// Bytes reserved for the control block, rounded to `MAX_ALIGN`.
const HEADER_BYTES: usize = (mem::size_of::<Header>() + MAX_ALIGN - 1) & !(MAX_ALIGN - 1);

const fn round_to_align(bytes: usize) -> usize {
    (bytes + MAX_ALIGN - 1) & !(MAX_ALIGN - 1)
}

/// An owning virtual stack. Created with its worker, destroyed at pool
/// teardown; must be empty when dropped.
pub struct VirtualStack {
    header: NonNull<Header>,
}

// The owner may migrate with its worker thread; interior state is either
// single-host (top) or mutex-protected (failure).
unsafe impl Send for VirtualStack {}
unsafe impl Sync for VirtualStack {}

impl VirtualStack {
    /// Allocate a stack of `capacity` bytes (control block included).
    ///
    /// `capacity` must be a power of two no smaller than the control block
    /// plus one allocation unit; the buffer is placed at a capacity-aligned
    /// address so `from_address` can recover it by masking.
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "virtual stack capacity must be a power of two"
        );
        assert!(
            capacity >= HEADER_BYTES + MAX_ALIGN,
            "virtual stack capacity too small for the control block"
        );
        let layout = Layout::from_size_align(capacity, capacity).expect("stack layout");
        let base = unsafe { alloc(layout) };
        let Some(base) = NonNull::new(base) else {
            handle_alloc_error(layout);
        };
        let header = base.cast::<Header>();
        unsafe {
            header.as_ptr().write(Header {
                top: AtomicUsize::new(HEADER_BYTES),
                capacity,
                failure: Mutex::new(None),
            });
        }
        Self { header }
    }

    /// Non-owning handle to this stack.
    pub fn handle(&self) -> StackHandle {
        StackHandle {
            header: self.header,
        }
    }

    /// Reserve `bytes` bytes, rounded up to [`MAX_ALIGN`].
    pub fn allocate(&self, bytes: usize) -> TaskResult<NonNull<u8>> {
        self.handle().allocate(bytes)
    }

    /// Release the most recent live allocation. See [`StackHandle::deallocate`].
    pub fn deallocate(&self, addr: NonNull<u8>, bytes: usize) {
        self.handle().deallocate(addr, bytes)
    }

    /// Store a failure in the stack's one-slot channel.
    pub fn record_failure(&self, error: TaskError) {
        self.handle().record_failure(error)
    }

    /// Take the pending failure, if any.
    pub fn take_failure(&self) -> Option<TaskError> {
        self.handle().take_failure()
    }

    /// True when no allocation is live and no failure is pending.
    pub fn is_empty(&self) -> bool {
        self.handle().is_empty()
    }

    /// Bytes currently allocated (control block excluded).
    pub fn used(&self) -> usize {
        self.handle().used()
    }

    /// Total capacity in bytes (control block included).
    pub fn capacity(&self) -> usize {
        self.handle().capacity()
    }
}

impl Drop for VirtualStack {
    fn drop(&mut self) {
        debug_assert!(self.is_empty(), "virtual stack dropped while in use");
        let capacity = self.capacity();
        let layout = Layout::from_size_align(capacity, capacity).expect("stack layout");
        unsafe {
            self.header.as_ptr().drop_in_place();
            dealloc(self.header.as_ptr().cast::<u8>(), layout);
        }
    }
}

impl fmt::Debug for VirtualStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualStack")
            .field("base", &self.header.as_ptr())
            .field("capacity", &self.capacity())
            .field("used", &self.used())
            .finish()
    }
}

/// A non-owning view of a virtual stack.
///
/// Handles are how frames refer to the stack that holds them, and how a
/// worker other than the allocator reaches the failure channel. Bump
/// operations (`allocate`/`deallocate`) must still only be performed by the
/// stack's current host worker.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct StackHandle {
    header: NonNull<Header>,
}

unsafe impl Send for StackHandle {}
unsafe impl Sync for StackHandle {}

impl StackHandle {
    /// Recover the owning stack from any pointer into its buffer.
    ///
    /// `capacity` must be the capacity the stack was created with (all
    /// stacks of one pool share it). The base is `addr` masked with
    /// `capacity - 1`, which is exact because stacks are capacity-aligned.
    ///
    /// # Safety
    ///
    /// `addr` must point into a live stack of the given capacity; the result
    /// is undefined for any other address.
    pub unsafe fn from_address(addr: *const u8, capacity: usize) -> StackHandle {
        debug_assert!(capacity.is_power_of_two());
        let base = (addr as usize) & !(capacity - 1);
        StackHandle {
            header: NonNull::new_unchecked(base as *mut Header),
        }
    }

    fn header(&self) -> &Header {
        unsafe { self.header.as_ref() }
    }

    fn base(&self) -> *mut u8 {
        self.header.as_ptr().cast::<u8>()
    }

    /// Reserve `bytes` bytes, rounded up to [`MAX_ALIGN`].
    ///
    /// Fails with [`TaskError::StackOverflow`] when the stack cannot hold
    /// the allocation; the stack never grows.
    #[inline]
    pub fn allocate(&self, bytes: usize) -> TaskResult<NonNull<u8>> {
        let header = self.header();
        let top = header.top.load(Ordering::Relaxed);
        let overflow = TaskError::StackOverflow {
            requested: bytes,
            available: header.capacity - top,
        };
        let Some(rounded) = bytes.checked_add(MAX_ALIGN - 1) else {
            return Err(overflow);
        };
        let rounded = rounded & !(MAX_ALIGN - 1);
        let Some(new_top) = top.checked_add(rounded) else {
            return Err(overflow);
        };
        if new_top > header.capacity {
            return Err(overflow);
        }
        header.top.store(new_top, Ordering::Relaxed);
        Ok(unsafe { NonNull::new_unchecked(self.base().add(top)) })
    }

    /// Release the allocation at `addr`. Strictly LIFO: `addr` plus the
    /// rounded size must equal the current top (debug-asserted).
    #[inline]
    pub fn deallocate(&self, addr: NonNull<u8>, bytes: usize) {
        let header = self.header();
        let offset = addr.as_ptr() as usize - self.base() as usize;
        debug_assert_eq!(
            offset + round_to_align(bytes),
            header.top.load(Ordering::Relaxed),
            "non-LIFO virtual stack deallocation"
        );
        header.top.store(offset, Ordering::Relaxed);
    }

    /// Store a failure in the one-slot channel. The first failure wins;
    /// later ones are dropped with a diagnostic.
    pub fn record_failure(&self, error: TaskError) {
        let mut slot = self.header().failure.lock();
        if slot.is_none() {
            *slot = Some(error);
        } else {
            tracing::debug!(dropped = %error, "failure channel occupied, coalescing");
        }
    }

    /// Take the pending failure, if any, leaving the channel empty.
    pub fn take_failure(&self) -> Option<TaskError> {
        self.header().failure.lock().take()
    }

    /// True when no allocation is live and no failure is pending.
    pub fn is_empty(&self) -> bool {
        self.used() == 0 && self.header().failure.lock().is_none()
    }

    /// Bytes currently allocated (control block excluded).
    #[inline]
    pub fn used(&self) -> usize {
        self.header().top.load(Ordering::Relaxed) - HEADER_BYTES
    }

    /// Total capacity in bytes (control block included).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.header().capacity
    }
}

impl fmt::Debug for StackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackHandle")
            .field("base", &self.header.as_ptr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_stack_is_empty() {
        let stack = VirtualStack::new(4096);
        assert!(stack.is_empty());
        assert_eq!(stack.used(), 0);
        assert_eq!(stack.capacity(), 4096);
    }

    #[test]
    fn test_allocate_deallocate() {
        let stack = VirtualStack::new(4096);
        let ptr = stack.allocate(128).unwrap();
        assert!(!stack.is_empty());
        assert_eq!(stack.used(), 128);
        stack.deallocate(ptr, 128);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_multiple_allocations_lifo() {
        let stack = VirtualStack::new(4096);
        let a = stack.allocate(64).unwrap();
        let b = stack.allocate(128).unwrap();
        assert_eq!(stack.used(), 192);
        stack.deallocate(b, 128);
        stack.deallocate(a, 64);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_overflow_is_an_error() {
        let stack = VirtualStack::new(128);
        let ptr = stack.allocate(10).unwrap();
        let err = stack.allocate(128).unwrap_err();
        assert!(matches!(err, TaskError::StackOverflow { requested: 128, .. }));
        stack.deallocate(ptr, 10);
    }

    #[test]
    fn test_allocations_are_aligned() {
        let stack = VirtualStack::new(128);
        let a = stack.allocate(10).unwrap();
        let b = stack.allocate(10).unwrap();
        assert_eq!(a.as_ptr() as usize % MAX_ALIGN, 0);
        assert_eq!(b.as_ptr() as usize % MAX_ALIGN, 0);
        stack.deallocate(b, 10);
        stack.deallocate(a, 10);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_huge_request_does_not_wrap() {
        let stack = VirtualStack::new(4096);
        assert!(stack.allocate(usize::MAX - 3).is_err());
        assert!(stack.is_empty());
    }

    #[test]
    fn test_handle_identity() {
        let a = VirtualStack::new(4096);
        let b = VirtualStack::new(4096);
        assert_eq!(a.handle(), a.handle());
        assert_ne!(a.handle(), b.handle());
    }

    #[test]
    fn test_from_address_recovers_owner() {
        let stack = VirtualStack::new(4096);
        let ptr = stack.allocate(64).unwrap();
        let recovered = unsafe { StackHandle::from_address(ptr.as_ptr(), 4096) };
        assert_eq!(recovered, stack.handle());
        assert!(!recovered.is_empty());
        recovered.deallocate(ptr, 64);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_failure_channel() {
        let stack = VirtualStack::new(4096);
        assert!(stack.is_empty());
        stack.record_failure(TaskError::failure("boom"));
        assert!(!stack.is_empty());
        assert_eq!(stack.take_failure(), Some(TaskError::failure("boom")));
        assert!(stack.is_empty());
        assert_eq!(stack.take_failure(), None);
    }

    #[test]
    fn test_failure_channel_keeps_first() {
        let stack = VirtualStack::new(4096);
        stack.record_failure(TaskError::failure("first"));
        stack.record_failure(TaskError::failure("second"));
        assert_eq!(stack.take_failure(), Some(TaskError::failure("first")));
        assert_eq!(stack.take_failure(), None);
    }
}
