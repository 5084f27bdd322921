//! Per-thread runtime state
//!
//! Fast access to the fiber currently executing on this thread, the
//! thread's main and dispatch fibers, the scheduler the thread works for,
//! and the thread's worker index.
//!
//! The raw pointers here are borrows, not owners: the current fiber is kept
//! alive by whoever resumed it, the dispatch fiber by the dispatch loop's
//! stack frame, the main fiber by `MAIN_FIBER`.

use crate::fiber::Fiber;
use crate::scheduler::Scheduler;
use std::cell::{Cell, RefCell};
use std::ptr;
use std::sync::{Arc, Weak};

thread_local! {
    /// Fiber currently executing on this thread
    static CURRENT_FIBER: Cell<*const Fiber> = const { Cell::new(ptr::null()) };

    /// This thread's main fiber (owns it; created lazily by `Fiber::current`)
    static MAIN_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// The fiber running the dispatch loop on this thread
    static DISPATCH_FIBER: Cell<*const Fiber> = const { Cell::new(ptr::null()) };

    /// Scheduler this thread currently works for
    static CURRENT_SCHEDULER: RefCell<Weak<Scheduler>> = const { RefCell::new(Weak::new()) };

    /// Worker index within the current scheduler
    static WORKER_ID: Cell<usize> = const { Cell::new(usize::MAX) };
}

/// Set the current fiber
#[inline]
pub fn set_current_fiber(f: *const Fiber) {
    CURRENT_FIBER.with(|cell| cell.set(f));
}

/// Get the current fiber, null if none has been materialized yet
#[inline]
pub fn current_fiber_ptr() -> *const Fiber {
    CURRENT_FIBER.with(|cell| cell.get())
}

/// Clear the current-fiber pointer if it refers to `f`
///
/// Tolerates being called during thread teardown, after the TLS slot has
/// already been destroyed.
#[inline]
pub fn clear_current_fiber_if(f: *const Fiber) {
    let _ = CURRENT_FIBER.try_with(|cell| {
        if cell.get() == f {
            cell.set(ptr::null());
        }
    });
}

/// Install this thread's main fiber
#[inline]
pub fn set_main_fiber(f: Arc<Fiber>) {
    MAIN_FIBER.with(|cell| *cell.borrow_mut() = Some(f));
}

/// Get this thread's main fiber, if it has been created
#[inline]
pub fn main_fiber() -> Option<Arc<Fiber>> {
    MAIN_FIBER.with(|cell| cell.borrow().clone())
}

/// Record the fiber whose callback is this thread's dispatch loop
#[inline]
pub fn set_dispatch_fiber(f: *const Fiber) {
    DISPATCH_FIBER.with(|cell| cell.set(f));
}

/// Get this thread's dispatch fiber, null outside a dispatch loop
#[inline]
pub fn dispatch_fiber_ptr() -> *const Fiber {
    DISPATCH_FIBER.with(|cell| cell.get())
}

/// Record the scheduler this thread works for
#[inline]
pub fn set_current_scheduler(s: Weak<Scheduler>) {
    CURRENT_SCHEDULER.with(|cell| *cell.borrow_mut() = s);
}

/// Get the scheduler this thread works for
#[inline]
pub fn current_scheduler() -> Option<Arc<Scheduler>> {
    CURRENT_SCHEDULER.with(|cell| cell.borrow().upgrade())
}

/// Set the worker index for this thread
#[inline]
pub fn set_worker_id(id: usize) {
    WORKER_ID.with(|cell| cell.set(id));
}

/// Get the worker index, `None` off worker threads
#[inline]
pub fn worker_id() -> Option<usize> {
    let id = WORKER_ID.with(|cell| cell.get());
    if id == usize::MAX {
        None
    } else {
        Some(id)
    }
}
