//! Stackful fibers
//!
//! A fiber is one cooperative execution context: an owned stack, a saved
//! register snapshot, a callback, and a state machine over
//! READY/RUNNING/TERM. Control moves with explicit `resume` (caller ->
//! fiber) and yield (fiber -> home context). The home context is the
//! thread's dispatch fiber for scheduler-run fibers, the thread's main
//! fiber otherwise.
//!
//! Ownership: fibers are always `Arc`-owned. The thread-current pointer in
//! TLS is a borrow kept valid by the resumer's strong reference; the
//! trampoline drops its own strong reference before the final yield so a
//! terminated fiber can be destroyed as soon as its external owners let go.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::{debug, error};

use weft_core::constants::DEFAULT_STACK_SIZE;
use weft_core::{FiberId, FiberState};

use crate::arch::{self, SavedRegs};
use crate::config::{self, ConfigVar};
use crate::stack::FiberStack;
use crate::tls;

/// Live fibers in the process (main fibers included)
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

fn stack_size_var() -> &'static Arc<ConfigVar<u32>> {
    static VAR: OnceLock<Arc<ConfigVar<u32>>> = OnceLock::new();
    VAR.get_or_init(|| config::lookup("fiber.stack_size", DEFAULT_STACK_SIZE, "fiber stack size"))
}

/// One cooperative execution context
pub struct Fiber {
    id: FiberId,
    state: AtomicU8,
    /// Yield returns to the dispatch fiber instead of the thread main fiber
    run_in_scheduler: bool,
    /// None for a thread's main fiber, which runs on the OS stack
    stack: Option<FiberStack>,
    regs: UnsafeCell<SavedRegs>,
    cb: UnsafeCell<Option<Box<dyn FnOnce() + Send>>>,
}

// A fiber's interior (regs, cb) is only touched by the thread currently
// executing or resuming it; handing a suspended fiber to another worker is
// ordered through the scheduler queue lock.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber over `cb`
    ///
    /// `stack_size` 0 draws the size from the `fiber.stack_size` config
    /// var. With `run_in_scheduler` (the default for scheduled work) the
    /// fiber yields to the dispatch fiber of the worker resuming it.
    pub fn new<F>(cb: F, stack_size: usize, run_in_scheduler: bool) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        let size = if stack_size != 0 {
            stack_size
        } else {
            stack_size_var().value() as usize
        };
        let stack = FiberStack::alloc(size).expect("fiber stack allocation failed");
        let stack_top = stack.top();

        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Ready.as_u8()),
            run_in_scheduler,
            stack: Some(stack),
            regs: UnsafeCell::new(SavedRegs::zeroed()),
            cb: UnsafeCell::new(Some(Box::new(cb))),
        });
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);

        unsafe {
            arch::init_context(
                fiber.regs.get(),
                stack_top,
                fiber_entry as usize,
                Arc::as_ptr(&fiber) as usize,
            );
        }

        debug!(target: "system", id = %fiber.id, size, "fiber created");
        fiber
    }

    /// The thread's main fiber: no stack, no callback, born RUNNING
    fn new_main() -> Fiber {
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        let fiber = Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Running.as_u8()),
            run_in_scheduler: false,
            stack: None,
            regs: UnsafeCell::new(SavedRegs::zeroed()),
            cb: UnsafeCell::new(None),
        };
        debug!(target: "system", id = %fiber.id, "main fiber created");
        fiber
    }

    /// The fiber executing on this thread, materializing the thread's main
    /// fiber on first call
    pub fn current() -> Arc<Fiber> {
        let ptr = tls::current_fiber_ptr();
        if !ptr.is_null() {
            // Mirror of shared_from_this: mint a new strong reference from
            // the borrowed TLS pointer.
            unsafe {
                Arc::increment_strong_count(ptr);
                return Arc::from_raw(ptr);
            }
        }

        let main = Arc::new(Fiber::new_main());
        tls::set_current_fiber(Arc::as_ptr(&main));
        tls::set_main_fiber(main.clone());
        main
    }

    /// Id of the fiber executing on this thread, `None` before any fiber
    /// has been materialized here
    pub fn current_id() -> Option<FiberId> {
        let ptr = tls::current_fiber_ptr();
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { (*ptr).id })
        }
    }

    /// Live fibers in the process
    pub fn total() -> u64 {
        FIBER_COUNT.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::SeqCst))
    }

    #[inline]
    fn set_state(&self, s: FiberState) {
        self.state.store(s.as_u8(), Ordering::SeqCst);
    }

    /// Switch from the calling context into this fiber
    ///
    /// Returns once the fiber yields or terminates; the fiber's state is
    /// then READY or TERM. Resuming anything but a READY fiber is a fatal
    /// programming error. The caller must hold a strong reference for the
    /// whole call (the `&self` borrow enforces it).
    pub fn resume(&self) {
        let state = self.state();
        if state != FiberState::Ready {
            error!(target: "system", id = %self.id, %state, "resume of non-ready fiber");
            panic!("resume of fiber {} in state {}", self.id, state);
        }

        let home = self.home_regs();
        tls::set_current_fiber(self as *const Fiber);
        self.set_state(FiberState::Running);
        unsafe {
            arch::context_switch(home, self.regs.get());
        }
        // Back in the home context; the yield path restored the TLS
        // current-fiber pointer before switching.
    }

    /// Yield the fiber executing on this thread back to its home context
    ///
    /// On a thread main fiber outside any dispatch loop this is a no-op:
    /// there is nothing to yield to.
    pub fn yield_now() {
        let cur = Fiber::current();
        if cur.stack.is_none() {
            return;
        }
        cur.yield_back();
    }

    /// Re-arm a terminated fiber with a new callback, reusing its stack
    pub fn reset<F>(&self, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let state = self.state();
        if self.stack.is_none() || state != FiberState::Term {
            error!(target: "system", id = %self.id, %state, "reset of live or stackless fiber");
            panic!("reset of fiber {} in state {}", self.id, state);
        }

        let stack_top = match &self.stack {
            Some(s) => s.top(),
            None => unreachable!(),
        };
        unsafe {
            *self.cb.get() = Some(Box::new(cb));
            arch::init_context(
                self.regs.get(),
                stack_top,
                fiber_entry as usize,
                self as *const Fiber as usize,
            );
        }
        self.set_state(FiberState::Ready);
    }

    /// Registers of the context this fiber yields to / is resumed from
    fn home_regs(&self) -> *mut SavedRegs {
        if self.run_in_scheduler {
            let d = tls::dispatch_fiber_ptr();
            assert!(
                !d.is_null(),
                "scheduler fiber switched outside a dispatch loop"
            );
            unsafe { (*d).regs.get() }
        } else {
            // Materialize the main fiber if this thread has none yet
            let main = match tls::main_fiber() {
                Some(m) => m,
                None => {
                    let _ = Fiber::current();
                    tls::main_fiber().expect("main fiber just created")
                }
            };
            main.regs.get()
        }
    }

    /// Switch from this (currently executing) fiber back home
    fn yield_back(&self) {
        let state = self.state();
        if state != FiberState::Running && state != FiberState::Term {
            error!(target: "system", id = %self.id, %state, "yield of non-running fiber");
            panic!("yield of fiber {} in state {}", self.id, state);
        }
        if state != FiberState::Term {
            self.set_state(FiberState::Ready);
        }

        let home_ptr = if self.run_in_scheduler {
            tls::dispatch_fiber_ptr()
        } else {
            tls::main_fiber()
                .map(|m| Arc::as_ptr(&m))
                .unwrap_or(std::ptr::null())
        };
        assert!(!home_ptr.is_null(), "fiber has no home context to yield to");

        tls::set_current_fiber(home_ptr);
        unsafe {
            arch::context_switch(self.regs.get(), (*home_ptr).regs.get());
        }
        // Resumed again; resume() has already re-marked us RUNNING and
        // pointed the TLS current-fiber at us.
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        if self.stack.is_some() {
            let state = self.state();
            if state != FiberState::Term {
                error!(target: "system", id = %self.id, %state, "fiber dropped before termination");
                panic!("fiber {} dropped in state {}", self.id, state);
            }
        } else {
            // Main fiber: dies with its thread, while nominally running
            debug_assert!(unsafe { (*self.cb.get()).is_none() });
            tls::clear_current_fiber_if(self as *const Fiber);
        }
        debug!(target: "system", id = %self.id, total = Fiber::total(), "fiber destroyed");
    }
}

/// Entry point of every stackful fiber
///
/// Runs on the fiber's own stack. Takes a strong reference, runs the
/// callback to completion, clears it (releasing anything it captured),
/// marks TERM and yields. The strong reference is dropped before the final
/// yield; the raw pointer stays valid because the resumer holds its own
/// strong reference across the switch.
extern "C" fn fiber_entry(arg: usize) {
    let cur = Fiber::current();
    debug_assert_eq!(Arc::as_ptr(&cur) as usize, arg);

    let cb = unsafe { (*cur.cb.get()).take() };
    if let Some(cb) = cb {
        // Panics from user callbacks are deliberately not caught here;
        // unwinding out of a fiber is a caller bug.
        cb();
    }
    cur.set_state(FiberState::Term);

    let raw = Arc::as_ptr(&cur);
    drop(cur);
    unsafe { (*raw).yield_back() };

    unreachable!("terminated fiber resumed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_hello_fiber() {
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();

        let f = Fiber::new(
            move || {
                log2.lock().unwrap().push("A");
                Fiber::yield_now();
                log2.lock().unwrap().push("B");
            },
            0,
            false,
        );
        assert_eq!(f.state(), FiberState::Ready);

        f.resume();
        assert_eq!(f.state(), FiberState::Ready);
        assert_eq!(*log.lock().unwrap(), vec!["A"]);

        f.resume();
        assert_eq!(f.state(), FiberState::Term);
        assert_eq!(*log.lock().unwrap(), vec!["A", "B"]);
    }

    #[test]
    fn test_reset_reuses_stack() {
        let hits = Arc::new(Mutex::new(0u32));

        let h = hits.clone();
        let f = Fiber::new(move || *h.lock().unwrap() += 1, 0, false);
        f.resume();
        assert_eq!(f.state(), FiberState::Term);

        let h = hits.clone();
        f.reset(move || *h.lock().unwrap() += 10);
        assert_eq!(f.state(), FiberState::Ready);
        f.resume();
        assert_eq!(f.state(), FiberState::Term);
        assert_eq!(*hits.lock().unwrap(), 11);
    }

    #[test]
    fn test_current_materializes_main_fiber() {
        let t = std::thread::spawn(|| {
            let a = Fiber::current();
            let b = Fiber::current();
            assert_eq!(a.id(), b.id());
            assert_eq!(a.state(), FiberState::Running);
            assert_eq!(Fiber::current_id(), Some(a.id()));
        });
        t.join().unwrap();
    }

    #[test]
    fn test_current_inside_child_fiber() {
        let seen: Arc<Mutex<Option<FiberId>>> = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        let f = Fiber::new(
            move || {
                *seen2.lock().unwrap() = Fiber::current_id();
            },
            0,
            false,
        );
        let expect = f.id();
        f.resume();
        assert_eq!(*seen.lock().unwrap(), Some(expect));
    }

    #[test]
    fn test_drop_after_term_is_clean() {
        // The live-count gauge is process-global and other tests run in
        // parallel, so only sanity-check it.
        let f = Fiber::new(|| {}, 16 * 1024, false);
        assert!(Fiber::total() >= 1);
        f.resume();
        assert_eq!(f.state(), FiberState::Term);
        drop(f);
    }

    #[test]
    fn test_small_explicit_stack() {
        let f = Fiber::new(|| {}, 16 * 1024, false);
        f.resume();
        assert_eq!(f.state(), FiberState::Term);
    }
}
