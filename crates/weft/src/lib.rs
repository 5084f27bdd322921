//! # weft - cooperative fiber runtime
//!
//! Stackful fibers on an M:N scheduler, multiplexed over epoll.
//!
//! ## Features
//!
//! - **Fibers**: stackful coroutines with explicit `resume`/`yield`,
//!   mmap'd guard-paged stacks, ~tens of ns per voluntary switch
//! - **Scheduler**: FIFO task queue over N worker threads, optional
//!   embedding of the calling thread, per-worker task pinning
//! - **IO manager**: per-descriptor READ/WRITE registrations dispatched
//!   from `epoll_wait`, self-pipe wakeups for cross-thread scheduling
//! - **Timers**: ordered deadline set driving the epoll wait timeout,
//!   recurring and condition-gated timers, clock-rollover recovery
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use weft::{EventSet, IoManager, Task};
//!
//! let io = IoManager::new(2, false, "app");
//!
//! // Plain callback task
//! io.schedule(Task::call(|| println!("hello from a worker")));
//!
//! // One-shot timer
//! io.add_timer(50, Arc::new(|| println!("50ms later")), false);
//!
//! // React to readiness on some descriptor
//! # let fd = 0;
//! io.add_event(fd, EventSet::READ, Some(Box::new(|| println!("readable"))))
//!     .unwrap();
//!
//! io.stop();
//! ```
//!
//! ## Architecture
//!
//! ```text
//!  user code ──schedule()──▶ task queue ──▶ dispatch loop (per worker)
//!                                              │ resume
//!                                              ▼
//!                                            fiber ──add_event + yield──▶ epoll
//!                                              ▲                            │
//!                                              └──────re-schedule◀──────────┘
//!                                                   (readiness / timer / tickle)
//! ```

// Core types
pub use weft_core::{Error, EventSet, FiberId, FiberState, Result};

// Runtime
pub use weft_runtime::config;
pub use weft_runtime::fiber::Fiber;
pub use weft_runtime::iomanager::{IoManager, TaskFn};
pub use weft_runtime::scheduler::{Reactor, Scheduler, Task};
pub use weft_runtime::timer::{Timer, TimerCallback, TimerManager};

/// Yield the fiber executing on this thread back to its dispatcher
#[inline]
pub fn yield_now() {
    Fiber::yield_now();
}

/// Id of the fiber executing on this thread, if any
#[inline]
pub fn current_fiber_id() -> Option<FiberId> {
    Fiber::current_id()
}
