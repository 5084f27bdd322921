//! # weft-runtime
//!
//! The weft runtime proper: stackful fibers, the M:N cooperative scheduler,
//! the timer manager and the epoll IO manager.
//!
//! ## Modules
//!
//! - `arch` - per-architecture context switching (naked asm)
//! - `stack` - mmap'd fiber stacks with guard pages
//! - `fiber` - the stackful coroutine
//! - `tls` - per-thread runtime state
//! - `scheduler` - task queue, worker pool, dispatch loop
//! - `timer` - ordered timer set with bulk expiry
//! - `iomanager` - epoll multiplexer wired into the scheduler
//! - `config` - typed key/value registry with change listeners
//! - `time` - monotonic clock helpers

pub mod arch;
pub mod config;
pub mod fiber;
pub mod iomanager;
pub mod scheduler;
pub mod stack;
pub mod time;
pub mod timer;
pub mod tls;

pub use fiber::Fiber;
pub use iomanager::IoManager;
pub use scheduler::{Reactor, Scheduler, Task};
pub use timer::{Timer, TimerManager};
