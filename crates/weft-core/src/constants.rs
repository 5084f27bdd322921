//! Runtime tunables
//!
//! Compile-time constants. The fiber stack size additionally has a runtime
//! config var (`fiber.stack_size`) whose default is `DEFAULT_STACK_SIZE`.

/// Default fiber stack size: 128 KiB
pub const DEFAULT_STACK_SIZE: u32 = 128 * 1024;

/// Size hint passed to `epoll_create` (ignored by modern kernels)
pub const EPOLL_SIZE_HINT: i32 = 5000;

/// Initial size of the per-descriptor context vector
pub const FD_CONTEXT_INITIAL: usize = 32;

/// Maximum events drained per `epoll_wait` call
pub const MAX_EPOLL_EVENTS: usize = 256;

/// Upper bound on a single idle `epoll_wait`, in milliseconds
pub const MAX_IDLE_MS: u64 = 3000;

/// A monotonic reading this far below the previous one is a clock rollover
pub const CLOCK_ROLLOVER_MS: u64 = 60 * 60 * 1000;

/// Payload written to the tickle pipe
pub const TICKLE_BYTE: &[u8] = b"T";
