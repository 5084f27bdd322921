//! Error types for the weft runtime

use core::fmt;

/// Result type for runtime operations
pub type Result<T> = core::result::Result<T, Error>;

/// Errors surfaced by runtime operations
///
/// Only recoverable conditions get a variant. Programming-invariant
/// violations (resuming a TERM fiber, double-registering an event, ...) are
/// logged and abort instead of being returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A kernel call failed; carries the call name and errno
    Syscall { call: &'static str, errno: i32 },

    /// Scheduler already started
    AlreadyStarted,

    /// Scheduler has been stopped and cannot be restarted
    Stopped,

    /// The descriptor has no registration for the named event
    NotRegistered,
}

impl Error {
    /// Build a `Syscall` error from the current `errno`
    pub fn last_os(call: &'static str) -> Self {
        Error::Syscall {
            call,
            errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Syscall { call, errno } => {
                write!(f, "{} failed: errno {}", call, errno)
            }
            Error::AlreadyStarted => write!(f, "scheduler already started"),
            Error::Stopped => write!(f, "scheduler stopped"),
            Error::NotRegistered => write!(f, "event not registered"),
        }
    }
}

impl std::error::Error for Error {}
