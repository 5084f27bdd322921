//! Architecture-specific context switching
//!
//! Each submodule exports the same three items:
//!
//! - `SavedRegs` - callee-saved register snapshot, `repr(C)`, written and
//!   read by the assembly below at fixed offsets
//! - `init_context` - prepare a snapshot so the first switch into it enters
//!   the trampoline with the entry function and argument in place
//! - `context_switch` - save the calling context into `save`, load `restore`
//!   and jump; returns when something later switches back into `save`
//!
//! Only voluntary switches exist: a fiber leaves the CPU by calling
//! `context_switch` itself, so saving the callee-saved set is sufficient.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use x86_64::{context_switch, init_context, SavedRegs};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use aarch64::{context_switch, init_context, SavedRegs};
    } else {
        compile_error!("unsupported target architecture");
    }
}
