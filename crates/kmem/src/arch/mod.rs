//! Architecture-specific implementations for memory management.
//!
//! Kernel builds use the x86 hardware backend. Tests and the `software-emulation`
//! feature swap in an emulated machine with the same interface:
//!
//! - `interrupts_enabled`, `disable_interrupts`, `enable_interrupts`
//! - `invalidate_page` (TLB shootdown of one page on the local CPU)
//! - `active_directory` / `load_directory` (the page directory register)
//! - `PhysicalMemory`, the statically reserved kernel paging structures plus the means
//!   to dereference kernel-window addresses

#[cfg(all(
    any(target_arch = "x86", target_arch = "x86_64"),
    not(test),
    not(feature = "software-emulation")
))]
mod x86;
#[cfg(all(
    any(target_arch = "x86", target_arch = "x86_64"),
    not(test),
    not(feature = "software-emulation")
))]
pub use x86::*;

#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::*;
