//! Architecture-specific primitives consumed by the virtual memory manager.
//!
//! This module conditionally selects either the hardware interrupt-masking primitive or
//! its software emulation, based on the target and features. The software translation cache
//! and emulated physical memory are always available under [`software`].

// Use the x86_64 hardware implementation only on bare metal, and never when emulating.
#[cfg(all(
    target_arch = "x86_64",
    target_os = "none",
    not(feature = "software-emulation")
))]
mod x86_64;
#[cfg(all(
    target_arch = "x86_64",
    target_os = "none",
    not(feature = "software-emulation")
))]
pub use self::x86_64::{interrupts_enabled, without_interrupts};

pub mod software;
#[cfg(not(all(
    target_arch = "x86_64",
    target_os = "none",
    not(feature = "software-emulation")
)))]
pub use software::{interrupts_enabled, without_interrupts};
