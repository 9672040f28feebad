//! x86_64 interrupt masking.

use x86_64::instructions::interrupts;

/// Runs `f` with interrupts disabled on the current core, restoring the previous state
/// afterwards.
#[inline]
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    interrupts::without_interrupts(f)
}

/// Returns whether interrupts are enabled on the current core.
#[inline]
pub fn interrupts_enabled() -> bool {
    interrupts::are_enabled()
}
