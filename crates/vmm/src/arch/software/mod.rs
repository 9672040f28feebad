//! Software emulation for testing and development.
//!
//! This module provides software-emulated hardware that can run on any host:
//!
//! - [`EmulatedMemory`]: a host buffer standing in for physical RAM, so frame contents can
//!   be read, written and copied.
//! - [`SoftwareTlb`]: a 64-slot translation cache with random replacement.
//! - An emulated interrupt mask, so code paths that must run with interrupts disabled can be
//!   checked on the host.

mod tlb;

pub use tlb::SoftwareTlb;

use core::sync::atomic::{AtomicUsize, Ordering};

/// Number of emulated interrupt-masked sections currently entered.
///
/// Shared by all host threads: a nonzero depth only proves that *some* thread has masked
/// interrupts, which is enough for asserting that a write happens inside a masked section.
static MASK_DEPTH: AtomicUsize = AtomicUsize::new(0);

/// Runs `f` with emulated interrupts disabled.
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    MASK_DEPTH.fetch_add(1, Ordering::AcqRel);
    let result = f();
    MASK_DEPTH.fetch_sub(1, Ordering::AcqRel);
    result
}

/// Returns whether emulated interrupts are enabled.
pub fn interrupts_enabled() -> bool {
    MASK_DEPTH.load(Ordering::Acquire) == 0
}

/// Emulated physical memory.
///
/// This provides a simulated physical memory space so that frame contents can be
/// manipulated without real hardware or a kernel direct map.
#[cfg(any(test, feature = "software-emulation"))]
pub struct EmulatedMemory {
    /// Start of the leaked host buffer.
    base: core::ptr::NonNull<u8>,
    /// Size of the buffer in bytes.
    size: usize,
}

// SAFETY: The buffer is owned exclusively by this value and only handed out as raw
// pointers; synchronizing access to individual frames is the caller's responsibility, as it
// would be for real physical memory.
#[cfg(any(test, feature = "software-emulation"))]
unsafe impl Send for EmulatedMemory {}
#[cfg(any(test, feature = "software-emulation"))]
unsafe impl Sync for EmulatedMemory {}

#[cfg(any(test, feature = "software-emulation"))]
impl EmulatedMemory {
    /// Creates a new zero-filled emulated memory region of the specified size.
    pub fn new(size: usize) -> Self {
        let buffer: alloc::boxed::Box<[u8]> = alloc::vec![0u8; size].into_boxed_slice();
        let base = core::ptr::NonNull::from(alloc::boxed::Box::leak(buffer)).cast::<u8>();
        Self { base, size }
    }

    /// Translates a physical address to a pointer into the buffer.
    ///
    /// # Panics
    /// Panics if the address lies outside the emulated memory.
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.size, "physical address out of bounds");
        // SAFETY: phys is within the allocation.
        unsafe { self.base.as_ptr().add(phys) }
    }

    /// Returns the size of the emulated memory region.
    pub fn size(&self) -> usize {
        self.size
    }
}

#[cfg(any(test, feature = "software-emulation"))]
impl Drop for EmulatedMemory {
    fn drop(&mut self) {
        let slice = core::ptr::slice_from_raw_parts_mut(self.base.as_ptr(), self.size);
        // SAFETY: The pointer came from Box::leak in `new` and is released exactly once.
        drop(unsafe { alloc::boxed::Box::from_raw(slice) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_nests() {
        without_interrupts(|| {
            assert!(!interrupts_enabled());
            without_interrupts(|| assert!(!interrupts_enabled()));
            assert!(!interrupts_enabled());
        });
    }

    #[test]
    fn emulated_memory_is_zeroed_and_writable() {
        let mem = EmulatedMemory::new(64);
        let ptr = mem.translate(16);
        // SAFETY: 16 is within the 64-byte buffer.
        unsafe {
            assert_eq!(*ptr, 0);
            *ptr = 0xAB;
            assert_eq!(*mem.translate(16), 0xAB);
        }
    }

    #[test]
    #[should_panic(expected = "physical address out of bounds")]
    fn emulated_memory_rejects_out_of_bounds() {
        let mem = EmulatedMemory::new(64);
        mem.translate(64);
    }
}
