//! Address types for physical and virtual memory management.
//!
//! This module provides wrappers around physical and virtual addresses, and the
//! [`AddressTranslator`] that turns a physical frame into something the kernel can read and
//! write.

use core::fmt;
use core::ops::{Add, Sub};

use crate::{FrameNumber, PageNumber};

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::software::EmulatedMemory;

/// Number of bits in a page offset.
///
/// Fixed by the translation entry layout: the frame and page numbers start at bit 12.
pub const PAGE_SHIFT: usize = 12;

/// Page size in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Mask selecting the page-number bits of a 32-bit address.
pub const PAGE_FRAME: usize = 0xFFFF_F000;

/// Address translator for converting between physical and kernel-accessible addresses.
///
/// This enum supports two modes:
/// - Hardware: Uses a direct-map offset for translation (kernel mode)
/// - Emulated: Uses an emulated memory buffer for translation (testing mode)
pub enum AddressTranslator {
    /// Hardware translation using a direct-map offset.
    Hardware {
        /// Offset of the kernel's direct map of physical memory.
        direct_map_offset: usize,
        /// Installed RAM in bytes, as reported by the platform.
        ram_size: usize,
    },
    /// Emulated translation using a simulated memory region.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(EmulatedMemory),
}

impl AddressTranslator {
    /// Creates a new hardware translator with the given direct-map offset and RAM size.
    pub const fn hardware(direct_map_offset: usize, ram_size: usize) -> Self {
        Self::Hardware {
            direct_map_offset,
            ram_size,
        }
    }

    /// Creates a new emulated translator with the given memory size.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(ram_size: usize) -> Self {
        Self::Emulated(EmulatedMemory::new(ram_size))
    }

    /// Returns the amount of installed physical memory in bytes.
    pub fn ram_size(&self) -> usize {
        match self {
            Self::Hardware { ram_size, .. } => *ram_size,
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.size(),
        }
    }

    /// Translates a physical address to a kernel-accessible virtual address.
    pub fn phys_to_virt(&self, phys: usize) -> usize {
        match self {
            Self::Hardware {
                direct_map_offset, ..
            } => phys.wrapping_add(*direct_map_offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.translate(phys) as usize,
        }
    }

    /// Returns a pointer to the first byte of a physical frame.
    ///
    /// The pointer is valid for [`PAGE_SIZE`] bytes as long as the frame lies within
    /// [`AddressTranslator::ram_size`].
    pub fn frame_ptr(&self, frame: FrameNumber) -> *mut u8 {
        self.phys_to_virt(frame.start().as_usize()) as *mut u8
    }
}

/// Macro to define common address type functionality.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new address.
            #[inline]
            pub const fn new(addr: usize) -> Self {
                Self(addr)
            }

            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Returns the offset of this address within its page.
            #[inline]
            pub const fn page_offset(self) -> usize {
                self.0 & (PAGE_SIZE - 1)
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Aligns the address up to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self((self.0 + align - 1) & !(align - 1))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }
    };
}

impl_address_common!(PhysicalAddress, "A physical memory address.");

impl PhysicalAddress {
    /// Returns the frame containing this physical address.
    #[inline]
    pub fn frame_number(self) -> FrameNumber {
        FrameNumber::from(self)
    }
}

impl_address_common!(
    VirtualAddress,
    "A virtual memory address.\n\n\
     User addresses live in the low 2GiB; everything at or above `0x8000_0000` belongs to\n\
     the kernel and never reaches the fault handler."
);

impl VirtualAddress {
    /// Returns the page containing this virtual address.
    #[inline]
    pub fn page_number(self) -> PageNumber {
        PageNumber::from(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        let addr = VirtualAddress::new(0x1234);
        assert!(!addr.is_aligned(PAGE_SIZE));
        assert_eq!(addr.align_down(PAGE_SIZE), VirtualAddress::new(0x1000));
        assert_eq!(addr.align_up(PAGE_SIZE), VirtualAddress::new(0x2000));
        assert_eq!(addr.page_offset(), 0x234);
    }

    #[test]
    fn hardware_translator_applies_offset() {
        let translator = AddressTranslator::hardware(0x8000_0000, 0x10_0000);
        assert_eq!(translator.phys_to_virt(0x2000), 0x8000_2000);
        assert_eq!(translator.ram_size(), 0x10_0000);
    }

    #[test]
    fn emulated_translator_round_trips() {
        let translator = AddressTranslator::emulated(16 * PAGE_SIZE);
        let ptr = translator.frame_ptr(FrameNumber::new(3));
        assert_eq!(translator.phys_to_virt(3 * PAGE_SIZE), ptr as usize);
        assert_eq!(translator.ram_size(), 16 * PAGE_SIZE);
    }
}
