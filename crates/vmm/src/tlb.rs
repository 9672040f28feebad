//! Hardware translation cache contract.
//!
//! The translation cache (TLB) is a small, software-refilled cache of the hashed page table.
//! Entries are two 32-bit words whose layout is fixed by the hardware:
//!
//! ```text
//! EntryHi:  31                  12 11      6 5      0
//!          +----------------------+---------+--------+
//!          | virtual page number  |  AS id  |   0    |
//!          +----------------------+---------+--------+
//!
//! EntryLo:  31                  12 11  10  9   8  7  0
//!          +----------------------+---+---+---+---+----+
//!          | physical frame num.  | N | D | V | G |  0 |
//!          +----------------------+---+---+---+---+----+
//! ```
//!
//! The hashed page table stores translations in a structured form and only produces these
//! words when a translation is installed.

use bitflags::bitflags;

use crate::address::{PAGE_FRAME, PAGE_SHIFT};
use crate::{AsId, FrameNumber, PageNumber};

/// Shift of the address-space id field within EntryHi.
pub const ENTRY_HI_ID_SHIFT: u32 = 6;

/// Mask of the address-space id field within EntryHi.
pub const ENTRY_HI_ID_MASK: u32 = 0x0000_0FC0;

/// Number of frames the EntryLo frame field can name.
pub const MAX_FRAMES: usize = (PAGE_FRAME >> PAGE_SHIFT) + 1;

bitflags! {
    /// Status bits in the low half of EntryLo.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EntryFlags: u32 {
        /// Matches regardless of the address-space id.
        const GLOBAL = 1 << 8;
        /// The translation may be used.
        const VALID = 1 << 9;
        /// Writes are permitted. Writing through a translation without it raises a
        /// read-only fault.
        const DIRTY = 1 << 10;
        /// Accesses bypass the data cache.
        const NOCACHE = 1 << 11;
    }
}

/// Encodes the EntryHi word for a page in an address space.
pub const fn entry_hi(id: AsId, page: PageNumber) -> u32 {
    (((page.as_usize() << PAGE_SHIFT) & PAGE_FRAME) as u32)
        | ((id.as_u8() as u32) << ENTRY_HI_ID_SHIFT)
}

/// Encodes the EntryLo word for a frame with the given status bits.
pub const fn entry_lo(frame: FrameNumber, flags: EntryFlags) -> u32 {
    (((frame.as_usize() << PAGE_SHIFT) & PAGE_FRAME) as u32) | flags.bits()
}

/// EntryHi value for an unused slot.
///
/// Each slot gets a distinct kernel-segment page so that no two slots ever match the same
/// lookup, and no user access can match any of them.
pub const fn invalid_hi(slot: usize) -> u32 {
    ((0x80000 + slot) << PAGE_SHIFT) as u32
}

/// EntryLo value for an unused slot.
pub const fn invalid_lo() -> u32 {
    0
}

/// Splits an EntryHi word into its page number and id field.
pub const fn decode_hi(hi: u32) -> (PageNumber, u8) {
    (
        PageNumber::new((hi as usize & PAGE_FRAME) >> PAGE_SHIFT),
        ((hi & ENTRY_HI_ID_MASK) >> ENTRY_HI_ID_SHIFT) as u8,
    )
}

/// Splits an EntryLo word into its frame number and status bits.
pub const fn decode_lo(lo: u32) -> (FrameNumber, EntryFlags) {
    (
        FrameNumber::new((lo as usize & PAGE_FRAME) >> PAGE_SHIFT),
        EntryFlags::from_bits_truncate(lo),
    )
}

/// The per-core hardware translation cache.
///
/// Writes must be performed with interrupts masked (see
/// [`crate::arch::without_interrupts`]); the cache itself does not synchronize with the
/// hashed page table.
pub trait TranslationCache: Send + Sync {
    /// Number of slots in the cache.
    const SLOTS: usize;

    /// Writes a translation into a specific slot.
    fn write(&self, slot: usize, hi: u32, lo: u32);

    /// Reads back the translation held in a slot.
    fn read(&self, slot: usize) -> (u32, u32);

    /// Writes a translation into a slot chosen by the hardware's replacement policy.
    ///
    /// The policy does not track recency; callers must not rely on which slot is evicted.
    fn write_random(&self, hi: u32, lo: u32);

    /// Returns the slot holding `hi`, if any.
    fn probe(&self, hi: u32) -> Option<usize>;

    /// Invalidates a single slot.
    fn invalidate(&self, slot: usize) {
        self.write(slot, invalid_hi(slot), invalid_lo());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_hi_layout() {
        let id = AsId::new(5).unwrap();
        let hi = entry_hi(id, PageNumber::new(0x1));
        assert_eq!(hi, 0x1000 | (5 << 6));
        assert_eq!(decode_hi(hi), (PageNumber::new(1), 5));
    }

    #[test]
    fn entry_lo_layout() {
        let lo = entry_lo(FrameNumber::new(0x42), EntryFlags::VALID | EntryFlags::DIRTY);
        assert_eq!(lo, 0x42000 | 0x200 | 0x400);
        assert_eq!(
            decode_lo(lo),
            (FrameNumber::new(0x42), EntryFlags::VALID | EntryFlags::DIRTY)
        );
    }

    #[test]
    fn id_never_overlaps_page_bits() {
        let id = AsId::new(AsId::MAX).unwrap();
        let hi = entry_hi(id, PageNumber::new(0));
        assert_eq!(hi as usize & PAGE_FRAME, 0);
        assert_eq!(hi & ENTRY_HI_ID_MASK, hi);
    }

    #[test]
    fn last_frame_fits_entry_lo() {
        let lo = entry_lo(FrameNumber::new(MAX_FRAMES - 1), EntryFlags::VALID);
        assert_eq!(decode_lo(lo).0, FrameNumber::new(MAX_FRAMES - 1));
        assert_eq!(MAX_FRAMES, 0x10_0000);
    }

    #[test]
    fn invalid_entries_are_distinct_kernel_pages() {
        assert_eq!(invalid_hi(0), 0x8000_0000);
        assert_eq!(invalid_hi(1), 0x8000_1000);
        assert_eq!(invalid_lo(), 0);
    }
}
