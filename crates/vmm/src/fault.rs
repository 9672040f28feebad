//! Translation fault resolution.
//!
//! Every miss in the hardware translation cache lands here. A fault is resolved by finding
//! the region that covers the address, then either reloading an existing translation from
//! the hashed page table or backing the page with a fresh zeroed frame. Pages are never
//! evicted, so a translation, once created, lives until its address space is destroyed.

use crate::address::PAGE_SIZE;
use crate::address_space::{Access, AddressSpace};
use crate::arch;
use crate::hpt::{PageKey, Translation};
use crate::tlb::{self, EntryFlags, TranslationCache};
use crate::{FrameNumber, VirtualAddress, Vm, VmError, VmResult};

/// What the hardware reported about a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum FaultKind {
    /// A read missed in the translation cache.
    Read = 0,
    /// A write missed in the translation cache.
    Write = 1,
    /// A write hit a translation without the dirty bit.
    ReadOnly = 2,
}

impl TryFrom<usize> for FaultKind {
    type Error = VmError;

    fn try_from(raw: usize) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Self::Read),
            1 => Ok(Self::Write),
            2 => Ok(Self::ReadOnly),
            _ => Err(VmError::InvalidArgument),
        }
    }
}

/// The translation installed to resolve a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    /// EntryHi word written to the translation cache.
    pub entry_hi: u32,
    /// EntryLo word written to the translation cache.
    pub entry_lo: u32,
    /// True if a frame was allocated to back the page.
    pub allocated: bool,
}

impl Resolution {
    /// Returns the frame backing the faulting page.
    pub fn frame(&self) -> FrameNumber {
        tlb::decode_lo(self.entry_lo).0
    }

    /// Returns true if the installed translation permits writes.
    pub fn writable(&self) -> bool {
        tlb::decode_lo(self.entry_lo).1.contains(EntryFlags::DIRTY)
    }
}

impl<T: TranslationCache> Vm<T> {
    /// Resolves a fault whose kind is still in the trap frame's raw encoding.
    pub fn fault_raw(
        &self,
        space: Option<&AddressSpace>,
        raw_kind: usize,
        address: VirtualAddress,
    ) -> VmResult<Resolution> {
        let kind = FaultKind::try_from(raw_kind).inspect_err(|_| {
            log::warn!("fault at {}: unknown fault kind {}", address, raw_kind);
        })?;
        self.fault(space, kind, address)
    }

    /// Resolves a translation fault at `address` in `space`.
    ///
    /// `space` is the address space of the current process, or `None` if there is no
    /// current process or it has no address space yet.
    pub fn fault(
        &self,
        space: Option<&AddressSpace>,
        kind: FaultKind,
        address: VirtualAddress,
    ) -> VmResult<Resolution> {
        if kind == FaultKind::ReadOnly {
            // Every installed translation of a writable page carries the dirty bit.
            log::warn!("fault at {}: write to read-only translation", address);
            return Err(VmError::AccessViolation);
        }

        let Some(space) = space else {
            log::error!("fault at {} with no address space", address);
            return Err(VmError::FatalBootFault);
        };

        let page = address.page_number();
        let Some(region) = space.find_region(page) else {
            log::debug!("as {}: {:?} fault at unmapped {}", space.id(), kind, address);
            return Err(VmError::AccessViolation);
        };
        let protection = if region.mode().contains(Access::WRITE) {
            EntryFlags::DIRTY
        } else {
            EntryFlags::empty()
        };

        let key = PageKey::new(space.id(), page);
        let mut hpt = self.hpt.lock();
        if let Some(translation) = hpt.lookup(key) {
            drop(hpt);
            return Ok(self.install(key, translation.with(protection), false));
        }

        let frame = self.frames.allocate().inspect_err(|_| {
            log::warn!("as {}: no frame for {}", space.id(), address);
        })?;
        // SAFETY: the frame was just allocated, so nothing else refers to it, and it lies
        // within the memory described by the translator.
        unsafe {
            core::ptr::write_bytes(self.translator.frame_ptr(frame), 0, PAGE_SIZE);
        }

        let translation = Translation::valid(frame);
        if let Err(error) = hpt.insert(key, translation) {
            self.frames.deallocate(frame);
            log::warn!("as {}: no table slot for {}: {:?}", space.id(), address, error);
            return Err(error.into());
        }
        drop(hpt);

        Ok(self.install(key, translation.with(protection), true))
    }

    fn install(&self, key: PageKey, translation: Translation, allocated: bool) -> Resolution {
        let entry_hi = key.entry_hi();
        let entry_lo = translation.entry_lo();
        arch::without_interrupts(|| self.tlb.write_random(entry_hi, entry_lo));

        #[cfg(feature = "detailed-logging")]
        log::trace!(
            "install {:?} -> {} ({:#010x}/{:#010x}{})",
            key,
            translation.frame,
            entry_hi,
            entry_lo,
            if allocated { ", new frame" } else { "" }
        );

        Resolution {
            entry_hi,
            entry_lo,
            allocated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_kinds() {
        assert_eq!(FaultKind::try_from(0), Ok(FaultKind::Read));
        assert_eq!(FaultKind::try_from(1), Ok(FaultKind::Write));
        assert_eq!(FaultKind::try_from(2), Ok(FaultKind::ReadOnly));
        assert_eq!(FaultKind::try_from(3), Err(VmError::InvalidArgument));
        assert_eq!(FaultKind::Write as usize, 1);
    }

    #[test]
    fn resolution_decodes_entry_lo() {
        let resolution = Resolution {
            entry_hi: 0x1040,
            entry_lo: 0x42000 | 0x600,
            allocated: true,
        };
        assert_eq!(resolution.frame(), FrameNumber::new(0x42));
        assert!(resolution.writable());
    }
}
