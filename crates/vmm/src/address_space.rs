//! Address space and region model.
//!
//! An address space is the per-process view of virtual memory: an id that tags every
//! translation the process owns in the hashed page table, and the ordered list of regions
//! the program loader declared. The translations themselves live in the global table, not
//! here.

use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;
use spin::Mutex;

use crate::address::PAGE_SIZE;
use crate::{PageNumber, VirtualAddress, VmError, VmResult};

/// End of the user segment. Addresses from here up belong to the kernel, and user pages
/// must also fit the 20-bit page field of a translation tag.
pub const USER_SPACE_END: VirtualAddress = VirtualAddress::new(0x8000_0000);

/// Default top of the user stack.
pub const USER_STACK_TOP: VirtualAddress = USER_SPACE_END;

/// Default number of pages reserved for the user stack.
pub const USER_STACK_PAGES: usize = 16;

/// An address-space id.
///
/// Ids occupy their own 6-bit field of a translation tag, so at most [`AsId::MAX`] address
/// spaces can be live at once. Id 0 is never handed out.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AsId(u8);

impl AsId {
    /// Largest id that fits in the tag field.
    pub const MAX: u8 = 63;

    /// Creates an id, returning None if it is zero or does not fit the tag field.
    pub const fn new(raw: u8) -> Option<Self> {
        if raw == 0 || raw > Self::MAX {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// Returns the raw id.
    pub const fn as_u8(self) -> u8 {
        self.0
    }
}

impl fmt::Debug for AsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AsId({})", self.0)
    }
}

impl fmt::Display for AsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out address-space ids.
///
/// Ids are assigned in increasing order. Once the counter passes [`AsId::MAX`] it wraps
/// around and skips ids that are still live, so an id is never shared by two live address
/// spaces.
pub struct IdAllocator {
    inner: Mutex<IdState>,
}

struct IdState {
    /// Bit n set means id n is live.
    live: u64,
    next: u8,
}

impl IdAllocator {
    /// Creates an allocator with no live ids.
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(IdState { live: 0, next: 1 }),
        }
    }

    /// Allocates the next free id.
    pub fn allocate(&self) -> VmResult<AsId> {
        let mut state = self.inner.lock();
        for _ in 0..AsId::MAX {
            let candidate = state.next;
            state.next = if candidate == AsId::MAX { 1 } else { candidate + 1 };
            if state.live & (1 << candidate) == 0 {
                state.live |= 1 << candidate;
                return Ok(AsId(candidate));
            }
        }
        log::warn!("address space ids exhausted");
        Err(VmError::OutOfMemory)
    }

    /// Releases an id so it can be handed out again.
    pub fn release(&self, id: AsId) {
        let mut state = self.inner.lock();
        debug_assert!(state.live & (1 << id.0) != 0, "releasing an id that is not live");
        state.live &= !(1 << id.0);
    }

    #[cfg(test)]
    pub(crate) fn live(&self) -> usize {
        self.inner.lock().live.count_ones() as usize
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

bitflags! {
    /// Access permissions of a region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Access: u8 {
        /// Loads are permitted.
        const READ = 1 << 0;
        /// Stores are permitted.
        const WRITE = 1 << 1;
        /// Instruction fetches are permitted.
        const EXECUTE = 1 << 2;
    }
}

impl Access {
    /// Builds an access mode from the loader's three permission flags.
    pub fn from_flags(readable: bool, writeable: bool, executable: bool) -> Self {
        let mut access = Access::empty();
        access.set(Access::READ, readable);
        access.set(Access::WRITE, writeable);
        access.set(Access::EXECUTE, executable);
        access
    }
}

/// A contiguous, page-aligned range of virtual memory with uniform permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    base: VirtualAddress,
    pages: usize,
    mode: Access,
    /// Permissions the loader asked for. `mode` is temporarily widened while the region is
    /// being populated and restored from here afterwards.
    load_mode: Access,
}

impl Region {
    /// Creates a region of `pages` pages starting at the page-aligned `base`.
    pub fn new(base: VirtualAddress, pages: usize, mode: Access) -> Self {
        debug_assert!(base.is_aligned(PAGE_SIZE), "region base must be page-aligned");
        Self {
            base,
            pages,
            mode,
            load_mode: mode,
        }
    }

    /// Returns the first address of the region.
    pub fn base(&self) -> VirtualAddress {
        self.base
    }

    /// Returns the size of the region in pages.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Returns the address one past the end of the region.
    pub fn end(&self) -> VirtualAddress {
        self.base + self.pages * PAGE_SIZE
    }

    /// Returns the current permissions of the region.
    pub fn mode(&self) -> Access {
        self.mode
    }

    /// Returns the permissions the region is restored to once loading completes.
    pub fn load_mode(&self) -> Access {
        self.load_mode
    }

    /// Returns true if the page lies within the region.
    pub fn contains(&self, page: PageNumber) -> bool {
        let first = self.base.page_number();
        page >= first && page - first < self.pages
    }

    /// Returns true if the two regions share at least one page.
    pub fn overlaps(&self, other: &Region) -> bool {
        self.base < other.end() && other.base < self.end()
    }
}

/// The virtual memory context of one process.
///
/// Address spaces are created, copied and destroyed through [`crate::Vm`], which also
/// removes the translations the address space owns from the hashed page table. Dropping an
/// address space without destroying it leaks those translations.
#[derive(Debug)]
pub struct AddressSpace {
    id: AsId,
    regions: Vec<Region>,
    stack_top: Option<VirtualAddress>,
}

impl AddressSpace {
    pub(crate) fn new(id: AsId) -> Self {
        Self {
            id,
            regions: Vec::new(),
            stack_top: None,
        }
    }

    /// Returns the id that tags this address space's translations.
    pub fn id(&self) -> AsId {
        self.id
    }

    /// Returns the regions in declaration order.
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Returns the top of the user stack, if one has been defined.
    pub fn stack_top(&self) -> Option<VirtualAddress> {
        self.stack_top
    }

    /// Returns the first region containing the page.
    pub fn find_region(&self, page: PageNumber) -> Option<&Region> {
        self.regions.iter().find(|region| region.contains(page))
    }

    /// Declares a region covering `[vaddr, vaddr + memsize)`.
    ///
    /// The base is rounded down and the end rounded up to page boundaries. Empty and
    /// overlapping regions are rejected.
    pub fn define_region(
        &mut self,
        vaddr: VirtualAddress,
        memsize: usize,
        readable: bool,
        writeable: bool,
        executable: bool,
    ) -> VmResult<()> {
        if memsize == 0 {
            return Err(VmError::InvalidArgument);
        }
        let base = vaddr.align_down(PAGE_SIZE);
        let end = vaddr
            .as_usize()
            .checked_add(memsize)
            .and_then(|end| end.checked_add(PAGE_SIZE - 1))
            .ok_or(VmError::InvalidArgument)?
            & !(PAGE_SIZE - 1);
        let pages = (end - base.as_usize()) / PAGE_SIZE;

        let mode = Access::from_flags(readable, writeable, executable);
        self.push_region(Region::new(base, pages, mode))
    }

    /// Reserves the user stack below `top` and returns the initial stack pointer.
    pub fn define_stack(&mut self, top: VirtualAddress, pages: usize) -> VmResult<VirtualAddress> {
        let size = pages.checked_mul(PAGE_SIZE).ok_or(VmError::InvalidArgument)?;
        if pages == 0
            || !top.is_aligned(PAGE_SIZE)
            || top > USER_SPACE_END
            || top.as_usize() < size
        {
            return Err(VmError::InvalidArgument);
        }
        if let Some(existing) = self.stack_top {
            return if existing == top {
                Ok(existing)
            } else {
                Err(VmError::InvalidArgument)
            };
        }

        let base = top - size;
        self.push_region(Region::new(base, pages, Access::READ | Access::WRITE))?;
        self.stack_top = Some(top);
        Ok(top)
    }

    /// Makes every region writable so the loader can populate it.
    pub fn prepare_load(&mut self) {
        for region in &mut self.regions {
            region.load_mode = region.mode;
            region.mode |= Access::WRITE;
        }
    }

    /// Restores the permissions saved by [`AddressSpace::prepare_load`].
    pub fn complete_load(&mut self) {
        for region in &mut self.regions {
            region.mode = region.load_mode;
        }
    }

    /// Copies the region list into a fresh address space with the given id.
    pub(crate) fn duplicate_regions(&self, id: AsId) -> VmResult<AddressSpace> {
        let mut regions = Vec::new();
        regions
            .try_reserve_exact(self.regions.len())
            .map_err(|_| VmError::OutOfMemory)?;
        regions.extend_from_slice(&self.regions);
        Ok(AddressSpace {
            id,
            regions,
            stack_top: self.stack_top,
        })
    }

    fn push_region(&mut self, region: Region) -> VmResult<()> {
        if region.end() > USER_SPACE_END {
            log::warn!(
                "as {}: region {}..{} reaches into the kernel segment",
                self.id,
                region.base(),
                region.end()
            );
            return Err(VmError::InvalidArgument);
        }
        if let Some(existing) = self.regions.iter().find(|r| r.overlaps(&region)) {
            log::warn!(
                "as {}: region {}..{} overlaps {}..{}",
                self.id,
                region.base(),
                region.end(),
                existing.base(),
                existing.end()
            );
            return Err(VmError::InvalidArgument);
        }
        self.regions
            .try_reserve(1)
            .map_err(|_| VmError::OutOfMemory)?;
        self.regions.push(region);
        Ok(())
    }
}
