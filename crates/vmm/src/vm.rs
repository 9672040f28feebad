//! The virtual memory manager and the address space lifecycle.

use spin::Mutex;

use crate::address::{AddressTranslator, PAGE_SIZE, PhysicalAddress};
use crate::address_space::{AddressSpace, IdAllocator};
use crate::arch;
use crate::config::VmConfig;
use crate::frame_table::FrameTable;
use crate::hpt::{HashedPageTable, PageKey, Translation};
use crate::tlb::{MAX_FRAMES, TranslationCache};
use crate::{AsId, FrameNumber, VirtualAddress, VmError, VmResult};

/// A snapshot of resource usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmStats {
    /// Frames of installed RAM, reserved ones included.
    pub frames_total: usize,
    /// Frames available for allocation.
    pub frames_available: usize,
    /// Slots in the hashed page table.
    pub hpt_capacity: usize,
    /// Slots in use.
    pub hpt_used: usize,
}

/// The virtual memory manager.
///
/// Owns the frame table, the hashed page table and the translation cache of one machine.
/// Exactly one is created per boot, before the first fault can be taken. All methods take
/// `&self`; the hashed page table is guarded by a single lock that is held for the whole of
/// every compound operation, and is always taken before the frame table's lock.
pub struct Vm<T: TranslationCache> {
    config: VmConfig,
    pub(crate) translator: AddressTranslator,
    pub(crate) frames: FrameTable,
    pub(crate) hpt: Mutex<HashedPageTable>,
    ids: IdAllocator,
    pub(crate) tlb: T,
}

impl<T: TranslationCache> Vm<T> {
    /// Initializes frame accounting and the hashed page table for the memory described by
    /// `translator`.
    pub fn bootstrap(config: VmConfig, translator: AddressTranslator, tlb: T) -> VmResult<Self> {
        let installed = translator.ram_size() / PAGE_SIZE;
        let total = installed.min(MAX_FRAMES);
        if total < installed {
            log::warn!(
                "vm: ignoring {} frames beyond the reach of a translation entry",
                installed - total
            );
        }
        config.validate(total)?;

        let capacity = config.hpt_capacity_for(total);
        let hpt = HashedPageTable::new(capacity)?;
        let frames = FrameTable::new(total, config.first_free_frame);

        log::info!(
            "vm: {} frames, first free {}, {} available, page table capacity {}",
            total,
            config.first_free_frame,
            frames.available(),
            capacity
        );

        Ok(Self {
            config,
            translator,
            frames,
            hpt: Mutex::new(hpt),
            ids: IdAllocator::new(),
            tlb,
        })
    }

    /// Returns the configuration the manager was bootstrapped with.
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Returns the translation cache.
    pub fn tlb(&self) -> &T {
        &self.tlb
    }

    /// Creates an empty address space.
    pub fn create(&self) -> VmResult<AddressSpace> {
        let id = self.ids.allocate()?;
        log::debug!("as {}: created", id);
        Ok(AddressSpace::new(id))
    }

    /// Creates a copy of `source` whose resident pages are private copies of the source's.
    ///
    /// Either the whole copy succeeds or nothing is left behind: the resources the copy
    /// needs are checked up front, and a failure part-way returns everything acquired.
    pub fn copy(&self, source: &AddressSpace) -> VmResult<AddressSpace> {
        let id = self.ids.allocate()?;
        let child = match source.duplicate_regions(id) {
            Ok(child) => child,
            Err(error) => {
                self.ids.release(id);
                return Err(error);
            }
        };

        let mut hpt = self.hpt.lock();
        let resident: alloc::vec::Vec<_> = hpt
            .entries_of(source.id())
            .into_iter()
            .filter(|(_, translation)| translation.is_valid())
            .collect();

        if resident.len() > hpt.free_slots() || resident.len() > self.frames.available() {
            log::warn!(
                "as {}: cannot copy {} pages ({} slots, {} frames free)",
                source.id(),
                resident.len(),
                hpt.free_slots(),
                self.frames.available()
            );
            drop(hpt);
            self.ids.release(id);
            return Err(VmError::OutOfMemory);
        }

        for (key, translation) in &resident {
            if let Err(error) = self.copy_page(&mut hpt, id, *key, *translation) {
                self.release_translations(&mut hpt, id);
                drop(hpt);
                self.ids.release(id);
                return Err(error);
            }
        }
        drop(hpt);

        log::debug!(
            "as {}: copied from {} ({} regions, {} pages)",
            id,
            source.id(),
            child.regions().len(),
            resident.len()
        );
        Ok(child)
    }

    fn copy_page(
        &self,
        hpt: &mut HashedPageTable,
        id: AsId,
        key: PageKey,
        translation: Translation,
    ) -> VmResult<()> {
        let frame = self.frames.allocate()?;
        // SAFETY: both frames lie within translated memory and are distinct, since the new
        // frame was just allocated while the source frame is still owned by the source.
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.translator.frame_ptr(translation.frame),
                self.translator.frame_ptr(frame),
                PAGE_SIZE,
            );
        }
        if let Err(error) = hpt.insert(PageKey::new(id, key.page), Translation::valid(frame)) {
            self.frames.deallocate(frame);
            return Err(error.into());
        }
        Ok(())
    }

    /// Destroys an address space, returning every frame it owns.
    pub fn destroy(&self, space: AddressSpace) {
        let id = space.id();
        drop(space);

        let mut hpt = self.hpt.lock();
        let freed = self.release_translations(&mut hpt, id);
        drop(hpt);

        self.ids.release(id);
        log::debug!("as {}: destroyed, {} frames freed", id, freed);
    }

    /// Removes every translation tagged with `id` and frees the frames behind them.
    fn release_translations(&self, hpt: &mut HashedPageTable, id: AsId) -> usize {
        let removed = hpt.remove_all(id);
        for (_, translation) in &removed {
            self.frames.deallocate(translation.frame);
        }
        removed.len()
    }

    /// Switches the translation cache to `space`.
    ///
    /// Kernel threads run without an address space and keep whatever the cache holds.
    pub fn activate(&self, space: Option<&AddressSpace>) {
        if space.is_none() {
            return;
        }
        self.flush_tlb();
    }

    /// Called when the current thread stops using its address space.
    pub fn deactivate(&self) {}

    fn flush_tlb(&self) {
        arch::without_interrupts(|| {
            for slot in 0..T::SLOTS {
                self.tlb.invalidate(slot);
            }
        });
    }

    /// Declares a region in `space`. See [`AddressSpace::define_region`].
    pub fn define_region(
        &self,
        space: &mut AddressSpace,
        vaddr: VirtualAddress,
        memsize: usize,
        readable: bool,
        writeable: bool,
        executable: bool,
    ) -> VmResult<()> {
        space.define_region(vaddr, memsize, readable, writeable, executable)
    }

    /// Opens the window in which the loader may write to every region of `space`.
    pub fn prepare_load(&self, space: &mut AddressSpace) {
        space.prepare_load();
    }

    /// Closes the load window, restoring permissions.
    ///
    /// The cache is flushed so that no writable translation installed during the load
    /// survives into a page that is now read-only.
    pub fn complete_load(&self, space: &mut AddressSpace) {
        space.complete_load();
        self.flush_tlb();
    }

    /// Reserves the user stack of `space` and returns the initial stack pointer.
    pub fn define_stack(&self, space: &mut AddressSpace) -> VmResult<VirtualAddress> {
        space.define_stack(self.config.stack_top, self.config.stack_pages)
    }

    /// Returns a snapshot of resource usage.
    pub fn stats(&self) -> VmStats {
        let hpt = self.hpt.lock();
        VmStats {
            frames_total: self.frames.total(),
            frames_available: self.frames.available(),
            hpt_capacity: hpt.capacity(),
            hpt_used: hpt.len(),
        }
    }

    /// Returns the frame backing `vaddr` in `space`, if the page is resident.
    pub fn frame_of(&self, space: &AddressSpace, vaddr: VirtualAddress) -> Option<FrameNumber> {
        let key = PageKey::new(space.id(), vaddr.page_number());
        self.hpt
            .lock()
            .lookup(key)
            .map(|translation| translation.frame)
    }

    /// Translates `vaddr` in `space` to a physical address, if the page is resident.
    pub fn translate(&self, space: &AddressSpace, vaddr: VirtualAddress) -> Option<PhysicalAddress> {
        self.frame_of(space, vaddr)
            .map(|frame| frame.start() + vaddr.page_offset())
    }

    /// Copies bytes out of resident pages of `space`, starting at `vaddr`.
    pub fn read_bytes(
        &self,
        space: &AddressSpace,
        vaddr: VirtualAddress,
        buf: &mut [u8],
    ) -> VmResult<()> {
        self.for_each_chunk(space, vaddr, buf.len(), |ptr, offset, len| {
            // SAFETY: `ptr` points into a resident frame with at least `len` bytes left.
            unsafe { core::ptr::copy_nonoverlapping(ptr, buf[offset..].as_mut_ptr(), len) }
        })
    }

    /// Copies bytes into resident pages of `space`, starting at `vaddr`.
    pub fn write_bytes(&self, space: &AddressSpace, vaddr: VirtualAddress, data: &[u8]) -> VmResult<()> {
        self.for_each_chunk(space, vaddr, data.len(), |ptr, offset, len| {
            // SAFETY: `ptr` points into a resident frame with at least `len` bytes left.
            unsafe { core::ptr::copy_nonoverlapping(data[offset..].as_ptr(), ptr, len) }
        })
    }

    /// Walks `[vaddr, vaddr + len)` page by page, handing each piece to `f` as a pointer
    /// into its frame, the offset into the caller's buffer, and the piece's length.
    ///
    /// The table lock is held throughout so that no frame is freed while it is in use.
    /// Fails with an access violation, before touching any memory, if a page is not resident.
    fn for_each_chunk(
        &self,
        space: &AddressSpace,
        vaddr: VirtualAddress,
        len: usize,
        mut f: impl FnMut(*mut u8, usize, usize),
    ) -> VmResult<()> {
        let hpt = self.hpt.lock();
        let end = vaddr
            .as_usize()
            .checked_add(len)
            .ok_or(VmError::InvalidArgument)?;

        let resident = |address: usize| {
            let key = PageKey::new(space.id(), VirtualAddress::new(address).page_number());
            hpt.lookup(key).map(|translation| translation.frame)
        };

        let mut address = vaddr.as_usize();
        while address < end {
            resident(address).ok_or(VmError::AccessViolation)?;
            match (address & !(PAGE_SIZE - 1)).checked_add(PAGE_SIZE) {
                Some(next) => address = next,
                None => break,
            }
        }

        let mut address = vaddr.as_usize();
        while address < end {
            let frame = resident(address).ok_or(VmError::AccessViolation)?;
            let page_offset = address % PAGE_SIZE;
            let chunk = (PAGE_SIZE - page_offset).min(end - address);
            // SAFETY: resident frames lie within translated memory.
            let ptr = unsafe { self.translator.frame_ptr(frame).add(page_offset) };
            f(ptr, address - vaddr.as_usize(), chunk);
            address += chunk;
        }
        Ok(())
    }
}
