//! The hashed page table.
//!
//! A single fixed-capacity table, shared by every address space, maps an
//! (address-space id, virtual page) key to a physical frame and its status bits. It is the
//! authoritative store of translations; the hardware translation cache only ever holds
//! copies of its entries.
//!
//! # Layout
//!
//! Every slot is either free or holds one entry. Entries whose keys hash to the same home
//! slot are chained through slot indices: if the home slot is free the entry goes there,
//! otherwise any free slot is taken and linked to the tail of the chain that runs through
//! the home slot. Because an entry may be parked in another key's home slot, chains can
//! merge, so lookups always compare the full key while walking.
//!
//! Free slots form an intrusive doubly-linked list threaded through the slot array, which
//! makes claiming a specific free slot (the home slot) and claiming any free slot both O(1).
//!
//! # Removal
//!
//! Removing an entry would orphan everything chained behind it, and because chains merge,
//! what sits behind an entry may belong to any address space. [`HashedPageTable::remove_all`]
//! therefore works in three phases: collect the owned entries together with every survivor
//! reachable behind one, vacate all of them while cutting links into vacated slots, then
//! reinsert the survivors.

use alloc::vec::Vec;
use core::fmt;

use crate::tlb::{self, EntryFlags};
use crate::{AsId, FrameNumber, PageNumber, VmError, VmResult};

/// The key of a translation: which address space, which virtual page.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageKey {
    /// Owning address space.
    pub id: AsId,
    /// Virtual page within that address space.
    pub page: PageNumber,
}

impl PageKey {
    /// Creates a key.
    pub const fn new(id: AsId, page: PageNumber) -> Self {
        Self { id, page }
    }

    /// Encodes the key as a translation cache EntryHi word.
    pub const fn entry_hi(self) -> u32 {
        tlb::entry_hi(self.id, self.page)
    }
}

impl fmt::Debug for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageKey({}:{:#x})", self.id, self.page.as_usize())
    }
}

/// A physical frame together with its status bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    /// Backing frame.
    pub frame: FrameNumber,
    /// Status bits.
    pub flags: EntryFlags,
}

impl Translation {
    /// Creates a valid translation to `frame`.
    pub const fn valid(frame: FrameNumber) -> Self {
        Self {
            frame,
            flags: EntryFlags::VALID,
        }
    }

    /// Returns a copy of this translation with additional status bits.
    pub fn with(self, flags: EntryFlags) -> Self {
        Self {
            frame: self.frame,
            flags: self.flags | flags,
        }
    }

    /// Returns true if the valid bit is set.
    pub fn is_valid(&self) -> bool {
        self.flags.contains(EntryFlags::VALID)
    }

    /// Encodes the translation as a translation cache EntryLo word.
    pub const fn entry_lo(self) -> u32 {
        tlb::entry_lo(self.frame, self.flags)
    }
}

/// Errors from hashed page table operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HptError {
    /// Every slot is in use.
    Full,
    /// The key already has a translation.
    Duplicate,
}

impl From<HptError> for VmError {
    fn from(error: HptError) -> Self {
        match error {
            HptError::Full => VmError::OutOfMemory,
            HptError::Duplicate => VmError::InvalidArgument,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    key: PageKey,
    translation: Translation,
    /// Next slot in the chain.
    next: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Free {
        prev: Option<usize>,
        next: Option<usize>,
    },
    Used(Entry),
}

/// The global translation store.
///
/// The table performs no locking of its own; the virtual memory manager keeps it behind a
/// single mutex and holds that mutex across every compound operation.
pub struct HashedPageTable {
    slots: Vec<Slot>,
    free_head: Option<usize>,
    free: usize,
}

impl HashedPageTable {
    /// Creates an empty table with `capacity` slots.
    pub fn new(capacity: usize) -> VmResult<Self> {
        if capacity == 0 {
            return Err(VmError::InvalidArgument);
        }

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| VmError::OutOfMemory)?;
        slots.extend((0..capacity).map(|index| Slot::Free {
            prev: index.checked_sub(1),
            next: (index + 1 < capacity).then_some(index + 1),
        }));

        Ok(Self {
            slots,
            free_head: Some(0),
            free: capacity,
        })
    }

    /// Returns the number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns the number of free slots.
    pub fn free_slots(&self) -> usize {
        self.free
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.capacity() - self.free
    }

    /// Returns true if the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.free == self.capacity()
    }

    /// Returns the home slot of a key.
    pub fn hash(&self, key: PageKey) -> usize {
        (key.id.as_u8() as usize ^ key.page.as_usize()) % self.capacity()
    }

    /// Looks up the translation for a key.
    pub fn lookup(&self, key: PageKey) -> Option<Translation> {
        self.find(key).map(|(_, entry)| entry.translation)
    }

    /// Inserts a translation for a key that has none.
    pub fn insert(&mut self, key: PageKey, translation: Translation) -> Result<(), HptError> {
        if self.free == 0 {
            return Err(HptError::Full);
        }

        let home = self.hash(key);
        let entry = Entry {
            key,
            translation,
            next: None,
        };

        if matches!(self.slots[home], Slot::Free { .. }) {
            self.unlink_free(home);
            self.slots[home] = Slot::Used(entry);
            return Ok(());
        }

        let tail = self.chain_tail(home, key)?;
        let slot = self.free_head.ok_or(HptError::Full)?;
        self.unlink_free(slot);
        self.slots[slot] = Slot::Used(entry);
        if let Slot::Used(last) = &mut self.slots[tail] {
            last.next = Some(slot);
        }
        Ok(())
    }

    /// Removes every entry owned by `id`, returning the removed keys and translations.
    ///
    /// Entries of other address spaces that were chained behind a removed entry are
    /// reinserted, so every surviving key stays reachable.
    pub fn remove_all(&mut self, id: AsId) -> Vec<(PageKey, Translation)> {
        let capacity = self.capacity();

        // Phase 1: collect owned entries and the survivors chained behind them.
        let owned: Vec<usize> = self
            .used()
            .filter(|(_, entry)| entry.key.id == id)
            .map(|(index, _)| index)
            .collect();
        if owned.is_empty() {
            return Vec::new();
        }

        let mut vacate = alloc::vec![false; capacity];
        for &index in &owned {
            vacate[index] = true;
        }

        let mut survivors = Vec::new();
        for &index in &owned {
            let mut next = self.entry(index).and_then(|entry| entry.next);
            while let Some(slot) = next {
                // A marked slot is either owned, and will be walked itself, or a survivor
                // whose tail has already been collected.
                if vacate[slot] {
                    break;
                }
                let Some(entry) = self.entry(slot) else {
                    log::error!("hpt: chain from slot {} runs into free slot {}", index, slot);
                    break;
                };
                vacate[slot] = true;
                survivors.push((entry.key, entry.translation));
                next = entry.next;
            }
        }

        // Phase 2: vacate every collected slot and cut links into vacated slots.
        let mut removed = Vec::with_capacity(owned.len());
        for index in 0..capacity {
            if vacate[index] {
                if let Slot::Used(entry) = self.slots[index] {
                    if entry.key.id == id {
                        removed.push((entry.key, entry.translation));
                    }
                }
                self.push_free(index);
            } else if let Slot::Used(entry) = &mut self.slots[index] {
                if entry.next.is_some_and(|next| vacate[next]) {
                    entry.next = None;
                }
            }
        }

        // Phase 3: reinsert survivors.
        for (key, translation) in survivors {
            if let Err(error) = self.insert(key, translation) {
                log::error!("hpt: lost surviving entry {:?} during relink: {:?}", key, error);
                debug_assert!(false, "survivor reinsertion cannot fail");
            }
        }

        removed
    }

    /// Returns the number of entries owned by `id`.
    pub fn count_owned(&self, id: AsId) -> usize {
        self.used().filter(|(_, entry)| entry.key.id == id).count()
    }

    /// Returns a snapshot of the entries owned by `id`, in slot order.
    pub fn entries_of(&self, id: AsId) -> Vec<(PageKey, Translation)> {
        self.used()
            .filter(|(_, entry)| entry.key.id == id)
            .map(|(_, entry)| (entry.key, entry.translation))
            .collect()
    }

    /// Returns the number of hops from a key's home slot to its entry.
    #[cfg(test)]
    pub(crate) fn chain_position(&self, key: PageKey) -> Option<usize> {
        let mut slot = self.hash(key);
        for hops in 0..self.capacity() {
            let entry = self.entry(slot)?;
            if entry.key == key {
                return Some(hops);
            }
            slot = entry.next?;
        }
        None
    }

    fn find(&self, key: PageKey) -> Option<(usize, &Entry)> {
        let mut slot = self.hash(key);
        for _ in 0..self.capacity() {
            let entry = self.entry(slot)?;
            if entry.key == key {
                return Some((slot, entry));
            }
            slot = entry.next?;
        }
        log::error!("hpt: chain from slot {} does not terminate", self.hash(key));
        None
    }

    /// Walks the chain starting at `home` to its last slot, rejecting duplicates.
    fn chain_tail(&self, home: usize, key: PageKey) -> Result<usize, HptError> {
        let mut slot = home;
        for _ in 0..self.capacity() {
            let Some(entry) = self.entry(slot) else {
                break;
            };
            if entry.key == key {
                return Err(HptError::Duplicate);
            }
            match entry.next {
                Some(next) => slot = next,
                None => return Ok(slot),
            }
        }
        log::error!("hpt: chain from slot {} is corrupt", home);
        Err(HptError::Full)
    }

    fn entry(&self, slot: usize) -> Option<&Entry> {
        match &self.slots[slot] {
            Slot::Used(entry) => Some(entry),
            Slot::Free { .. } => None,
        }
    }

    fn used(&self) -> impl Iterator<Item = (usize, &Entry)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Used(entry) => Some((index, entry)),
                Slot::Free { .. } => None,
            })
    }

    /// Removes a free slot from the free list.
    fn unlink_free(&mut self, slot: usize) {
        let Slot::Free { prev, next } = self.slots[slot] else {
            debug_assert!(false, "unlinking a used slot");
            return;
        };
        match prev {
            Some(prev) => self.set_free_next(prev, next),
            None => self.free_head = next,
        }
        if let Some(next) = next {
            self.set_free_prev(next, prev);
        }
        self.free -= 1;
    }

    /// Marks a slot free and puts it at the head of the free list.
    fn push_free(&mut self, slot: usize) {
        let head = self.free_head;
        self.slots[slot] = Slot::Free {
            prev: None,
            next: head,
        };
        if let Some(head) = head {
            self.set_free_prev(head, Some(slot));
        }
        self.free_head = Some(slot);
        self.free += 1;
    }

    fn set_free_next(&mut self, slot: usize, value: Option<usize>) {
        if let Slot::Free { next, .. } = &mut self.slots[slot] {
            *next = value;
        }
    }

    fn set_free_prev(&mut self, slot: usize, value: Option<usize>) {
        if let Slot::Free { prev, .. } = &mut self.slots[slot] {
            *prev = value;
        }
    }

    /// Checks the structural invariants of the table, panicking on violation.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        // Every entry is reachable from its home slot.
        for (slot, entry) in self.used() {
            let found = self.find(entry.key).map(|(index, _)| index);
            assert_eq!(found, Some(slot), "{:?} unreachable from home", entry.key);
        }

        // The free list covers exactly the free slots.
        let mut walked = 0;
        let mut prev = None;
        let mut cursor = self.free_head;
        while let Some(slot) = cursor {
            let Slot::Free { prev: p, next } = self.slots[slot] else {
                panic!("used slot {} on the free list", slot);
            };
            assert_eq!(p, prev);
            walked += 1;
            assert!(walked <= self.capacity(), "free list cycles");
            prev = Some(slot);
            cursor = next;
        }
        let free_slots = self
            .slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Free { .. }))
            .count();
        assert_eq!(walked, free_slots);
        assert_eq!(self.free, free_slots);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(raw: u8) -> AsId {
        AsId::new(raw).unwrap()
    }

    fn key(raw_id: u8, page: usize) -> PageKey {
        PageKey::new(id(raw_id), PageNumber::new(page))
    }

    fn tr(frame: usize) -> Translation {
        Translation::valid(FrameNumber::new(frame))
    }

    #[test]
    fn rejects_zero_capacity() {
        assert_eq!(HashedPageTable::new(0).err(), Some(VmError::InvalidArgument));
    }

    #[test]
    fn insert_then_lookup() {
        let mut hpt = HashedPageTable::new(8).unwrap();
        hpt.insert(key(1, 3), tr(10)).unwrap();
        assert_eq!(hpt.lookup(key(1, 3)), Some(tr(10)));
        assert_eq!(hpt.lookup(key(1, 4)), None);
        assert_eq!(hpt.len(), 1);
        assert_eq!(hpt.free_slots(), 7);
        hpt.assert_consistent();
    }

    #[test]
    fn same_page_in_different_spaces_is_isolated() {
        let mut hpt = HashedPageTable::new(8).unwrap();
        hpt.insert(key(1, 1), tr(10)).unwrap();
        hpt.insert(key(2, 1), tr(20)).unwrap();
        assert_ne!(hpt.hash(key(1, 1)), hpt.hash(key(2, 1)));
        assert_eq!(hpt.lookup(key(1, 1)), Some(tr(10)));
        assert_eq!(hpt.lookup(key(2, 1)), Some(tr(20)));
        assert_eq!(hpt.lookup(key(3, 1)), None);
    }

    #[test]
    fn collisions_chain_into_free_slots() {
        let mut hpt = HashedPageTable::new(4).unwrap();
        // id 1 ^ page 1 == 0 == id 2 ^ page 2 == id 3 ^ page 3 (mod 4)
        hpt.insert(key(1, 1), tr(1)).unwrap();
        hpt.insert(key(2, 2), tr(2)).unwrap();
        hpt.insert(key(3, 3), tr(3)).unwrap();
        assert_eq!(hpt.chain_position(key(1, 1)), Some(0));
        assert_eq!(hpt.chain_position(key(2, 2)), Some(1));
        assert_eq!(hpt.chain_position(key(3, 3)), Some(2));
        assert_eq!(hpt.lookup(key(3, 3)), Some(tr(3)));
        hpt.assert_consistent();
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let mut hpt = HashedPageTable::new(4).unwrap();
        hpt.insert(key(1, 1), tr(1)).unwrap();
        hpt.insert(key(2, 2), tr(2)).unwrap();
        assert_eq!(hpt.insert(key(2, 2), tr(9)), Err(HptError::Duplicate));
        assert_eq!(hpt.lookup(key(2, 2)), Some(tr(2)));
    }

    #[test]
    fn full_table_rejects_insert() {
        let mut hpt = HashedPageTable::new(2).unwrap();
        hpt.insert(key(1, 0), tr(1)).unwrap();
        hpt.insert(key(1, 1), tr(2)).unwrap();
        assert_eq!(hpt.insert(key(1, 2), tr(3)), Err(HptError::Full));
        assert_eq!(hpt.len(), 2);
    }

    #[test]
    fn remove_all_relinks_survivors_behind_removed_entry() {
        let mut hpt = HashedPageTable::new(4).unwrap();
        hpt.insert(key(1, 1), tr(1)).unwrap(); // home slot 0
        hpt.insert(key(2, 2), tr(2)).unwrap(); // chained behind it
        hpt.insert(key(3, 3), tr(3)).unwrap(); // chained behind that

        let removed = hpt.remove_all(id(1));
        assert_eq!(removed, alloc::vec![(key(1, 1), tr(1))]);
        assert_eq!(hpt.lookup(key(1, 1)), None);
        assert_eq!(hpt.lookup(key(2, 2)), Some(tr(2)));
        assert_eq!(hpt.lookup(key(3, 3)), Some(tr(3)));
        assert_eq!(hpt.len(), 2);
        hpt.assert_consistent();
    }

    #[test]
    fn remove_all_from_middle_of_chain() {
        let mut hpt = HashedPageTable::new(4).unwrap();
        hpt.insert(key(1, 1), tr(1)).unwrap();
        hpt.insert(key(2, 2), tr(2)).unwrap();
        hpt.insert(key(3, 3), tr(3)).unwrap();

        let removed = hpt.remove_all(id(2));
        assert_eq!(removed.len(), 1);
        assert_eq!(hpt.lookup(key(1, 1)), Some(tr(1)));
        assert_eq!(hpt.lookup(key(3, 3)), Some(tr(3)));
        hpt.assert_consistent();
    }

    #[test]
    fn remove_all_of_unknown_id_is_a_no_op() {
        let mut hpt = HashedPageTable::new(4).unwrap();
        hpt.insert(key(1, 1), tr(1)).unwrap();
        assert!(hpt.remove_all(id(5)).is_empty());
        assert_eq!(hpt.len(), 1);
    }

    #[test]
    fn entries_of_and_count_owned() {
        let mut hpt = HashedPageTable::new(16).unwrap();
        for page in 0..5 {
            hpt.insert(key(1, page), tr(page)).unwrap();
        }
        hpt.insert(key(2, 0), tr(100)).unwrap();
        assert_eq!(hpt.count_owned(id(1)), 5);
        assert_eq!(hpt.count_owned(id(2)), 1);
        let entries = hpt.entries_of(id(1));
        assert_eq!(entries.len(), 5);
        assert!(entries.iter().all(|(k, _)| k.id == id(1)));
    }

    #[test]
    fn translation_encoding_matches_cache_layout() {
        let translation = tr(0x42).with(EntryFlags::DIRTY);
        assert_eq!(translation.entry_lo(), 0x42000 | 0x600);
        assert_eq!(key(1, 0x10).entry_hi(), 0x10000 | (1 << 6));
    }

    proptest! {
        #[test]
        fn teardown_keeps_survivors_reachable(
            inserts in proptest::collection::vec((1u8..5, 0usize..24), 1..40),
            victim in 1u8..5,
        ) {
            let mut hpt = HashedPageTable::new(32).unwrap();
            let mut expected = alloc::vec::Vec::new();
            for (frame, (raw_id, page)) in inserts.into_iter().enumerate() {
                let k = key(raw_id, page);
                if hpt.insert(k, tr(frame)).is_ok() {
                    expected.push((k, tr(frame)));
                }
            }
            hpt.assert_consistent();

            let removed = hpt.remove_all(id(victim));
            hpt.assert_consistent();

            let owned = expected.iter().filter(|(k, _)| k.id == id(victim)).count();
            prop_assert_eq!(removed.len(), owned);
            for (k, t) in &expected {
                if k.id == id(victim) {
                    prop_assert_eq!(hpt.lookup(*k), None);
                } else {
                    prop_assert_eq!(hpt.lookup(*k), Some(*t));
                }
            }
            prop_assert_eq!(hpt.len(), expected.len() - owned);
        }

        #[test]
        fn lookups_never_cross_address_spaces(pages in proptest::collection::vec(0usize..64, 1..20)) {
            let mut hpt = HashedPageTable::new(128).unwrap();
            for (i, page) in pages.iter().enumerate() {
                let _ = hpt.insert(key(1, *page), tr(i));
            }
            for page in &pages {
                prop_assert_eq!(hpt.lookup(key(2, *page)), None);
                prop_assert!(hpt.lookup(key(1, *page)).is_some());
            }
        }
    }
}
