//! Software translation cache.

use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::tlb::{TranslationCache, invalid_hi, invalid_lo};

/// Number of slots in the emulated cache, matching the hardware it models.
const SLOT_COUNT: usize = 64;

/// An emulated translation cache with random replacement.
///
/// Slots start out invalid. [`TranslationCache::write_random`] picks its victim with a
/// xorshift generator, so the replacement order is deterministic for a given seed but does
/// not depend on how recently a slot was used.
pub struct SoftwareTlb {
    slots: Mutex<[(u32, u32); SLOT_COUNT]>,
    seed: AtomicU32,
}

impl SoftwareTlb {
    /// Creates a cache with every slot invalid.
    pub fn new() -> Self {
        Self::with_seed(0x2545_F491)
    }

    /// Creates a cache whose victim selection starts from `seed`.
    pub fn with_seed(seed: u32) -> Self {
        let mut slots = [(0, 0); SLOT_COUNT];
        for (index, slot) in slots.iter_mut().enumerate() {
            *slot = (invalid_hi(index), invalid_lo());
        }
        Self {
            slots: Mutex::new(slots),
            seed: AtomicU32::new(seed.max(1)),
        }
    }

    /// Returns the number of slots currently holding a valid translation.
    pub fn valid_count(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|(_, lo)| *lo != invalid_lo())
            .count()
    }

    fn next_victim(&self) -> usize {
        let mut current = self.seed.load(Ordering::Relaxed);
        loop {
            let mut next = current;
            next ^= next << 13;
            next ^= next >> 17;
            next ^= next << 5;
            match self.seed.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next as usize % SLOT_COUNT,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for SoftwareTlb {
    fn default() -> Self {
        Self::new()
    }
}

impl TranslationCache for SoftwareTlb {
    const SLOTS: usize = SLOT_COUNT;

    fn write(&self, slot: usize, hi: u32, lo: u32) {
        assert!(slot < SLOT_COUNT, "translation cache slot out of bounds");
        debug_assert!(
            !crate::arch::interrupts_enabled(),
            "translation cache written with interrupts enabled"
        );
        self.slots.lock()[slot] = (hi, lo);
    }

    fn read(&self, slot: usize) -> (u32, u32) {
        assert!(slot < SLOT_COUNT, "translation cache slot out of bounds");
        self.slots.lock()[slot]
    }

    fn write_random(&self, hi: u32, lo: u32) {
        let slot = self.next_victim();
        self.write(slot, hi, lo);
    }

    fn probe(&self, hi: u32) -> Option<usize> {
        self.slots.lock().iter().position(|(entry_hi, _)| *entry_hi == hi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::without_interrupts;

    #[test]
    fn starts_invalid() {
        let tlb = SoftwareTlb::new();
        assert_eq!(tlb.valid_count(), 0);
        assert_eq!(tlb.read(3), (invalid_hi(3), invalid_lo()));
    }

    #[test]
    fn random_write_lands_somewhere() {
        let tlb = SoftwareTlb::new();
        without_interrupts(|| tlb.write_random(0x1040, 0x5200));
        let slot = tlb.probe(0x1040).unwrap();
        assert_eq!(tlb.read(slot), (0x1040, 0x5200));
        assert_eq!(tlb.valid_count(), 1);
    }

    #[test]
    fn invalidate_restores_invalid_entry() {
        let tlb = SoftwareTlb::new();
        without_interrupts(|| {
            tlb.write(7, 0x1040, 0x5200);
            tlb.invalidate(7);
        });
        assert_eq!(tlb.read(7), (invalid_hi(7), invalid_lo()));
    }

    #[test]
    fn victims_spread_across_slots() {
        let tlb = SoftwareTlb::with_seed(42);
        let mut seen = [false; SLOT_COUNT];
        for _ in 0..4096 {
            seen[tlb.next_victim()] = true;
        }
        assert!(seen.iter().filter(|hit| **hit).count() > SLOT_COUNT / 2);
    }
}
