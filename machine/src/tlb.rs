//! Software-managed TLB.
//!
//! The MMU never walks page tables on this machine: every translation is
//! whatever the kernel last wrote into one of the [`NUM_TLB`] slots. A slot
//! pairs an entry-hi (the virtual page address) with an entry-lo (frame
//! number plus [`EntryLoFlags`]).
//!
//! Callers must hold the interrupt gate ([`crate::intr::disable`]) across
//! every probe-then-write pair; the entry points debug-assert it.

use spin::Mutex;

use crate::{intr, PAGE_SIZE};

/// Number of TLB slots.
pub const NUM_TLB: usize = 64;

const PAGE_FRAME: usize = !(PAGE_SIZE - 1);

bitflags! {
    /// entry-lo control bits.
    pub struct EntryLoFlags: usize {
        /// Translation may be used.
        const VALID = 1 << 9;
        /// Writes are permitted; without it a store raises a readonly fault.
        const DIRTY = 1 << 10;
    }
}

/// Build an entry-lo word from a physical frame number and flags.
pub fn entrylo(pfn: usize, flags: EntryLoFlags) -> usize {
    (pfn << crate::PAGE_SIZE_BITS) | flags.bits()
}

/// Physical frame number stored in an entry-lo word.
pub fn entrylo_pfn(elo: usize) -> usize {
    elo >> crate::PAGE_SIZE_BITS
}

/// Flag bits stored in an entry-lo word.
pub fn entrylo_flags(elo: usize) -> EntryLoFlags {
    EntryLoFlags::from_bits_truncate(elo)
}

/// entry-hi value that can never match a user address, unique per slot.
pub fn invalid_hi(slot: usize) -> usize {
    0x8000_0000 + slot * PAGE_SIZE
}

/// entry-lo value carrying no permissions and no frame.
pub const INVALID_LO: usize = 0;

struct Tlb {
    entries: [(usize, usize); NUM_TLB],
    seed: usize,
}

static TLB: Mutex<Tlb> = Mutex::new(Tlb {
    entries: [(0, 0); NUM_TLB],
    seed: 0x1BADB002,
});

impl Tlb {
    fn find(&self, ehi: usize) -> Option<usize> {
        self.entries.iter().position(|&(hi, _)| hi == ehi)
    }

    fn random_slot(&mut self) -> usize {
        self.seed = self.seed.wrapping_mul(1664525).wrapping_add(1013904223);
        (self.seed >> 16) % NUM_TLB
    }
}

/// Install a translation at a pseudo-random slot.
///
/// The model keeps at most one entry per virtual page: if `ehi` is already
/// present the existing slot is overwritten instead.
pub fn write_random(ehi: usize, elo: usize) {
    debug_assert!(intr::is_disabled(), "TLB write with interrupts enabled");
    debug_assert_eq!(ehi & !PAGE_FRAME, 0, "entry-hi not page aligned");
    let mut tlb = TLB.lock();
    let slot = tlb.find(ehi).unwrap_or_else(|| tlb.random_slot());
    tlb.entries[slot] = (ehi, elo);
}

/// Look up the slot holding a translation for `ehi`, if any.
pub fn probe(ehi: usize) -> Option<usize> {
    debug_assert!(intr::is_disabled(), "TLB probe with interrupts enabled");
    TLB.lock().find(ehi & PAGE_FRAME)
}

/// Overwrite a specific slot.
pub fn write_indexed(slot: usize, ehi: usize, elo: usize) {
    debug_assert!(intr::is_disabled(), "TLB write with interrupts enabled");
    assert!(slot < NUM_TLB);
    TLB.lock().entries[slot] = (ehi, elo);
}

/// Read a slot back. Diagnostic use.
pub fn read(slot: usize) -> (usize, usize) {
    debug_assert!(intr::is_disabled(), "TLB read with interrupts enabled");
    assert!(slot < NUM_TLB);
    TLB.lock().entries[slot]
}

#[cfg(test)]
mod tests {
    use super::*;

    // One TLB per machine: random writes from concurrent tests could land
    // in each other's slots, so these take turns.
    static SERIAL: spin::Mutex<()> = spin::Mutex::new(());

    #[test]
    fn random_write_then_probe() {
        let _serial = SERIAL.lock();
        let _gate = intr::disable();
        write_random(0x40_0000, entrylo(7, EntryLoFlags::VALID));
        let slot = probe(0x40_0abc).expect("translation present");
        let (hi, lo) = read(slot);
        assert_eq!(hi, 0x40_0000);
        assert_eq!(entrylo_pfn(lo), 7);
        assert!(entrylo_flags(lo).contains(EntryLoFlags::VALID));
        assert!(!entrylo_flags(lo).contains(EntryLoFlags::DIRTY));
    }

    #[test]
    fn one_entry_per_page() {
        let _serial = SERIAL.lock();
        let _gate = intr::disable();
        write_random(0x80_0000, entrylo(3, EntryLoFlags::VALID));
        write_random(0x80_0000, entrylo(9, EntryLoFlags::VALID | EntryLoFlags::DIRTY));
        let slot = probe(0x80_0000).unwrap();
        assert_eq!(entrylo_pfn(read(slot).1), 9);
        assert_eq!(
            TLB.lock()
                .entries
                .iter()
                .filter(|&&(hi, _)| hi == 0x80_0000)
                .count(),
            1
        );
    }

    #[test]
    fn indexed_invalidate_clears_probe() {
        let _serial = SERIAL.lock();
        let _gate = intr::disable();
        write_random(0xC0_0000, entrylo(5, EntryLoFlags::VALID));
        let slot = probe(0xC0_0000).unwrap();
        write_indexed(slot, invalid_hi(slot), INVALID_LO);
        assert!(probe(0xC0_0000).is_none());
    }
}
