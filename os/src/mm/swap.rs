//! Swap store: slot accounting over the paging device.
//!
//! The device is divided into page-sized slots; a word-scanning bitmap
//! tracks which are taken. The bitmap starts empty at every boot — slots
//! do not persist. Slot bookkeeping happens under the one spinning lock;
//! the page transfers themselves run with the lock released, since device
//! I/O can block.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use lazy_static::*;
use machine::disk::PageDisk;
use spin::Mutex;

use crate::config::PAGE_SIZE;

use super::address::{PhysAddr, PhysPageNum};
use super::VmError;

struct SwapMap {
    disk: Arc<dyn PageDisk>,
    slots: usize,
    /// one bit per slot, 1 = taken
    map: Vec<u64>,
    used: usize,
}

lazy_static! {
    static ref SWAP: Mutex<Option<SwapMap>> = Mutex::new(None);
}

/// Attach the paging device and build the slot bitmap.
///
/// Fatal if the device is missing its capacity or is already attached;
/// the kernel cannot run without backing store.
pub fn init(disk: Arc<dyn PageDisk>) {
    let slots = disk.size_pages();
    assert!(slots > 0, "swap device has no capacity");

    let words = (slots + 63) / 64;
    let mut map = vec![0u64; words];
    // Tail bits past the last real slot are permanently taken, so the
    // scan below never needs a bounds check.
    for bit in slots..words * 64 {
        map[bit / 64] |= 1 << (bit % 64);
    }

    let mut swap = SWAP.lock();
    assert!(swap.is_none(), "swap initialized twice");
    *swap = Some(SwapMap {
        disk,
        slots,
        map,
        used: 0,
    });
    info!("swap: {} slots ({} KiB)", slots, slots * PAGE_SIZE / 1024);
}

fn with_map<R>(f: impl FnOnce(&mut SwapMap) -> R) -> R {
    let mut guard = SWAP.lock();
    f(guard.as_mut().expect("swap used before init"))
}

/// Reserve one slot.
pub fn alloc_slot() -> Result<usize, VmError> {
    with_map(|s| {
        for (word_index, word) in s.map.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = word.trailing_ones() as usize;
                *word |= 1 << bit;
                s.used += 1;
                return Ok(word_index * 64 + bit);
            }
        }
        Err(VmError::OutOfSwap)
    })
}

/// Give a slot back.
pub fn free_slot(slot: usize) {
    with_map(|s| {
        assert!(slot < s.slots, "slot {} beyond swap", slot);
        let (word, bit) = (slot / 64, slot % 64);
        assert!(s.map[word] & (1 << bit) != 0, "slot {} double freed", slot);
        s.map[word] &= !(1 << bit);
        s.used -= 1;
    })
}

/// Number of slots currently reserved. Diagnostics only.
pub fn used_slots() -> usize {
    with_map(|s| s.used)
}

fn disk_for(slot: usize) -> Arc<dyn PageDisk> {
    with_map(|s| {
        assert!(slot < s.slots, "slot {} beyond swap", slot);
        s.disk.clone()
    })
}

/// Write the frame at `paddr` into `slot`. Blocks on device I/O.
pub fn write_out(paddr: PhysAddr, slot: usize) -> Result<(), VmError> {
    let disk = disk_for(slot);
    let bytes = PhysPageNum::from(paddr).get_bytes_array();
    let buf: &[u8; PAGE_SIZE] = (&bytes[..]).try_into().unwrap();
    disk.write_page(slot, buf).map_err(|e| {
        error!("swap: write of slot {} failed: {:?}", slot, e);
        VmError::DeviceError
    })
}

/// Read `slot` into the frame at `paddr`. Blocks on device I/O.
pub fn read_in(paddr: PhysAddr, slot: usize) -> Result<(), VmError> {
    let disk = disk_for(slot);
    let bytes = PhysPageNum::from(paddr).get_bytes_array();
    let buf: &mut [u8; PAGE_SIZE] = (&mut bytes[..]).try_into().unwrap();
    disk.read_page(slot, buf).map_err(|e| {
        error!("swap: read of slot {} failed: {:?}", slot, e);
        VmError::DeviceError
    })
}
