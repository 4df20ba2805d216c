//! Physical memory array and the kernel direct-mapped window.
//!
//! The board exposes two boot-time facts to the kernel: how much physical
//! RAM exists ([`size`]) and where the pre-boot kernel image ends
//! ([`first_free`]). Physical addresses start at zero; the kernel reaches
//! any frame through the direct-mapped window, whose base is the host
//! address of the RAM array ([`kvaddr`]/[`paddr`] translate both ways).

use alloc::alloc::{alloc_zeroed, Layout};
use spin::Once;

use crate::PAGE_SIZE;

struct Ram {
    base: usize,
    frames: usize,
    reserved: usize,
}

static RAM: Once<Ram> = Once::new();

/// Power the memory system on: `total_frames` of RAM, the first
/// `reserved_frames` of which hold the kernel image and boot data.
///
/// Panics if called twice or if the sizes make no sense.
pub fn init(total_frames: usize, reserved_frames: usize) {
    assert!(total_frames > 0, "machine with no RAM");
    assert!(
        reserved_frames < total_frames,
        "kernel image covers all of RAM"
    );
    let mut fresh = false;
    RAM.call_once(|| {
        fresh = true;
        let bytes = total_frames * PAGE_SIZE;
        let layout = Layout::from_size_align(bytes, PAGE_SIZE).unwrap();
        // Leaked on purpose: physical RAM lives until power-off.
        let base = unsafe { alloc_zeroed(layout) } as usize;
        assert!(base != 0, "host refused to back physical RAM");
        Ram {
            base,
            frames: total_frames,
            reserved: reserved_frames,
        }
    });
    assert!(fresh, "RAM initialized twice");
}

fn ram() -> &'static Ram {
    RAM.get().expect("RAM accessed before machine::ram::init")
}

/// Exclusive top of physical RAM, in bytes.
pub fn size() -> usize {
    ram().frames * PAGE_SIZE
}

/// First byte of physical RAM not claimed by the pre-boot kernel image.
pub fn first_free() -> usize {
    ram().reserved * PAGE_SIZE
}

/// Base of the kernel direct-mapped window (physical address zero).
pub fn base() -> usize {
    ram().base
}

/// Translate a physical address into the kernel direct-mapped window.
pub fn kvaddr(pa: usize) -> usize {
    let r = ram();
    debug_assert!(pa < r.frames * PAGE_SIZE, "pa {:#x} beyond RAM", pa);
    r.base + pa
}

/// Translate a kernel-window address back to its physical address.
pub fn paddr(kva: usize) -> usize {
    let r = ram();
    let pa = kva.wrapping_sub(r.base);
    assert!(pa < r.frames * PAGE_SIZE, "kva {:#x} outside the window", kva);
    pa
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_round_trips() {
        init(32, 4);
        assert_eq!(size(), 32 * PAGE_SIZE);
        assert_eq!(first_free(), 4 * PAGE_SIZE);
        let pa = 7 * PAGE_SIZE + 123;
        assert_eq!(paddr(kvaddr(pa)), pa);
    }
}
