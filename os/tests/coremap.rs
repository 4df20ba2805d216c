//! Frame-table scenarios: contiguous kernel runs, fragmentation, and the
//! eviction-claim handshake.

mod common;

use os::config::PAGE_SIZE;
use os::mm::coremap;
use os::mm::{AddressSpace, KernelAddr, VirtAddr, VmError};

const RAM_FRAMES: usize = 256;
const RESERVED: usize = 8;
const SWAP_SLOTS: usize = 32;

fn boot() -> std::sync::MutexGuard<'static, ()> {
    common::boot(RAM_FRAMES, RESERVED, SWAP_SLOTS)
}

#[test]
fn kernel_run_round_trip() {
    let _m = boot();
    let before = coremap::stats();
    let used_before = coremap::used_bytes();

    let kva = coremap::alloc_kpages(4).expect("4 contiguous frames");
    assert_eq!(coremap::used_bytes(), used_before + 4 * PAGE_SIZE);
    let mid = coremap::stats();
    assert_eq!(mid.fixed, before.fixed + 4);
    assert_eq!(mid.free, before.free - 4);

    coremap::free_kpages(kva);
    assert_eq!(coremap::stats(), before);
    assert_eq!(coremap::used_bytes(), used_before);
}

#[test]
fn kernel_pages_come_back_zeroed() {
    let _m = boot();
    let kva = coremap::alloc_kpages(1).unwrap();
    let page = unsafe { core::slice::from_raw_parts_mut(usize::from(kva) as *mut u8, PAGE_SIZE) };
    assert!(page.iter().all(|&b| b == 0));
    page.fill(0xA5);
    coremap::free_kpages(kva);

    // Not necessarily the same frame, but whatever we get is clean.
    let kva = coremap::alloc_kpages(1).unwrap();
    let page = unsafe { core::slice::from_raw_parts(usize::from(kva) as *const u8, PAGE_SIZE) };
    assert!(page.iter().all(|&b| b == 0));
    coremap::free_kpages(kva);
}

#[test]
fn zero_page_request_fails() {
    let _m = boot();
    assert!(coremap::alloc_kpages(0).is_none());
}

#[test]
fn fragmented_memory_rejects_large_runs() {
    let _m = boot();

    // Take every free frame as single pages, then punch free holes of at
    // most 3 consecutive frames.
    let mut held: Vec<KernelAddr> = Vec::new();
    while let Some(kva) = coremap::alloc_kpages(1) {
        held.push(kva);
    }
    let mut freed = 0;
    for (i, &kva) in held.iter().enumerate() {
        if i % 4 != 3 {
            coremap::free_kpages(kva);
            freed += 1;
        }
    }
    assert!(freed >= 4, "machine too small for this scenario");

    // Plenty of free frames in total, but no run of four anywhere.
    assert!(coremap::alloc_kpages(4).is_none());
    // Single pages still come out of the holes.
    let one = coremap::alloc_kpages(1).expect("holes serve single pages");
    coremap::free_kpages(one);

    for (i, &kva) in held.iter().enumerate() {
        if i % 4 == 3 {
            coremap::free_kpages(kva);
        }
    }
}

#[test]
#[should_panic(expected = "non-head")]
fn freeing_run_interior_panics() {
    let _m = boot();
    let kva = coremap::alloc_kpages(2).unwrap();
    coremap::free_kpages(KernelAddr(usize::from(kva) + PAGE_SIZE));
}

#[test]
fn user_frame_round_trip() {
    let _m = boot();
    let before = coremap::stats();

    let space = AddressSpace::new();
    let pfn = coremap::alloc_upage(&space, VirtAddr(0x40_0000)).unwrap();
    let mid = coremap::stats();
    assert_eq!(mid.user, before.user + 1);

    coremap::free_upage(pfn);
    assert_eq!(coremap::stats(), before);
}

#[test]
fn evicting_frames_are_left_to_the_engine() {
    let _m = boot();
    let before = coremap::stats();

    let space = AddressSpace::new();
    let va = VirtAddr(0x40_0000);
    let pfn = coremap::alloc_upage(&space, va).unwrap();
    coremap::mark_evicting(pfn, &space, va.floor()).unwrap();

    // A second claim on the same frame is a transient collision.
    assert_eq!(
        coremap::mark_evicting(pfn, &space, va.floor()),
        Err(VmError::Busy)
    );

    // Backing out with the page untouched hands it back to the owner.
    coremap::eviction_aborted(pfn);
    assert_eq!(coremap::stats().user, before.user + 1);

    // The owner letting go mid-eviction defers to the engine: the frame
    // stays claimed for now and the abort completes the free.
    coremap::mark_evicting(pfn, &space, va.floor()).unwrap();
    coremap::free_upage(pfn);
    assert_eq!(coremap::stats().evicting, before.evicting + 1);
    coremap::eviction_aborted(pfn);

    assert_eq!(coremap::stats(), before);
}

#[test]
fn stats_partition_every_frame() {
    let _m = boot();
    let s = coremap::stats();
    assert_eq!(s.free + s.fixed + s.user + s.evicting, RAM_FRAMES);
    // The boot image and the frame table itself are wired.
    assert!(s.fixed > RESERVED);
}
