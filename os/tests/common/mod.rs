//! Shared scaffolding for the VM scenario tests.
//!
//! The frame table, the swap map and the TLB are process-wide singletons,
//! so every test binary boots the simulated machine exactly once and its
//! tests take a shared guard to run one at a time. Test binaries pick
//! their own machine size: the eviction tests want RAM small enough to
//! thrash, the fault tests want room to breathe.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, MutexGuard, Once};

use machine::disk::MemDisk;
use machine::{intr, tlb};
use os::config::{PAGE_FRAME, PAGE_SIZE};
use os::mm::{self, FaultType, VirtAddr, VmError};

static BOOT: Once = Once::new();
static GATE: Mutex<()> = Mutex::new(());

fn console(s: &str) {
    print!("{s}");
}

/// Boot the machine (first caller wins) and serialize the caller against
/// the other tests in this binary.
pub fn boot(ram_frames: usize, reserved_frames: usize, swap_slots: usize) -> MutexGuard<'static, ()> {
    BOOT.call_once(|| {
        machine::console::set_output(console);
        os::logging::init();
        machine::ram::init(ram_frames, reserved_frames);
        mm::init(Arc::new(MemDisk::new(swap_slots)));
    });
    // A should_panic test may have poisoned the gate; the machine state
    // itself is fine.
    GATE.lock().unwrap_or_else(|e| e.into_inner())
}

fn probe_entrylo(va: usize) -> Option<usize> {
    let _gate = intr::disable();
    tlb::probe(va & PAGE_FRAME).map(|slot| tlb::read(slot).1)
}

/// Walk the TLB the way the MMU would and return the host address backing
/// `va`: misses fault, stores through a clean entry raise the readonly
/// fault. A handful of retries covers the benign refault paths.
fn translate(va: usize, write: bool) -> Result<usize, VmError> {
    for _ in 0..8 {
        match probe_entrylo(va) {
            Some(elo) if tlb::entrylo_flags(elo).contains(tlb::EntryLoFlags::VALID) => {
                if write && !tlb::entrylo_flags(elo).contains(tlb::EntryLoFlags::DIRTY) {
                    mm::handle_fault(FaultType::ReadonlyWrite, VirtAddr(va))?;
                    continue;
                }
                let pa = (tlb::entrylo_pfn(elo) * PAGE_SIZE) | (va & !PAGE_FRAME);
                return Ok(machine::ram::kvaddr(pa));
            }
            _ => {
                let kind = if write { FaultType::Write } else { FaultType::Read };
                mm::handle_fault(kind, VirtAddr(va))?;
            }
        }
    }
    panic!("translation of {va:#x} did not settle");
}

/// One emulated user-mode load.
pub fn user_read(va: usize) -> Result<u8, VmError> {
    let host = translate(va, false)?;
    Ok(unsafe { core::ptr::read_volatile(host as *const u8) })
}

/// One emulated user-mode store.
pub fn user_write(va: usize, byte: u8) -> Result<(), VmError> {
    let host = translate(va, true)?;
    unsafe { core::ptr::write_volatile(host as *mut u8, byte) };
    Ok(())
}
