//! Page-fault handling and the eviction engine.
//!
//! Faults arrive here with a fault type and the faulting address. The
//! handler classifies the address against the current address space,
//! materializes the page (zero fill or swap-in) and installs a TLB entry.
//! When the frame table runs dry, [`evict_page`] picks a victim with a
//! second-chance clock sweep, writes it to swap and hands the frame back.
//!
//! Lock discipline: the frame-table and swap locks are spinning and are
//! never held across anything that can block; entry locks are the blocking
//! class. The engine only ever `try_lock`s entry locks, so it cannot be
//! drawn into a cycle with fault handlers or fork copies that already hold
//! one.

use alloc::sync::Arc;

use lazy_static::*;
use machine::intr;
use machine::tlb;
use spin::Mutex;

use crate::config::{PAGE_FRAME, USERSPACE_TOP};

use super::address::{PhysAddr, PhysPageNum, VirtAddr};
use super::addrspace::AddressSpace;
use super::page_table::PageState;
use super::{coremap, swap, VmError};

/// What the MMU reported about a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultType {
    /// A read was attempted
    Read,
    /// A write was attempted
    Write,
    /// A write to a readonly page was attempted
    ReadonlyWrite,
}

lazy_static! {
    /// The address space translations currently resolve against.
    static ref CURRENT: Mutex<Option<Arc<AddressSpace>>> = Mutex::new(None);
}

/// The current address space, if any.
pub fn current_space() -> Option<Arc<AddressSpace>> {
    CURRENT.lock().clone()
}

pub(super) fn set_current(space: Option<Arc<AddressSpace>>) {
    *CURRENT.lock() = space;
}

/// Detach the current address space without installing a new one, and
/// drop every cached translation. Used when a process dies.
pub fn clear_current() {
    set_current(None);
    flush_tlb();
}

/// Invalidate every TLB slot.
pub(super) fn flush_tlb() {
    let _gate = intr::disable();
    for slot in 0..tlb::NUM_TLB {
        tlb::write_indexed(slot, tlb::invalid_hi(slot), tlb::INVALID_LO);
    }
}

/// Drop the cached translation for one page, if present.
pub(super) fn tlb_invalidate(vaddr: VirtAddr) {
    let _gate = intr::disable();
    if let Some(slot) = tlb::probe(vaddr.0 & PAGE_FRAME) {
        tlb::write_indexed(slot, tlb::invalid_hi(slot), tlb::INVALID_LO);
    }
}

/// Cross-processor TLB invalidation.
///
/// The VM core assumes a single CPU: eviction invalidates the local TLB
/// only. Wire this up before running more than one processor.
pub fn tlb_shootdown(_vaddr: VirtAddr) {
    panic!("tlb_shootdown: not yet implemented");
}

fn install_tlb(va: VirtAddr, pfn: PhysPageNum, readonly: bool) {
    let mut flags = tlb::EntryLoFlags::VALID;
    if !readonly {
        flags |= tlb::EntryLoFlags::DIRTY;
    }
    let _gate = intr::disable();
    tlb::write_random(va.0, tlb::entrylo(pfn.0, flags));
}

/// Handle one translation fault against the current address space.
pub fn handle_fault(faulttype: FaultType, vaddr: VirtAddr) -> Result<(), VmError> {
    let fault_page = VirtAddr(vaddr.0 & PAGE_FRAME);
    if fault_page.0 >= USERSPACE_TOP {
        return Err(VmError::InvalidAddress);
    }

    let space = current_space().ok_or(VmError::InvalidAddress)?;

    // No copy-on-write: a readonly trap is a real permission error.
    if faulttype == FaultType::ReadonlyWrite {
        return Err(VmError::Permission);
    }

    let region_readonly = space
        .lookup_readonly(fault_page)
        .ok_or(VmError::InvalidAddress)?;

    // Non-allocating lookup first; first touch creates the entry.
    let pte = match space.get_pte(fault_page, false) {
        Some(pte) => pte,
        None => {
            let pte = space
                .get_pte(fault_page, true)
                .ok_or(VmError::OutOfMemory)?;
            let mut data = pte.lock();
            assert_eq!(data.state, PageState::Unalloc);
            data.state = PageState::Zero;
            data.readonly = region_readonly;
            drop(data);
            pte
        }
    };

    let mut data = pte.lock();
    // The stored flag wins: prepare_load/complete_load may have
    // overridden the region permissions.
    match data.state {
        PageState::Ram { pfn } => {
            data.referenced = true;
            install_tlb(fault_page, pfn, data.readonly);
            Ok(())
        }
        PageState::Swap { slot } => {
            // Bring the page back in. Allocation may itself evict; the
            // entry lock stays held, which is safe because the engine
            // never blocks on entry locks.
            let pfn = coremap::alloc_upage(&space, fault_page).ok_or(VmError::OutOfMemory)?;
            if let Err(e) = swap::read_in(PhysAddr::from(pfn), slot) {
                coremap::free_upage(pfn);
                return Err(e);
            }
            swap::free_slot(slot);
            data.state = PageState::Ram { pfn };
            data.referenced = true;
            install_tlb(fault_page, pfn, data.readonly);
            Ok(())
        }
        PageState::Unalloc | PageState::Zero => {
            // Zero fill. The entry lock is held across the allocation, so
            // a concurrent fault on the same page waits here and then
            // finds the page resident; racing installs cannot happen.
            let pfn = coremap::alloc_upage(&space, fault_page).ok_or(VmError::OutOfMemory)?;
            pfn.get_bytes_array().fill(0);
            data.state = PageState::Ram { pfn };
            data.referenced = true;
            install_tlb(fault_page, pfn, data.readonly);
            Ok(())
        }
    }
}

/// One full second-chance sweep: prefer an unreferenced user frame,
/// clearing reference bits along the way; settle for any user frame.
fn select_victim() -> Option<(PhysPageNum, Arc<AddressSpace>, VirtAddr)> {
    let total = coremap::frame_count();

    for _ in 0..total {
        let (pfn, owner, vpn) = coremap::clock_next()?;
        let Some(space) = owner.upgrade() else {
            // owner already tearing down; its frames are on their way out
            continue;
        };
        let va = VirtAddr::from(vpn);
        let Some(pte) = space.get_pte(va, false) else {
            continue;
        };
        let Some(mut data) = pte.try_lock() else {
            continue;
        };
        if !matches!(data.state, PageState::Ram { pfn: p } if p == pfn) {
            continue;
        }
        if data.referenced {
            // second chance
            data.referenced = false;
            continue;
        }
        return Some((pfn, space, va));
    }

    // Second pass: everything was referenced, take what the hand finds.
    for _ in 0..total {
        let (pfn, owner, vpn) = coremap::clock_next()?;
        if let Some(space) = owner.upgrade() {
            return Some((pfn, space, VirtAddr::from(vpn)));
        }
    }
    None
}

/// Push one user page out to swap and return the freed frame.
///
/// Transient collisions (another evictor claimed the frame first, or the
/// victim's entry lock is contended) surface as [`VmError::Busy`]; the
/// allocator retries once. Any failure after the frame is claimed puts it
/// back to `User` — the page is still resident and still owned.
pub fn evict_page() -> Result<PhysPageNum, VmError> {
    let (pfn, space, va) = select_victim().ok_or(VmError::OutOfMemory)?;

    coremap::mark_evicting(pfn, &space, va.floor())?;

    let pte = space
        .get_pte(va, false)
        .expect("victim entry vanished while its table was pinned");
    let Some(mut data) = pte.try_lock() else {
        coremap::eviction_aborted(pfn);
        return Err(VmError::Busy);
    };

    if !matches!(data.state, PageState::Ram { pfn: p } if p == pfn) {
        // The owner dropped the page after we claimed the frame; its
        // free_upage deferred the final transition to us.
        drop(data);
        coremap::eviction_finished(pfn);
        return Ok(pfn);
    }

    let slot = match swap::alloc_slot() {
        Ok(slot) => slot,
        Err(e) => {
            drop(data);
            coremap::eviction_aborted(pfn);
            return Err(e);
        }
    };

    if let Err(e) = swap::write_out(PhysAddr::from(pfn), slot) {
        swap::free_slot(slot);
        drop(data);
        coremap::eviction_aborted(pfn);
        return Err(e);
    }

    // Single CPU: only the local TLB can hold this translation.
    tlb_invalidate(va);

    data.state = PageState::Swap { slot };
    drop(data);
    coremap::eviction_finished(pfn);

    debug!("evicted {:?} of {:?} to slot {}", va, pfn, slot);
    Ok(pfn)
}
