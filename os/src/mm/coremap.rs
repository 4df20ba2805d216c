//! Physical frame table.
//!
//! One entry per physical frame, stored inside RAM itself just above the
//! boot image. Kernel allocations are contiguous runs of `FIXED` frames
//! recorded at the head entry; user allocations are always single `USER`
//! frames carrying a weak back-reference to the owning address space so
//! the eviction engine can find the page's entry lock.
//!
//! Every mutation happens under the one spinning lock; nothing here may
//! sleep while holding it, and calls into the eviction engine are made
//! with the lock released.

use alloc::sync::{Arc, Weak};
use core::mem::size_of;

use lazy_static::*;
use spin::Mutex;

use crate::config::{PAGE_SIZE, PAGE_SIZE_BITS};

use super::address::{KernelAddr, PhysAddr, PhysPageNum, VirtAddr, VirtPageNum};
use super::addrspace::AddressSpace;
use super::{vm, VmError};

/// allocation state of one physical frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// available
    Free,
    /// kernel, frame table or other wired frame
    Fixed,
    /// owned by a user address space
    User,
    /// mid-eviction; no state change allowed until the engine finishes
    Evicting,
}

struct Frame {
    state: FrameState,
    /// run length if first frame of a kernel allocation; else 0
    chunk_len: u16,
    /// the owner freed this frame while it was mid-eviction; the engine
    /// completes the free when it lets go
    pending_free: bool,
    /// owning address space, lookup only (User/Evicting)
    owner: Option<Weak<AddressSpace>>,
    /// user virtual page number (User/Evicting)
    vpn: VirtPageNum,
}

struct Coremap {
    frames: &'static mut [Frame],
    /// clock hand of the second-chance scan
    clock: usize,
}

lazy_static! {
    static ref COREMAP: Mutex<Coremap> = Mutex::new(Coremap {
        frames: &mut [],
        clock: 0,
    });
}

/// Per-state frame counts, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoremapStats {
    pub free: usize,
    pub fixed: usize,
    pub user: usize,
    pub evicting: usize,
}

/// Build the frame table from the machine's RAM bounds.
///
/// The table itself is placed immediately above the boot image and the
/// frames it covers are wired, so the first truly free frame sits just
/// past the table. Panics on double initialization.
pub fn init() {
    let ram_top = machine::ram::size();
    let first_free = machine::ram::first_free();
    let total = ram_top / PAGE_SIZE;

    let table_bytes = total * size_of::<Frame>();
    let table_pages = (table_bytes + PAGE_SIZE - 1) / PAGE_SIZE;
    let free_base = first_free + table_pages * PAGE_SIZE;
    assert!(free_base < ram_top, "frame table leaves no free memory");

    let base = machine::ram::kvaddr(first_free) as *mut Frame;
    for i in 0..total {
        let state = if i * PAGE_SIZE < free_base {
            FrameState::Fixed
        } else {
            FrameState::Free
        };
        unsafe {
            base.add(i).write(Frame {
                state,
                chunk_len: 0,
                pending_free: false,
                owner: None,
                vpn: VirtPageNum(0),
            });
        }
    }

    let mut cm = COREMAP.lock();
    assert!(cm.frames.is_empty(), "coremap initialized twice");
    cm.frames = unsafe { core::slice::from_raw_parts_mut(base, total) };
    info!(
        "coremap: {} / {} pages free ({} KiB)",
        (ram_top - free_base) / PAGE_SIZE,
        total,
        (ram_top - free_base) / 1024
    );
}

impl Coremap {
    /// First index of a run of `npages` free frames, first fit.
    fn find_run(&self, npages: usize) -> Option<usize> {
        let total = self.frames.len();
        let mut i = 0;
        while i + npages <= total {
            if self.frames[i].state != FrameState::Free {
                i += 1;
                continue;
            }
            match (1..npages).find(|&j| self.frames[i + j].state != FrameState::Free) {
                // Skip past the allocated slice.
                Some(j) => i += j,
                None => return Some(i),
            }
        }
        None
    }

    fn clear(&mut self, idx: usize) {
        self.frames[idx] = Frame {
            state: FrameState::Free,
            chunk_len: 0,
            pending_free: false,
            owner: None,
            vpn: VirtPageNum(0),
        };
    }
}

fn try_alloc_kernel_run(npages: usize) -> Option<usize> {
    let mut cm = COREMAP.lock();
    let idx = cm.find_run(npages)?;
    cm.frames[idx].state = FrameState::Fixed;
    cm.frames[idx].chunk_len = npages as u16;
    for j in 1..npages {
        cm.frames[idx + j].state = FrameState::Fixed;
        cm.frames[idx + j].chunk_len = 0;
    }
    Some(idx)
}

/// Allocate `npages` contiguous kernel frames; returns their kernel-window
/// address.
///
/// Multi-page requests are served from free memory only: evicting
/// scattered user pages cannot produce a contiguous run. A single-page
/// request may reclaim one user page. Must be called where sleeping is
/// permitted.
pub fn alloc_kpages(npages: usize) -> Option<KernelAddr> {
    if npages == 0 {
        return None;
    }
    let idx = match try_alloc_kernel_run(npages) {
        Some(idx) => idx,
        None if npages == 1 => {
            evict_for_alloc()?;
            try_alloc_kernel_run(1)?
        }
        None => return None,
    };
    for j in 0..npages {
        PhysPageNum(idx + j).get_bytes_array().fill(0);
    }
    Some(KernelAddr::from(PhysAddr(idx << PAGE_SIZE_BITS)))
}

/// Free a kernel allocation by its head address.
///
/// Panics if the address is not the head of a live kernel run; that means
/// the frame table is corrupt.
pub fn free_kpages(kva: KernelAddr) {
    let pa = PhysAddr::from(kva);
    assert!(pa.aligned(), "free_kpages: unaligned {:?}", kva);
    let idx = pa.floor().0;

    let mut cm = COREMAP.lock();
    assert!(idx < cm.frames.len());
    if cm.frames[idx].state != FrameState::Fixed || cm.frames[idx].chunk_len == 0 {
        panic!("free_kpages: bad or non-head page @{}", idx);
    }
    let run = cm.frames[idx].chunk_len as usize;
    for j in 0..run {
        assert_eq!(cm.frames[idx + j].state, FrameState::Fixed);
        cm.clear(idx + j);
    }
}

/// Allocate one frame for user space, to be mapped at `vaddr` in `owner`.
///
/// Under pressure the eviction engine runs once (plus one retry after a
/// transient collision). Must be called where sleeping is permitted.
pub fn alloc_upage(owner: &Arc<AddressSpace>, vaddr: VirtAddr) -> Option<PhysPageNum> {
    if let Some(pfn) = try_alloc_upage(owner, vaddr) {
        return Some(pfn);
    }
    evict_for_alloc()?;
    try_alloc_upage(owner, vaddr)
}

fn try_alloc_upage(owner: &Arc<AddressSpace>, vaddr: VirtAddr) -> Option<PhysPageNum> {
    let mut cm = COREMAP.lock();
    let idx = cm.find_run(1)?;
    cm.frames[idx] = Frame {
        state: FrameState::User,
        chunk_len: 1,
        pending_free: false,
        owner: Some(Arc::downgrade(owner)),
        vpn: vaddr.floor(),
    };
    Some(PhysPageNum(idx))
}

fn evict_for_alloc() -> Option<()> {
    match vm::evict_page() {
        Ok(_) => Some(()),
        // One retry on a transient collision with another evictor.
        Err(VmError::Busy) => vm::evict_page().ok().map(|_| ()),
        Err(_) => None,
    }
}

/// Release one user frame.
///
/// A frame mid-eviction is left alone: the eviction engine owns the final
/// transition, so callers must not assume the frame is free on return.
pub fn free_upage(pfn: PhysPageNum) {
    let mut cm = COREMAP.lock();
    let idx = pfn.0;
    assert!(idx < cm.frames.len());

    if cm.frames[idx].state == FrameState::Evicting {
        // The engine completes the free whichever way the eviction ends.
        cm.frames[idx].pending_free = true;
        return;
    }

    assert_eq!(
        cm.frames[idx].state,
        FrameState::User,
        "free_upage: frame {} is not a user page",
        idx
    );
    assert_eq!(cm.frames[idx].chunk_len, 1);
    cm.clear(idx);
}

/// Claim a user frame for eviction (`User` -> `Evicting`).
///
/// The claim only lands if the frame still backs `vpn` of `owner`; a
/// frame that was freed and handed to someone else since the caller
/// looked is a transient `Busy`, never a claim on the new owner's page.
pub fn mark_evicting(
    pfn: PhysPageNum,
    owner: &Arc<AddressSpace>,
    vpn: VirtPageNum,
) -> Result<(), VmError> {
    let mut cm = COREMAP.lock();
    let idx = pfn.0;
    assert!(idx < cm.frames.len());
    let frame = &mut cm.frames[idx];
    let same_owner = frame
        .owner
        .as_ref()
        .map_or(false, |w| Weak::as_ptr(w) == Arc::as_ptr(owner));
    if frame.state != FrameState::User || !same_owner || frame.vpn != vpn {
        return Err(VmError::Busy);
    }
    frame.state = FrameState::Evicting;
    Ok(())
}

/// Complete an eviction (`Evicting` -> `Free`).
pub fn eviction_finished(pfn: PhysPageNum) {
    let mut cm = COREMAP.lock();
    let idx = pfn.0;
    assert!(idx < cm.frames.len());
    assert_eq!(cm.frames[idx].state, FrameState::Evicting);
    assert_eq!(cm.frames[idx].chunk_len, 1);
    cm.clear(idx);
}

/// Back out of an eviction (`Evicting` -> `User`).
///
/// The page is still resident and still owned, so the claim is dropped —
/// unless the owner freed the page while it was claimed, in which case
/// the deferred free happens here.
pub fn eviction_aborted(pfn: PhysPageNum) {
    let mut cm = COREMAP.lock();
    let idx = pfn.0;
    assert!(idx < cm.frames.len());
    assert_eq!(cm.frames[idx].state, FrameState::Evicting);
    if cm.frames[idx].pending_free {
        cm.clear(idx);
    } else {
        cm.frames[idx].state = FrameState::User;
    }
}

/// Next user frame under the clock hand, advancing the hand past it.
///
/// Returns the frame, its owner and the virtual page it backs; the caller
/// revalidates both once it holds the page's entry lock.
pub(super) fn clock_next() -> Option<(PhysPageNum, Weak<AddressSpace>, VirtPageNum)> {
    let mut cm = COREMAP.lock();
    let total = cm.frames.len();
    for _ in 0..total {
        let idx = cm.clock;
        cm.clock = (cm.clock + 1) % total;
        if cm.frames[idx].state == FrameState::User {
            let owner = cm.frames[idx]
                .owner
                .clone()
                .expect("user frame without an owner");
            return Some((PhysPageNum(idx), owner, cm.frames[idx].vpn));
        }
    }
    None
}

pub(super) fn frame_count() -> usize {
    COREMAP.lock().frames.len()
}

/// Total bytes not in the `Free` state. Diagnostics only: concurrent
/// allocations may change the value as soon as it is returned.
pub fn used_bytes() -> usize {
    let cm = COREMAP.lock();
    cm.frames
        .iter()
        .filter(|f| f.state != FrameState::Free)
        .count()
        * PAGE_SIZE
}

/// Per-state frame counts. Diagnostics only.
pub fn stats() -> CoremapStats {
    let cm = COREMAP.lock();
    let mut s = CoremapStats::default();
    for f in cm.frames.iter() {
        match f.state {
            FrameState::Free => s.free += 1,
            FrameState::Fixed => s.fixed += 1,
            FrameState::User => s.user += 1,
            FrameState::Evicting => s.evicting += 1,
        }
    }
    s
}

/// Print the frame accounting to the console.
pub fn dump() {
    let s = stats();
    println!(
        "coremap: {} pages total | {} free  {} kernel  {} user  {} evicting",
        s.free + s.fixed + s.user + s.evicting,
        s.free,
        s.fixed,
        s.user,
        s.evicting
    );
}
