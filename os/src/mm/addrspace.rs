//! Address Space [`AddressSpace`] management of Process

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::config::{PAGE_FRAME, PAGE_SIZE, PT_L1_SIZE, PT_L2_SIZE, STACK_RESERVE, USERSTACK};

use super::address::{PhysAddr, VPNRange, VirtAddr, VirtPageNum};
use super::page_table::{L2Table, PageState, PteRef};
use super::{coremap, swap, vm, VmError};

bitflags! {
    /// access permissions of a region
    pub struct MapPermission: u8 {
        ///Readable
        const R = 1 << 1;
        ///Writable
        const W = 1 << 2;
        ///Excutable
        const X = 1 << 3;
    }
}

/// One mapped range of user virtual addresses.
#[derive(Clone)]
pub struct Region {
    /// base virtual address, page aligned
    pub vbase: VirtAddr,
    /// number of pages
    pub npages: usize,
    /// access permissions; only writability feeds the fault path
    pub perm: MapPermission,
}

impl Region {
    fn contains(&self, va: VirtAddr) -> bool {
        let start = self.vbase.0;
        let end = start + self.npages * PAGE_SIZE;
        (start..end).contains(&va.0)
    }
}

type L1Table = Box<[Option<Arc<L2Table>>]>;

struct AsInner {
    /// first-level table, lazily materialized on first access
    l1: Option<L1Table>,
    regions: Vec<Region>,
    heap_start: VirtAddr,
    /// current break
    heap_end: VirtAddr,
}

/// address space
///
/// The structural lock guards the page-table pointers and the heap range
/// only; per-page state lives behind each entry's own lock, reached
/// through [`AddressSpace::get_pte`].
pub struct AddressSpace {
    inner: Mutex<AsInner>,
}

impl AddressSpace {
    /// Create a new empty address space: no page table, no regions, heap
    /// range zeroed.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(AsInner {
                l1: None,
                regions: Vec::new(),
                heap_start: VirtAddr(0),
                heap_end: VirtAddr(0),
            }),
        })
    }

    fn lookup(&self, l1_index: usize, l2_index: usize) -> Option<PteRef> {
        let inner = self.inner.lock();
        let l1 = inner.l1.as_ref()?;
        let l2 = l1[l1_index].as_ref()?;
        Some(PteRef::new(l2.clone(), l2_index))
    }

    /// Find the page-table entry covering `vaddr`.
    ///
    /// With `create` both table levels are materialized as needed and the
    /// entry always exists on return. The entry's own lock is not taken;
    /// callers acquire it afterwards, once the structural lock is long
    /// released.
    pub fn get_pte(&self, vaddr: VirtAddr, create: bool) -> Option<PteRef> {
        let [l1_index, l2_index] = vaddr.floor().indexes();
        if let Some(pte) = self.lookup(l1_index, l2_index) {
            return Some(pte);
        }
        if !create {
            return None;
        }

        // Materialize the missing levels. Allocation happens outside the
        // structural lock; whoever loses the install race drops its copy.
        {
            let needs_l1 = self.inner.lock().l1.is_none();
            if needs_l1 {
                let fresh: L1Table = (0..PT_L1_SIZE).map(|_| None).collect();
                let mut inner = self.inner.lock();
                if inner.l1.is_none() {
                    inner.l1 = Some(fresh);
                }
            }
        }
        self.alloc_l2(l1_index);
        self.lookup(l1_index, l2_index)
    }

    /// Ensure the second-level table for `l1_index` exists.
    ///
    /// Same double-checked install as the first level; bulk walkers (the
    /// fork copy) call this directly.
    pub fn alloc_l2(&self, l1_index: usize) {
        {
            let inner = self.inner.lock();
            let l1 = inner.l1.as_ref().expect("second level before first");
            if l1[l1_index].is_some() {
                return;
            }
        }
        let fresh = L2Table::new();
        let mut inner = self.inner.lock();
        let l1 = inner.l1.as_mut().expect("second level before first");
        if l1[l1_index].is_none() {
            l1[l1_index] = Some(fresh);
        }
    }

    /// Readonly flag a fault at `va` should carry, or `None` when the
    /// address is outside every region and the heap.
    pub(super) fn lookup_readonly(&self, va: VirtAddr) -> Option<bool> {
        let inner = self.inner.lock();
        if let Some(reg) = inner.regions.iter().find(|r| r.contains(va)) {
            return Some(!reg.perm.contains(MapPermission::W));
        }
        // Heap pages are always writable.
        if (inner.heap_start.0..inner.heap_end.0).contains(&va.0) {
            return Some(false);
        }
        None
    }

    /// Set up a region of memory within the address space.
    ///
    /// Base and size are page-rounded the way the loader expects: the size
    /// grows by the base's page offset, the base is truncated. The heap is
    /// placed just past the highest region defined so far.
    pub fn define_region(&self, vaddr: VirtAddr, size: usize, perm: MapPermission) {
        let size = size + vaddr.page_offset();
        let vbase = VirtAddr(vaddr.0 & PAGE_FRAME);
        let npages = (size + PAGE_SIZE - 1) / PAGE_SIZE;

        let mut inner = self.inner.lock();
        inner.regions.insert(0, Region { vbase, npages, perm });

        let region_end = VirtAddr(vbase.0 + npages * PAGE_SIZE);
        if inner.heap_start.0 == 0 || region_end.0 > inner.heap_start.0 {
            inner.heap_start = region_end;
            inner.heap_end = region_end;
        }
    }

    fn regions_snapshot(&self) -> Vec<Region> {
        self.inner.lock().regions.clone()
    }

    /// Make every region page loadable: entries exist and are writable
    /// zero pages, so the loader can fill text and rodata.
    pub fn prepare_load(&self) {
        for reg in self.regions_snapshot() {
            let end = VirtAddr(reg.vbase.0 + reg.npages * PAGE_SIZE);
            for vpn in VPNRange::new(reg.vbase.floor(), end.floor()) {
                let pte = self
                    .get_pte(vpn.into(), true)
                    .expect("created entry missing");
                let mut data = pte.lock();
                assert!(
                    matches!(data.state, PageState::Unalloc | PageState::Zero),
                    "prepare_load on a materialized page {:?}",
                    vpn
                );
                data.state = PageState::Zero;
                // leave writable during load, override later
                data.readonly = false;
            }
        }
    }

    /// Restore the real region permissions once loading is done. Any later
    /// write fault on a readonly resident page is a true permission error.
    pub fn complete_load(&self) {
        for reg in self.regions_snapshot() {
            let readonly = !reg.perm.contains(MapPermission::W);
            let end = VirtAddr(reg.vbase.0 + reg.npages * PAGE_SIZE);
            for vpn in VPNRange::new(reg.vbase.floor(), end.floor()) {
                // must already exist if prepare_load succeeded
                let Some(pte) = self.get_pte(vpn.into(), false) else {
                    continue;
                };
                let mut data = pte.lock();
                assert!(
                    matches!(data.state, PageState::Zero | PageState::Ram { .. }),
                    "complete_load on {:?} in {:?}",
                    vpn,
                    data.state
                );
                data.readonly = readonly;
            }
        }
    }

    /// Set up the stack region and hand back the initial stack pointer.
    ///
    /// The stack is an ordinary region below [`USERSTACK`]; it does not
    /// move the heap, so the prior heap range is put back afterwards.
    pub fn define_stack(&self) -> usize {
        let (heap_start, heap_end) = {
            let inner = self.inner.lock();
            (inner.heap_start, inner.heap_end)
        };
        self.define_region(
            VirtAddr(USERSTACK - STACK_RESERVE),
            STACK_RESERVE,
            MapPermission::R | MapPermission::W,
        );
        let mut inner = self.inner.lock();
        inner.heap_start = heap_start;
        inner.heap_end = heap_end;
        USERSTACK
    }

    /// Make this the current address space and drop every cached
    /// translation.
    pub fn activate(self: &Arc<Self>) {
        vm::set_current(Some(self.clone()));
        vm::flush_tlb();
    }

    /// Nothing to do: [`AddressSpace::activate`] already invalidates the
    /// TLB.
    pub fn deactivate(&self) {}

    /// Second-level tables currently populated, top level first.
    fn populated_l2s(&self) -> Vec<(usize, Arc<L2Table>)> {
        let inner = self.inner.lock();
        match inner.l1.as_ref() {
            None => Vec::new(),
            Some(l1) => l1
                .iter()
                .enumerate()
                .filter_map(|(i, slot)| slot.as_ref().map(|l2| (i, l2.clone())))
                .collect(),
        }
    }

    /// Create a new address space by copying everything from an existing
    /// one: regions, heap range, page-table shape, and page contents.
    ///
    /// Resident pages are copied into freshly allocated frames; swapped
    /// pages are duplicated slot-to-slot through a temporary frame; zero
    /// and untouched pages copy as themselves. For every page the source
    /// entry lock is taken before the destination's, so concurrent copies
    /// cannot deadlock against each other.
    pub fn from_existed(src: &Arc<AddressSpace>) -> Result<Arc<AddressSpace>, VmError> {
        let new = AddressSpace::new();
        {
            let src_inner = src.inner.lock();
            let mut new_inner = new.inner.lock();
            new_inner.regions = src_inner.regions.clone();
            new_inner.heap_start = src_inner.heap_start;
            new_inner.heap_end = src_inner.heap_end;
        }

        let tables = src.populated_l2s();
        if !tables.is_empty() {
            new.inner.lock().l1 = Some((0..PT_L1_SIZE).map(|_| None).collect());
        }
        for (l1_index, src_l2) in tables {
            new.alloc_l2(l1_index);
            let dst_l2 = new
                .inner
                .lock()
                .l1
                .as_ref()
                .and_then(|l1| l1[l1_index].clone())
                .expect("second level just created");

            for l2_index in 0..PT_L2_SIZE {
                let src_pte = PteRef::new(src_l2.clone(), l2_index);
                let dst_pte = PteRef::new(dst_l2.clone(), l2_index);
                let va = VirtAddr::from(VirtPageNum(l1_index * PT_L2_SIZE + l2_index));

                // source before destination
                let src_data = src_pte.lock();
                let mut dst_data = dst_pte.lock();
                assert_eq!(dst_data.state, PageState::Unalloc);

                match src_data.state {
                    PageState::Unalloc => {}
                    PageState::Zero => {
                        dst_data.state = PageState::Zero;
                        dst_data.readonly = src_data.readonly;
                    }
                    PageState::Ram { pfn } => {
                        let new_pfn =
                            coremap::alloc_upage(&new, va).ok_or(VmError::OutOfMemory)?;
                        new_pfn
                            .get_bytes_array()
                            .copy_from_slice(pfn.get_bytes_array());
                        dst_data.state = PageState::Ram { pfn: new_pfn };
                        dst_data.readonly = src_data.readonly;
                        dst_data.referenced = src_data.referenced;
                        dst_data.dirty = src_data.dirty;
                    }
                    PageState::Swap { slot } => {
                        let new_slot = swap::alloc_slot()?;
                        // Bounce through a frame of our own; the source
                        // slot stays untouched.
                        let Some(tmp) = coremap::alloc_upage(&new, va) else {
                            swap::free_slot(new_slot);
                            return Err(VmError::OutOfMemory);
                        };
                        let copy = swap::read_in(PhysAddr::from(tmp), slot)
                            .and_then(|_| swap::write_out(PhysAddr::from(tmp), new_slot));
                        coremap::free_upage(tmp);
                        if let Err(e) = copy {
                            swap::free_slot(new_slot);
                            return Err(e);
                        }
                        dst_data.state = PageState::Swap { slot: new_slot };
                        dst_data.readonly = src_data.readonly;
                        dst_data.referenced = false;
                    }
                }
            }
        }
        Ok(new)
    }

    /// Extend or shrink the heap by `delta` bytes; returns the old break.
    ///
    /// Shrinking releases every page that lies wholly above the new break:
    /// resident frames go back to the frame table (and out of the TLB),
    /// swapped pages give up their slot.
    pub fn adjust_break(&self, delta: isize) -> Result<usize, VmError> {
        let page_up = |addr: usize| (addr + PAGE_SIZE - 1) & PAGE_FRAME;

        let (old_break, free_start, free_end) = {
            let mut inner = self.inner.lock();
            let old_break = inner.heap_end.0;
            if delta == 0 {
                return Ok(old_break);
            }
            if delta > 0 {
                let new_break = old_break
                    .checked_add(delta as usize)
                    .ok_or(VmError::OutOfMemory)?;
                if new_break > USERSTACK - STACK_RESERVE {
                    return Err(VmError::OutOfMemory);
                }
                inner.heap_end = VirtAddr(new_break);
                return Ok(old_break);
            }
            let dec = delta.unsigned_abs();
            if dec > old_break {
                return Err(VmError::InvalidAddress);
            }
            let new_break = old_break - dec;
            if new_break < inner.heap_start.0 {
                return Err(VmError::InvalidAddress);
            }
            inner.heap_end = VirtAddr(new_break);
            (old_break, page_up(new_break), page_up(old_break))
        };

        let mut va = free_start;
        while va < free_end {
            if let Some(pte) = self.get_pte(VirtAddr(va), false) {
                let mut data = pte.lock();
                match data.state {
                    PageState::Ram { pfn } => {
                        coremap::free_upage(pfn);
                        vm::tlb_invalidate(VirtAddr(va));
                    }
                    PageState::Swap { slot } => swap::free_slot(slot),
                    PageState::Zero | PageState::Unalloc => {}
                }
                data.state = PageState::Unalloc;
            }
            va += PAGE_SIZE;
        }
        Ok(old_break)
    }
}

impl Drop for AddressSpace {
    /// Give every owned resource back: resident frames to the frame
    /// table, swapped pages' slots to the swap store. Table storage and
    /// the entry locks die with the tables themselves.
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let Some(l1) = inner.l1.take() else { return };
        for l2 in l1.iter().flatten() {
            for l2_index in 0..PT_L2_SIZE {
                let pte = PteRef::new(l2.clone(), l2_index);
                let mut data = pte.lock();
                match data.state {
                    PageState::Ram { pfn } => coremap::free_upage(pfn),
                    PageState::Swap { slot } => swap::free_slot(slot),
                    PageState::Zero | PageState::Unalloc => {}
                }
                data.state = PageState::Unalloc;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // None of these touch the frame table, so they run without a machine.

    #[test]
    fn define_region_places_heap_above() {
        let space = AddressSpace::new();
        space.define_region(VirtAddr(0x40_0000), 2 * PAGE_SIZE, MapPermission::R);
        space.define_region(
            VirtAddr(0x50_0000),
            PAGE_SIZE,
            MapPermission::R | MapPermission::W,
        );
        assert_eq!(space.lookup_readonly(VirtAddr(0x40_0abc)), Some(true));
        assert_eq!(space.lookup_readonly(VirtAddr(0x50_0123)), Some(false));
        // heap begins where the highest region ends
        let inner = space.inner.lock();
        assert_eq!(inner.heap_start, VirtAddr(0x50_1000));
        assert_eq!(inner.heap_end, VirtAddr(0x50_1000));
    }

    #[test]
    fn unaligned_region_rounds_out() {
        let space = AddressSpace::new();
        space.define_region(VirtAddr(0x40_0800), PAGE_SIZE, MapPermission::R);
        // base truncated, size padded: both pages covered
        assert_eq!(space.lookup_readonly(VirtAddr(0x40_0000)), Some(true));
        assert_eq!(space.lookup_readonly(VirtAddr(0x40_1fff)), Some(true));
        assert_eq!(space.lookup_readonly(VirtAddr(0x40_2000)), None);
    }

    #[test]
    fn region_upper_bound_is_outside() {
        let space = AddressSpace::new();
        space.define_region(VirtAddr(0x40_0000), 2 * PAGE_SIZE, MapPermission::R);
        assert_eq!(space.lookup_readonly(VirtAddr(0x40_2000)), None);
    }

    #[test]
    fn heap_addresses_are_writable() {
        let space = AddressSpace::new();
        space.define_region(VirtAddr(0x40_0000), PAGE_SIZE, MapPermission::R);
        space.adjust_break(2 * PAGE_SIZE as isize).unwrap();
        assert_eq!(space.lookup_readonly(VirtAddr(0x40_1000)), Some(false));
        assert_eq!(space.lookup_readonly(VirtAddr(0x40_3000)), None);
    }

    #[test]
    fn get_pte_create_materializes_both_levels() {
        let space = AddressSpace::new();
        assert!(space.get_pte(VirtAddr(0x40_0000), false).is_none());
        let pte = space.get_pte(VirtAddr(0x40_0000), true).unwrap();
        assert_eq!(pte.lock().state, PageState::Unalloc);
        // same page resolves to the same entry now
        assert!(space.get_pte(VirtAddr(0x40_0abc), false).is_some());
        // a different second-level table is still absent
        assert!(space.get_pte(VirtAddr(0x7000_0000), false).is_none());
    }

    #[test]
    fn define_stack_keeps_heap_and_returns_top() {
        let space = AddressSpace::new();
        space.define_region(VirtAddr(0x40_0000), PAGE_SIZE, MapPermission::R);
        let sp = space.define_stack();
        assert_eq!(sp, USERSTACK);
        let inner = space.inner.lock();
        assert_eq!(inner.heap_start, VirtAddr(0x40_1000));
        assert_eq!(inner.heap_end, VirtAddr(0x40_1000));
        drop(inner);
        // the stack region itself is mapped and writable
        assert_eq!(
            space.lookup_readonly(VirtAddr(USERSTACK - PAGE_SIZE)),
            Some(false)
        );
    }

    #[test]
    fn prepare_then_complete_load_sets_readonly() {
        let space = AddressSpace::new();
        space.define_region(VirtAddr(0x40_0000), 2 * PAGE_SIZE, MapPermission::R);
        space.prepare_load();
        let pte = space.get_pte(VirtAddr(0x40_1000), false).unwrap();
        {
            let data = pte.lock();
            assert_eq!(data.state, PageState::Zero);
            assert!(!data.readonly, "pages stay writable during load");
        }
        space.complete_load();
        assert!(pte.lock().readonly);
    }

    #[test]
    fn grow_cannot_cross_stack_reserve() {
        let space = AddressSpace::new();
        space.define_region(VirtAddr(0x40_0000), PAGE_SIZE, MapPermission::R);
        let limit = USERSTACK - STACK_RESERVE - 0x40_1000;
        assert_eq!(
            space.adjust_break(limit as isize + 1),
            Err(VmError::OutOfMemory)
        );
        // exactly reaching the reserve is allowed
        assert_eq!(space.adjust_break(limit as isize), Ok(0x40_1000));
    }

    #[test]
    fn shrink_cannot_cross_heap_start() {
        let space = AddressSpace::new();
        space.define_region(VirtAddr(0x40_0000), PAGE_SIZE, MapPermission::R);
        space.adjust_break(PAGE_SIZE as isize).unwrap();
        assert_eq!(
            space.adjust_break(-2 * (PAGE_SIZE as isize)),
            Err(VmError::InvalidAddress)
        );
        // the failed call must not have moved the break
        assert_eq!(space.adjust_break(0), Ok(0x40_2000));
    }
}
