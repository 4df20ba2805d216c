//! Implementation of [`PageState`], [`Pte`] and the second-level tables.
//!
//! A page-table entry records where a virtual page's contents live and is
//! guarded by its own lock, so two faults on different pages of the same
//! address space never serialize on each other. The entry lock is the only
//! lock in the VM core that may be held across allocation or device I/O;
//! it must never be taken while a spinning lock is held.

use alloc::sync::Arc;

use spin::{Mutex, MutexGuard};

use crate::config::PT_L2_SIZE;

use super::address::PhysPageNum;

/// Where the contents of one virtual page live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Never touched; any access forces allocation and zero fill.
    Unalloc,
    /// Logically a page of zeros; no frame materialized yet.
    Zero,
    /// Resident in the frame `pfn`.
    Ram {
        /// the owning frame
        pfn: PhysPageNum,
    },
    /// Paged out; contents live in swap slot `slot`.
    Swap {
        /// the owning backing-store slot
        slot: usize,
    },
}

/// Contents of one page-table entry.
pub struct PteData {
    /// backing state; a `Ram` entry owns its frame, a `Swap` entry its slot
    pub state: PageState,
    /// write faults on a resident readonly page are permission errors
    pub readonly: bool,
    /// second-chance bit, set on every successful fault installation
    pub referenced: bool,
    /// set when the page has been modified
    pub dirty: bool,
}

impl PteData {
    const fn new() -> Self {
        Self {
            state: PageState::Unalloc,
            readonly: false,
            referenced: false,
            dirty: false,
        }
    }
}

/// One page-table entry with its private lock.
pub struct Pte {
    data: Mutex<PteData>,
}

impl Pte {
    const fn new() -> Self {
        Self {
            data: Mutex::new(PteData::new()),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PteData> {
        self.data.lock()
    }

    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, PteData>> {
        self.data.try_lock()
    }
}

/// A second-level page table: [`PT_L2_SIZE`] entries, every one starting
/// out `Unalloc` with a fresh lock.
pub struct L2Table {
    ptes: [Pte; PT_L2_SIZE],
}

impl L2Table {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ptes: core::array::from_fn(|_| Pte::new()),
        })
    }
}

impl Default for L2Table {
    fn default() -> Self {
        Self {
            ptes: core::array::from_fn(|_| Pte::new()),
        }
    }
}

/// Handle to one page-table entry, independent of the structural lock.
///
/// Holding a `PteRef` keeps the second-level table alive, so the entry can
/// be locked and mutated long after the structural walk that found it.
pub struct PteRef {
    table: Arc<L2Table>,
    index: usize,
}

impl PteRef {
    pub(crate) fn new(table: Arc<L2Table>, index: usize) -> Self {
        debug_assert!(index < PT_L2_SIZE);
        Self { table, index }
    }

    /// Acquire this entry's lock.
    pub fn lock(&self) -> MutexGuard<'_, PteData> {
        self.table.ptes[self.index].lock()
    }

    /// Acquire this entry's lock only if it is uncontended.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, PteData>> {
        self.table.ptes[self.index].try_lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_start_unalloc() {
        let table = L2Table::new();
        for index in [0, 1, PT_L2_SIZE - 1] {
            let pte = PteRef::new(table.clone(), index);
            let data = pte.lock();
            assert_eq!(data.state, PageState::Unalloc);
            assert!(!data.readonly);
            assert!(!data.referenced);
        }
    }

    #[test]
    fn entry_locks_are_independent() {
        let table = L2Table::new();
        let a = PteRef::new(table.clone(), 0);
        let b = PteRef::new(table.clone(), 1);
        let held = a.lock();
        assert!(b.try_lock().is_some());
        assert!(a.try_lock().is_none());
        drop(held);
        assert!(a.try_lock().is_some());
    }
}
