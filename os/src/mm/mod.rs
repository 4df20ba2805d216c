//! Memory management implementation
//!
//! Demand-paged virtual memory for a 32-bit machine with a
//! software-managed TLB. Everything about memory management — the frame
//! table, the two-level page tables, address spaces, the swap store and
//! the page-fault and eviction paths — is implemented here.
//!
//! Every process owns an [`AddressSpace`]; faults arrive through
//! [`vm::handle_fault`] and are satisfied by zero-fill or swap-in,
//! evicting a resident user page when physical memory runs out.

pub mod address;
pub mod addrspace;
pub mod coremap;
pub mod page_table;
pub mod swap;
pub mod vm;

use alloc::sync::Arc;
use core::fmt;

use machine::disk::PageDisk;

pub use address::{
    KernelAddr, PhysAddr, PhysPageNum, StepByOne, VPNRange, VirtAddr, VirtPageNum,
};
pub use addrspace::{AddressSpace, MapPermission, Region};
pub use coremap::{alloc_kpages, free_kpages};
pub use vm::{handle_fault, FaultType};

/// Kind-level errors the VM core reports to its callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No frame or page-table storage could be obtained, even after eviction.
    OutOfMemory,
    /// No swap slot available.
    OutOfSwap,
    /// Fault on the kernel window, an unmapped address, or heap underflow.
    InvalidAddress,
    /// Write fault on a readonly resident page.
    Permission,
    /// Backing-store I/O failure during swap-in or swap-out.
    DeviceError,
    /// Concurrent eviction on the same frame; transient.
    Busy,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            VmError::OutOfMemory => "out of memory",
            VmError::OutOfSwap => "out of swap",
            VmError::InvalidAddress => "invalid address",
            VmError::Permission => "permission denied",
            VmError::DeviceError => "backing store I/O error",
            VmError::Busy => "frame busy",
        };
        f.write_str(msg)
    }
}

/// initiate the frame table and the swap store, in boot order
pub fn init(swap_disk: Arc<dyn PageDisk>) {
    debug!("frame table initialize");
    coremap::init();
    debug!("swap store initialize");
    swap::init(swap_disk);
}
