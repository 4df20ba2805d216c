//! Software model of the 32-bit MIPS-like board the kernel targets.
//!
//! The kernel proper never touches hardware directly; everything it needs
//! from the machine goes through this crate:
//!
//! - [`ram`]: the physical memory array and the kernel direct-mapped window
//! - [`tlb`]: the software-managed translation lookaside buffer
//! - [`intr`]: the interrupt-priority gate required around TLB operations
//! - [`disk`]: the page-granular backing-store device interface
//! - [`console`]: the text output hook
//!
//! On real silicon these would be MMIO, CP0 registers and cache ops; here
//! they are plain data structures so the kernel can be exercised on a host.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate bitflags;

pub mod console;
pub mod disk;
pub mod intr;
pub mod ram;
pub mod tlb;

/// Page size of the machine, in bytes.
pub const PAGE_SIZE: usize = 4096;
/// log2 of [`PAGE_SIZE`].
pub const PAGE_SIZE_BITS: usize = 12;
