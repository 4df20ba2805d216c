//! Virtual-memory core of the kernel.
//!
//! The important submodules:
//!
//! - [`mm`]: frame table, two-level page tables, address spaces, swap, and
//!   the page-fault and eviction paths
//! - [`syscall`]: the memory system calls (the break syscall lives here)
//! - [`config`]: layout constants of the user address space
//! - [`logging`]: the global logger, printing through the machine console
//!
//! The process table, file tables and trap dispatch live above this crate;
//! they reach the VM core through [`mm::vm::handle_fault`], the
//! `AddressSpace` API and [`mm::coremap::alloc_kpages`]. Booting is
//! explicit: bring the machine RAM up, then hand [`mm::init`] the paging
//! device.

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate log;

extern crate alloc;

#[macro_use]
extern crate bitflags;

#[macro_use]
pub mod console;
pub mod config;
pub mod logging;
pub mod mm;
pub mod syscall;
