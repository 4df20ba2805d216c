//! Constants in the kernel

/// page size : 4KB
pub const PAGE_SIZE: usize = 0x1000;
/// page size bits: 12
pub const PAGE_SIZE_BITS: usize = 0xc;
/// mask selecting the page part of an address
pub const PAGE_FRAME: usize = !(PAGE_SIZE - 1);
/// entries in a first-level page table (top 10 virtual-address bits)
pub const PT_L1_SIZE: usize = 1024;
/// entries in a second-level page table (next 10 bits)
pub const PT_L2_SIZE: usize = 1024;
/// first address of the kernel half of the address map; user addresses
/// live strictly below it
pub const USERSPACE_TOP: usize = 0x8000_0000;
/// top of the user stack; the stack grows downward from here
pub const USERSTACK: usize = USERSPACE_TOP;
/// pages reserved for the user stack (16 plus 2 so a 64 KiB argv fits)
pub const STACKPAGES: usize = 18;
/// bytes reserved for the user stack below [`USERSTACK`]
pub const STACK_RESERVE: usize = STACKPAGES * PAGE_SIZE;
