//! Memory system calls.

use crate::mm::{vm, VmError};

/// Move the current address space's break by `amount` bytes and return
/// the old break.
///
/// Growing only moves the break — pages materialize on first touch.
/// Shrinking releases the vacated pages immediately. The user-mode
/// wrapper turns the error kinds into its own convention.
pub fn sys_sbrk(amount: isize) -> Result<usize, VmError> {
    let space = vm::current_space().ok_or(VmError::InvalidAddress)?;
    space.adjust_break(amount)
}
