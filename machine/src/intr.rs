//! Interrupt-priority gate.
//!
//! Raising the priority nests; the level drops back when every guard has
//! been dropped. The model only tracks the depth — there are no interrupt
//! sources to mask — but the kernel's TLB discipline is written against
//! this gate and the TLB entry points assert it.

use core::sync::atomic::{AtomicUsize, Ordering};

static DEPTH: AtomicUsize = AtomicUsize::new(0);

/// RAII handle for one raised-priority section.
pub struct IntrGuard(());

/// Raise the interrupt priority until the returned guard is dropped.
pub fn disable() -> IntrGuard {
    DEPTH.fetch_add(1, Ordering::SeqCst);
    IntrGuard(())
}

/// Whether any guard is currently live.
pub fn is_disabled() -> bool {
    DEPTH.load(Ordering::SeqCst) > 0
}

impl Drop for IntrGuard {
    fn drop(&mut self) {
        let prev = DEPTH.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "interrupt gate underflow");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Other tests in this binary may hold their own guards concurrently,
    // so only the raised state is asserted here.
    #[test]
    fn nesting() {
        let outer = disable();
        {
            let _inner = disable();
            assert!(is_disabled());
        }
        assert!(is_disabled());
        drop(outer);
    }
}
