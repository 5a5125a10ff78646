//! Interrupt-enable modeling.
//!
//! The spec's primitives flip interrupts off around every state transition.
//! On the hosted single-CPU model that maps to one global critical section:
//! holding an [`IntrGuard`] is "interrupts disabled", dropping it restores
//! the previous state. Nesting is allowed and restores like a saved flag.

use core::cell::Cell;

static INTR_LOCK: spin::Mutex<()> = spin::Mutex::new(());

thread_local! {
    static OFF_DEPTH: Cell<u32> = Cell::new(0);
}

/// Witness that interrupts are off on this CPU.
pub struct IntrGuard {
    _not_send: core::marker::PhantomData<*const ()>,
}

/// Disable interrupts, returning a guard that restores the saved state.
pub fn off() -> IntrGuard {
    OFF_DEPTH.with(|d| {
        if d.get() == 0 {
            core::mem::forget(INTR_LOCK.lock());
        }
        d.set(d.get() + 1);
    });
    IntrGuard {
        _not_send: core::marker::PhantomData,
    }
}

impl Drop for IntrGuard {
    fn drop(&mut self) {
        OFF_DEPTH.with(|d| {
            d.set(d.get() - 1);
            if d.get() == 0 {
                // SAFETY: this thread acquired INTR_LOCK in `off` and forgot
                // the guard; depth reaching zero means the outermost guard is
                // being dropped on the same thread.
                unsafe { INTR_LOCK.force_unlock() };
            }
        });
    }
}

/// Whether this thread currently holds the interrupt-off section.
pub fn is_off() -> bool {
    OFF_DEPTH.with(|d| d.get() > 0)
}
