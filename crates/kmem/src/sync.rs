//! Interrupt-safe locking.
//!
//! Every piece of shared allocator state is reachable from interrupt handlers, so the
//! locks here disable local interrupts for as long as they are held. The previous
//! interrupt state is saved and restored, which makes it safe to take a lock from code
//! that already runs with interrupts off.

use core::ops::{Deref, DerefMut};

use spin::mutex::{TicketMutex, TicketMutexGuard};

use crate::arch;

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// Interrupts are re-enabled on drop only if they were enabled when the guard was
/// created.
pub struct InterruptGuard {
    were_enabled: bool,
}

impl InterruptGuard {
    /// Disables interrupts if they are currently enabled and remembers the state.
    #[must_use]
    pub fn new() -> Self {
        let were_enabled = arch::interrupts_enabled();
        if were_enabled {
            arch::disable_interrupts();
        }
        Self { were_enabled }
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            arch::enable_interrupts();
        }
    }
}

/// A ticket spinlock that keeps local interrupts disabled while held.
pub struct IrqSpinLock<T> {
    inner: TicketMutex<T>,
}

impl<T> IrqSpinLock<T> {
    /// Creates a new, unlocked lock.
    pub const fn new(value: T) -> Self {
        Self {
            inner: TicketMutex::new(value),
        }
    }

    /// Disables interrupts, then spins until the lock is acquired.
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        let irq = InterruptGuard::new();
        let guard = self.inner.lock();
        IrqSpinLockGuard { guard, _irq: irq }
    }

    /// Acquires the lock if it is free. Interrupts are left untouched on failure.
    pub fn try_lock(&self) -> Option<IrqSpinLockGuard<'_, T>> {
        let irq = InterruptGuard::new();
        let guard = self.inner.try_lock()?;
        Some(IrqSpinLockGuard { guard, _irq: irq })
    }

    /// Returns true if the lock is currently held.
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Returns a mutable reference to the protected value. No locking is needed since
    /// the borrow is exclusive.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

/// Guard returned by [`IrqSpinLock::lock`].
///
/// Fields drop in declaration order: the lock is released before interrupts are
/// restored.
pub struct IrqSpinLockGuard<'a, T> {
    guard: TicketMutexGuard<'a, T>,
    _irq: InterruptGuard,
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
