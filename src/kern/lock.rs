//! Spin locks
//!
//! - [`SimpleLock`]: a raw test-and-set lock with explicit release, for
//!   holders that cannot keep a guard (the scheduling lock)
//! - [`SpinLock`]: data-owning spin lock for short critical sections
//! - [`InterruptSpinLock`]: spin lock that also masks interrupts on the local
//!   core, for state shared with interrupt handlers
//!
//! The scheduler-aware blocking lock lives in [`super::light_lock`].

use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use spin::mutex::{SpinMutex, SpinMutexGuard};

use crate::arch::Platform;

/// Data-owning spin lock
pub type SpinLock<T> = SpinMutex<T>;

/// Raw test-and-set lock
///
/// Acquire and release are separate calls, so the holder is responsible for
/// pairing them.
pub struct SimpleLock {
    held: AtomicBool,
}

impl SimpleLock {
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) {
        while !self.try_lock() {
            while self.held.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    pub fn try_lock(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn unlock(&self) {
        self.held.store(false, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }
}

impl core::fmt::Debug for SimpleLock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SimpleLock")
            .field("held", &self.is_locked())
            .finish()
    }
}

// ============================================================================
// Interrupt-masking Spin Lock
// ============================================================================

/// Spin lock that keeps interrupts masked on the holding core
///
/// A handler that takes the same lock can therefore never preempt a holder
/// on its own core.
pub struct InterruptSpinLock<T> {
    inner: SpinMutex<T>,
}

impl<T> InterruptSpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            inner: SpinMutex::new(data),
        }
    }

    pub fn lock<'a>(&'a self, platform: &'a dyn Platform) -> InterruptSpinLockGuard<'a, T> {
        let enabled = platform.disable_interrupts();
        InterruptSpinLockGuard {
            guard: Some(self.inner.lock()),
            platform,
            enabled,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

pub struct InterruptSpinLockGuard<'a, T> {
    guard: Option<SpinMutexGuard<'a, T>>,
    platform: &'a dyn Platform,
    enabled: bool,
}

impl<T> Deref for InterruptSpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.guard {
            Some(guard) => guard,
            None => unreachable!("interrupt spin lock guard used after release"),
        }
    }
}

impl<T> DerefMut for InterruptSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.guard {
            Some(guard) => guard,
            None => unreachable!("interrupt spin lock guard used after release"),
        }
    }
}

impl<T> Drop for InterruptSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // Unlock before unmasking so a pending handler can take the lock
        drop(self.guard.take());
        self.platform.restore_interrupts(self.enabled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::host::HostPlatform;

    #[test]
    fn test_simple_lock_exclusive() {
        let lock = SimpleLock::new();
        assert!(lock.try_lock());
        assert!(lock.is_locked());
        assert!(!lock.try_lock());
        lock.unlock();
        lock.lock();
        assert!(lock.is_locked());
        lock.unlock();
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_interrupt_lock_guards_data() {
        let platform = HostPlatform::new(1);
        let lock = InterruptSpinLock::new(alloc::vec::Vec::new());
        {
            let mut guard = lock.lock(&platform);
            guard.push(1u32);
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(&platform), alloc::vec![1]);
    }
}
