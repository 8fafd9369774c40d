//! Lightweight blocking lock and condition variable
//!
//! [`LightLock`] is one atomic word in the uncontended case. The word holds
//! the owner's tag shifted left by one, with bit 0 set while threads are
//! queued behind the owner. Contended lockers join the lock's wait list under
//! the scheduling lock and sleep; unlock hands ownership straight to the
//! highest-priority waiter (oldest first among equals), so a woken thread
//! never has to race for the lock again.
//!
//! Contexts that are not kernel threads (interrupt bottom halves, early boot)
//! cannot sleep and spin instead.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, Ordering};

use super::scheduler::Scheduler;
use super::wait_queue::WaitKind;
use crate::types::{ObjectId, ThreadId, Timeout};

/// Tag bit marking an owner that is not a kernel thread
const CONTEXT_TAG: u64 = 1 << 62;

const WAITERS: u64 = 1;

fn owner_tag(scheduler: &Scheduler) -> (u64, Option<ThreadId>) {
    let platform = scheduler.platform();
    match platform.current_thread() {
        Some(thread) => (thread.0, Some(thread)),
        None => (platform.context_id() | CONTEXT_TAG, None),
    }
}

// ============================================================================
// Light Lock
// ============================================================================

pub struct LightLock<T> {
    id: ObjectId,
    tag: AtomicU64,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for LightLock<T> {}
unsafe impl<T: Send> Sync for LightLock<T> {}

impl<T> LightLock<T> {
    pub fn new(data: T) -> Self {
        Self {
            id: ObjectId::new(),
            tag: AtomicU64::new(0),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock<'a>(&'a self, scheduler: &'a Scheduler) -> LightLockGuard<'a, T> {
        let (owner, thread) = owner_tag(scheduler);
        loop {
            if self
                .tag
                .compare_exchange(0, owner << 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
            if self.lock_slow(scheduler, owner, thread) {
                break;
            }
        }
        LightLockGuard {
            lock: self,
            scheduler,
            owner,
        }
    }

    /// Wait behind the current owner. Returns true once ownership was handed
    /// over, false if the caller should retry the fast path.
    fn lock_slow(&self, scheduler: &Scheduler, owner: u64, thread: Option<ThreadId>) -> bool {
        let Some(thread) = thread else {
            core::hint::spin_loop();
            return false;
        };
        {
            let guard = scheduler.lock();
            let mut current = self.tag.load(Ordering::Relaxed);
            loop {
                if current == 0 {
                    return false;
                }
                assert!(current >> 1 != owner, "light lock acquired recursively");
                match self.tag.compare_exchange_weak(
                    current,
                    current | WAITERS,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(actual) => current = actual,
                }
            }
            let mut state = guard.state();
            state.link_waiter(self.id, thread);
            state.begin_wait(thread, WaitKind::LightLock);
        }
        scheduler.park(thread);
        debug_assert_eq!(self.tag.load(Ordering::Acquire) >> 1, owner);
        true
    }

    fn unlock(&self, scheduler: &Scheduler, owner: u64) {
        if self
            .tag
            .compare_exchange(owner << 1, 0, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        let guard = scheduler.lock();
        let mut state = guard.state();
        // Most important waiter first, oldest among equals
        let next = state
            .waiters(self.id)
            .into_iter()
            .min_by_key(|waiter| state.thread(*waiter).priority);
        match next {
            Some(next) => {
                let more = if state.waiter_count(self.id) > 1 { WAITERS } else { 0 };
                self.tag.store((next.0 << 1) | more, Ordering::Release);
                state.end_wait(next, Ok(()));
            }
            None => self.tag.store(0, Ordering::Release),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.tag.load(Ordering::Relaxed) != 0
    }

    /// Whether the calling context holds the lock
    pub fn is_locked_by_current(&self, scheduler: &Scheduler) -> bool {
        let (owner, _) = owner_tag(scheduler);
        self.tag.load(Ordering::Relaxed) >> 1 == owner
    }
}

pub struct LightLockGuard<'a, T> {
    lock: &'a LightLock<T>,
    scheduler: &'a Scheduler,
    owner: u64,
}

impl<'a, T> Deref for LightLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for LightLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for LightLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock(self.scheduler, self.owner);
    }
}

// ============================================================================
// Condition Variable
// ============================================================================

/// Condition variable paired with a [`LightLock`]
///
/// Wakeups may be spurious; callers re-check their condition in a loop.
pub struct LightConditionVariable {
    id: ObjectId,
}

impl LightConditionVariable {
    pub fn new() -> Self {
        Self { id: ObjectId::new() }
    }

    /// Release the lock, sleep until broadcast or `timeout`, and relock
    ///
    /// Returns at once for an expired timeout or a thread with termination
    /// pending.
    pub fn wait<'a, T>(&self, guard: LightLockGuard<'a, T>, timeout: Timeout) -> LightLockGuard<'a, T> {
        let lock = guard.lock;
        let scheduler = guard.scheduler;
        let Some(thread) = scheduler.platform().current_thread() else {
            drop(guard);
            core::hint::spin_loop();
            return lock.lock(scheduler);
        };
        if timeout == Timeout::Poll {
            return guard;
        }

        {
            let sleep = scheduler.lock_and_sleep(thread, timeout);
            {
                let mut state = sleep.state();
                if state.thread(thread).termination_requested {
                    sleep.cancel_sleep();
                    return guard;
                }
                state.link_waiter(self.id, thread);
                state.begin_wait(thread, WaitKind::ConditionVariable);
            }
            // Unlock while the scheduling lock is held so a broadcast
            // between the unlock and the sleep is not lost
            drop(guard);
        }
        scheduler.park(thread);
        lock.lock(scheduler)
    }

    /// Wake every waiter
    pub fn broadcast(&self, scheduler: &Scheduler) {
        let guard = scheduler.lock();
        let mut state = guard.state();
        for thread in state.waiters(self.id) {
            state.end_wait(thread, Ok(()));
        }
    }

    /// Wake the oldest waiter
    pub fn signal(&self, scheduler: &Scheduler) {
        let guard = scheduler.lock();
        let mut state = guard.state();
        if let Some(thread) = state.first_waiter(self.id) {
            state.end_wait(thread, Ok(()));
        }
    }

    pub fn waiter_count(&self, scheduler: &Scheduler) -> usize {
        scheduler.lock().state().waiter_count(self.id)
    }
}

impl Default for LightConditionVariable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::host::{wait_until, HostPlatform};
    use crate::kern::thread::{ThreadRecord, ThreadState};
    use crate::types::CoreMask;
    use alloc::sync::Arc;
    use std::thread;

    fn setup() -> (Arc<HostPlatform>, Arc<Scheduler>) {
        let platform = Arc::new(HostPlatform::new(2));
        let scheduler = Arc::new(Scheduler::new(platform.clone(), 2));
        (platform, scheduler)
    }

    fn spawn_thread(scheduler: &Scheduler) -> ThreadId {
        spawn_thread_at(scheduler, 20)
    }

    fn spawn_thread_at(scheduler: &Scheduler, priority: i32) -> ThreadId {
        let id = ThreadId::new();
        let guard = scheduler.lock();
        let mut state = guard.state();
        state.insert_thread(ThreadRecord::new(id, ObjectId::new(), priority, 0, CoreMask(0b11)));
        state.set_thread_state(id, ThreadState::Runnable);
        id
    }

    #[test]
    fn test_uncontended_lock() {
        let (_platform, scheduler) = setup();
        let lock = LightLock::new(5u32);
        {
            let mut guard = lock.lock(&scheduler);
            *guard += 1;
            assert!(lock.is_locked());
            assert!(lock.is_locked_by_current(&scheduler));
        }
        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(&scheduler), 6);
    }

    #[test]
    fn test_contended_lock_hands_off_to_waiter() {
        let (platform, scheduler) = setup();
        let lock = Arc::new(LightLock::new(0u32));
        let owner = spawn_thread(&scheduler);
        let waiter = spawn_thread(&scheduler);

        let _bound = platform.bind(owner, 0);
        let guard = lock.lock(&scheduler);

        let handle = {
            let platform = platform.clone();
            let scheduler = scheduler.clone();
            let lock = lock.clone();
            thread::spawn(move || {
                let _bound = platform.bind(waiter, 1);
                let mut guard = lock.lock(&scheduler);
                *guard += 1;
            })
        };
        wait_until(|| scheduler.thread_state(waiter) == Some(ThreadState::Waiting));
        drop(guard);
        handle.join().unwrap();
        assert_eq!(*lock.lock(&scheduler), 1);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_termination_leaves_lock_waiter_queued() {
        let (platform, scheduler) = setup();
        let lock = Arc::new(LightLock::new(0u32));
        let owner = spawn_thread(&scheduler);
        let waiter = spawn_thread(&scheduler);

        let _bound = platform.bind(owner, 0);
        let guard = lock.lock(&scheduler);

        let handle = {
            let platform = platform.clone();
            let scheduler = scheduler.clone();
            let lock = lock.clone();
            thread::spawn(move || {
                let _bound = platform.bind(waiter, 1);
                let mut guard = lock.lock(&scheduler);
                *guard += 1;
            })
        };
        wait_until(|| scheduler.thread_state(waiter) == Some(ThreadState::Waiting));

        scheduler.lock().state().request_termination(waiter);
        assert_eq!(scheduler.thread_state(waiter), Some(ThreadState::Waiting));
        assert!(lock.is_locked_by_current(&scheduler));
        assert_eq!(*guard, 0);

        drop(guard);
        handle.join().unwrap();
        assert_eq!(*lock.lock(&scheduler), 1);
    }

    #[test]
    fn test_unlock_prefers_higher_priority_waiter() {
        let (platform, scheduler) = setup();
        let lock = Arc::new(LightLock::new(alloc::vec::Vec::new()));
        let owner = spawn_thread(&scheduler);
        let low = spawn_thread_at(&scheduler, 40);
        let high = spawn_thread_at(&scheduler, 10);

        let _bound = platform.bind(owner, 0);
        let guard = lock.lock(&scheduler);

        let spawn_waiter = |id: ThreadId| {
            let platform = platform.clone();
            let scheduler = scheduler.clone();
            let lock = lock.clone();
            thread::spawn(move || {
                let _bound = platform.bind(id, 1);
                lock.lock(&scheduler).push(id);
            })
        };
        let first = spawn_waiter(low);
        wait_until(|| scheduler.thread_state(low) == Some(ThreadState::Waiting));
        let second = spawn_waiter(high);
        wait_until(|| scheduler.thread_state(high) == Some(ThreadState::Waiting));

        drop(guard);
        first.join().unwrap();
        second.join().unwrap();
        assert_eq!(*lock.lock(&scheduler), alloc::vec![high, low]);
    }

    #[test]
    fn test_condition_variable_broadcast() {
        let (platform, scheduler) = setup();
        let lock = Arc::new(LightLock::new(false));
        let cv = Arc::new(LightConditionVariable::new());
        let waiter = spawn_thread(&scheduler);

        let handle = {
            let platform = platform.clone();
            let scheduler = scheduler.clone();
            let lock = lock.clone();
            let cv = cv.clone();
            thread::spawn(move || {
                let _bound = platform.bind(waiter, 1);
                let mut guard = lock.lock(&scheduler);
                while !*guard {
                    guard = cv.wait(guard, Timeout::None);
                }
            })
        };
        wait_until(|| cv.waiter_count(&scheduler) == 1);
        *lock.lock(&scheduler) = true;
        cv.broadcast(&scheduler);
        handle.join().unwrap();
        assert_eq!(cv.waiter_count(&scheduler), 0);
    }

    #[test]
    fn test_condition_variable_timeout() {
        let (platform, scheduler) = setup();
        let lock = LightLock::new(());
        let cv = LightConditionVariable::new();
        let me = spawn_thread(&scheduler);
        let _bound = platform.bind(me, 0);
        platform.set_now(10);

        // A deadline already passed comes back without sleeping
        let guard = lock.lock(&scheduler);
        let guard = cv.wait(guard, Timeout::At(5));
        drop(guard);
        let record_result = scheduler.lock().state().thread(me).wait_result;
        assert_eq!(record_result, Err(crate::result::KernelError::TimedOut));
        assert!(!lock.is_locked());
    }
}
