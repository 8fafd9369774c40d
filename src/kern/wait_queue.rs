//! Wait Queues
//!
//! A waiting thread records *why* it is blocked as a [`WaitKind`]. The kind
//! decides how the wait may end:
//! - `end_wait` is the normal completion path (a signal, a reply, a lock
//!   handoff). Kinds without one treat it as a fatal integration error.
//! - `cancel_wait` is forced completion (timeout, termination, teardown). The
//!   caller picks whether the armed timeout is cancelled as well, because the
//!   timer path calls it after its task has already been popped.
//!
//! Both paths unlink the thread from every wait list it joined, exactly once,
//! and make it runnable. All of this runs under the scheduling lock, which is
//! what resolves the race between a signal and a timeout: whichever reaches
//! the thread first finds it waiting, the other finds it runnable and backs
//! off.

use log::error;

use super::scheduler::SchedulerState;
use super::thread::ThreadState;
use crate::result::{KernelError, KernelResult};
use crate::types::{ObjectId, ThreadId};

/// Reason a thread is blocked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKind {
    /// Timed sleep or yield; only a timeout or cancellation ends it
    Sleep,
    /// Waiting on one or more waitable objects
    Synchronization,
    /// Queued behind the owner of a light lock
    LightLock,
    /// Waiting on a light condition variable
    ConditionVariable,
    /// Client thread waiting for its session request to be answered
    SessionReply,
}

impl WaitKind {
    /// Whether `end_wait` is a legal way to finish this wait
    pub const fn has_end_wait(self) -> bool {
        !matches!(self, WaitKind::Sleep)
    }

    /// Whether a termination request interrupts this wait
    pub const fn is_interruptible(self) -> bool {
        matches!(
            self,
            WaitKind::Sleep | WaitKind::Synchronization | WaitKind::ConditionVariable
        )
    }
}

impl SchedulerState {
    /// Put a thread to sleep for `kind`
    ///
    /// The caller links it into any wait lists first and releases the
    /// scheduling lock afterwards; the thread parks once the lock is gone.
    pub fn begin_wait(&mut self, thread: ThreadId, kind: WaitKind) {
        let record = self.thread_mut(thread);
        assert!(
            record.wait.is_none(),
            "thread {:?} is already waiting",
            thread
        );
        assert!(
            !matches!(record.state, ThreadState::Terminating | ThreadState::Terminated),
            "thread {:?} waiting after exit",
            thread
        );
        record.wait = Some(kind);
        self.set_thread_state(thread, ThreadState::Waiting);
    }

    /// Normal completion of a wait
    pub fn end_wait(&mut self, thread: ThreadId, result: KernelResult<()>) {
        let kind = match self.thread(thread).wait {
            Some(kind) => kind,
            None => panic!("end_wait on thread {:?} which is not waiting", thread),
        };
        if !kind.has_end_wait() {
            error!("end_wait on {:?} wait of thread {:?}", kind, thread);
            panic!("end_wait on a wait queue without an end path");
        }
        self.finish_wait(thread, result, true);
    }

    /// Forced completion of a wait. No-op if the thread is no longer waiting.
    ///
    /// A light lock wait only ends by ownership handoff and is never
    /// cancelled.
    pub fn cancel_wait(&mut self, thread: ThreadId, result: KernelResult<()>, cancel_timer: bool) {
        match self.thread(thread).wait {
            None => return,
            Some(WaitKind::LightLock) => {
                error!("cancel of light lock wait of thread {:?}", thread);
                panic!("light lock wait cancelled");
            }
            Some(_) => {}
        }
        self.finish_wait(thread, result, cancel_timer);
    }

    fn finish_wait(&mut self, thread: ThreadId, result: KernelResult<()>, cancel_timer: bool) {
        let record = self.thread_mut(thread);
        record.wait = None;
        record.wait_result = result;
        let timer = if cancel_timer { record.timer.take() } else { None };
        if let Some(key) = timer {
            self.timer_mut(key.core).cancel(key);
        }
        self.unlink_waiter(thread);
        self.set_thread_state(thread, ThreadState::Runnable);
    }

    /// Append a thread to the wait list of `object`
    pub fn link_waiter(&mut self, object: ObjectId, thread: ThreadId) {
        let link = self.wait_lists.enqueue_tail(object, thread);
        self.thread_mut(thread).wait_links.push(link);
    }

    /// Remove a thread from every wait list it is on
    pub fn unlink_waiter(&mut self, thread: ThreadId) {
        let links = core::mem::take(&mut self.thread_mut(thread).wait_links);
        for link in links {
            self.wait_lists.remove(link);
        }
    }

    /// Threads waiting on `object`, oldest first
    pub fn waiters(&self, object: ObjectId) -> alloc::vec::Vec<ThreadId> {
        self.wait_lists.to_vec(object)
    }

    pub fn first_waiter(&self, object: ObjectId) -> Option<ThreadId> {
        self.wait_lists.first(object)
    }

    pub fn waiter_count(&self, object: ObjectId) -> usize {
        self.wait_lists.len(object)
    }

    /// Wake every waiter of `object` with `result`, naming it as the object
    /// that ended their wait
    pub fn notify_waiters(&mut self, object: ObjectId, result: KernelResult<()>) {
        for thread in self.waiters(object) {
            // A thread listed twice was already woken by its first entry
            if self.thread(thread).wait.is_none() {
                continue;
            }
            self.thread_mut(thread).synced_object = Some(object);
            self.end_wait(thread, result);
        }
    }

    /// Broadcast a teardown failure to every waiter of `object`
    pub fn abort_waiters(&mut self, object: ObjectId, reason: KernelError) {
        self.notify_waiters(object, Err(reason));
    }

    /// Handle an expired timeout task
    pub fn on_timeout(&mut self, thread: ThreadId, key: super::timer::TimerKey) {
        let Some(record) = self.thread_opt_mut(thread) else {
            return;
        };
        if record.timer != Some(key) {
            return;
        }
        record.timer = None;
        self.cancel_wait(thread, Err(KernelError::TimedOut), false);
    }

    /// Ask a thread to terminate, interrupting an interruptible wait
    pub fn request_termination(&mut self, thread: ThreadId) {
        let record = self.thread_mut(thread);
        record.termination_requested = true;
        if record.wait.is_some_and(WaitKind::is_interruptible) {
            self.cancel_wait(thread, Err(KernelError::TerminationRequested), true);
        }
    }

    /// Cancel a synchronization wait, or latch the cancel for the next one
    pub fn cancel_synchronization(&mut self, thread: ThreadId) {
        let record = self.thread_mut(thread);
        if record.wait == Some(WaitKind::Synchronization) {
            self.cancel_wait(thread, Err(KernelError::Cancelled), true);
        } else {
            record.wait_cancelled = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::thread::ThreadRecord;
    use crate::types::CoreMask;

    fn state_with_thread() -> (SchedulerState, ThreadId) {
        let mut state = SchedulerState::new(1);
        let id = ThreadId::new();
        let mut record = ThreadRecord::new(id, ObjectId::new(), 20, 0, CoreMask::single(0));
        record.state = ThreadState::Initialized;
        state.insert_thread(record);
        state.set_thread_state(id, ThreadState::Runnable);
        (state, id)
    }

    #[test]
    fn test_end_wait_wakes_and_unlinks() {
        let (mut state, thread) = state_with_thread();
        let a = ObjectId::new();
        let b = ObjectId::new();
        state.link_waiter(a, thread);
        state.link_waiter(b, thread);
        state.begin_wait(thread, WaitKind::Synchronization);
        assert_eq!(state.thread(thread).state, ThreadState::Waiting);

        state.notify_waiters(b, Ok(()));
        let record = state.thread(thread);
        assert_eq!(record.state, ThreadState::Runnable);
        assert_eq!(record.synced_object, Some(b));
        assert_eq!(record.wait_result, Ok(()));
        assert_eq!(state.waiter_count(a), 0);
        assert_eq!(state.waiter_count(b), 0);
    }

    #[test]
    fn test_cancel_wait_after_wake_is_noop() {
        let (mut state, thread) = state_with_thread();
        state.begin_wait(thread, WaitKind::Synchronization);
        state.end_wait(thread, Ok(()));
        state.cancel_wait(thread, Err(KernelError::TimedOut), false);
        assert_eq!(state.thread(thread).wait_result, Ok(()));
    }

    #[test]
    #[should_panic(expected = "without an end path")]
    fn test_end_wait_on_sleep_is_fatal() {
        let (mut state, thread) = state_with_thread();
        state.begin_wait(thread, WaitKind::Sleep);
        state.end_wait(thread, Ok(()));
    }

    #[test]
    fn test_abort_carries_reason() {
        let (mut state, thread) = state_with_thread();
        let object = ObjectId::new();
        state.link_waiter(object, thread);
        state.begin_wait(thread, WaitKind::Synchronization);
        state.abort_waiters(object, KernelError::SessionClosed);
        let record = state.thread(thread);
        assert_eq!(record.wait_result, Err(KernelError::SessionClosed));
        assert_eq!(record.synced_object, Some(object));
    }

    #[test]
    fn test_termination_interrupts_only_interruptible_waits() {
        let (mut state, thread) = state_with_thread();
        state.begin_wait(thread, WaitKind::SessionReply);
        state.request_termination(thread);
        assert_eq!(state.thread(thread).state, ThreadState::Waiting);
        state.end_wait(thread, Ok(()));

        state.begin_wait(thread, WaitKind::ConditionVariable);
        state.request_termination(thread);
        assert_eq!(
            state.thread(thread).wait_result,
            Err(KernelError::TerminationRequested)
        );
    }

    #[test]
    #[should_panic(expected = "light lock wait cancelled")]
    fn test_light_lock_wait_cannot_be_cancelled() {
        let (mut state, thread) = state_with_thread();
        state.begin_wait(thread, WaitKind::LightLock);
        state.request_termination(thread);
        assert_eq!(state.thread(thread).state, ThreadState::Waiting);
        state.cancel_wait(thread, Err(KernelError::TerminationRequested), true);
    }

    #[test]
    #[should_panic(expected = "waiting after exit")]
    fn test_exited_thread_cannot_wait() {
        let (mut state, thread) = state_with_thread();
        state.exit_thread(thread);
        assert!(state.thread(thread).termination_requested);
        state.begin_wait(thread, WaitKind::SessionReply);
    }

    #[test]
    fn test_cancel_synchronization_latches() {
        let (mut state, thread) = state_with_thread();
        state.cancel_synchronization(thread);
        assert!(state.thread(thread).wait_cancelled);

        state.thread_mut(thread).wait_cancelled = false;
        state.begin_wait(thread, WaitKind::Synchronization);
        state.cancel_synchronization(thread);
        assert_eq!(state.thread(thread).wait_result, Err(KernelError::Cancelled));
        assert!(!state.thread(thread).wait_cancelled);
    }

    #[test]
    fn test_timeout_cancels_wait_and_timer() {
        let (mut state, thread) = state_with_thread();
        state.begin_wait(thread, WaitKind::Synchronization);
        let key = state.register_timeout(thread, 0, 100);
        let fired = state.timer_mut(0).pop_expired(100);
        assert_eq!(fired, alloc::vec![(key, thread)]);
        state.on_timeout(thread, key);
        assert_eq!(state.thread(thread).wait_result, Err(KernelError::TimedOut));
        assert_eq!(state.thread(thread).timer, None);
    }

    #[test]
    fn test_wake_cancels_armed_timer() {
        let (mut state, thread) = state_with_thread();
        state.begin_wait(thread, WaitKind::Synchronization);
        state.register_timeout(thread, 0, 100);
        state.end_wait(thread, Ok(()));
        assert!(state.timer_mut(0).is_empty());
    }
}
