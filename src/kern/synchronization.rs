//! Multi-object waits
//!
//! [`wait_any`] blocks the calling thread on up to 64 waitable objects at
//! once. Objects announce state changes with [`on_available`], which wakes
//! every waiter and lets each re-check (a broadcast, not a handoff), and tear
//! down with [`on_abort`], which fails every waiter with a reason.

use alloc::sync::Arc;

use super::event::ReadableEvent;
use super::kernel::Kernel;
use super::scheduler::SchedulerState;
use super::thread::KThread;
use super::wait_queue::WaitKind;
use crate::ipc::port::{ClientPort, ServerPort};
use crate::ipc::session::ServerSession;
use crate::result::KernelError;
use crate::types::{ObjectId, Timeout};

/// Most objects one wait may name
pub const MAX_WAIT_OBJECTS: usize = 64;

// ============================================================================
// Waitable Objects
// ============================================================================

/// Capability shared by every object a thread can wait on
pub trait Waitable {
    fn object_id(&self) -> ObjectId;

    /// Evaluated with the scheduling lock held
    fn is_signaled(&self, state: &SchedulerState) -> bool;
}

/// Closed set of waitable objects
#[derive(Clone)]
pub enum SyncObject {
    Thread(Arc<KThread>),
    ReadableEvent(Arc<ReadableEvent>),
    ServerPort(Arc<ServerPort>),
    ClientPort(Arc<ClientPort>),
    ServerSession(Arc<ServerSession>),
}

impl SyncObject {
    fn waitable(&self) -> &dyn Waitable {
        match self {
            SyncObject::Thread(object) => &**object,
            SyncObject::ReadableEvent(object) => &**object,
            SyncObject::ServerPort(object) => &**object,
            SyncObject::ClientPort(object) => &**object,
            SyncObject::ServerSession(object) => &**object,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.waitable().object_id()
    }

    pub fn is_signaled(&self, state: &SchedulerState) -> bool {
        self.waitable().is_signaled(state)
    }
}

impl core::fmt::Debug for SyncObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let kind = match self {
            SyncObject::Thread(_) => "Thread",
            SyncObject::ReadableEvent(_) => "ReadableEvent",
            SyncObject::ServerPort(_) => "ServerPort",
            SyncObject::ClientPort(_) => "ClientPort",
            SyncObject::ServerSession(_) => "ServerSession",
        };
        write!(f, "{}({:?})", kind, self.id())
    }
}

impl Waitable for KThread {
    fn object_id(&self) -> ObjectId {
        KThread::object_id(self)
    }

    fn is_signaled(&self, state: &SchedulerState) -> bool {
        KThread::is_signaled(self, state)
    }
}

/// Wake everyone waiting on `object` if it is now signaled
pub fn on_available(state: &mut SchedulerState, object: &dyn Waitable) {
    if object.is_signaled(state) {
        state.notify_waiters(object.object_id(), Ok(()));
    }
}

/// Fail everyone waiting on `object` with `reason`
pub fn on_abort(state: &mut SchedulerState, object: ObjectId, reason: KernelError) {
    state.abort_waiters(object, reason);
}

// ============================================================================
// Wait
// ============================================================================

/// Failed wait, with the index of the object that ended it if any
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitError {
    pub error: KernelError,
    pub index: Option<usize>,
}

impl WaitError {
    pub const fn new(error: KernelError) -> Self {
        Self { error, index: None }
    }
}

impl From<KernelError> for WaitError {
    fn from(error: KernelError) -> Self {
        Self::new(error)
    }
}

/// Wait until one of `objects` is signaled, returning its index
///
/// The first signaled object in argument order wins. `Timeout::Poll` never
/// blocks and may be used outside a thread context.
pub fn wait_any(kernel: &Kernel, objects: &[SyncObject], timeout: Timeout) -> Result<usize, WaitError> {
    if objects.len() > MAX_WAIT_OBJECTS {
        return Err(WaitError::new(KernelError::OutOfRange));
    }
    let scheduler = kernel.scheduler();

    let Some(thread) = kernel.current_thread_id() else {
        let guard = scheduler.lock();
        let state = guard.state();
        if let Some(index) = objects.iter().position(|object| object.is_signaled(&state)) {
            return Ok(index);
        }
        return Err(WaitError::new(if timeout == Timeout::Poll {
            KernelError::TimedOut
        } else {
            KernelError::InvalidState
        }));
    };

    {
        let sleep = scheduler.lock_and_sleep(thread, timeout);
        let mut state = sleep.state();

        let record = state.thread_mut(thread);
        if record.termination_requested {
            sleep.cancel_sleep();
            return Err(WaitError::new(KernelError::TerminationRequested));
        }
        if record.wait_cancelled {
            record.wait_cancelled = false;
            sleep.cancel_sleep();
            return Err(WaitError::new(KernelError::Cancelled));
        }

        if let Some(index) = objects.iter().position(|object| object.is_signaled(&state)) {
            sleep.cancel_sleep();
            return Ok(index);
        }
        if timeout.is_expired(kernel.platform().now()) {
            sleep.cancel_sleep();
            return Err(WaitError::new(KernelError::TimedOut));
        }

        for object in objects {
            state.link_waiter(object.id(), thread);
        }
        state.thread_mut(thread).synced_object = None;
        state.begin_wait(thread, WaitKind::Synchronization);
    }
    scheduler.park(thread);

    let (result, synced) = {
        let guard = scheduler.lock();
        let state = guard.state();
        let record = state.thread(thread);
        (record.wait_result, record.synced_object)
    };
    let index = synced.and_then(|id| objects.iter().position(|object| object.id() == id));
    match (result, index) {
        (Ok(()), Some(index)) => Ok(index),
        (Ok(()), None) => Err(WaitError::new(KernelError::InvalidState)),
        (Err(error), index) => Err(WaitError { error, index }),
    }
}

/// Cancel `thread`'s synchronization wait, or latch it for the next one
pub fn cancel_synchronization(kernel: &Kernel, thread: &KThread) {
    let guard = kernel.scheduler().lock();
    guard.state().cancel_synchronization(thread.id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::host::{wait_until, HostPlatform};
    use crate::config::KernelConfig;
    use crate::kern::event::{create_event, WritableEvent};
    use crate::kern::thread::ThreadState;
    use std::thread;
    use std::vec::Vec;

    fn kernel() -> (Arc<HostPlatform>, Arc<Kernel>) {
        let platform = Arc::new(HostPlatform::new(2));
        let config = KernelConfig::DEFAULT.with_num_cores(2);
        (platform.clone(), Kernel::new(config, platform))
    }

    fn events(kernel: &Arc<Kernel>, count: usize) -> (Vec<Arc<WritableEvent>>, Vec<SyncObject>) {
        (0..count)
            .map(|_| {
                let (writable, readable) = create_event(kernel, None).unwrap();
                (writable, SyncObject::ReadableEvent(readable))
            })
            .unzip()
    }

    fn started_thread(kernel: &Arc<Kernel>) -> Arc<KThread> {
        let thread = KThread::create(kernel, None, 20, 1).unwrap();
        thread.start().unwrap();
        thread
    }

    #[test]
    fn test_presignaled_returns_first_index_without_blocking() {
        let (platform, kernel) = kernel();
        let (writables, objects) = events(&kernel, 3);
        writables[1].signal();
        writables[2].signal();
        let thread = started_thread(&kernel);
        let _bound = platform.bind(thread.id(), 1);

        assert_eq!(wait_any(&kernel, &objects, Timeout::None), Ok(1));
        assert_eq!(wait_any(&kernel, &objects, Timeout::None), Ok(1));
        assert_eq!(thread.state(), ThreadState::Runnable);
    }

    #[test]
    fn test_poll_times_out_immediately() {
        let (platform, kernel) = kernel();
        let (_writables, objects) = events(&kernel, 2);
        assert_eq!(
            wait_any(&kernel, &objects, Timeout::Poll),
            Err(WaitError::new(KernelError::TimedOut))
        );
        let thread = started_thread(&kernel);
        let _bound = platform.bind(thread.id(), 1);
        assert_eq!(
            wait_any(&kernel, &objects, Timeout::Poll),
            Err(WaitError::new(KernelError::TimedOut))
        );
    }

    #[test]
    fn test_too_many_objects() {
        let (_platform, kernel) = kernel();
        let (_writables, objects) = events(&kernel, MAX_WAIT_OBJECTS + 1);
        assert_eq!(
            wait_any(&kernel, &objects, Timeout::Poll),
            Err(WaitError::new(KernelError::OutOfRange))
        );
    }

    #[test]
    fn test_signal_wakes_blocked_waiter() {
        let (platform, kernel) = kernel();
        let (writables, objects) = events(&kernel, 3);
        let thread = started_thread(&kernel);

        let handle = {
            let platform = platform.clone();
            let kernel = kernel.clone();
            let objects = objects.clone();
            let id = thread.id();
            thread::spawn(move || {
                let _bound = platform.bind(id, 1);
                wait_any(&kernel, &objects, Timeout::None)
            })
        };
        wait_until(|| thread.state() == ThreadState::Waiting);
        writables[2].signal();
        assert_eq!(handle.join().unwrap(), Ok(2));

        // Woken waiters are unlinked from every object
        let guard = kernel.scheduler().lock();
        let state = guard.state();
        assert!(objects.iter().all(|object| state.waiter_count(object.id()) == 0));
    }

    #[test]
    fn test_signal_wakes_every_waiter() {
        let (platform, kernel) = kernel();
        let (writables, objects) = events(&kernel, 1);
        let threads: Vec<_> = (0..3).map(|_| started_thread(&kernel)).collect();

        let handles: Vec<_> = threads
            .iter()
            .map(|thread| {
                let platform = platform.clone();
                let kernel = kernel.clone();
                let objects = objects.clone();
                let id = thread.id();
                thread::spawn(move || {
                    let _bound = platform.bind(id, 1);
                    wait_any(&kernel, &objects, Timeout::None)
                })
            })
            .collect();
        wait_until(|| threads.iter().all(|thread| thread.state() == ThreadState::Waiting));
        writables[0].signal();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), Ok(0));
        }
    }

    #[test]
    fn test_timeout_reports_timed_out() {
        let (platform, kernel) = kernel();
        let (_writables, objects) = events(&kernel, 1);
        let thread = started_thread(&kernel);

        let handle = {
            let platform = platform.clone();
            let kernel = kernel.clone();
            let objects = objects.clone();
            let id = thread.id();
            thread::spawn(move || {
                let _bound = platform.bind(id, 1);
                wait_any(&kernel, &objects, Timeout::At(40))
            })
        };
        wait_until(|| thread.state() == ThreadState::Waiting);
        platform.set_now(40);
        kernel.scheduler().handle_timer_interrupt(1);
        assert_eq!(
            handle.join().unwrap(),
            Err(WaitError::new(KernelError::TimedOut))
        );
    }

    #[test]
    fn test_abort_carries_index() {
        let (platform, kernel) = kernel();
        let (_writables, objects) = events(&kernel, 2);
        let thread = started_thread(&kernel);

        let handle = {
            let platform = platform.clone();
            let kernel = kernel.clone();
            let objects = objects.clone();
            let id = thread.id();
            thread::spawn(move || {
                let _bound = platform.bind(id, 1);
                wait_any(&kernel, &objects, Timeout::None)
            })
        };
        wait_until(|| thread.state() == ThreadState::Waiting);
        {
            let guard = kernel.scheduler().lock();
            on_abort(&mut guard.state(), objects[1].id(), KernelError::SessionClosed);
        }
        assert_eq!(
            handle.join().unwrap(),
            Err(WaitError {
                error: KernelError::SessionClosed,
                index: Some(1)
            })
        );
    }

    #[test]
    fn test_cancel_synchronization() {
        let (platform, kernel) = kernel();
        let (_writables, objects) = events(&kernel, 1);
        let thread = started_thread(&kernel);

        // Latched before the wait starts
        cancel_synchronization(&kernel, &thread);
        {
            let _bound = platform.bind(thread.id(), 1);
            assert_eq!(
                wait_any(&kernel, &objects, Timeout::None),
                Err(WaitError::new(KernelError::Cancelled))
            );
        }

        let handle = {
            let platform = platform.clone();
            let kernel = kernel.clone();
            let objects = objects.clone();
            let id = thread.id();
            thread::spawn(move || {
                let _bound = platform.bind(id, 1);
                wait_any(&kernel, &objects, Timeout::None)
            })
        };
        wait_until(|| thread.state() == ThreadState::Waiting);
        cancel_synchronization(&kernel, &thread);
        assert_eq!(
            handle.join().unwrap(),
            Err(WaitError::new(KernelError::Cancelled))
        );
    }

    #[test]
    fn test_wait_on_thread_until_exit() {
        let (platform, kernel) = kernel();
        let target = KThread::create(&kernel, None, 30, 0).unwrap();
        target.start().unwrap();
        let waiter = started_thread(&kernel);
        let objects = alloc::vec![SyncObject::Thread(target.clone())];

        let handle = {
            let platform = platform.clone();
            let kernel = kernel.clone();
            let objects = objects.clone();
            let id = waiter.id();
            thread::spawn(move || {
                let _bound = platform.bind(id, 1);
                wait_any(&kernel, &objects, Timeout::None)
            })
        };
        wait_until(|| waiter.state() == ThreadState::Waiting);
        {
            let _bound = platform.bind(target.id(), 0);
            target.exit();
        }
        assert_eq!(handle.join().unwrap(), Ok(0));
    }
}
