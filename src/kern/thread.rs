//! Thread Management
//!
//! A thread is split in two. The scheduler owns a [`ThreadRecord`] in its
//! arena, keyed by [`ThreadId`]: state, priority, affinity and wait linkage,
//! all mutated only under the scheduling lock. The reference-counted
//! [`KThread`] object is what handles and processes hold; dropping the last
//! reference removes the record and returns the thread's resource-limit
//! reservation.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use log::{debug, error};

use super::auto_object::{AutoObject, ObjectKind, PostDestroy};
use super::kernel::Kernel;
use super::priority_queue::QueueMember;
use super::process::KProcess;
use super::queue::LinkIndex;
use super::resource_limit::{LimitableResource, ResourceLimit, ScopedResourceReservation};
use super::scheduler::{SchedulerState, YieldKind};
use super::timer::TimerKey;
use super::wait_queue::WaitKind;
use crate::result::{KernelError, KernelResult};
use crate::types::{is_valid_priority, CoreId, CoreMask, ObjectId, Priority, ThreadId, Timeout};

// ============================================================================
// Thread State
// ============================================================================

/// Lifecycle of a thread
///
/// Initialized -> Runnable <-> Waiting -> Terminating -> Terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Initialized,
    Runnable,
    Waiting,
    Terminating,
    Terminated,
}

// ============================================================================
// Scheduler Record
// ============================================================================

/// Scheduler arena entry for one thread
#[derive(Debug)]
pub struct ThreadRecord {
    pub id: ThreadId,
    /// Id of the owning [`KThread`], used as the thread's wait list key
    pub object_id: ObjectId,
    pub state: ThreadState,
    pub priority: Priority,
    pub base_priority: Priority,
    pub ideal_core: CoreId,
    /// Core whose scheduled queue holds the thread
    pub active_core: Option<CoreId>,
    pub affinity: CoreMask,
    /// Reason for the current wait, `None` when not waiting
    pub wait: Option<WaitKind>,
    /// One link per wait list joined
    pub wait_links: Vec<LinkIndex>,
    /// Object whose signal ended the last wait
    pub synced_object: Option<ObjectId>,
    pub wait_result: KernelResult<()>,
    pub timer: Option<TimerKey>,
    pub termination_requested: bool,
    /// Latched synchronization cancel for the next wait
    pub wait_cancelled: bool,
}

impl ThreadRecord {
    pub fn new(
        id: ThreadId,
        object_id: ObjectId,
        priority: Priority,
        ideal_core: CoreId,
        affinity: CoreMask,
    ) -> Self {
        Self {
            id,
            object_id,
            state: ThreadState::Initialized,
            priority,
            base_priority: priority,
            ideal_core,
            active_core: Some(ideal_core),
            affinity,
            wait: None,
            wait_links: Vec::new(),
            synced_object: None,
            wait_result: Ok(()),
            timer: None,
            termination_requested: false,
            wait_cancelled: false,
        }
    }

    pub fn queue_member(&self) -> QueueMember {
        QueueMember {
            id: self.id,
            priority: self.priority,
            affinity: self.affinity,
            active_core: self.active_core,
        }
    }
}

// ============================================================================
// Thread Object
// ============================================================================

/// Reference-counted thread object
pub struct KThread {
    header: AutoObject,
    id: ThreadId,
    kernel: Arc<Kernel>,
    process: Option<Weak<KProcess>>,
    limit: Option<Arc<ResourceLimit>>,
}

impl core::fmt::Debug for KThread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KThread")
            .field("id", &self.id)
            .field("object", &self.header.id())
            .finish()
    }
}

impl KThread {
    /// Create a thread in the Initialized state
    ///
    /// Charges one `ThreadCountMax` against the owning process's limit.
    pub fn create(
        kernel: &Arc<Kernel>,
        process: Option<&Arc<KProcess>>,
        priority: Priority,
        ideal_core: CoreId,
    ) -> KernelResult<Arc<Self>> {
        if !is_valid_priority(priority) {
            return Err(KernelError::InvalidPriority);
        }
        if ideal_core >= kernel.num_cores() {
            return Err(KernelError::InvalidCoreId);
        }
        if let Some(process) = process {
            process.capabilities().check_priority(priority)?;
            process.capabilities().check_core(ideal_core)?;
        }

        let limit = process.and_then(|process| process.resource_limit().cloned());
        let mut reservation = ScopedResourceReservation::new(
            limit.as_ref(),
            LimitableResource::ThreadCountMax,
            1,
            kernel.reservation_timeout(),
        );
        if !reservation.succeeded() {
            return Err(KernelError::LimitReached);
        }

        let header = AutoObject::new(ObjectKind::Thread);
        let id = ThreadId::new();
        let record = ThreadRecord::new(id, header.id(), priority, ideal_core, CoreMask::single(ideal_core));
        {
            let guard = kernel.scheduler().lock();
            guard.state().insert_thread(record);
        }

        let thread = Arc::new(Self {
            header,
            id,
            kernel: kernel.clone(),
            process: process.map(Arc::downgrade),
            limit,
        });
        kernel.register_thread(&thread);
        if let Some(process) = process {
            process.add_thread(&thread);
        }
        reservation.commit();
        debug!("created thread {:?} priority {} core {}", id, priority, ideal_core);
        Ok(thread)
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn object_id(&self) -> ObjectId {
        self.header.id()
    }

    pub fn process(&self) -> Option<Arc<KProcess>> {
        self.process.as_ref().and_then(Weak::upgrade)
    }

    fn with_record<R>(&self, f: impl FnOnce(&mut SchedulerState) -> R) -> R {
        let guard = self.kernel.scheduler().lock();
        let mut state = guard.state();
        f(&mut state)
    }

    /// Make an Initialized thread runnable
    pub fn start(&self) -> KernelResult<()> {
        self.with_record(|state| {
            let record = state.thread(self.id);
            if record.state != ThreadState::Initialized {
                return Err(KernelError::InvalidState);
            }
            if record.termination_requested {
                return Err(KernelError::TerminationRequested);
            }
            state.set_thread_state(self.id, ThreadState::Runnable);
            Ok(())
        })
    }

    /// Begin termination of the calling thread
    ///
    /// Waiters on the thread are notified once no core runs it. Other
    /// contexts stop a thread with [`KThread::request_termination`].
    pub fn exit(&self) {
        if self.kernel.platform().current_thread() != Some(self.id) {
            error!("thread {:?} exited from another context", self.id);
            panic!("exit called on a thread other than the caller");
        }
        self.with_record(|state| {
            let current = state.thread(self.id).state;
            if !matches!(current, ThreadState::Terminating | ThreadState::Terminated) {
                state.exit_thread(self.id);
            }
        });
        debug!("thread {:?} exiting", self.id);
    }

    pub fn state(&self) -> ThreadState {
        self.with_record(|state| state.thread(self.id).state)
    }

    pub fn priority(&self) -> Priority {
        self.with_record(|state| state.thread(self.id).priority)
    }

    pub fn set_priority(&self, priority: Priority) -> KernelResult<()> {
        if !is_valid_priority(priority) {
            return Err(KernelError::InvalidPriority);
        }
        self.with_record(|state| {
            state.thread_mut(self.id).base_priority = priority;
            state.set_priority(self.id, priority);
        });
        Ok(())
    }

    /// Affinity mask and ideal core
    pub fn affinity(&self) -> (CoreId, CoreMask) {
        self.with_record(|state| {
            let record = state.thread(self.id);
            (record.ideal_core, record.affinity)
        })
    }

    pub fn active_core(&self) -> Option<CoreId> {
        self.with_record(|state| state.thread(self.id).active_core)
    }

    pub fn set_affinity(&self, ideal_core: CoreId, mask: CoreMask) -> KernelResult<()> {
        if mask.is_empty() {
            return Err(KernelError::InvalidCombination);
        }
        if mask.0 & !CoreMask::all(self.kernel.num_cores()).0 != 0 {
            return Err(KernelError::InvalidCoreId);
        }
        if ideal_core >= self.kernel.num_cores() || !mask.contains(ideal_core) {
            return Err(KernelError::InvalidCoreId);
        }
        self.with_record(|state| state.set_affinity(self.id, ideal_core, mask));
        Ok(())
    }

    /// Ask the thread to terminate, interrupting an interruptible wait
    pub fn request_termination(&self) {
        self.with_record(|state| state.request_termination(self.id));
    }

    pub fn is_termination_requested(&self) -> bool {
        self.with_record(|state| state.thread(self.id).termination_requested)
    }

    /// Result of the thread's last wait and the object that ended it
    pub fn wait_result(&self) -> (KernelResult<()>, Option<ObjectId>) {
        self.with_record(|state| {
            let record = state.thread(self.id);
            (record.wait_result, record.synced_object)
        })
    }

    /// Sleep the calling thread until `timeout`
    ///
    /// Must be called by the thread itself. Returns `TerminationRequested`
    /// if the sleep was interrupted, otherwise Ok once the deadline passes.
    /// `Timeout::None` sleeps until termination is requested.
    pub fn sleep(&self, timeout: Timeout) -> KernelResult<()> {
        debug_assert_eq!(self.kernel.platform().current_thread(), Some(self.id));
        if timeout == Timeout::Poll {
            return Err(KernelError::InvalidArgument);
        }
        let scheduler = self.kernel.scheduler();
        {
            let sleep = scheduler.lock_and_sleep(self.id, timeout);
            let mut state = sleep.state();
            if state.thread(self.id).termination_requested {
                sleep.cancel_sleep();
                return Err(KernelError::TerminationRequested);
            }
            state.begin_wait(self.id, WaitKind::Sleep);
        }
        scheduler.park(self.id);
        match self.wait_result().0 {
            Err(KernelError::TimedOut) => Ok(()),
            other => other,
        }
    }

    /// Give up the rest of the calling thread's turn
    pub fn yield_now(&self, kind: YieldKind) {
        self.with_record(|state| state.yield_thread(self.id, kind));
    }

    /// A thread is signaled once it has terminated
    pub fn is_signaled(&self, state: &SchedulerState) -> bool {
        state
            .thread_opt(self.id)
            .map_or(true, |record| record.state == ThreadState::Terminated)
    }
}

impl Drop for KThread {
    fn drop(&mut self) {
        {
            let guard = self.kernel.scheduler().lock();
            guard.state().remove_thread(self.id);
        }
        self.kernel.unregister_thread(self.id);
        if let Some(process) = self.process() {
            process.remove_thread(self.id);
        }
        debug!("destroyed thread {:?}", self.id);
        PostDestroy::ReleaseThread {
            limit: self.limit.take(),
        }
        .run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::host::{wait_until, HostPlatform};
    use crate::config::KernelConfig;
    use std::thread;

    fn kernel() -> (Arc<HostPlatform>, Arc<Kernel>) {
        let platform = Arc::new(HostPlatform::new(4));
        let kernel = Kernel::new(KernelConfig::DEFAULT, platform.clone());
        (platform, kernel)
    }

    #[test]
    fn test_thread_lifecycle() {
        let (platform, kernel) = kernel();
        let thread = KThread::create(&kernel, None, 30, 0).unwrap();
        assert_eq!(thread.state(), ThreadState::Initialized);
        thread.start().unwrap();
        assert_eq!(thread.state(), ThreadState::Runnable);
        assert_eq!(thread.start(), Err(KernelError::InvalidState));
        assert_eq!(kernel.scheduler().current_thread(0), Some(thread.id()));

        let _bound = platform.bind(thread.id(), 0);
        thread.exit();
        assert!(thread.is_termination_requested());
        assert_eq!(thread.state(), ThreadState::Terminated);
        let guard = kernel.scheduler().lock();
        assert!(thread.is_signaled(&guard.state()));
    }

    #[test]
    #[should_panic(expected = "exit called on a thread other than the caller")]
    fn test_exit_from_other_context_panics() {
        let (_platform, kernel) = kernel();
        let thread = KThread::create(&kernel, None, 30, 0).unwrap();
        thread.start().unwrap();
        thread.exit();
    }

    #[test]
    fn test_thread_argument_checks() {
        let (_platform, kernel) = kernel();
        assert_eq!(
            KThread::create(&kernel, None, 64, 0).err(),
            Some(KernelError::InvalidPriority)
        );
        assert_eq!(
            KThread::create(&kernel, None, 10, 7).err(),
            Some(KernelError::InvalidCoreId)
        );
        let thread = KThread::create(&kernel, None, 10, 0).unwrap();
        assert_eq!(thread.set_priority(-1), Err(KernelError::InvalidPriority));
        assert_eq!(
            thread.set_affinity(0, CoreMask::EMPTY),
            Err(KernelError::InvalidCombination)
        );
        assert_eq!(
            thread.set_affinity(0, CoreMask(0b10)),
            Err(KernelError::InvalidCoreId)
        );
        thread.set_affinity(1, CoreMask(0b10)).unwrap();
        assert_eq!(thread.affinity(), (1, CoreMask(0b10)));
        assert_eq!(thread.active_core(), Some(1));
    }

    #[test]
    fn test_drop_removes_record() {
        let (_platform, kernel) = kernel();
        let thread = KThread::create(&kernel, None, 10, 0).unwrap();
        let id = thread.id();
        drop(thread);
        assert_eq!(kernel.scheduler().thread_state(id), None);
        assert!(kernel.thread(id).is_none());
    }

    #[test]
    fn test_sleep_wakes_on_timer() {
        let (platform, kernel) = kernel();
        let thread = KThread::create(&kernel, None, 10, 0).unwrap();
        thread.start().unwrap();

        let sleeper = {
            let platform = platform.clone();
            let thread = thread.clone();
            thread::spawn(move || {
                let _bound = platform.bind(thread.id(), 0);
                thread.sleep(Timeout::At(50))
            })
        };
        wait_until(|| thread.state() == ThreadState::Waiting);
        platform.set_now(50);
        kernel.scheduler().handle_timer_interrupt(0);
        assert_eq!(sleeper.join().unwrap(), Ok(()));
    }

    #[test]
    fn test_termination_interrupts_sleep() {
        let (platform, kernel) = kernel();
        let thread = KThread::create(&kernel, None, 10, 0).unwrap();
        thread.start().unwrap();

        let sleeper = {
            let platform = platform.clone();
            let thread = thread.clone();
            thread::spawn(move || {
                let _bound = platform.bind(thread.id(), 0);
                thread.sleep(Timeout::At(1_000))
            })
        };
        wait_until(|| thread.state() == ThreadState::Waiting);
        thread.request_termination();
        assert_eq!(sleeper.join().unwrap(), Err(KernelError::TerminationRequested));
        assert!(thread.is_termination_requested());
    }
}
