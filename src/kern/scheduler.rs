//! Scheduler and the global scheduling lock
//!
//! All thread state lives in one [`SchedulerState`] guarded by a single
//! reentrant lock shared by every core. Entering the lock from a context that
//! already holds it only bumps a recursion count, so an operation can make
//! several state changes across nested helpers and pay for one reschedule.
//!
//! Leaving the outermost scope runs the reschedule decision exactly once:
//! 1. recompute the highest-priority runnable thread of every core, letting
//!    idle cores pull suggested threads from their neighbours
//! 2. reprogram any timer comparator whose earliest deadline moved
//! 3. release the lock, then unpark threads that became runnable
//! 4. IPI every other core whose choice changed, and switch the local core
//!
//! A remote core acts on the IPI at its next safe point
//! ([`Scheduler::reschedule_core`]). Until then it keeps running its old
//! thread, which is always correct, merely late.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell, RefMut};
use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use log::{error, trace};
use spin::{Mutex, MutexGuard};

use super::lock::SimpleLock;
use super::priority_queue::PriorityQueue;
use super::queue::ListArena;
use super::thread::{ThreadRecord, ThreadState};
use super::timer::{HardwareTimer, TimerKey};
use crate::arch::Platform;
use crate::result::KernelError;
use crate::types::{CoreId, CoreMask, ObjectId, Priority, ThreadId, Tick, Timeout};

// ============================================================================
// Per-core State
// ============================================================================

/// Scheduling view of one physical core
#[derive(Debug, Clone, Copy, Default)]
pub struct CoreState {
    /// Thread the core is running (`None` is the idle thread)
    pub current: Option<ThreadId>,
    /// Thread the last reschedule decision picked for this core
    pub highest: Option<ThreadId>,
    /// Set when `highest` changed and the core has not switched yet
    pub needs_scheduling: bool,
    /// Context switches performed
    pub switch_count: u64,
}

/// How a running thread gives up the rest of its turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YieldKind {
    /// Rotate behind equal-priority threads on the same core
    WithoutMigration,
    /// Rotate, and move to an idle eligible core if there is one
    WithMigration,
    /// Move to any eligible core running something less important
    ToAnyThread,
}

// ============================================================================
// Scheduler State
// ============================================================================

/// Everything protected by the scheduling lock
pub struct SchedulerState {
    num_cores: usize,
    threads: BTreeMap<ThreadId, ThreadRecord>,
    queue: PriorityQueue,
    cores: Vec<CoreState>,
    pub(super) wait_lists: ListArena<ObjectId, ThreadId>,
    timers: Vec<HardwareTimer>,
    /// Threads made runnable from a wait, unparked once the lock drops
    wakeups: Vec<ThreadId>,
}

impl SchedulerState {
    pub fn new(num_cores: usize) -> Self {
        Self {
            num_cores,
            threads: BTreeMap::new(),
            queue: PriorityQueue::new(num_cores),
            cores: alloc::vec![CoreState::default(); num_cores],
            wait_lists: ListArena::new(),
            timers: (0..num_cores).map(HardwareTimer::new).collect(),
            wakeups: Vec::new(),
        }
    }

    pub fn num_cores(&self) -> usize {
        self.num_cores
    }

    // ------------------------------------------------------------------------
    // Thread arena
    // ------------------------------------------------------------------------

    pub fn insert_thread(&mut self, record: ThreadRecord) {
        let id = record.id;
        let runnable = record.state == ThreadState::Runnable;
        let member = record.queue_member();
        self.threads.insert(id, record);
        if runnable {
            self.queue.push_back(&member);
        }
    }

    /// Drop a thread's record, detaching it from every scheduler structure
    pub fn remove_thread(&mut self, id: ThreadId) -> Option<ThreadRecord> {
        if !self.threads.contains_key(&id) {
            return None;
        }
        self.unlink_waiter(id);
        let record = self.threads.remove(&id)?;
        if record.state == ThreadState::Runnable {
            self.queue.remove(&record.queue_member());
        }
        if let Some(key) = record.timer {
            self.timers[key.core].cancel(key);
        }
        self.wakeups.retain(|thread| *thread != id);
        for core in self.cores.iter_mut() {
            if core.current == Some(id) {
                core.current = None;
                core.needs_scheduling = true;
            }
            if core.highest == Some(id) {
                core.highest = None;
                core.needs_scheduling = true;
            }
        }
        Some(record)
    }

    pub fn thread(&self, id: ThreadId) -> &ThreadRecord {
        match self.threads.get(&id) {
            Some(record) => record,
            None => panic!("unknown thread {:?}", id),
        }
    }

    pub fn thread_mut(&mut self, id: ThreadId) -> &mut ThreadRecord {
        match self.threads.get_mut(&id) {
            Some(record) => record,
            None => panic!("unknown thread {:?}", id),
        }
    }

    pub fn thread_opt(&self, id: ThreadId) -> Option<&ThreadRecord> {
        self.threads.get(&id)
    }

    pub fn thread_opt_mut(&mut self, id: ThreadId) -> Option<&mut ThreadRecord> {
        self.threads.get_mut(&id)
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    // ------------------------------------------------------------------------
    // State transitions
    // ------------------------------------------------------------------------

    /// Move a thread to `new`, keeping the run queue in step
    pub fn set_thread_state(&mut self, id: ThreadId, new: ThreadState) {
        let record = self.thread_mut(id);
        let old = record.state;
        if old == new {
            return;
        }
        record.state = new;
        let member = record.queue_member();
        if old == ThreadState::Runnable {
            self.queue.remove(&member);
        }
        if new == ThreadState::Runnable {
            self.queue.push_back(&member);
        }
        if old == ThreadState::Waiting && new == ThreadState::Runnable {
            self.wakeups.push(id);
        }
    }

    pub fn set_priority(&mut self, id: ThreadId, priority: Priority) {
        let running = self.is_running(id);
        let record = self.thread_mut(id);
        let previous = record.priority;
        if previous == priority {
            return;
        }
        record.priority = priority;
        let member = record.queue_member();
        if record.state == ThreadState::Runnable {
            self.queue.change_priority(previous, &member, running);
        }
    }

    /// Change affinity. A thread whose active core leaves the mask moves to
    /// `ideal_core`; the next reschedule migrates it.
    pub fn set_affinity(&mut self, id: ThreadId, ideal_core: CoreId, mask: CoreMask) {
        let record = self.thread_mut(id);
        let previous_core = record.active_core;
        let previous_mask = record.affinity;
        record.affinity = mask;
        record.ideal_core = ideal_core;
        if previous_core.map_or(true, |core| !mask.contains(core)) {
            record.active_core = Some(ideal_core);
        }
        let member = record.queue_member();
        if record.state == ThreadState::Runnable {
            self.queue.change_affinity(previous_core, previous_mask, &member);
        }
    }

    pub fn yield_thread(&mut self, id: ThreadId, kind: YieldKind) {
        let record = self.thread(id);
        if record.state != ThreadState::Runnable {
            return;
        }
        let member = record.queue_member();
        self.queue.move_to_scheduled_back(&member);

        let target = match kind {
            YieldKind::WithoutMigration => None,
            YieldKind::WithMigration => member
                .affinity
                .iter()
                .filter(|core| *core < self.num_cores && Some(*core) != member.active_core)
                .find(|core| self.queue.scheduled_front(*core).is_none()),
            YieldKind::ToAnyThread => member
                .affinity
                .iter()
                .filter(|core| *core < self.num_cores && Some(*core) != member.active_core)
                .find(|core| match self.queue.scheduled_front(*core) {
                    None => true,
                    Some(front) => self.thread(front).priority > member.priority,
                }),
        };

        if let Some(core) = target {
            let previous = member.active_core;
            self.thread_mut(id).active_core = Some(core);
            let moved = self.thread(id).queue_member();
            self.queue.change_core(previous, &moved, false);
        }
    }

    /// Begin thread exit. The thread is terminated once no core runs it.
    pub fn exit_thread(&mut self, id: ThreadId) {
        // Latched so nothing the exiting thread still does can start a wait
        self.thread_mut(id).termination_requested = true;
        self.set_thread_state(id, ThreadState::Terminating);
        if !self.is_running(id) {
            self.finish_termination(id);
        }
    }

    fn finish_termination(&mut self, id: ThreadId) {
        self.set_thread_state(id, ThreadState::Terminated);
        let object = self.thread(id).object_id;
        trace!("thread {:?} terminated", id);
        // A terminated thread is signaled for anyone waiting on it
        self.notify_waiters(object, Ok(()));
    }

    // ------------------------------------------------------------------------
    // Cores
    // ------------------------------------------------------------------------

    pub fn core(&self, core: CoreId) -> &CoreState {
        &self.cores[core]
    }

    pub fn is_running(&self, id: ThreadId) -> bool {
        self.cores.iter().any(|core| core.current == Some(id))
    }

    pub fn queue(&self) -> &PriorityQueue {
        &self.queue
    }

    /// Pick the highest-priority thread for every core
    ///
    /// Returns the cores whose choice changed.
    pub fn update_highest_priority_threads(&mut self) -> CoreMask {
        let mut top: Vec<Option<ThreadId>> = (0..self.num_cores)
            .map(|core| self.queue.scheduled_front(core))
            .collect();

        // Idle cores take the best suggestion that is not another core's top
        for core in 0..self.num_cores {
            if top[core].is_some() {
                continue;
            }
            let candidates: Vec<ThreadId> = self.queue.suggested(core).iter().collect();
            for candidate in candidates {
                let previous = self.thread(candidate).active_core;
                if previous.is_some_and(|active| top[active] == Some(candidate)) {
                    continue;
                }
                self.thread_mut(candidate).active_core = Some(core);
                let member = self.thread(candidate).queue_member();
                self.queue.change_core(previous, &member, true);
                trace!("migrating {:?} from {:?} to core {}", candidate, previous, core);
                top[core] = Some(candidate);
                break;
            }
        }

        let mut changed = CoreMask::EMPTY;
        for (core, state) in self.cores.iter_mut().enumerate() {
            if state.highest != top[core] {
                state.highest = top[core];
                state.needs_scheduling = true;
                changed.insert(core);
            }
        }
        changed
    }

    /// Switch `core` to its chosen thread if a reschedule is pending
    pub fn switch_to_highest(&mut self, core: CoreId) {
        let state = &mut self.cores[core];
        if !state.needs_scheduling {
            return;
        }
        state.needs_scheduling = false;
        let previous = state.current;
        let next = state.highest;
        if previous == next {
            return;
        }
        state.current = next;
        state.switch_count += 1;
        trace!("core {} switch {:?} -> {:?}", core, previous, next);

        if let Some(previous) = previous {
            let terminating = self
                .thread_opt(previous)
                .is_some_and(|record| record.state == ThreadState::Terminating);
            if terminating && !self.is_running(previous) {
                self.finish_termination(previous);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    pub fn timer_mut(&mut self, core: CoreId) -> &mut HardwareTimer {
        &mut self.timers[core]
    }

    /// Arm a timeout task for a waiting thread
    pub fn register_timeout(&mut self, thread: ThreadId, core: CoreId, deadline: Tick) -> TimerKey {
        let key = self.timers[core].register(thread, deadline);
        let record = self.thread_mut(thread);
        if let Some(old) = record.timer.replace(key) {
            self.timers[old.core].cancel(old);
        }
        key
    }

    /// Fire every task on `core` due at `now`
    pub fn fire_timers(&mut self, core: CoreId, now: Tick) -> usize {
        let expired = self.timers[core].pop_expired(now);
        let count = expired.len();
        for (key, thread) in expired {
            self.on_timeout(thread, key);
        }
        count
    }

    fn take_timer_reprograms(&mut self) -> Vec<(CoreId, Option<Tick>)> {
        self.timers
            .iter_mut()
            .enumerate()
            .filter_map(|(core, timer)| timer.take_reprogram().map(|deadline| (core, deadline)))
            .collect()
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Cell that only the scheduling lock owner touches
struct StateCell(RefCell<SchedulerState>);

// The lock serializes all access, and every borrow is scoped to a guard.
unsafe impl Sync for StateCell {}

/// Global scheduler shared by all cores
pub struct Scheduler {
    platform: Arc<dyn Platform>,
    lock: SimpleLock,
    /// Context id of the holder, 0 when free
    owner: AtomicU64,
    /// Recursion depth, only written by the holder
    count: AtomicU32,
    /// Interrupt state saved by the outermost acquisition
    interrupts: AtomicBool,
    state: StateCell,
}

impl Scheduler {
    pub fn new(platform: Arc<dyn Platform>, num_cores: usize) -> Self {
        Self {
            platform,
            lock: SimpleLock::new(),
            owner: AtomicU64::new(0),
            count: AtomicU32::new(0),
            interrupts: AtomicBool::new(false),
            state: StateCell(RefCell::new(SchedulerState::new(num_cores))),
        }
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// Enter the scheduling lock
    pub fn lock(&self) -> SchedulerLock<'_> {
        let context = self.platform.context_id();
        if self.owner.load(Ordering::Acquire) == context {
            self.count.fetch_add(1, Ordering::Relaxed);
        } else {
            let enabled = self.platform.disable_interrupts();
            self.lock.lock();
            self.owner.store(context, Ordering::Release);
            self.count.store(1, Ordering::Relaxed);
            self.interrupts.store(enabled, Ordering::Relaxed);
        }
        SchedulerLock {
            scheduler: self,
            _not_send: PhantomData,
        }
    }

    /// Enter the scheduling lock on behalf of `thread`, arming `timeout` on
    /// it when the scope ends if it went to sleep
    pub fn lock_and_sleep(&self, thread: ThreadId, timeout: Timeout) -> SchedulerLockAndSleep<'_> {
        SchedulerLockAndSleep {
            lock: self.lock(),
            thread,
            deadline: Cell::new(timeout.deadline()),
        }
    }

    /// Whether the executing context holds the lock
    pub fn is_locked_by_current(&self) -> bool {
        self.owner.load(Ordering::Acquire) == self.platform.context_id()
    }

    fn unlock(&self) {
        if !self.is_locked_by_current() {
            error!("scheduling lock released by a context that does not hold it");
            panic!("scheduling lock not held");
        }
        let depth = self.count.load(Ordering::Relaxed) - 1;
        self.count.store(depth, Ordering::Relaxed);
        if depth > 0 {
            return;
        }

        let (changed, wakeups, reprograms) = {
            let mut state = self.state.0.borrow_mut();
            let changed = state.update_highest_priority_threads();
            let wakeups = core::mem::take(&mut state.wakeups);
            (changed, wakeups, state.take_timer_reprograms())
        };
        for (core, deadline) in reprograms {
            self.platform.arm_timer(core, deadline);
        }

        let enabled = self.interrupts.load(Ordering::Relaxed);
        self.owner.store(0, Ordering::Release);
        self.lock.unlock();
        self.platform.restore_interrupts(enabled);

        for thread in wakeups {
            self.platform.unpark(thread);
        }
        self.enable_scheduling(changed);
    }

    fn enable_scheduling(&self, cores: CoreMask) {
        if cores.is_empty() {
            return;
        }
        let local = self.platform.current_core();
        let mut remote = cores;
        remote.remove(local);
        if !remote.is_empty() {
            trace!("reschedule IPI to {:?}", remote);
            self.platform.send_ipi(remote);
        }
        if cores.contains(local) {
            self.reschedule_core(local);
        }
    }

    /// Safe point: switch `core` to the thread chosen for it
    pub fn reschedule_core(&self, core: CoreId) {
        let guard = self.lock();
        guard.state().switch_to_highest(core);
    }

    /// Block the calling context until `thread` is made runnable
    pub fn park(&self, thread: ThreadId) {
        if self.is_locked_by_current() {
            error!("thread {:?} sleeping inside the scheduling lock", thread);
            panic!("sleeping with the scheduling lock held");
        }
        self.platform.park(thread);
    }

    /// Timer interrupt bottom half for `core`
    pub fn handle_timer_interrupt(&self, core: CoreId) -> usize {
        let now = self.platform.now();
        let guard = self.lock();
        let fired = guard.state().fire_timers(core, now);
        fired
    }

    pub fn current_thread(&self, core: CoreId) -> Option<ThreadId> {
        self.lock().state().core(core).current
    }

    pub fn highest_priority_thread(&self, core: CoreId) -> Option<ThreadId> {
        self.lock().state().core(core).highest
    }

    pub fn thread_state(&self, thread: ThreadId) -> Option<ThreadState> {
        self.lock().state().thread_opt(thread).map(|record| record.state)
    }
}

// ============================================================================
// Guards
// ============================================================================

/// Object state that is only touched with the scheduling lock held
///
/// Access takes the scheduler state as proof that the caller is inside the
/// lock, which keeps signal checks and wait list changes atomic together.
pub struct SchedProtected<T>(Mutex<T>);

impl<T> SchedProtected<T> {
    pub const fn new(value: T) -> Self {
        Self(Mutex::new(value))
    }

    pub fn get<'a>(&'a self, _locked: &SchedulerState) -> MutexGuard<'a, T> {
        self.0.lock()
    }
}

/// Scoped hold on the scheduling lock
///
/// Dropping the outermost guard runs the reschedule decision.
pub struct SchedulerLock<'a> {
    scheduler: &'a Scheduler,
    _not_send: PhantomData<*const ()>,
}

impl<'a> SchedulerLock<'a> {
    /// Borrow the protected state
    ///
    /// Borrows must not overlap; nested helpers take the state as a parameter.
    pub fn state(&self) -> RefMut<'_, SchedulerState> {
        match self.scheduler.state.0.try_borrow_mut() {
            Ok(state) => state,
            Err(_) => {
                error!("overlapping borrow of scheduler state");
                panic!("scheduler state already borrowed");
            }
        }
    }

    pub fn scheduler(&self) -> &'a Scheduler {
        self.scheduler
    }
}

impl<'a> Drop for SchedulerLock<'a> {
    fn drop(&mut self) {
        self.scheduler.unlock();
    }
}

/// Scheduling lock scope that arms a timeout for a sleeping thread
///
/// The timeout is registered as the scope ends, still inside the lock, so a
/// timer cannot fire before the thread is marked waiting. A deadline already
/// in the past times the wait out on the spot. `cancel_sleep` drops the
/// timeout when the caller decides not to sleep after all.
pub struct SchedulerLockAndSleep<'a> {
    lock: SchedulerLock<'a>,
    thread: ThreadId,
    deadline: Cell<Option<Tick>>,
}

impl<'a> SchedulerLockAndSleep<'a> {
    pub fn state(&self) -> RefMut<'_, SchedulerState> {
        self.lock.state()
    }

    pub fn cancel_sleep(&self) {
        self.deadline.set(None);
    }

    pub fn lock(&self) -> &SchedulerLock<'a> {
        &self.lock
    }
}

impl<'a> Drop for SchedulerLockAndSleep<'a> {
    fn drop(&mut self) {
        let Some(deadline) = self.deadline.get() else {
            return;
        };
        let platform = self.lock.scheduler.platform.clone();
        let mut state = self.lock.state();
        let waiting = state
            .thread_opt(self.thread)
            .is_some_and(|record| record.state == ThreadState::Waiting);
        if !waiting {
            return;
        }
        if deadline > platform.now() {
            state.register_timeout(self.thread, platform.current_core(), deadline);
        } else {
            state.cancel_wait(self.thread, Err(KernelError::TimedOut), true);
        }
    }
}
