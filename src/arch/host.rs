//! Host platform backed by std threads
//!
//! Each host thread is one execution context. A context becomes a kernel
//! thread by binding it with [`HostPlatform::bind`]; blocking waits then park
//! the host thread on a per-thread wake token. Time only moves when the test
//! advances the manual clock, and IPIs and timer comparator writes are
//! recorded rather than delivered.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::vec::Vec;

use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use super::Platform;
use crate::types::{CoreId, CoreMask, ThreadId, Tick};

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);
static NEXT_PLATFORM: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy)]
struct Binding {
    platform: u64,
    thread: Option<ThreadId>,
    core: CoreId,
}

std::thread_local! {
    static CONTEXT_ID: Cell<u64> = const { Cell::new(0) };
    static BINDING: Cell<Option<Binding>> = const { Cell::new(None) };
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Platform implementation for hosted builds and tests
pub struct HostPlatform {
    id: u64,
    num_cores: usize,
    clock: AtomicI64,
    ipis: Mutex<Vec<CoreMask>>,
    timers: Mutex<Vec<Option<Tick>>>,
    tokens: Mutex<BTreeMap<ThreadId, bool>>,
    wake: Condvar,
}

/// Binding of the current host thread to a kernel thread and core
///
/// Dropping it returns the host thread to the unbound state.
pub struct ContextBinding {
    previous: Option<Binding>,
}

impl Drop for ContextBinding {
    fn drop(&mut self) {
        BINDING.with(|binding| binding.set(self.previous));
    }
}

impl HostPlatform {
    pub fn new(num_cores: usize) -> Self {
        Self {
            id: NEXT_PLATFORM.fetch_add(1, Ordering::Relaxed),
            num_cores,
            clock: AtomicI64::new(0),
            ipis: Mutex::new(Vec::new()),
            timers: Mutex::new(alloc::vec![None; num_cores]),
            tokens: Mutex::new(BTreeMap::new()),
            wake: Condvar::new(),
        }
    }

    /// Run the current host thread as `thread` on `core`
    pub fn bind(&self, thread: ThreadId, core: CoreId) -> ContextBinding {
        self.bind_inner(Some(thread), core)
    }

    /// Run the current host thread on `core` without a kernel thread
    ///
    /// Used to play the role of an interrupt handler on a given core.
    pub fn enter_core(&self, core: CoreId) -> ContextBinding {
        self.bind_inner(None, core)
    }

    fn bind_inner(&self, thread: Option<ThreadId>, core: CoreId) -> ContextBinding {
        let binding = Binding {
            platform: self.id,
            thread,
            core,
        };
        let previous = BINDING.with(|cell| cell.replace(Some(binding)));
        ContextBinding { previous }
    }

    fn binding(&self) -> Option<Binding> {
        BINDING
            .with(|cell| cell.get())
            .filter(|binding| binding.platform == self.id)
    }

    /// Move the clock forward, returning the new tick
    pub fn advance(&self, ticks: Tick) -> Tick {
        self.clock.fetch_add(ticks, Ordering::SeqCst) + ticks
    }

    pub fn set_now(&self, tick: Tick) {
        self.clock.store(tick, Ordering::SeqCst);
    }

    /// Drain the IPIs sent so far
    pub fn take_ipis(&self) -> Vec<CoreMask> {
        core::mem::take(&mut *lock(&self.ipis))
    }

    /// Last comparator value written for `core`
    pub fn armed_timer(&self, core: CoreId) -> Option<Tick> {
        lock(&self.timers).get(core).copied().flatten()
    }
}

impl Platform for HostPlatform {
    fn num_cores(&self) -> usize {
        self.num_cores
    }

    fn current_core(&self) -> CoreId {
        self.binding().map(|binding| binding.core).unwrap_or(0)
    }

    fn context_id(&self) -> u64 {
        CONTEXT_ID.with(|id| {
            if id.get() == 0 {
                id.set(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed));
            }
            id.get()
        })
    }

    fn current_thread(&self) -> Option<ThreadId> {
        self.binding().and_then(|binding| binding.thread)
    }

    fn now(&self) -> Tick {
        self.clock.load(Ordering::SeqCst)
    }

    fn arm_timer(&self, core: CoreId, deadline: Option<Tick>) {
        if let Some(slot) = lock(&self.timers).get_mut(core) {
            *slot = deadline;
        }
    }

    fn send_ipi(&self, cores: CoreMask) {
        lock(&self.ipis).push(cores);
    }

    fn disable_interrupts(&self) -> bool {
        true
    }

    fn restore_interrupts(&self, _enabled: bool) {}

    fn park(&self, thread: ThreadId) {
        let mut tokens = lock(&self.tokens);
        loop {
            if let Some(token) = tokens.get_mut(&thread) {
                if *token {
                    *token = false;
                    return;
                }
            }
            tokens = self
                .wake
                .wait(tokens)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn unpark(&self, thread: ThreadId) {
        lock(&self.tokens).insert(thread, true);
        self.wake.notify_all();
    }
}

/// Spin until `condition` holds, failing the test after a few seconds
#[cfg(test)]
pub fn wait_until(mut condition: impl FnMut() -> bool) {
    let start = std::time::Instant::now();
    while !condition() {
        assert!(
            start.elapsed() < std::time::Duration::from_secs(10),
            "condition not reached"
        );
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
}
