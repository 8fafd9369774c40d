//! Platform abstraction
//!
//! The kernel core never touches hardware directly. Everything it needs from
//! the machine (core identity, the tick counter, the per-core timer comparator,
//! inter-processor interrupts and the interrupt mask) goes through
//! [`Platform`]. The host implementation in [`host`] backs it with std threads
//! so the scheduler and IPC paths can be exercised in tests.

use crate::types::{CoreId, CoreMask, ThreadId, Tick};

#[cfg(any(test, feature = "std"))]
pub mod host;

/// Machine services required by the kernel core
pub trait Platform: Send + Sync {
    /// Number of physical cores
    fn num_cores(&self) -> usize;

    /// Core executing the caller
    fn current_core(&self) -> CoreId;

    /// Nonzero identifier unique to the executing context
    ///
    /// The scheduling lock records its owner with this value, so it must be
    /// stable for the lifetime of the context.
    fn context_id(&self) -> u64;

    /// Kernel thread bound to the executing context, if any
    fn current_thread(&self) -> Option<ThreadId>;

    /// Current value of the system tick counter
    fn now(&self) -> Tick;

    /// Program the core's timer comparator. `None` disarms it.
    fn arm_timer(&self, core: CoreId, deadline: Option<Tick>);

    /// Raise the scheduler IPI on every core in `cores`
    fn send_ipi(&self, cores: CoreMask);

    /// Mask interrupts on the current core, returning the previous state
    fn disable_interrupts(&self) -> bool;

    /// Restore the interrupt state returned by `disable_interrupts`
    fn restore_interrupts(&self, enabled: bool);

    /// Block the execution context backing `thread` until it is made runnable
    ///
    /// Called right after the scheduling lock is released by a thread that
    /// put itself to sleep. Wakeups delivered before the call are not lost.
    fn park(&self, thread: ThreadId);

    /// Release a context blocked in (or about to enter) `park`
    fn unpark(&self, thread: ThreadId);
}
