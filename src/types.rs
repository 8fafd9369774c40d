//! Common types used across the kernel core
//!
//! This module defines shared identifiers and time/priority types to avoid
//! circular dependencies between the scheduler, objects and IPC layers.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Thread identifier
///
/// Stable key of a thread's record in the scheduler arena. Identifiers are
/// never reused, so a stale id simply fails to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ThreadId(pub u64);

impl ThreadId {
    /// Create a new thread ID with a unique auto-incremented value
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ThreadId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ProcessId(pub u64);

impl ProcessId {
    /// Create a new process ID with a unique auto-incremented value
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ProcessId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Kernel object identifier
///
/// Every kernel object gets one at construction. Wait lists are keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// Generate a new unique object ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ObjectId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

// ============================================================================
// Cores
// ============================================================================

/// Physical core index
pub type CoreId = usize;

/// Maximum number of physical cores the scheduler supports
pub const MAX_CORES: usize = 4;

/// Bitset of physical cores
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct CoreMask(pub u64);

impl CoreMask {
    /// No cores
    pub const EMPTY: Self = Self(0);

    /// Mask containing a single core
    pub const fn single(core: CoreId) -> Self {
        Self(1 << core)
    }

    /// Mask containing cores `0..count`
    pub const fn all(count: usize) -> Self {
        if count >= 64 {
            Self(u64::MAX)
        } else {
            Self((1u64 << count) - 1)
        }
    }

    pub const fn contains(&self, core: CoreId) -> bool {
        core < 64 && self.0 & (1 << core) != 0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, core: CoreId) {
        self.0 |= 1 << core;
    }

    pub fn remove(&mut self, core: CoreId) {
        self.0 &= !(1 << core);
    }

    /// Lowest core in the mask
    pub fn first(&self) -> Option<CoreId> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as CoreId)
        }
    }

    /// Iterate over the cores in ascending order
    pub fn iter(&self) -> impl Iterator<Item = CoreId> {
        let bits = self.0;
        (0..64).filter(move |core| bits & (1 << core) != 0)
    }

    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }
}

impl fmt::Debug for CoreMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoreMask({:#06b})", self.0)
    }
}

// ============================================================================
// Priorities
// ============================================================================

/// Thread priority. Lower value means higher priority.
pub type Priority = i32;

/// Highest (numerically lowest) thread priority
pub const HIGHEST_THREAD_PRIORITY: Priority = 0;

/// Lowest (numerically highest) thread priority
pub const LOWEST_THREAD_PRIORITY: Priority = 63;

/// Number of priority levels
pub const NUM_PRIORITIES: usize = (LOWEST_THREAD_PRIORITY - HIGHEST_THREAD_PRIORITY + 1) as usize;

/// Priority given to threads created without an explicit one
pub const DEFAULT_THREAD_PRIORITY: Priority = 44;

/// Check that a priority lies in the valid range
pub const fn is_valid_priority(priority: Priority) -> bool {
    priority >= HIGHEST_THREAD_PRIORITY && priority <= LOWEST_THREAD_PRIORITY
}

// ============================================================================
// Time
// ============================================================================

/// Hardware timer tick count
pub type Tick = i64;

/// How long a blocking operation may wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Never block; fail with `TimedOut` if the operation cannot complete now
    Poll,
    /// Block until woken, without a deadline
    None,
    /// Block until the given absolute tick
    At(Tick),
}

impl Timeout {
    /// Deadline tick, if the timeout arms a timer
    pub const fn deadline(&self) -> Option<Tick> {
        match self {
            Timeout::At(tick) => Some(*tick),
            _ => None,
        }
    }

    /// True if waiting is no longer allowed at `now`
    pub const fn is_expired(&self, now: Tick) -> bool {
        match self {
            Timeout::Poll => true,
            Timeout::None => false,
            Timeout::At(tick) => *tick <= now,
        }
    }
}
