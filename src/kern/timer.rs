//! Hardware Timer - per-core timeout tasks
//!
//! Every core owns one comparator interrupt. Armed deadlines are kept in a
//! balanced tree ordered by (deadline, arming order), so equal deadlines fire
//! in the order they were registered. The comparator is always programmed
//! with the earliest deadline; when it fires, every expired task is popped and
//! its thread's timeout handler runs under the scheduling lock.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::types::{CoreId, ThreadId, Tick};

// ============================================================================
// Timer Keys
// ============================================================================

/// Handle to an armed timeout task
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerKey {
    pub core: CoreId,
    pub deadline: Tick,
    /// Arming order, breaks ties between equal deadlines
    pub sequence: u64,
}

// ============================================================================
// Hardware Timer
// ============================================================================

/// Sorted set of timeout tasks for one core
#[derive(Debug)]
pub struct HardwareTimer {
    core: CoreId,
    tasks: BTreeMap<(Tick, u64), ThreadId>,
    next_sequence: u64,
    /// Deadline last written to the comparator
    programmed: Option<Tick>,
}

impl HardwareTimer {
    pub const fn new(core: CoreId) -> Self {
        Self {
            core,
            tasks: BTreeMap::new(),
            next_sequence: 0,
            programmed: None,
        }
    }

    /// Arm a timeout task for `thread` at an absolute tick
    pub fn register(&mut self, thread: ThreadId, deadline: Tick) -> TimerKey {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.tasks.insert((deadline, sequence), thread);
        TimerKey {
            core: self.core,
            deadline,
            sequence,
        }
    }

    /// Disarm a task. Returns false if it already fired.
    pub fn cancel(&mut self, key: TimerKey) -> bool {
        debug_assert_eq!(key.core, self.core);
        self.tasks.remove(&(key.deadline, key.sequence)).is_some()
    }

    /// Remove and return every task due at `now`, earliest first
    pub fn pop_expired(&mut self, now: Tick) -> Vec<(TimerKey, ThreadId)> {
        let mut expired = Vec::new();
        while let Some(entry) = self.tasks.first_entry() {
            let (deadline, sequence) = *entry.key();
            if deadline > now {
                break;
            }
            let thread = entry.remove();
            expired.push((
                TimerKey {
                    core: self.core,
                    deadline,
                    sequence,
                },
                thread,
            ));
        }
        expired
    }

    /// Earliest armed deadline
    pub fn next_deadline(&self) -> Option<Tick> {
        self.tasks.keys().next().map(|(deadline, _)| *deadline)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Comparator value that should be programmed, if it changed
    pub fn take_reprogram(&mut self) -> Option<Option<Tick>> {
        let next = self.next_deadline();
        if next == self.programmed {
            None
        } else {
            self.programmed = next;
            Some(next)
        }
    }
}
