//! Scheduler priority queue
//!
//! Each core has two multi-level run queues:
//! - the *scheduled* queue holds runnable threads whose active core is this core
//! - the *suggested* queue holds runnable threads that could migrate here
//!   because their affinity mask includes this core
//!
//! Within one priority level threads are kept FIFO, which gives round-robin
//! among equal priorities. A 64-bit bitmap per core tracks which levels are
//! non-empty so the front thread is found with a single trailing-zero count.
//!
//! The queue is only touched with the global scheduling lock held.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::types::{CoreId, CoreMask, Priority, ThreadId, NUM_PRIORITIES};

// ============================================================================
// Queue Member
// ============================================================================

/// Scheduling attributes of a queued thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueMember {
    pub id: ThreadId,
    pub priority: Priority,
    pub affinity: CoreMask,
    pub active_core: Option<CoreId>,
}

// ============================================================================
// Per-core Run Queue
// ============================================================================

/// Multi-priority FIFO run queue with bitmap lookup
#[derive(Debug)]
pub struct CoreRunQueue {
    levels: Vec<VecDeque<ThreadId>>,
    /// Bit `p` set when level `p` is non-empty
    bitmap: u64,
}

impl CoreRunQueue {
    pub fn new() -> Self {
        Self {
            levels: (0..NUM_PRIORITIES).map(|_| VecDeque::new()).collect(),
            bitmap: 0,
        }
    }

    fn level(priority: Priority) -> usize {
        assert!(
            (0..NUM_PRIORITIES as Priority).contains(&priority),
            "priority {} out of range",
            priority
        );
        priority as usize
    }

    pub fn push_back(&mut self, priority: Priority, thread: ThreadId) {
        let level = Self::level(priority);
        self.levels[level].push_back(thread);
        self.bitmap |= 1 << level;
    }

    pub fn push_front(&mut self, priority: Priority, thread: ThreadId) {
        let level = Self::level(priority);
        self.levels[level].push_front(thread);
        self.bitmap |= 1 << level;
    }

    /// Remove a thread from its level; returns false if it was not queued
    pub fn remove(&mut self, priority: Priority, thread: ThreadId) -> bool {
        let level = Self::level(priority);
        let queue = &mut self.levels[level];
        let Some(pos) = queue.iter().position(|id| *id == thread) else {
            return false;
        };
        queue.remove(pos);
        if queue.is_empty() {
            self.bitmap &= !(1 << level);
        }
        true
    }

    /// Highest-priority thread, oldest first within a level
    pub fn front(&self) -> Option<ThreadId> {
        let level = self.highest_level()?;
        self.levels[level].front().copied()
    }

    /// Front thread of one priority level
    pub fn front_at(&self, priority: Priority) -> Option<ThreadId> {
        self.levels[Self::level(priority)].front().copied()
    }

    /// Highest non-empty priority level
    pub fn highest_level(&self) -> Option<usize> {
        if self.bitmap == 0 {
            None
        } else {
            Some(self.bitmap.trailing_zeros() as usize)
        }
    }

    /// All queued threads in scheduling order
    pub fn iter(&self) -> impl Iterator<Item = ThreadId> + '_ {
        let bitmap = self.bitmap;
        (0..NUM_PRIORITIES)
            .filter(move |level| bitmap & (1 << level) != 0)
            .flat_map(move |level| self.levels[level].iter().copied())
    }

    pub fn is_empty(&self) -> bool {
        self.bitmap == 0
    }

    pub fn len(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }
}

impl Default for CoreRunQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Priority Queue
// ============================================================================

/// Scheduled and suggested run queues for every core
#[derive(Debug)]
pub struct PriorityQueue {
    num_cores: usize,
    scheduled: Vec<CoreRunQueue>,
    suggested: Vec<CoreRunQueue>,
}

impl PriorityQueue {
    pub fn new(num_cores: usize) -> Self {
        Self {
            num_cores,
            scheduled: (0..num_cores).map(|_| CoreRunQueue::new()).collect(),
            suggested: (0..num_cores).map(|_| CoreRunQueue::new()).collect(),
        }
    }

    pub fn num_cores(&self) -> usize {
        self.num_cores
    }

    fn suggested_cores(&self, member: &QueueMember) -> impl Iterator<Item = CoreId> {
        let active = member.active_core;
        let num_cores = self.num_cores;
        member
            .affinity
            .iter()
            .filter(move |core| *core < num_cores && Some(*core) != active)
    }

    /// Queue a newly runnable thread behind its equals
    pub fn push_back(&mut self, member: &QueueMember) {
        if let Some(core) = member.active_core {
            self.scheduled[core].push_back(member.priority, member.id);
        }
        let cores: Vec<CoreId> = self.suggested_cores(member).collect();
        for core in cores {
            self.suggested[core].push_back(member.priority, member.id);
        }
    }

    /// Queue a thread ahead of its equals
    pub fn push_front(&mut self, member: &QueueMember) {
        if let Some(core) = member.active_core {
            self.scheduled[core].push_front(member.priority, member.id);
        }
        let cores: Vec<CoreId> = self.suggested_cores(member).collect();
        for core in cores {
            self.suggested[core].push_front(member.priority, member.id);
        }
    }

    pub fn remove(&mut self, member: &QueueMember) {
        if let Some(core) = member.active_core {
            self.scheduled[core].remove(member.priority, member.id);
        }
        let cores: Vec<CoreId> = self.suggested_cores(member).collect();
        for core in cores {
            self.suggested[core].remove(member.priority, member.id);
        }
    }

    /// Requeue after a priority change. A running thread keeps its turn.
    pub fn change_priority(&mut self, previous: Priority, member: &QueueMember, is_running: bool) {
        let old = QueueMember {
            priority: previous,
            ..*member
        };
        self.remove(&old);
        if is_running {
            self.push_front(member);
        } else {
            self.push_back(member);
        }
    }

    /// Requeue after the affinity mask or active core changed
    pub fn change_affinity(
        &mut self,
        previous_core: Option<CoreId>,
        previous_affinity: CoreMask,
        member: &QueueMember,
    ) {
        let old = QueueMember {
            active_core: previous_core,
            affinity: previous_affinity,
            ..*member
        };
        self.remove(&old);
        self.push_back(member);
    }

    /// Move a queued thread's scheduled entry from `previous_core` to its
    /// new active core, leaving a suggestion behind on the old one
    pub fn change_core(&mut self, previous_core: Option<CoreId>, member: &QueueMember, to_front: bool) {
        if previous_core == member.active_core {
            return;
        }
        if let Some(prev) = previous_core {
            self.scheduled[prev].remove(member.priority, member.id);
            if member.affinity.contains(prev) {
                self.suggested[prev].push_back(member.priority, member.id);
            }
        }
        if let Some(core) = member.active_core {
            self.suggested[core].remove(member.priority, member.id);
            if to_front {
                self.scheduled[core].push_front(member.priority, member.id);
            } else {
                self.scheduled[core].push_back(member.priority, member.id);
            }
        }
    }

    /// Rotate a thread to the back of its level on its active core
    ///
    /// Returns the new front of that level.
    pub fn move_to_scheduled_back(&mut self, member: &QueueMember) -> Option<ThreadId> {
        let core = member.active_core?;
        let queue = &mut self.scheduled[core];
        if queue.remove(member.priority, member.id) {
            queue.push_back(member.priority, member.id);
        }
        queue.front_at(member.priority)
    }

    pub fn scheduled_front(&self, core: CoreId) -> Option<ThreadId> {
        self.scheduled[core].front()
    }

    pub fn scheduled(&self, core: CoreId) -> &CoreRunQueue {
        &self.scheduled[core]
    }

    pub fn suggested_front(&self, core: CoreId) -> Option<ThreadId> {
        self.suggested[core].front()
    }

    pub fn suggested(&self, core: CoreId) -> &CoreRunQueue {
        &self.suggested[core]
    }
}
