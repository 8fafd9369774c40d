//! Process capabilities
//!
//! The subset of a process's capability set the core enforces: which cores
//! and priorities its threads may use, and how many handles it may hold.

use crate::config::{KernelConfig, MAX_HANDLE_TABLE_SIZE};
use crate::result::{KernelError, KernelResult};
use crate::types::{
    is_valid_priority, CoreId, CoreMask, Priority, HIGHEST_THREAD_PRIORITY, LOWEST_THREAD_PRIORITY,
};

/// Core, priority and handle table grants of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    core_mask: CoreMask,
    priority_mask: u64,
    handle_table_size: usize,
}

impl Capabilities {
    /// Every core and priority, with the configured handle table size
    pub fn unrestricted(config: &KernelConfig) -> Self {
        let mut priority_mask = 0;
        for priority in HIGHEST_THREAD_PRIORITY..=LOWEST_THREAD_PRIORITY {
            priority_mask |= 1u64 << priority;
        }
        Self {
            core_mask: CoreMask::all(config.num_cores),
            priority_mask,
            handle_table_size: config.handle_table_size,
        }
    }

    /// Grant cores `min_core..=max_core` and priorities `highest..=lowest`
    pub fn with_core_priority(
        config: &KernelConfig,
        min_core: CoreId,
        max_core: CoreId,
        highest: Priority,
        lowest: Priority,
    ) -> KernelResult<Self> {
        if min_core > max_core || highest > lowest {
            return Err(KernelError::InvalidCombination);
        }
        if max_core >= config.num_cores {
            return Err(KernelError::InvalidCoreId);
        }
        if !is_valid_priority(highest) || !is_valid_priority(lowest) {
            return Err(KernelError::InvalidPriority);
        }

        let mut core_mask = CoreMask::EMPTY;
        for core in min_core..=max_core {
            core_mask.insert(core);
        }
        let mut priority_mask = 0;
        for priority in highest..=lowest {
            priority_mask |= 1u64 << priority;
        }
        Ok(Self {
            core_mask,
            priority_mask,
            handle_table_size: config.handle_table_size,
        })
    }

    /// Cap the handle table; zero keeps the configured size
    pub fn with_handle_table_size(mut self, size: usize) -> Self {
        if size != 0 {
            self.handle_table_size = size.min(MAX_HANDLE_TABLE_SIZE);
        }
        self
    }

    pub fn core_mask(&self) -> CoreMask {
        self.core_mask
    }

    pub fn priority_mask(&self) -> u64 {
        self.priority_mask
    }

    pub fn handle_table_size(&self) -> usize {
        self.handle_table_size
    }

    pub fn check_priority(&self, priority: Priority) -> KernelResult<()> {
        if !is_valid_priority(priority) || self.priority_mask & (1u64 << priority) == 0 {
            return Err(KernelError::InvalidPriority);
        }
        Ok(())
    }

    pub fn check_core(&self, core: CoreId) -> KernelResult<()> {
        if !self.core_mask.contains(core) {
            return Err(KernelError::InvalidCoreId);
        }
        Ok(())
    }

    /// An affinity is allowed when every core in it is granted
    pub fn check_core_mask(&self, mask: CoreMask) -> KernelResult<()> {
        if mask.0 & !self.core_mask.0 != 0 {
            return Err(KernelError::InvalidCoreId);
        }
        Ok(())
    }
}
