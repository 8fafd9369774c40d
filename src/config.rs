//! Kernel configuration
//!
//! Boot-time parameters for the kernel core. Values default to the reference
//! console's layout: four cores, 1024-entry handle tables and a 19.2 MHz tick.

use crate::kern::resource_limit::{LimitableResource, LIMITABLE_RESOURCE_COUNT};
use crate::types::MAX_CORES;

/// Largest handle table a process may have
pub const MAX_HANDLE_TABLE_SIZE: usize = 1024;

/// Kernel configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of physical cores the scheduler manages
    pub num_cores: usize,
    /// Capacity of each process handle table
    pub handle_table_size: usize,
    /// Hardware timer frequency
    pub ticks_per_second: i64,
    /// Initial limit values for [`ResourceLimit::with_defaults`](crate::kern::resource_limit::ResourceLimit::with_defaults)
    pub default_limits: [i64; LIMITABLE_RESOURCE_COUNT],
    /// How long internal object creation waits for a resource reservation
    pub reservation_timeout_ns: i64,
}

impl KernelConfig {
    pub const DEFAULT: Self = Self {
        num_cores: MAX_CORES,
        handle_table_size: MAX_HANDLE_TABLE_SIZE,
        ticks_per_second: 19_200_000,
        default_limits: [
            // PhysicalMemoryMax
            0x1_0000_0000,
            // ThreadCountMax
            800,
            // EventCountMax
            900,
            // TransferMemoryCountMax
            200,
            // SessionCountMax
            1133,
        ],
        reservation_timeout_ns: 10_000_000_000,
    };

    pub const fn with_num_cores(mut self, num_cores: usize) -> Self {
        self.num_cores = num_cores;
        self
    }

    pub const fn with_handle_table_size(mut self, size: usize) -> Self {
        self.handle_table_size = size;
        self
    }

    pub const fn with_ticks_per_second(mut self, ticks: i64) -> Self {
        self.ticks_per_second = ticks;
        self
    }

    pub const fn with_limit(mut self, which: LimitableResource, value: i64) -> Self {
        self.default_limits[which as usize] = value;
        self
    }

    pub const fn with_reservation_timeout_ns(mut self, ns: i64) -> Self {
        self.reservation_timeout_ns = ns;
        self
    }

    /// Clamp values to what the kernel supports
    pub fn validated(mut self) -> Self {
        self.num_cores = self.num_cores.clamp(1, MAX_CORES);
        self.handle_table_size = self.handle_table_size.clamp(1, MAX_HANDLE_TABLE_SIZE);
        if self.ticks_per_second <= 0 {
            self.ticks_per_second = Self::DEFAULT.ticks_per_second;
        }
        self
    }

    /// Convert nanoseconds to timer ticks, saturating on overflow
    pub fn ns_to_ticks(&self, ns: i64) -> i64 {
        let ticks = (ns as i128 * self.ticks_per_second as i128) / 1_000_000_000;
        ticks.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = KernelConfig::DEFAULT
            .with_num_cores(2)
            .with_handle_table_size(16)
            .with_limit(LimitableResource::SessionCountMax, 3);
        assert_eq!(config.num_cores, 2);
        assert_eq!(config.handle_table_size, 16);
        assert_eq!(config.default_limits[LimitableResource::SessionCountMax as usize], 3);
    }

    #[test]
    fn test_config_validated() {
        let config = KernelConfig::DEFAULT
            .with_num_cores(9)
            .with_handle_table_size(4096)
            .with_ticks_per_second(0)
            .validated();
        assert_eq!(config.num_cores, MAX_CORES);
        assert_eq!(config.handle_table_size, MAX_HANDLE_TABLE_SIZE);
        assert_eq!(config.ticks_per_second, 19_200_000);
    }

    #[test]
    fn test_ns_to_ticks() {
        let config = KernelConfig::DEFAULT;
        assert_eq!(config.ns_to_ticks(1_000_000_000), 19_200_000);
        assert_eq!(config.ns_to_ticks(0), 0);
        assert_eq!(config.ns_to_ticks(500), 9);
        assert!(config.ns_to_ticks(i64::MAX) > 0);
    }
}
