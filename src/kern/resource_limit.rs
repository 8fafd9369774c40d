//! Resource Limit
//!
//! Category-based admission control. Each category keeps four values under a
//! light lock:
//! - `limit`: the ceiling
//! - `current`: usage including reservations still in flight
//! - `committed`: usage the owner has actually taken up
//! - `peak`: high-water mark of `current`
//!
//! `committed <= current <= limit` holds whenever the lock is free.
//! A reservation that does not fit right now, but would fit once in-flight
//! usage settles (`committed + value <= limit`), sleeps on a condition
//! variable until a release or its deadline.

use alloc::sync::Arc;

use log::{debug, error};

use super::auto_object::{AutoObject, ObjectKind};
use super::kernel::Kernel;
use super::light_lock::{LightConditionVariable, LightLock};
use crate::result::{KernelError, KernelResult};
use crate::types::{ObjectId, Timeout};

// ============================================================================
// Categories
// ============================================================================

/// Limited resource categories, in ABI order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum LimitableResource {
    PhysicalMemoryMax = 0,
    ThreadCountMax = 1,
    EventCountMax = 2,
    TransferMemoryCountMax = 3,
    SessionCountMax = 4,
}

pub const LIMITABLE_RESOURCE_COUNT: usize = 5;

impl LimitableResource {
    pub const ALL: [Self; LIMITABLE_RESOURCE_COUNT] = [
        Self::PhysicalMemoryMax,
        Self::ThreadCountMax,
        Self::EventCountMax,
        Self::TransferMemoryCountMax,
        Self::SessionCountMax,
    ];

    pub fn from_raw(raw: u32) -> KernelResult<Self> {
        Self::ALL
            .get(raw as usize)
            .copied()
            .ok_or(KernelError::InvalidEnumValue)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::PhysicalMemoryMax => "physical-memory",
            Self::ThreadCountMax => "threads",
            Self::EventCountMax => "events",
            Self::TransferMemoryCountMax => "transfer-memories",
            Self::SessionCountMax => "sessions",
        }
    }
}

// ============================================================================
// Resource Limit
// ============================================================================

#[derive(Debug, Default)]
struct LimitValues {
    limit: [i64; LIMITABLE_RESOURCE_COUNT],
    current: [i64; LIMITABLE_RESOURCE_COUNT],
    committed: [i64; LIMITABLE_RESOURCE_COUNT],
    peak: [i64; LIMITABLE_RESOURCE_COUNT],
    waiter_count: usize,
}

impl LimitValues {
    fn check(&self, which: usize) {
        if !(self.committed[which] <= self.current[which] && self.current[which] <= self.limit[which])
        {
            error!(
                "resource limit corrupt: committed {} current {} limit {}",
                self.committed[which], self.current[which], self.limit[which]
            );
            panic!("resource limit invariant violated");
        }
    }
}

pub struct ResourceLimit {
    header: AutoObject,
    kernel: Arc<Kernel>,
    values: LightLock<LimitValues>,
    cond_var: LightConditionVariable,
}

impl ResourceLimit {
    /// Resource limit with every limit at zero
    pub fn new(kernel: &Arc<Kernel>) -> Arc<Self> {
        Arc::new(Self {
            header: AutoObject::new(ObjectKind::ResourceLimit),
            kernel: kernel.clone(),
            values: LightLock::new(LimitValues::default()),
            cond_var: LightConditionVariable::new(),
        })
    }

    /// Resource limit seeded from the kernel configuration
    pub fn with_defaults(kernel: &Arc<Kernel>) -> Arc<Self> {
        let limit = Self::new(kernel);
        {
            let mut values = limit.values.lock(kernel.scheduler());
            values.limit = kernel.config().default_limits;
        }
        limit
    }

    pub fn object_id(&self) -> ObjectId {
        self.header.id()
    }

    fn read(&self, f: impl FnOnce(&LimitValues) -> i64) -> i64 {
        let values = self.values.lock(self.kernel.scheduler());
        f(&values)
    }

    pub fn limit_value(&self, which: LimitableResource) -> i64 {
        self.read(|values| values.limit[which as usize])
    }

    pub fn current_value(&self, which: LimitableResource) -> i64 {
        self.read(|values| values.current[which as usize])
    }

    pub fn committed_value(&self, which: LimitableResource) -> i64 {
        self.read(|values| values.committed[which as usize])
    }

    pub fn peak_value(&self, which: LimitableResource) -> i64 {
        self.read(|values| values.peak[which as usize])
    }

    pub fn free_value(&self, which: LimitableResource) -> i64 {
        self.read(|values| values.limit[which as usize] - values.current[which as usize])
    }

    pub fn waiter_count(&self) -> usize {
        self.values.lock(self.kernel.scheduler()).waiter_count
    }

    /// Change a ceiling; it may not drop below live usage
    pub fn set_limit_value(&self, which: LimitableResource, value: i64) -> KernelResult<()> {
        if value < 0 {
            return Err(KernelError::InvalidArgument);
        }
        let mut values = self.values.lock(self.kernel.scheduler());
        let index = which as usize;
        if values.current[index] > value {
            return Err(KernelError::InvalidState);
        }
        values.limit[index] = value;
        debug!("limit {:?} {} = {}", self.header.id(), which.name(), value);
        Ok(())
    }

    /// Reserve `value` units, waiting until `timeout` if they may free up
    pub fn reserve(&self, which: LimitableResource, value: i64, timeout: Timeout) -> KernelResult<()> {
        if value <= 0 {
            return Err(KernelError::InvalidArgument);
        }
        let scheduler = self.kernel.scheduler();
        let index = which as usize;
        let mut values = self.values.lock(scheduler);
        values.check(index);
        if values.committed[index] >= values.limit[index] {
            return Err(KernelError::LimitReached);
        }

        loop {
            let Some(total) = values.current[index].checked_add(value) else {
                return Err(KernelError::LimitReached);
            };
            if total <= values.limit[index] {
                values.current[index] = total;
                values.committed[index] += value;
                values.peak[index] = values.peak[index].max(total);
                return Ok(());
            }

            let may_fit = values.committed[index] + value <= values.limit[index];
            if !may_fit || timeout.is_expired(self.kernel.platform().now()) {
                return Err(KernelError::LimitReached);
            }
            values.waiter_count += 1;
            values = self.cond_var.wait(values, timeout);
            values.waiter_count -= 1;

            let terminating = self
                .kernel
                .current_thread()
                .is_some_and(|thread| thread.is_termination_requested());
            if terminating {
                return Err(KernelError::TerminationRequested);
            }
        }
    }

    /// Return `value` units of both current and committed usage
    pub fn release(&self, which: LimitableResource, value: i64) {
        self.release_with_committed(which, value, value);
    }

    /// Return `value` units of current usage and `committed` units of
    /// committed usage
    pub fn release_with_committed(&self, which: LimitableResource, value: i64, committed: i64) {
        assert!(value >= 0 && committed >= 0, "negative resource release");
        let index = which as usize;
        let mut values = self.values.lock(self.kernel.scheduler());
        if value > values.current[index] || committed > values.committed[index] {
            error!(
                "release of {}/{} {} exceeds usage {}/{}",
                value,
                committed,
                which.name(),
                values.current[index],
                values.committed[index]
            );
            panic!("resource limit release underflow");
        }
        values.current[index] -= value;
        values.committed[index] -= committed;
        values.check(index);
        if values.waiter_count != 0 {
            self.cond_var.broadcast(self.kernel.scheduler());
        }
    }
}

// ============================================================================
// Scoped Reservation
// ============================================================================

/// Reservation released on drop unless committed
///
/// Without a limit every reservation succeeds.
pub struct ScopedResourceReservation {
    limit: Option<Arc<ResourceLimit>>,
    which: LimitableResource,
    value: i64,
    succeeded: bool,
}

impl ScopedResourceReservation {
    pub fn new(
        limit: Option<&Arc<ResourceLimit>>,
        which: LimitableResource,
        value: i64,
        timeout: Timeout,
    ) -> Self {
        let succeeded = match limit {
            Some(limit) => limit.reserve(which, value, timeout).is_ok(),
            None => true,
        };
        Self {
            limit: limit.cloned(),
            which,
            value,
            succeeded,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.succeeded
    }

    /// Keep the reservation; the owning object releases it later
    pub fn commit(&mut self) {
        self.limit = None;
    }
}

impl Drop for ScopedResourceReservation {
    fn drop(&mut self) {
        if !self.succeeded {
            return;
        }
        if let Some(limit) = self.limit.take() {
            limit.release(self.which, self.value);
        }
    }
}
