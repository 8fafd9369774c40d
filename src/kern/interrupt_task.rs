//! Deferred interrupt work
//!
//! Interrupt handlers run with interrupts masked and may not block, so they
//! only decide what needs doing and queue an [`InterruptTask`] on their core.
//! The core drains its queue once it leaves the handler, where taking the
//! scheduling lock is allowed.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::lock::{InterruptSpinLock, SpinLock};
use crate::arch::Platform;
use crate::types::CoreId;

/// Per-core hardware timer interrupt
pub const TIMER_IRQ: u32 = 30;

/// Software-generated interrupt used for reschedule IPIs
pub const SCHEDULER_IPI: u32 = 2;

/// Bottom half of an interrupt
pub trait InterruptTask: Send + Sync {
    fn do_task(&self, core: CoreId);
}

/// Top half of an interrupt; returns the work to defer, if any
pub trait InterruptHandler: Send + Sync {
    fn handle(&self, core: CoreId, irq: u32) -> Option<Arc<dyn InterruptTask>>;
}

/// Work item queued on a core
#[derive(Clone)]
pub enum QueuedTask {
    /// Fire expired timeout tasks
    Timer,
    /// Act on a reschedule IPI
    Reschedule,
    Custom(Arc<dyn InterruptTask>),
}

impl core::fmt::Debug for QueuedTask {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            QueuedTask::Timer => f.write_str("Timer"),
            QueuedTask::Reschedule => f.write_str("Reschedule"),
            QueuedTask::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Task queues for every core plus the handler registry
pub struct InterruptTaskManager {
    queues: Vec<InterruptSpinLock<VecDeque<QueuedTask>>>,
    handlers: SpinLock<BTreeMap<u32, Arc<dyn InterruptHandler>>>,
}

impl InterruptTaskManager {
    pub fn new(num_cores: usize) -> Self {
        Self {
            queues: (0..num_cores)
                .map(|_| InterruptSpinLock::new(VecDeque::new()))
                .collect(),
            handlers: SpinLock::new(BTreeMap::new()),
        }
    }

    pub fn register_handler(&self, irq: u32, handler: Arc<dyn InterruptHandler>) {
        self.handlers.lock().insert(irq, handler);
    }

    pub fn unregister_handler(&self, irq: u32) -> bool {
        self.handlers.lock().remove(&irq).is_some()
    }

    /// Top half: turn an interrupt on `core` into queued work
    ///
    /// Returns false for an interrupt nobody handles.
    pub fn handle_interrupt(&self, platform: &dyn Platform, core: CoreId, irq: u32) -> bool {
        let task = match irq {
            TIMER_IRQ => Some(QueuedTask::Timer),
            SCHEDULER_IPI => Some(QueuedTask::Reschedule),
            _ => {
                let handler = self.handlers.lock().get(&irq).cloned();
                let Some(handler) = handler else {
                    return false;
                };
                handler.handle(core, irq).map(QueuedTask::Custom)
            }
        };
        if let Some(task) = task {
            self.enqueue(platform, core, task);
        }
        true
    }

    pub fn enqueue(&self, platform: &dyn Platform, core: CoreId, task: QueuedTask) {
        self.queues[core].lock(platform).push_back(task);
    }

    /// Take every queued task of `core`, oldest first
    pub fn drain(&self, platform: &dyn Platform, core: CoreId) -> Vec<QueuedTask> {
        self.queues[core].lock(platform).drain(..).collect()
    }

    pub fn pending(&self, platform: &dyn Platform, core: CoreId) -> usize {
        self.queues[core].lock(platform).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::host::HostPlatform;
    use core::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    impl InterruptTask for Counter {
        fn do_task(&self, _core: CoreId) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    struct CountingHandler(Arc<Counter>);

    impl InterruptHandler for CountingHandler {
        fn handle(&self, _core: CoreId, _irq: u32) -> Option<Arc<dyn InterruptTask>> {
            Some(self.0.clone())
        }
    }

    #[test]
    fn test_builtin_interrupts_queue_tasks() {
        let platform = HostPlatform::new(2);
        let manager = InterruptTaskManager::new(2);
        assert!(manager.handle_interrupt(&platform, 1, TIMER_IRQ));
        assert!(manager.handle_interrupt(&platform, 1, SCHEDULER_IPI));
        assert!(!manager.handle_interrupt(&platform, 1, 77));
        assert_eq!(manager.pending(&platform, 0), 0);

        let tasks = manager.drain(&platform, 1);
        assert!(matches!(
            tasks.as_slice(),
            [QueuedTask::Timer, QueuedTask::Reschedule]
        ));
        assert_eq!(manager.pending(&platform, 1), 0);
    }

    #[test]
    fn test_registered_handler_defers_work() {
        let platform = HostPlatform::new(1);
        let manager = InterruptTaskManager::new(1);
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        manager.register_handler(50, Arc::new(CountingHandler(counter.clone())));

        assert!(manager.handle_interrupt(&platform, 0, 50));
        assert_eq!(counter.0.load(Ordering::Relaxed), 0);
        for task in manager.drain(&platform, 0) {
            if let QueuedTask::Custom(task) = task {
                task.do_task(0);
            }
        }
        assert_eq!(counter.0.load(Ordering::Relaxed), 1);
        assert!(manager.unregister_handler(50));
        assert!(!manager.handle_interrupt(&platform, 0, 50));
    }
}
