//! Kernel instance
//!
//! Ties together the pieces every object needs: the validated configuration,
//! the platform, the global scheduler and the per-core interrupt task queues.
//! Objects hold an `Arc<Kernel>` rather than reaching for globals, so several
//! independent kernels can coexist in one test binary.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};

use log::{info, trace, warn};

use super::interrupt_task::{InterruptHandler, InterruptTaskManager, QueuedTask};
use super::lock::SpinLock;
use super::process::KProcess;
use super::scheduler::Scheduler;
use super::thread::KThread;
use crate::arch::Platform;
use crate::config::KernelConfig;
use crate::types::{CoreId, ThreadId, Tick, Timeout};

/// Extra ticks added to relative timeouts so a wait never ends early
const TIMEOUT_SLACK_TICKS: i64 = 2;

pub struct Kernel {
    config: KernelConfig,
    num_cores: usize,
    platform: Arc<dyn Platform>,
    scheduler: Scheduler,
    interrupts: InterruptTaskManager,
    threads: SpinLock<BTreeMap<ThreadId, Weak<KThread>>>,
}

impl Kernel {
    /// Bring up a kernel on `platform`
    ///
    /// The core count is the smaller of the configured and the physical one.
    pub fn new(config: KernelConfig, platform: Arc<dyn Platform>) -> Arc<Self> {
        let mut config = config.validated();
        let physical = platform.num_cores();
        if physical < config.num_cores {
            warn!(
                "configured for {} cores but platform has {}",
                config.num_cores, physical
            );
            config.num_cores = physical.max(1);
        }
        let num_cores = config.num_cores;
        info!(
            "kernel core up: {} cores, {} ticks/s, {} handles per table",
            num_cores, config.ticks_per_second, config.handle_table_size
        );
        Arc::new(Self {
            config,
            num_cores,
            scheduler: Scheduler::new(platform.clone(), num_cores),
            interrupts: InterruptTaskManager::new(num_cores),
            platform,
            threads: SpinLock::new(BTreeMap::new()),
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn num_cores(&self) -> usize {
        self.num_cores
    }

    // ------------------------------------------------------------------------
    // Thread registry
    // ------------------------------------------------------------------------

    pub(crate) fn register_thread(&self, thread: &Arc<KThread>) {
        self.threads.lock().insert(thread.id(), Arc::downgrade(thread));
    }

    pub(crate) fn unregister_thread(&self, id: ThreadId) {
        self.threads.lock().remove(&id);
    }

    /// Look up a live thread by id
    pub fn thread(&self, id: ThreadId) -> Option<Arc<KThread>> {
        self.threads.lock().get(&id).and_then(Weak::upgrade)
    }

    pub fn current_thread_id(&self) -> Option<ThreadId> {
        self.platform.current_thread()
    }

    pub fn current_thread(&self) -> Option<Arc<KThread>> {
        self.current_thread_id().and_then(|id| self.thread(id))
    }

    pub fn current_process(&self) -> Option<Arc<KProcess>> {
        self.current_thread().and_then(|thread| thread.process())
    }

    // ------------------------------------------------------------------------
    // Time
    // ------------------------------------------------------------------------

    /// Deadline for reservations made while creating kernel objects
    pub fn reservation_timeout(&self) -> Timeout {
        let ticks = self.config.ns_to_ticks(self.config.reservation_timeout_ns);
        Timeout::At(self.platform.now().saturating_add(ticks))
    }

    /// Convert a caller-supplied relative timeout in nanoseconds
    ///
    /// Zero polls and a negative value waits forever.
    pub fn timeout_from_ns(&self, ns: i64) -> Timeout {
        match ns {
            0 => Timeout::Poll,
            ns if ns < 0 => Timeout::None,
            ns => self.deadline_after(self.config.ns_to_ticks(ns)),
        }
    }

    /// Timeout conversion used when receiving on sessions
    ///
    /// Same as [`Kernel::timeout_from_ns`], except that a positive timeout
    /// shorter than one tick waits forever.
    pub fn receive_timeout_from_ns(&self, ns: i64) -> Timeout {
        match self.config.ns_to_ticks(ns) {
            0 if ns > 0 => Timeout::None,
            _ => self.timeout_from_ns(ns),
        }
    }

    fn deadline_after(&self, ticks: Tick) -> Timeout {
        let ticks = ticks.saturating_add(TIMEOUT_SLACK_TICKS);
        Timeout::At(self.platform.now().saturating_add(ticks))
    }

    // ------------------------------------------------------------------------
    // Interrupts
    // ------------------------------------------------------------------------

    pub fn register_handler(&self, irq: u32, handler: Arc<dyn InterruptHandler>) {
        self.interrupts.register_handler(irq, handler);
    }

    pub fn unregister_handler(&self, irq: u32) -> bool {
        self.interrupts.unregister_handler(irq)
    }

    /// Interrupt entry for `irq` on `core`
    pub fn handle_interrupt(&self, core: CoreId, irq: u32) -> bool {
        let handled = self.interrupts.handle_interrupt(&*self.platform, core, irq);
        if !handled {
            warn!("unhandled interrupt {} on core {}", irq, core);
        }
        handled
    }

    /// Run the deferred work queued on `core`, returning how many tasks ran
    pub fn process_interrupt_tasks(&self, core: CoreId) -> usize {
        let tasks = self.interrupts.drain(&*self.platform, core);
        let count = tasks.len();
        for task in tasks {
            trace!("core {} interrupt task {:?}", core, task);
            match task {
                QueuedTask::Timer => {
                    self.scheduler.handle_timer_interrupt(core);
                }
                QueuedTask::Reschedule => self.scheduler.reschedule_core(core),
                QueuedTask::Custom(task) => task.do_task(core),
            }
        }
        count
    }
}
