//! Kern subsystem - Core kernel primitives
//!
//! Scheduling, synchronization, kernel objects and resource accounting.
//! Everything that blocks goes through the global scheduler in [`scheduler`].

pub mod auto_object;
pub mod capabilities;
pub mod event;
pub mod interrupt_task;
pub mod kernel;
pub mod light_lock;
pub mod lock;
pub mod object;
pub mod priority_queue;
pub mod process;
pub mod queue;
pub mod resource_limit;
pub mod scheduler;
pub mod synchronization;
pub mod thread;
pub mod timer;
pub mod wait_queue;

pub use auto_object::{AutoObject, ObjectKind};
pub use capabilities::Capabilities;
pub use event::{create_event, ReadableEvent, WritableEvent};
pub use kernel::Kernel;
pub use light_lock::{LightConditionVariable, LightLock, LightLockGuard};
pub use lock::{InterruptSpinLock, SimpleLock, SpinLock};
pub use object::{KernelObject, ObjectType};
pub use process::KProcess;
pub use resource_limit::{LimitableResource, ResourceLimit, ScopedResourceReservation};
pub use scheduler::{Scheduler, SchedulerLock, SchedulerLockAndSleep, YieldKind};
pub use synchronization::{wait_any, SyncObject, Waitable, WaitError};
pub use thread::{KThread, ThreadState};
pub use wait_queue::WaitKind;
