//! Events
//!
//! An event is a pair of objects. The writable side signals and clears; the
//! readable side is what threads wait on. The writable side keeps the
//! readable side alive, so the readable side is always the last to go and
//! carries the `EventCountMax` reservation.

use alloc::sync::Arc;

use log::debug;

use super::auto_object::{AutoObject, ObjectKind, PostDestroy};
use super::kernel::Kernel;
use super::resource_limit::{LimitableResource, ResourceLimit, ScopedResourceReservation};
use super::scheduler::{SchedProtected, SchedulerState};
use super::synchronization::{on_available, Waitable};
use crate::result::{KernelError, KernelResult};
use crate::types::ObjectId;

pub struct ReadableEvent {
    header: AutoObject,
    kernel: Arc<Kernel>,
    signaled: SchedProtected<bool>,
    limit: Option<Arc<ResourceLimit>>,
}

pub struct WritableEvent {
    header: AutoObject,
    readable: Arc<ReadableEvent>,
}

/// Create an event pair, charging `EventCountMax` against `limit`
pub fn create_event(
    kernel: &Arc<Kernel>,
    limit: Option<&Arc<ResourceLimit>>,
) -> KernelResult<(Arc<WritableEvent>, Arc<ReadableEvent>)> {
    let mut reservation = ScopedResourceReservation::new(
        limit,
        LimitableResource::EventCountMax,
        1,
        kernel.reservation_timeout(),
    );
    if !reservation.succeeded() {
        return Err(KernelError::LimitReached);
    }

    let readable = Arc::new(ReadableEvent {
        header: AutoObject::new(ObjectKind::ReadableEvent),
        kernel: kernel.clone(),
        signaled: SchedProtected::new(false),
        limit: limit.cloned(),
    });
    let writable = Arc::new(WritableEvent {
        header: AutoObject::new(ObjectKind::WritableEvent),
        readable: readable.clone(),
    });
    reservation.commit();
    debug!("created event {:?}", readable.header.id());
    Ok((writable, readable))
}

impl ReadableEvent {
    pub fn id(&self) -> ObjectId {
        self.header.id()
    }

    pub fn signal(&self) {
        let guard = self.kernel.scheduler().lock();
        let mut state = guard.state();
        let changed = {
            let mut signaled = self.signaled.get(&state);
            !core::mem::replace(&mut *signaled, true)
        };
        if changed {
            on_available(&mut state, self);
        }
    }

    /// Clear the signal, failing if it was not set
    pub fn reset(&self) -> KernelResult<()> {
        let guard = self.kernel.scheduler().lock();
        let state = guard.state();
        let mut signaled = self.signaled.get(&state);
        if !*signaled {
            return Err(KernelError::InvalidState);
        }
        *signaled = false;
        Ok(())
    }

    /// Clear the signal whether or not it was set
    pub fn clear(&self) {
        let _ = self.reset();
    }
}

impl Waitable for ReadableEvent {
    fn object_id(&self) -> ObjectId {
        self.header.id()
    }

    fn is_signaled(&self, state: &SchedulerState) -> bool {
        *self.signaled.get(state)
    }
}

impl Drop for ReadableEvent {
    fn drop(&mut self) {
        debug!("destroyed event {:?}", self.header.id());
        PostDestroy::ReleaseEvent {
            limit: self.limit.take(),
        }
        .run();
    }
}

impl WritableEvent {
    pub fn id(&self) -> ObjectId {
        self.header.id()
    }

    pub fn readable(&self) -> &Arc<ReadableEvent> {
        &self.readable
    }

    pub fn signal(&self) {
        self.readable.signal();
    }

    pub fn clear(&self) {
        self.readable.clear();
    }
}
