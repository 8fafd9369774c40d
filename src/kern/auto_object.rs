//! Kernel object header and destruction hooks
//!
//! Kernel objects are shared through `Arc`. Taking a new reference (a handle,
//! a list membership, a back-reference) is `Arc::clone`, and releasing one is
//! dropping it. When the last reference goes, the object's `Drop` runs its
//! finalize step and then a [`PostDestroy`] action that returns resource
//! accounting captured at construction.
//!
//! Code that only observes an object keeps a `Weak` and reopens it with
//! [`open`], which fails once the count has reached zero.

use alloc::sync::{Arc, Weak};

use log::trace;

use super::resource_limit::{LimitableResource, ResourceLimit};
use crate::ipc::port::Port;
use crate::types::ObjectId;

// ============================================================================
// Object Kind
// ============================================================================

/// Concrete type of a kernel object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Thread,
    Process,
    ReadableEvent,
    WritableEvent,
    ServerPort,
    ClientPort,
    ServerSession,
    ClientSession,
    ResourceLimit,
}

impl ObjectKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Thread => "thread",
            Self::Process => "process",
            Self::ReadableEvent => "readable-event",
            Self::WritableEvent => "writable-event",
            Self::ServerPort => "server-port",
            Self::ClientPort => "client-port",
            Self::ServerSession => "server-session",
            Self::ClientSession => "client-session",
            Self::ResourceLimit => "resource-limit",
        }
    }

    /// Whether threads can wait on objects of this kind
    pub fn is_waitable(&self) -> bool {
        matches!(
            self,
            Self::Thread
                | Self::ReadableEvent
                | Self::ServerPort
                | Self::ClientPort
                | Self::ServerSession
        )
    }
}

// ============================================================================
// Object Header
// ============================================================================

/// Common header embedded in every kernel object
#[derive(Debug)]
pub struct AutoObject {
    id: ObjectId,
    kind: ObjectKind,
}

impl AutoObject {
    pub fn new(kind: ObjectKind) -> Self {
        let id = ObjectId::new();
        trace!("new {} {:?}", kind.name(), id);
        Self { id, kind }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }
}

impl Drop for AutoObject {
    fn drop(&mut self) {
        trace!("finalized {} {:?}", self.kind.name(), self.id);
    }
}

/// Take a new reference from a weak one; fails after the last close
pub fn open<T>(object: &Weak<T>) -> Option<Arc<T>> {
    object.upgrade()
}

// ============================================================================
// Post-destroy Actions
// ============================================================================

/// Accounting released after an object has been finalized
#[derive(Default)]
pub enum PostDestroy {
    #[default]
    None,
    ReleaseThread {
        limit: Option<Arc<ResourceLimit>>,
    },
    ReleaseEvent {
        limit: Option<Arc<ResourceLimit>>,
    },
    /// Session teardown also tells the parent port a slot is free
    ReleaseSession {
        limit: Option<Arc<ResourceLimit>>,
        port: Option<Arc<Port>>,
    },
}

impl PostDestroy {
    pub fn run(self) {
        match self {
            PostDestroy::None => {}
            PostDestroy::ReleaseThread { limit } => {
                release_one(limit, LimitableResource::ThreadCountMax);
            }
            PostDestroy::ReleaseEvent { limit } => {
                release_one(limit, LimitableResource::EventCountMax);
            }
            PostDestroy::ReleaseSession { limit, port } => {
                if let Some(port) = port {
                    port.on_session_finalized();
                }
                release_one(limit, LimitableResource::SessionCountMax);
            }
        }
    }
}

fn release_one(limit: Option<Arc<ResourceLimit>>, which: LimitableResource) {
    if let Some(limit) = limit {
        limit.release(which, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::host::HostPlatform;
    use crate::config::KernelConfig;
    use crate::kern::kernel::Kernel;
    use crate::types::Timeout;

    #[test]
    fn test_open_fails_after_last_close() {
        let object = Arc::new(AutoObject::new(ObjectKind::ReadableEvent));
        let weak = Arc::downgrade(&object);
        let reopened = open(&weak).unwrap();
        assert_eq!(reopened.id(), object.id());
        drop(object);
        assert!(open(&weak).is_some());
        drop(reopened);
        assert!(open(&weak).is_none());
    }

    #[test]
    fn test_object_ids_are_unique() {
        let a = AutoObject::new(ObjectKind::Thread);
        let b = AutoObject::new(ObjectKind::Thread);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.kind(), ObjectKind::Thread);
        assert!(a.kind().is_waitable());
        assert!(!ObjectKind::ClientSession.is_waitable());
    }

    #[test]
    fn test_post_destroy_returns_reservation() {
        let platform = Arc::new(HostPlatform::new(1));
        let kernel = Kernel::new(KernelConfig::DEFAULT, platform);
        let limit = ResourceLimit::new(&kernel);
        limit
            .set_limit_value(LimitableResource::EventCountMax, 1)
            .unwrap();
        limit
            .reserve(LimitableResource::EventCountMax, 1, Timeout::Poll)
            .unwrap();
        assert_eq!(limit.current_value(LimitableResource::EventCountMax), 1);

        PostDestroy::ReleaseEvent {
            limit: Some(limit.clone()),
        }
        .run();
        assert_eq!(limit.current_value(LimitableResource::EventCountMax), 0);
        PostDestroy::None.run();
    }
}
