//! Kernel object variants
//!
//! Handle tables store a [`KernelObject`], a closed enum over every object
//! type a process can hold. [`ObjectType`] gives each concrete type its tag
//! and a checked downcast, which is what `HandleTable::get::<T>` uses.

use alloc::sync::Arc;

use super::auto_object::ObjectKind;
use super::event::{ReadableEvent, WritableEvent};
use super::process::KProcess;
use super::resource_limit::ResourceLimit;
use super::synchronization::SyncObject;
use super::thread::KThread;
use crate::ipc::port::{ClientPort, ServerPort};
use crate::ipc::session::{ClientSession, ServerSession};
use crate::types::ObjectId;

/// Reference to any kernel object
#[derive(Clone)]
pub enum KernelObject {
    Thread(Arc<KThread>),
    Process(Arc<KProcess>),
    ReadableEvent(Arc<ReadableEvent>),
    WritableEvent(Arc<WritableEvent>),
    ServerPort(Arc<ServerPort>),
    ClientPort(Arc<ClientPort>),
    ServerSession(Arc<ServerSession>),
    ClientSession(Arc<ClientSession>),
    ResourceLimit(Arc<ResourceLimit>),
}

impl KernelObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Thread(_) => ObjectKind::Thread,
            Self::Process(_) => ObjectKind::Process,
            Self::ReadableEvent(_) => ObjectKind::ReadableEvent,
            Self::WritableEvent(_) => ObjectKind::WritableEvent,
            Self::ServerPort(_) => ObjectKind::ServerPort,
            Self::ClientPort(_) => ObjectKind::ClientPort,
            Self::ServerSession(_) => ObjectKind::ServerSession,
            Self::ClientSession(_) => ObjectKind::ClientSession,
            Self::ResourceLimit(_) => ObjectKind::ResourceLimit,
        }
    }

    pub fn id(&self) -> ObjectId {
        match self {
            Self::Thread(object) => object.object_id(),
            Self::Process(object) => object.object_id(),
            Self::ReadableEvent(object) => object.id(),
            Self::WritableEvent(object) => object.id(),
            Self::ServerPort(object) => object.id(),
            Self::ClientPort(object) => object.id(),
            Self::ServerSession(object) => object.id(),
            Self::ClientSession(object) => object.id(),
            Self::ResourceLimit(object) => object.object_id(),
        }
    }

    /// The waitable view of this object, if it has one
    pub fn as_sync_object(&self) -> Option<SyncObject> {
        match self {
            Self::Thread(object) => Some(SyncObject::Thread(object.clone())),
            Self::ReadableEvent(object) => Some(SyncObject::ReadableEvent(object.clone())),
            Self::ServerPort(object) => Some(SyncObject::ServerPort(object.clone())),
            Self::ClientPort(object) => Some(SyncObject::ClientPort(object.clone())),
            Self::ServerSession(object) => Some(SyncObject::ServerSession(object.clone())),
            _ => None,
        }
    }

    pub fn downcast<T: ObjectType>(&self) -> Option<Arc<T>> {
        T::downcast(self)
    }
}

impl core::fmt::Debug for KernelObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}({:?})", self.kind().name(), self.id())
    }
}

/// Concrete object type stored in a [`KernelObject`]
pub trait ObjectType: Sized {
    const KIND: ObjectKind;

    fn downcast(object: &KernelObject) -> Option<Arc<Self>>;

    fn into_object(object: Arc<Self>) -> KernelObject;
}

macro_rules! object_type {
    ($type:ty, $variant:ident) => {
        impl ObjectType for $type {
            const KIND: ObjectKind = ObjectKind::$variant;

            fn downcast(object: &KernelObject) -> Option<Arc<Self>> {
                match object {
                    KernelObject::$variant(object) => Some(object.clone()),
                    _ => None,
                }
            }

            fn into_object(object: Arc<Self>) -> KernelObject {
                KernelObject::$variant(object)
            }
        }

        impl From<Arc<$type>> for KernelObject {
            fn from(object: Arc<$type>) -> Self {
                KernelObject::$variant(object)
            }
        }
    };
}

object_type!(KThread, Thread);
object_type!(KProcess, Process);
object_type!(ReadableEvent, ReadableEvent);
object_type!(WritableEvent, WritableEvent);
object_type!(ServerPort, ServerPort);
object_type!(ClientPort, ClientPort);
object_type!(ServerSession, ServerSession);
object_type!(ClientSession, ClientSession);
object_type!(ResourceLimit, ResourceLimit);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::host::HostPlatform;
    use crate::config::KernelConfig;
    use crate::kern::event::create_event;
    use crate::kern::kernel::Kernel;

    #[test]
    fn test_downcast_checks_kind() {
        let kernel = Kernel::new(KernelConfig::DEFAULT, Arc::new(HostPlatform::new(4)));
        let (writable, readable) = create_event(&kernel, None).unwrap();
        let object = KernelObject::from(readable.clone());
        assert_eq!(object.kind(), ObjectKind::ReadableEvent);
        assert_eq!(object.id(), readable.id());
        assert!(object.downcast::<ReadableEvent>().is_some());
        assert!(object.downcast::<WritableEvent>().is_none());
        assert!(object.as_sync_object().is_some());

        let object = WritableEvent::into_object(writable);
        assert!(object.as_sync_object().is_none());
        assert_eq!(<WritableEvent as ObjectType>::KIND, ObjectKind::WritableEvent);
    }
}
