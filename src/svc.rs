//! Supervisor call entry points
//!
//! The handle-based surface user processes see. Every call runs on behalf of
//! a [`KProcess`], resolves its handles through the process handle table and
//! returns a [`KernelResult`]. Timeouts arrive as relative nanoseconds: zero
//! polls, negative waits forever.

use alloc::sync::Arc;
use alloc::vec::Vec;

use log::debug;

use crate::ipc::handle_table::{Handle, HandleTable, INVALID_HANDLE};
use crate::ipc::port::{ClientPort, Port, ServerPort};
use crate::ipc::request::{MessageBuffer, SessionRequest};
use crate::ipc::session::{self, ClientSession, ServerSession};
use crate::ipc::{self, Received};
use crate::kern::event::{self, ReadableEvent, WritableEvent};
use crate::kern::object::KernelObject;
use crate::kern::process::KProcess;
use crate::kern::resource_limit::{LimitableResource, ResourceLimit};
use crate::kern::scheduler::YieldKind;
use crate::kern::synchronization::{self, SyncObject, WaitError, MAX_WAIT_OBJECTS};
use crate::kern::thread::KThread;
use crate::result::{KernelError, KernelResult};
use crate::types::{CoreMask, Priority};

/// `set_thread_core_mask` ideal core value that keeps the current ideal core
pub const IDEAL_CORE_NO_UPDATE: i32 = -3;

/// `sleep_thread` values that yield instead of sleeping
pub const YIELD_WITHOUT_MIGRATION: i64 = 0;
pub const YIELD_WITH_MIGRATION: i64 = -1;
pub const YIELD_TO_ANY_THREAD: i64 = -2;

fn add_pair(table: &HandleTable, first: KernelObject, second: KernelObject) -> KernelResult<(Handle, Handle)> {
    let first = table.add(first)?;
    match table.add(second) {
        Ok(second) => Ok((first, second)),
        Err(error) => {
            table.remove(first);
            Err(error)
        }
    }
}

fn sync_objects(process: &KProcess, handles: &[Handle]) -> KernelResult<Vec<SyncObject>> {
    if handles.len() > MAX_WAIT_OBJECTS {
        return Err(KernelError::OutOfRange);
    }
    let table = process.handle_table();
    handles
        .iter()
        .map(|handle| {
            table
                .get_object(*handle)?
                .as_sync_object()
                .ok_or(KernelError::InvalidHandle)
        })
        .collect()
}

fn current_thread(process: &KProcess) -> KernelResult<Arc<KThread>> {
    process
        .kernel()
        .current_thread()
        .ok_or(KernelError::InvalidState)
}

// ============================================================================
// Ports and Sessions
// ============================================================================

/// Returns (server port, client port) handles
pub fn create_port(process: &KProcess, max_sessions: i32) -> KernelResult<(Handle, Handle)> {
    if max_sessions <= 0 {
        return Err(KernelError::OutOfRange);
    }
    let (server, client) = Port::new(process.kernel(), max_sessions);
    add_pair(process.handle_table(), server.into(), client.into())
}

/// Open a session on a client port, returning the client session handle
pub fn connect_to_port(process: &KProcess, port: Handle) -> KernelResult<Handle> {
    let table = process.handle_table();
    let port = table.get::<ClientPort>(port)?;
    let handle = table.reserve()?;
    match port.create_session() {
        Ok(session) => {
            table.register(handle, session.into());
            Ok(handle)
        }
        Err(error) => {
            table.unreserve(handle);
            Err(error)
        }
    }
}

/// Accept the oldest pending session, returning its server handle
pub fn accept_session(process: &KProcess, port: Handle) -> KernelResult<Handle> {
    let table = process.handle_table();
    let port = table.get::<ServerPort>(port)?;
    let handle = table.reserve()?;
    match port.accept_session() {
        Ok(session) => {
            table.register(handle, session.into());
            Ok(handle)
        }
        Err(error) => {
            table.unreserve(handle);
            Err(error)
        }
    }
}

/// Returns (server session, client session) handles
pub fn create_session(process: &KProcess) -> KernelResult<(Handle, Handle)> {
    let (server, client) = session::create_session(process.kernel(), process.resource_limit())?;
    add_pair(process.handle_table(), server.into(), client.into())
}

pub fn send_sync_request(process: &KProcess, session: Handle, message: &[u32]) -> KernelResult<MessageBuffer> {
    let session = process.handle_table().get::<ClientSession>(session)?;
    session.send_sync_request(message)
}

/// Send without blocking
///
/// Returns a handle to an event signaled on completion, and the request to
/// read the reply and result from.
pub fn send_async_request(
    process: &KProcess,
    session: Handle,
    message: &[u32],
) -> KernelResult<(Handle, Arc<SessionRequest>)> {
    let table = process.handle_table();
    let session = table.get::<ClientSession>(session)?;
    let (writable, readable) = event::create_event(process.kernel(), process.resource_limit())?;
    let handle = table.add(readable.into())?;
    match session.send_async_request(writable, message) {
        Ok(request) => Ok((handle, request)),
        Err(error) => {
            table.remove(handle);
            Err(error)
        }
    }
}

/// Reply on `reply_target` (unless it is the invalid handle), then wait on
/// `handles` and receive
pub fn reply_and_receive(
    process: &KProcess,
    handles: &[Handle],
    reply_target: Handle,
    reply: &[u32],
    timeout_ns: i64,
) -> Result<Received, WaitError> {
    let objects = sync_objects(process, handles)?;
    let target = if reply_target == INVALID_HANDLE {
        None
    } else {
        Some(process.handle_table().get::<ServerSession>(reply_target)?)
    };
    let kernel = process.kernel();
    let timeout = kernel.receive_timeout_from_ns(timeout_ns);
    ipc::reply_and_receive(
        kernel,
        &objects,
        target.as_ref().map(|session| (session, reply)),
        timeout,
    )
}

// ============================================================================
// Synchronization
// ============================================================================

pub fn wait_synchronization(process: &KProcess, handles: &[Handle], timeout_ns: i64) -> Result<usize, WaitError> {
    let objects = sync_objects(process, handles)?;
    let kernel = process.kernel();
    synchronization::wait_any(kernel, &objects, kernel.timeout_from_ns(timeout_ns))
}

pub fn cancel_synchronization(process: &KProcess, thread: Handle) -> KernelResult<()> {
    let thread = process.handle_table().get::<KThread>(thread)?;
    synchronization::cancel_synchronization(process.kernel(), &thread);
    Ok(())
}

pub fn close_handle(process: &KProcess, handle: Handle) -> KernelResult<()> {
    if process.handle_table().remove(handle) {
        Ok(())
    } else {
        Err(KernelError::InvalidHandle)
    }
}

// ============================================================================
// Events
// ============================================================================

/// Returns (writable, readable) handles
pub fn create_event(process: &KProcess) -> KernelResult<(Handle, Handle)> {
    let (writable, readable) = event::create_event(process.kernel(), process.resource_limit())?;
    add_pair(process.handle_table(), writable.into(), readable.into())
}

pub fn signal_event(process: &KProcess, event: Handle) -> KernelResult<()> {
    process.handle_table().get::<WritableEvent>(event)?.signal();
    Ok(())
}

/// Clear an event through either of its handles
pub fn clear_event(process: &KProcess, event: Handle) -> KernelResult<()> {
    match process.handle_table().get_object(event)? {
        KernelObject::WritableEvent(event) => event.clear(),
        KernelObject::ReadableEvent(event) => event.clear(),
        _ => return Err(KernelError::InvalidHandle),
    }
    Ok(())
}

/// Clear a readable event, failing with `InvalidState` if it was not signaled
pub fn reset_signal(process: &KProcess, event: Handle) -> KernelResult<()> {
    process.handle_table().get::<ReadableEvent>(event)?.reset()
}

// ============================================================================
// Resource Limits
// ============================================================================

pub fn create_resource_limit(process: &KProcess) -> KernelResult<Handle> {
    let limit = ResourceLimit::new(process.kernel());
    process.handle_table().add(limit.into())
}

pub fn set_resource_limit_limit_value(process: &KProcess, limit: Handle, which: u32, value: i64) -> KernelResult<()> {
    let which = LimitableResource::from_raw(which)?;
    let limit = process.handle_table().get::<ResourceLimit>(limit)?;
    limit.set_limit_value(which, value)
}

pub fn get_resource_limit_limit_value(process: &KProcess, limit: Handle, which: u32) -> KernelResult<i64> {
    let which = LimitableResource::from_raw(which)?;
    let limit = process.handle_table().get::<ResourceLimit>(limit)?;
    Ok(limit.limit_value(which))
}

pub fn get_resource_limit_current_value(process: &KProcess, limit: Handle, which: u32) -> KernelResult<i64> {
    let which = LimitableResource::from_raw(which)?;
    let limit = process.handle_table().get::<ResourceLimit>(limit)?;
    Ok(limit.current_value(which))
}

// ============================================================================
// Threads
// ============================================================================

pub fn get_thread_priority(process: &KProcess, thread: Handle) -> KernelResult<Priority> {
    Ok(process.handle_table().get::<KThread>(thread)?.priority())
}

pub fn set_thread_priority(process: &KProcess, thread: Handle, priority: Priority) -> KernelResult<()> {
    process.capabilities().check_priority(priority)?;
    process.handle_table().get::<KThread>(thread)?.set_priority(priority)
}

pub fn set_thread_core_mask(process: &KProcess, thread: Handle, ideal_core: i32, mask: u64) -> KernelResult<()> {
    let thread = process.handle_table().get::<KThread>(thread)?;
    let ideal_core = match ideal_core {
        IDEAL_CORE_NO_UPDATE => thread.affinity().0,
        core if core >= 0 => core as usize,
        _ => return Err(KernelError::InvalidCoreId),
    };
    let mask = CoreMask(mask);
    if mask.is_empty() {
        return Err(KernelError::InvalidCombination);
    }
    process.capabilities().check_core_mask(mask)?;
    process.capabilities().check_core(ideal_core)?;
    thread.set_affinity(ideal_core, mask)
}

/// Sleep the calling thread, or yield for the special values
pub fn sleep_thread(process: &KProcess, ns: i64) -> KernelResult<()> {
    let thread = current_thread(process)?;
    let kind = match ns {
        YIELD_WITHOUT_MIGRATION => YieldKind::WithoutMigration,
        YIELD_WITH_MIGRATION => YieldKind::WithMigration,
        YIELD_TO_ANY_THREAD => YieldKind::ToAnyThread,
        ns if ns > 0 => {
            let timeout = process.kernel().timeout_from_ns(ns);
            return thread.sleep(timeout);
        }
        _ => return Err(KernelError::InvalidArgument),
    };
    debug!("thread {:?} yields {:?}", thread.id(), kind);
    thread.yield_now(kind);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::host::{wait_until, HostPlatform};
    use crate::config::KernelConfig;
    use crate::ipc::handle_table::{PSEUDO_CURRENT_PROCESS, PSEUDO_CURRENT_THREAD};
    use crate::kern::capabilities::Capabilities;
    use crate::kern::kernel::Kernel;
    use crate::kern::thread::ThreadState;
    use std::thread;

    struct Fixture {
        platform: Arc<HostPlatform>,
        kernel: Arc<Kernel>,
        process: Arc<KProcess>,
    }

    fn fixture() -> Fixture {
        let platform = Arc::new(HostPlatform::new(2));
        let kernel = Kernel::new(KernelConfig::DEFAULT.with_num_cores(2), platform.clone());
        let process = KProcess::new(&kernel, Some(ResourceLimit::with_defaults(&kernel)));
        Fixture {
            platform,
            kernel,
            process,
        }
    }

    fn spawn_thread(fixture: &Fixture, core: usize) -> Arc<KThread> {
        let thread = KThread::create(&fixture.kernel, Some(&fixture.process), 20, core).unwrap();
        thread.start().unwrap();
        thread
    }

    #[test]
    fn test_port_session_request_flow() {
        let f = fixture();
        let process = &f.process;
        let (server_port, client_port) = create_port(process, 1).unwrap();
        assert_eq!(create_port(process, 0).err(), Some(KernelError::OutOfRange));

        let client = connect_to_port(process, client_port).unwrap();
        assert_eq!(
            connect_to_port(process, client_port).err(),
            Some(KernelError::OutOfSessions)
        );
        let server = accept_session(process, server_port).unwrap();
        assert_eq!(
            accept_session(process, server_port).err(),
            Some(KernelError::NotFound)
        );

        let thread = spawn_thread(&f, 1);
        let handle = {
            let platform = f.platform.clone();
            let process = process.clone();
            let id = thread.id();
            thread::spawn(move || {
                let _bound = platform.bind(id, 1);
                send_sync_request(&process, client, &[0x11, 0x22])
            })
        };
        wait_until(|| thread.state() == ThreadState::Waiting);

        let received = reply_and_receive(process, &[server], INVALID_HANDLE, &[], 0).unwrap();
        assert_eq!(received.index, 0);
        assert_eq!(received.message.unwrap().as_slice(), &[0x11, 0x22]);
        assert_eq!(
            reply_and_receive(process, &[server], server, &[0x33], 0),
            Err(WaitError::new(KernelError::TimedOut))
        );
        assert_eq!(handle.join().unwrap().unwrap().as_slice(), &[0x33]);

        close_handle(process, client).unwrap();
        assert_eq!(
            reply_and_receive(process, &[server], INVALID_HANDLE, &[], 0),
            Err(WaitError {
                error: KernelError::SessionClosed,
                index: Some(0)
            })
        );
    }

    #[test]
    fn test_async_request_signals_event() {
        let f = fixture();
        let process = &f.process;
        let (server, client) = create_session(process).unwrap();
        let (event, request) = send_async_request(process, client, &[5]).unwrap();
        assert_eq!(
            wait_synchronization(process, &[event], 0),
            Err(WaitError::new(KernelError::TimedOut))
        );

        reply_and_receive(process, &[server], INVALID_HANDLE, &[], 0).unwrap();
        reply_and_receive(process, &[server], server, &[6], 0).unwrap_err();
        assert_eq!(wait_synchronization(process, &[event], 0), Ok(0));
        assert_eq!(request.result(), Some(Ok(())));
        assert_eq!(request.reply().as_slice(), &[6]);
    }

    #[test]
    fn test_close_handle_invalidates() {
        let f = fixture();
        let process = &f.process;
        let (writable, readable) = create_event(process).unwrap();
        close_handle(process, readable).unwrap();
        assert_eq!(close_handle(process, readable), Err(KernelError::InvalidHandle));
        assert_eq!(reset_signal(process, readable), Err(KernelError::InvalidHandle));
        // Wrong object type behind a valid handle
        assert_eq!(reset_signal(process, writable), Err(KernelError::InvalidHandle));
        assert_eq!(
            wait_synchronization(process, &[writable], 0),
            Err(WaitError::new(KernelError::InvalidHandle))
        );
    }

    #[test]
    fn test_event_calls() {
        let f = fixture();
        let process = &f.process;
        let (writable, readable) = create_event(process).unwrap();
        assert_eq!(reset_signal(process, readable), Err(KernelError::InvalidState));
        signal_event(process, writable).unwrap();
        assert_eq!(wait_synchronization(process, &[readable], 0), Ok(0));
        clear_event(process, readable).unwrap();
        assert!(wait_synchronization(process, &[readable], 0).is_err());
        signal_event(process, writable).unwrap();
        reset_signal(process, readable).unwrap();
        assert_eq!(
            signal_event(process, readable),
            Err(KernelError::InvalidHandle)
        );
        let limit = process.resource_limit().unwrap();
        assert_eq!(limit.current_value(LimitableResource::EventCountMax), 1);
    }

    #[test]
    fn test_resource_limit_calls() {
        let f = fixture();
        let process = &f.process;
        let limit = create_resource_limit(process).unwrap();
        set_resource_limit_limit_value(process, limit, 2, 10).unwrap();
        assert_eq!(get_resource_limit_limit_value(process, limit, 2), Ok(10));
        assert_eq!(get_resource_limit_current_value(process, limit, 2), Ok(0));
        assert_eq!(
            set_resource_limit_limit_value(process, limit, 9, 10),
            Err(KernelError::InvalidEnumValue)
        );
        assert_eq!(
            set_resource_limit_limit_value(process, limit, 2, -1),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn test_thread_calls_through_pseudo_handles() {
        let f = fixture();
        let process = &f.process;
        let thread = spawn_thread(&f, 0);
        let _bound = f.platform.bind(thread.id(), 0);

        assert_eq!(get_thread_priority(process, PSEUDO_CURRENT_THREAD), Ok(20));
        set_thread_priority(process, PSEUDO_CURRENT_THREAD, 30).unwrap();
        assert_eq!(thread.priority(), 30);
        assert_eq!(
            set_thread_priority(process, PSEUDO_CURRENT_THREAD, 64),
            Err(KernelError::InvalidPriority)
        );
        assert_eq!(
            get_thread_priority(process, PSEUDO_CURRENT_PROCESS),
            Err(KernelError::InvalidHandle)
        );

        set_thread_core_mask(process, PSEUDO_CURRENT_THREAD, IDEAL_CORE_NO_UPDATE, 0b11).unwrap();
        assert_eq!(thread.affinity(), (0, CoreMask(0b11)));
        assert_eq!(
            set_thread_core_mask(process, PSEUDO_CURRENT_THREAD, 1, 0b01),
            Err(KernelError::InvalidCoreId)
        );
        assert_eq!(
            set_thread_core_mask(process, PSEUDO_CURRENT_THREAD, 0, 0),
            Err(KernelError::InvalidCombination)
        );

        sleep_thread(process, YIELD_WITHOUT_MIGRATION).unwrap();
        assert_eq!(sleep_thread(process, -5), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_thread_calls_held_to_process_capabilities() {
        let f = fixture();
        let caps = Capabilities::with_core_priority(f.kernel.config(), 1, 1, 20, 40).unwrap();
        let process = KProcess::with_capabilities(&f.kernel, None, caps);
        let thread = KThread::create(&f.kernel, Some(&process), 30, 1).unwrap();
        let handle = process.handle_table().add(thread.clone().into()).unwrap();

        assert_eq!(
            set_thread_priority(&process, handle, 10),
            Err(KernelError::InvalidPriority)
        );
        set_thread_priority(&process, handle, 40).unwrap();
        assert_eq!(thread.priority(), 40);

        assert_eq!(
            set_thread_core_mask(&process, handle, 0, 0b11),
            Err(KernelError::InvalidCoreId)
        );
        assert_eq!(
            set_thread_core_mask(&process, handle, 1, 0b11),
            Err(KernelError::InvalidCoreId)
        );
        set_thread_core_mask(&process, handle, IDEAL_CORE_NO_UPDATE, 0b10).unwrap();
        assert_eq!(thread.affinity(), (1, CoreMask(0b10)));
    }

    #[test]
    fn test_cancel_synchronization_latches() {
        let f = fixture();
        let process = &f.process;
        let thread = spawn_thread(&f, 0);
        let handle = process.handle_table().add(thread.clone().into()).unwrap();
        let (_writable, readable) = create_event(process).unwrap();

        cancel_synchronization(process, handle).unwrap();
        let _bound = f.platform.bind(thread.id(), 0);
        assert_eq!(
            wait_synchronization(process, &[readable], -1),
            Err(WaitError::new(KernelError::Cancelled))
        );
    }
}
