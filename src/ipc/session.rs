//! Sessions - synchronous request/reply channels
//!
//! A session is a shared [`Session`] with two endpoint objects. Clients send
//! requests through the [`ClientSession`]; the server waits on the
//! [`ServerSession`], receives one request at a time and replies to it.
//!
//! The server side holds at most one current request. Further requests queue
//! FIFO behind it and the session only reads as signaled again once the
//! current one is answered. The request list is protected by the scheduling
//! lock so that signal checks and list changes are atomic together; a light
//! lock additionally serializes receive, reply and teardown.
//!
//! Closing either endpoint fails the requests the other side can no longer
//! complete with `SessionClosed`. A request the server already received stays
//! current after the client goes, and the server's reply then reports
//! `SessionClosed` instead of delivering it.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU8, Ordering};

use log::{debug, trace};

use super::port::Port;
use super::request::{to_message, MessageBuffer, SessionRequest};
use crate::kern::auto_object::{AutoObject, ObjectKind, PostDestroy};
use crate::kern::event::WritableEvent;
use crate::kern::kernel::Kernel;
use crate::kern::light_lock::LightLock;
use crate::kern::resource_limit::{LimitableResource, ResourceLimit, ScopedResourceReservation};
use crate::kern::scheduler::{SchedProtected, SchedulerState};
use crate::kern::synchronization::Waitable;
use crate::kern::wait_queue::WaitKind;
use crate::result::{KernelError, KernelResult};
use crate::types::ObjectId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Normal = 0,
    ClientClosed = 1,
    ServerClosed = 2,
}

#[derive(Default)]
struct Requests {
    queue: VecDeque<Arc<SessionRequest>>,
    current: Option<Arc<SessionRequest>>,
}

/// State shared by both endpoints of a session
pub struct Session {
    id: ObjectId,
    kernel: Arc<Kernel>,
    state: AtomicU8,
    server_id: ObjectId,
    client_id: ObjectId,
    lock: LightLock<()>,
    requests: SchedProtected<Requests>,
    limit: Option<Arc<ResourceLimit>>,
    port: Option<Arc<Port>>,
}

pub struct ServerSession {
    header: AutoObject,
    session: Arc<Session>,
}

pub struct ClientSession {
    header: AutoObject,
    session: Arc<Session>,
}

/// Build both endpoints. The caller has already charged `limit` and claimed
/// a slot on `port`; both are returned when the session is destroyed.
pub(crate) fn new_pair(
    kernel: &Arc<Kernel>,
    limit: Option<Arc<ResourceLimit>>,
    port: Option<Arc<Port>>,
) -> (Arc<ServerSession>, Arc<ClientSession>) {
    let server_header = AutoObject::new(ObjectKind::ServerSession);
    let client_header = AutoObject::new(ObjectKind::ClientSession);
    let session = Arc::new(Session {
        id: ObjectId::new(),
        kernel: kernel.clone(),
        state: AtomicU8::new(SessionState::Normal as u8),
        server_id: server_header.id(),
        client_id: client_header.id(),
        lock: LightLock::new(()),
        requests: SchedProtected::new(Requests::default()),
        limit,
        port,
    });
    debug!(
        "created session {:?} (server {:?}, client {:?})",
        session.id, session.server_id, session.client_id
    );
    (
        Arc::new(ServerSession {
            header: server_header,
            session: session.clone(),
        }),
        Arc::new(ClientSession {
            header: client_header,
            session,
        }),
    )
}

/// Create a session pair that belongs to no port
pub fn create_session(
    kernel: &Arc<Kernel>,
    limit: Option<&Arc<ResourceLimit>>,
) -> KernelResult<(Arc<ServerSession>, Arc<ClientSession>)> {
    let mut reservation = ScopedResourceReservation::new(
        limit,
        LimitableResource::SessionCountMax,
        1,
        kernel.reservation_timeout(),
    );
    if !reservation.succeeded() {
        return Err(KernelError::LimitReached);
    }
    let pair = new_pair(kernel, limit.cloned(), None);
    reservation.commit();
    Ok(pair)
}

impl Session {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        match self.state.load(Ordering::Acquire) {
            0 => SessionState::Normal,
            1 => SessionState::ClientClosed,
            _ => SessionState::ServerClosed,
        }
    }

    pub fn is_client_closed(&self) -> bool {
        self.state() == SessionState::ClientClosed
    }

    pub fn is_server_closed(&self) -> bool {
        self.state() == SessionState::ServerClosed
    }

    fn close(&self, to: SessionState) {
        let _ = self.state.compare_exchange(
            SessionState::Normal as u8,
            to as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn server_signaled(&self, state: &SchedulerState) -> bool {
        if self.is_client_closed() {
            return true;
        }
        let requests = self.requests.get(state);
        !requests.queue.is_empty() && requests.current.is_none()
    }

    fn notify_server(&self, state: &mut SchedulerState) {
        if self.server_signaled(state) {
            state.notify_waiters(self.server_id, Ok(()));
        }
    }

    /// Queue `request` for the server. A synchronous sender is put to sleep
    /// waiting for the reply.
    fn on_request(&self, state: &mut SchedulerState, request: &Arc<SessionRequest>) -> KernelResult<()> {
        if self.is_server_closed() {
            return Err(KernelError::SessionClosed);
        }
        if !request.is_async() {
            if let Some(thread) = request.thread() {
                if state.thread(thread).termination_requested {
                    return Err(KernelError::TerminationRequested);
                }
                state.begin_wait(thread, WaitKind::SessionReply);
            }
        }

        let was_empty = {
            let mut requests = self.requests.get(state);
            requests.queue.push_back(request.clone());
            requests.queue.len() == 1
        };
        if was_empty {
            self.notify_server(state);
        }
        Ok(())
    }

    /// Hand the outcome of `request` back to its client
    fn complete(&self, request: &SessionRequest, result: KernelResult<()>) {
        request.set_result(result);
        if let Some(event) = request.event() {
            event.signal();
            return;
        }
        let Some(thread) = request.thread() else {
            return;
        };
        let guard = self.kernel.scheduler().lock();
        let mut state = guard.state();
        let waiting = state
            .thread_opt(thread)
            .is_some_and(|record| record.wait == Some(WaitKind::SessionReply));
        if waiting {
            state.thread_mut(thread).synced_object = None;
            state.end_wait(thread, result);
        }
    }

    fn pop_queued(&self) -> Option<Arc<SessionRequest>> {
        let guard = self.kernel.scheduler().lock();
        let state = guard.state();
        let request = self.requests.get(&state).queue.pop_front();
        request
    }

    fn on_client_closed(&self) {
        self.close(SessionState::ClientClosed);
        let scheduler = self.kernel.scheduler();
        let _serialized = self.lock.lock(scheduler);

        // The current request stays for the server to answer
        while let Some(request) = self.pop_queued() {
            self.complete(&request, Err(KernelError::SessionClosed));
        }

        let guard = scheduler.lock();
        guard
            .state()
            .abort_waiters(self.server_id, KernelError::SessionClosed);
    }

    fn on_server_closed(&self) {
        self.close(SessionState::ServerClosed);
        let scheduler = self.kernel.scheduler();
        let _serialized = self.lock.lock(scheduler);

        loop {
            let request = {
                let guard = scheduler.lock();
                let state = guard.state();
                let mut requests = self.requests.get(&state);
                let next = requests.current.take().or_else(|| requests.queue.pop_front());
                next
            };
            let Some(request) = request else {
                break;
            };
            self.complete(&request, Err(KernelError::SessionClosed));
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!("destroyed session {:?}", self.id);
        PostDestroy::ReleaseSession {
            limit: self.limit.take(),
            port: self.port.take(),
        }
        .run();
    }
}

// ============================================================================
// Server Session
// ============================================================================

impl ServerSession {
    pub fn id(&self) -> ObjectId {
        self.header.id()
    }

    /// Id of the shared session, the same for both endpoints
    pub fn session_id(&self) -> ObjectId {
        self.session.id
    }

    pub fn is_client_closed(&self) -> bool {
        self.session.is_client_closed()
    }

    /// Make the oldest queued request current and return its message
    ///
    /// Fails with `NotFound` when nothing is queued or a request is already
    /// being handled.
    pub fn receive_request(&self) -> KernelResult<MessageBuffer> {
        let session = &self.session;
        let scheduler = session.kernel.scheduler();
        let _serialized = session.lock.lock(scheduler);

        let request = {
            let guard = scheduler.lock();
            let state = guard.state();
            if session.is_client_closed() {
                return Err(KernelError::SessionClosed);
            }
            let mut requests = session.requests.get(&state);
            if requests.current.is_some() {
                return Err(KernelError::NotFound);
            }
            let request = requests.queue.pop_front().ok_or(KernelError::NotFound)?;
            requests.current = Some(request.clone());
            request
        };
        trace!("session {:?} received {:?}", session.id, request);
        Ok(request.message())
    }

    /// Answer the current request
    ///
    /// Releases the session for the next queued request. If the client has
    /// gone the reply is dropped and `SessionClosed` is returned.
    pub fn send_reply(&self, reply: &[u32]) -> KernelResult<()> {
        let reply = to_message(reply)?;
        let session = &self.session;
        let scheduler = session.kernel.scheduler();
        let _serialized = session.lock.lock(scheduler);

        let request = {
            let guard = scheduler.lock();
            let mut state = guard.state();
            let request = session
                .requests
                .get(&state)
                .current
                .take()
                .ok_or(KernelError::InvalidState)?;
            session.notify_server(&mut state);
            request
        };

        let result = if session.is_client_closed() {
            Err(KernelError::SessionClosed)
        } else {
            request.set_reply(reply);
            Ok(())
        };
        trace!("session {:?} replied {:?}: {:?}", session.id, request, result);
        session.complete(&request, result);
        result
    }

    pub fn queued_requests(&self) -> usize {
        let guard = self.session.kernel.scheduler().lock();
        let state = guard.state();
        let count = self.session.requests.get(&state).queue.len();
        count
    }

    pub fn has_current_request(&self) -> bool {
        let guard = self.session.kernel.scheduler().lock();
        let state = guard.state();
        let current = self.session.requests.get(&state).current.is_some();
        current
    }
}

impl Waitable for ServerSession {
    fn object_id(&self) -> ObjectId {
        self.header.id()
    }

    fn is_signaled(&self, state: &SchedulerState) -> bool {
        self.session.server_signaled(state)
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        debug!("server session {:?} closed", self.header.id());
        self.session.on_server_closed();
    }
}

// ============================================================================
// Client Session
// ============================================================================

impl ClientSession {
    pub fn id(&self) -> ObjectId {
        self.header.id()
    }

    pub fn session_id(&self) -> ObjectId {
        self.session.id
    }

    pub fn is_server_closed(&self) -> bool {
        self.session.is_server_closed()
    }

    /// Send `message` and block the calling thread until the reply
    pub fn send_sync_request(&self, message: &[u32]) -> KernelResult<MessageBuffer> {
        let kernel = &self.session.kernel;
        let thread = kernel.current_thread_id().ok_or(KernelError::InvalidState)?;
        let request = SessionRequest::new_sync(thread, message)?;
        let scheduler = kernel.scheduler();
        {
            let guard = scheduler.lock();
            let mut state = guard.state();
            self.session.on_request(&mut state, &request)?;
        }
        scheduler.park(thread);

        let result = {
            let guard = scheduler.lock();
            let result = guard.state().thread(thread).wait_result;
            result
        };
        result?;
        Ok(request.reply())
    }

    /// Send `message` without blocking
    ///
    /// `event` is signaled once the request completes; the reply and the
    /// result are then read from the returned request.
    pub fn send_async_request(
        &self,
        event: Arc<WritableEvent>,
        message: &[u32],
    ) -> KernelResult<Arc<SessionRequest>> {
        let kernel = &self.session.kernel;
        let request = SessionRequest::new_async(kernel.current_thread_id(), event, message)?;
        let guard = kernel.scheduler().lock();
        let mut state = guard.state();
        self.session.on_request(&mut state, &request)?;
        Ok(request)
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        debug!("client session {:?} closed", self.header.id());
        self.session.on_client_closed();
    }
}
