//! Ports - the rendezvous point for sessions
//!
//! A port is created as a pair of endpoints. Clients connect through the
//! [`ClientPort`], which creates a session and queues its server half on the
//! [`ServerPort`]; the server accepts queued sessions in FIFO order.
//!
//! Port state only moves forward: Normal, then ClientClosed or ServerClosed
//! as soon as either endpoint goes away.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicI32, AtomicU8, Ordering};

use log::{debug, trace};

use super::session::{self, ClientSession, ServerSession};
use crate::kern::auto_object::{AutoObject, ObjectKind};
use crate::kern::kernel::Kernel;
use crate::kern::resource_limit::{LimitableResource, ScopedResourceReservation};
use crate::kern::scheduler::{SchedProtected, SchedulerState};
use crate::kern::synchronization::Waitable;
use crate::result::{KernelError, KernelResult};
use crate::types::ObjectId;

/// Port lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PortState {
    Normal = 0,
    ClientClosed = 1,
    ServerClosed = 2,
}

impl PortState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => PortState::Normal,
            1 => PortState::ClientClosed,
            _ => PortState::ServerClosed,
        }
    }
}

/// State shared by both endpoints and every session created through them
pub struct Port {
    kernel: Arc<Kernel>,
    state: AtomicU8,
    max_sessions: i32,
    num_sessions: AtomicI32,
    peak_sessions: AtomicI32,
    server_id: ObjectId,
    client_id: ObjectId,
    pending: SchedProtected<VecDeque<Arc<ServerSession>>>,
}

pub struct ServerPort {
    header: AutoObject,
    port: Arc<Port>,
}

pub struct ClientPort {
    header: AutoObject,
    port: Arc<Port>,
}

impl Port {
    /// Create a port accepting at most `max_sessions` live sessions
    pub fn new(kernel: &Arc<Kernel>, max_sessions: i32) -> (Arc<ServerPort>, Arc<ClientPort>) {
        let server_header = AutoObject::new(ObjectKind::ServerPort);
        let client_header = AutoObject::new(ObjectKind::ClientPort);
        let port = Arc::new(Port {
            kernel: kernel.clone(),
            state: AtomicU8::new(PortState::Normal as u8),
            max_sessions,
            num_sessions: AtomicI32::new(0),
            peak_sessions: AtomicI32::new(0),
            server_id: server_header.id(),
            client_id: client_header.id(),
            pending: SchedProtected::new(VecDeque::new()),
        });
        debug!(
            "created port {:?}/{:?} max sessions {}",
            port.server_id, port.client_id, max_sessions
        );
        (
            Arc::new(ServerPort {
                header: server_header,
                port: port.clone(),
            }),
            Arc::new(ClientPort {
                header: client_header,
                port,
            }),
        )
    }

    pub fn state(&self) -> PortState {
        PortState::from_raw(self.state.load(Ordering::Acquire))
    }

    fn close(&self, to: PortState) {
        let _ = self.state.compare_exchange(
            PortState::Normal as u8,
            to as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn max_sessions(&self) -> i32 {
        self.max_sessions
    }

    pub fn num_sessions(&self) -> i32 {
        self.num_sessions.load(Ordering::Acquire)
    }

    pub fn peak_sessions(&self) -> i32 {
        self.peak_sessions.load(Ordering::Acquire)
    }

    /// Take one session slot, failing at the maximum
    fn claim_session_slot(&self) -> KernelResult<()> {
        let mut current = self.num_sessions.load(Ordering::Acquire);
        loop {
            if current >= self.max_sessions {
                return Err(KernelError::OutOfSessions);
            }
            match self.num_sessions.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.peak_sessions.fetch_max(current + 1, Ordering::AcqRel);
        Ok(())
    }

    /// Queue a new server session for acceptance
    fn enqueue_session(&self, session: &Arc<ServerSession>) -> KernelResult<()> {
        let guard = self.kernel.scheduler().lock();
        let mut state = guard.state();
        if self.state() != PortState::Normal {
            return Err(KernelError::PortClosed);
        }
        let became_signaled = {
            let mut pending = self.pending.get(&state);
            pending.push_back(session.clone());
            pending.len() == 1
        };
        if became_signaled {
            state.notify_waiters(self.server_id, Ok(()));
        }
        Ok(())
    }

    /// A session created through this port was destroyed
    pub fn on_session_finalized(&self) {
        let previous = self.num_sessions.fetch_sub(1, Ordering::AcqRel);
        trace!("port {:?} session finalized, {} left", self.client_id, previous - 1);
        if previous == self.max_sessions {
            let guard = self.kernel.scheduler().lock();
            guard.state().notify_waiters(self.client_id, Ok(()));
        }
    }

    fn server_signaled(&self, state: &SchedulerState) -> bool {
        !self.pending.get(state).is_empty()
    }

    fn client_signaled(&self) -> bool {
        self.num_sessions() < self.max_sessions
    }
}

impl ServerPort {
    pub fn id(&self) -> ObjectId {
        self.header.id()
    }

    pub fn port(&self) -> &Arc<Port> {
        &self.port
    }

    /// Dequeue the oldest pending session
    pub fn accept_session(&self) -> KernelResult<Arc<ServerSession>> {
        let guard = self.port.kernel.scheduler().lock();
        let state = guard.state();
        let session = self.port.pending.get(&state).pop_front();
        session.ok_or(KernelError::NotFound)
    }

    pub fn pending_count(&self) -> usize {
        let guard = self.port.kernel.scheduler().lock();
        let state = guard.state();
        let count = self.port.pending.get(&state).len();
        count
    }
}

impl Waitable for ServerPort {
    fn object_id(&self) -> ObjectId {
        self.header.id()
    }

    fn is_signaled(&self, state: &SchedulerState) -> bool {
        self.port.server_signaled(state)
    }
}

impl Drop for ServerPort {
    fn drop(&mut self) {
        self.port.close(PortState::ServerClosed);
        let pending = {
            let guard = self.port.kernel.scheduler().lock();
            let state = guard.state();
            let drained = core::mem::take(&mut *self.port.pending.get(&state));
            drained
        };
        debug!(
            "server port {:?} closed with {} pending sessions",
            self.header.id(),
            pending.len()
        );
        // Pending sessions are closed outside the scheduling lock
        drop(pending);
    }
}

impl ClientPort {
    pub fn id(&self) -> ObjectId {
        self.header.id()
    }

    pub fn port(&self) -> &Arc<Port> {
        &self.port
    }

    /// Open a new session to the server
    ///
    /// Charges `SessionCountMax` against the calling process's limit.
    pub fn create_session(&self) -> KernelResult<Arc<ClientSession>> {
        let port = &self.port;
        if port.state() != PortState::Normal {
            return Err(KernelError::PortClosed);
        }

        let limit = port
            .kernel
            .current_process()
            .and_then(|process| process.resource_limit().cloned());
        let mut reservation = ScopedResourceReservation::new(
            limit.as_ref(),
            LimitableResource::SessionCountMax,
            1,
            port.kernel.reservation_timeout(),
        );
        if !reservation.succeeded() {
            return Err(KernelError::LimitReached);
        }

        port.claim_session_slot()?;
        let (server, client) = session::new_pair(&port.kernel, limit, Some(port.clone()));
        reservation.commit();

        // On failure both halves drop here, returning the slot and the reservation
        port.enqueue_session(&server)?;
        Ok(client)
    }
}

impl Waitable for ClientPort {
    fn object_id(&self) -> ObjectId {
        self.header.id()
    }

    fn is_signaled(&self, _state: &SchedulerState) -> bool {
        self.port.client_signaled()
    }
}

impl Drop for ClientPort {
    fn drop(&mut self) {
        self.port.close(PortState::ClientClosed);
        debug!("client port {:?} closed", self.header.id());
    }
}
