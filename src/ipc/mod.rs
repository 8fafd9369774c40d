//! Inter-Process Communication
//!
//! Ports hand out sessions, sessions carry one request at a time, and handle
//! tables name all of it per process. [`reply_and_receive`] is the server
//! loop primitive that ties a reply to the next wait.

use alloc::sync::Arc;

use log::trace;

use crate::kern::kernel::Kernel;
use crate::kern::synchronization::{wait_any, SyncObject, WaitError};
use crate::result::KernelError;
use crate::types::Timeout;

pub mod handle_table;
pub mod port;
pub mod request;
pub mod session;

pub use handle_table::{Handle, HandleTable};
pub use port::{ClientPort, Port, PortState, ServerPort};
pub use request::{BufferDescriptor, MessageBuffer, SessionRequest, MESSAGE_WORDS};
pub use session::{create_session, ClientSession, ServerSession};

/// Outcome of a successful [`reply_and_receive`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    /// Index of the object that ended the wait
    pub index: usize,
    /// Request message, when that object is a server session
    pub message: Option<MessageBuffer>,
}

/// Reply on `reply_target`, then wait on `objects` and receive from the
/// server session that becomes ready
///
/// A failed reply is reported without an index. A session that turned out to
/// have nothing to receive (another server thread took the request) is waited
/// on again. Any other failure carries the index of the object involved.
pub fn reply_and_receive(
    kernel: &Kernel,
    objects: &[SyncObject],
    reply_target: Option<(&Arc<ServerSession>, &[u32])>,
    timeout: Timeout,
) -> Result<Received, WaitError> {
    if let Some((session, reply)) = reply_target {
        session.send_reply(reply).map_err(WaitError::new)?;
    }

    loop {
        let index = wait_any(kernel, objects, timeout)?;
        let SyncObject::ServerSession(session) = &objects[index] else {
            return Ok(Received {
                index,
                message: None,
            });
        };
        match session.receive_request() {
            Ok(message) => {
                return Ok(Received {
                    index,
                    message: Some(message),
                })
            }
            Err(KernelError::NotFound) => {
                trace!("session {:?} raced empty, waiting again", session.id());
                continue;
            }
            Err(error) => {
                return Err(WaitError {
                    error,
                    index: Some(index),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::host::HostPlatform;
    use crate::config::KernelConfig;
    use crate::kern::event::create_event;

    fn kernel() -> Arc<Kernel> {
        Kernel::new(KernelConfig::DEFAULT, Arc::new(HostPlatform::new(4)))
    }

    #[test]
    fn test_reply_then_receive_next() {
        let kernel = kernel();
        let (server, client) = create_session(&kernel, None).unwrap();
        let (event, _readable) = create_event(&kernel, None).unwrap();
        let first = client.send_async_request(event.clone(), &[1]).unwrap();
        client.send_async_request(event, &[2]).unwrap();
        let objects = [SyncObject::ServerSession(server.clone())];

        let received = reply_and_receive(&kernel, &objects, None, Timeout::Poll).unwrap();
        assert_eq!(received.index, 0);
        assert_eq!(received.message.unwrap().as_slice(), &[1]);

        let received =
            reply_and_receive(&kernel, &objects, Some((&server, &[10][..])), Timeout::Poll).unwrap();
        assert_eq!(received.message.unwrap().as_slice(), &[2]);
        assert_eq!(first.reply().as_slice(), &[10]);

        // Nothing left: the reply lands, then the wait times out
        assert_eq!(
            reply_and_receive(&kernel, &objects, Some((&server, &[20][..])), Timeout::Poll),
            Err(WaitError::new(KernelError::TimedOut))
        );
    }

    #[test]
    fn test_failed_reply_has_no_index() {
        let kernel = kernel();
        let (server, _client) = create_session(&kernel, None).unwrap();
        let objects = [SyncObject::ServerSession(server.clone())];
        assert_eq!(
            reply_and_receive(&kernel, &objects, Some((&server, &[1][..])), Timeout::Poll),
            Err(WaitError::new(KernelError::InvalidState))
        );
    }

    #[test]
    fn test_closed_client_reports_session_index() {
        let kernel = kernel();
        let (event, readable) = create_event(&kernel, None).unwrap();
        let (server, client) = create_session(&kernel, None).unwrap();
        drop(client);
        let objects = [
            SyncObject::ReadableEvent(readable),
            SyncObject::ServerSession(server),
        ];
        assert_eq!(
            reply_and_receive(&kernel, &objects, None, Timeout::Poll),
            Err(WaitError {
                error: KernelError::SessionClosed,
                index: Some(1)
            })
        );

        event.signal();
        let received = reply_and_receive(&kernel, &objects, None, Timeout::Poll).unwrap();
        assert_eq!(received.index, 0);
        assert_eq!(received.message, None);
    }
}
