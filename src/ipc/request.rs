//! Session requests
//!
//! One in-flight call on a session. A request carries the client's message,
//! and once answered, the server's reply and the result the client sees.
//! Synchronous requests name the blocked client thread; asynchronous ones
//! carry the event that is signaled on completion instead.

use alloc::sync::Arc;

use spin::Mutex;

use crate::kern::event::WritableEvent;
use crate::result::{KernelError, KernelResult};
use crate::types::ThreadId;

/// Words in an IPC message buffer
pub const MESSAGE_WORDS: usize = 64;

/// Fixed-capacity message payload
pub type MessageBuffer = heapless::Vec<u32, MESSAGE_WORDS>;

/// Client buffer named by a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferDescriptor {
    pub address: usize,
    pub size: usize,
}

/// Copy `words` into a message buffer
pub fn to_message(words: &[u32]) -> KernelResult<MessageBuffer> {
    MessageBuffer::from_slice(words).map_err(|_| KernelError::MessageTooLarge)
}

struct Exchange {
    message: MessageBuffer,
    reply: MessageBuffer,
    result: Option<KernelResult<()>>,
}

pub struct SessionRequest {
    thread: Option<ThreadId>,
    event: Option<Arc<WritableEvent>>,
    buffer: BufferDescriptor,
    exchange: Mutex<Exchange>,
}

impl SessionRequest {
    fn new(
        thread: Option<ThreadId>,
        event: Option<Arc<WritableEvent>>,
        message: &[u32],
    ) -> KernelResult<Arc<Self>> {
        let message = to_message(message)?;
        Ok(Arc::new(Self {
            thread,
            event,
            buffer: BufferDescriptor {
                address: 0,
                size: message.len() * core::mem::size_of::<u32>(),
            },
            exchange: Mutex::new(Exchange {
                message,
                reply: MessageBuffer::new(),
                result: None,
            }),
        }))
    }

    /// Request whose client thread blocks until the reply
    pub fn new_sync(thread: ThreadId, message: &[u32]) -> KernelResult<Arc<Self>> {
        Self::new(Some(thread), None, message)
    }

    /// Request whose completion signals `event`
    pub fn new_async(
        thread: Option<ThreadId>,
        event: Arc<WritableEvent>,
        message: &[u32],
    ) -> KernelResult<Arc<Self>> {
        Self::new(thread, Some(event), message)
    }

    pub fn thread(&self) -> Option<ThreadId> {
        self.thread
    }

    pub fn event(&self) -> Option<&Arc<WritableEvent>> {
        self.event.as_ref()
    }

    pub fn is_async(&self) -> bool {
        self.event.is_some()
    }

    pub fn buffer(&self) -> BufferDescriptor {
        self.buffer
    }

    pub fn message(&self) -> MessageBuffer {
        self.exchange.lock().message.clone()
    }

    pub fn reply(&self) -> MessageBuffer {
        self.exchange.lock().reply.clone()
    }

    /// Completion result; `None` while the request is unanswered
    pub fn result(&self) -> Option<KernelResult<()>> {
        self.exchange.lock().result
    }

    pub(crate) fn set_reply(&self, reply: MessageBuffer) {
        self.exchange.lock().reply = reply;
    }

    pub(crate) fn set_result(&self, result: KernelResult<()>) {
        self.exchange.lock().result = Some(result);
    }
}

impl core::fmt::Debug for SessionRequest {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SessionRequest")
            .field("thread", &self.thread)
            .field("async", &self.is_async())
            .field("size", &self.buffer.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_capacity() {
        let words = [7u32; MESSAGE_WORDS];
        let request = SessionRequest::new_sync(ThreadId(1), &words).unwrap();
        assert_eq!(request.message().len(), MESSAGE_WORDS);
        assert_eq!(request.buffer().size, MESSAGE_WORDS * 4);
        assert!(!request.is_async());

        let too_long = [0u32; MESSAGE_WORDS + 1];
        assert_eq!(
            SessionRequest::new_sync(ThreadId(1), &too_long).err(),
            Some(KernelError::MessageTooLarge)
        );
    }

    #[test]
    fn test_reply_and_result() {
        let request = SessionRequest::new_sync(ThreadId(1), &[1, 2]).unwrap();
        assert_eq!(request.result(), None);
        request.set_reply(to_message(&[3]).unwrap());
        request.set_result(Ok(()));
        assert_eq!(request.reply().as_slice(), &[3]);
        assert_eq!(request.result(), Some(Ok(())));
    }
}
