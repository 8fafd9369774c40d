//! Kernel result codes
//!
//! Every recoverable failure is a [`KernelError`]. The ABI encodes results as
//! `module | description << 9`, with all kernel results in module 1.

use thiserror::Error;

/// Result module shared by all kernel results
pub const KERNEL_RESULT_MODULE: u32 = 1;

/// Encoded success value
pub const RESULT_SUCCESS: u32 = 0;

/// Recoverable kernel errors
///
/// Admission failures, timeouts and closed connections all travel back to the
/// caller through this type. Invariant violations panic instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum KernelError {
    #[error("out of sessions")]
    OutOfSessions,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("termination requested")]
    TerminationRequested,
    #[error("invalid size")]
    InvalidSize,
    #[error("out of resource")]
    OutOfResource,
    #[error("out of memory")]
    OutOfMemory,
    #[error("out of handles")]
    OutOfHandles,
    #[error("invalid priority")]
    InvalidPriority,
    #[error("invalid core id")]
    InvalidCoreId,
    #[error("invalid handle")]
    InvalidHandle,
    #[error("invalid combination")]
    InvalidCombination,
    #[error("timed out")]
    TimedOut,
    #[error("cancelled")]
    Cancelled,
    #[error("out of range")]
    OutOfRange,
    #[error("invalid enum value")]
    InvalidEnumValue,
    #[error("not found")]
    NotFound,
    #[error("busy")]
    Busy,
    #[error("session closed")]
    SessionClosed,
    #[error("invalid state")]
    InvalidState,
    #[error("port closed")]
    PortClosed,
    #[error("limit reached")]
    LimitReached,
    #[error("message too large")]
    MessageTooLarge,
}

/// Result type for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

/// Description values, in ABI order
const DESCRIPTIONS: &[(KernelError, u32)] = &[
    (KernelError::OutOfSessions, 7),
    (KernelError::InvalidArgument, 14),
    (KernelError::TerminationRequested, 59),
    (KernelError::InvalidSize, 101),
    (KernelError::OutOfResource, 103),
    (KernelError::OutOfMemory, 104),
    (KernelError::OutOfHandles, 105),
    (KernelError::InvalidPriority, 112),
    (KernelError::InvalidCoreId, 113),
    (KernelError::InvalidHandle, 114),
    (KernelError::InvalidCombination, 116),
    (KernelError::TimedOut, 117),
    (KernelError::Cancelled, 118),
    (KernelError::OutOfRange, 119),
    (KernelError::InvalidEnumValue, 120),
    (KernelError::NotFound, 121),
    (KernelError::Busy, 122),
    (KernelError::SessionClosed, 123),
    (KernelError::InvalidState, 125),
    (KernelError::PortClosed, 131),
    (KernelError::LimitReached, 132),
    (KernelError::MessageTooLarge, 260),
];

impl KernelError {
    /// Description field of the encoded result
    pub fn description(self) -> u32 {
        DESCRIPTIONS
            .iter()
            .find(|(error, _)| *error == self)
            .map(|(_, desc)| *desc)
            .unwrap_or(0)
    }

    /// Full ABI result value
    pub fn code(self) -> u32 {
        KERNEL_RESULT_MODULE | (self.description() << 9)
    }

    /// Decode an ABI result value. Success and foreign modules yield `None`.
    pub fn from_code(code: u32) -> Option<Self> {
        if code & 0x1FF != KERNEL_RESULT_MODULE {
            return None;
        }
        let desc = (code >> 9) & 0x1FFF;
        DESCRIPTIONS
            .iter()
            .find(|(_, d)| *d == desc)
            .map(|(error, _)| *error)
    }
}

/// Encode a result for the ABI
pub fn result_code(result: KernelResult<()>) -> u32 {
    match result {
        Ok(()) => RESULT_SUCCESS,
        Err(error) => error.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_encoding() {
        assert_eq!(KernelError::TimedOut.code(), 0xEA01);
        assert_eq!(KernelError::SessionClosed.code(), 0xF601);
        assert_eq!(KernelError::InvalidHandle.code(), 0xE401);
        assert_eq!(KernelError::OutOfHandles.code(), 0xD201);
        assert_eq!(KernelError::LimitReached.code(), 0x10801);
        assert_eq!(result_code(Ok(())), 0);
    }

    #[test]
    fn test_result_decoding() {
        for (error, _) in DESCRIPTIONS {
            assert_eq!(KernelError::from_code(error.code()), Some(*error));
        }
        assert_eq!(KernelError::from_code(0), None);
        // Foreign module
        assert_eq!(KernelError::from_code(2 | (117 << 9)), None);
    }
}
