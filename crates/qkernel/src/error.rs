//! Recoverable error types.
//!
//! Conditions that indicate a programming error halt the system instead of
//! being reported here.

use thiserror::Error;

use crate::scheduler::WakeCode;
use crate::thread::ThreadPriority;

/// Outcome of a queue operation that did not transfer a byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The timeout elapsed, or was immediate, before the operation could proceed.
    #[error("queue operation timed out")]
    Timeout,
    /// The queue was reset while the caller was waiting.
    #[error("queue was reset")]
    Reset,
    /// Non-blocking get on an empty queue.
    #[error("queue is empty")]
    Empty,
    /// Non-blocking put on a full queue.
    #[error("queue is full")]
    Full,
}

impl WakeCode {
    /// Maps a wake code onto the result of a blocking queue call.
    pub fn into_result(self) -> Result<(), QueueError> {
        match self {
            WakeCode::Success => Ok(()),
            WakeCode::Reset => Err(QueueError::Reset),
            WakeCode::Timeout => Err(QueueError::Timeout),
        }
    }
}

/// Errors reported by thread management.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("thread limit of {max} reached")]
    TooManyThreads { max: usize },
    #[error("priority {} is outside {}..={}", .priority.0, ThreadPriority::LOWEST.0, ThreadPriority::HIGHEST.0)]
    InvalidPriority { priority: ThreadPriority },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_codes_map_to_results() {
        assert_eq!(WakeCode::Success.into_result(), Ok(()));
        assert_eq!(WakeCode::Reset.into_result(), Err(QueueError::Reset));
        assert_eq!(WakeCode::Timeout.into_result(), Err(QueueError::Timeout));
    }

    #[test]
    fn error_messages() {
        assert_eq!(
            KernelError::InvalidPriority {
                priority: ThreadPriority(0)
            }
            .to_string(),
            "priority 0 is outside 1..=127"
        );
        assert_eq!(
            KernelError::TooManyThreads { max: 4 }.to_string(),
            "thread limit of 4 reached"
        );
        assert_eq!(QueueError::Reset.to_string(), "queue was reset");
    }
}
