//! Byte channel abstraction

use qkernel::{QueueError, Timeout};
use thiserror::Error;

/// Channel operation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The driver has not been started, or was stopped
    #[error("channel is not ready")]
    NotReady,
    /// The underlying queue timed out or was reset
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Result type for channel operations
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Blocking byte stream with per-call timeouts.
///
/// Bulk transfers report how many bytes moved. A timeout or reset part way
/// through yields a short count rather than an error.
///
/// Every call takes the kernel lock, so callers must be kernel threads.
pub trait Channel: Send + Sync {
    /// Write one byte, waiting up to `timeout` for space
    fn put_timeout(&self, byte: u8, timeout: Timeout) -> ChannelResult<()>;

    /// Read one byte, waiting up to `timeout` for data
    fn get_timeout(&self, timeout: Timeout) -> ChannelResult<u8>;

    /// Write `data`, waiting up to `timeout` for each byte
    fn write_timeout(&self, data: &[u8], timeout: Timeout) -> ChannelResult<usize>;

    /// Read into `buffer`, waiting up to `timeout` for each byte
    fn read_timeout(&self, buffer: &mut [u8], timeout: Timeout) -> ChannelResult<usize>;

    /// Bytes available to read without blocking
    fn available(&self) -> usize;

    fn put(&self, byte: u8) -> ChannelResult<()> {
        self.put_timeout(byte, Timeout::Infinite)
    }

    fn get(&self) -> ChannelResult<u8> {
        self.get_timeout(Timeout::Infinite)
    }

    fn write(&self, data: &[u8]) -> ChannelResult<usize> {
        self.write_timeout(data, Timeout::Infinite)
    }

    fn read(&self, buffer: &mut [u8]) -> ChannelResult<usize> {
        self.read_timeout(buffer, Timeout::Infinite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_errors_convert() {
        let err: ChannelError = QueueError::Reset.into();
        assert_eq!(err, ChannelError::Queue(QueueError::Reset));
        assert_eq!(err.to_string(), "queue was reset");
        assert_eq!(ChannelError::NotReady.to_string(), "channel is not ready");
    }
}
