//! Symmetric byte queues.
//!
//! A [`SymmetricQueue`] is a fixed-capacity circular byte buffer with a single
//! FIFO wait list shared by blocked producers and blocked consumers. The same
//! type serves as either end of a channel. Every transfer wakes the longest
//! waiting thread, which re-checks the buffer before concluding anything, so
//! a wake-up intended for the other side costs one extra trip round the loop
//! and never a lost or duplicated byte.
//!
//! All buffer state is mutated with the kernel lock held.

use std::fmt;

use log::debug;
use parking_lot::Mutex;

use crate::error::QueueError;
use crate::scheduler::{WaitList, WakeCode};
use crate::system::{SysLock, System};
use crate::time::Timeout;

struct Ring {
    buffer: Box<[u8]>,
    rdptr: usize,
    wrptr: usize,
    counter: usize,
}

impl Ring {
    fn new(buffer: Box<[u8]>) -> Self {
        Self {
            buffer,
            rdptr: 0,
            wrptr: 0,
            counter: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.buffer.len()
    }

    fn is_empty(&self) -> bool {
        self.counter == 0
    }

    fn is_full(&self) -> bool {
        self.counter == self.capacity()
    }

    fn pop(&mut self) -> Option<u8> {
        if self.is_empty() {
            return None;
        }
        let byte = self.buffer[self.rdptr];
        self.rdptr = (self.rdptr + 1) % self.capacity();
        self.counter -= 1;
        Some(byte)
    }

    fn push(&mut self, byte: u8) -> bool {
        if self.is_full() {
            return false;
        }
        self.buffer[self.wrptr] = byte;
        self.wrptr = (self.wrptr + 1) % self.capacity();
        self.counter += 1;
        true
    }

    fn clear(&mut self) {
        self.rdptr = 0;
        self.wrptr = 0;
        self.counter = 0;
    }
}

/// Blocking circular byte buffer usable as an input or an output queue.
pub struct SymmetricQueue {
    system: System,
    ring: Mutex<Ring>,
    waiting: WaitList,
}

impl SymmetricQueue {
    /// Creates a queue holding up to `capacity` bytes. Halts if `capacity` is 0.
    pub fn new(system: &System, capacity: usize) -> Self {
        Self::from_buffer(system, vec![0; capacity].into_boxed_slice())
    }

    /// Creates a queue over a caller-provided buffer. Halts if it is empty.
    pub fn from_buffer(system: &System, buffer: Box<[u8]>) -> Self {
        if buffer.is_empty() {
            system.halt("queue capacity must be non-zero");
        }
        Self {
            system: system.clone(),
            ring: Mutex::new(Ring::new(buffer)),
            waiting: WaitList::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity()
    }

    pub fn system(&self) -> &System {
        &self.system
    }

    fn check_lock(&self, lock: &SysLock<'_>) {
        debug_assert!(
            lock.system().same_kernel(&self.system),
            "lock taken on a different kernel"
        );
    }

    /// Discards buffered data and releases every waiter with [`QueueError::Reset`].
    ///
    /// Returns the number of threads released. They are made ready, not run.
    pub fn reset_i(&self, lock: &SysLock<'_>) -> usize {
        self.check_lock(lock);
        self.ring.lock().clear();
        let released = self.system.wake_all_s(lock, &self.waiting, WakeCode::Reset);
        debug!("queue reset, {released} waiter(s) released");
        released
    }

    pub fn is_empty_i(&self, lock: &SysLock<'_>) -> bool {
        self.check_lock(lock);
        self.ring.lock().is_empty()
    }

    pub fn is_full_i(&self, lock: &SysLock<'_>) -> bool {
        self.check_lock(lock);
        self.ring.lock().is_full()
    }

    /// Number of buffered bytes.
    pub fn len_i(&self, lock: &SysLock<'_>) -> usize {
        self.check_lock(lock);
        self.ring.lock().counter
    }

    /// Removes the oldest byte without blocking.
    pub fn get_i(&self, lock: &SysLock<'_>) -> Result<u8, QueueError> {
        self.check_lock(lock);
        let popped = self.ring.lock().pop();
        let byte = popped.ok_or(QueueError::Empty)?;
        self.system.wake_one_s(lock, &self.waiting, WakeCode::Success);
        Ok(byte)
    }

    /// Appends a byte without blocking.
    pub fn put_i(&self, lock: &SysLock<'_>, byte: u8) -> Result<(), QueueError> {
        self.check_lock(lock);
        let pushed = self.ring.lock().push(byte);
        if !pushed {
            return Err(QueueError::Full);
        }
        self.system.wake_one_s(lock, &self.waiting, WakeCode::Success);
        Ok(())
    }

    fn get_s(&self, lock: &SysLock<'_>, timeout: Timeout) -> Result<u8, QueueError> {
        loop {
            match self.get_i(lock) {
                Err(QueueError::Empty) => self
                    .system
                    .enqueue_and_sleep_s(lock, &self.waiting, timeout)
                    .into_result()?,
                result => return result,
            }
        }
    }

    fn put_s(&self, lock: &SysLock<'_>, byte: u8, timeout: Timeout) -> Result<(), QueueError> {
        loop {
            match self.put_i(lock, byte) {
                Err(QueueError::Full) => self
                    .system
                    .enqueue_and_sleep_s(lock, &self.waiting, timeout)
                    .into_result()?,
                result => return result,
            }
        }
    }

    /// Removes the oldest byte, waiting up to `timeout` for one to arrive.
    pub fn get(&self, timeout: Timeout) -> Result<u8, QueueError> {
        let lock = self.system.lock();
        self.get_s(&lock, timeout)
    }

    /// Appends `byte`, waiting up to `timeout` for space.
    pub fn put(&self, byte: u8, timeout: Timeout) -> Result<(), QueueError> {
        let lock = self.system.lock();
        self.put_s(&lock, byte, timeout)
    }

    /// Fills `buf` byte by byte and returns how many bytes were transferred.
    ///
    /// The lock is released between bytes. `timeout` applies to each wait;
    /// a reset or timeout ends the transfer early with a short count.
    /// Halts if `buf` is empty.
    pub fn read(&self, buf: &mut [u8], timeout: Timeout) -> usize {
        if buf.is_empty() {
            self.system.halt("queue read of zero bytes");
        }
        let mut transferred = 0;
        for slot in buf.iter_mut() {
            let lock = self.system.lock();
            match self.get_s(&lock, timeout) {
                Ok(byte) => *slot = byte,
                Err(_) => break,
            }
            drop(lock);
            transferred += 1;
        }
        transferred
    }

    /// Sends `buf` byte by byte and returns how many bytes were transferred.
    ///
    /// Same early-exit rules as [`SymmetricQueue::read`].
    pub fn write(&self, buf: &[u8], timeout: Timeout) -> usize {
        if buf.is_empty() {
            self.system.halt("queue write of zero bytes");
        }
        let mut transferred = 0;
        for &byte in buf {
            let lock = self.system.lock();
            if self.put_s(&lock, byte, timeout).is_err() {
                break;
            }
            drop(lock);
            transferred += 1;
        }
        transferred
    }
}

impl fmt::Debug for SymmetricQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ring = self.ring.lock();
        f.debug_struct("SymmetricQueue")
            .field("capacity", &ring.capacity())
            .field("count", &ring.counter)
            .field("waiting", &self.waiting.len())
            .finish()
    }
}
