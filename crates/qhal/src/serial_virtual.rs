//! Virtual serial driver.
//!
//! Two [`VirtualSerial`] endpoints joined back to back form a full duplex
//! link between threads of the same kernel. Each endpoint buffers only its
//! incoming bytes. Writing to one end fills the other end's queue.

use std::sync::{Arc, Weak};

use log::debug;
use parking_lot::Mutex;
use qkernel::{SymmetricQueue, System, Timeout};

use crate::channel::{Channel, ChannelError, ChannelResult};

/// Size of each endpoint's incoming queue in bytes.
pub const VIRTUAL_SERIAL_BUFFER_SIZE: usize = 256;

/// Driver state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualSerialState {
    Stop,
    Ready,
}

/// Virtual serial configuration
#[derive(Debug, Clone)]
pub struct VirtualSerialConfig {
    /// Endpoint that receives this endpoint's writes.
    pub far_end: Weak<VirtualSerial>,
}

#[derive(Debug)]
struct Link {
    state: VirtualSerialState,
    far_end: Weak<VirtualSerial>,
}

/// One end of a virtual serial link.
#[derive(Debug)]
pub struct VirtualSerial {
    queue: SymmetricQueue,
    link: Mutex<Link>,
}

impl VirtualSerial {
    /// Creates a stopped endpoint.
    pub fn new(system: &System) -> Self {
        Self {
            queue: SymmetricQueue::new(system, VIRTUAL_SERIAL_BUFFER_SIZE),
            link: Mutex::new(Link {
                state: VirtualSerialState::Stop,
                far_end: Weak::new(),
            }),
        }
    }

    /// Creates two endpoints wired to each other and starts both.
    pub fn pair(system: &System) -> (Arc<VirtualSerial>, Arc<VirtualSerial>) {
        let a = Arc::new(Self::new(system));
        let b = Arc::new(Self::new(system));
        a.start(VirtualSerialConfig {
            far_end: Arc::downgrade(&b),
        });
        b.start(VirtualSerialConfig {
            far_end: Arc::downgrade(&a),
        });
        (a, b)
    }

    pub fn state(&self) -> VirtualSerialState {
        self.link.lock().state
    }

    /// Connects the endpoint to `config.far_end` and makes it ready.
    pub fn start(&self, config: VirtualSerialConfig) {
        let _lock = self.queue.system().lock();
        let mut link = self.link.lock();
        link.far_end = config.far_end;
        link.state = VirtualSerialState::Ready;
        debug!("virtual serial started");
    }

    /// Stops the endpoint.
    ///
    /// Buffered input is discarded and blocked readers are released with a
    /// reset, so their transfers end with a short count.
    pub fn stop(&self) {
        let lock = self.queue.system().lock();
        let released = self.queue.reset_i(&lock);
        let mut link = self.link.lock();
        link.state = VirtualSerialState::Stop;
        link.far_end = Weak::new();
        debug!("virtual serial stopped, {released} reader(s) released");
    }

    fn ensure_ready(&self) -> ChannelResult<()> {
        match self.link.lock().state {
            VirtualSerialState::Ready => Ok(()),
            VirtualSerialState::Stop => Err(ChannelError::NotReady),
        }
    }

    fn far_end(&self) -> ChannelResult<Arc<VirtualSerial>> {
        let link = self.link.lock();
        if link.state != VirtualSerialState::Ready {
            return Err(ChannelError::NotReady);
        }
        link.far_end.upgrade().ok_or(ChannelError::NotReady)
    }
}

impl Channel for VirtualSerial {
    fn put_timeout(&self, byte: u8, timeout: Timeout) -> ChannelResult<()> {
        let far = self.far_end()?;
        far.queue.put(byte, timeout)?;
        Ok(())
    }

    fn get_timeout(&self, timeout: Timeout) -> ChannelResult<u8> {
        self.ensure_ready()?;
        Ok(self.queue.get(timeout)?)
    }

    fn write_timeout(&self, data: &[u8], timeout: Timeout) -> ChannelResult<usize> {
        let far = self.far_end()?;
        if data.is_empty() {
            return Ok(0);
        }
        Ok(far.queue.write(data, timeout))
    }

    fn read_timeout(&self, buffer: &mut [u8], timeout: Timeout) -> ChannelResult<usize> {
        self.ensure_ready()?;
        if buffer.is_empty() {
            return Ok(0);
        }
        Ok(self.queue.read(buffer, timeout))
    }

    fn available(&self) -> usize {
        let lock = self.queue.system().lock();
        self.queue.len_i(&lock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qkernel::{Kernel, QueueError};

    #[test]
    fn new_endpoint_is_stopped() {
        let kernel = Kernel::start();
        let serial = VirtualSerial::new(kernel.system());

        assert_eq!(serial.state(), VirtualSerialState::Stop);
        assert_eq!(serial.put_timeout(1, Timeout::Immediate), Err(ChannelError::NotReady));
        assert_eq!(serial.get_timeout(Timeout::Immediate), Err(ChannelError::NotReady));
    }

    #[test]
    fn writes_land_in_far_end_queue() {
        let kernel = Kernel::start();
        let (a, b) = VirtualSerial::pair(kernel.system());

        assert_eq!(a.write(b"hi"), Ok(2));
        assert_eq!(a.available(), 0);
        assert_eq!(b.available(), 2);
        assert_eq!(b.get(), Ok(b'h'));
        assert_eq!(b.get(), Ok(b'i'));
        assert_eq!(
            b.get_timeout(Timeout::Immediate),
            Err(ChannelError::Queue(QueueError::Timeout))
        );
    }

    #[test]
    fn empty_transfers_are_no_ops() {
        let kernel = Kernel::start();
        let (a, b) = VirtualSerial::pair(kernel.system());

        assert_eq!(a.write(&[]), Ok(0));
        assert_eq!(b.read(&mut []), Ok(0));
    }

    #[test]
    fn dropped_far_end_is_not_ready() {
        let kernel = Kernel::start();
        let (a, b) = VirtualSerial::pair(kernel.system());
        drop(b);

        assert_eq!(a.state(), VirtualSerialState::Ready);
        assert_eq!(a.put(7), Err(ChannelError::NotReady));
    }

    #[test]
    fn full_far_end_short_write() {
        let kernel = Kernel::start();
        let (a, b) = VirtualSerial::pair(kernel.system());
        let data = vec![0x5A; VIRTUAL_SERIAL_BUFFER_SIZE + 10];

        assert_eq!(
            a.write_timeout(&data, Timeout::Immediate),
            Ok(VIRTUAL_SERIAL_BUFFER_SIZE)
        );
        assert_eq!(b.available(), VIRTUAL_SERIAL_BUFFER_SIZE);
    }
}
