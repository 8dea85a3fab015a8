//! Device layer for the hosted kernel.
//!
//! Drivers expose the [`Channel`] trait, a blocking byte stream with
//! timeouts, on top of the kernel's symmetric queues.

pub mod channel;
pub mod serial_virtual;

pub use channel::{Channel, ChannelError, ChannelResult};
pub use serial_virtual::{
    VirtualSerial, VirtualSerialConfig, VirtualSerialState, VIRTUAL_SERIAL_BUFFER_SIZE,
};
