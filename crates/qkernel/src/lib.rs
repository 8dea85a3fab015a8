//! Reference scheduler and symmetric byte queues for the hosted kernel.
//!
//! ## Module Overview
//!
//! - [`system`]: kernel start-up, the system lock and the wait/ready primitives
//! - [`scheduler`]: ready list, wait lists and wake codes
//! - [`queue`]: [`SymmetricQueue`], the blocking byte buffer used by drivers
//! - [`thread`]: thread identifiers, priorities and configuration
//! - [`time`]: system time and timeouts
//! - [`config`]: kernel configuration and its builder
//!
//! ```no_run
//! use qkernel::{Kernel, SymmetricQueue, ThreadConfig, ThreadPriority, Timeout};
//! use std::sync::Arc;
//!
//! let kernel = Kernel::start();
//! let sys = kernel.system().clone();
//! let queue = Arc::new(SymmetricQueue::new(&sys, 16));
//!
//! let producer = Arc::clone(&queue);
//! let id = sys
//!     .spawn(ThreadConfig::new("producer", ThreadPriority::NORMAL), move || {
//!         producer.write(b"hello", Timeout::Infinite);
//!     })
//!     .unwrap();
//!
//! let mut buf = [0u8; 5];
//! assert_eq!(queue.read(&mut buf, Timeout::Infinite), 5);
//! sys.join(id);
//! ```

pub mod config;
pub mod error;
pub mod queue;
pub mod scheduler;
pub mod system;
pub mod thread;
pub mod time;

pub use config::{ClockMode, KernelConfig, KernelConfigBuilder};
pub use error::{KernelError, QueueError};
pub use qport_posix::{HaltHook, IrqSources};
pub use queue::SymmetricQueue;
pub use scheduler::{WaitList, WaitTicket, WakeCode};
pub use system::{AttachedDevice, Kernel, KernelBuilder, SysLock, System};
pub use thread::{ThreadConfig, ThreadId, ThreadInfo, ThreadPriority, ThreadState};
pub use time::{SysTime, Timeout};
