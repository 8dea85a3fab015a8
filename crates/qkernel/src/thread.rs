//! Kernel threads.
//!
//! Every thread owns an execution context with its own stack. Threads are
//! stored in an arena inside the kernel and named by their [`ThreadId`],
//! which is the arena index. The main thread (the OS thread that started the
//! kernel) is always id 0 and the idle thread id 1.

use std::fmt;
use std::sync::Arc;

use qport_posix::ExecutionContext;

use crate::scheduler::{WaitList, WaitTicket, WakeCode};

/// Thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u8);

impl ThreadId {
    /// The thread that started the kernel.
    pub const MAIN: ThreadId = ThreadId(0);
    /// The idle thread.
    pub const IDLE: ThreadId = ThreadId(1);

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Thread priority. Larger values are more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadPriority(pub u8);

impl ThreadPriority {
    /// Reserved for the idle thread.
    pub const IDLE: ThreadPriority = ThreadPriority(0);
    pub const LOWEST: ThreadPriority = ThreadPriority(1);
    pub const NORMAL: ThreadPriority = ThreadPriority(64);
    pub const HIGHEST: ThreadPriority = ThreadPriority(127);

    /// Priority `levels` steps above this one.
    pub const fn above(self, levels: u8) -> ThreadPriority {
        ThreadPriority(self.0.saturating_add(levels))
    }

    /// Priority `levels` steps below this one.
    pub const fn below(self, levels: u8) -> ThreadPriority {
        ThreadPriority(self.0.saturating_sub(levels))
    }
}

impl Default for ThreadPriority {
    fn default() -> Self {
        Self::NORMAL
    }
}

/// Thread execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Thread is ready to run, including threads that never ran.
    Ready,
    /// Thread is currently executing.
    Running,
    /// Thread is blocked on a wait list or sleeping.
    Blocked,
    /// Thread has completed execution.
    Terminated,
}

/// Thread body.
pub type ThreadHandler = Box<dyn FnOnce() + Send>;

/// Configuration for creating a thread.
#[derive(Debug, Clone)]
pub struct ThreadConfig {
    /// Thread name, used for logging and the backing OS thread.
    pub name: String,
    pub priority: ThreadPriority,
    /// Stack size in bytes, `None` for the kernel default.
    pub stack_size: Option<usize>,
}

impl ThreadConfig {
    pub fn new(name: impl Into<String>, priority: ThreadPriority) -> Self {
        Self {
            name: name.into(),
            priority,
            stack_size: None,
        }
    }

    /// Sets the stack size for the thread.
    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }
}

/// Snapshot of a thread's scheduling data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub name: String,
    pub priority: ThreadPriority,
    pub state: ThreadState,
    /// False until the thread has been switched into once.
    pub started: bool,
}

pub(crate) struct ThreadSlot {
    pub(crate) name: String,
    pub(crate) priority: ThreadPriority,
    pub(crate) state: ThreadState,
    pub(crate) context: Arc<ExecutionContext>,
    /// Wake code of the last completed wait.
    pub(crate) wake: WakeCode,
    /// Ticket of the wait in progress, if blocked.
    pub(crate) ticket: Option<WaitTicket>,
    /// Ticks left before round-robin rotation.
    pub(crate) quantum: u32,
    /// Threads waiting in [`crate::System::join`].
    pub(crate) joiners: Arc<WaitList>,
}

impl ThreadSlot {
    pub(crate) fn new(
        name: String,
        priority: ThreadPriority,
        state: ThreadState,
        context: Arc<ExecutionContext>,
    ) -> Self {
        Self {
            name,
            priority,
            state,
            context,
            wake: WakeCode::Success,
            ticket: None,
            quantum: 0,
            joiners: Arc::new(WaitList::new()),
        }
    }

    pub(crate) fn info(&self, id: ThreadId) -> ThreadInfo {
        ThreadInfo {
            id,
            name: self.name.clone(),
            priority: self.priority,
            state: self.state,
            started: self.context.has_started(),
        }
    }
}

impl fmt::Debug for ThreadSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadSlot")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("state", &self.state)
            .field("ticket", &self.ticket)
            .finish()
    }
}
