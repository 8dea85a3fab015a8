//! Ready list and wait lists.
//!
//! ## Scheduling Policy
//!
//! 1. The highest-priority ready thread runs
//! 2. Threads of equal priority run in FIFO order
//! 3. A thread preempted by a higher priority goes back ahead of its peers
//! 4. A thread that yields or exhausts its quantum goes back behind its peers
//!
//! Wait lists hold [`WaitTicket`]s rather than thread ids. A thread gets a
//! fresh ticket every time it blocks. A timed-out waiter takes its ticket off
//! the list when it resumes; until then the ticket is stale and waking it is
//! a no-op.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::thread::{ThreadId, ThreadPriority};

/// Reason delivered to a thread resuming from a blocking wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeCode {
    /// The awaited condition may now hold.
    Success,
    /// The object being waited on was reset.
    Reset,
    /// The timeout elapsed.
    Timeout,
}

/// One blocking episode of one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitTicket {
    pub(crate) thread: ThreadId,
    pub(crate) seq: u64,
}

impl WaitTicket {
    pub fn thread(&self) -> ThreadId {
        self.thread
    }
}

/// FIFO of threads blocked on an object.
#[derive(Debug, Default)]
pub struct WaitList {
    waiters: Mutex<VecDeque<WaitTicket>>,
}

impl WaitList {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, ticket: WaitTicket) {
        self.waiters.lock().push_back(ticket);
    }

    pub(crate) fn pop(&self) -> Option<WaitTicket> {
        self.waiters.lock().pop_front()
    }

    /// Drops `ticket` if it is still queued.
    pub(crate) fn remove(&self, ticket: WaitTicket) -> bool {
        let mut waiters = self.waiters.lock();
        let before = waiters.len();
        waiters.retain(|&queued| queued != ticket);
        waiters.len() != before
    }

    /// Number of queued waiters.
    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }
}

/// Ready threads, highest priority first.
#[derive(Debug, Default)]
pub(crate) struct ReadyList {
    ready: Vec<(ThreadId, ThreadPriority)>,
}

impl ReadyList {
    /// Queues `id` after every ready thread of the same or higher priority.
    pub(crate) fn insert_behind(&mut self, id: ThreadId, priority: ThreadPriority) {
        debug_assert!(!self.contains(id), "thread {id:?} already ready");
        let at = self
            .ready
            .iter()
            .position(|&(_, p)| p < priority)
            .unwrap_or(self.ready.len());
        self.ready.insert(at, (id, priority));
    }

    /// Queues `id` ahead of ready threads of the same priority.
    pub(crate) fn insert_ahead(&mut self, id: ThreadId, priority: ThreadPriority) {
        debug_assert!(!self.contains(id), "thread {id:?} already ready");
        let at = self
            .ready
            .iter()
            .position(|&(_, p)| p <= priority)
            .unwrap_or(self.ready.len());
        self.ready.insert(at, (id, priority));
    }

    pub(crate) fn pop_highest(&mut self) -> Option<ThreadId> {
        if self.ready.is_empty() {
            None
        } else {
            Some(self.ready.remove(0).0)
        }
    }

    pub(crate) fn highest_priority(&self) -> Option<ThreadPriority> {
        self.ready.first().map(|&(_, p)| p)
    }

    pub(crate) fn contains(&self, id: ThreadId) -> bool {
        self.ready.iter().any(|&(tid, _)| tid == id)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }
}
