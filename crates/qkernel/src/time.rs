//! System time and timeouts.

use crate::scheduler::WaitTicket;

/// System time in ticks since the kernel started.
pub type SysTime = u64;

/// How long a blocking call may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Never block; fail at once if the call cannot proceed.
    Immediate,
    /// Block until woken.
    Infinite,
    /// Block for at most this many ticks. `Ticks(0)` behaves as `Immediate`.
    Ticks(u32),
}

impl Timeout {
    pub fn is_immediate(self) -> bool {
        matches!(self, Timeout::Immediate | Timeout::Ticks(0))
    }

    /// Absolute deadline for a wait starting at `now`, `None` if unbounded.
    pub(crate) fn deadline(self, now: SysTime) -> Option<SysTime> {
        match self {
            Timeout::Ticks(ticks) => Some(now + SysTime::from(ticks)),
            Timeout::Immediate | Timeout::Infinite => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TimerEntry {
    deadline: SysTime,
    ticket: WaitTicket,
}

/// Pending wait timeouts ordered by deadline.
#[derive(Debug, Default)]
pub(crate) struct TimerList {
    entries: Vec<TimerEntry>,
}

impl TimerList {
    pub(crate) fn arm(&mut self, deadline: SysTime, ticket: WaitTicket) {
        let at = self
            .entries
            .iter()
            .position(|e| e.deadline > deadline)
            .unwrap_or(self.entries.len());
        self.entries.insert(at, TimerEntry { deadline, ticket });
    }

    pub(crate) fn disarm(&mut self, ticket: WaitTicket) {
        self.entries.retain(|e| e.ticket != ticket);
    }

    pub(crate) fn next_deadline(&self) -> Option<SysTime> {
        self.entries.first().map(|e| e.deadline)
    }

    /// Removes and returns every ticket whose deadline is at or before `now`.
    pub(crate) fn expire(&mut self, now: SysTime) -> Vec<WaitTicket> {
        let due = self
            .entries
            .iter()
            .position(|e| e.deadline > now)
            .unwrap_or(self.entries.len());
        self.entries.drain(..due).map(|e| e.ticket).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ThreadId;

    fn ticket(thread: u8, seq: u64) -> WaitTicket {
        WaitTicket {
            thread: ThreadId(thread),
            seq,
        }
    }

    #[test]
    fn immediate_timeouts() {
        assert!(Timeout::Immediate.is_immediate());
        assert!(Timeout::Ticks(0).is_immediate());
        assert!(!Timeout::Ticks(1).is_immediate());
        assert!(!Timeout::Infinite.is_immediate());
        assert_eq!(Timeout::Ticks(5).deadline(10), Some(15));
        assert_eq!(Timeout::Infinite.deadline(10), None);
    }

    #[test]
    fn timers_expire_in_deadline_order() {
        let mut timers = TimerList::default();
        timers.arm(30, ticket(2, 1));
        timers.arm(10, ticket(3, 2));
        timers.arm(20, ticket(4, 3));
        timers.arm(10, ticket(5, 4));

        assert_eq!(timers.next_deadline(), Some(10));
        let due: Vec<u8> = timers.expire(20).iter().map(|t| t.thread().0).collect();
        assert_eq!(due, vec![3, 5, 4]);
        assert_eq!(timers.next_deadline(), Some(30));
    }

    #[test]
    fn disarmed_timer_never_fires() {
        let mut timers = TimerList::default();
        timers.arm(5, ticket(2, 7));
        timers.disarm(ticket(2, 7));
        assert_eq!(timers.next_deadline(), None);
        assert!(timers.expire(100).is_empty());
    }
}
