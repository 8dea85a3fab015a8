//! Interrupt masking and the kernel lock.
//!
//! Thread code takes the kernel lock with [`Port::lock`], which masks every
//! interrupt source. Interrupt handlers run through [`Port::isr`] and take the
//! ISR variant, [`Port::lock_from_isr`], which leaves the tick source alone:
//! interrupt entry already masks it and masking it twice would keep it from
//! re-arming.
//!
//! The lock is not an OS mutex. Ownership passes from one kernel thread to the
//! next across a context switch, so it is modelled as state plus a condition
//! variable that ISRs and host threads wait on.

use std::time::{Duration, Instant};

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex};

use crate::{role, set_role, Port, Role};

bitflags! {
    /// Interrupt sources known to the simulated CPU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IrqSources: u32 {
        /// Periodic system tick that drives timeouts and preemption.
        const TICK = 1 << 0;
        /// Serial device interrupt.
        const SERIAL = 1 << 1;
        /// Any other simulated peripheral.
        const EXTERNAL = 1 << 2;
    }
}

/// Kernel lock status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqStatus {
    Unlocked,
    Locked,
}

impl IrqStatus {
    pub fn is_locked(self) -> bool {
        matches!(self, Self::Locked)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Thread,
    Isr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GlobalMask {
    Enabled,
    Suspended,
    Disabled,
}

struct IrqState {
    owner: Option<Owner>,
    masked: IrqSources,
    global: GlobalMask,
    isr_active: bool,
    serviced: u64,
}

pub(crate) struct IrqController {
    state: Mutex<IrqState>,
    cond: Condvar,
}

impl IrqController {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(IrqState {
                owner: None,
                masked: IrqSources::empty(),
                global: GlobalMask::Disabled,
                isr_active: false,
                serviced: 0,
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn wake_all(&self) {
        let _state = self.state.lock();
        self.cond.notify_all();
    }
}

impl Port {
    /// Enters the kernel critical section from thread code.
    ///
    /// Halts if the lock is already held by thread code, if called from an
    /// interrupt handler or from an OS thread that is not a kernel thread.
    /// Waits while an interrupt handler is executing.
    pub fn lock(&self) {
        match role() {
            Role::Isr => self.halt("lock() called from ISR context"),
            Role::Host => self.halt("kernel lock taken outside a kernel thread"),
            Role::Boot | Role::Fiber => {}
        }
        let mut st = self.irq.state.lock();
        loop {
            if self.is_stopped() {
                drop(st);
                self.bail();
            }
            if st.owner == Some(Owner::Thread) {
                drop(st);
                self.halt("kernel lock re-entered");
            }
            if st.owner.is_none() && !st.isr_active {
                break;
            }
            self.irq.cond.wait(&mut st);
        }
        st.owner = Some(Owner::Thread);
        st.masked = IrqSources::all();
    }

    /// Leaves the kernel critical section from thread code.
    pub fn unlock(&self) {
        if self.is_stopped() {
            return;
        }
        if role() == Role::Host {
            self.halt("kernel lock released outside a kernel thread");
        }
        let mut st = self.irq.state.lock();
        if st.owner != Some(Owner::Thread) || self.is_isr_context() {
            drop(st);
            self.halt("unlock() without a matching lock()");
        }
        st.owner = None;
        st.masked = IrqSources::empty();
        self.irq.cond.notify_all();
    }

    /// Enters the kernel critical section from an interrupt handler.
    pub fn lock_from_isr(&self) {
        if !self.is_isr_context() {
            self.halt("lock_from_isr() outside ISR context");
        }
        let mut st = self.irq.state.lock();
        loop {
            if self.is_stopped() {
                drop(st);
                self.bail();
            }
            match st.owner {
                None => break,
                Some(Owner::Isr) => {
                    drop(st);
                    self.halt("ISR lock re-entered");
                }
                Some(Owner::Thread) => self.irq.cond.wait(&mut st),
            }
        }
        st.owner = Some(Owner::Isr);
        st.masked = IrqSources::all() - IrqSources::TICK;
    }

    /// Leaves the kernel critical section from an interrupt handler.
    pub fn unlock_from_isr(&self) {
        if self.is_stopped() {
            return;
        }
        let mut st = self.irq.state.lock();
        if st.owner != Some(Owner::Isr) {
            drop(st);
            self.halt("unlock_from_isr() without a matching lock_from_isr()");
        }
        st.owner = None;
        st.masked = IrqSources::empty();
        self.irq.cond.notify_all();
    }

    /// Globally disables interrupts. Used during initialization and halting.
    pub fn disable(&self) {
        self.irq.state.lock().global = GlobalMask::Disabled;
    }

    /// Globally masks maskable interrupts.
    pub fn suspend(&self) {
        self.irq.state.lock().global = GlobalMask::Suspended;
    }

    /// Globally re-enables interrupts.
    pub fn enable(&self) {
        let mut st = self.irq.state.lock();
        st.global = GlobalMask::Enabled;
        self.irq.cond.notify_all();
    }

    /// Returns true while the calling code runs inside an interrupt handler.
    pub fn is_isr_context(&self) -> bool {
        role() == Role::Isr
    }

    pub fn irq_status(&self) -> IrqStatus {
        match self.irq.state.lock().owner {
            Some(_) => IrqStatus::Locked,
            None => IrqStatus::Unlocked,
        }
    }

    /// Returns true if thread code currently owns the kernel lock.
    pub fn is_thread_locked(&self) -> bool {
        self.irq.state.lock().owner == Some(Owner::Thread)
    }

    /// Returns the sources currently masked by the kernel lock.
    pub fn masked_sources(&self) -> IrqSources {
        self.irq.state.lock().masked
    }

    /// Number of interrupts serviced so far.
    pub fn interrupt_count(&self) -> u64 {
        self.irq.state.lock().serviced
    }

    /// Dispatches an interrupt from `source` to `handler`.
    ///
    /// Waits until the source is unmasked and no other handler runs, marks
    /// the calling OS thread as ISR context for the duration of `handler` and
    /// wakes anything waiting for an interrupt afterwards.
    pub fn isr<R>(&self, source: IrqSources, handler: impl FnOnce() -> R) -> R {
        {
            let mut st = self.irq.state.lock();
            loop {
                if self.is_stopped() {
                    drop(st);
                    self.bail();
                }
                if !st.isr_active
                    && st.global == GlobalMask::Enabled
                    && !st.masked.intersects(source)
                {
                    break;
                }
                self.irq.cond.wait(&mut st);
            }
            st.isr_active = true;
        }
        let _frame = IsrFrame {
            port: self,
            previous: set_role(Role::Isr),
        };
        handler()
    }

    /// Parks the calling thread until an interrupt newer than `since` has
    /// been serviced or `timeout` elapses.
    pub fn wait_for_interrupt(&self, since: u64, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut st = self.irq.state.lock();
        while st.serviced == since && !self.is_stopped() {
            if self.irq.cond.wait_until(&mut st, deadline).timed_out() {
                break;
            }
        }
    }
}

/// Interrupt epilogue, run even if the handler unwinds.
struct IsrFrame<'a> {
    port: &'a Port,
    previous: Role,
}

impl Drop for IsrFrame<'_> {
    fn drop(&mut self) {
        set_role(self.previous);
        let mut st = self.port.irq.state.lock();
        if st.owner == Some(Owner::Isr) {
            st.owner = None;
            st.masked = IrqSources::empty();
        }
        st.isr_active = false;
        st.serviced += 1;
        self.port.irq.cond.notify_all();
    }
}
