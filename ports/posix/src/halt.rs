//! Fatal halt and orderly shutdown.
//!
//! A halt is final. The first reason is recorded and reported once through
//! the log and the optional [`HaltHook`]. Interrupts are disabled and every
//! context is stopped. Kernel threads unwind quietly back into their
//! trampolines. The boot thread, and any host thread that trips over a halted
//! port, carries on as a Rust panic with the message `system halted: <reason>`.

use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info};
use parking_lot::Mutex;

use crate::{role, Port, Role};

/// Callback invoked once, with the diagnostic reason, on the first halt.
pub type HaltHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Unwind payload that retires kernel threads after a halt or shutdown.
#[derive(Debug)]
pub(crate) struct Retired;

pub(crate) struct HaltState {
    reason: Mutex<Option<String>>,
    stopped: AtomicBool,
    hook: Option<HaltHook>,
}

impl HaltState {
    pub(crate) fn new(hook: Option<HaltHook>) -> Self {
        Self {
            reason: Mutex::new(None),
            stopped: AtomicBool::new(false),
            hook,
        }
    }
}

impl Port {
    /// Halts the system. Never returns.
    pub fn halt(&self, reason: &str) -> ! {
        self.enter_halt(reason);
        self.bail()
    }

    /// Records the halt and stops every context without unwinding the caller.
    pub(crate) fn enter_halt(&self, reason: &str) {
        let first = {
            let mut slot = self.halt.reason.lock();
            if slot.is_none() {
                *slot = Some(reason.to_owned());
                true
            } else {
                false
            }
        };

        if first {
            error!("system halted: {reason}");
            if let Some(hook) = &self.halt.hook {
                hook(reason);
            }
        } else {
            debug!("halt after halt ignored: {reason}");
        }

        self.disable();
        self.stop_all();
    }

    /// The reason given to the first halt, if any.
    pub fn halt_reason(&self) -> Option<String> {
        self.halt.reason.lock().clone()
    }

    pub fn is_halted(&self) -> bool {
        self.halt.reason.lock().is_some()
    }

    /// Returns true once the port has been halted or shut down.
    pub fn is_stopped(&self) -> bool {
        self.halt.stopped.load(Ordering::Acquire)
    }

    /// Stops every context without recording a halt.
    ///
    /// Parked kernel threads unwind and their OS threads finish. Used when the
    /// owning kernel is dropped.
    pub fn shutdown(&self) {
        if self.is_stopped() {
            return;
        }
        info!("port shutting down");
        self.suspend();
        self.stop_all();
    }

    fn stop_all(&self) {
        self.halt.stopped.store(true, Ordering::Release);
        for context in self.contexts.lock().iter() {
            context.stop();
        }
        self.irq.wake_all();
    }

    /// Leaves the current call stack after the port stopped.
    pub(crate) fn bail(&self) -> ! {
        match role() {
            Role::Fiber | Role::Isr => panic::resume_unwind(Box::new(Retired)),
            Role::Boot | Role::Host => {
                let reason = self
                    .halt_reason()
                    .unwrap_or_else(|| "port shut down".to_owned());
                panic!("system halted: {reason}");
            }
        }
    }
}
