//! Hosted port of the kernel's concurrency core.
//!
//! On bare-metal targets a port swaps register files and stack pointers. On a
//! hosted target this crate gives every kernel thread a dedicated OS thread and
//! passes a baton between them, so exactly one execution context makes
//! progress at any time and a switch looks like an ordinary blocking call to
//! the thread that performs it.
//!
//! ## Module Overview
//!
//! - [`irq`]: interrupt masking, the kernel lock and ISR dispatch
//! - [`context`]: execution contexts, the context switch and the startup trampoline
//! - [`halt`]: the fatal halt path and orderly shutdown
//! - [`ticker`]: periodic tick interrupt source
//!
//! All state lives in a [`Port`] value. A kernel instance owns one port and
//! the simulation treats it as a single CPU.

use std::cell::Cell;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

pub mod context;
pub mod halt;
pub mod irq;
pub mod ticker;

pub use context::{
    stack_pointer, ExecutionContext, StackBounds, StackRegion, ThreadEntry, INT_REQUIRED_STACK,
    MIN_STACK_SIZE,
};
pub use halt::HaltHook;
pub use irq::{IrqSources, IrqStatus};
pub use ticker::Ticker;

/// Static configuration of the hosted port.
#[derive(Debug, Clone)]
pub struct PortConfig {
    /// Check the outgoing stack pointer on every context switch.
    pub stack_check: bool,
    /// Extra OS stack reserved below each thread's region for host runtime frames.
    pub int_required_stack: usize,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            stack_check: true,
            int_required_stack: INT_REQUIRED_STACK,
        }
    }
}

/// What the calling OS thread is doing on behalf of the port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// Not known to any port.
    Host,
    /// The thread that booted the kernel and became its main thread.
    Boot,
    /// An OS thread backing a kernel thread context.
    Fiber,
    /// Executing an interrupt handler.
    Isr,
}

thread_local! {
    static ROLE: Cell<Role> = const { Cell::new(Role::Host) };
}

pub(crate) fn role() -> Role {
    ROLE.with(Cell::get)
}

/// Sets the role of the calling OS thread and returns the previous one.
pub(crate) fn set_role(role: Role) -> Role {
    ROLE.with(|r| r.replace(role))
}

/// The simulated CPU: interrupt state, halt state and the registered contexts.
pub struct Port {
    config: PortConfig,
    irq: irq::IrqController,
    halt: halt::HaltState,
    contexts: Mutex<Vec<Arc<ExecutionContext>>>,
    /// OS threads of exited contexts that have not been joined yet.
    retired: Mutex<Vec<JoinHandle<()>>>,
}

impl Port {
    /// Creates a port with interrupts globally disabled.
    ///
    /// The owner calls [`Port::enable`] once initialization is complete.
    pub fn new(config: PortConfig) -> Arc<Self> {
        Self::with_halt_hook(config, None)
    }

    /// Creates a port that invokes `hook` on the first fatal halt.
    pub fn with_halt_hook(config: PortConfig, hook: Option<HaltHook>) -> Arc<Self> {
        Arc::new(Self {
            config,
            irq: irq::IrqController::new(),
            halt: halt::HaltState::new(hook),
            contexts: Mutex::new(Vec::new()),
            retired: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &PortConfig {
        &self.config
    }

    /// Number of contexts that have not exited, the boot context included.
    pub fn context_count(&self) -> usize {
        self.contexts.lock().len()
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("config", &self.config)
            .field("status", &self.irq_status())
            .field("halted", &self.is_halted())
            .field("contexts", &self.contexts.lock().len())
            .finish()
    }
}
