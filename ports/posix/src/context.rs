//! Execution contexts and the context switch.
//!
//! Every kernel thread runs on its own OS thread whose stack is sized from the
//! thread's [`StackRegion`] plus [`INT_REQUIRED_STACK`] of headroom. A context
//! only makes progress while it holds its baton. [`Port::switch`] hands the
//! baton to the next context and parks the caller until somebody switches
//! back into it, so from the caller's point of view a switch is a blocking
//! call that returns once the thread is rescheduled.
//!
//! New contexts start in the trampoline. It waits for the first switch,
//! records the stack bounds, releases the kernel lock handed over by the
//! switching thread and then runs the thread's entry and exit functions.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{error, trace};
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};

use crate::halt::Retired;
use crate::{set_role, Port, Role};

/// Smallest stack region accepted by [`Port::setup_context`].
pub const MIN_STACK_SIZE: usize = 4 * 1024;

/// Headroom below every region for host runtime and unwinding frames.
pub const INT_REQUIRED_STACK: usize = 256 * 1024;

/// Memory region assigned to a thread's stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRegion {
    size: usize,
}

impl StackRegion {
    pub const fn new(size: usize) -> Self {
        Self { size }
    }

    pub const fn size(&self) -> usize {
        self.size
    }
}

/// Address range a thread's stack pointer must stay inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    base: usize,
    top: usize,
}

impl StackBounds {
    /// Bounds of a downward-growing stack of `size` bytes starting at `top`.
    pub fn below(top: usize, size: usize) -> Self {
        Self {
            base: top.saturating_sub(size),
            top,
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn top(&self) -> usize {
        self.top
    }

    /// Whether `sp` lies in the half-open region `[base, top)`.
    pub fn contains(&self, sp: usize) -> bool {
        (self.base..self.top).contains(&sp)
    }
}

/// Approximate stack pointer of the caller.
#[inline(never)]
pub fn stack_pointer() -> usize {
    let marker = 0u8;
    std::hint::black_box(&marker) as *const u8 as usize
}

/// What a new context runs: the thread body, then the kernel's exit path.
pub struct ThreadEntry {
    run: Box<dyn FnOnce() + Send>,
    exit: Box<dyn FnOnce() + Send>,
}

impl ThreadEntry {
    pub fn new<R, E>(run: R, exit: E) -> Self
    where
        R: FnOnce() + Send + 'static,
        E: FnOnce() + Send + 'static,
    {
        Self {
            run: Box::new(run),
            exit: Box::new(exit),
        }
    }
}

#[derive(Default)]
struct BatonState {
    resumed: bool,
    stopped: bool,
}

/// Stop signal observed while parked.
struct Stopped;

/// Saved execution state of a thread.
///
/// The OS thread behind it holds the registers and the stack. The baton
/// decides whether it may run.
pub struct ExecutionContext {
    name: String,
    region: Option<StackRegion>,
    bounds: OnceCell<StackBounds>,
    started: AtomicBool,
    baton: Mutex<BatonState>,
    cond: Condvar,
    os_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutionContext {
    fn new(name: &str, region: Option<StackRegion>) -> Self {
        Self {
            name: name.to_owned(),
            region,
            bounds: OnceCell::new(),
            started: AtomicBool::new(false),
            baton: Mutex::new(BatonState::default()),
            cond: Condvar::new(),
            os_thread: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The stack region, `None` for the boot context.
    pub fn region(&self) -> Option<StackRegion> {
        self.region
    }

    /// Stack bounds, known once the context has run.
    pub fn bounds(&self) -> Option<StackBounds> {
        self.bounds.get().copied()
    }

    /// Returns false until the context has been switched into for the first time.
    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    fn resume(&self) {
        let mut baton = self.baton.lock();
        baton.resumed = true;
        self.cond.notify_one();
    }

    fn park(&self) -> Result<(), Stopped> {
        let mut baton = self.baton.lock();
        loop {
            if baton.stopped {
                return Err(Stopped);
            }
            if baton.resumed {
                baton.resumed = false;
                return Ok(());
            }
            self.cond.wait(&mut baton);
        }
    }

    pub(crate) fn stop(&self) {
        let mut baton = self.baton.lock();
        baton.stopped = true;
        self.cond.notify_all();
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("name", &self.name)
            .field("region", &self.region)
            .field("bounds", &self.bounds())
            .field("started", &self.has_started())
            .finish()
    }
}

impl Port {
    /// Adopts the calling OS thread as the bootstrap context.
    pub fn boot_context(&self, name: &str) -> Arc<ExecutionContext> {
        set_role(Role::Boot);
        let context = Arc::new(ExecutionContext::new(name, None));
        context.started.store(true, Ordering::Release);
        self.contexts.lock().push(Arc::clone(&context));
        context
    }

    /// Builds a context that enters the trampoline with `entry` on its first switch.
    ///
    /// Halts if the region is too small or the host refuses to create the thread.
    pub fn setup_context(
        self: &Arc<Self>,
        name: &str,
        region: StackRegion,
        entry: ThreadEntry,
    ) -> Arc<ExecutionContext> {
        if region.size() < MIN_STACK_SIZE {
            error!(
                "stack region of {} bytes for '{name}' is below the {MIN_STACK_SIZE} byte minimum",
                region.size()
            );
            self.halt("invalid stack region");
        }

        if self.is_stopped() {
            self.bail();
        }
        self.reap_retired();

        let context = Arc::new(ExecutionContext::new(name, Some(region)));
        self.contexts.lock().push(Arc::clone(&context));
        let port = Arc::clone(self);
        let fiber = Arc::clone(&context);
        let spawned = thread::Builder::new()
            .name(name.to_owned())
            .stack_size(region.size() + self.config.int_required_stack)
            .spawn(move || trampoline(port, fiber, entry));

        match spawned {
            Ok(handle) => *context.os_thread.lock() = Some(handle),
            Err(err) => {
                error!("cannot create context '{name}': {err}");
                self.halt("failed to create thread context");
            }
        }

        trace!("context '{name}' set up with {} byte stack", region.size());
        context
    }

    /// Transfers the CPU from `prev` to `next`.
    ///
    /// Must be called by `prev` with the kernel lock held. Returns when some
    /// other context switches back into `prev`, again with the lock held.
    pub fn switch(&self, next: &ExecutionContext, prev: &ExecutionContext) {
        if std::ptr::eq(next, prev) {
            return;
        }
        self.check_outgoing(prev);
        trace!("switch '{}' -> '{}'", prev.name, next.name);
        next.resume();
        if prev.park().is_err() {
            self.bail();
        }
    }

    /// Terminal switch out of a finished thread; `prev` is never resumed.
    ///
    /// `prev` is dropped from the port's contexts and its OS thread is joined
    /// by a later [`Port::setup_context`] or by [`Port::join_contexts`].
    pub fn exit_switch(&self, next: &ExecutionContext, prev: &ExecutionContext) {
        self.check_outgoing(prev);
        self.retire(prev);
        trace!("exit '{}' -> '{}'", prev.name, next.name);
        next.resume();
    }

    fn retire(&self, context: &ExecutionContext) {
        self.contexts
            .lock()
            .retain(|registered| !std::ptr::eq(registered.as_ref(), context));
        if let Some(handle) = context.os_thread.lock().take() {
            self.retired.lock().push(handle);
        }
    }

    /// Joins the OS threads of exited contexts that have finished unwinding.
    fn reap_retired(&self) {
        let finished: Vec<JoinHandle<()>> = {
            let mut retired = self.retired.lock();
            let (finished, running) = retired.drain(..).partition(|h| h.is_finished());
            *retired = running;
            finished
        };
        for handle in finished {
            let _ = handle.join();
        }
    }

    fn check_outgoing(&self, prev: &ExecutionContext) {
        if !self.is_thread_locked() {
            self.halt("context switch without the kernel lock held");
        }
        if !self.config.stack_check {
            return;
        }
        if let Some(bounds) = prev.bounds() {
            let sp = stack_pointer();
            if !bounds.contains(sp) {
                error!(
                    "stack overflow in '{}': sp {sp:#x} outside {:#x}..={:#x}",
                    prev.name,
                    bounds.base(),
                    bounds.top()
                );
                self.halt("stack overflow");
            }
        }
    }

    /// Waits for the OS threads of every context except the caller's to finish.
    ///
    /// Only meaningful after [`Port::shutdown`] or a halt.
    pub fn join_contexts(&self) {
        let mut handles: Vec<JoinHandle<()>> = self
            .contexts
            .lock()
            .iter()
            .filter_map(|context| context.os_thread.lock().take())
            .collect();
        handles.append(&mut self.retired.lock());
        let me = thread::current().id();
        for handle in handles {
            if handle.thread().id() != me {
                let _ = handle.join();
            }
        }
    }
}

fn trampoline(port: Arc<Port>, context: Arc<ExecutionContext>, entry: ThreadEntry) {
    set_role(Role::Fiber);
    let ThreadEntry { run, exit } = entry;
    let region = context.region.map_or(0, |r| r.size());

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        if context.park().is_err() {
            panic::resume_unwind(Box::new(Retired));
        }
        let _ = context
            .bounds
            .set(StackBounds::below(stack_pointer(), region));
        context.started.store(true, Ordering::Release);
        port.unlock();
        run();
        exit();
    }));

    if let Err(payload) = outcome {
        if payload.is::<Retired>() {
            trace!("context '{}' retired", context.name);
            return;
        }
        let message = panic_message(payload.as_ref());
        port.enter_halt(&format!("thread '{}' panicked: {message}", context.name));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
