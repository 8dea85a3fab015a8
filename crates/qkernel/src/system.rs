//! Kernel instance, the scheduler's wait/ready primitives and the system lock.
//!
//! ## Module Overview
//!
//! - [`Kernel`] owns a running instance. The OS thread that starts it becomes
//!   the kernel's main thread; dropping it shuts every thread down.
//! - [`System`] is a cheap, clonable handle used by threads and drivers.
//! - [`SysLock`] is the scoped kernel lock. Functions suffixed `_s` or `_i`
//!   take a `&SysLock` as proof that the lock is held (`_i` ones may also be
//!   called from an interrupt handler).
//!
//! Preemption requested while the lock is held, by making a more urgent
//! thread ready or by a tick expiring the running thread's quantum, is carried
//! out when the running thread releases the lock.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, trace};
use parking_lot::{Mutex, MutexGuard};
use qport_posix::{
    ticker, ExecutionContext, HaltHook, IrqSources, Port, StackRegion, ThreadEntry, Ticker,
};

use crate::config::{ClockMode, KernelConfig};
use crate::error::KernelError;
use crate::scheduler::{ReadyList, WaitList, WaitTicket, WakeCode};
use crate::thread::{
    ThreadConfig, ThreadHandler, ThreadId, ThreadInfo, ThreadPriority, ThreadSlot, ThreadState,
};
use crate::time::{SysTime, Timeout, TimerList};

type Switch = (Arc<ExecutionContext>, Arc<ExecutionContext>);

/// How long an idle kernel on the virtual clock waits between checks for
/// attached devices.
const DEVICE_POLL: Duration = Duration::from_millis(1);

struct SchedState {
    threads: Vec<ThreadSlot>,
    ready: ReadyList,
    timers: TimerList,
    current: ThreadId,
    systime: SysTime,
    /// Set when the running thread may have to give up the CPU.
    preempt: bool,
    next_seq: u64,
}

impl SchedState {
    fn slot(&self, id: ThreadId) -> &ThreadSlot {
        &self.threads[id.index()]
    }

    fn slot_mut(&mut self, id: ThreadId) -> &mut ThreadSlot {
        &mut self.threads[id.index()]
    }

    fn current_slot(&self) -> &ThreadSlot {
        self.slot(self.current)
    }

    fn current_slot_mut(&mut self) -> &mut ThreadSlot {
        let current = self.current;
        self.slot_mut(current)
    }

    fn new_ticket(&mut self) -> WaitTicket {
        let ticket = WaitTicket {
            thread: self.current,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        ticket
    }

    /// Moves the owner of `ticket` to the ready list if that wait is still in progress.
    fn ready_waiter(&mut self, ticket: WaitTicket, code: WakeCode) -> bool {
        let current_priority = self.current_slot().priority;
        let slot = self.slot_mut(ticket.thread);
        if slot.state != ThreadState::Blocked || slot.ticket != Some(ticket) {
            return false;
        }
        slot.ticket = None;
        slot.wake = code;
        slot.state = ThreadState::Ready;
        let priority = slot.priority;

        self.timers.disarm(ticket);
        self.ready.insert_behind(ticket.thread, priority);
        if priority > current_priority {
            self.preempt = true;
        }
        trace!("thread {} ready ({code:?})", ticket.thread);
        true
    }

    /// Advances system time to `now`, timing out every expired wait.
    fn advance_to(&mut self, now: SysTime) {
        self.systime = now;
        for ticket in self.timers.expire(now) {
            self.ready_waiter(ticket, WakeCode::Timeout);
        }
    }

    /// Makes the head of the ready list the running thread.
    fn dispatch_next(&mut self, quantum: u32) -> Option<Arc<ExecutionContext>> {
        let next = self.ready.pop_highest()?;
        self.current = next;
        let slot = self.slot_mut(next);
        slot.state = ThreadState::Running;
        slot.quantum = quantum;
        Some(Arc::clone(&slot.context))
    }

    /// Whether the head of the ready list should displace the running thread.
    fn preemption_due(&self, rotate: bool) -> bool {
        match self.ready.highest_priority() {
            None => false,
            Some(top) => {
                let priority = self.current_slot().priority;
                top > priority || (rotate && top == priority)
            }
        }
    }

    /// Puts the running thread back on the ready list and dispatches the head.
    fn preempt_current(&mut self, ahead: bool, quantum: u32) -> Option<Switch> {
        let me = self.current;
        let slot = self.slot_mut(me);
        slot.state = ThreadState::Ready;
        let priority = slot.priority;
        let prev = Arc::clone(&slot.context);
        if ahead {
            self.ready.insert_ahead(me, priority);
        } else {
            self.ready.insert_behind(me, priority);
        }
        self.dispatch_next(quantum).map(|next| (next, prev))
    }
}

struct Shared {
    config: KernelConfig,
    port: Arc<Port>,
    sched: Mutex<SchedState>,
    devices: AtomicUsize,
}

/// Handle to a running kernel.
#[derive(Clone)]
pub struct System {
    shared: Arc<Shared>,
}

/// Scoped kernel lock. Dropping it releases the lock.
#[must_use = "the kernel lock is released as soon as the guard is dropped"]
pub struct SysLock<'a> {
    system: &'a System,
    from_isr: bool,
    _not_send: PhantomData<*const ()>,
}

impl SysLock<'_> {
    pub fn is_from_isr(&self) -> bool {
        self.from_isr
    }

    pub fn system(&self) -> &System {
        self.system
    }
}

impl Drop for SysLock<'_> {
    fn drop(&mut self) {
        if self.from_isr {
            self.system.port().unlock_from_isr();
        } else {
            self.system.unlock_thread();
        }
    }
}

enum IdleStep {
    Run,
    Wait(u64),
    Deadlock,
}

impl System {
    pub fn port(&self) -> &Arc<Port> {
        &self.shared.port
    }

    pub fn config(&self) -> &KernelConfig {
        &self.shared.config
    }

    fn sched(&self) -> MutexGuard<'_, SchedState> {
        self.shared.sched.lock()
    }

    fn quantum(&self) -> u32 {
        self.shared.config.time_quantum
    }

    /// Returns true if both handles refer to the same kernel.
    pub fn same_kernel(&self, other: &System) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Takes the kernel lock from thread code.
    ///
    /// Only kernel threads may call this. From any other OS thread the port
    /// halts with "kernel lock taken outside a kernel thread"; such threads
    /// reach the kernel through [`System::serve_irq`].
    pub fn lock(&self) -> SysLock<'_> {
        self.port().lock();
        SysLock {
            system: self,
            from_isr: false,
            _not_send: PhantomData,
        }
    }

    /// Takes the kernel lock from an interrupt handler.
    pub fn lock_from_isr(&self) -> SysLock<'_> {
        self.port().lock_from_isr();
        SysLock {
            system: self,
            from_isr: true,
            _not_send: PhantomData,
        }
    }

    fn unlock_thread(&self) {
        let port = self.port();
        if port.is_stopped() {
            return;
        }
        if !std::thread::panicking() {
            self.reschedule_pending();
        }
        port.unlock();
    }

    /// Carries out preemption requested while the lock was held.
    fn reschedule_pending(&self) {
        loop {
            let switch = {
                let mut st = self.sched();
                if !std::mem::take(&mut st.preempt) {
                    return;
                }
                let rotate = self.quantum() > 0 && st.current_slot().quantum == 0;
                if st.preemption_due(rotate) {
                    st.preempt_current(!rotate, self.quantum())
                } else {
                    None
                }
            };
            if let Some((next, prev)) = switch {
                self.port().switch(&next, &prev);
            }
        }
    }

    pub fn is_isr_context(&self) -> bool {
        self.port().is_isr_context()
    }

    pub fn current_thread(&self) -> ThreadId {
        self.sched().current
    }

    /// System time in ticks.
    pub fn now(&self) -> SysTime {
        self.sched().systime
    }

    pub fn thread_info(&self, id: ThreadId) -> Option<ThreadInfo> {
        let st = self.sched();
        st.threads.get(id.index()).map(|slot| slot.info(id))
    }

    /// Number of threads that have not terminated, main and idle included.
    pub fn thread_count(&self) -> usize {
        self.sched()
            .threads
            .iter()
            .filter(|slot| slot.state != ThreadState::Terminated)
            .count()
    }

    /// Halts the system. Never returns.
    pub fn halt(&self, reason: &str) -> ! {
        self.port().halt(reason)
    }

    /// Creates a thread running `entry`.
    ///
    /// A thread more urgent than the caller starts running before this returns.
    /// The id of a terminated thread is handed out again, so only live threads
    /// count against [`KernelConfig::max_threads`].
    pub fn spawn<F>(&self, config: ThreadConfig, entry: F) -> Result<ThreadId, KernelError>
    where
        F: FnOnce() + Send + 'static,
    {
        let priority = config.priority;
        if priority == ThreadPriority::IDLE || priority > ThreadPriority::HIGHEST {
            return Err(KernelError::InvalidPriority { priority });
        }
        let stack_size = config
            .stack_size
            .unwrap_or(self.shared.config.default_stack_size);
        self.create_thread(config.name, priority, stack_size, Box::new(entry))
    }

    fn create_thread(
        &self,
        name: String,
        priority: ThreadPriority,
        stack_size: usize,
        handler: ThreadHandler,
    ) -> Result<ThreadId, KernelError> {
        if self.is_isr_context() {
            self.halt("thread creation from ISR context");
        }
        let lock = self.lock();

        let id = {
            let st = self.sched();
            let max = self
                .shared
                .config
                .max_threads
                .min(usize::from(u8::MAX) + 1);
            let free = st
                .threads
                .iter()
                .position(|slot| slot.state == ThreadState::Terminated);
            match free {
                Some(index) => ThreadId(index as u8),
                None if st.threads.len() < max => ThreadId(st.threads.len() as u8),
                None => return Err(KernelError::TooManyThreads { max }),
            }
        };

        let exiting = self.clone();
        let entry = ThreadEntry::new(handler, move || exiting.exit_current());
        let context = self
            .port()
            .setup_context(&name, StackRegion::new(stack_size), entry);

        {
            let mut st = self.sched();
            debug!("spawned thread {id} '{name}' at priority {}", priority.0);
            let slot = ThreadSlot::new(name, priority, ThreadState::Ready, context);
            match st.threads.get_mut(id.index()) {
                Some(recycled) => *recycled = slot,
                None => st.threads.push(slot),
            }
            st.ready.insert_behind(id, priority);
            if priority > st.current_slot().priority {
                st.preempt = true;
            }
        }

        drop(lock);
        Ok(id)
    }

    /// Exit path of a thread whose entry function returned.
    fn exit_current(&self) {
        let port = self.port();
        port.lock();

        let (me, prev, joiners) = {
            let mut st = self.sched();
            let me = st.current;
            let slot = st.current_slot_mut();
            slot.state = ThreadState::Terminated;
            (me, Arc::clone(&slot.context), Arc::clone(&slot.joiners))
        };
        debug!("thread {me} '{}' exited", prev.name());

        while let Some(ticket) = joiners.pop() {
            self.sched().ready_waiter(ticket, WakeCode::Success);
        }

        let next = self.sched().dispatch_next(self.quantum());
        match next {
            Some(next) => port.exit_switch(&next, &prev),
            None => self.halt("no thread left to run"),
        }
    }

    /// Blocks until thread `id` has terminated.
    ///
    /// Ids are recycled by [`System::spawn`] once their thread terminates, so
    /// join a thread before spawning its replacement.
    pub fn join(&self, id: ThreadId) {
        let lock = self.lock();
        let (current, target) = {
            let st = self.sched();
            let target = st
                .threads
                .get(id.index())
                .map(|slot| (slot.state, Arc::clone(&slot.joiners)));
            (st.current, target)
        };
        if id == current {
            self.halt("thread joined itself");
        }
        let joiners = match target {
            None => self.halt("join on unknown thread"),
            Some((ThreadState::Terminated, _)) => return,
            Some((_, joiners)) => joiners,
        };
        self.enqueue_and_sleep_s(&lock, &joiners, Timeout::Infinite);
    }

    /// Enqueues the running thread on `list` and suspends it until woken or
    /// until `timeout` elapses.
    ///
    /// An immediate timeout returns [`WakeCode::Timeout`] without enqueueing.
    /// A thread whose wait times out leaves `list` before this returns.
    pub fn enqueue_and_sleep_s(
        &self,
        _lock: &SysLock<'_>,
        list: &WaitList,
        timeout: Timeout,
    ) -> WakeCode {
        if self.is_isr_context() {
            self.halt("blocking call from ISR context");
        }
        if timeout.is_immediate() {
            return WakeCode::Timeout;
        }
        let ticket = self.sched().new_ticket();
        list.push(ticket);
        let code = self.block_current(ticket, timeout);
        if code == WakeCode::Timeout {
            list.remove(ticket);
        }
        code
    }

    /// Suspends the running thread for `ticket` and returns its wake code.
    fn block_current(&self, ticket: WaitTicket, timeout: Timeout) -> WakeCode {
        if self.is_isr_context() {
            self.halt("blocking call from ISR context");
        }
        let (next, prev) = {
            let mut st = self.sched();
            if let Some(deadline) = timeout.deadline(st.systime) {
                st.timers.arm(deadline, ticket);
            }
            let slot = st.current_slot_mut();
            slot.state = ThreadState::Blocked;
            slot.ticket = Some(ticket);
            let prev = Arc::clone(&slot.context);
            (st.dispatch_next(self.quantum()), prev)
        };
        let Some(next) = next else {
            self.halt("no thread left to run");
        };
        self.port().switch(&next, &prev);
        self.sched().slot(ticket.thread).wake
    }

    /// Makes the owner of `ticket` ready with `code`.
    ///
    /// Returns false if that wait already ended.
    pub fn make_ready_s(&self, _lock: &SysLock<'_>, ticket: WaitTicket, code: WakeCode) -> bool {
        self.sched().ready_waiter(ticket, code)
    }

    /// Wakes the longest waiting thread on `list`.
    pub fn wake_one_s(&self, lock: &SysLock<'_>, list: &WaitList, code: WakeCode) -> bool {
        while let Some(ticket) = list.pop() {
            if self.make_ready_s(lock, ticket, code) {
                return true;
            }
        }
        false
    }

    /// Wakes every thread on `list` in FIFO order and returns how many woke.
    pub fn wake_all_s(&self, lock: &SysLock<'_>, list: &WaitList, code: WakeCode) -> usize {
        let mut woken = 0;
        while let Some(ticket) = list.pop() {
            if self.make_ready_s(lock, ticket, code) {
                woken += 1;
            }
        }
        woken
    }

    /// Gives the CPU to the next ready thread of equal or higher priority.
    pub fn yield_now(&self) {
        let _lock = self.lock();
        let switch = {
            let mut st = self.sched();
            if st.preemption_due(true) {
                st.preempt_current(false, self.quantum())
            } else {
                None
            }
        };
        if let Some((next, prev)) = switch {
            self.port().switch(&next, &prev);
        }
    }

    /// Suspends the running thread for `ticks` system ticks.
    pub fn sleep(&self, ticks: u32) {
        if ticks == 0 {
            return;
        }
        let _lock = self.lock();
        let ticket = self.sched().new_ticket();
        self.block_current(ticket, Timeout::Ticks(ticks));
    }

    /// System tick, called from the tick interrupt.
    pub fn tick_i(&self, _lock: &SysLock<'_>) {
        let quantum_enabled = self.quantum() > 0;
        let mut st = self.sched();
        let now = st.systime + 1;
        st.advance_to(now);

        if quantum_enabled && st.current != ThreadId::IDLE {
            let slot = st.current_slot_mut();
            slot.quantum = slot.quantum.saturating_sub(1);
        }
        let rotate = quantum_enabled && st.current_slot().quantum == 0;
        if st.preemption_due(rotate) {
            st.preempt = true;
        }
    }

    /// Runs `handler` as the interrupt service routine for `source`.
    ///
    /// Call from a host thread that simulates a peripheral. Preemption
    /// requested by the handler takes effect at the next lock release of the
    /// running thread.
    ///
    /// On the virtual clock a device that feeds threads blocked without a
    /// timeout must be registered with [`System::attach_device`], or the idle
    /// thread halts the kernel as deadlocked before the device gets a turn.
    pub fn serve_irq<R>(&self, source: IrqSources, handler: impl FnOnce(&System) -> R) -> R {
        self.port().isr(source, || handler(self))
    }

    /// Registers a host-side interrupt source.
    ///
    /// While a device is attached the idle thread waits for interrupts
    /// instead of treating "every thread blocked, no deadline" as a deadlock.
    pub fn attach_device(&self) -> AttachedDevice {
        let attached = self.shared.devices.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("device attached ({attached} total)");
        AttachedDevice {
            system: self.clone(),
        }
    }

    pub fn attached_devices(&self) -> usize {
        self.shared.devices.load(Ordering::SeqCst)
    }

    fn idle_step(&self, _lock: &SysLock<'_>) -> IdleStep {
        let mut st = self.sched();
        if !st.ready.is_empty() {
            st.preempt = true;
            return IdleStep::Run;
        }
        match self.shared.config.clock {
            ClockMode::Virtual => match st.timers.next_deadline() {
                Some(deadline) => {
                    let now = deadline.max(st.systime);
                    trace!("idle: time advances to {now}");
                    st.advance_to(now);
                    st.preempt = true;
                    IdleStep::Run
                }
                None if self.attached_devices() > 0 => {
                    IdleStep::Wait(self.port().interrupt_count())
                }
                None => IdleStep::Deadlock,
            },
            ClockMode::Periodic { .. } => IdleStep::Wait(self.port().interrupt_count()),
        }
    }
}

fn idle_loop(system: System) {
    let period = match system.config().clock {
        ClockMode::Periodic { tick_hz } => ticker::tick_period(tick_hz),
        ClockMode::Virtual => DEVICE_POLL,
    };
    loop {
        if let Some(callback) = system.config().idle_callback {
            callback();
        }
        let lock = system.lock();
        match system.idle_step(&lock) {
            IdleStep::Run => drop(lock),
            IdleStep::Wait(seen) => {
                drop(lock);
                system.port().wait_for_interrupt(seen, period);
            }
            IdleStep::Deadlock => system.halt("all threads are blocked with no pending timeout"),
        }
    }
}

/// A host thread acting as a peripheral, from [`System::attach_device`].
///
/// Detaches when dropped.
pub struct AttachedDevice {
    system: System,
}

impl AttachedDevice {
    pub fn system(&self) -> &System {
        &self.system
    }

    /// Same as [`System::serve_irq`].
    pub fn serve_irq<R>(&self, source: IrqSources, handler: impl FnOnce(&System) -> R) -> R {
        self.system.serve_irq(source, handler)
    }
}

impl Drop for AttachedDevice {
    fn drop(&mut self) {
        self.system.shared.devices.fetch_sub(1, Ordering::SeqCst);
        debug!("device detached");
    }
}

/// Builder that starts a kernel on the calling OS thread.
pub struct KernelBuilder {
    config: KernelConfig,
    halt_hook: Option<HaltHook>,
}

impl KernelBuilder {
    pub fn new(config: KernelConfig) -> Self {
        Self {
            config,
            halt_hook: None,
        }
    }

    /// Installs a hook that receives the reason of the first halt.
    pub fn with_halt_hook(mut self, hook: HaltHook) -> Self {
        self.halt_hook = Some(hook);
        self
    }

    /// Starts the kernel. The calling OS thread becomes its main thread.
    pub fn start(self) -> Kernel {
        let config = self.config;
        let port = Port::with_halt_hook(config.port_config(), self.halt_hook);
        let main = port.boot_context("main");

        let mut main_slot = ThreadSlot::new(
            "main".to_owned(),
            ThreadPriority::NORMAL,
            ThreadState::Running,
            main,
        );
        main_slot.quantum = config.time_quantum;

        let system = System {
            shared: Arc::new(Shared {
                config,
                port: Arc::clone(&port),
                sched: Mutex::new(SchedState {
                    threads: vec![main_slot],
                    ready: ReadyList::default(),
                    timers: TimerList::default(),
                    current: ThreadId::MAIN,
                    systime: 0,
                    preempt: false,
                    next_seq: 0,
                }),
                devices: AtomicUsize::new(0),
            }),
        };

        let idle = system.clone();
        let created = system.create_thread(
            "idle".to_owned(),
            ThreadPriority::IDLE,
            system.config().idle_stack_size,
            Box::new(move || idle_loop(idle)),
        );
        if let Err(err) = created {
            system.halt(&format!("cannot create idle thread: {err}"));
        }

        port.enable();

        let ticker = match system.config().clock {
            ClockMode::Periodic { tick_hz } => {
                let ticking = system.clone();
                let started = Ticker::start(Arc::clone(&port), tick_hz, move || {
                    let lock = ticking.lock_from_isr();
                    ticking.tick_i(&lock);
                });
                match started {
                    Ok(ticker) => Some(ticker),
                    Err(err) => {
                        error!("cannot start tick source: {err}");
                        system.halt("failed to start tick source");
                    }
                }
            }
            ClockMode::Virtual => None,
        };

        info!("kernel '{}' started", system.config().name);
        Kernel {
            system,
            ticker,
            _boot_thread: PhantomData,
        }
    }
}

/// A running kernel, owned by its main thread.
pub struct Kernel {
    system: System,
    ticker: Option<Ticker>,
    _boot_thread: PhantomData<*const ()>,
}

impl Kernel {
    pub fn builder() -> KernelBuilder {
        KernelBuilder::new(KernelConfig::default())
    }

    pub fn with_config(config: KernelConfig) -> KernelBuilder {
        KernelBuilder::new(config)
    }

    /// Starts a kernel with the default configuration.
    pub fn start() -> Kernel {
        Self::builder().start()
    }

    pub fn system(&self) -> &System {
        &self.system
    }

    pub fn config(&self) -> &KernelConfig {
        self.system.config()
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        let port = Arc::clone(self.system.port());
        port.shutdown();
        if let Some(mut ticker) = self.ticker.take() {
            ticker.stop();
        }
        port.join_contexts();
        info!("kernel '{}' stopped", self.system.config().name);
    }
}
