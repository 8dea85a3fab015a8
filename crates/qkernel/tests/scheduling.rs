//! Integration tests for priority scheduling, sleeping and halting.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use qkernel::{
    IrqSources, Kernel, KernelConfig, KernelError, SymmetricQueue, ThreadConfig, ThreadId,
    ThreadPriority, ThreadState, Timeout, WaitList,
};

fn above_main() -> ThreadPriority {
    ThreadPriority::NORMAL.above(1)
}

fn below_main() -> ThreadPriority {
    ThreadPriority::NORMAL.below(1)
}

type Trace = Arc<Mutex<Vec<String>>>;

fn trace() -> Trace {
    Arc::new(Mutex::new(Vec::new()))
}

fn push(trace: &Trace, entry: impl Into<String>) {
    trace.lock().push(entry.into());
}

#[test]
fn higher_priority_thread_runs_before_spawn_returns() {
    let kernel = Kernel::start();
    let sys = kernel.system().clone();
    let log = trace();

    let id = {
        let log = Arc::clone(&log);
        sys.spawn(ThreadConfig::new("high", above_main()), move || push(&log, "high"))
            .unwrap()
    };
    push(&log, "main");

    assert_eq!(*log.lock(), ["high", "main"]);
    let info = sys.thread_info(id).unwrap();
    assert_eq!(info.state, ThreadState::Terminated);
    assert!(info.started);
}

#[test]
fn lower_priority_thread_waits_for_main_to_block() {
    let kernel = Kernel::start();
    let sys = kernel.system().clone();
    let log = trace();

    let id = {
        let log = Arc::clone(&log);
        sys.spawn(ThreadConfig::new("low", below_main()), move || push(&log, "low"))
            .unwrap()
    };
    push(&log, "spawned");

    let info = sys.thread_info(id).unwrap();
    assert_eq!(info.name, "low");
    assert_eq!(info.state, ThreadState::Ready);
    assert!(!info.started);

    sys.join(id);
    assert_eq!(*log.lock(), ["spawned", "low"]);
    assert_eq!(sys.thread_info(id).unwrap().state, ThreadState::Terminated);
}

#[test]
fn yield_alternates_between_equal_priorities() {
    let kernel = Kernel::start();
    let sys = kernel.system().clone();
    let log = trace();

    let spawn = |name: &'static str| {
        let (sys, log) = (sys.clone(), Arc::clone(&log));
        sys.clone()
            .spawn(ThreadConfig::new(name, below_main()), move || {
                for round in 0..3 {
                    push(&log, format!("{name}{round}"));
                    sys.yield_now();
                }
            })
            .unwrap()
    };
    let a = spawn("a");
    let b = spawn("b");

    sys.join(a);
    sys.join(b);
    assert_eq!(*log.lock(), ["a0", "b0", "a1", "b1", "a2", "b2"]);
}

#[test]
fn yield_without_peers_keeps_running() {
    let kernel = Kernel::start();
    let sys = kernel.system();
    let current = sys.current_thread();
    sys.yield_now();
    assert_eq!(sys.current_thread(), current);
}

#[test]
fn sleepers_wake_in_deadline_order_on_virtual_clock() {
    let kernel = Kernel::start();
    let sys = kernel.system().clone();
    let woke = Arc::new(Mutex::new(Vec::new()));

    let ids: Vec<_> = [("slow", 30), ("fast", 10), ("mid", 20)]
        .into_iter()
        .map(|(name, ticks)| {
            let (sys, woke) = (sys.clone(), Arc::clone(&woke));
            sys.clone()
                .spawn(ThreadConfig::new(name, above_main()), move || {
                    sys.sleep(ticks);
                    woke.lock().push((name, sys.now()));
                })
                .unwrap()
        })
        .collect();

    for id in ids {
        sys.join(id);
    }
    assert_eq!(*woke.lock(), [("fast", 10), ("mid", 20), ("slow", 30)]);
    assert_eq!(sys.now(), 30);
}

#[test]
fn spawn_rejects_bad_priorities_and_thread_limit() {
    let kernel = Kernel::with_config(KernelConfig::builder().max_threads(3).build()).start();
    let sys = kernel.system();

    assert_eq!(
        sys.spawn(ThreadConfig::new("idle2", ThreadPriority::IDLE), || {}),
        Err(KernelError::InvalidPriority {
            priority: ThreadPriority::IDLE
        })
    );
    assert_eq!(
        sys.spawn(ThreadConfig::new("loud", ThreadPriority(200)), || {}),
        Err(KernelError::InvalidPriority {
            priority: ThreadPriority(200)
        })
    );

    let worker = sys
        .spawn(ThreadConfig::new("worker", below_main()), || {})
        .unwrap();
    assert_eq!(
        sys.spawn(ThreadConfig::new("extra", below_main()), || {}),
        Err(KernelError::TooManyThreads { max: 3 })
    );
    assert_eq!(sys.thread_count(), 3);
    sys.join(worker);
}

#[test]
fn terminated_thread_slots_are_reused() {
    let kernel = Kernel::with_config(KernelConfig::builder().max_threads(3).build()).start();
    let sys = kernel.system().clone();
    let runs = Arc::new(AtomicU32::new(0));

    for round in 0..10 {
        let runs = Arc::clone(&runs);
        let id = sys
            .spawn(ThreadConfig::new(format!("worker{round}"), below_main()), move || {
                runs.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(id, ThreadId(2));
        assert_eq!(sys.thread_count(), 3);
        sys.join(id);
        assert_eq!(sys.thread_count(), 2);
    }

    assert_eq!(runs.load(Ordering::SeqCst), 10);
    assert_eq!(sys.thread_info(ThreadId(2)).unwrap().name, "worker9");
    assert_eq!(sys.port().context_count(), 2, "main and idle only");
}

#[test]
fn host_thread_cannot_take_the_kernel_lock() {
    let kernel = Kernel::start();
    let sys = kernel.system().clone();
    let queue = Arc::new(SymmetricQueue::new(&sys, 4));

    let outcome = {
        let queue = Arc::clone(&queue);
        std::thread::spawn(move || queue.get(Timeout::Immediate)).join()
    };

    assert!(outcome.is_err());
    assert_eq!(
        sys.port().halt_reason().as_deref(),
        Some("kernel lock taken outside a kernel thread")
    );
}

#[test]
fn attached_device_feeds_blocked_reader_on_virtual_clock() {
    let kernel = Kernel::start();
    let sys = kernel.system().clone();
    let queue = Arc::new(SymmetricQueue::new(&sys, 4));

    let device = sys.attach_device();
    assert_eq!(sys.attached_devices(), 1);
    let feeder = {
        let queue = Arc::clone(&queue);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            device.serve_irq(IrqSources::EXTERNAL, |sys| {
                let lock = sys.lock_from_isr();
                queue.put_i(&lock, 0x42)
            })
        })
    };

    assert_eq!(queue.get(Timeout::Infinite), Ok(0x42));
    assert_eq!(sys.now(), 0);
    assert_eq!(feeder.join().unwrap(), Ok(()));
    assert_eq!(sys.attached_devices(), 0);
}

#[test]
#[should_panic(expected = "all threads are blocked with no pending timeout")]
fn waiting_forever_with_nothing_runnable_halts() {
    let kernel = Kernel::start();
    let sys = kernel.system();
    let never = WaitList::new();

    let lock = sys.lock();
    sys.enqueue_and_sleep_s(&lock, &never, Timeout::Infinite);
}

#[test]
#[should_panic(expected = "thread 'faulty' panicked: boom")]
fn panicking_thread_halts_the_system() {
    let kernel = Kernel::start();
    let _ = kernel
        .system()
        .spawn(ThreadConfig::new("faulty", above_main()), || panic!("boom"));
}

#[inline(never)]
fn burn_stack(depth: usize, at_bottom: &dyn Fn()) -> u8 {
    let mut frame = std::hint::black_box([0u8; 4096]);
    frame[depth % frame.len()] = depth as u8;
    let frame = std::hint::black_box(frame);
    if depth == 0 {
        at_bottom();
        frame[0]
    } else {
        burn_stack(depth - 1, at_bottom).wrapping_add(frame[depth % frame.len()])
    }
}

#[test]
fn stack_overflow_halts_at_next_switch() {
    let reasons = Arc::new(Mutex::new(Vec::new()));
    let kernel = {
        let reasons = Arc::clone(&reasons);
        Kernel::builder()
            .with_halt_hook(Arc::new(move |reason: &str| {
                reasons.lock().push(reason.to_owned());
            }))
            .start()
    };
    let sys = kernel.system().clone();
    let resumed = Arc::new(AtomicBool::new(false));

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let (inner, resumed) = (sys.clone(), Arc::clone(&resumed));
        let config = ThreadConfig::new("deep", above_main()).with_stack_size(16 * 1024);
        let _ = sys.spawn(config, move || {
            burn_stack(8, &|| {
                inner.sleep(1);
                resumed.store(true, Ordering::SeqCst);
            });
        });
    }));

    assert!(outcome.is_err());
    assert_eq!(reasons.lock().as_slice(), ["stack overflow".to_owned()]);
    assert_eq!(sys.port().halt_reason().as_deref(), Some("stack overflow"));
    assert!(!resumed.load(Ordering::SeqCst));
}

#[test]
fn periodic_clock_advances_with_wall_time() {
    let kernel = Kernel::with_config(KernelConfig::builder().periodic_clock(1000).build()).start();
    let sys = kernel.system();

    let started = Instant::now();
    sys.sleep(20);

    assert!(started.elapsed() >= Duration::from_millis(10));
    assert!(sys.now() >= 20);
}

#[test]
fn expired_quantum_rotates_equal_priorities() {
    let kernel = Kernel::with_config(KernelConfig::builder().time_quantum(2).build()).start();
    let sys = kernel.system().clone();
    let b_ran = Arc::new(AtomicBool::new(false));
    let ticks = Arc::new(AtomicU32::new(0));

    let spinner = {
        let (sys, b_ran) = (sys.clone(), Arc::clone(&b_ran));
        sys.clone()
            .spawn(ThreadConfig::new("spinner", below_main()), move || {
                while !b_ran.load(Ordering::SeqCst) {
                    drop(sys.lock());
                    std::thread::yield_now();
                }
            })
            .unwrap()
    };
    let peer = {
        let b_ran = Arc::clone(&b_ran);
        sys.spawn(ThreadConfig::new("peer", below_main()), move || {
            b_ran.store(true, Ordering::SeqCst);
        })
        .unwrap()
    };

    let device = {
        let (sys, b_ran, ticks) = (sys.clone(), Arc::clone(&b_ran), Arc::clone(&ticks));
        std::thread::spawn(move || {
            while !b_ran.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
                sys.serve_irq(IrqSources::TICK, |sys| {
                    let lock = sys.lock_from_isr();
                    sys.tick_i(&lock);
                });
                ticks.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    sys.join(spinner);
    sys.join(peer);
    device.join().unwrap();

    assert!(ticks.load(Ordering::SeqCst) >= 2);
    assert_eq!(sys.now(), u64::from(ticks.load(Ordering::SeqCst)));
}
