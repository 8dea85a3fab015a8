//! Periodic tick interrupt source.
//!
//! A dedicated OS thread raises [`IrqSources::TICK`] at a fixed rate. Ticks are
//! scheduled against absolute monotonic deadlines so the rate does not drift
//! with handler latency.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::irq::IrqSources;
use crate::Port;

/// Nanoseconds per second
const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Highest supported tick rate.
pub const MAX_TICK_HZ: u32 = 10_000;

/// Tick period for a rate in Hz.
pub fn tick_period(rate_hz: u32) -> Duration {
    assert!(rate_hz > 0, "Tick rate must be greater than 0");
    assert!(rate_hz <= MAX_TICK_HZ, "Tick rate too high (max 10kHz)");
    Duration::from_nanos(NSEC_PER_SEC / rate_hz as u64)
}

/// Handle to a running ticker thread. Stops the thread when dropped.
pub struct Ticker {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    /// Starts raising tick interrupts on `port`, calling `on_tick` in ISR context.
    pub fn start<F>(port: Arc<Port>, rate_hz: u32, on_tick: F) -> std::io::Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let period = tick_period(rate_hz);
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("tick".to_owned())
            .spawn(move || ticker_thread(&port, period, &flag, on_tick))?;
        debug!("ticker started at {rate_hz} Hz");
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn ticker_thread<F: Fn()>(port: &Port, period: Duration, running: &AtomicBool, on_tick: F) {
    let mut next_tick = Instant::now();

    while running.load(Ordering::Relaxed) && !port.is_stopped() {
        next_tick += period;
        let now = Instant::now();
        if next_tick > now {
            thread::sleep(next_tick - now);
        }

        let delivered = panic::catch_unwind(AssertUnwindSafe(|| {
            port.isr(IrqSources::TICK, &on_tick);
        }));
        if delivered.is_err() {
            if !port.is_stopped() {
                warn!("tick handler unwound, stopping ticker");
            }
            break;
        }
    }
    running.store(false, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PortConfig;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn period_from_rate() {
        assert_eq!(tick_period(100), Duration::from_millis(10));
        assert_eq!(tick_period(1000), Duration::from_micros(1000));
    }

    #[test]
    #[should_panic(expected = "Tick rate must be greater than 0")]
    fn zero_rate_rejected() {
        tick_period(0);
    }

    #[test]
    fn ticks_arrive_in_isr_context() {
        let port = Port::new(PortConfig::default());
        port.enable();

        let count = Arc::new(AtomicUsize::new(0));
        let in_isr = Arc::new(AtomicBool::new(true));
        let (c, flag, watcher) = (Arc::clone(&count), Arc::clone(&in_isr), Arc::clone(&port));
        let mut ticker = Ticker::start(Arc::clone(&port), 100, move || {
            if !watcher.is_isr_context() {
                flag.store(false, Ordering::SeqCst);
            }
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        thread::sleep(Duration::from_millis(100));
        ticker.stop();

        let ticks = count.load(Ordering::SeqCst);
        assert!((5..=15).contains(&ticks), "Expected ~10 ticks, got {ticks}");
        assert!(in_isr.load(Ordering::SeqCst));
        assert_eq!(port.interrupt_count() as usize, ticks);
    }

    #[test]
    fn masked_tick_is_held_off() {
        let port = Port::new(PortConfig::default());
        let _main = port.boot_context("main");
        port.enable();
        port.lock();

        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let mut ticker = Ticker::start(Arc::clone(&port), 1000, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        port.unlock();
        thread::sleep(Duration::from_millis(20));
        port.shutdown();
        ticker.stop();
        assert!(count.load(Ordering::SeqCst) > 0);
    }
}
