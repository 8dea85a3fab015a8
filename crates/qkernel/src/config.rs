//! Kernel configuration.

use qport_posix::{PortConfig, INT_REQUIRED_STACK};

/// How system time advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMode {
    /// Time only moves when every thread is blocked: the idle thread jumps
    /// straight to the earliest pending timeout. Deterministic, no ticker thread.
    /// With no timeout pending the kernel halts as deadlocked, unless a host
    /// device is attached through `System::attach_device`.
    Virtual,
    /// A ticker raises a tick interrupt `tick_hz` times per second.
    Periodic { tick_hz: u32 },
}

/// Configuration for a kernel instance.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub name: &'static str,
    /// Upper bound on threads, main and idle included.
    pub max_threads: usize,
    /// Round-robin quantum in ticks; 0 disables rotation among equals.
    pub time_quantum: u32,
    pub default_stack_size: usize,
    pub idle_stack_size: usize,
    pub stack_check: bool,
    pub clock: ClockMode,
    /// Called by the idle thread on every pass.
    pub idle_callback: Option<fn()>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            name: "qkernel",
            max_threads: 32,
            time_quantum: 20,
            default_stack_size: 64 * 1024,
            idle_stack_size: 16 * 1024,
            stack_check: true,
            clock: ClockMode::Virtual,
            idle_callback: None,
        }
    }
}

impl KernelConfig {
    /// Creates a new kernel configuration builder.
    pub fn builder() -> KernelConfigBuilder {
        KernelConfigBuilder::default()
    }

    pub(crate) fn port_config(&self) -> PortConfig {
        PortConfig {
            stack_check: self.stack_check,
            int_required_stack: INT_REQUIRED_STACK,
        }
    }
}

/// Builder for ergonomic kernel configuration construction.
#[derive(Debug, Default)]
pub struct KernelConfigBuilder {
    config: KernelConfig,
}

impl KernelConfigBuilder {
    pub fn name(mut self, name: &'static str) -> Self {
        self.config.name = name;
        self
    }

    pub fn max_threads(mut self, max: usize) -> Self {
        self.config.max_threads = max;
        self
    }

    pub fn time_quantum(mut self, ticks: u32) -> Self {
        self.config.time_quantum = ticks;
        self
    }

    pub fn default_stack_size(mut self, bytes: usize) -> Self {
        self.config.default_stack_size = bytes;
        self
    }

    pub fn idle_stack_size(mut self, bytes: usize) -> Self {
        self.config.idle_stack_size = bytes;
        self
    }

    pub fn stack_check(mut self, enabled: bool) -> Self {
        self.config.stack_check = enabled;
        self
    }

    pub fn virtual_clock(mut self) -> Self {
        self.config.clock = ClockMode::Virtual;
        self
    }

    /// Drive time from a periodic tick interrupt.
    ///
    /// # Panics
    ///
    /// Panics if `tick_hz` is 0 or above 10 kHz.
    pub fn periodic_clock(mut self, tick_hz: u32) -> Self {
        assert!(tick_hz > 0, "Tick rate must be greater than 0");
        assert!(
            tick_hz <= qport_posix::ticker::MAX_TICK_HZ,
            "Tick rate too high (max 10kHz)"
        );
        self.config.clock = ClockMode::Periodic { tick_hz };
        self
    }

    pub fn idle_callback(mut self, callback: fn()) -> Self {
        self.config.idle_callback = Some(callback);
        self
    }

    pub fn build(self) -> KernelConfig {
        self.config
    }
}
