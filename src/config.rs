//! Compile-time configuration knobs.
//!
//! `r3_kernel` takes its build-time parameters (priority count, object
//! counts, the ready-queue and timeout-heap backing types) through a
//! `KernelCfg1`/`KernelTraits` trait pair that an application crate
//! implements, generated by the `build!` macro in `cfg.rs`. This crate
//! collapses that into a single trait with associated consts; the feature
//! flags in `Cargo.toml` (`signals`, `thread-detach`, `fifo-queue-emplace`,
//! `message-queue-emplace`) play the role of the teacher's
//! `SIGNALS_ENABLE`/`THREAD_DETACH_ENABLE`/emplace knobs, since those gate
//! which modules and methods exist at all rather than a runtime value.
pub trait Config: 'static {
    /// Rate of the periodic tick source, in Hz. The core never programs the
    /// timer itself; this is informational for callers converting wall-clock
    /// durations to tick counts.
    const TICK_FREQUENCY_HZ: u32;

    /// Priority of the kernel's initial ("main") thread.
    const MAIN_THREAD_PRIORITY: u8;

    /// Queued-signal ring capacity for the initial thread.
    const MAIN_THREAD_QUEUED_SIGNALS: usize;

    /// Signal action-slot count for the initial thread. Bounded to 32 (one
    /// slot per signal number); values above 32 are truncated.
    const MAIN_THREAD_SIGNAL_ACTIONS: usize;

    /// Upper bound on the number of simultaneously-armed software timers.
    /// Backs the supervisor's fixed-capacity ordered list.
    const MAX_TIMERS: usize;

    /// Ticks a `Policy::RoundRobin` thread runs for before yielding to the
    /// next equal-priority thread, if any are ready. Threads on
    /// `Policy::Fifo` ignore this entirely.
    const ROUND_ROBIN_QUANTUM_TICKS: u32;

    /// Upper bound on simultaneously-held recursive locks of one `Mutex` by
    /// its owner (`Kind::Recursive`); the lock call that would exceed it
    /// returns [`crate::error::Error::Eagain`].
    const MAX_RECURSIVE_LOCKS: u32;
}

/// A ready-to-use [`Config`] with conservative defaults, suitable for tests
/// and examples.
#[derive(Debug, Clone, Copy)]
pub struct DefaultConfig;

impl Config for DefaultConfig {
    const TICK_FREQUENCY_HZ: u32 = 1000;
    const MAIN_THREAD_PRIORITY: u8 = 0;
    const MAIN_THREAD_QUEUED_SIGNALS: usize = 4;
    const MAIN_THREAD_SIGNAL_ACTIONS: usize = 32;
    const MAX_TIMERS: usize = 32;
    const ROUND_ROBIN_QUANTUM_TICKS: u32 = 10;
    const MAX_RECURSIVE_LOCKS: u32 = 4;
}
