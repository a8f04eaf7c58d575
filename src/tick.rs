//! The kernel's monotonic tick clock.
//!
//! A tick is the unit of kernel time: one period of the tick source
//! (`Config::TICK_FREQUENCY_HZ`). Time points are absolute tick counts;
//! durations are signed tick deltas supplied by callers.

use core::ops::Add;

/// An absolute point in kernel time, counted in ticks since boot.
///
/// 64-bit and monotonic: on any realistic tick rate, it will not wrap before
/// the hardware it runs on has been replaced several times over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Tick(pub u64);

impl Tick {
    pub const ZERO: Tick = Tick(0);

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn checked_add(self, duration: Duration) -> Option<Tick> {
        self.0.checked_add(duration.0).map(Tick)
    }
}

impl Add<Duration> for Tick {
    type Output = Tick;

    #[inline]
    fn add(self, rhs: Duration) -> Tick {
        Tick(self.0.wrapping_add(rhs.0))
    }
}

/// A relative span of kernel time, in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Duration(pub u64);

impl Duration {
    pub const ZERO: Duration = Duration(0);

    #[inline]
    pub const fn ticks(n: u64) -> Duration {
        Duration(n)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for Duration {
    #[inline]
    fn from(ticks: u64) -> Self {
        Duration(ticks)
    }
}
