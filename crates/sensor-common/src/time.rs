//! [`Timestamp`] is a point in time on the monotonic clock, in nanoseconds.
//!
//! It's the clock kernel probes read with `bpf_ktime_get_ns`, so hook
//! invocations and userspace housekeeping (eg. the orphan sweep) can be
//! compared directly.

use std::{
    fmt,
    ops::{Add, Sub},
    time::Duration,
};

use nix::time::{clock_gettime, ClockId};
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn now() -> Self {
        match clock_gettime(ClockId::CLOCK_MONOTONIC) {
            Ok(ts) => Self(ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64),
            Err(err) => {
                log::error!("reading monotonic clock failed: {err}");
                Self(0)
            }
        }
    }

    /// Nanoseconds since boot
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Time elapsed between `earlier` and `self`, zero if `earlier` is later.
    pub fn elapsed_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl From<u64> for Timestamp {
    fn from(ns: u64) -> Self {
        Self(ns)
    }
}

impl Add<u64> for Timestamp {
    type Output = Timestamp;

    fn add(self, ns: u64) -> Self::Output {
        Self(self.0.saturating_add(ns))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, duration: Duration) -> Self::Output {
        self + duration.as_nanos() as u64
    }
}

impl Sub for Timestamp {
    type Output = Duration;

    fn sub(self, rhs: Timestamp) -> Self::Output {
        self.elapsed_since(rhs)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic() {
        let a = Timestamp::now();
        let b = Timestamp::now();
        assert!(a <= b);
    }

    #[test]
    fn elapsed_saturates() {
        let early = Timestamp::from(10);
        let late = Timestamp::from(25);
        assert_eq!(late - early, Duration::from_nanos(15));
        assert_eq!(early - late, Duration::ZERO);
        assert_eq!(early + Duration::from_nanos(15), late);
    }
}
