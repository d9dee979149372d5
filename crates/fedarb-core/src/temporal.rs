//! # Temporal Types: Monotonic Instants and Clocks
//!
//! Arbitration reasons exclusively in monotonic time: every window
//! (suspicion expiry, delay interval, history coverage) is a distance on a
//! clock that never jumps backwards. `MonoTime` is an instant on such a
//! clock, expressed as an offset from the clock's origin so it can be
//! compared, logged, and constructed deterministically in tests.
//!
//! Wall-clock time appears only in diagnostics, through [`Timestamp`].
//!
//! ## Saturation
//!
//! `MonoTime - Duration` saturates at [`MonoTime::ZERO`]: a window larger
//! than the clock's age simply reaches back to the origin. `MonoTime +
//! Duration` saturates at [`MonoTime::MAX`], which doubles as "never".

use std::fmt;
use std::ops::{Add, Sub};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// An instant on a monotonic clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MonoTime(Duration);

impl MonoTime {
    /// The clock origin.
    pub const ZERO: MonoTime = MonoTime(Duration::ZERO);

    /// The far future; used for "infinite" deadlines.
    pub const MAX: MonoTime = MonoTime(Duration::MAX);

    /// Create an instant at `offset` past the clock origin.
    pub const fn from_offset(offset: Duration) -> Self {
        Self(offset)
    }

    /// Create an instant `millis` milliseconds past the clock origin.
    pub const fn from_millis(millis: u64) -> Self {
        Self(Duration::from_millis(millis))
    }

    /// Offset of this instant from the clock origin.
    pub fn offset(&self) -> Duration {
        self.0
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    pub fn duration_since(&self, earlier: MonoTime) -> Duration {
        self.0.saturating_sub(earlier.0)
    }

    /// `self - d`, or `None` if the window reaches back past the origin.
    pub fn checked_sub(&self, d: Duration) -> Option<MonoTime> {
        self.0.checked_sub(d).map(MonoTime)
    }

    /// Whether this instant is the "never" sentinel.
    pub fn is_max(&self) -> bool {
        *self == Self::MAX
    }
}

impl Add<Duration> for MonoTime {
    type Output = MonoTime;

    fn add(self, rhs: Duration) -> MonoTime {
        MonoTime(self.0.saturating_add(rhs))
    }
}

impl Sub<Duration> for MonoTime {
    type Output = MonoTime;

    fn sub(self, rhs: Duration) -> MonoTime {
        MonoTime(self.0.saturating_sub(rhs))
    }
}

impl fmt::Display for MonoTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_max() {
            f.write_str("never")
        } else {
            write!(f, "+{}.{:03}s", self.0.as_secs(), self.0.subsec_millis())
        }
    }
}

/// Source of monotonic time.
///
/// The authority never reads a clock directly; it is handed one at
/// construction so tests can drive time explicitly.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> MonoTime;
}

/// Clock backed by [`std::time::Instant`], with its origin at construction.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Create a clock whose origin is the current instant.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> MonoTime {
        MonoTime(self.origin.elapsed())
    }
}

/// Manually driven clock for tests and scenario replay.
///
/// Starts at the origin unless constructed with [`ManualClock::starting_at`].
/// Time only moves when [`advance`](ManualClock::advance) or
/// [`set`](ManualClock::set) is called.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    /// Create a clock at the origin.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock at `start`.
    pub fn starting_at(start: MonoTime) -> Self {
        let clock = Self::new();
        clock.set(start);
        clock
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        self.nanos
            .fetch_add(duration_to_nanos(by), Ordering::SeqCst);
    }

    /// Set the clock to `at`. Setting it backwards is permitted; callers
    /// use it to model a restarted process.
    pub fn set(&self, at: MonoTime) {
        self.nanos
            .store(duration_to_nanos(at.offset()), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> MonoTime {
        MonoTime(Duration::from_nanos(self.nanos.load(Ordering::SeqCst)))
    }
}

fn duration_to_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// A UTC wall-clock timestamp, truncated to seconds precision.
///
/// Used only to stamp diagnostic output; never used for decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Current UTC time, truncated to seconds.
    pub fn now() -> Self {
        Self::from_utc(Utc::now())
    }

    /// From a `DateTime<Utc>`, truncating sub-seconds.
    pub fn from_utc(dt: DateTime<Utc>) -> Self {
        Self(dt.with_nanosecond(0).unwrap_or(dt))
    }

    /// Access the inner `DateTime<Utc>`.
    pub fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Render as ISO8601 with Z suffix (e.g., `2026-01-15T12:00:00Z`).
    pub fn to_iso8601(&self) -> String {
        self.0.format("%Y-%m-%dT%H:%M:%SZ").to_string()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_iso8601())
    }
}

/// Serialize a `Duration` as whole milliseconds.
///
/// Use with `#[serde(with = "fedarb_core::temporal::serde_millis")]`.
/// `Duration::MAX` is written as `u64::MAX`.
pub mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(|ms| {
            if ms == u64::MAX {
                Duration::MAX
            } else {
                Duration::from_millis(ms)
            }
        })
    }
}

/// [`serde_millis`] for `Option<Duration>`.
pub mod serde_millis_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => super::serde_millis::serialize(d, s),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}
