//! Time sources.
//!
//! Every component that reasons about elapsed time (health thresholds, cursor
//! idleness, activation stamps) reads "now" through a [`Clock`], so that tests
//! can drive time explicitly with a [`ManualClock`].

use std::fmt;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};

/// A source of the current time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns the current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
///
/// # Examples
///
/// ```
/// use chrono::{Duration, Utc};
/// use transit_relay::time::{Clock, ManualClock};
///
/// let start = Utc::now();
/// let clock = ManualClock::new(start);
/// clock.advance(Duration::seconds(30));
/// assert_eq!(clock.now(), start + Duration::seconds(30));
/// ```
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Moves the clock forward (or backward, for negative durations).
    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *guard += by;
    }

    /// Sets the clock to an absolute instant.
    pub fn set(&self, to: DateTime<Utc>) {
        let mut guard = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Converts a std duration into a chrono duration, saturating on overflow.
#[must_use]
pub fn to_chrono(duration: std::time::Duration) -> Duration {
    Duration::from_std(duration).unwrap_or_else(|_| Duration::days(365 * 100))
}

/// Milliseconds of a std duration, clamped to `u64`.
#[must_use]
pub fn millis(duration: std::time::Duration) -> u64 {
    duration.as_millis().min(u128::from(u64::MAX)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advance_and_set() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now(), start + Duration::minutes(5));

        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn test_to_chrono_saturates() {
        let d = to_chrono(std::time::Duration::from_secs(90));
        assert_eq!(d, Duration::seconds(90));

        let huge = to_chrono(std::time::Duration::from_secs(u64::MAX));
        assert!(huge > Duration::days(365));
    }

    #[test]
    fn test_millis_clamps() {
        assert_eq!(millis(std::time::Duration::from_millis(250)), 250);
    }
}
