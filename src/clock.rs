//! Processing-time clocks.
//!
//! Deadlines and retry backoffs are measured in processing time. The
//! driver never calls [`Utc::now`] directly so tests can swap in a
//! [`TestingClock`] and move time by hand.

use std::sync::Arc;
use std::sync::Mutex;

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;

/// Defines the sense of processing time for the stage.
pub trait Clock {
    /// Return the current processing time.
    fn now(&self) -> DateTime<Utc>;
}

/// Use the current system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Simulate system time in tests. "Now" only moves when you call
/// [`TestingClock::advance`] or [`TestingClock::set`].
///
/// Clones share the same current time, so keep one handle in the test
/// and give another to the stage.
#[derive(Debug, Clone)]
pub struct TestingClock {
    current_time: Arc<Mutex<DateTime<Utc>>>,
}

impl TestingClock {
    pub fn new(start_at: DateTime<Utc>) -> Self {
        Self {
            current_time: Arc::new(Mutex::new(start_at)),
        }
    }

    /// Move "now" forward.
    pub fn advance(&self, by: Duration) {
        let mut current_time = self.lock();
        *current_time += by;
    }

    /// Jump "now" to a specific time.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.lock() = to;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DateTime<Utc>> {
        // A panicking test thread can't corrupt a plain timestamp.
        self.current_time
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Clock for TestingClock {
    fn now(&self) -> DateTime<Utc> {
        *self.lock()
    }
}

/// Convert a configured [`std::time::Duration`] into a
/// [`chrono::Duration`] for processing-time math, saturating on
/// overflow.
pub(crate) fn to_chrono(duration: std::time::Duration) -> Duration {
    Duration::from_std(duration).unwrap_or_else(|_| Duration::MAX)
}

/// Add to a processing time, saturating on overflow.
pub(crate) fn saturating_add(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    at.checked_add_signed(by).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[test]
fn testing_clock_advances() {
    use chrono::TimeZone;

    let start = Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap();
    let clock = TestingClock::new(start);
    let shared = clock.clone();
    assert_eq!(clock.now(), start);

    shared.advance(Duration::seconds(1));
    assert_eq!(clock.now(), start + Duration::seconds(1));

    shared.set(start);
    assert_eq!(clock.now(), start);
}

#[test]
fn saturating_add_does_not_overflow() {
    let found = saturating_add(Utc::now(), Duration::MAX);
    assert_eq!(found, DateTime::<Utc>::MAX_UTC);
}

#[test]
fn to_chrono_saturates_unbounded_durations() {
    assert_eq!(to_chrono(std::time::Duration::MAX), Duration::MAX);
    assert_eq!(to_chrono(std::time::Duration::from_millis(5)), Duration::milliseconds(5));
}
