//! Processing-time timers for deadlines and retry backoffs.
//!
//! Timers are kept sorted by fire time and removed as soon as they
//! are cancelled, so only timers of entries still in flight take up
//! space.

use std::collections::BTreeMap;
use std::collections::HashMap;

use chrono::DateTime;
use chrono::Utc;

use crate::queue::EntryId;

pub(crate) type TimerId = u64;

/// What to do when a timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerTarget {
    /// The overall timeout for an entry elapsed.
    Deadline(EntryId),
    /// An entry's retry backoff elapsed; re-invoke it.
    Retry(EntryId),
}

#[derive(Debug, Default)]
pub(crate) struct TimerQueue {
    next_id: TimerId,
    /// Ties on fire time break by ID, i.e. scheduling order.
    by_time: BTreeMap<(DateTime<Utc>, TimerId), TimerTarget>,
    fire_at: HashMap<TimerId, DateTime<Utc>>,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn schedule(&mut self, fire_at: DateTime<Utc>, target: TimerTarget) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.by_time.insert((fire_at, id), target);
        self.fire_at.insert(id, fire_at);
        id
    }

    /// Returns if the timer was still pending.
    pub(crate) fn cancel(&mut self, id: TimerId) -> bool {
        match self.fire_at.remove(&id) {
            Some(fire_at) => self.by_time.remove(&(fire_at, id)).is_some(),
            None => false,
        }
    }

    /// Remove and return the next timer due at or before `now`.
    ///
    /// Timers due at the same instant fire in scheduling order.
    pub(crate) fn pop_due(&mut self, now: DateTime<Utc>) -> Option<TimerTarget> {
        let (&(fire_at, id), _) = self.by_time.first_key_value()?;
        if fire_at > now {
            return None;
        }
        self.fire_at.remove(&id);
        self.by_time.remove(&(fire_at, id))
    }

    /// When the earliest timer fires.
    pub(crate) fn next_fire(&self) -> Option<DateTime<Utc>> {
        self.by_time
            .first_key_value()
            .map(|(&(fire_at, _), _)| fire_at)
    }

    pub(crate) fn len(&self) -> usize {
        self.by_time.len()
    }

    pub(crate) fn clear(&mut self) {
        self.by_time.clear();
        self.fire_at.clear();
    }
}

#[cfg(test)]
fn at(secs: i64) -> DateTime<Utc> {
    use chrono::TimeZone;
    Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs)
}

#[test]
fn timers_fire_in_time_order() {
    let mut timers = TimerQueue::new();
    timers.schedule(at(5), TimerTarget::Retry(1));
    timers.schedule(at(3), TimerTarget::Deadline(2));
    timers.schedule(at(5), TimerTarget::Deadline(3));

    assert_eq!(timers.next_fire(), Some(at(3)));
    assert_eq!(timers.pop_due(at(2)), None);
    assert_eq!(timers.pop_due(at(3)), Some(TimerTarget::Deadline(2)));
    assert_eq!(timers.pop_due(at(10)), Some(TimerTarget::Retry(1)));
    assert_eq!(timers.pop_due(at(10)), Some(TimerTarget::Deadline(3)));
    assert_eq!(timers.pop_due(at(10)), None);
}

#[test]
fn cancelled_timers_never_fire() {
    let mut timers = TimerQueue::new();
    let early = timers.schedule(at(1), TimerTarget::Deadline(1));
    timers.schedule(at(2), TimerTarget::Deadline(2));

    assert!(timers.cancel(early));
    assert!(!timers.cancel(early));
    assert_eq!(timers.len(), 1);
    assert_eq!(timers.next_fire(), Some(at(2)));
    assert_eq!(timers.pop_due(at(5)), Some(TimerTarget::Deadline(2)));
    assert_eq!(timers.next_fire(), None);
}

#[test]
fn cancelled_timers_free_their_slot() {
    let mut timers = TimerQueue::new();
    // An early timer that never fires must not pin later cancelled
    // ones.
    timers.schedule(at(1), TimerTarget::Deadline(0));
    for entry in 1..10_000 {
        let id = timers.schedule(at(3600), TimerTarget::Deadline(entry));
        assert!(timers.cancel(id));
    }
    assert_eq!(timers.len(), 1);
    assert_eq!(timers.fire_at.len(), 1);
    assert_eq!(timers.next_fire(), Some(at(1)));
}
