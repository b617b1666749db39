//! Per-record bookkeeping for one outstanding async invocation.

use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;

use crate::element::StreamRecord;
use crate::errors::EntryError;
use crate::function::CancelSignal;
use crate::function::Outcome;
use crate::queue::EntryId;
use crate::timers::TimerId;

/// Where a record's final result ends up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultSlot<O> {
    /// Waiting on an attempt or a retry backoff.
    Pending,
    Completed(Vec<O>),
    Failed(EntryError),
}

/// Coarse lifecycle state of a record entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// An attempt is outstanding.
    Pending,
    /// Between attempts, waiting for the backoff to elapse.
    Retrying,
    Completed,
    Failed,
}

/// Retry bookkeeping for a single record.
#[derive(Debug)]
pub struct RetryContext<O> {
    /// Attempts started so far. Zero until the first invocation.
    pub(crate) attempts: u32,
    pub(crate) first_attempt: Option<DateTime<Utc>>,
    pub(crate) attempt_started: Option<DateTime<Utc>>,
    pub(crate) next_retry_at: Option<DateTime<Utc>>,
    pub(crate) retry_timer: Option<TimerId>,
    /// Outcome of the attempt being retried. Used as the final result
    /// if retrying is cut short.
    pub(crate) last_outcome: Option<Outcome<O>>,
}

impl<O> Default for RetryContext<O> {
    fn default() -> Self {
        Self {
            attempts: 0,
            first_attempt: None,
            attempt_started: None,
            next_retry_at: None,
            retry_timer: None,
            last_outcome: None,
        }
    }
}

impl<O> RetryContext<O> {
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn first_attempt(&self) -> Option<DateTime<Utc>> {
        self.first_attempt
    }

    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.next_retry_at
    }

    pub(crate) fn is_waiting(&self) -> bool {
        self.retry_timer.is_some()
    }

    /// Forget the pending retry and hand back the outcome it would
    /// have replaced.
    pub(crate) fn take_waiting(&mut self) -> (Option<TimerId>, Option<Outcome<O>>) {
        self.next_retry_at = None;
        (self.retry_timer.take(), self.last_outcome.take())
    }
}

/// A record waiting on its async result.
///
/// Owned by the stage's queue and only ever mutated by the driver.
#[derive(Debug)]
pub struct RecordEntry<I, O> {
    pub(crate) id: EntryId,
    pub(crate) record: StreamRecord<I>,
    pub(crate) slot: ResultSlot<O>,
    pub(crate) enqueued_at: DateTime<Utc>,
    pub(crate) retry: RetryContext<O>,
    pub(crate) deadline_timer: Option<TimerId>,
    /// Cancel signal of the outstanding attempt, if any.
    pub(crate) cancel: Option<Arc<CancelSignal>>,
}

impl<I, O> RecordEntry<I, O> {
    pub(crate) fn new(id: EntryId, record: StreamRecord<I>, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            id,
            record,
            slot: ResultSlot::Pending,
            enqueued_at,
            retry: RetryContext::default(),
            deadline_timer: None,
            cancel: None,
        }
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn record(&self) -> &StreamRecord<I> {
        &self.record
    }

    pub fn slot(&self) -> &ResultSlot<O> {
        &self.slot
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    pub fn retry_context(&self) -> &RetryContext<O> {
        &self.retry
    }

    pub fn state(&self) -> EntryState {
        match &self.slot {
            ResultSlot::Completed(_) => EntryState::Completed,
            ResultSlot::Failed(_) => EntryState::Failed,
            ResultSlot::Pending if self.retry.is_waiting() => EntryState::Retrying,
            ResultSlot::Pending => EntryState::Pending,
        }
    }

    /// Has this entry reached a terminal result?
    pub fn is_done(&self) -> bool {
        !matches!(self.slot, ResultSlot::Pending)
    }

    /// Does a completion for this attempt still matter?
    pub(crate) fn accepts(&self, attempt: u32) -> bool {
        !self.is_done() && !self.retry.is_waiting() && self.retry.attempts == attempt
    }

    /// Trigger the outstanding attempt's cancel signal, if any.
    pub(crate) fn cancel_attempt(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

#[cfg(test)]
fn entry() -> RecordEntry<&'static str, u8> {
    RecordEntry::new(0, StreamRecord::new("a"), Utc::now())
}

#[test]
fn entry_state_follows_slot_and_retry() {
    let mut entry = entry();
    assert_eq!(entry.state(), EntryState::Pending);
    assert!(!entry.is_done());

    entry.retry.retry_timer = Some(3);
    assert_eq!(entry.state(), EntryState::Retrying);

    entry.retry.retry_timer = None;
    entry.slot = ResultSlot::Completed(vec![1]);
    assert_eq!(entry.state(), EntryState::Completed);
    assert!(entry.is_done());
}

#[test]
fn stale_attempts_are_not_accepted() {
    let mut entry = entry();
    entry.retry.attempts = 2;
    assert!(entry.accepts(2));
    assert!(!entry.accepts(1));

    entry.retry.retry_timer = Some(0);
    assert!(!entry.accepts(2));
}

#[test]
fn cancel_attempt_triggers_signal_once() {
    let mut entry = entry();
    let cancel = Arc::new(CancelSignal::new());
    entry.cancel = Some(cancel.clone());

    entry.cancel_attempt();
    assert!(cancel.is_cancelled());
    assert!(entry.cancel.is_none());
}
