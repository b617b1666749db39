//! Strict input-order queue.

use std::collections::VecDeque;

use super::EntryId;
use super::QueueEntry;
use super::StreamElementQueue;
use crate::handle::RecordEntry;

/// Entries leave only from the head. A slow head holds back
/// everything behind it, even entries that already finished.
pub struct OrderedQueue<I, O> {
    capacity: usize,
    /// Sorted by ID since IDs are assigned in insertion order.
    entries: VecDeque<QueueEntry<I, O>>,
}

impl<I, O> OrderedQueue<I, O> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }
}

impl<I, O> StreamElementQueue<I, O> for OrderedQueue<I, O> {
    fn push(&mut self, entry: QueueEntry<I, O>) {
        self.entries.push_back(entry);
    }

    fn entries(&self) -> Box<dyn Iterator<Item = &QueueEntry<I, O>> + '_> {
        Box::new(self.entries.iter())
    }

    fn has_completed_head(&self) -> bool {
        self.entries.front().map_or(false, QueueEntry::is_done)
    }

    fn drain_ready(&mut self) -> Vec<QueueEntry<I, O>> {
        let mut ready = Vec::new();
        while self.has_completed_head() {
            ready.extend(self.entries.pop_front());
        }
        ready
    }

    fn mark_completed(&mut self, _id: EntryId) {
        // Readiness is read straight off the head's slot.
    }

    fn get_mut(&mut self, id: EntryId) -> Option<&mut RecordEntry<I, O>> {
        let idx = self.entries.binary_search_by_key(&id, QueueEntry::id).ok()?;
        match self.entries.get_mut(idx) {
            Some(QueueEntry::Record(entry)) => Some(entry),
            _ => None,
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn clear(&mut self) -> Vec<QueueEntry<I, O>> {
        self.entries.drain(..).collect()
    }
}

#[cfg(test)]
use super::testing::*;

#[test]
fn ordered_rejects_when_full() {
    let mut queue = OrderedQueue::new(2);
    assert!(queue.try_put(record(0, "a")).is_ok());
    assert!(queue.try_put(watermark(1, 5)).is_ok());
    assert!(!queue.has_capacity());

    let rejected = queue.try_put(record(2, "c")).unwrap_err();
    assert_eq!(rejected.id(), 2);
    assert_eq!(queue.len(), 2);
}

#[test]
fn ordered_waits_on_head() {
    let mut queue = OrderedQueue::new(3);
    queue.try_put(record(0, "a")).unwrap();
    queue.try_put(record(1, "b")).unwrap();
    queue.try_put(record(2, "c")).unwrap();

    complete(&mut queue, 1);
    assert!(!queue.has_completed_head());
    assert!(queue.drain_ready().is_empty());

    complete(&mut queue, 0);
    assert!(queue.has_completed_head());
    assert_eq!(ids(queue.drain_ready()), vec![0, 1]);
    assert_eq!(queue.len(), 1);
    assert!(queue.has_capacity());
}

#[test]
fn ordered_watermark_at_head_is_ready() {
    let mut queue = OrderedQueue::new(3);
    queue.try_put(watermark(0, 1)).unwrap();
    queue.try_put(record(1, "a")).unwrap();
    queue.try_put(watermark(2, 2)).unwrap();

    assert_eq!(ids(queue.drain_ready()), vec![0]);

    complete(&mut queue, 1);
    assert_eq!(ids(queue.drain_ready()), vec![1, 2]);
    assert!(queue.is_empty());
}

#[test]
fn ordered_get_mut_skips_watermarks() {
    let mut queue = OrderedQueue::<&str, &str>::new(2);
    queue.try_put(watermark(4, 1)).unwrap();
    queue.try_put(record(5, "a")).unwrap();

    assert!(queue.get_mut(4).is_none());
    assert_eq!(queue.get_mut(5).map(|entry| entry.id()), Some(5));
    assert!(queue.get_mut(6).is_none());
}

#[test]
fn ordered_clear_returns_everything() {
    let mut queue = OrderedQueue::new(2);
    queue.try_put(record(0, "a")).unwrap();
    queue.try_put(record(1, "b")).unwrap();

    assert_eq!(ids(queue.clear()), vec![0, 1]);
    assert!(queue.is_empty());
}

#[test]
fn ordered_hands_back_rejected_record() {
    use crate::element::StreamRecord;

    let mut queue = OrderedQueue::<&str, &str>::new(1);
    queue.try_put(watermark(0, 1)).unwrap();

    let entry = RecordEntry::new(1, StreamRecord::new("a"), chrono::Utc::now());
    let rejected = queue.try_put_record(entry).unwrap_err();
    assert_eq!(rejected.id(), 1);
    assert_eq!(rejected.record().value, "a");
    assert_eq!(queue.len(), 1);
}
