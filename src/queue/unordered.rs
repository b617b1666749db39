//! Completion-order queue, segmented by watermarks.
//!
//! The queue is a sequence of segments. Each run of records between
//! two watermarks is one segment, and each watermark is a segment of
//! its own. Only the first segment may emit:
//!
//! ```text
//!   [ r0 r1 r2 ] [ W1 ] [ r3 r4 ] [ W2 ] [ r5 ]
//!   ^ emitting
//! ```
//!
//! Records in the first segment leave as they finish. Once it is
//! empty the watermark behind it leaves, and the next record segment
//! starts emitting. So a watermark leaves only after every entry
//! admitted before it, and no record admitted after a watermark can
//! overtake it.

use std::collections::BTreeMap;
use std::collections::VecDeque;

use super::EntryId;
use super::QueueEntry;
use super::StreamElementQueue;
use crate::handle::RecordEntry;

enum Segment<I, O> {
    Records {
        entries: BTreeMap<EntryId, QueueEntry<I, O>>,
        /// Finished entries in completion order.
        ready: VecDeque<EntryId>,
    },
    Watermark(QueueEntry<I, O>),
}

impl<I, O> Segment<I, O> {
    fn records() -> Self {
        Self::Records {
            entries: BTreeMap::new(),
            ready: VecDeque::new(),
        }
    }

    fn iter(&self) -> Box<dyn Iterator<Item = &QueueEntry<I, O>> + '_> {
        match self {
            Self::Records { entries, .. } => Box::new(entries.values()),
            Self::Watermark(entry) => Box::new(std::iter::once(entry)),
        }
    }
}

/// Records leave in completion order within a watermark segment.
pub struct UnorderedQueue<I, O> {
    capacity: usize,
    len: usize,
    segments: VecDeque<Segment<I, O>>,
}

impl<I, O> UnorderedQueue<I, O> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            len: 0,
            segments: VecDeque::new(),
        }
    }

    fn segment_of(&mut self, id: EntryId) -> Option<&mut Segment<I, O>> {
        self.segments.iter_mut().find(|segment| match segment {
            Segment::Records { entries, .. } => entries.contains_key(&id),
            Segment::Watermark(_) => false,
        })
    }
}

impl<I, O> StreamElementQueue<I, O> for UnorderedQueue<I, O> {
    fn push(&mut self, entry: QueueEntry<I, O>) {
        match entry {
            QueueEntry::Watermark { .. } => {
                self.segments.push_back(Segment::Watermark(entry));
            }
            QueueEntry::Record(_) => {
                if !matches!(self.segments.back(), Some(Segment::Records { .. })) {
                    self.segments.push_back(Segment::records());
                }
                if let Some(Segment::Records { entries, ready }) = self.segments.back_mut() {
                    if entry.is_done() {
                        ready.push_back(entry.id());
                    }
                    entries.insert(entry.id(), entry);
                }
            }
        }
        self.len += 1;
    }

    fn entries(&self) -> Box<dyn Iterator<Item = &QueueEntry<I, O>> + '_> {
        Box::new(self.segments.iter().flat_map(Segment::iter))
    }

    fn has_completed_head(&self) -> bool {
        match self.segments.front() {
            Some(Segment::Records { entries, ready }) => {
                // Whatever follows a record segment is a watermark.
                !ready.is_empty() || (entries.is_empty() && self.segments.len() > 1)
            }
            Some(Segment::Watermark(_)) => true,
            None => false,
        }
    }

    fn drain_ready(&mut self) -> Vec<QueueEntry<I, O>> {
        let mut drained = Vec::new();
        while let Some(segment) = self.segments.front_mut() {
            match segment {
                Segment::Records { entries, ready } => {
                    while let Some(id) = ready.pop_front() {
                        drained.extend(entries.remove(&id));
                    }
                    if !entries.is_empty() {
                        break;
                    }
                    self.segments.pop_front();
                }
                Segment::Watermark(_) => {
                    if let Some(Segment::Watermark(entry)) = self.segments.pop_front() {
                        drained.push(entry);
                    }
                }
            }
        }
        self.len -= drained.len();
        drained
    }

    fn mark_completed(&mut self, id: EntryId) {
        if let Some(Segment::Records { ready, .. }) = self.segment_of(id) {
            ready.push_back(id);
        }
    }

    fn get_mut(&mut self, id: EntryId) -> Option<&mut RecordEntry<I, O>> {
        self.segments.iter_mut().find_map(|segment| match segment {
            Segment::Records { entries, .. } => match entries.get_mut(&id) {
                Some(QueueEntry::Record(entry)) => Some(entry),
                _ => None,
            },
            Segment::Watermark(_) => None,
        })
    }

    fn len(&self) -> usize {
        self.len
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn clear(&mut self) -> Vec<QueueEntry<I, O>> {
        let mut cleared = Vec::with_capacity(self.len);
        for segment in self.segments.drain(..) {
            match segment {
                Segment::Records { entries, .. } => cleared.extend(entries.into_values()),
                Segment::Watermark(entry) => cleared.push(entry),
            }
        }
        self.len = 0;
        cleared
    }
}

#[cfg(test)]
use super::testing::*;

#[test]
fn unordered_emits_in_completion_order() {
    let mut queue = UnorderedQueue::new(3);
    queue.try_put(record(0, "a")).unwrap();
    queue.try_put(record(1, "b")).unwrap();
    queue.try_put(record(2, "c")).unwrap();

    complete(&mut queue, 2);
    complete(&mut queue, 0);
    assert!(queue.has_completed_head());
    assert_eq!(ids(queue.drain_ready()), vec![2, 0]);
    assert_eq!(queue.len(), 1);

    complete(&mut queue, 1);
    assert_eq!(ids(queue.drain_ready()), vec![1]);
    assert!(queue.is_empty());
    assert!(!queue.has_completed_head());
}

#[test]
fn unordered_watermark_waits_for_earlier_records() {
    let mut queue = UnorderedQueue::new(5);
    queue.try_put(record(0, "a")).unwrap();
    queue.try_put(record(1, "b")).unwrap();
    queue.try_put(watermark(2, 10)).unwrap();
    queue.try_put(record(3, "c")).unwrap();

    complete(&mut queue, 3);
    complete(&mut queue, 1);
    assert_eq!(ids(queue.drain_ready()), vec![1]);

    complete(&mut queue, 0);
    assert_eq!(ids(queue.drain_ready()), vec![0, 2, 3]);
    assert!(queue.is_empty());
}

#[test]
fn unordered_consecutive_watermarks() {
    let mut queue = UnorderedQueue::new(4);
    queue.try_put(watermark(0, 1)).unwrap();
    queue.try_put(watermark(1, 2)).unwrap();
    queue.try_put(record(2, "a")).unwrap();
    queue.try_put(watermark(3, 3)).unwrap();

    assert_eq!(ids(queue.drain_ready()), vec![0, 1]);
    assert!(!queue.has_completed_head());

    complete(&mut queue, 2);
    assert_eq!(ids(queue.drain_ready()), vec![2, 3]);
}

#[test]
fn unordered_watermarks_take_capacity() {
    let mut queue = UnorderedQueue::new(2);
    queue.try_put(record(0, "a")).unwrap();
    queue.try_put(watermark(1, 1)).unwrap();
    assert!(queue.try_put(record(2, "b")).is_err());

    complete(&mut queue, 0);
    queue.drain_ready();
    assert!(queue.try_put(record(2, "b")).is_ok());
}

#[test]
fn unordered_entries_in_insertion_order() {
    let mut queue = UnorderedQueue::new(4);
    queue.try_put(record(0, "a")).unwrap();
    queue.try_put(watermark(1, 1)).unwrap();
    queue.try_put(record(2, "b")).unwrap();
    queue.try_put(record(3, "c")).unwrap();
    complete(&mut queue, 3);

    let found: Vec<_> = queue.entries().map(QueueEntry::id).collect();
    assert_eq!(found, vec![0, 1, 2, 3]);
    assert_eq!(ids(queue.clear()), vec![0, 1, 2, 3]);
    assert_eq!(queue.len(), 0);
}

#[test]
fn unordered_random_completion_respects_watermarks() {
    let mut rng = fastrand::Rng::with_seed(42);
    for _ in 0..50 {
        let mut queue = UnorderedQueue::new(16);
        // Records 0..4, watermark 4, records 5..9, watermark 9, records 10..12
        let watermark_ids = [4, 9];
        let mut pending = Vec::new();
        for id in 0..12 {
            if watermark_ids.contains(&id) {
                queue.try_put(watermark(id, id as i64)).unwrap();
            } else {
                queue.try_put(record(id, "x")).unwrap();
                pending.push(id);
            }
        }
        rng.shuffle(&mut pending);

        let mut emitted = Vec::new();
        for id in pending {
            complete(&mut queue, id);
            emitted.extend(ids(queue.drain_ready()));
        }

        assert_eq!(emitted.len(), 12);
        let pos = |id| emitted.iter().position(|x| *x == id).unwrap();
        for wm in watermark_ids {
            for id in 0..12 {
                if id < wm {
                    assert!(pos(id) < pos(wm));
                } else if id > wm {
                    assert!(pos(id) > pos(wm));
                }
            }
        }
    }
}
