//! The bounded in-flight queue.
//!
//! Every record and watermark the stage admits takes one slot until
//! it has been emitted. The queue decides *when* a finished entry may
//! leave; the driver decides *whether* an entry is finished.
//!
//! Two disciplines are provided:
//!
//! - [`OrderedQueue`]: entries leave strictly in insertion order.
//!
//! - [`UnorderedQueue`]: records leave in completion order, but never
//!   across a watermark.

use crate::element::StreamElement;
use crate::element::Watermark;
use crate::handle::RecordEntry;

mod ordered;
mod unordered;

pub use ordered::OrderedQueue;
pub use unordered::UnorderedQueue;

/// Driver-assigned, strictly increasing ID of a queue entry.
pub type EntryId = u64;

/// One occupied slot in the queue.
#[derive(Debug)]
pub enum QueueEntry<I, O> {
    Record(RecordEntry<I, O>),
    /// Watermarks need no async call and are done on arrival.
    Watermark { id: EntryId, watermark: Watermark },
}

impl<I, O> QueueEntry<I, O> {
    pub fn id(&self) -> EntryId {
        match self {
            Self::Record(entry) => entry.id,
            Self::Watermark { id, .. } => *id,
        }
    }

    pub fn is_done(&self) -> bool {
        match self {
            Self::Record(entry) => entry.is_done(),
            Self::Watermark { .. } => true,
        }
    }

    pub fn is_watermark(&self) -> bool {
        matches!(self, Self::Watermark { .. })
    }

    /// The original input this entry was created from.
    pub fn to_element(&self) -> StreamElement<I>
    where
        I: Clone,
    {
        match self {
            Self::Record(entry) => StreamElement::Record(entry.record.clone()),
            Self::Watermark { watermark, .. } => StreamElement::Watermark(*watermark),
        }
    }
}

/// The contract both queue disciplines share.
///
/// Only ever called from the driver's thread.
pub trait StreamElementQueue<I, O> {
    /// Append an entry regardless of capacity.
    ///
    /// Admission goes through [`Self::try_put`] or
    /// [`Self::try_put_record`], which check capacity first.
    fn push(&mut self, entry: QueueEntry<I, O>);

    /// Admit an entry, or hand it back if the queue is full.
    fn try_put(&mut self, entry: QueueEntry<I, O>) -> Result<(), QueueEntry<I, O>> {
        if self.has_capacity() {
            self.push(entry);
            Ok(())
        } else {
            Err(entry)
        }
    }

    /// Admit a record entry, or hand it back if the queue is full.
    fn try_put_record(&mut self, entry: RecordEntry<I, O>) -> Result<(), RecordEntry<I, O>> {
        if self.has_capacity() {
            self.push(QueueEntry::Record(entry));
            Ok(())
        } else {
            Err(entry)
        }
    }

    /// Current entries in insertion order.
    fn entries(&self) -> Box<dyn Iterator<Item = &QueueEntry<I, O>> + '_>;

    /// Could [`Self::drain_ready`] return anything right now?
    fn has_completed_head(&self) -> bool;

    /// Remove and return every entry that may be emitted now, in
    /// emission order.
    fn drain_ready(&mut self) -> Vec<QueueEntry<I, O>>;

    /// The driver resolved this record entry.
    ///
    /// Call at most once per entry, after setting its slot.
    fn mark_completed(&mut self, id: EntryId);

    fn get_mut(&mut self, id: EntryId) -> Option<&mut RecordEntry<I, O>>;

    fn len(&self) -> usize;

    fn capacity(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn has_capacity(&self) -> bool {
        self.len() < self.capacity()
    }

    /// Remove every entry without emitting.
    fn clear(&mut self) -> Vec<QueueEntry<I, O>>;
}

#[cfg(test)]
pub(crate) mod testing {
    use chrono::TimeZone;
    use chrono::Utc;

    use super::*;
    use crate::element::StreamRecord;
    use crate::handle::ResultSlot;

    pub(crate) type TestEntry = QueueEntry<&'static str, &'static str>;

    pub(crate) fn record(id: EntryId, value: &'static str) -> TestEntry {
        QueueEntry::Record(RecordEntry::new(id, StreamRecord::new(value), Utc::now()))
    }

    pub(crate) fn watermark(id: EntryId, secs: i64) -> TestEntry {
        let at = Utc.timestamp_opt(secs, 0).unwrap();
        QueueEntry::Watermark {
            id,
            watermark: Watermark(at),
        }
    }

    /// Resolve an entry the way the driver does.
    pub(crate) fn complete(
        queue: &mut dyn StreamElementQueue<&'static str, &'static str>,
        id: EntryId,
    ) {
        let entry = queue.get_mut(id).unwrap();
        entry.slot = ResultSlot::Completed(vec![entry.record.value]);
        queue.mark_completed(id);
    }

    pub(crate) fn ids(entries: Vec<TestEntry>) -> Vec<EntryId> {
        entries.iter().map(QueueEntry::id).collect()
    }
}
