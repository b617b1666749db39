//! Checkpointing the async wait stage.
//!
//! Snapshots
//! ---------
//!
//! At a checkpoint barrier the stage captures the original input of
//! every entry still in its queue, in queue order, as
//! [`PendingElements`]. In-flight calls, attempt counters and any
//! results already received are not part of the snapshot. Entries
//! that already emitted are gone from the queue, so what is captured
//! is exactly what downstream has not seen yet.
//!
//! Restoring
//! ---------
//!
//! On restore every captured record is admitted again as a brand new
//! entry: the async function is invoked from scratch, attempts start
//! at zero and the overall timeout is measured from restore time.
//! Captured watermarks are re-admitted in place so the ordering rules
//! hold across the restart. This means the async function can see the
//! same input more than once and must tolerate that.
//!
//! Stores
//! ------
//!
//! Snapshots are opaque [`StateBytes`] keyed by [`StepId`] and
//! [`CheckpointId`] in a [`CheckpointStore`]. Only the newest
//! checkpoint of a step is ever read back; older ones can be
//! discarded once a newer one is written.

pub(crate) mod model;
pub(crate) mod store;

pub use model::*;
pub use store::in_mem::InMemStore;
pub use store::noop::NoOpStore;
pub use store::sqlite::SqliteCheckpointStore;
pub use store::CheckpointStore;

use crate::element::StreamElement;
use crate::queue::QueueEntry;

impl<I> PendingElements<I>
where
    I: Clone,
{
    /// Capture the inputs of these queue entries, in the order given.
    pub(crate) fn capture<'a, O: 'a>(entries: impl Iterator<Item = &'a QueueEntry<I, O>>) -> Self
    where
        I: 'a,
    {
        Self(entries.map(QueueEntry::to_element).collect())
    }
}

impl<I> FromIterator<StreamElement<I>> for PendingElements<I> {
    fn from_iter<T: IntoIterator<Item = StreamElement<I>>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[test]
fn capture_keeps_queue_order_and_drops_call_state() {
    use crate::handle::ResultSlot;
    use crate::queue::testing::*;
    use crate::queue::StreamElementQueue;
    use crate::queue::UnorderedQueue;

    let mut queue = UnorderedQueue::new(4);
    queue.try_put(record(0, "a")).unwrap();
    queue.try_put(watermark(1, 7)).unwrap();
    queue.try_put(record(2, "b")).unwrap();
    if let Some(entry) = queue.get_mut(2) {
        entry.retry.attempts = 3;
        entry.slot = ResultSlot::Completed(vec!["done"]);
    }

    let found = PendingElements::capture(queue.entries());
    assert_eq!(found.len(), 3);
    assert_eq!(found.record_count(), 2);
    let found: Vec<_> = found
        .into_iter()
        .map(|elem| match elem {
            StreamElement::Record(record) => record.value.to_owned(),
            StreamElement::Watermark(wm) => wm.timestamp().timestamp().to_string(),
        })
        .collect();
    assert_eq!(found, vec!["a", "7", "b"]);
}
