//! Items that flow through the async wait stage.
//!
//! Upstream hands the stage [`StreamRecord`]s and [`Watermark`]s in
//! arrival order. Both kinds travel through the in-flight queue, so
//! both are represented as a [`StreamElement`] when they need to be
//! stored or snapshotted together.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Assertion that no more records with an event time before this
/// instant will arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Watermark(pub DateTime<Utc>);

impl Watermark {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self(at)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.0
    }
}

/// A single value and its optional event time.
///
/// Outputs produced for a record inherit its timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRecord<T> {
    pub value: T,
    pub timestamp: Option<DateTime<Utc>>,
}

impl<T> StreamRecord<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            timestamp: None,
        }
    }

    pub fn with_timestamp(value: T, timestamp: DateTime<Utc>) -> Self {
        Self {
            value,
            timestamp: Some(timestamp),
        }
    }

    /// Build a record for an output value, carrying over this
    /// record's event time.
    pub(crate) fn replace<R>(&self, value: R) -> StreamRecord<R> {
        StreamRecord {
            value,
            timestamp: self.timestamp,
        }
    }
}

/// Anything that occupies a slot in the in-flight queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamElement<T> {
    Record(StreamRecord<T>),
    Watermark(Watermark),
}

impl<T> StreamElement<T> {
    pub fn is_watermark(&self) -> bool {
        matches!(self, Self::Watermark(_))
    }
}

impl<T> From<StreamRecord<T>> for StreamElement<T> {
    fn from(record: StreamRecord<T>) -> Self {
        Self::Record(record)
    }
}

impl<T> From<Watermark> for StreamElement<T> {
    fn from(watermark: Watermark) -> Self {
        Self::Watermark(watermark)
    }
}

/// Out-of-band marker saying whether upstream is currently producing.
///
/// Status markers do not take part in ordering; the stage forwards
/// them as soon as they arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamStatus {
    Active,
    Idle,
}

#[test]
fn replace_keeps_timestamp() {
    use chrono::TimeZone;

    let at = Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap();
    let record = StreamRecord::with_timestamp("in", at);
    let found = record.replace(5);
    assert_eq!(found, StreamRecord::with_timestamp(5, at));
}
