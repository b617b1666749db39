//! What the async wait stage snapshots.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

use super::state::StateBytes;
use crate::element::StreamElement;
use crate::errors::RecoveryError;

/// The original input payloads still in the stage's queue, in queue
/// order.
///
/// This is the whole snapshot. In-flight call state, attempt counts
/// and partial results are deliberately absent: everything here is
/// re-invoked from scratch on restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingElements<T>(pub Vec<StreamElement<T>>);

impl<T> PendingElements<T> {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of records, ignoring watermarks.
    pub fn record_count(&self) -> usize {
        self.0.iter().filter(|elem| !elem.is_watermark()).count()
    }
}

impl<T> PendingElements<T>
where
    T: Serialize,
{
    pub fn to_state_bytes(&self) -> Result<StateBytes, RecoveryError> {
        StateBytes::ser(self)
    }
}

impl<T> PendingElements<T>
where
    T: DeserializeOwned,
{
    pub fn from_state_bytes(bytes: &StateBytes) -> Result<Self, RecoveryError> {
        bytes.de()
    }
}

impl<T> IntoIterator for PendingElements<T> {
    type Item = StreamElement<T>;

    type IntoIter = std::vec::IntoIter<StreamElement<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[test]
fn pending_elements_keep_order_through_bytes() {
    use crate::element::StreamRecord;
    use crate::element::Watermark;
    use chrono::TimeZone;
    use chrono::Utc;

    let wm = Watermark(Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap());
    let pending = PendingElements(vec![
        StreamElement::Record(StreamRecord::new("a".to_owned())),
        StreamElement::Watermark(wm),
        StreamElement::Record(StreamRecord::new("b".to_owned())),
    ]);

    let bytes = pending.to_state_bytes().unwrap();
    let found = PendingElements::<String>::from_state_bytes(&bytes).unwrap();
    assert_eq!(found, pending);
    assert_eq!(found.record_count(), 2);
}
