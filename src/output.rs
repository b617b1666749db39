//! Where the stage hands its results.

use crate::element::StreamElement;
use crate::element::StreamRecord;
use crate::element::StreamStatus;
use crate::element::Watermark;

/// Downstream of the async wait stage.
///
/// Called only from the driver's thread, in emission order.
pub trait Output<O> {
    fn collect(&mut self, record: StreamRecord<O>);

    fn emit_watermark(&mut self, watermark: Watermark);

    /// Status markers bypass the queue. Ignored unless overridden.
    fn emit_status(&mut self, _status: StreamStatus) {}
}

impl<O, T> Output<O> for &mut T
where
    T: Output<O> + ?Sized,
{
    fn collect(&mut self, record: StreamRecord<O>) {
        (**self).collect(record)
    }

    fn emit_watermark(&mut self, watermark: Watermark) {
        (**self).emit_watermark(watermark)
    }

    fn emit_status(&mut self, status: StreamStatus) {
        (**self).emit_status(status)
    }
}

/// Keeps everything emitted in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectingOutput<O> {
    pub elements: Vec<StreamElement<O>>,
    pub statuses: Vec<StreamStatus>,
}

impl<O> Default for CollectingOutput<O> {
    fn default() -> Self {
        Self {
            elements: Vec::new(),
            statuses: Vec::new(),
        }
    }
}

impl<O> CollectingOutput<O> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emitted record values, in order, skipping watermarks.
    pub fn values(&self) -> Vec<&O> {
        self.records().map(|record| &record.value).collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &StreamRecord<O>> {
        self.elements.iter().filter_map(|elem| match elem {
            StreamElement::Record(record) => Some(record),
            StreamElement::Watermark(_) => None,
        })
    }

    pub fn watermarks(&self) -> Vec<Watermark> {
        self.elements
            .iter()
            .filter_map(|elem| match elem {
                StreamElement::Watermark(wm) => Some(*wm),
                StreamElement::Record(_) => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

impl<O> Output<O> for CollectingOutput<O> {
    fn collect(&mut self, record: StreamRecord<O>) {
        self.elements.push(StreamElement::Record(record));
    }

    fn emit_watermark(&mut self, watermark: Watermark) {
        self.elements.push(StreamElement::Watermark(watermark));
    }

    fn emit_status(&mut self, status: StreamStatus) {
        self.statuses.push(status);
    }
}
