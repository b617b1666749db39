//! Checkpoint store which does nothing.

use super::CheckpointStore;
use crate::errors::RecoveryError;
use crate::recovery::model::*;

/// Writes are dropped and reads are the same as an empty store.
///
/// Use this when the stage runs without recovery; every restore then
/// starts with an empty queue.
#[derive(Debug, Default)]
pub struct NoOpStore;

impl NoOpStore {
    pub fn new() -> Self {
        NoOpStore {}
    }
}

impl CheckpointStore for NoOpStore {
    fn write(
        &mut self,
        _step_id: &StepId,
        _checkpoint: CheckpointId,
        _state: StateBytes,
    ) -> Result<(), RecoveryError> {
        Ok(())
    }

    fn read_latest(
        &mut self,
        _step_id: &StepId,
    ) -> Result<Option<(CheckpointId, StateBytes)>, RecoveryError> {
        Ok(None)
    }

    fn discard_before(
        &mut self,
        _step_id: &StepId,
        _before: CheckpointId,
    ) -> Result<usize, RecoveryError> {
        Ok(0)
    }
}

#[test]
fn noop_reads_nothing_back() {
    let mut store = NoOpStore::new();
    let step = StepId::new("op1");
    store
        .write(&step, CheckpointId(1), StateBytes(vec![1]))
        .unwrap();
    assert_eq!(store.read_latest(&step).unwrap(), None);
}
