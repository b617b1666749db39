//! Implementation of an in-memory checkpoint store.
//!
//! Useful for tests and for embedding the stage in a process that
//! handles durability some other way.

use std::collections::BTreeMap;
use std::collections::HashMap;

use super::CheckpointStore;
use crate::errors::RecoveryError;
use crate::recovery::model::*;

/// A checkpoint store with all data in memory.
#[derive(Debug, Default)]
pub struct InMemStore {
    db: HashMap<StepId, BTreeMap<CheckpointId, StateBytes>>,
}

impl InMemStore {
    pub fn new() -> Self {
        Self { db: HashMap::new() }
    }

    /// Number of snapshots kept for a step.
    pub fn snapshot_count(&self, step_id: &StepId) -> usize {
        self.db.get(step_id).map(BTreeMap::len).unwrap_or(0)
    }
}

impl CheckpointStore for InMemStore {
    fn write(
        &mut self,
        step_id: &StepId,
        checkpoint: CheckpointId,
        state: StateBytes,
    ) -> Result<(), RecoveryError> {
        tracing::trace!("Writing {} bytes for {step_id} at checkpoint {checkpoint}", state.len());
        self.db
            .entry(step_id.clone())
            .or_default()
            .insert(checkpoint, state);
        Ok(())
    }

    fn read_latest(
        &mut self,
        step_id: &StepId,
    ) -> Result<Option<(CheckpointId, StateBytes)>, RecoveryError> {
        Ok(self.db.get(step_id).and_then(|snaps| {
            snaps
                .iter()
                .next_back()
                .map(|(checkpoint, state)| (*checkpoint, state.clone()))
        }))
    }

    fn discard_before(
        &mut self,
        step_id: &StepId,
        before: CheckpointId,
    ) -> Result<usize, RecoveryError> {
        let Some(snaps) = self.db.get_mut(step_id) else {
            return Ok(0);
        };
        // [`BTreeMap::split_off`] returns the "high end" / not
        // garbage, so swap it back in.
        let keep = snaps.split_off(&before);
        let garbage = std::mem::replace(snaps, keep);
        if snaps.is_empty() {
            self.db.remove(step_id);
        }
        Ok(garbage.len())
    }
}

#[test]
fn read_latest_picks_newest() {
    let mut store = InMemStore::new();
    let step = StepId::new("op1");

    store
        .write(&step, CheckpointId(5), StateBytes(vec![5]))
        .unwrap();
    store
        .write(&step, CheckpointId(10), StateBytes(vec![10]))
        .unwrap();
    store
        .write(&step, CheckpointId(6), StateBytes(vec![6]))
        .unwrap();

    let found = store.read_latest(&step).unwrap();
    let expected = Some((CheckpointId(10), StateBytes(vec![10])));
    assert_eq!(found, expected);
}

#[test]
fn read_latest_is_per_step() {
    let mut store = InMemStore::new();

    store
        .write(&StepId::new("op1"), CheckpointId(1), StateBytes(vec![1]))
        .unwrap();

    let found = store.read_latest(&StepId::new("op2")).unwrap();
    assert_eq!(found, None);
}

#[test]
fn write_overwrites() {
    let mut store = InMemStore::new();
    let step = StepId::new("op1");

    store
        .write(&step, CheckpointId(1), StateBytes(vec![1]))
        .unwrap();
    store
        .write(&step, CheckpointId(1), StateBytes(vec![2]))
        .unwrap();

    assert_eq!(store.snapshot_count(&step), 1);
    let found = store.read_latest(&step).unwrap();
    assert_eq!(found, Some((CheckpointId(1), StateBytes(vec![2]))));
}

#[test]
fn discard_before_keeps_newer() {
    let mut store = InMemStore::new();
    let step = StepId::new("op1");

    for checkpoint in 1..=4 {
        store
            .write(&step, CheckpointId(checkpoint), StateBytes(vec![]))
            .unwrap();
    }

    let found = store.discard_before(&step, CheckpointId(3)).unwrap();
    assert_eq!(found, 2);
    assert_eq!(store.snapshot_count(&step), 2);
    assert_eq!(
        store.read_latest(&step).unwrap().map(|(id, _)| id),
        Some(CheckpointId(4))
    );
}

#[test]
fn discard_before_drops_unused_steps() {
    let mut store = InMemStore::new();
    let step = StepId::new("op1");

    store
        .write(&step, CheckpointId(1), StateBytes(vec![]))
        .unwrap();
    store.discard_before(&step, CheckpointId(7)).unwrap();

    assert!(store.db.is_empty());
}
