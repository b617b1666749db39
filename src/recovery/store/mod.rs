//! Implementations of checkpoint stores.
//!
//! A store is modeled as a K-V table keyed by `(StepId,
//! CheckpointId)`. Stages only ever need the newest checkpoint back,
//! so that's the only read a store must support; older checkpoints
//! are garbage once a newer one is durable.

use crate::errors::RecoveryError;
use crate::recovery::model::*;

pub(crate) mod in_mem;
pub(crate) mod noop;
pub(crate) mod sqlite;

/// All checkpoint stores have to implement this.
pub trait CheckpointStore {
    /// Durably save the snapshot of a step at a checkpoint.
    ///
    /// Writing the same key twice overwrites.
    fn write(
        &mut self,
        step_id: &StepId,
        checkpoint: CheckpointId,
        state: StateBytes,
    ) -> Result<(), RecoveryError>;

    /// Load the snapshot with the greatest checkpoint ID for a step,
    /// if any.
    fn read_latest(
        &mut self,
        step_id: &StepId,
    ) -> Result<Option<(CheckpointId, StateBytes)>, RecoveryError>;

    /// Delete all snapshots of a step older than a checkpoint.
    ///
    /// Returns how many were deleted.
    fn discard_before(
        &mut self,
        step_id: &StepId,
        before: CheckpointId,
    ) -> Result<usize, RecoveryError>;
}

impl<S> CheckpointStore for Box<S>
where
    S: CheckpointStore + ?Sized,
{
    fn write(
        &mut self,
        step_id: &StepId,
        checkpoint: CheckpointId,
        state: StateBytes,
    ) -> Result<(), RecoveryError> {
        (**self).write(step_id, checkpoint, state)
    }

    fn read_latest(
        &mut self,
        step_id: &StepId,
    ) -> Result<Option<(CheckpointId, StateBytes)>, RecoveryError> {
        (**self).read_latest(step_id)
    }

    fn discard_before(
        &mut self,
        step_id: &StepId,
        before: CheckpointId,
    ) -> Result<usize, RecoveryError> {
        (**self).discard_before(step_id, before)
    }
}
