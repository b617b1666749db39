//! Data model representing state in the recovery system.
//!
//! A checkpoint store is a K-V mapping from `(StepId, CheckpointId)`
//! to [`StateBytes`].

use std::any::type_name;
use std::fmt::Display;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::RecoveryError;

/// Unique ID for a step in a dataflow.
///
/// Recovery data is keyed off of this to ensure state is not mixed
/// between stages.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl Display for StepId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        fmt.write_str(&self.0)
    }
}

impl Default for StepId {
    fn default() -> Self {
        Self("async_wait".to_owned())
    }
}

/// Incrementing ID of a consistent snapshot barrier.
///
/// Assigned by whoever coordinates checkpoints; the stage only
/// records it alongside the snapshot.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointId(pub u64);

impl Display for CheckpointId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(fmt, "{}", self.0)
    }
}

/// A snapshot of state for a step.
///
/// The recovery system only deals in bytes so each stage can store
/// custom types without going through Rust generic gymnastics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateBytes(pub Vec<u8>);

impl StateBytes {
    /// Serialize this state object into bytes the recovery system can
    /// store.
    pub fn ser<T: Serialize>(obj: &T) -> Result<Self, RecoveryError> {
        let t_name = type_name::<T>();
        tracing::trace!("Serializing recovery state type {t_name}");
        Ok(Self(bincode::serialize(obj)?))
    }

    /// Deserialize these bytes from the recovery system into a state
    /// object.
    pub fn de<T: DeserializeOwned>(&self) -> Result<T, RecoveryError> {
        let t_name = type_name::<T>();
        tracing::trace!("Deserializing recovery state type {t_name}");
        Ok(bincode::deserialize(&self.0)?)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[test]
fn state_bytes_rejects_garbage() {
    let bytes = StateBytes(vec![0xff]);
    assert!(bytes.de::<Vec<String>>().is_err());
}
