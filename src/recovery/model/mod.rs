//! The data model for recovery.
//!
//! [`state`] holds the keys and opaque bytes every store deals in;
//! [`pending`] is what the async wait stage puts in those bytes.

pub(crate) mod pending;
pub(crate) mod state;

// Re-export so you can get the whole model at once.

pub use pending::*;
pub use state::*;
