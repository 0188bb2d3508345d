//! The replicated document store and its merge engine.
//!
//! Split into the operation vocabulary (`op`), the convergent store with
//! delta sync (`store`), and history compaction (`snapshot`).

mod op;
mod snapshot;
mod store;

pub use op::{ChangeEvent, OpId, Operation, ReplicaId};
pub use snapshot::{Snapshot, SnapshotError};
pub use store::{ApplyOutcome, StateVector, TextCrdt};
