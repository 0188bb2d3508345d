//! Operation identifiers and the edit operations themselves.
//!
//! Every edit is an immutable `Operation` stamped with an `OpId` — the pair
//! of the authoring replica and that replica's clock at creation time.
//! `OpId`s are totally ordered by `(clock, replica)`, which gives every
//! replica the same tie-break verdict for concurrent inserts without any
//! coordination.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique identifier of a connected client instance.
pub type ReplicaId = Uuid;

/// Identity of a single operation: `(replica, clock)`.
///
/// The derived `Ord` compares `clock` first, then `replica`, so the total
/// order is identical on every replica regardless of delivery order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OpId {
    /// Lamport-style clock of the authoring replica at creation time.
    pub clock: u64,
    /// The authoring replica.
    pub replica: ReplicaId,
}

impl OpId {
    pub fn new(replica: ReplicaId, clock: u64) -> Self {
        Self { clock, replica }
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.clock, self.replica)
    }
}

/// An atomic edit to the shared document.
///
/// Operations are created once and never mutated. Causality is captured by
/// each `Insert` referencing the element id it was inserted after at
/// creation time (`origin`); a `Delete` references its target element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Insert a single character after `origin` (`None` = document start).
    Insert {
        id: OpId,
        origin: Option<OpId>,
        ch: char,
    },
    /// Tombstone the element created by `target`.
    Delete { id: OpId, target: OpId },
}

impl Operation {
    /// The operation's own identity.
    pub fn id(&self) -> OpId {
        match self {
            Operation::Insert { id, .. } => *id,
            Operation::Delete { id, .. } => *id,
        }
    }

    /// The operation this one cannot be applied without, if any.
    ///
    /// Inserts depend on their origin element; deletes on their target.
    pub fn dependency(&self) -> Option<OpId> {
        match self {
            Operation::Insert { origin, .. } => *origin,
            Operation::Delete { target, .. } => Some(*target),
        }
    }
}

/// A position change produced by applying operations, in visible (post-edit)
/// coordinates. Consumed by editor bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    Inserted { at: u64, len: u64 },
    Deleted { at: u64, len: u64 },
}
