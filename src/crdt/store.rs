//! The replicated text store: a causal list with tombstones.
//!
//! Elements form a list keyed by operation id. An insert is placed by
//! locating its origin element, then walking forward over any concurrent
//! insertions at that same origin, breaking ties by the total order on
//! `OpId` — all replicas converge on identical ordering regardless of
//! arrival order. Deletes tombstone their target in place, which keeps the
//! element referenceable for concurrent operations and comment anchors.
//!
//! The materialized string is maintained incrementally on every apply, so
//! `materialize()` is a cheap borrow and local edit latency stays
//! independent of history length.
//!
//! Out-of-order delivery is tolerated by buffering: an operation whose
//! dependency (insert origin, delete target) has not arrived yet is parked
//! until the dependency applies, then drained transitively.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::op::{ChangeEvent, OpId, Operation, ReplicaId};

/// Per-replica highest applied clock.
///
/// Used to compute the minimal set of operations a peer is missing: for
/// each replica, everything above the peer's entry is unknown to it.
/// Operations parked on a missing dependency are not counted here — they
/// are retained in the buffer, so a max-based summary never loses them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector(HashMap<ReplicaId, u64>);

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest applied clock from `replica` (0 = nothing seen).
    pub fn get(&self, replica: &ReplicaId) -> u64 {
        self.0.get(replica).copied().unwrap_or(0)
    }

    pub fn set(&mut self, replica: ReplicaId, clock: u64) {
        self.0.insert(replica, clock);
    }

    /// Whether this vector already covers the given operation id.
    pub fn covers(&self, id: &OpId) -> bool {
        id.clock <= self.get(&id.replica)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&ReplicaId, &u64)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Result of feeding a remote operation into the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The operation (and any buffered operations it unblocked) applied.
    /// Events are in apply order, in visible coordinates.
    Applied(Vec<ChangeEvent>),
    /// A dependency is missing; the operation is parked until it arrives.
    Buffered,
    /// Already applied — duplicate delivery is a no-op.
    Duplicate,
    /// Malformed; dropped with a logged integrity warning.
    Rejected,
}

/// One element of the causal list.
#[derive(Debug, Clone)]
struct Element {
    id: OpId,
    origin: Option<OpId>,
    ch: char,
    deleted: bool,
}

/// The convergent replicated text document.
///
/// Exclusively owned by its session; external callers mutate it only via
/// `local_insert`/`local_delete`/`apply_remote`.
pub struct TextCrdt {
    replica: ReplicaId,
    clock: u64,
    elements: Vec<Element>,
    /// Every operation id ever applied (inserts and deletes).
    applied: HashSet<OpId>,
    /// Max-based summary of `applied`.
    state: StateVector,
    /// Applied operations per replica, in clock order. Feeds delta sync.
    log: HashMap<ReplicaId, Vec<Operation>>,
    /// Operations parked on a missing dependency, keyed by that dependency.
    pending: HashMap<OpId, Vec<Operation>>,
    /// Materialized document, updated incrementally.
    text: String,
    visible: usize,
}

impl TextCrdt {
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            clock: 0,
            elements: Vec::new(),
            applied: HashSet::new(),
            state: StateVector::new(),
            log: HashMap::new(),
            pending: HashMap::new(),
            text: String::new(),
            visible: 0,
        }
    }

    /// Rebuild a store from compacted snapshot text: live characters only,
    /// fresh contiguous ids under the snapshot epoch, chained origins. The
    /// synthesized inserts are logged so late joiners can still delta-sync.
    pub(crate) fn from_snapshot_text(replica: ReplicaId, epoch: ReplicaId, text: &str) -> Self {
        let mut store = Self::new(replica);
        let mut origin: Option<OpId> = None;
        for (i, ch) in text.chars().enumerate() {
            let id = OpId::new(epoch, (i + 1) as u64);
            store.elements.push(Element {
                id,
                origin,
                ch,
                deleted: false,
            });
            store.applied.insert(id);
            store
                .log
                .entry(epoch)
                .or_default()
                .push(Operation::Insert { id, origin, ch });
            origin = Some(id);
        }
        store.visible = store.elements.len();
        store.state.set(epoch, store.elements.len() as u64);
        store.text = text.to_string();
        store
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// The materialized, linearized document.
    pub fn materialize(&self) -> &str {
        &self.text
    }

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.visible
    }

    pub fn is_empty(&self) -> bool {
        self.visible == 0
    }

    /// Current clock value (highest seen, local or remote).
    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Operations parked on missing dependencies.
    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    pub fn state_vector(&self) -> &StateVector {
        &self.state
    }

    /// Fold another vector in, keeping per-replica maxima. Used when
    /// restoring from a snapshot that already folded in remote history.
    pub(crate) fn merge_state(&mut self, other: &StateVector) {
        for (replica, clock) in other.entries() {
            if *clock > self.state.get(replica) {
                self.state.set(*replica, *clock);
            }
        }
    }

    // ── position / id mapping ────────────────────────────────────────

    /// Id of the visible character at `pos`.
    pub fn element_id_at(&self, pos: usize) -> Option<OpId> {
        let mut seen = 0usize;
        for e in &self.elements {
            if e.deleted {
                continue;
            }
            if seen == pos {
                return Some(e.id);
            }
            seen += 1;
        }
        None
    }

    /// Visible position of a live element; `None` if deleted or unknown.
    pub fn pos_of(&self, id: OpId) -> Option<usize> {
        let idx = self.find_index(id)?;
        if self.elements[idx].deleted {
            return None;
        }
        Some(self.visible_before(idx))
    }

    /// Whether the element exists at all (live or tombstoned).
    pub fn contains_element(&self, id: OpId) -> bool {
        self.find_index(id).is_some()
    }

    /// Whether the element is live. `None` if unknown.
    pub fn is_live(&self, id: OpId) -> Option<bool> {
        self.find_index(id).map(|i| !self.elements[i].deleted)
    }

    /// Nearest live element at or before the given element, walking left.
    /// Returns the element's own id when it is live.
    pub fn nearest_live_at_or_before(&self, id: OpId) -> Option<OpId> {
        let idx = self.find_index(id)?;
        self.elements[..=idx]
            .iter()
            .rev()
            .find(|e| !e.deleted)
            .map(|e| e.id)
    }

    // ── local edits ──────────────────────────────────────────────────

    /// Apply a local insertion, returning the operations to ship.
    ///
    /// Positions beyond the end are clamped. Always succeeds locally.
    pub fn local_insert(&mut self, pos: usize, text: &str) -> Vec<Operation> {
        let pos = pos.min(self.visible);
        let mut origin = if pos == 0 {
            None
        } else {
            self.element_id_at(pos - 1)
        };

        let mut ops = Vec::with_capacity(text.chars().count());
        for ch in text.chars() {
            self.clock += 1;
            let id = OpId::new(self.replica, self.clock);
            let op = Operation::Insert { id, origin, ch };
            self.integrate_insert(id, origin, ch);
            self.record_applied(&op);
            ops.push(op);
            origin = Some(id);
        }
        ops
    }

    /// Apply a local deletion of `len` visible characters starting at `pos`.
    pub fn local_delete(&mut self, pos: usize, len: usize) -> Vec<Operation> {
        let targets: Vec<OpId> = (pos..pos + len)
            .map_while(|p| self.element_id_at(p))
            .collect();

        let mut ops = Vec::with_capacity(targets.len());
        for target in targets {
            self.clock += 1;
            let id = OpId::new(self.replica, self.clock);
            let op = Operation::Delete { id, target };
            self.integrate_delete(target);
            self.record_applied(&op);
            ops.push(op);
        }
        ops
    }

    // ── remote application ───────────────────────────────────────────

    /// Merge a remote operation.
    ///
    /// Commutative for concurrent operations, idempotent for duplicates.
    /// Malformed operations are dropped with a warning and never corrupt
    /// materialized state.
    pub fn apply_remote(&mut self, op: Operation) -> ApplyOutcome {
        let id = op.id();
        if self.applied.contains(&id) {
            return ApplyOutcome::Duplicate;
        }
        if !self.validate(&op) {
            log::warn!("dropping malformed operation {id}");
            return ApplyOutcome::Rejected;
        }
        if let Some(dep) = op.dependency() {
            if !self.contains_element(dep) {
                log::debug!("buffering {id}: dependency {dep} not yet delivered");
                self.pending.entry(dep).or_default().push(op);
                return ApplyOutcome::Buffered;
            }
        }

        let mut events = Vec::new();
        let mut worklist = vec![op];
        while let Some(op) = worklist.pop() {
            let id = op.id();
            if self.applied.contains(&id) {
                continue;
            }
            match op {
                Operation::Insert { id, origin, ch } => {
                    events.push(self.integrate_insert(id, origin, ch));
                }
                Operation::Delete { target, .. } => {
                    if let Some(ev) = self.integrate_delete(target) {
                        events.push(ev);
                    }
                }
            }
            self.record_applied(&op);
            // Drain anything that was waiting on this operation's element.
            if let Some(waiters) = self.pending.remove(&id) {
                worklist.extend(waiters);
            }
        }
        ApplyOutcome::Applied(events)
    }

    /// Apply a batch in order, collecting visible change events.
    pub fn apply_batch(&mut self, ops: Vec<Operation>) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        for op in ops {
            if let ApplyOutcome::Applied(mut ev) = self.apply_remote(op) {
                events.append(&mut ev);
            }
        }
        events
    }

    // ── delta sync ───────────────────────────────────────────────────

    /// Operations the peer lacks, per its state vector. Per-replica output
    /// is in clock order (FIFO per source); cross-replica order is not
    /// significant — the receiver buffers out-of-order dependencies.
    pub fn compute_delta(&self, peer: &StateVector) -> Vec<Operation> {
        let mut delta = Vec::new();
        for (replica, ops) in &self.log {
            let known = peer.get(replica);
            let mut missing: Vec<Operation> = ops
                .iter()
                .filter(|op| op.id().clock > known)
                .cloned()
                .collect();
            missing.sort_by_key(|op| op.id().clock);
            delta.extend(missing);
        }
        delta
    }

    // ── internals ────────────────────────────────────────────────────

    fn validate(&self, op: &Operation) -> bool {
        let id = op.id();
        if id.clock == 0 {
            return false;
        }
        match op {
            Operation::Insert { origin, .. } => *origin != Some(id),
            Operation::Delete { target, .. } => *target != id,
        }
    }

    fn find_index(&self, id: OpId) -> Option<usize> {
        self.elements.iter().position(|e| e.id == id)
    }

    fn visible_before(&self, idx: usize) -> usize {
        self.elements[..idx].iter().filter(|e| !e.deleted).count()
    }

    /// Place an insert: start after the origin, walk forward over any
    /// concurrent insertions at the same origin (and their subtrees),
    /// with larger ids taking placement priority.
    fn integrate_insert(&mut self, id: OpId, origin: Option<OpId>, ch: char) -> ChangeEvent {
        let origin_idx: isize = match origin {
            None => -1,
            // Dependency presence is guaranteed by the buffering in
            // apply_remote; a miss here would mean corrupted state.
            Some(o) => self.find_index(o).map(|i| i as isize).unwrap_or(-1),
        };

        let mut i = (origin_idx + 1) as usize;
        while i < self.elements.len() {
            let e = &self.elements[i];
            let e_origin_idx: isize = match e.origin {
                None => -1,
                Some(o) => self.find_index(o).map(|x| x as isize).unwrap_or(-1),
            };
            if e_origin_idx < origin_idx {
                // Left the origin's region entirely.
                break;
            }
            if e_origin_idx == origin_idx {
                // Concurrent sibling at the same origin: the larger id
                // keeps placement priority, so skip it (and its subtree,
                // which the `>` branch below walks over).
                if e.id > id {
                    i += 1;
                } else {
                    break;
                }
            } else {
                // Inside a preceding sibling's subtree.
                i += 1;
            }
        }

        let at = self.visible_before(i);
        self.elements.insert(
            i,
            Element {
                id,
                origin,
                ch,
                deleted: false,
            },
        );
        let byte = self
            .text
            .char_indices()
            .nth(at)
            .map(|(b, _)| b)
            .unwrap_or(self.text.len());
        self.text.insert(byte, ch);
        self.visible += 1;
        ChangeEvent::Inserted {
            at: at as u64,
            len: 1,
        }
    }

    /// Tombstone a target. Idempotent: re-deleting a tombstone is a no-op.
    fn integrate_delete(&mut self, target: OpId) -> Option<ChangeEvent> {
        let idx = self.find_index(target)?;
        if self.elements[idx].deleted {
            return None;
        }
        let at = self.visible_before(idx);
        let Some((byte, _)) = self.text.char_indices().nth(at) else {
            log::error!("text buffer out of sync with element list at {at}");
            return None;
        };
        self.elements[idx].deleted = true;
        self.text.remove(byte);
        self.visible -= 1;
        Some(ChangeEvent::Deleted {
            at: at as u64,
            len: 1,
        })
    }

    fn record_applied(&mut self, op: &Operation) {
        let id = op.id();
        self.applied.insert(id);
        self.clock = self.clock.max(id.clock);
        self.log.entry(id.replica).or_default().push(op.clone());
        self.advance_state(id);
    }

    fn advance_state(&mut self, id: OpId) {
        if id.clock > self.state.get(&id.replica) {
            self.state.set(id.replica, id.clock);
        }
    }
}
