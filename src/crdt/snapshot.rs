//! Compacted document snapshots.
//!
//! A snapshot discards history: tombstones and the operation log are
//! dropped, and the surviving characters are re-identified under a fresh
//! epoch replica with contiguous clocks `1..=n` in document order. Every
//! participant restoring from the same snapshot reconstructs bit-identical
//! element ids, so post-snapshot editing converges exactly as before.
//! Comment anchors are remapped into the epoch (via the nearest surviving
//! predecessor when the anchored element was deleted), never dropped.
//!
//! The wire form is bincode wrapped in lz4 with a prepended size, the same
//! envelope used for update frames.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::comments::{resolve_anchor, AnchorPoint, Comment, CommentOp, CommentSet};

use super::op::{OpId, ReplicaId};
use super::store::{StateVector, TextCrdt};

/// A compacted, self-contained image of a document and its discussion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Fresh replica id owning the reconstructed elements.
    pub epoch: ReplicaId,
    /// Live characters in document order.
    pub text: String,
    /// History folded into this snapshot. Restored stores adopt it so
    /// peers do not resend operations the snapshot already contains.
    pub state: StateVector,
    /// Comments with anchors remapped into the epoch.
    pub comments: Vec<Comment>,
}

impl Snapshot {
    /// Compact the current document state under a fresh epoch.
    pub fn capture(doc: &TextCrdt, comments: &CommentSet) -> Self {
        let epoch = Uuid::new_v4();
        let remap = |anchor: OpId| match resolve_anchor(doc, anchor) {
            AnchorPoint::Exact(pos) | AnchorPoint::Predecessor { pos, .. } => {
                OpId::new(epoch, (pos + 1) as u64)
            }
            AnchorPoint::Start => OpId::new(epoch, 1),
        };

        let remapped = comments
            .all()
            .into_iter()
            .map(|c| {
                let mut c = c.clone();
                c.anchor = remap(c.anchor);
                for reply in &mut c.replies {
                    reply.anchor = remap(reply.anchor);
                }
                c
            })
            .collect();

        Self {
            epoch,
            text: doc.materialize().to_string(),
            state: doc.state_vector().clone(),
            comments: remapped,
        }
    }

    /// Reconstruct a store and comment collection for `replica`.
    pub fn restore(&self, replica: ReplicaId) -> (TextCrdt, CommentSet) {
        let mut doc = TextCrdt::from_snapshot_text(replica, self.epoch, &self.text);
        doc.merge_state(&self.state);

        let mut comments = CommentSet::new();
        for comment in &self.comments {
            comments.apply(CommentOp::Add(comment.clone()));
        }
        (doc, comments)
    }

    /// Serialize to the compressed wire envelope.
    pub fn encode(&self) -> Result<Vec<u8>, SnapshotError> {
        let raw = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SnapshotError::Encode(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    /// Deserialize from the compressed wire envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| SnapshotError::Decompress(e.to_string()))?;
        let (snapshot, _) =
            bincode::serde::decode_from_slice(&raw, bincode::config::standard())
                .map_err(|e| SnapshotError::Decode(e.to_string()))?;
        Ok(snapshot)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    Encode(String),
    Decode(String),
    Decompress(String),
}

impl std::fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotError::Encode(e) => write!(f, "snapshot encode failed: {e}"),
            SnapshotError::Decode(e) => write!(f, "snapshot decode failed: {e}"),
            SnapshotError::Decompress(e) => write!(f, "snapshot decompress failed: {e}"),
        }
    }
}

impl std::error::Error for SnapshotError {}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn replica(n: u128) -> ReplicaId {
        Uuid::from_u128(n)
    }

    fn doc_with_history() -> TextCrdt {
        let mut doc = TextCrdt::new(replica(1));
        doc.local_insert(0, "Hello world");
        doc.local_delete(5, 6);
        doc.local_insert(5, "!");
        doc
    }

    #[test]
    fn test_capture_restore_preserves_text() {
        let doc = doc_with_history();
        let snap = Snapshot::capture(&doc, &CommentSet::new());
        assert_eq!(snap.text, "Hello!");

        let (restored, _) = snap.restore(replica(2));
        assert_eq!(restored.materialize(), "Hello!");
        assert_eq!(restored.len(), 6);
    }

    #[test]
    fn test_restored_replicas_share_element_ids() {
        let doc = doc_with_history();
        let snap = Snapshot::capture(&doc, &CommentSet::new());

        let (mut a, _) = snap.restore(replica(2));
        let (mut b, _) = snap.restore(replica(3));
        assert_eq!(a.element_id_at(0), b.element_id_at(0));

        // Fresh concurrent edits on restored stores still converge.
        let ops_a = a.local_insert(6, "?");
        let ops_b = b.local_insert(0, ">");
        a.apply_batch(ops_b);
        b.apply_batch(ops_a);
        assert_eq!(a.materialize(), b.materialize());
    }

    #[test]
    fn test_restored_state_covers_folded_history() {
        let doc = doc_with_history();
        let snap = Snapshot::capture(&doc, &CommentSet::new());
        let (restored, _) = snap.restore(replica(2));

        // The original author's ops are folded in; a delta from the
        // original store must be empty.
        assert!(doc.compute_delta(restored.state_vector()).is_empty());
    }

    #[test]
    fn test_live_anchor_remapped_to_same_position() {
        let mut doc = TextCrdt::new(replica(1));
        doc.local_insert(0, "abcdef");
        let anchor = doc.element_id_at(3).unwrap();

        let mut comments = CommentSet::new();
        let comment = Comment::new(Uuid::new_v4(), "here", anchor, 10);
        let id = comment.id;
        comments.apply(CommentOp::Add(comment));

        let snap = Snapshot::capture(&doc, &comments);
        let (restored, restored_comments) = snap.restore(replica(2));

        let new_anchor = restored_comments.get(&id).unwrap().anchor;
        assert_eq!(resolve_anchor(&restored, new_anchor), AnchorPoint::Exact(3));
    }

    #[test]
    fn test_degraded_anchor_remapped_to_predecessor_position() {
        let mut doc = TextCrdt::new(replica(1));
        doc.local_insert(0, "abcdef");
        let anchor = doc.element_id_at(3).unwrap();
        doc.local_delete(3, 1);

        let mut comments = CommentSet::new();
        let comment = Comment::new(Uuid::new_v4(), "was on d", anchor, 10);
        let id = comment.id;
        comments.apply(CommentOp::Add(comment));

        let snap = Snapshot::capture(&doc, &comments);
        let (restored, restored_comments) = snap.restore(replica(2));

        // The anchor landed on the predecessor "c", live in the snapshot.
        let new_anchor = restored_comments.get(&id).unwrap().anchor;
        assert_eq!(resolve_anchor(&restored, new_anchor), AnchorPoint::Exact(2));
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let doc = doc_with_history();
        let snap = Snapshot::capture(&doc, &CommentSet::new());

        let bytes = snap.encode().unwrap();
        let decoded = Snapshot::decode(&bytes).unwrap();
        assert_eq!(decoded, snap);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(Snapshot::decode(&[0xff, 0x01, 0x02]).is_err());
    }
}
