//! Anchored discussion: comments, replies, and @mentions.
//!
//! Comments replicate the same way as document content — as an append-only
//! collection of `CommentOp`s shipped down the durable update channel — so
//! all replicas converge on the same threads even under concurrent
//! creation. Anchors are element ids, not raw offsets: a comment stays
//! attached to "the same character" through concurrent edits, and when the
//! anchored element is deleted the anchor degrades to the nearest surviving
//! preceding element.
//!
//! Convergence rules: adds are grow-only keyed by comment id, `resolved`
//! only ever flips false→true, and replies are deduplicated by id and kept
//! in `(timestamp, id)` order so every replica renders the same thread.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crdt::{OpId, TextCrdt};

/// A discussion entry anchored to a document element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub author: Uuid,
    pub content: String,
    /// Element id the comment is attached to.
    pub anchor: OpId,
    /// Creation time, milliseconds since the epoch.
    pub timestamp: u64,
    pub resolved: bool,
    pub replies: Vec<Comment>,
}

impl Comment {
    pub fn new(author: Uuid, content: impl Into<String>, anchor: OpId, timestamp: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            author,
            content: content.into(),
            anchor,
            timestamp,
            resolved: false,
            replies: Vec::new(),
        }
    }
}

/// A one-way notification record — not document content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mention {
    pub id: Uuid,
    pub from: Uuid,
    pub to: Uuid,
    pub content: String,
    pub anchor: OpId,
    pub timestamp: u64,
    pub read: bool,
}

impl Mention {
    pub fn new(
        from: Uuid,
        to: Uuid,
        content: impl Into<String>,
        anchor: OpId,
        timestamp: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            from,
            to,
            content: content.into(),
            anchor,
            timestamp,
            read: false,
        }
    }
}

/// Replicated mutation of the comment collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommentOp {
    Add(Comment),
    Resolve { id: Uuid },
    Reply { parent: Uuid, reply: Comment },
}

/// Where an anchor lands in the current materialized document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorPoint {
    /// The anchored element is live at this visible position.
    Exact(usize),
    /// The anchored element is gone; resolved to the nearest surviving
    /// preceding element.
    Predecessor { id: OpId, pos: usize },
    /// No surviving predecessor — start of document.
    Start,
}

impl AnchorPoint {
    /// The rendered position, regardless of degradation.
    pub fn position(&self) -> usize {
        match self {
            AnchorPoint::Exact(pos) => *pos,
            AnchorPoint::Predecessor { pos, .. } => *pos,
            AnchorPoint::Start => 0,
        }
    }
}

/// Resolve an anchor against the store, degrading gracefully.
pub fn resolve_anchor(doc: &TextCrdt, anchor: OpId) -> AnchorPoint {
    if let Some(pos) = doc.pos_of(anchor) {
        return AnchorPoint::Exact(pos);
    }
    if let Some(pred) = doc.nearest_live_at_or_before(anchor) {
        if let Some(pos) = doc.pos_of(pred) {
            return AnchorPoint::Predecessor { id: pred, pos };
        }
    }
    AnchorPoint::Start
}

/// The convergent comment collection.
///
/// Write-owned by the session; readers observe it through change events.
#[derive(Debug, Default)]
pub struct CommentSet {
    comments: HashMap<Uuid, Comment>,
    /// Resolves that arrived before their comment.
    pending_resolves: HashSet<Uuid>,
    /// Replies that arrived before their parent.
    pending_replies: HashMap<Uuid, Vec<Comment>>,
}

impl CommentSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a replicated mutation. Returns `true` if local state changed.
    ///
    /// Commutative and idempotent: out-of-order resolve/reply deliveries
    /// are parked until their comment arrives.
    pub fn apply(&mut self, op: CommentOp) -> bool {
        match op {
            CommentOp::Add(comment) => self.merge_comment(comment),
            CommentOp::Resolve { id } => match self.comments.get_mut(&id) {
                Some(c) if !c.resolved => {
                    c.resolved = true;
                    true
                }
                Some(_) => false,
                None => {
                    self.pending_resolves.insert(id);
                    false
                }
            },
            CommentOp::Reply { parent, reply } => match self.comments.get_mut(&parent) {
                Some(c) => Self::merge_reply(c, reply),
                None => {
                    self.pending_replies.entry(parent).or_default().push(reply);
                    false
                }
            },
        }
    }

    fn merge_comment(&mut self, incoming: Comment) -> bool {
        let id = incoming.id;
        let changed = match self.comments.get_mut(&id) {
            // Duplicate add (e.g. a catch-up dump): absorb monotonic state.
            Some(existing) => {
                let mut changed = false;
                if incoming.resolved && !existing.resolved {
                    existing.resolved = true;
                    changed = true;
                }
                for reply in incoming.replies {
                    changed |= Self::merge_reply(existing, reply);
                }
                changed
            }
            None => {
                self.comments.insert(id, incoming);
                true
            }
        };

        // Drain anything that was waiting on this comment.
        let mut drained = changed;
        if self.pending_resolves.remove(&id) {
            drained |= self.apply(CommentOp::Resolve { id });
        }
        if let Some(replies) = self.pending_replies.remove(&id) {
            for reply in replies {
                drained |= self.apply(CommentOp::Reply { parent: id, reply });
            }
        }
        drained
    }

    fn merge_reply(parent: &mut Comment, reply: Comment) -> bool {
        if parent.replies.iter().any(|r| r.id == reply.id) {
            return false;
        }
        let at = parent
            .replies
            .partition_point(|r| (r.timestamp, r.id) <= (reply.timestamp, reply.id));
        parent.replies.insert(at, reply);
        true
    }

    pub fn get(&self, id: &Uuid) -> Option<&Comment> {
        self.comments.get(id)
    }

    pub fn len(&self) -> usize {
        self.comments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comments.is_empty()
    }

    /// All comments in deterministic `(timestamp, id)` order.
    pub fn all(&self) -> Vec<&Comment> {
        let mut all: Vec<&Comment> = self.comments.values().collect();
        all.sort_by_key(|c| (c.timestamp, c.id));
        all
    }

    /// Full dump as idempotent `Add` ops, for catch-up sync of a peer that
    /// missed history. Resolved flags and replies are embedded.
    pub fn snapshot_ops(&self) -> Vec<CommentOp> {
        self.all()
            .into_iter()
            .map(|c| CommentOp::Add(c.clone()))
            .collect()
    }

    /// Rewrite every anchor through `f` — used when compaction replaces
    /// element ids; anchors are remapped, never dropped.
    pub fn remap_anchors(&mut self, f: impl Fn(OpId) -> OpId) {
        for comment in self.comments.values_mut() {
            comment.anchor = f(comment.anchor);
            for reply in &mut comment.replies {
                reply.anchor = f(reply.anchor);
            }
        }
    }
}
