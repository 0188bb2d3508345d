//! Presence channel for real-time cursor & selection awareness.
//!
//! Presence is ephemeral, last-write-wins state — it never touches the
//! document history. Each replica broadcasts its own `PresenceState`
//! (debounced), refreshes liveness with periodic heartbeats, and tracks
//! remote peers in a `PresenceMap`. Peers that stop heartbeating are
//! evicted locally after twice the heartbeat interval, so a peer that
//! vanished without a clean `Leave` still disappears from every observer.
//!
//! ```text
//! Local cursor move
//!       │
//!       ▼
//! PresenceMap::update_local()   (debounced: 100ms)
//!       │
//!       ▼
//! AwarenessUpdate::State { … }
//!       │   (non-durable broadcast)
//!       ▼
//! Remote PresenceMap::handle()  (LWW by sequence number)
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::crdt::ReplicaId;

/// Default debounce between cursor/selection broadcasts.
pub const DEBOUNCE_INTERVAL: Duration = Duration::from_millis(100);
/// Default heartbeat period.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// A selection range in visible character coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: u64,
    pub head: u64,
}

/// What one participant currently looks like to everyone else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    pub user_id: Uuid,
    pub name: String,
    /// RGBA, stable per user id.
    pub color: [f32; 4],
    /// Cursor position in visible characters, `None` = no cursor shown.
    pub cursor: Option<u64>,
    pub selection: Option<Selection>,
}

impl PresenceState {
    pub fn new(user_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            user_id,
            name: name.into(),
            color: stable_color(user_id),
            cursor: None,
            selection: None,
        }
    }
}

/// Stable, visually distinct RGBA color derived from a user id.
pub fn stable_color(id: Uuid) -> [f32; 4] {
    let hash = id.as_u128();
    let hue = ((hash % 360) as f32) / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    [r, g, b, 1.0]
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Awareness messages sent on the non-durable path.
///
/// Carried inside `SyncMessage::Awareness` payloads. `seq` is a per-replica
/// monotonic counter: receivers apply last-write-wins by sequence, so
/// reordered deliveries cannot resurrect stale cursors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AwarenessUpdate {
    /// Announce presence with full state.
    Join {
        replica: ReplicaId,
        state: PresenceState,
    },
    /// Cursor/selection change (debounced at the sender).
    State {
        replica: ReplicaId,
        state: PresenceState,
        seq: u64,
    },
    /// Liveness refresh; carries no state change.
    Heartbeat { replica: ReplicaId, seq: u64 },
    /// Clean departure.
    Leave { replica: ReplicaId },
}

impl AwarenessUpdate {
    pub fn replica(&self) -> ReplicaId {
        match self {
            AwarenessUpdate::Join { replica, .. } => *replica,
            AwarenessUpdate::State { replica, .. } => *replica,
            AwarenessUpdate::Heartbeat { replica, .. } => *replica,
            AwarenessUpdate::Leave { replica } => *replica,
        }
    }

    /// Encode to binary (bincode).
    pub fn encode(&self) -> Result<Vec<u8>, String> {
        bincode::serde::encode_to_vec(self, bincode::config::standard()).map_err(|e| e.to_string())
    }

    /// Decode from binary.
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| e.to_string())?;
        Ok(msg)
    }
}

/// A remote participant as tracked locally.
#[derive(Debug, Clone)]
pub struct PeerPresence {
    pub state: PresenceState,
    /// Highest sequence number applied for this peer.
    seq: u64,
    /// Last time any message arrived from this peer.
    last_seen: Instant,
}

impl PeerPresence {
    pub fn idle_for(&self) -> Duration {
        self.last_seen.elapsed()
    }
}

/// Observable change to the participant list or a peer's state.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    Joined(ReplicaId),
    Updated(ReplicaId),
    Left(ReplicaId),
    /// Removed locally after missing heartbeats.
    Evicted(ReplicaId),
}

/// Tracks all remote participants of a document.
///
/// Owns the local debounce and the per-peer liveness bookkeeping. The
/// session drives it: broadcasts whatever the update methods return and
/// calls `evict_stale` on a timer.
pub struct PresenceMap {
    local: ReplicaId,
    local_state: PresenceState,
    /// Outgoing sequence counter.
    seq: u64,
    peers: HashMap<ReplicaId, PeerPresence>,
    last_broadcast: Instant,
    debounce: Duration,
    heartbeat: Duration,
    /// Set when an update was swallowed by the debounce; the trailing
    /// flush timer picks it up so the final cursor position always ships.
    dirty: bool,
}

impl PresenceMap {
    pub fn new(local: ReplicaId, local_state: PresenceState) -> Self {
        Self::with_intervals(local, local_state, DEBOUNCE_INTERVAL, HEARTBEAT_INTERVAL)
    }

    /// Custom intervals, used by sessions with tuned configs and by tests.
    pub fn with_intervals(
        local: ReplicaId,
        local_state: PresenceState,
        debounce: Duration,
        heartbeat: Duration,
    ) -> Self {
        Self {
            local,
            local_state,
            seq: 0,
            peers: HashMap::new(),
            // Allow an immediate first broadcast.
            last_broadcast: Instant::now() - DEBOUNCE_INTERVAL,
            debounce,
            heartbeat,
            dirty: false,
        }
    }

    pub fn local_replica(&self) -> ReplicaId {
        self.local
    }

    pub fn local_state(&self) -> &PresenceState {
        &self.local_state
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat
    }

    /// The announcement to broadcast when joining.
    pub fn join_update(&self) -> AwarenessUpdate {
        AwarenessUpdate::Join {
            replica: self.local,
            state: self.local_state.clone(),
        }
    }

    /// The clean-departure broadcast.
    pub fn leave_update(&self) -> AwarenessUpdate {
        AwarenessUpdate::Leave {
            replica: self.local,
        }
    }

    /// Record a local cursor/selection change.
    ///
    /// Debounced: returns `None` when a broadcast went out too recently,
    /// in which case the state is kept and `flush_pending` will ship it.
    pub fn update_local(&mut self, cursor: Option<u64>, selection: Option<Selection>) -> Option<AwarenessUpdate> {
        self.local_state.cursor = cursor;
        self.local_state.selection = selection;

        if self.last_broadcast.elapsed() < self.debounce {
            self.dirty = true;
            return None;
        }
        Some(self.emit_state())
    }

    /// Ship a debounce-swallowed update, if any.
    pub fn flush_pending(&mut self) -> Option<AwarenessUpdate> {
        if !self.dirty {
            return None;
        }
        Some(self.emit_state())
    }

    fn emit_state(&mut self) -> AwarenessUpdate {
        self.seq += 1;
        self.last_broadcast = Instant::now();
        self.dirty = false;
        AwarenessUpdate::State {
            replica: self.local,
            state: self.local_state.clone(),
            seq: self.seq,
        }
    }

    /// The periodic liveness refresh.
    pub fn heartbeat_update(&mut self) -> AwarenessUpdate {
        self.seq += 1;
        AwarenessUpdate::Heartbeat {
            replica: self.local,
            seq: self.seq,
        }
    }

    /// Merge an incoming awareness message. Self-echoes are ignored.
    pub fn handle(&mut self, msg: &AwarenessUpdate) -> Option<PresenceEvent> {
        let replica = msg.replica();
        if replica == self.local {
            return None;
        }

        match msg {
            AwarenessUpdate::Join { state, .. } => {
                let known = self.peers.contains_key(&replica);
                self.peers.insert(
                    replica,
                    PeerPresence {
                        state: state.clone(),
                        seq: 0,
                        last_seen: Instant::now(),
                    },
                );
                Some(if known {
                    PresenceEvent::Updated(replica)
                } else {
                    PresenceEvent::Joined(replica)
                })
            }

            AwarenessUpdate::State { state, seq, .. } => match self.peers.get_mut(&replica) {
                Some(peer) => {
                    peer.last_seen = Instant::now();
                    // Reordered older update: refresh liveness only.
                    if *seq < peer.seq {
                        return None;
                    }
                    peer.seq = *seq;
                    peer.state = state.clone();
                    Some(PresenceEvent::Updated(replica))
                }
                // State from a peer whose Join we missed: treat as a join.
                None => {
                    self.peers.insert(
                        replica,
                        PeerPresence {
                            state: state.clone(),
                            seq: *seq,
                            last_seen: Instant::now(),
                        },
                    );
                    Some(PresenceEvent::Joined(replica))
                }
            },

            AwarenessUpdate::Heartbeat { seq, .. } => {
                if let Some(peer) = self.peers.get_mut(&replica) {
                    peer.last_seen = Instant::now();
                    peer.seq = peer.seq.max(*seq);
                }
                None
            }

            AwarenessUpdate::Leave { .. } => self
                .peers
                .remove(&replica)
                .map(|_| PresenceEvent::Left(replica)),
        }
    }

    /// Remove peers silent for more than twice the heartbeat interval.
    pub fn evict_stale(&mut self) -> Vec<PresenceEvent> {
        let timeout = self.heartbeat * 2;
        let stale: Vec<ReplicaId> = self
            .peers
            .iter()
            .filter(|(_, p)| p.idle_for() > timeout)
            .map(|(id, _)| *id)
            .collect();

        stale
            .into_iter()
            .map(|id| {
                self.peers.remove(&id);
                log::debug!("evicting silent peer {id}");
                PresenceEvent::Evicted(id)
            })
            .collect()
    }

    pub fn peer(&self, replica: &ReplicaId) -> Option<&PeerPresence> {
        self.peers.get(replica)
    }

    pub fn peers(&self) -> &HashMap<ReplicaId, PeerPresence> {
        &self.peers
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// All remote states, for rendering participant lists.
    pub fn participants(&self) -> Vec<&PresenceState> {
        self.peers.values().map(|p| &p.state).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn replica(n: u128) -> ReplicaId {
        Uuid::from_u128(n)
    }

    fn map_for(n: u128) -> PresenceMap {
        let state = PresenceState::new(Uuid::from_u128(n + 100), format!("user-{n}"));
        PresenceMap::new(replica(n), state)
    }

    fn state_from(n: u128, cursor: u64) -> PresenceState {
        let mut s = PresenceState::new(Uuid::from_u128(n + 100), format!("user-{n}"));
        s.cursor = Some(cursor);
        s
    }

    #[test]
    fn test_stable_color_deterministic() {
        let id = Uuid::from_u128(77);
        assert_eq!(stable_color(id), stable_color(id));
        let [r, g, b, a] = stable_color(id);
        assert!((0.0..=1.0).contains(&r));
        assert!((0.0..=1.0).contains(&g));
        assert!((0.0..=1.0).contains(&b));
        assert_eq!(a, 1.0);
    }

    #[test]
    fn test_awareness_update_roundtrip() {
        let msg = AwarenessUpdate::State {
            replica: replica(1),
            state: state_from(1, 42),
            seq: 7,
        };
        let decoded = AwarenessUpdate::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(msg, decoded);
        assert_eq!(decoded.replica(), replica(1));
    }

    #[test]
    fn test_join_then_update() {
        let mut map = map_for(1);
        let joined = map.handle(&AwarenessUpdate::Join {
            replica: replica(2),
            state: state_from(2, 0),
        });
        assert_eq!(joined, Some(PresenceEvent::Joined(replica(2))));
        assert_eq!(map.peer_count(), 1);

        let updated = map.handle(&AwarenessUpdate::State {
            replica: replica(2),
            state: state_from(2, 5),
            seq: 1,
        });
        assert_eq!(updated, Some(PresenceEvent::Updated(replica(2))));
        assert_eq!(map.peer(&replica(2)).unwrap().state.cursor, Some(5));
    }

    #[test]
    fn test_ignores_own_echo() {
        let mut map = map_for(1);
        let echo = map.handle(&AwarenessUpdate::Join {
            replica: replica(1),
            state: state_from(1, 0),
        });
        assert_eq!(echo, None);
        assert_eq!(map.peer_count(), 0);
    }

    #[test]
    fn test_stale_seq_rejected() {
        let mut map = map_for(1);
        map.handle(&AwarenessUpdate::Join {
            replica: replica(2),
            state: state_from(2, 0),
        });
        map.handle(&AwarenessUpdate::State {
            replica: replica(2),
            state: state_from(2, 9),
            seq: 5,
        });
        // Reordered older update must not win.
        map.handle(&AwarenessUpdate::State {
            replica: replica(2),
            state: state_from(2, 3),
            seq: 2,
        });
        assert_eq!(map.peer(&replica(2)).unwrap().state.cursor, Some(9));
    }

    #[test]
    fn test_state_from_unknown_peer_is_join() {
        let mut map = map_for(1);
        let ev = map.handle(&AwarenessUpdate::State {
            replica: replica(3),
            state: state_from(3, 1),
            seq: 1,
        });
        assert_eq!(ev, Some(PresenceEvent::Joined(replica(3))));
    }

    #[test]
    fn test_leave_removes_peer() {
        let mut map = map_for(1);
        map.handle(&AwarenessUpdate::Join {
            replica: replica(2),
            state: state_from(2, 0),
        });
        let ev = map.handle(&AwarenessUpdate::Leave {
            replica: replica(2),
        });
        assert_eq!(ev, Some(PresenceEvent::Left(replica(2))));
        assert_eq!(map.peer_count(), 0);

        // Duplicate leave is a no-op.
        let ev = map.handle(&AwarenessUpdate::Leave {
            replica: replica(2),
        });
        assert_eq!(ev, None);
    }

    #[test]
    fn test_debounce_swallows_then_flushes() {
        let mut map = PresenceMap::with_intervals(
            replica(1),
            state_from(1, 0),
            Duration::from_millis(50),
            HEARTBEAT_INTERVAL,
        );

        // First goes out, immediate second is swallowed.
        assert!(map.update_local(Some(1), None).is_some());
        assert!(map.update_local(Some(2), None).is_none());

        // Trailing flush ships the latest state.
        let flushed = map.flush_pending().unwrap();
        match flushed {
            AwarenessUpdate::State { state, .. } => assert_eq!(state.cursor, Some(2)),
            other => panic!("expected State, got {other:?}"),
        }
        assert!(map.flush_pending().is_none());
    }

    #[test]
    fn test_debounce_allows_after_interval() {
        let mut map = PresenceMap::with_intervals(
            replica(1),
            state_from(1, 0),
            Duration::from_millis(5),
            HEARTBEAT_INTERVAL,
        );
        assert!(map.update_local(Some(1), None).is_some());
        thread::sleep(Duration::from_millis(10));
        assert!(map.update_local(Some(2), None).is_some());
    }

    #[test]
    fn test_heartbeat_refreshes_liveness() {
        let mut map = PresenceMap::with_intervals(
            replica(1),
            state_from(1, 0),
            DEBOUNCE_INTERVAL,
            Duration::from_millis(5),
        );
        map.handle(&AwarenessUpdate::Join {
            replica: replica(2),
            state: state_from(2, 0),
        });

        thread::sleep(Duration::from_millis(8));
        map.handle(&AwarenessUpdate::Heartbeat {
            replica: replica(2),
            seq: 1,
        });

        // Fresh heartbeat: not evicted.
        assert!(map.evict_stale().is_empty());
        assert_eq!(map.peer_count(), 1);
    }

    #[test]
    fn test_eviction_after_two_heartbeat_intervals() {
        let mut map = PresenceMap::with_intervals(
            replica(1),
            state_from(1, 0),
            DEBOUNCE_INTERVAL,
            Duration::from_millis(5),
        );
        map.handle(&AwarenessUpdate::Join {
            replica: replica(2),
            state: state_from(2, 0),
        });

        thread::sleep(Duration::from_millis(15));
        let evicted = map.evict_stale();
        assert_eq!(evicted, vec![PresenceEvent::Evicted(replica(2))]);
        assert_eq!(map.peer_count(), 0);
    }

    #[test]
    fn test_outgoing_seq_monotonic() {
        let mut map = PresenceMap::with_intervals(
            replica(1),
            state_from(1, 0),
            Duration::ZERO,
            HEARTBEAT_INTERVAL,
        );
        let a = match map.update_local(Some(1), None).unwrap() {
            AwarenessUpdate::State { seq, .. } => seq,
            _ => unreachable!(),
        };
        let b = match map.heartbeat_update() {
            AwarenessUpdate::Heartbeat { seq, .. } => seq,
            _ => unreachable!(),
        };
        assert!(b > a);
    }

    #[test]
    fn test_selection_carried() {
        let mut map = PresenceMap::with_intervals(
            replica(1),
            state_from(1, 0),
            Duration::ZERO,
            HEARTBEAT_INTERVAL,
        );
        let sel = Selection { anchor: 2, head: 8 };
        let msg = map.update_local(Some(8), Some(sel)).unwrap();
        match msg {
            AwarenessUpdate::State { state, .. } => {
                assert_eq!(state.selection, Some(sel));
                assert_eq!(state.cursor, Some(8));
            }
            _ => unreachable!(),
        }
    }
}
