//! Fan-out broadcast to N-1 participants with backpressure.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers. Each
//! participant gets an independent receiver buffering up to `capacity`
//! frames; lagging receivers drop oldest frames rather than stalling the
//! room.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::crdt::ReplicaId;
use crate::protocol::{ClientState, ProtocolError, SyncMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_peers: usize,
}

/// A broadcast group for a single document room.
///
/// All participants of the same document share one channel; every frame a
/// participant sends is fanned out to the rest. Sender-side filtering is
/// the receiver's job (frames carry the origin replica).
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    /// Connected participants in this room.
    peers: Arc<RwLock<HashMap<ReplicaId, ClientState>>>,
    capacity: usize,
    /// Lock-free counter, read via stats().
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` bounds how many frames a slow receiver may fall behind.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Add a participant, returning its receiver.
    pub async fn add_peer(&self, state: ClientState) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut peers = self.peers.write().await;
        peers.insert(state.replica, state);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, replica: &ReplicaId) -> Option<ClientState> {
        let mut peers = self.peers.write().await;
        peers.remove(replica)
    }

    /// Broadcast a message to all subscribers. Returns the receiver count.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Broadcast pre-encoded bytes directly (zero-copy fast path).
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<ClientState> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, replica: &ReplicaId) -> bool {
        self.peers.read().await.contains_key(replica)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }
}
