//! Relay server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (doc_id) ── TextCrdt + CommentSet ── BroadcastGroup
//! Client B ──┘                                                  │
//!                                                  ┌────────────┼───────────┐
//!                                                  ▼            ▼           ▼
//!                                               Client A     Client B    Client C
//! ```
//!
//! Each room keeps an authoritative replica of the document so late
//! joiners sync against the relay instead of waiting for another client.
//! Durable updates are applied to the room state and fanned out; awareness
//! frames are fanned out without touching any state. The relay talks
//! `Transport`, so the same loop serves WebSocket clients and in-process
//! test pairs.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::broadcast::BroadcastGroup;
use crate::comments::CommentSet;
use crate::crdt::TextCrdt;
use crate::protocol::{
    ClientState, FatalReason, MessageType, ProtocolError, Role, SyncMessage, UpdatePayload,
};
use crate::transport::{ws_transport, Transport};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum participants per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Create rooms on first join instead of rejecting unknown documents
    pub auto_create_rooms: bool,
    /// Expected credential; `None` disables the check
    pub credential: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            auto_create_rooms: true,
            credential: None,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub active_rooms: usize,
}

/// Document room: authoritative state + fan-out group.
struct Room {
    doc: TextCrdt,
    comments: CommentSet,
    broadcast: Arc<BroadcastGroup>,
}

impl Room {
    fn new(broadcast_capacity: usize) -> Self {
        Self {
            doc: TextCrdt::new(Uuid::new_v4()),
            comments: CommentSet::new(),
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
        }
    }
}

/// The fan-out relay.
pub struct RoomHub {
    config: RelayConfig,
    rooms: Arc<RwLock<HashMap<Uuid, Room>>>,
    stats: Arc<RwLock<RelayStats>>,
}

impl RoomHub {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Provision a room up front. With `auto_create_rooms` off, only
    /// provisioned documents accept joins.
    pub async fn create_room(&self, doc_id: Uuid) {
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(doc_id)
            .or_insert_with(|| Room::new(self.config.broadcast_capacity));
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// The current document text of a room, for host inspection.
    pub async fn room_text(&self, doc_id: &Uuid) -> Option<String> {
        let rooms = self.rooms.read().await;
        rooms.get(doc_id).map(|r| r.doc.materialize().to_string())
    }

    pub async fn stats(&self) -> RelayStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.rooms.read().await.len();
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Accept WebSocket connections forever.
    pub async fn run(self: Arc<Self>) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("relay listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");
            let hub = self.clone();

            tokio::spawn(async move {
                // Capture the credential from the upgrade request URI.
                let token: Arc<std::sync::Mutex<Option<String>>> = Arc::default();
                let token_slot = token.clone();
                let callback = move |req: &tokio_tungstenite::tungstenite::handshake::server::Request,
                                     resp: tokio_tungstenite::tungstenite::handshake::server::Response| {
                    if let Ok(mut slot) = token_slot.lock() {
                        *slot = query_param(req.uri().query(), "token");
                    }
                    Ok(resp)
                };

                match tokio_tungstenite::accept_hdr_async(stream, callback).await {
                    Ok(ws_stream) => {
                        let credential = token.lock().ok().and_then(|t| t.clone());
                        let transport = ws_transport(ws_stream);
                        hub.handle_client(transport, credential).await;
                    }
                    Err(e) => log::warn!("websocket handshake failed from {addr}: {e}"),
                }
            });
        }
    }

    /// Serve one client over any transport.
    ///
    /// The first meaningful frame must be `Join`; until then nothing is
    /// routed. Returns when the client disconnects or is rejected.
    pub async fn handle_client(&self, mut transport: Transport, credential: Option<String>) {
        if let Some(expected) = &self.config.credential {
            if credential.as_deref() != Some(expected.as_str()) {
                log::warn!("rejecting client: bad credential");
                self.send_fatal(&transport, Uuid::nil(), FatalReason::Unauthorized)
                    .await;
                return;
            }
        }

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Per-connection state, set on Join.
        let mut client: Option<ClientState> = None;
        let mut doc_id: Option<Uuid> = None;
        let mut broadcast_rx: Option<tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>> = None;

        loop {
            tokio::select! {
                frame = transport.recv() => {
                    let Some(bytes) = frame else { break };
                    let msg = match SyncMessage::decode(&bytes) {
                        Ok(msg) => msg,
                        Err(e) => {
                            log::warn!("undecodable frame dropped: {e}");
                            continue;
                        }
                    };
                    {
                        let mut s = self.stats.write().await;
                        s.total_messages += 1;
                    }

                    match msg.msg_type {
                        MessageType::Join => {
                            let state = msg.client_state().unwrap_or_else(|_| {
                                ClientState::with_replica(msg.replica, Uuid::nil(), "Anonymous", Role::Viewer)
                            });

                            let joined = self
                                .join_room(&transport, msg.doc_id, state.clone(), &bytes)
                                .await;
                            let Some(rx) = joined else {
                                self.disconnect(None, None).await;
                                return;
                            };

                            broadcast_rx = Some(rx);
                            client = Some(state);
                            doc_id = Some(msg.doc_id);
                        }

                        MessageType::SyncStep1 => {
                            let Some(did) = doc_id else { continue };
                            let Ok(peer_sv) = msg.state_vector() else {
                                log::warn!("malformed state vector from {}", msg.replica);
                                continue;
                            };

                            let response = {
                                let rooms = self.rooms.read().await;
                                rooms.get(&did).map(|room| UpdatePayload {
                                    ops: room.doc.compute_delta(&peer_sv),
                                    comments: room.comments.snapshot_ops(),
                                })
                            };
                            if let Some(payload) = response {
                                self.send_direct(
                                    &transport,
                                    SyncMessage::sync_step2(Uuid::nil(), did, &payload),
                                )
                                .await;
                            }
                        }

                        MessageType::Update | MessageType::SyncStep2 => {
                            let Some(did) = doc_id else { continue };
                            let Ok(payload) = msg.update_payload() else {
                                log::warn!("malformed update from {}", msg.replica);
                                continue;
                            };
                            if payload.is_empty() {
                                continue;
                            }

                            let broadcast = {
                                let mut rooms = self.rooms.write().await;
                                rooms.get_mut(&did).map(|room| {
                                    room.doc.apply_batch(payload.ops.clone());
                                    for op in payload.comments.clone() {
                                        room.comments.apply(op);
                                    }
                                    room.broadcast.clone()
                                })
                            };

                            // Fan out as an Update regardless of which frame
                            // carried it, so receivers have one durable path.
                            if let Some(bc) = broadcast {
                                if let Ok(update) = SyncMessage::update(msg.replica, did, &payload) {
                                    let _ = bc.broadcast(&update);
                                }
                            }
                        }

                        MessageType::Awareness => {
                            // Ephemeral: fan out untouched, never stored.
                            let Some(did) = doc_id else { continue };
                            let broadcast = {
                                let rooms = self.rooms.read().await;
                                rooms.get(&did).map(|r| r.broadcast.clone())
                            };
                            if let Some(bc) = broadcast {
                                let _ = bc.broadcast_raw(Arc::new(bytes));
                            }
                        }

                        MessageType::Ping => {
                            self.send_direct(&transport, Ok(SyncMessage::pong(msg.replica)))
                                .await;
                        }

                        MessageType::Leave => break,

                        _ => log::debug!("unhandled message type: {:?}", msg.msg_type),
                    }
                }

                msg = async {
                    match broadcast_rx {
                        Some(ref mut rx) => rx.recv().await,
                        // Not joined yet: park this arm.
                        None => std::future::pending().await,
                    }
                } => {
                    match msg {
                        Ok(frame) => {
                            // Don't echo frames back to their origin.
                            if let Ok(peeked) = SyncMessage::decode(&frame) {
                                if Some(peeked.replica) == client.as_ref().map(|c| c.replica) {
                                    continue;
                                }
                            }
                            if transport.send(frame.to_vec()).await.is_err() {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("client lagged by {n} frames");
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        self.disconnect(client, doc_id).await;
    }

    /// Admit a participant to a room, answering the join protocol.
    ///
    /// Returns the broadcast receiver, or `None` when the client was
    /// rejected (room missing, room full).
    async fn join_room(
        &self,
        transport: &Transport,
        doc_id: Uuid,
        state: ClientState,
        join_frame: &[u8],
    ) -> Option<tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>> {
        let mut rooms = self.rooms.write().await;

        if !rooms.contains_key(&doc_id) {
            if !self.config.auto_create_rooms {
                drop(rooms);
                log::warn!("join for unknown document {doc_id}");
                self.send_fatal(transport, doc_id, FatalReason::DocumentNotFound)
                    .await;
                return None;
            }
            rooms.insert(doc_id, Room::new(self.config.broadcast_capacity));
            log::info!("room {doc_id} created");
        }

        // Unwrap safe: inserted above or present already.
        let room = rooms.get(&doc_id)?;
        if room.broadcast.peer_count().await >= self.config.max_peers_per_room {
            drop(rooms);
            log::warn!("room {doc_id} full, rejecting {}", state.name);
            return None;
        }

        let rx = room.broadcast.add_peer(state.clone()).await;

        // Announce the newcomer to the rest of the room.
        let _ = room.broadcast.broadcast_raw(Arc::new(join_frame.to_vec()));

        // Tell the newcomer who is already here.
        let existing = room.broadcast.peers().await;
        let sv = room.doc.state_vector().clone();
        drop(rooms);

        for peer in existing {
            if peer.replica == state.replica {
                continue;
            }
            self.send_direct(transport, SyncMessage::join(doc_id, &peer))
                .await;
        }

        // Open the handshake: the client answers with SyncStep1 of its
        // own, and sends back what the relay is missing.
        self.send_direct(
            transport,
            SyncMessage::sync_step1(Uuid::nil(), doc_id, &sv),
        )
        .await;

        log::info!("{} ({}) joined doc {}", state.name, state.replica, doc_id);
        Some(rx)
    }

    async fn disconnect(&self, client: Option<ClientState>, doc_id: Option<Uuid>) {
        if let (Some(state), Some(did)) = (client, doc_id) {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&did) {
                room.broadcast.remove_peer(&state.replica).await;
                let _ = room.broadcast.broadcast(&SyncMessage::leave(state.replica, did));
                log::info!("{} left doc {}", state.name, did);
            }
            // The room (and its authoritative state) outlives its
            // participants; document teardown is the host's call.
        }

        let mut s = self.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }

    async fn send_direct(
        &self,
        transport: &Transport,
        msg: Result<SyncMessage, ProtocolError>,
    ) {
        let frame = msg.and_then(|m| m.encode());
        match frame {
            Ok(bytes) => {
                let _ = transport.send(bytes).await;
            }
            Err(e) => log::error!("failed to encode relay frame: {e}"),
        }
    }

    async fn send_fatal(&self, transport: &Transport, doc_id: Uuid, reason: FatalReason) {
        self.send_direct(transport, SyncMessage::fatal(doc_id, reason))
            .await;
    }
}

fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix(key)?.strip_prefix('=').map(String::from))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
        assert!(config.auto_create_rooms);
        assert!(config.credential.is_none());
    }

    #[test]
    fn test_query_param() {
        assert_eq!(
            query_param(Some("token=abc&x=1"), "token"),
            Some("abc".to_string())
        );
        assert_eq!(
            query_param(Some("x=1&token=abc"), "token"),
            Some("abc".to_string())
        );
        assert_eq!(query_param(Some("x=1"), "token"), None);
        assert_eq!(query_param(None, "token"), None);
        // A key that prefixes another key must not match.
        assert_eq!(query_param(Some("tokens=abc"), "token"), None);
    }

    #[tokio::test]
    async fn test_create_room_and_count() {
        let hub = RoomHub::with_defaults();
        let doc = Uuid::new_v4();
        hub.create_room(doc).await;
        hub.create_room(doc).await;
        assert_eq!(hub.room_count().await, 1);
        assert_eq!(hub.room_text(&doc).await, Some(String::new()));
    }

    #[tokio::test]
    async fn test_bad_credential_rejected_with_fatal() {
        let hub = RoomHub::new(RelayConfig {
            credential: Some("secret".into()),
            ..RelayConfig::default()
        });

        let (client_side, relay_side) = Transport::pair(16);
        let handle = tokio::spawn(async move {
            hub.handle_client(relay_side, Some("wrong".into())).await;
        });

        let mut client_side = client_side;
        let frame = client_side.recv().await.unwrap();
        let msg = SyncMessage::decode(&frame).unwrap();
        assert_eq!(msg.fatal_reason().unwrap(), FatalReason::Unauthorized);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_document_rejected() {
        let hub = RoomHub::new(RelayConfig {
            auto_create_rooms: false,
            ..RelayConfig::default()
        });

        let (client_side, relay_side) = Transport::pair(16);
        let handle = tokio::spawn(async move {
            hub.handle_client(relay_side, None).await;
        });

        let state = ClientState::new(Uuid::new_v4(), "Alice", Role::Editor);
        let join = SyncMessage::join(Uuid::new_v4(), &state).unwrap();
        client_side.send(join.encode().unwrap()).await.unwrap();

        let mut client_side = client_side;
        let frame = client_side.recv().await.unwrap();
        let msg = SyncMessage::decode(&frame).unwrap();
        assert_eq!(msg.fatal_reason().unwrap(), FatalReason::DocumentNotFound);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_join_gets_relay_state_vector() {
        let hub = Arc::new(RoomHub::with_defaults());
        let doc = Uuid::new_v4();

        let (client_side, relay_side) = Transport::pair(16);
        let hub2 = hub.clone();
        tokio::spawn(async move {
            hub2.handle_client(relay_side, None).await;
        });

        let state = ClientState::new(Uuid::new_v4(), "Alice", Role::Editor);
        let join = SyncMessage::join(doc, &state).unwrap();
        client_side.send(join.encode().unwrap()).await.unwrap();

        let mut client_side = client_side;
        let frame = client_side.recv().await.unwrap();
        let msg = SyncMessage::decode(&frame).unwrap();
        assert_eq!(msg.msg_type, MessageType::SyncStep1);
        assert!(msg.state_vector().unwrap().is_empty());
        assert_eq!(hub.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_update_applied_to_authoritative_room() {
        let hub = Arc::new(RoomHub::with_defaults());
        let doc = Uuid::new_v4();

        let (client_side, relay_side) = Transport::pair(16);
        let hub2 = hub.clone();
        tokio::spawn(async move {
            hub2.handle_client(relay_side, None).await;
        });

        let state = ClientState::new(Uuid::new_v4(), "Alice", Role::Editor);
        let join = SyncMessage::join(doc, &state).unwrap();
        client_side.send(join.encode().unwrap()).await.unwrap();

        let mut local = TextCrdt::new(state.replica);
        let payload = UpdatePayload {
            ops: local.local_insert(0, "hello"),
            comments: Vec::new(),
        };
        let update = SyncMessage::update(state.replica, doc, &payload).unwrap();
        client_side.send(update.encode().unwrap()).await.unwrap();

        // Wait for the relay to apply.
        for _ in 0..50 {
            if hub.room_text(&doc).await.as_deref() == Some("hello") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(hub.room_text(&doc).await.as_deref(), Some("hello"));
    }
}
