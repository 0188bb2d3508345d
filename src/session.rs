//! Per-document session controller.
//!
//! A `Session` owns one document's entire client-side life: the local
//! store, the comment collection, the presence map, the connection driver
//! with its reconnect loop, and the timers (heartbeat, stale-peer sweep,
//! presence flush). The host edits through the session's methods and
//! observes everything else through the event channel.
//!
//! Offline behavior: local edits always apply immediately; the resulting
//! updates queue while disconnected and replay after the next handshake.
//! `destroy()` releases every task and timer and is safe to call from any
//! state, any number of times.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::comments::{resolve_anchor, AnchorPoint, Comment, CommentOp, CommentSet, Mention};
use crate::crdt::{ChangeEvent, ReplicaId, Snapshot, TextCrdt};
use crate::notify::{dispatch, LogNotifier, Notifier, NotifyEvent};
use crate::presence::{
    AwarenessUpdate, PresenceEvent, PresenceMap, PresenceState, Selection, DEBOUNCE_INTERVAL,
    HEARTBEAT_INTERVAL,
};
use crate::protocol::{
    ClientState, FatalReason, MessageType, ProtocolError, SyncMessage, UpdatePayload,
};
use crate::sync::{Backoff, PendingQueue};
use crate::transport::Connector;

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Everything a session can tell its host.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Connection established; initial handshake sent.
    Connected,
    /// Connection lost; the reconnect loop takes over.
    Disconnected,
    /// About to retry the connection.
    Reconnecting { attempt: u32 },
    /// Initial sync answer applied; the document is caught up.
    Synced,
    /// Remote operations changed the document.
    RemoteEdit { changes: Vec<ChangeEvent> },
    /// A participant's cursor/selection/liveness changed.
    Presence(PresenceEvent),
    /// A participant announced itself on the durable channel.
    PeerJoined(ClientState),
    PeerLeft(ReplicaId),
    /// Comment activity, local or remote.
    CommentAdded(Uuid),
    CommentResolved(Uuid),
    CommentReplied { parent: Uuid, reply: Uuid },
    /// The relay refused us; the session will not reconnect.
    Fatal(FatalReason),
}

/// Session tuning knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Presence debounce between cursor broadcasts.
    pub debounce: Duration,
    /// Heartbeat period; peers are evicted after twice this.
    pub heartbeat: Duration,
    /// Reconnect backoff base delay.
    pub backoff_base: Duration,
    /// Reconnect backoff ceiling.
    pub backoff_max: Duration,
    /// Maximum queued offline update batches.
    pub pending_limit: usize,
    /// Event channel capacity.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            debounce: DEBOUNCE_INTERVAL,
            heartbeat: HEARTBEAT_INTERVAL,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            pending_limit: 10_000,
            event_capacity: 256,
        }
    }
}

/// Errors surfaced to direct callers of session methods.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// The caller's role does not allow this operation.
    PermissionDenied,
    /// No element exists at the given position.
    InvalidPosition(usize),
    /// The referenced comment is unknown.
    UnknownComment(Uuid),
    /// The session was destroyed.
    Destroyed,
    Protocol(ProtocolError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::PermissionDenied => write!(f, "operation not permitted for this role"),
            SessionError::InvalidPosition(p) => write!(f, "no element at position {p}"),
            SessionError::UnknownComment(id) => write!(f, "unknown comment {id}"),
            SessionError::Destroyed => write!(f, "session destroyed"),
            SessionError::Protocol(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        SessionError::Protocol(e)
    }
}

/// The per-document controller.
pub struct Session {
    config: SessionConfig,
    doc_id: Uuid,
    client: ClientState,
    doc: Arc<RwLock<TextCrdt>>,
    comments: Arc<RwLock<CommentSet>>,
    presence: Arc<RwLock<PresenceMap>>,
    pending: Arc<Mutex<PendingQueue>>,
    state: Arc<RwLock<ConnectionState>>,
    /// Writer into the live transport; `None` while disconnected.
    outgoing: Arc<RwLock<Option<mpsc::Sender<Vec<u8>>>>>,
    event_tx: mpsc::Sender<SessionEvent>,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
    notifier: Arc<dyn Notifier>,
    connector: Arc<dyn Connector>,
    tasks: Arc<StdMutex<Vec<JoinHandle<()>>>>,
    destroyed: Arc<AtomicBool>,
}

impl Session {
    /// Create a session for a fresh, empty document replica.
    pub fn new(
        doc_id: Uuid,
        client: ClientState,
        connector: Arc<dyn Connector>,
        config: SessionConfig,
    ) -> Self {
        let doc = TextCrdt::new(client.replica);
        let comments = CommentSet::new();
        Self::build(doc_id, client, connector, config, doc, comments)
    }

    /// Create a session seeded from a compacted snapshot.
    pub fn from_snapshot(
        doc_id: Uuid,
        client: ClientState,
        connector: Arc<dyn Connector>,
        config: SessionConfig,
        snapshot: &Snapshot,
    ) -> Self {
        let (doc, comments) = snapshot.restore(client.replica);
        Self::build(doc_id, client, connector, config, doc, comments)
    }

    fn build(
        doc_id: Uuid,
        client: ClientState,
        connector: Arc<dyn Connector>,
        config: SessionConfig,
        doc: TextCrdt,
        comments: CommentSet,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        let mut local_presence = PresenceState::new(client.user_id, client.name.clone());
        local_presence.color = client.color;
        let presence = PresenceMap::with_intervals(
            client.replica,
            local_presence,
            config.debounce,
            config.heartbeat,
        );

        Self {
            pending: Arc::new(Mutex::new(PendingQueue::new(config.pending_limit))),
            config,
            doc_id,
            doc: Arc::new(RwLock::new(doc)),
            comments: Arc::new(RwLock::new(comments)),
            presence: Arc::new(RwLock::new(presence)),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing: Arc::new(RwLock::new(None)),
            event_tx,
            event_rx: Some(event_rx),
            notifier: Arc::new(LogNotifier),
            connector,
            tasks: Arc::new(StdMutex::new(Vec::new())),
            destroyed: Arc::new(AtomicBool::new(false)),
            client,
        }
    }

    /// Swap in a host-provided notification backend.
    pub fn set_notifier(&mut self, notifier: Arc<dyn Notifier>) {
        self.notifier = notifier;
    }

    /// Take the event receiver (can only be taken once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn client(&self) -> &ClientState {
        &self.client
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Materialized document text.
    pub async fn text(&self) -> String {
        self.doc.read().await.materialize().to_string()
    }

    pub async fn len(&self) -> usize {
        self.doc.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.doc.read().await.is_empty()
    }

    /// All comments in deterministic order.
    pub async fn comments(&self) -> Vec<Comment> {
        self.comments
            .read()
            .await
            .all()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Where a comment currently points in the document.
    pub async fn comment_anchor(&self, comment_id: &Uuid) -> Option<AnchorPoint> {
        let anchor = self.comments.read().await.get(comment_id)?.anchor;
        Some(resolve_anchor(&*self.doc.read().await, anchor))
    }

    /// Remote participants currently visible.
    pub async fn participants(&self) -> Vec<PresenceState> {
        self.presence
            .read()
            .await
            .participants()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Number of queued offline batches.
    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Capture a compacted snapshot of document + comments.
    pub async fn snapshot(&self) -> Snapshot {
        let doc = self.doc.read().await;
        let comments = self.comments.read().await;
        Snapshot::capture(&doc, &comments)
    }

    // ── local edits ──────────────────────────────────────────────────

    /// Insert text at a visible position. Applies locally at once; the
    /// update ships (or queues) in the background.
    pub async fn insert(&self, pos: usize, text: &str) -> Result<(), SessionError> {
        self.ensure_alive()?;
        if !self.client.role.can_edit() {
            return Err(SessionError::PermissionDenied);
        }
        if text.is_empty() {
            return Ok(());
        }

        let ops = self.doc.write().await.local_insert(pos, text);
        self.ship(UpdatePayload {
            ops,
            comments: Vec::new(),
        })
        .await;
        Ok(())
    }

    /// Delete `len` visible characters starting at `pos`.
    pub async fn delete(&self, pos: usize, len: usize) -> Result<(), SessionError> {
        self.ensure_alive()?;
        if !self.client.role.can_edit() {
            return Err(SessionError::PermissionDenied);
        }
        if len == 0 {
            return Ok(());
        }

        let ops = self.doc.write().await.local_delete(pos, len);
        self.ship(UpdatePayload {
            ops,
            comments: Vec::new(),
        })
        .await;
        Ok(())
    }

    // ── presence ─────────────────────────────────────────────────────

    /// Report the local cursor/selection. Debounced internally.
    pub async fn update_cursor(
        &self,
        cursor: Option<u64>,
        selection: Option<Selection>,
    ) -> Result<(), SessionError> {
        self.ensure_alive()?;
        let update = self.presence.write().await.update_local(cursor, selection);
        if let Some(update) = update {
            self.send_awareness(&update).await;
        }
        Ok(())
    }

    // ── comments & mentions ──────────────────────────────────────────

    /// Open a comment thread anchored to the character at `pos`.
    pub async fn add_comment(&self, pos: usize, content: &str) -> Result<Uuid, SessionError> {
        self.ensure_alive()?;
        if !self.client.role.can_comment() {
            return Err(SessionError::PermissionDenied);
        }

        let anchor = self
            .doc
            .read()
            .await
            .element_id_at(pos)
            .ok_or(SessionError::InvalidPosition(pos))?;
        let comment = Comment::new(self.client.user_id, content, anchor, now_millis());
        let id = comment.id;

        self.comments
            .write()
            .await
            .apply(CommentOp::Add(comment.clone()));
        self.ship(UpdatePayload {
            ops: Vec::new(),
            comments: vec![CommentOp::Add(comment)],
        })
        .await;

        self.emit(SessionEvent::CommentAdded(id)).await;
        dispatch(
            self.notifier.clone(),
            NotifyEvent::CommentAdded {
                comment_id: id,
                author: self.client.user_id,
            },
        );
        Ok(id)
    }

    /// Mark a thread resolved. Monotonic — resolving twice is harmless.
    pub async fn resolve_comment(&self, comment_id: Uuid) -> Result<(), SessionError> {
        self.ensure_alive()?;
        if !self.client.role.can_comment() {
            return Err(SessionError::PermissionDenied);
        }

        {
            let mut comments = self.comments.write().await;
            if comments.get(&comment_id).is_none() {
                return Err(SessionError::UnknownComment(comment_id));
            }
            comments.apply(CommentOp::Resolve { id: comment_id });
        }
        self.ship(UpdatePayload {
            ops: Vec::new(),
            comments: vec![CommentOp::Resolve { id: comment_id }],
        })
        .await;

        self.emit(SessionEvent::CommentResolved(comment_id)).await;
        dispatch(
            self.notifier.clone(),
            NotifyEvent::CommentResolved { comment_id },
        );
        Ok(())
    }

    /// Append a reply to an existing thread.
    pub async fn reply_comment(&self, parent: Uuid, content: &str) -> Result<Uuid, SessionError> {
        self.ensure_alive()?;
        if !self.client.role.can_comment() {
            return Err(SessionError::PermissionDenied);
        }

        let anchor = {
            let comments = self.comments.read().await;
            comments
                .get(&parent)
                .ok_or(SessionError::UnknownComment(parent))?
                .anchor
        };
        let reply = Comment::new(self.client.user_id, content, anchor, now_millis());
        let id = reply.id;

        self.comments.write().await.apply(CommentOp::Reply {
            parent,
            reply: reply.clone(),
        });
        self.ship(UpdatePayload {
            ops: Vec::new(),
            comments: vec![CommentOp::Reply { parent, reply }],
        })
        .await;

        self.emit(SessionEvent::CommentReplied { parent, reply: id })
            .await;
        Ok(id)
    }

    /// Notify a user that they were mentioned at a document position.
    ///
    /// Mentions are notifications, not document content: nothing is
    /// replicated, the notifier collaborator handles delivery.
    pub async fn mention(
        &self,
        to: Uuid,
        content: &str,
        pos: usize,
    ) -> Result<Mention, SessionError> {
        self.ensure_alive()?;
        if !self.client.role.can_comment() {
            return Err(SessionError::PermissionDenied);
        }

        let anchor = self
            .doc
            .read()
            .await
            .element_id_at(pos)
            .ok_or(SessionError::InvalidPosition(pos))?;
        let mention = Mention::new(self.client.user_id, to, content, anchor, now_millis());
        dispatch(self.notifier.clone(), NotifyEvent::Mention(mention.clone()));
        Ok(mention)
    }

    // ── lifecycle ────────────────────────────────────────────────────

    /// Start the connection driver and the timers.
    ///
    /// Returns immediately; connection progress arrives as events. Safe
    /// to call once per session.
    pub fn connect(&self) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }

        let driver = tokio::spawn(Self::drive(
            self.config.clone(),
            self.doc_id,
            self.client.clone(),
            self.doc.clone(),
            self.comments.clone(),
            self.presence.clone(),
            self.pending.clone(),
            self.state.clone(),
            self.outgoing.clone(),
            self.event_tx.clone(),
            self.connector.clone(),
            self.notifier.clone(),
            self.destroyed.clone(),
        ));

        let timers = tokio::spawn(Self::run_timers(
            self.config.clone(),
            self.doc_id,
            self.client.replica,
            self.presence.clone(),
            self.outgoing.clone(),
            self.event_tx.clone(),
            self.destroyed.clone(),
        ));

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(driver);
            tasks.push(timers);
        }
    }

    /// Tear the session down: leave the room, stop every task and timer.
    ///
    /// Idempotent; also invoked by `Drop`.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Best-effort goodbye on the live connection.
        if let Some(tx) = self.outgoing.read().await.clone() {
            let leave = self.presence.read().await.leave_update();
            if let Ok(msg) = SyncMessage::awareness(self.client.replica, self.doc_id, &leave) {
                if let Ok(frame) = msg.encode() {
                    let _ = tx.send(frame).await;
                }
            }
            if let Ok(frame) = SyncMessage::leave(self.client.replica, self.doc_id).encode() {
                let _ = tx.send(frame).await;
            }
        }

        self.abort_tasks();
        *self.outgoing.write().await = None;
        *self.state.write().await = ConnectionState::Disconnected;
        log::debug!("session for doc {} destroyed", self.doc_id);
    }

    fn abort_tasks(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    fn ensure_alive(&self) -> Result<(), SessionError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(SessionError::Destroyed);
        }
        Ok(())
    }

    async fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event).await;
    }

    /// Send a durable update on the live connection, or queue it.
    async fn ship(&self, payload: UpdatePayload) {
        if payload.is_empty() {
            return;
        }
        let tx = self.outgoing.read().await.clone();
        let connected = *self.state.read().await == ConnectionState::Connected;

        if connected {
            if let Some(tx) = tx {
                match SyncMessage::update(self.client.replica, self.doc_id, &payload)
                    .and_then(|m| m.encode())
                {
                    Ok(frame) => {
                        if tx.send(frame).await.is_ok() {
                            return;
                        }
                    }
                    Err(e) => {
                        log::error!("failed to encode update: {e}");
                        return;
                    }
                }
            }
        }
        self.pending.lock().await.enqueue(payload);
    }

    async fn send_awareness(&self, update: &AwarenessUpdate) {
        // Awareness is silently dropped while offline.
        let Some(tx) = self.outgoing.read().await.clone() else {
            return;
        };
        if let Ok(frame) = SyncMessage::awareness(self.client.replica, self.doc_id, update)
            .and_then(|m| m.encode())
        {
            let _ = tx.send(frame).await;
        }
    }

    // ── connection driver ────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        config: SessionConfig,
        doc_id: Uuid,
        client: ClientState,
        doc: Arc<RwLock<TextCrdt>>,
        comments: Arc<RwLock<CommentSet>>,
        presence: Arc<RwLock<PresenceMap>>,
        pending: Arc<Mutex<PendingQueue>>,
        state: Arc<RwLock<ConnectionState>>,
        outgoing: Arc<RwLock<Option<mpsc::Sender<Vec<u8>>>>>,
        event_tx: mpsc::Sender<SessionEvent>,
        connector: Arc<dyn Connector>,
        notifier: Arc<dyn Notifier>,
        destroyed: Arc<AtomicBool>,
    ) {
        let mut backoff = Backoff::new(config.backoff_base, config.backoff_max);

        loop {
            if destroyed.load(Ordering::SeqCst) {
                return;
            }
            *state.write().await = if backoff.attempt() == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            };

            match connector.connect().await {
                Ok(mut transport) => {
                    backoff.reset();
                    *outgoing.write().await = Some(transport.sender());
                    *state.write().await = ConnectionState::Connected;
                    let _ = event_tx.send(SessionEvent::Connected).await;

                    if let Err(e) = Self::open_connection(
                        doc_id, &client, &transport, &doc, &comments, &presence, &pending,
                    )
                    .await
                    {
                        // The peer may have hung up mid-handshake; frames
                        // it sent first (a rejection, say) are still
                        // buffered, so drain the read loop regardless.
                        log::debug!("handshake send failed: {e}");
                    }
                    let fatal = Self::read_loop(
                        doc_id, &client, &mut transport, &doc, &comments, &presence, &event_tx,
                        &notifier,
                    )
                    .await;

                    *outgoing.write().await = None;
                    *state.write().await = ConnectionState::Disconnected;
                    let _ = event_tx.send(SessionEvent::Disconnected).await;

                    if fatal {
                        // No reconnect after an explicit rejection.
                        return;
                    }
                }
                Err(e) => {
                    log::debug!("connect attempt failed: {e}");
                    *state.write().await = ConnectionState::Disconnected;
                }
            }

            let delay = backoff.next_delay();
            let _ = event_tx
                .send(SessionEvent::Reconnecting {
                    attempt: backoff.attempt(),
                })
                .await;
            tokio::time::sleep(delay).await;
        }
    }

    /// Handshake + offline replay on a fresh connection.
    async fn open_connection(
        doc_id: Uuid,
        client: &ClientState,
        transport: &crate::transport::Transport,
        doc: &Arc<RwLock<TextCrdt>>,
        comments: &Arc<RwLock<CommentSet>>,
        presence: &Arc<RwLock<PresenceMap>>,
        pending: &Arc<Mutex<PendingQueue>>,
    ) -> Result<(), ProtocolError> {
        // Identity first: the relay admits us into the room.
        transport
            .send(SyncMessage::join(doc_id, client)?.encode()?)
            .await?;

        // Ask for what we're missing.
        let sv = doc.read().await.state_vector().clone();
        transport
            .send(SyncMessage::sync_step1(client.replica, doc_id, &sv)?.encode()?)
            .await?;

        // Replay edits made while offline. Also push our comment state in
        // case the relay lost it; merges are idempotent on both ends.
        let queued = pending.lock().await.drain();
        if !queued.is_empty() {
            log::info!("replaying {} queued update batches", queued.len());
        }
        for payload in queued {
            transport
                .send(SyncMessage::update(client.replica, doc_id, &payload)?.encode()?)
                .await?;
        }
        let comment_dump = comments.read().await.snapshot_ops();
        if !comment_dump.is_empty() {
            let payload = UpdatePayload {
                ops: Vec::new(),
                comments: comment_dump,
            };
            transport
                .send(SyncMessage::update(client.replica, doc_id, &payload)?.encode()?)
                .await?;
        }

        // Announce presence on the ephemeral channel.
        let join = presence.read().await.join_update();
        transport
            .send(SyncMessage::awareness(client.replica, doc_id, &join)?.encode()?)
            .await?;
        Ok(())
    }

    /// Pump incoming frames until the connection dies.
    ///
    /// Returns `true` when the relay sent a fatal rejection.
    async fn read_loop(
        doc_id: Uuid,
        client: &ClientState,
        transport: &mut crate::transport::Transport,
        doc: &Arc<RwLock<TextCrdt>>,
        comments: &Arc<RwLock<CommentSet>>,
        presence: &Arc<RwLock<PresenceMap>>,
        event_tx: &mpsc::Sender<SessionEvent>,
        notifier: &Arc<dyn Notifier>,
    ) -> bool {
        let mut synced = false;

        while let Some(bytes) = transport.recv().await {
            let msg = match SyncMessage::decode(&bytes) {
                Ok(msg) => msg,
                Err(e) => {
                    log::warn!("undecodable frame dropped: {e}");
                    continue;
                }
            };
            if msg.replica == client.replica && msg.msg_type != MessageType::SyncStep1 {
                // Relay echo of our own frame.
                continue;
            }

            match msg.msg_type {
                MessageType::SyncStep1 => {
                    // Peer (the relay) tells us what it has; answer with
                    // what it's missing.
                    let Ok(peer_sv) = msg.state_vector() else {
                        continue;
                    };
                    let payload = {
                        let doc = doc.read().await;
                        UpdatePayload {
                            ops: doc.compute_delta(&peer_sv),
                            comments: Vec::new(),
                        }
                    };
                    if !payload.is_empty() {
                        if let Ok(frame) =
                            SyncMessage::sync_step2(client.replica, doc_id, &payload)
                                .and_then(|m| m.encode())
                        {
                            let _ = transport.send(frame).await;
                        }
                    }
                }

                MessageType::SyncStep2 | MessageType::Update => {
                    let Ok(payload) = msg.update_payload() else {
                        log::warn!("malformed update from {}", msg.replica);
                        continue;
                    };
                    let changes = doc.write().await.apply_batch(payload.ops);
                    {
                        let mut comments = comments.write().await;
                        for op in payload.comments {
                            let changed = comments.apply(op.clone());
                            if !changed {
                                continue;
                            }
                            let event = match op {
                                CommentOp::Add(c) => SessionEvent::CommentAdded(c.id),
                                CommentOp::Resolve { id } => SessionEvent::CommentResolved(id),
                                CommentOp::Reply { parent, reply } => {
                                    SessionEvent::CommentReplied {
                                        parent,
                                        reply: reply.id,
                                    }
                                }
                            };
                            let _ = event_tx.send(event).await;
                        }
                    }
                    if !changes.is_empty() {
                        dispatch(
                            notifier.clone(),
                            NotifyEvent::Edited {
                                replica: msg.replica,
                                op_count: changes.len(),
                            },
                        );
                        let _ = event_tx.send(SessionEvent::RemoteEdit { changes }).await;
                    }
                    if msg.msg_type == MessageType::SyncStep2 && !synced {
                        synced = true;
                        let _ = event_tx.send(SessionEvent::Synced).await;
                    }
                }

                MessageType::Awareness => {
                    let Ok(update) = msg.awareness_update() else {
                        continue;
                    };
                    let event = presence.write().await.handle(&update);
                    let newcomer = matches!(event, Some(PresenceEvent::Joined(_)));
                    if let Some(event) = event {
                        let _ = event_tx.send(SessionEvent::Presence(event)).await;
                    }
                    if newcomer && matches!(update, AwarenessUpdate::Join { .. }) {
                        // Answer a first-seen newcomer with our own
                        // announcement so presence converges regardless of
                        // join order. Known peers are never re-answered,
                        // which keeps the exchange from ping-ponging.
                        let reply = presence.read().await.join_update();
                        if let Ok(frame) =
                            SyncMessage::awareness(client.replica, doc_id, &reply)
                                .and_then(|m| m.encode())
                        {
                            let _ = transport.send(frame).await;
                        }
                    }
                }

                MessageType::Join => {
                    if let Ok(state) = msg.client_state() {
                        dispatch(
                            notifier.clone(),
                            NotifyEvent::PeerJoined {
                                user_id: state.user_id,
                                name: state.name.clone(),
                            },
                        );
                        let _ = event_tx.send(SessionEvent::PeerJoined(state)).await;
                    }
                }

                MessageType::Leave => {
                    let event = presence
                        .write()
                        .await
                        .handle(&AwarenessUpdate::Leave {
                            replica: msg.replica,
                        });
                    if let Some(event) = event {
                        let _ = event_tx.send(SessionEvent::Presence(event)).await;
                    }
                    let _ = event_tx.send(SessionEvent::PeerLeft(msg.replica)).await;
                }

                MessageType::Ping => {
                    if let Ok(frame) = SyncMessage::pong(client.replica).encode() {
                        let _ = transport.send(frame).await;
                    }
                }

                MessageType::Pong => {}

                MessageType::Fatal => {
                    let reason = msg.fatal_reason().unwrap_or(FatalReason::Unauthorized);
                    log::error!("relay rejected session: {reason}");
                    let _ = event_tx.send(SessionEvent::Fatal(reason)).await;
                    return true;
                }
            }
        }
        false
    }

    /// Heartbeat, presence flush, and stale-peer sweep on one task.
    async fn run_timers(
        config: SessionConfig,
        doc_id: Uuid,
        replica: ReplicaId,
        presence: Arc<RwLock<PresenceMap>>,
        outgoing: Arc<RwLock<Option<mpsc::Sender<Vec<u8>>>>>,
        event_tx: mpsc::Sender<SessionEvent>,
        destroyed: Arc<AtomicBool>,
    ) {
        let mut heartbeat = tokio::time::interval(config.heartbeat);
        let mut flush = tokio::time::interval(config.debounce);
        // The sweep runs on the heartbeat period; eviction itself
        // triggers at 2x inside the map.
        let mut sweep = tokio::time::interval(config.heartbeat);

        loop {
            if destroyed.load(Ordering::SeqCst) {
                return;
            }
            tokio::select! {
                _ = heartbeat.tick() => {
                    let update = presence.write().await.heartbeat_update();
                    Self::send_awareness_static(&outgoing, replica, doc_id, &update).await;
                }
                _ = flush.tick() => {
                    let update = presence.write().await.flush_pending();
                    if let Some(update) = update {
                        Self::send_awareness_static(&outgoing, replica, doc_id, &update).await;
                    }
                }
                _ = sweep.tick() => {
                    let evicted = presence.write().await.evict_stale();
                    for event in evicted {
                        let _ = event_tx.send(SessionEvent::Presence(event)).await;
                    }
                }
            }
        }
    }

    async fn send_awareness_static(
        outgoing: &Arc<RwLock<Option<mpsc::Sender<Vec<u8>>>>>,
        replica: ReplicaId,
        doc_id: Uuid,
        update: &AwarenessUpdate,
    ) {
        let Some(tx) = outgoing.read().await.clone() else {
            return;
        };
        if let Ok(frame) =
            SyncMessage::awareness(replica, doc_id, update).and_then(|m| m.encode())
        {
            let _ = tx.send(frame).await;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.abort_tasks();
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Role;
    use crate::transport::Transport;
    use futures_util::future::BoxFuture;

    fn never_connector() -> Arc<dyn Connector> {
        Arc::new(|| -> BoxFuture<'static, Result<Transport, ProtocolError>> {
            Box::pin(async { Err(ProtocolError::ConnectionClosed) })
        })
    }

    fn session_with_role(role: Role) -> Session {
        let client = ClientState::new(Uuid::new_v4(), "test", role);
        Session::new(
            Uuid::new_v4(),
            client,
            never_connector(),
            SessionConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_local_edits_apply_immediately_offline() {
        let session = session_with_role(Role::Editor);
        session.insert(0, "hello").await.unwrap();
        session.insert(5, " world").await.unwrap();
        session.delete(0, 1).await.unwrap();

        assert_eq!(session.text().await, "ello world");
        // Edits queued for the next connection.
        assert_eq!(session.pending_len().await, 3);
    }

    #[tokio::test]
    async fn test_viewer_cannot_edit_or_comment() {
        let session = session_with_role(Role::Viewer);
        assert_eq!(
            session.insert(0, "x").await,
            Err(SessionError::PermissionDenied)
        );
        assert_eq!(
            session.delete(0, 1).await,
            Err(SessionError::PermissionDenied)
        );
        assert!(matches!(
            session.add_comment(0, "nope").await,
            Err(SessionError::PermissionDenied)
        ));
    }

    #[tokio::test]
    async fn test_commenter_can_comment_but_not_edit() {
        let editor = session_with_role(Role::Editor);
        editor.insert(0, "text").await.unwrap();
        assert_eq!(
            session_with_role(Role::Commenter).insert(0, "x").await,
            Err(SessionError::PermissionDenied)
        );
    }

    #[tokio::test]
    async fn test_comment_lifecycle() {
        let session = session_with_role(Role::Editor);
        session.insert(0, "hello").await.unwrap();

        let id = session.add_comment(2, "typo?").await.unwrap();
        let comments = session.comments().await;
        assert_eq!(comments.len(), 1);
        assert!(!comments[0].resolved);

        let reply = session.reply_comment(id, "fixed").await.unwrap();
        session.resolve_comment(id).await.unwrap();

        let comments = session.comments().await;
        assert!(comments[0].resolved);
        assert_eq!(comments[0].replies.len(), 1);
        assert_eq!(comments[0].replies[0].id, reply);
    }

    #[tokio::test]
    async fn test_comment_at_invalid_position() {
        let session = session_with_role(Role::Editor);
        assert_eq!(
            session.add_comment(5, "where?").await,
            Err(SessionError::InvalidPosition(5))
        );
    }

    #[tokio::test]
    async fn test_resolve_unknown_comment() {
        let session = session_with_role(Role::Editor);
        let ghost = Uuid::new_v4();
        assert_eq!(
            session.resolve_comment(ghost).await,
            Err(SessionError::UnknownComment(ghost))
        );
    }

    #[tokio::test]
    async fn test_comment_anchor_follows_edits() {
        let session = session_with_role(Role::Editor);
        session.insert(0, "hello").await.unwrap();
        let id = session.add_comment(2, "here").await.unwrap();

        session.insert(0, ">> ").await.unwrap();
        assert_eq!(
            session.comment_anchor(&id).await,
            Some(AnchorPoint::Exact(5))
        );
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let session = session_with_role(Role::Editor);
        session.connect();
        session.destroy().await;
        session.destroy().await;
        assert_eq!(
            session.connection_state().await,
            ConnectionState::Disconnected
        );
        assert_eq!(session.insert(0, "x").await, Err(SessionError::Destroyed));
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip_through_session() {
        let session = session_with_role(Role::Editor);
        session.insert(0, "persist me").await.unwrap();
        let id = session.add_comment(0, "note").await.unwrap();

        let snapshot = session.snapshot().await;
        let client = ClientState::new(Uuid::new_v4(), "restored", Role::Editor);
        let restored = Session::from_snapshot(
            session.doc_id(),
            client,
            never_connector(),
            SessionConfig::default(),
            &snapshot,
        );

        assert_eq!(restored.text().await, "persist me");
        assert_eq!(restored.comments().await.len(), 1);
        assert!(restored.comment_anchor(&id).await.is_some());
    }

    #[tokio::test]
    async fn test_mention_dispatches_notification() {
        use std::sync::Mutex as SyncMutex;

        struct Recording(SyncMutex<Vec<NotifyEvent>>);
        impl Notifier for Recording {
            fn deliver(&self, event: NotifyEvent) -> Result<(), crate::notify::NotifyError> {
                self.0.lock().unwrap().push(event);
                Ok(())
            }
        }

        let mut session = session_with_role(Role::Editor);
        let recording = Arc::new(Recording(SyncMutex::new(Vec::new())));
        session.set_notifier(recording.clone());

        session.insert(0, "ping").await.unwrap();
        let to = Uuid::new_v4();
        let mention = session.mention(to, "look here", 1).await.unwrap();
        assert_eq!(mention.to, to);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let events = recording.0.lock().unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, NotifyEvent::Mention(m) if m.to == to)));
    }

    #[tokio::test]
    async fn test_cursor_update_offline_is_silent() {
        let session = session_with_role(Role::Editor);
        // No connection: must not error, must not queue.
        session.update_cursor(Some(3), None).await.unwrap();
        assert_eq!(session.pending_len().await, 0);
    }
}
