//! # cowrite — Real-time collaborative text synchronization
//!
//! A CRDT-backed collaboration core: concurrent text editing with
//! guaranteed convergence, delta sync over a binary protocol, ephemeral
//! presence, and anchored comment threads, relayed through a room-based
//! WebSocket fan-out hub.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │  Session    │ ◄─────────────────► │  RoomHub    │
//! │ (per user)  │     Binary Proto    │  (relay)    │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ TextCrdt    │                     │ TextCrdt    │
//! │ CommentSet  │                     │ CommentSet  │
//! │ PresenceMap │                     │ (authority) │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ BroadcastGroup│
//!                                    │ (fan-out)     │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`crdt`] — Replicated text store with delta sync and snapshots
//! - [`protocol`] — Binary wire protocol (bincode-encoded SyncMessage)
//! - [`comments`] — Anchored comment threads and mentions
//! - [`presence`] — Ephemeral cursor/selection awareness
//! - [`session`] — Per-document client controller with offline queue
//! - [`transport`] — Framed duplex abstraction + WebSocket adapter
//! - [`broadcast`] — Room fan-out with backpressure
//! - [`relay`] — WebSocket relay hub hosting document rooms
//! - [`sync`] — Pending queue and reconnect backoff
//! - [`notify`] — Outbound notification seam

pub mod broadcast;
pub mod comments;
pub mod crdt;
pub mod notify;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod sync;
pub mod transport;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use comments::{AnchorPoint, Comment, CommentOp, CommentSet, Mention};
pub use crdt::{
    ApplyOutcome, ChangeEvent, OpId, Operation, ReplicaId, Snapshot, SnapshotError, StateVector,
    TextCrdt,
};
pub use notify::{LogNotifier, Notifier, NotifyError, NotifyEvent};
pub use presence::{
    AwarenessUpdate, PresenceEvent, PresenceMap, PresenceState, Selection,
};
pub use protocol::{
    ClientState, FatalReason, MessageType, ProtocolError, Role, SyncMessage, UpdatePayload,
};
pub use relay::{RelayConfig, RelayStats, RoomHub};
pub use session::{ConnectionState, Session, SessionConfig, SessionError, SessionEvent};
pub use sync::{Backoff, PendingQueue};
pub use transport::{Connector, Transport, WsConnector};
