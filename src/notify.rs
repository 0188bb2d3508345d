//! Outbound notification seam.
//!
//! Mentions and comment activity are handed to a `Notifier` collaborator
//! (email, push, in-app — whatever the host provides). Delivery is
//! fire-and-forget: a failing notifier is logged and never affects
//! document synchronization.

use std::sync::Arc;

use uuid::Uuid;

use crate::comments::Mention;

/// Something worth telling a user about.
#[derive(Debug, Clone, PartialEq)]
pub enum NotifyEvent {
    /// A user was @mentioned.
    Mention(Mention),
    /// A new comment thread was opened.
    CommentAdded { comment_id: Uuid, author: Uuid },
    /// A thread was resolved.
    CommentResolved { comment_id: Uuid },
    /// A participant joined the document.
    PeerJoined { user_id: Uuid, name: String },
    /// Remote edits were applied to the document.
    Edited { replica: Uuid, op_count: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotifyError(pub String);

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "notification delivery failed: {}", self.0)
    }
}

impl std::error::Error for NotifyError {}

/// Delivery backend provided by the host application.
pub trait Notifier: Send + Sync {
    fn deliver(&self, event: NotifyEvent) -> Result<(), NotifyError>;
}

/// Default backend: writes notifications to the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn deliver(&self, event: NotifyEvent) -> Result<(), NotifyError> {
        match event {
            NotifyEvent::Mention(m) => {
                log::info!("mention {} -> {}: {}", m.from, m.to, m.content)
            }
            NotifyEvent::CommentAdded { comment_id, author } => {
                log::info!("comment {comment_id} added by {author}")
            }
            NotifyEvent::CommentResolved { comment_id } => {
                log::info!("comment {comment_id} resolved")
            }
            NotifyEvent::PeerJoined { user_id, name } => {
                log::info!("{name} ({user_id}) joined")
            }
            // High-volume; keep it off the info level.
            NotifyEvent::Edited { replica, op_count } => {
                log::debug!("{op_count} ops applied from {replica}")
            }
        }
        Ok(())
    }
}

/// Hand an event to the notifier off the hot path.
///
/// Spawned so a slow backend cannot stall the session loop; failures are
/// logged and dropped.
pub fn dispatch(notifier: Arc<dyn Notifier>, event: NotifyEvent) {
    tokio::spawn(async move {
        if let Err(e) = notifier.deliver(event) {
            log::warn!("{e}");
        }
    });
}
