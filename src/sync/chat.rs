//! Chat synchronizer: ordered message log plus an outbox of sends awaiting echo.
//!
//! DESIGN
//! ======
//! The log is append-only and ordered by arrival, never by timestamp. A
//! message id enters the log at most once.
//!
//! Local sends do not touch the log. They sit in the outbox (shown as
//! "sending") until the feed delivers a message from the same author with
//! the same body, which releases the oldest matching entry. A rejected
//! send drops its outbox entry; nothing is ever removed from the log.

#[cfg(test)]
#[path = "chat_test.rs"]
mod tests;

use std::collections::HashSet;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::api::SyncApi;
use crate::error::{SyncError, ValidationError};
use crate::types::{ChatMessage, NewMessage, now_ms};

// =============================================================================
// OUTBOX
// =============================================================================

/// A local send awaiting its echo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    pub local_id: Uuid,
    pub author_id: String,
    pub body: String,
    pub queued_at: i64,
}

impl OutboxEntry {
    fn matches(&self, message: &ChatMessage) -> bool {
        self.author_id == message.author_id && self.body == message.body
    }
}

/// Handle for submitting one outbox entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    entry: OutboxEntry,
}

impl PendingSend {
    #[must_use]
    pub fn local_id(&self) -> Uuid {
        self.entry.local_id
    }

    #[must_use]
    pub fn request(&self) -> NewMessage {
        NewMessage { author_id: self.entry.author_id.clone(), body: self.entry.body.clone() }
    }

    /// Send the message to the chat endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::WriteRejected`] when the server declines and a
    /// transport error when the request never completed.
    pub async fn submit(&self, api: &dyn SyncApi) -> Result<(), SyncError> {
        api.send_message(&self.request()).await.map_err(SyncError::from_write)
    }
}

/// Effect of one remote message on the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteAppend {
    Appended,
    /// Appended, and it released a matching outbox entry.
    Confirmed,
    /// Id already in the log.
    Duplicate,
    /// Torn down.
    Ignored,
}

// =============================================================================
// SYNCHRONIZER
// =============================================================================

#[derive(Debug, Default)]
pub struct ChatSync {
    log: Vec<ChatMessage>,
    seen: HashSet<String>,
    outbox: Vec<OutboxEntry>,
    torn_down: bool,
}

impl ChatSync {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the log with `snapshot` (kept in its order). Clears the outbox.
    pub fn initialize(&mut self, snapshot: impl IntoIterator<Item = ChatMessage>) {
        if self.torn_down {
            return;
        }
        self.log.clear();
        self.seen.clear();
        self.outbox.clear();

        let mut duplicates = 0usize;
        for message in snapshot {
            if self.seen.insert(message.id.clone()) {
                self.log.push(message);
            } else {
                duplicates += 1;
            }
        }
        if duplicates > 0 {
            warn!(duplicates, "chat: duplicate ids in snapshot collapsed");
        }
        debug!(messages = self.log.len(), "chat: initialized");
    }

    /// Append a live message unless its id is already present.
    pub fn apply_remote_message(&mut self, message: ChatMessage) -> RemoteAppend {
        if self.torn_down {
            return RemoteAppend::Ignored;
        }
        if !self.seen.insert(message.id.clone()) {
            return RemoteAppend::Duplicate;
        }

        let confirmed = match self.outbox.iter().position(|entry| entry.matches(&message)) {
            Some(index) => {
                self.outbox.remove(index);
                true
            }
            None => false,
        };
        self.log.push(message);
        if confirmed { RemoteAppend::Confirmed } else { RemoteAppend::Appended }
    }

    /// Queue a local send in the outbox.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyMessage`] if `body` is blank.
    pub fn apply_local_send(&mut self, author_id: &str, body: &str) -> Result<PendingSend, ValidationError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(ValidationError::EmptyMessage);
        }

        let entry = OutboxEntry {
            local_id: Uuid::new_v4(),
            author_id: author_id.to_owned(),
            body: body.to_owned(),
            queued_at: now_ms(),
        };
        self.outbox.push(entry.clone());
        Ok(PendingSend { entry })
    }

    /// Drop the outbox entry of a rejected send. Returns `false` if it was
    /// already released.
    pub fn resolve_rejected(&mut self, send: &PendingSend) -> bool {
        let before = self.outbox.len();
        self.outbox.retain(|entry| entry.local_id != send.entry.local_id);
        self.outbox.len() != before
    }

    /// Authoritative messages in arrival order.
    #[must_use]
    pub fn log(&self) -> &[ChatMessage] {
        &self.log
    }

    /// Local sends not yet echoed, oldest first.
    #[must_use]
    pub fn outbox(&self) -> &[OutboxEntry] {
        &self.outbox
    }

    /// Stop accepting messages and discard the log.
    pub fn tear_down(&mut self) {
        self.torn_down = true;
        self.log.clear();
        self.seen.clear();
        self.outbox.clear();
    }
}
