//! Snapshot loader: one-shot reads of current canvas and chat state.
//!
//! Each fetch is a single request with no retry. Whether a failure means
//! "start empty" or "try again later" is the session's call.

#[cfg(test)]
#[path = "snapshot_test.rs"]
mod tests;

use std::sync::Arc;

use tracing::{info, warn};

use crate::api::SyncApi;
use crate::error::{ApiError, SyncError};
use crate::types::{ChatMessage, Feed, Pixel};

#[derive(Clone)]
pub struct SnapshotLoader {
    api: Arc<dyn SyncApi>,
}

impl SnapshotLoader {
    #[must_use]
    pub fn new(api: Arc<dyn SyncApi>) -> Self {
        Self { api }
    }

    /// Every painted pixel.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SnapshotUnavailable`] on any request or decode failure.
    pub async fn fetch_canvas_snapshot(&self) -> Result<Vec<Pixel>, SyncError> {
        let pixels = self.api.fetch_canvas().await.map_err(|e| unavailable(Feed::Canvas, &e))?;
        info!(count = pixels.len(), "snapshot: canvas loaded");
        Ok(pixels)
    }

    /// Chat history, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SnapshotUnavailable`] on any request or decode failure.
    pub async fn fetch_chat_snapshot(&self) -> Result<Vec<ChatMessage>, SyncError> {
        let messages = self.api.fetch_messages().await.map_err(|e| unavailable(Feed::Chat, &e))?;
        info!(count = messages.len(), "snapshot: chat loaded");
        Ok(messages)
    }
}

fn unavailable(feed: Feed, err: &ApiError) -> SyncError {
    warn!(%feed, error = %err, "snapshot: fetch failed");
    SyncError::SnapshotUnavailable(err.to_string())
}
