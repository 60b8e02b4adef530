//! Real-time synchronization client for a shared pixel canvas and its chat.
//!
//! ARCHITECTURE
//! ============
//! Each feed (canvas, chat) comes from a snapshot over HTTP followed by a
//! live WebSocket stream. `Session` owns one channel and one synchronizer
//! per feed, merges the two sources in order, applies local writes
//! optimistically and reconnects with backoff when a feed drops.
//!
//! ```text
//! SyncApi (HTTP) ──snapshot──┐
//!                            ├─> CanvasSync / ChatSync <── Session::next_event
//! Channel<T> (WS) ──live─────┘
//! ```

pub mod api;
pub mod channel;
pub mod config;
pub mod error;
pub mod names;
pub mod session;
pub mod snapshot;
pub mod sync;
pub mod types;

#[cfg(test)]
mod test_helpers;

pub use api::{HttpApi, SyncApi};
pub use channel::{Channel, ChannelState, SubscriptionId};
pub use config::{ReconnectPolicy, SnapshotFallback, SyncConfig};
pub use error::{ApiError, ErrorCode, SyncError, TransportError, ValidationError};
pub use session::{Session, SessionEvent};
pub use snapshot::SnapshotLoader;
pub use sync::{CanvasSync, ChatSync, Grid};
pub use types::{ChatMessage, Feed, Pixel};
