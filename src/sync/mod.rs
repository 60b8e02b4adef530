//! Per-feed synchronizers.
//!
//! ARCHITECTURE
//! ============
//! Each synchronizer owns the local replica of one feed and merges three
//! inputs into it: the initial snapshot, live updates, and local writes.
//! They hold no locks and do no I/O of their own; the session is the single
//! writer and drives the network side.

pub mod canvas;
pub mod chat;

pub use canvas::{CanvasSync, Grid, PendingWrite, RemoteApply};
pub use chat::{ChatSync, OutboxEntry, PendingSend, RemoteAppend};
