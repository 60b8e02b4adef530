//! Transport channel: one WebSocket connection carrying one feed.
//!
//! DESIGN
//! ======
//! A `Channel<T>` is good for exactly one connection attempt. Its state is
//! held in a `watch` channel so any number of observers can read or await it:
//!
//! ```text
//! Idle -> Connecting -> Open -> Closing -> Closed
//!                 \        \
//!                  +-> Failed <-+   (connect error, transport error,
//!                                    unexpected remote close)
//! ```
//!
//! `Failed` and `Closed` are terminal. Reconnecting means building a new
//! channel; nothing carries over, subscriptions included.
//!
//! Once open, a spawned I/O task owns the socket. Inbound text/binary frames
//! are decoded as `T` and fanned out to every subscriber in arrival order.
//! The subscriber list is cloned before each dispatch, so handlers may
//! subscribe or unsubscribe without invalidating the iteration.
//!
//! ERROR HANDLING
//! ==============
//! A payload that fails to decode is logged and dropped; the channel stays
//! open. Socket errors move the channel to `Failed` with the reason.

#[cfg(test)]
#[path = "channel_test.rs"]
mod tests;

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::types::Feed;

/// How long `close` waits for the I/O task to flush the close frame.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

// =============================================================================
// STATE
// =============================================================================

/// Lifecycle state of one channel instance.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Failed(String),
}

impl ChannelState {
    /// `Closed` and `Failed` never transition again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed(_))
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Connecting => f.write_str("connecting"),
            Self::Open => f.write_str("open"),
            Self::Closing => f.write_str("closing"),
            Self::Closed => f.write_str("closed"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Handle returned by [`Channel::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

// =============================================================================
// SHARED
// =============================================================================

/// State reachable from both the owning `Channel` and its I/O task.
struct Shared<T> {
    feed: Feed,
    state: watch::Sender<ChannelState>,
    subscribers: Mutex<Vec<(SubscriptionId, Handler<T>)>>,
}

impl<T: DeserializeOwned> Shared<T> {
    /// Move to `to` if the current state satisfies `from`. Returns whether it moved.
    fn transition(&self, from: impl FnOnce(&ChannelState) -> bool, to: ChannelState) -> bool {
        self.state.send_if_modified(|state| {
            if from(state) {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn fail(&self, reason: String) {
        let feed = self.feed;
        if self.transition(ChannelState::is_open, ChannelState::Failed(reason.clone())) {
            warn!(%feed, %reason, "channel: failed");
        }
    }

    fn dispatch(&self, bytes: &[u8]) {
        if !self.state.borrow().is_open() {
            return;
        }

        let message = match serde_json::from_slice::<T>(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!(feed = %self.feed, error = %e, len = bytes.len(), "channel: dropping malformed payload");
                return;
            }
        };

        let handlers: Vec<Handler<T>> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            handler(&message);
        }
    }

    fn clear_subscribers(&self) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

// =============================================================================
// CHANNEL
// =============================================================================

/// One push-based duplex connection delivering `T` messages.
pub struct Channel<T> {
    shared: Arc<Shared<T>>,
    connect_timeout: Duration,
    next_subscription: AtomicU64,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    io_task: Mutex<Option<JoinHandle<()>>>,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Channel<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    #[must_use]
    pub fn new(feed: Feed, connect_timeout: Duration) -> Self {
        let (state, _) = watch::channel(ChannelState::Idle);
        Self {
            shared: Arc::new(Shared { feed, state, subscribers: Mutex::new(Vec::new()) }),
            connect_timeout,
            next_subscription: AtomicU64::new(1),
            outbound: Mutex::new(None),
            io_task: Mutex::new(None),
            _payload: PhantomData,
        }
    }

    #[must_use]
    pub fn feed(&self) -> Feed {
        self.shared.feed
    }

    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.shared.state.borrow().clone()
    }

    /// Observe state transitions.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    /// Connect to `url`. Only the first call on an instance may proceed.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::AlreadyOpened`] on a second call,
    /// [`TransportError::Timeout`] or [`TransportError::Connect`] when the
    /// handshake fails (the channel is then `Failed`).
    pub async fn open(&self, url: &str) -> Result<(), TransportError> {
        let feed = self.shared.feed;
        if !self
            .shared
            .transition(|s| matches!(s, ChannelState::Idle), ChannelState::Connecting)
        {
            return Err(TransportError::AlreadyOpened(self.state()));
        }
        debug!(%feed, %url, "channel: connecting");

        let socket = match tokio::time::timeout(self.connect_timeout, connect_async(url)).await {
            Ok(Ok((socket, _response))) => socket,
            Ok(Err(e)) => return Err(self.connect_failed(TransportError::Connect(e.to_string()))),
            Err(_) => return Err(self.connect_failed(TransportError::Timeout(url.to_owned()))),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);

        if !self
            .shared
            .transition(|s| matches!(s, ChannelState::Connecting), ChannelState::Open)
        {
            // close() ran while the handshake was in flight.
            self.outbound.lock().unwrap_or_else(PoisonError::into_inner).take();
            return Err(TransportError::Connect("channel closed while connecting".to_owned()));
        }

        let (write, read) = socket.split();
        let task = tokio::spawn(run_io(Arc::clone(&self.shared), write, read, rx));
        *self.io_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        info!(%feed, %url, "channel: open");
        Ok(())
    }

    fn connect_failed(&self, err: TransportError) -> TransportError {
        let feed = self.shared.feed;
        if self.shared.transition(
            |s| matches!(s, ChannelState::Connecting),
            ChannelState::Failed(err.to_string()),
        ) {
            warn!(%feed, error = %err, "channel: connect failed");
        }
        err
    }

    /// Wait until the channel leaves `Idle`/`Connecting`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ChannelNotReady`] when it settles anywhere
    /// other than `Open`.
    pub async fn ready(&self) -> Result<(), TransportError> {
        let mut rx = self.watch_state();
        let settled = rx
            .wait_for(|s| !matches!(s, ChannelState::Idle | ChannelState::Connecting))
            .await
            .map(|s| (*s).clone())
            .unwrap_or(ChannelState::Closed);
        if settled.is_open() { Ok(()) } else { Err(TransportError::ChannelNotReady(settled)) }
    }

    /// Register a handler invoked once per inbound message, in delivery order.
    pub fn subscribe(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.shared.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Send one JSON payload. No application-level acknowledgement is implied.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ChannelNotReady`] unless the channel is `Open`.
    pub fn send<P: Serialize>(&self, payload: &P) -> Result<(), TransportError> {
        let state = self.state();
        if !state.is_open() {
            return Err(TransportError::ChannelNotReady(state));
        }

        let text = serde_json::to_string(payload).map_err(|e| TransportError::Encode(e.to_string()))?;
        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = outbound.as_ref() else {
            return Err(TransportError::ChannelNotReady(state));
        };
        tx.send(Message::text(text))
            .map_err(|_| TransportError::Send("connection task stopped".to_owned()))
    }

    /// Release the connection and drop all subscriptions. Safe in any state.
    ///
    /// `Failed` stays `Failed`; every other state ends in `Closed`.
    pub async fn close(&self) {
        let feed = self.shared.feed;
        let closing = self.shared.transition(|s| !s.is_terminal(), ChannelState::Closing);

        if let Some(tx) = self.outbound.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = tx.send(Message::Close(None));
        }
        let task = self.io_task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut task) = task {
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        self.shared.clear_subscribers();

        if closing {
            self.shared
                .transition(|s| matches!(s, ChannelState::Closing), ChannelState::Closed);
            info!(%feed, "channel: closed");
        }
    }
}

impl<T> Drop for Channel<T> {
    fn drop(&mut self) {
        if let Some(task) = self.io_task.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

// =============================================================================
// I/O TASK
// =============================================================================

async fn run_io<T>(
    shared: Arc<Shared<T>>,
    mut write: SplitSink<Socket, Message>,
    mut read: SplitStream<Socket>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) where
    T: DeserializeOwned,
{
    loop {
        tokio::select! {
            msg = outbound.recv() => {
                let Some(msg) = msg else { break };
                let is_close = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    shared.fail(format!("send failed: {e}"));
                    break;
                }
                if is_close {
                    break;
                }
            }
            inbound = read.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => shared.dispatch(text.as_bytes()),
                    Some(Ok(Message::Binary(bytes))) => shared.dispatch(&bytes),
                    Some(Ok(Message::Close(_))) | None => {
                        shared.fail("connection closed by remote".to_owned());
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        shared.fail(e.to_string());
                        break;
                    }
                }
            }
        }
    }
    debug!(feed = %shared.feed, "channel: io task exit");
}
