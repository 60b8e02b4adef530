//! Session coordinator: wires channels, snapshots and synchronizers together.
//!
//! DESIGN
//! ======
//! A session owns one link per feed (a live channel plus the queue its
//! subscriber fills) and both synchronizers. All replica mutations happen
//! inside `&mut self` methods, so the session is the only writer and the
//! synchronizers need no locks.
//!
//! Bringing a feed up follows the same order on startup and on reconnect:
//!
//! ```text
//! resolve url -> new channel -> subscribe queue -> open -> fetch snapshot
//!             -> initialize replica -> drain queued live messages
//! ```
//!
//! The queue is subscribed before the snapshot request goes out, so nothing
//! published in between is lost; queued messages are merged strictly after
//! the snapshot.
//!
//! `next_event` is the cooperative loop. It services live messages, channel
//! state changes, write outcomes and finished reconnect attempts one at a
//! time and reports each as a `SessionEvent`.
//!
//! ERROR HANDLING
//! ==============
//! Transport and snapshot failures never escape as `Err`; they become
//! `FeedStatus`/`FeedError` events and a backoff-scheduled reconnect.
//! Validation errors are returned synchronously by the write methods before
//! any request is sent. A rejected write surfaces as `WriteRejected` and only
//! releases its pending marker.
//!
//! SYSTEM CONTEXT
//! ==============
//! Reconnect always re-fetches the full snapshot. That costs one grid and one
//! chat history per reconnect, which grows with canvas size and chat length.

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::SyncApi;
use crate::channel::{Channel, ChannelState};
use crate::config::{ReconnectPolicy, SnapshotFallback, SyncConfig};
use crate::error::{SyncError, TransportError};
use crate::snapshot::SnapshotLoader;
use crate::sync::{CanvasSync, ChatSync, PendingSend, PendingWrite, RemoteAppend, RemoteApply};
use crate::types::{ChatMessage, Feed, Pixel};

// =============================================================================
// EVENTS
// =============================================================================

/// What changed, for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    PixelApplied { pixel: Pixel, outcome: RemoteApply },
    MessageAppended { message: ChatMessage, outcome: RemoteAppend },
    /// Connectivity of a feed changed.
    FeedStatus { feed: Feed, state: ChannelState },
    /// The replica was rebuilt from a fresh snapshot; redraw everything.
    Resynchronized { feed: Feed },
    WriteRejected { feed: Feed, reason: String },
    FeedError { feed: Feed, error: SyncError },
}

// =============================================================================
// LINKS
// =============================================================================

/// A feed's live channel and the queue its subscriber fills.
struct Link<T> {
    channel: Channel<T>,
    inbound: mpsc::UnboundedReceiver<T>,
    state: watch::Receiver<ChannelState>,
}

/// A connected link together with the snapshot fetched on it.
struct Established<T> {
    link: Link<T>,
    snapshot: Vec<T>,
    /// Set when the snapshot failed and the empty baseline was used instead.
    snapshot_error: Option<SyncError>,
}

#[derive(Debug, Clone, Copy)]
struct LinkSettings {
    connect_timeout: Duration,
    fallback: SnapshotFallback,
}

enum Signal<T> {
    Message(T),
    State(ChannelState),
}

async fn connect<T>(api: &dyn SyncApi, feed: Feed, connect_timeout: Duration) -> Result<Link<T>, SyncError>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    let endpoint = api
        .resolve_channel(feed)
        .await
        .map_err(|e| TransportError::Resolve(e.to_string()))?;

    let channel = Channel::new(feed, connect_timeout);
    let (tx, inbound) = mpsc::unbounded_channel();
    channel.subscribe(move |message: &T| {
        let _ = tx.send(message.clone());
    });
    let state = channel.watch_state();
    channel.open(&endpoint.url).await?;
    Ok(Link { channel, inbound, state })
}

async fn settle<T>(
    link: Link<T>,
    snapshot: Result<Vec<T>, SyncError>,
    fallback: SnapshotFallback,
) -> Result<Established<T>, SyncError>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    match (snapshot, fallback) {
        (Ok(snapshot), _) => Ok(Established { link, snapshot, snapshot_error: None }),
        (Err(e), SnapshotFallback::EmptyBaseline) => {
            warn!(feed = %link.channel.feed(), error = %e, "session: using empty baseline");
            Ok(Established { link, snapshot: Vec::new(), snapshot_error: Some(e) })
        }
        (Err(e), SnapshotFallback::Retry) => {
            link.channel.close().await;
            Err(e)
        }
    }
}

async fn establish_canvas(api: Arc<dyn SyncApi>, settings: LinkSettings) -> Result<Established<Pixel>, SyncError> {
    let link = connect(api.as_ref(), Feed::Canvas, settings.connect_timeout).await?;
    let snapshot = SnapshotLoader::new(api).fetch_canvas_snapshot().await;
    settle(link, snapshot, settings.fallback).await
}

async fn establish_chat(api: Arc<dyn SyncApi>, settings: LinkSettings) -> Result<Established<ChatMessage>, SyncError> {
    let link = connect(api.as_ref(), Feed::Chat, settings.connect_timeout).await?;
    let snapshot = SnapshotLoader::new(api).fetch_chat_snapshot().await;
    settle(link, snapshot, settings.fallback).await
}

/// Next queued message or state change on `link`. Pends forever without a link.
async fn next_signal<T>(link: &mut Option<Link<T>>) -> Signal<T> {
    let Some(link) = link else {
        return std::future::pending().await;
    };
    tokio::select! {
        biased;
        Some(message) = link.inbound.recv() => Signal::Message(message),
        Ok(()) = link.state.changed() => Signal::State(link.state.borrow_and_update().clone()),
        else => std::future::pending().await,
    }
}

// =============================================================================
// BACKGROUND WORK
// =============================================================================

/// Results reported back to the loop by spawned tasks.
enum Outcome {
    Draw(PendingWrite, Result<(), SyncError>),
    Send(PendingSend, Result<(), SyncError>),
    CanvasLink(Result<Established<Pixel>, SyncError>),
    ChatLink(Result<Established<ChatMessage>, SyncError>),
}

/// Everything a spawned task needs from the session.
struct Context {
    api: Arc<dyn SyncApi>,
    settings: LinkSettings,
    reconnect: ReconnectPolicy,
    outcomes: mpsc::UnboundedSender<Outcome>,
}

// =============================================================================
// FEED SLOTS
// =============================================================================

/// Feed-specific half of the session: how a replica consumes its feed.
trait Replica {
    type Item: DeserializeOwned + Clone + Send + Sync + 'static;
    const FEED: Feed;

    fn reset(&mut self, snapshot: Vec<Self::Item>);

    /// Merge one live item, returning the event to report (if any).
    fn merge(&mut self, item: Self::Item) -> Option<SessionEvent>;

    fn finish(&mut self);

    fn spawn_attempt(ctx: &Context, delay: Duration) -> JoinHandle<()>;
}

impl Replica for CanvasSync {
    type Item = Pixel;
    const FEED: Feed = Feed::Canvas;

    fn reset(&mut self, snapshot: Vec<Pixel>) {
        self.initialize(snapshot);
    }

    fn merge(&mut self, pixel: Pixel) -> Option<SessionEvent> {
        match self.apply_remote_update(pixel.clone()) {
            RemoteApply::Ignored => None,
            outcome => Some(SessionEvent::PixelApplied { pixel, outcome }),
        }
    }

    fn finish(&mut self) {
        self.tear_down();
    }

    fn spawn_attempt(ctx: &Context, delay: Duration) -> JoinHandle<()> {
        let (api, settings, tx) = (Arc::clone(&ctx.api), ctx.settings, ctx.outcomes.clone());
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let result = establish_canvas(api, settings).await;
            let _ = tx.send(Outcome::CanvasLink(result));
        })
    }
}

impl Replica for ChatSync {
    type Item = ChatMessage;
    const FEED: Feed = Feed::Chat;

    fn reset(&mut self, snapshot: Vec<ChatMessage>) {
        self.initialize(snapshot);
    }

    fn merge(&mut self, message: ChatMessage) -> Option<SessionEvent> {
        match self.apply_remote_message(message.clone()) {
            RemoteAppend::Duplicate | RemoteAppend::Ignored => None,
            outcome => Some(SessionEvent::MessageAppended { message, outcome }),
        }
    }

    fn finish(&mut self) {
        self.tear_down();
    }

    fn spawn_attempt(ctx: &Context, delay: Duration) -> JoinHandle<()> {
        let (api, settings, tx) = (Arc::clone(&ctx.api), ctx.settings, ctx.outcomes.clone());
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let result = establish_chat(api, settings).await;
            let _ = tx.send(Outcome::ChatLink(result));
        })
    }
}

/// One feed: its replica, current link and reconnect bookkeeping.
struct FeedSlot<R: Replica> {
    replica: R,
    link: Option<Link<R::Item>>,
    /// Reported state while there is no link.
    status: ChannelState,
    /// Consecutive failed attempts since the last successful link.
    attempt: u32,
    reconnect: Option<JoinHandle<()>>,
}

impl<R: Replica> FeedSlot<R> {
    fn new(replica: R) -> Self {
        Self { replica, link: None, status: ChannelState::Connecting, attempt: 0, reconnect: None }
    }

    fn state(&self) -> ChannelState {
        self.link
            .as_ref()
            .map_or_else(|| self.status.clone(), |link| link.channel.state())
    }

    fn is_idle(&self) -> bool {
        self.link.is_none() && self.reconnect.is_none()
    }

    async fn drop_link(&mut self) {
        if let Some(link) = self.link.take() {
            link.channel.close().await;
        }
    }

    async fn on_signal(&mut self, ctx: &Context, signal: Signal<R::Item>, backlog: &mut VecDeque<SessionEvent>) {
        match signal {
            Signal::Message(item) => backlog.extend(self.replica.merge(item)),
            Signal::State(ChannelState::Failed(reason)) => self.on_lost(ctx, reason, backlog).await,
            Signal::State(ChannelState::Closed) => self.on_lost(ctx, "closed".to_owned(), backlog).await,
            Signal::State(state) => debug!(feed = %R::FEED, %state, "session: channel state"),
        }
    }

    async fn on_lost(&mut self, ctx: &Context, reason: String, backlog: &mut VecDeque<SessionEvent>) {
        warn!(feed = %R::FEED, %reason, "session: feed lost");
        self.drop_link().await;
        let state = ChannelState::Failed(reason);
        self.status = state.clone();
        backlog.push_back(SessionEvent::FeedStatus { feed: R::FEED, state });
        self.schedule(ctx, backlog);
    }

    fn schedule(&mut self, ctx: &Context, backlog: &mut VecDeque<SessionEvent>) {
        self.attempt += 1;
        if !ctx.reconnect.allows(self.attempt) {
            let reason = format!("gave up after {} attempts", self.attempt - 1);
            warn!(feed = %R::FEED, %reason, "session: reconnect exhausted");
            self.status = ChannelState::Failed(reason.clone());
            backlog.push_back(SessionEvent::FeedError {
                feed: R::FEED,
                error: SyncError::Transport(TransportError::Connect(reason)),
            });
            return;
        }

        let delay = ctx.reconnect.delay_for(self.attempt);
        info!(
            feed = %R::FEED,
            attempt = self.attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "session: reconnect scheduled"
        );
        self.status = ChannelState::Connecting;
        backlog.push_back(SessionEvent::FeedStatus { feed: R::FEED, state: ChannelState::Connecting });
        self.reconnect = Some(R::spawn_attempt(ctx, delay));
    }

    async fn on_link(
        &mut self,
        ctx: &Context,
        result: Result<Established<R::Item>, SyncError>,
        backlog: &mut VecDeque<SessionEvent>,
    ) {
        self.reconnect = None;
        let established = match result {
            Ok(established) => established,
            Err(error) => {
                warn!(feed = %R::FEED, %error, "session: feed setup failed");
                self.status = ChannelState::Failed(error.to_string());
                backlog.push_back(SessionEvent::FeedError { feed: R::FEED, error });
                self.schedule(ctx, backlog);
                return;
            }
        };

        let Established { mut link, snapshot, snapshot_error } = established;
        let current = link.state.borrow_and_update().clone();
        if !current.is_open() {
            link.channel.close().await;
            let reason = format!("channel {current} before snapshot was applied");
            backlog.push_back(SessionEvent::FeedError {
                feed: R::FEED,
                error: SyncError::Transport(TransportError::Connect(reason.clone())),
            });
            self.status = ChannelState::Failed(reason);
            self.schedule(ctx, backlog);
            return;
        }

        self.replica.reset(snapshot);
        let mut queued = 0usize;
        while let Ok(item) = link.inbound.try_recv() {
            self.replica.merge(item);
            queued += 1;
        }
        info!(feed = %R::FEED, queued, "session: feed synchronized");

        self.attempt = 0;
        self.status = ChannelState::Open;
        self.link = Some(link);
        backlog.push_back(SessionEvent::FeedStatus { feed: R::FEED, state: ChannelState::Open });
        backlog.push_back(SessionEvent::Resynchronized { feed: R::FEED });
        if let Some(error) = snapshot_error {
            backlog.push_back(SessionEvent::FeedError { feed: R::FEED, error });
        }
    }

    async fn shut_down(&mut self) {
        if let Some(task) = self.reconnect.take() {
            task.abort();
        }
        self.drop_link().await;
        self.replica.finish();
        self.status = ChannelState::Closed;
    }
}

impl<R: Replica> Drop for FeedSlot<R> {
    fn drop(&mut self) {
        if let Some(task) = self.reconnect.take() {
            task.abort();
        }
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// A live, synchronized view of the canvas and the chat.
pub struct Session {
    config: SyncConfig,
    ctx: Context,
    canvas: FeedSlot<CanvasSync>,
    chat: FeedSlot<ChatSync>,
    outcomes: mpsc::UnboundedReceiver<Outcome>,
    backlog: VecDeque<SessionEvent>,
    in_flight: usize,
    closed: bool,
}

impl Session {
    /// Bring up both feeds. Feeds that fail to come up are retried in the
    /// background; their failures are the first events `next_event` returns.
    pub async fn start(config: SyncConfig, api: Arc<dyn SyncApi>) -> Self {
        let (tx, outcomes) = mpsc::unbounded_channel();
        let ctx = Context {
            api,
            settings: LinkSettings { connect_timeout: config.connect_timeout, fallback: config.snapshot_fallback },
            reconnect: config.reconnect,
            outcomes: tx,
        };
        let mut session = Self {
            canvas: FeedSlot::new(CanvasSync::new(config.canvas_width, config.canvas_height)),
            chat: FeedSlot::new(ChatSync::new()),
            config,
            ctx,
            outcomes,
            backlog: VecDeque::new(),
            in_flight: 0,
            closed: false,
        };

        info!(base_url = %session.config.base_url, author = %session.config.author_id, "session: starting");
        let (canvas, chat) = tokio::join!(
            establish_canvas(Arc::clone(&session.ctx.api), session.ctx.settings),
            establish_chat(Arc::clone(&session.ctx.api), session.ctx.settings),
        );
        session.canvas.on_link(&session.ctx, canvas, &mut session.backlog).await;
        session.chat.on_link(&session.ctx, chat, &mut session.backlog).await;
        session
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub fn author_id(&self) -> &str {
        &self.config.author_id
    }

    #[must_use]
    pub fn canvas(&self) -> &CanvasSync {
        &self.canvas.replica
    }

    #[must_use]
    pub fn chat(&self) -> &ChatSync {
        &self.chat.replica
    }

    /// Current connectivity of `feed`.
    #[must_use]
    pub fn feed_state(&self, feed: Feed) -> ChannelState {
        match feed {
            Feed::Canvas => self.canvas.state(),
            Feed::Chat => self.chat.state(),
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub async fn health(&self) -> bool {
        self.ctx.api.health().await
    }

    /// Paint a pixel locally and submit it.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] for bad coordinates or color (no
    /// request is sent) and [`SyncError::SessionClosed`] after shutdown.
    pub fn draw_pixel(&mut self, x: i64, y: i64, color: &str) -> Result<PendingWrite, SyncError> {
        if self.closed {
            return Err(SyncError::SessionClosed);
        }
        let write = self
            .canvas
            .replica
            .apply_local_write(x, y, color, &self.config.author_id)?;
        debug!(x, y, color = %write.pixel().color, "session: draw submitted");

        let (api, tx, task_write) = (Arc::clone(&self.ctx.api), self.ctx.outcomes.clone(), write.clone());
        self.in_flight += 1;
        tokio::spawn(async move {
            let result = task_write.submit(api.as_ref()).await;
            let _ = tx.send(Outcome::Draw(task_write, result));
        });
        Ok(write)
    }

    /// Queue a chat message and submit it. It joins the log when the chat
    /// feed echoes it.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SessionClosed`] after shutdown,
    /// [`TransportError::ChannelNotReady`] unless the chat feed is open, and
    /// [`SyncError::Validation`] for a blank body.
    pub fn send_message(&mut self, body: &str) -> Result<PendingSend, SyncError> {
        if self.closed {
            return Err(SyncError::SessionClosed);
        }
        let state = self.chat.state();
        if !state.is_open() {
            return Err(TransportError::ChannelNotReady(state).into());
        }
        let send = self.chat.replica.apply_local_send(&self.config.author_id, body)?;
        debug!(local_id = %send.local_id(), "session: message submitted");

        let (api, tx, task_send) = (Arc::clone(&self.ctx.api), self.ctx.outcomes.clone(), send.clone());
        self.in_flight += 1;
        tokio::spawn(async move {
            let result = task_send.submit(api.as_ref()).await;
            let _ = tx.send(Outcome::Send(task_send, result));
        });
        Ok(send)
    }

    /// Wait for and apply the next change.
    ///
    /// Returns `None` after [`Session::shutdown`], or once both feeds have
    /// given up reconnecting and no writes are outstanding.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                return Some(event);
            }
            if self.closed || (self.canvas.is_idle() && self.chat.is_idle() && self.in_flight == 0) {
                return None;
            }

            tokio::select! {
                biased;
                Some(outcome) = self.outcomes.recv() => self.on_outcome(outcome).await,
                signal = next_signal(&mut self.canvas.link) => {
                    self.canvas.on_signal(&self.ctx, signal, &mut self.backlog).await;
                }
                signal = next_signal(&mut self.chat.link) => {
                    self.chat.on_signal(&self.ctx, signal, &mut self.backlog).await;
                }
            }
        }
    }

    async fn on_outcome(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Draw(write, result) => {
                self.in_flight = self.in_flight.saturating_sub(1);
                if let Err(error) = result {
                    self.canvas.replica.resolve_rejected(&write);
                    self.backlog.push_back(write_failed(Feed::Canvas, error));
                }
            }
            Outcome::Send(send, result) => {
                self.in_flight = self.in_flight.saturating_sub(1);
                if let Err(error) = result {
                    self.chat.replica.resolve_rejected(&send);
                    self.backlog.push_back(write_failed(Feed::Chat, error));
                }
            }
            Outcome::CanvasLink(result) => self.canvas.on_link(&self.ctx, result, &mut self.backlog).await,
            Outcome::ChatLink(result) => self.chat.on_link(&self.ctx, result, &mut self.backlog).await,
        }
    }

    /// Close both feeds and stop. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.canvas.shut_down().await;
        self.chat.shut_down().await;
        self.backlog.clear();
        info!("session: shut down");
    }
}

fn write_failed(feed: Feed, error: SyncError) -> SessionEvent {
    warn!(%feed, %error, "session: write failed");
    match error {
        SyncError::WriteRejected(reason) => SessionEvent::WriteRejected { feed, reason },
        error => SessionEvent::FeedError { feed, error },
    }
}
