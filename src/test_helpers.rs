//! Shared fixtures for unit tests: an in-memory `SyncApi` and an in-process
//! HTTP + WebSocket server speaking the same endpoints as the real backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::api::SyncApi;
use crate::error::ApiError;
use crate::types::{ChannelEndpoint, ChatMessage, DrawPixel, Feed, NewMessage, Pixel};

pub fn pixel(x: u32, y: u32, color: &str, author: &str, timestamp: i64) -> Pixel {
    Pixel { x, y, color: color.to_owned(), author_id: author.to_owned(), timestamp }
}

pub fn message(id: &str, author: &str, body: &str, timestamp: i64) -> ChatMessage {
    ChatMessage { id: id.to_owned(), author_id: author.to_owned(), body: body.to_owned(), timestamp }
}

/// Poll `check` until it holds or `limit` elapses.
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

// =============================================================================
// MOCK API
// =============================================================================

/// In-memory `SyncApi` that records writes.
#[derive(Default)]
pub struct MockApi {
    pub pixels: Mutex<Vec<Pixel>>,
    pub messages: Mutex<Vec<ChatMessage>>,
    pub draws: Mutex<Vec<DrawPixel>>,
    pub sends: Mutex<Vec<NewMessage>>,
    pub endpoints: Mutex<HashMap<Feed, String>>,
    pub reject_writes: AtomicBool,
    pub fail_snapshots: AtomicBool,
}

impl MockApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn draw_count(&self) -> usize {
        self.draws.lock().expect("mock mutex should lock").len()
    }

    pub fn send_count(&self) -> usize {
        self.sends.lock().expect("mock mutex should lock").len()
    }

    fn snapshot_guard(&self) -> Result<(), ApiError> {
        if self.fail_snapshots.load(Ordering::SeqCst) {
            Err(ApiError::Status { status: 503, body: "unavailable".into() })
        } else {
            Ok(())
        }
    }

    fn write_guard(&self) -> Result<(), ApiError> {
        if self.reject_writes.load(Ordering::SeqCst) {
            Err(ApiError::Declined("rejected by mock".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl SyncApi for MockApi {
    async fn fetch_canvas(&self) -> Result<Vec<Pixel>, ApiError> {
        self.snapshot_guard()?;
        Ok(self.pixels.lock().expect("mock mutex should lock").clone())
    }

    async fn fetch_pixel(&self, x: u32, y: u32) -> Result<Option<Pixel>, ApiError> {
        self.snapshot_guard()?;
        let pixels = self.pixels.lock().expect("mock mutex should lock");
        Ok(pixels.iter().rev().find(|p| p.key() == (x, y)).cloned())
    }

    async fn fetch_messages(&self) -> Result<Vec<ChatMessage>, ApiError> {
        self.snapshot_guard()?;
        Ok(self.messages.lock().expect("mock mutex should lock").clone())
    }

    async fn resolve_channel(&self, feed: Feed) -> Result<ChannelEndpoint, ApiError> {
        let endpoints = self.endpoints.lock().expect("mock mutex should lock");
        let url = endpoints.get(&feed).cloned().ok_or(ApiError::MissingData)?;
        Ok(ChannelEndpoint { url, channel: Some(feed.to_string()) })
    }

    async fn health(&self) -> bool {
        true
    }

    async fn draw_pixel(&self, request: &DrawPixel) -> Result<(), ApiError> {
        self.write_guard()?;
        self.draws.lock().expect("mock mutex should lock").push(request.clone());
        Ok(())
    }

    async fn send_message(&self, request: &NewMessage) -> Result<(), ApiError> {
        self.write_guard()?;
        self.sends.lock().expect("mock mutex should lock").push(request.clone());
        Ok(())
    }
}

// =============================================================================
// MOCK SERVER
// =============================================================================

/// State behind the in-process server.
pub struct ServerState {
    pub pixels: Mutex<Vec<Pixel>>,
    pub messages: Mutex<Vec<ChatMessage>>,
    pub reject_writes: AtomicBool,
    pub fail_snapshots: AtomicBool,
    canvas_tx: broadcast::Sender<String>,
    chat_tx: broadcast::Sender<String>,
    kick_tx: broadcast::Sender<Feed>,
    next_message_id: AtomicU64,
    clock: AtomicU64,
    ws_base: Mutex<String>,
}

impl ServerState {
    fn sender(&self, feed: Feed) -> &broadcast::Sender<String> {
        match feed {
            Feed::Canvas => &self.canvas_tx,
            Feed::Chat => &self.chat_tx,
        }
    }

    fn tick(&self) -> i64 {
        i64::try_from(self.clock.fetch_add(1, Ordering::SeqCst) + 1).unwrap_or(i64::MAX)
    }
}

pub struct MockServer {
    pub base_url: String,
    pub state: Arc<ServerState>,
    handle: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        let (canvas_tx, _) = broadcast::channel(64);
        let (chat_tx, _) = broadcast::channel(64);
        let (kick_tx, _) = broadcast::channel(8);
        let state = Arc::new(ServerState {
            pixels: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
            reject_writes: AtomicBool::new(false),
            fail_snapshots: AtomicBool::new(false),
            canvas_tx,
            chat_tx,
            kick_tx,
            next_message_id: AtomicU64::new(1),
            clock: AtomicU64::new(1000),
            ws_base: Mutex::new(String::new()),
        });

        let app = Router::new()
            .route("/getCanvas", get(get_canvas))
            .route("/getPixel", get(get_pixel))
            .route("/getMessages", get(get_messages))
            .route("/getWebSocketURL", get(get_websocket_url))
            .route("/health", get(health))
            .route("/drawPixel", post(draw_pixel))
            .route("/sendMessage", post(send_message))
            .route("/ws/canvas", get(ws_canvas))
            .route("/ws/chat", get(ws_chat))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("mock server addr");
        *state.ws_base.lock().expect("mock mutex should lock") = format!("ws://{addr}");

        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { base_url: format!("http://{addr}"), state, handle }
    }

    pub fn ws_url(&self, feed: Feed) -> String {
        let base = self.state.ws_base.lock().expect("mock mutex should lock").clone();
        format!("{base}/ws/{feed}")
    }

    pub fn seed_pixels(&self, pixels: Vec<Pixel>) {
        *self.state.pixels.lock().expect("mock mutex should lock") = pixels;
    }

    pub fn seed_messages(&self, messages: Vec<ChatMessage>) {
        *self.state.messages.lock().expect("mock mutex should lock") = messages;
    }

    /// Push a raw text frame to every socket on `feed`.
    pub fn push_raw(&self, feed: Feed, text: impl Into<String>) {
        let _ = self.state.sender(feed).send(text.into());
    }

    pub fn push_pixel(&self, pixel: &Pixel) {
        self.push_raw(Feed::Canvas, serde_json::to_string(pixel).expect("encode pixel"));
    }

    pub fn push_message(&self, message: &ChatMessage) {
        self.push_raw(Feed::Chat, serde_json::to_string(message).expect("encode message"));
    }

    /// Drop every open socket on `feed` without a close handshake.
    pub fn kick(&self, feed: Feed) {
        let _ = self.state.kick_tx.send(feed);
    }

    pub fn subscriber_count(&self, feed: Feed) -> usize {
        self.state.sender(feed).receiver_count()
    }

    /// Wait until `count` sockets are listening on `feed`.
    pub async fn wait_for_subscribers(&self, feed: Feed, count: usize) {
        let ok = eventually(Duration::from_secs(3), || self.subscriber_count(feed) >= count).await;
        assert!(ok, "timed out waiting for {count} {feed} subscribers");
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn ok(data: Value) -> Response {
    Json(json!({ "success": true, "data": data })).into_response()
}

fn unavailable() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "snapshot unavailable").into_response()
}

async fn get_canvas(State(state): State<Arc<ServerState>>) -> Response {
    if state.fail_snapshots.load(Ordering::SeqCst) {
        return unavailable();
    }
    let pixels = state.pixels.lock().expect("mock mutex should lock").clone();
    ok(json!(pixels))
}

async fn get_pixel(State(state): State<Arc<ServerState>>, Query(params): Query<HashMap<String, u32>>) -> Response {
    let (Some(&x), Some(&y)) = (params.get("x"), params.get("y")) else {
        return (StatusCode::BAD_REQUEST, "x and y required").into_response();
    };
    let pixels = state.pixels.lock().expect("mock mutex should lock");
    match pixels.iter().rev().find(|p| p.key() == (x, y)) {
        Some(p) => ok(json!(p)),
        None => Json(json!({ "success": true })).into_response(),
    }
}

async fn get_messages(State(state): State<Arc<ServerState>>) -> Response {
    if state.fail_snapshots.load(Ordering::SeqCst) {
        return unavailable();
    }
    let messages = state.messages.lock().expect("mock mutex should lock").clone();
    ok(json!(messages))
}

async fn get_websocket_url(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let feed = match params.get("type").map(String::as_str) {
        Some("canvas") => Feed::Canvas,
        Some("chat") => Feed::Chat,
        _ => return Json(json!({ "success": false, "error": "unknown type" })).into_response(),
    };
    let base = state.ws_base.lock().expect("mock mutex should lock").clone();
    let url = format!("{base}/ws/{feed}");
    ok(json!({ "websocketUrl": url, "channel": feed }))
}

async fn health() -> Response {
    Json(json!({ "success": true, "data": { "status": "ok" } })).into_response()
}

async fn draw_pixel(State(state): State<Arc<ServerState>>, Json(body): Json<DrawPixel>) -> Response {
    if state.reject_writes.load(Ordering::SeqCst) {
        return Json(json!({ "success": false, "error": "pixel rejected" })).into_response();
    }
    let pixel = Pixel { x: body.x, y: body.y, color: body.color, author_id: body.author_id, timestamp: state.tick() };
    state.pixels.lock().expect("mock mutex should lock").push(pixel.clone());
    let _ = state.canvas_tx.send(serde_json::to_string(&pixel).expect("encode pixel"));
    ok(json!(pixel))
}

async fn send_message(State(state): State<Arc<ServerState>>, Json(body): Json<NewMessage>) -> Response {
    if state.reject_writes.load(Ordering::SeqCst) {
        return Json(json!({ "success": false, "error": "message rejected" })).into_response();
    }
    let id = format!("m{}", state.next_message_id.fetch_add(1, Ordering::SeqCst));
    let message = ChatMessage { id, author_id: body.author_id, body: body.body, timestamp: state.tick() };
    state.messages.lock().expect("mock mutex should lock").push(message.clone());
    let _ = state.chat_tx.send(serde_json::to_string(&message).expect("encode message"));
    ok(json!(message))
}

async fn ws_canvas(State(state): State<Arc<ServerState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| pump(socket, state, Feed::Canvas))
}

async fn ws_chat(State(state): State<Arc<ServerState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| pump(socket, state, Feed::Chat))
}

/// Forward broadcast frames to one socket until the client leaves or is kicked.
async fn pump(mut socket: WebSocket, state: Arc<ServerState>, feed: Feed) {
    let mut rx = state.sender(feed).subscribe();
    let mut kick = state.kick_tx.subscribe();
    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Ok(text) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            kicked = kick.recv() => {
                if kicked.is_ok_and(|f| f == feed) {
                    break;
                }
            }
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}
