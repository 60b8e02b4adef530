//! HTTP endpoints: snapshot reads, channel directory, health, and writes.
//!
//! DESIGN
//! ======
//! `SyncApi` is the seam between the synchronization core and the server.
//! `HttpApi` is the production implementation over `reqwest`; tests swap in
//! an in-memory mock. Every endpoint answers with the same JSON envelope
//! (`success`, `data`, `error`); `parse_envelope` is pure so it can be tested
//! without a server.
//!
//! ERROR HANDLING
//! ==============
//! Transport failures, non-2xx statuses, malformed bodies and
//! `success: false` each map to a distinct `ApiError` variant. Callers decide
//! what those mean (snapshot unavailable, write rejected, resolve failure).

#[cfg(test)]
#[path = "api_test.rs"]
mod tests;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::error::ApiError;
use crate::types::{ChannelEndpoint, ChatMessage, DrawPixel, Feed, NewMessage, Pixel};

// =============================================================================
// TRAIT
// =============================================================================

/// Requests the synchronization core issues against the server.
#[async_trait::async_trait]
pub trait SyncApi: Send + Sync {
    /// Every painted pixel.
    async fn fetch_canvas(&self) -> Result<Vec<Pixel>, ApiError>;

    /// One pixel, or `None` when the cell is unpainted.
    async fn fetch_pixel(&self, x: u32, y: u32) -> Result<Option<Pixel>, ApiError>;

    /// Chat history, oldest first.
    async fn fetch_messages(&self) -> Result<Vec<ChatMessage>, ApiError>;

    /// Where to open the live channel for `feed`.
    async fn resolve_channel(&self, feed: Feed) -> Result<ChannelEndpoint, ApiError>;

    /// Liveness probe. Never errors; an unreachable server is `false`.
    async fn health(&self) -> bool;

    async fn draw_pixel(&self, request: &DrawPixel) -> Result<(), ApiError>;

    async fn send_message(&self, request: &NewMessage) -> Result<(), ApiError>;
}

// =============================================================================
// ENVELOPE
// =============================================================================

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

/// Decode a response body into the envelope's `data`.
///
/// Returns `Ok(None)` for a successful envelope without data.
fn parse_envelope<T: DeserializeOwned>(status: u16, text: &str) -> Result<Option<T>, ApiError> {
    if !(200..300).contains(&status) {
        return Err(ApiError::Status { status, body: text.to_owned() });
    }

    let envelope: Envelope<T> = serde_json::from_str(text).map_err(|e| ApiError::Parse(e.to_string()))?;
    if !envelope.success {
        return Err(ApiError::Declined(envelope.error.unwrap_or_else(|| "request failed".to_owned())));
    }
    Ok(envelope.data)
}

fn require_data<T>(data: Option<T>) -> Result<T, ApiError> {
    data.ok_or(ApiError::MissingData)
}

// =============================================================================
// HTTP CLIENT
// =============================================================================

/// `SyncApi` over HTTP.
pub struct HttpApi {
    http: reqwest::Client,
    base_url: String,
}

impl HttpApi {
    /// Build a client with the configured timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::ClientBuild`] if the TLS backend fails to initialize.
    pub fn new(config: &SyncConfig) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ApiError::ClientBuild(e.to_string()))?;
        Ok(Self { http, base_url: config.base_url.clone() })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<Option<T>, ApiError> {
        let response = self
            .http
            .get(self.url(path))
            .query(query)
            .send()
            .await
            .map_err(|e| ApiError::Request(e.to_string()))?;
        read_envelope(path, response).await
    }

    async fn post<B: serde::Serialize + Sync>(&self, path: &str, body: &B) -> Result<(), ApiError> {
        let response = self
            .http
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| ApiError::Request(e.to_string()))?;
        read_envelope::<serde_json::Value>(path, response).await.map(|_| ())
    }
}

async fn read_envelope<T: DeserializeOwned>(path: &str, response: reqwest::Response) -> Result<Option<T>, ApiError> {
    let status = response.status().as_u16();
    let text = response.text().await.map_err(|e| ApiError::Request(e.to_string()))?;
    let result = parse_envelope(status, &text);
    match &result {
        Ok(_) => debug!(path, status, "api: ok"),
        Err(e) => warn!(path, status, error = %e, "api: request failed"),
    }
    result
}

#[async_trait::async_trait]
impl SyncApi for HttpApi {
    async fn fetch_canvas(&self) -> Result<Vec<Pixel>, ApiError> {
        Ok(self.get::<Vec<Pixel>>("/getCanvas", &[]).await?.unwrap_or_default())
    }

    async fn fetch_pixel(&self, x: u32, y: u32) -> Result<Option<Pixel>, ApiError> {
        self.get("/getPixel", &[("x", x.to_string()), ("y", y.to_string())]).await
    }

    async fn fetch_messages(&self) -> Result<Vec<ChatMessage>, ApiError> {
        Ok(self.get::<Vec<ChatMessage>>("/getMessages", &[]).await?.unwrap_or_default())
    }

    async fn resolve_channel(&self, feed: Feed) -> Result<ChannelEndpoint, ApiError> {
        let endpoint = self.get("/getWebSocketURL", &[("type", feed.as_str().to_owned())]).await?;
        require_data(endpoint)
    }

    async fn health(&self) -> bool {
        self.get::<serde_json::Value>("/health", &[]).await.is_ok()
    }

    async fn draw_pixel(&self, request: &DrawPixel) -> Result<(), ApiError> {
        self.post("/drawPixel", request).await
    }

    async fn send_message(&self, request: &NewMessage) -> Result<(), ApiError> {
        self.post("/sendMessage", request).await
    }
}
