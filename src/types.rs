//! Wire records shared by the HTTP endpoints and the live feeds.
//!
//! DESIGN
//! ======
//! Every payload is a field-named JSON record. Unknown fields are ignored so
//! the server can grow its schema without breaking older clients. Field names
//! on the wire follow the server (`userId`, `time`, `message`); the
//! `authorId`/`timestamp`/`body` spellings are accepted as aliases.

#[cfg(test)]
#[path = "types_test.rs"]
mod tests;

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

// =============================================================================
// FEED
// =============================================================================

/// One of the two independent live streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feed {
    Canvas,
    Chat,
}

impl Feed {
    /// Query value used by the channel directory endpoint.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Canvas => "canvas",
            Self::Chat => "chat",
        }
    }
}

impl fmt::Display for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// PIXEL
// =============================================================================

/// One painted cell. Identity key is `(x, y)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pixel {
    pub x: u32,
    pub y: u32,
    pub color: String,
    #[serde(rename = "userId", alias = "authorId")]
    pub author_id: String,
    #[serde(rename = "time", alias = "timestamp", default)]
    pub timestamp: i64,
}

impl Pixel {
    #[must_use]
    pub fn key(&self) -> (u32, u32) {
        (self.x, self.y)
    }
}

/// Body of `POST /drawPixel`. The server assigns the authoritative time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawPixel {
    pub x: u32,
    pub y: u32,
    pub color: String,
    #[serde(rename = "userId")]
    pub author_id: String,
}

impl From<&Pixel> for DrawPixel {
    fn from(pixel: &Pixel) -> Self {
        Self { x: pixel.x, y: pixel.y, color: pixel.color.clone(), author_id: pixel.author_id.clone() }
    }
}

// =============================================================================
// CHAT
// =============================================================================

/// One chat entry. Identity key is the server-assigned `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    #[serde(rename = "userId", alias = "authorId")]
    pub author_id: String,
    #[serde(rename = "message", alias = "body")]
    pub body: String,
    #[serde(rename = "time", alias = "timestamp", default)]
    pub timestamp: i64,
}

/// Body of `POST /sendMessage`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    #[serde(rename = "userId")]
    pub author_id: String,
    #[serde(rename = "message")]
    pub body: String,
}

// =============================================================================
// DIRECTORY
// =============================================================================

/// Reply of the channel directory: where to open the live feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEndpoint {
    #[serde(rename = "websocketUrl", alias = "url")]
    pub url: String,
    #[serde(default)]
    pub channel: Option<String>,
}

// =============================================================================
// HELPERS
// =============================================================================

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

/// Normalize a user-supplied color to lowercase `#rrggbb`.
///
/// Accepts `#rgb` and `#rrggbb` (any case, surrounding whitespace ignored).
///
/// # Errors
///
/// Returns [`ValidationError::InvalidColor`] for anything else.
pub fn canonical_color(raw: &str) -> Result<String, ValidationError> {
    let invalid = || ValidationError::InvalidColor(raw.to_owned());

    let hex = raw.trim().strip_prefix('#').ok_or_else(invalid)?;
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid());
    }

    let expanded = match hex.len() {
        3 => hex.chars().flat_map(|c| [c, c]).collect::<String>(),
        6 => hex.to_owned(),
        _ => return Err(invalid()),
    };
    Ok(format!("#{}", expanded.to_ascii_lowercase()))
}
