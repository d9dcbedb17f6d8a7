//! JSON wire format shared by the HTTP endpoints and the push channel.
//!
//! ```text
//! GET  /board         → {"board": {"x,y": "color", ...}}
//! POST /update_pixel  ← {"x", "y", "color", "user_id", "username"}
//!                     → {"message", "x", "y", "color"} | {"detail", "retry_after"?}
//! POST /token         ← {"username"} → {"access_token", "token_type", "user_id"}
//! WS   /ws            → {"x", "y", "color"} per accepted update
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use pixelboard_core::{BoardDimensions, BoardSnapshot, Color, PixelChange};

/// Push-channel frame. One per accepted update.
pub type PixelMessage = PixelChange;

/// Body of `GET /board`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardResponse {
    pub board: BTreeMap<String, Color>,
}

impl BoardResponse {
    pub fn from_snapshot(snapshot: &BoardSnapshot) -> Self {
        Self {
            board: snapshot.to_wire_map(),
        }
    }

    pub fn into_snapshot(self, dims: BoardDimensions) -> BoardSnapshot {
        BoardSnapshot::from_wire_map(dims, &self.board)
    }
}

/// Body of `POST /update_pixel`.
///
/// Coordinates are signed and the color is free text on the wire so that bad
/// input reaches validation (and a 400) instead of failing deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePixelRequest {
    pub x: i64,
    pub y: i64,
    pub color: String,
    pub user_id: String,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePixelResponse {
    pub message: String,
    pub x: u32,
    pub y: u32,
    pub color: Color,
}

impl UpdatePixelResponse {
    pub fn applied(change: PixelChange) -> Self {
        Self {
            message: "Pixel updated successfully".to_string(),
            x: change.x,
            y: change.y,
            color: change.color,
        }
    }
}

/// Error body for every non-2xx response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
    /// Seconds until the caller may retry (429 only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<f64>,
}

impl ErrorBody {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
            retry_after: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRequest {
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub user_id: String,
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(#[source] serde_json::Error),
    #[error("Deserialization error: {0}")]
    Deserialization(#[source] serde_json::Error),
}

/// Encode a push frame.
pub fn encode_push(msg: &PixelMessage) -> Result<String, ProtocolError> {
    serde_json::to_string(msg).map_err(ProtocolError::Serialization)
}

/// Decode a push frame.
pub fn decode_push(text: &str) -> Result<PixelMessage, ProtocolError> {
    serde_json::from_str(text).map_err(ProtocolError::Deserialization)
}
