//! Feed Codec
//!
//! JSON encoding of client frames and validated decoding of server frames.
//!
//! Decoding is the protocol boundary: a frame that is not valid JSON, has an
//! unknown `type`, is missing a required field or carries a semantically
//! invalid candle or trade is rejected here with a [`CodecError`], so one bad
//! message never reaches the store.

use crate::domain::market::InvalidPayload;
use crate::infrastructure::feed::messages::{ClientFrame, ServerFrame};

/// Codec errors. Every variant is a protocol error.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unknown message type.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// Invalid message format.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    /// Frame decoded but its market data is unusable.
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] InvalidPayload),
}

impl CodecError {
    /// Short label for the protocol error metric.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Json(_) => "json",
            Self::UnknownMessageType(_) => "unknown_type",
            Self::InvalidFormat(_) => "invalid_format",
            Self::InvalidPayload(_) => "invalid_payload",
        }
    }
}

/// JSON codec for the feed protocol.
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode and validate one server frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a JSON object, the `type` field is
    /// missing or unknown, a required field is missing, or a candle or trade
    /// fails validation.
    pub fn decode(&self, text: &str) -> Result<ServerFrame, CodecError> {
        let trimmed = text.trim();

        if !trimmed.starts_with('{') {
            let preview: String = trimmed.chars().take(50).collect();
            return Err(CodecError::InvalidFormat(format!(
                "expected JSON object, got: {preview}..."
            )));
        }

        let value: serde_json::Value = serde_json::from_str(trimmed)?;

        let msg_type = value
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CodecError::InvalidFormat("missing type field".to_string()))?;

        if !ServerFrame::TYPES.contains(&msg_type) {
            return Err(CodecError::UnknownMessageType(msg_type.to_string()));
        }

        let frame: ServerFrame = serde_json::from_value(value)?;

        match &frame {
            ServerFrame::KlineUpdate { data, .. } => data.validate()?,
            ServerFrame::TradeUpdate { data, .. } => data.validate()?,
            _ => {}
        }

        Ok(frame)
    }

    /// Encode a client frame.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode(&self, frame: &ClientFrame) -> Result<String, CodecError> {
        Ok(serde_json::to_string(frame)?)
    }
}
