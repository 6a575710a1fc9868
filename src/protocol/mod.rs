//! Wire codec for the engine's websocket protocol.
//!
//! Pure translation between typed values and the JSON text frames the engine
//! speaks; no connection state lives here.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved metadata column carrying the logical timestamp of a streaming row.
pub const TIMESTAMP_COLUMN: &str = "tp_timestamp";
/// Reserved metadata column marking progress-only rows (no data payload).
pub const PROGRESS_COLUMN: &str = "tp_progressed";
/// Reserved metadata column carrying the signed multiplicity of a streaming row.
pub const DIFF_COLUMN: &str = "tp_diff";

/// Advisory, non-fatal diagnostic attached to a command or standalone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    pub message: String,
    pub severity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// Engine-reported failure, fatal to the statement that produced it but not
/// to the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineError {
    pub message: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// One statement of an extended (multi-statement) request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<Option<String>>>,
}

/// Client → engine request. The engine distinguishes the three forms by
/// shape, so the enum serializes untagged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientRequest {
    Auth { token: String },
    Simple { query: String },
    Extended { queries: Vec<Statement> },
}

/// Engine → client event, discriminated by a `type` tag with the body under
/// `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerEvent {
    ReadyForQuery,
    Notice(Notice),
    CommandStarting {
        is_streaming: bool,
        has_rows: bool,
    },
    Rows(Vec<String>),
    Row(Vec<Value>),
    CommandComplete(String),
    Error(EngineError),
}

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("unrecognized engine frame: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Serialize an outbound request into a websocket text frame body.
pub fn encode_request(request: &ClientRequest) -> Result<String, CodecError> {
    serde_json::to_string(request).map_err(CodecError::Encode)
}

/// Decode an inbound text frame into a typed event. A frame that does not
/// match any known event is a protocol fault, not something to skip.
pub fn decode_event(frame: &str) -> Result<ServerEvent, CodecError> {
    serde_json::from_str(frame).map_err(CodecError::Decode)
}
