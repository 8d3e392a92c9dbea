//! Supervisor ↔ worker wire protocol.
//!
//! Protocol version 1. Every frame is a single JSON object on its own line,
//! written to the worker's stdin (requests) or read from its stdout
//! (responses and notifications).
//!
//! Frame kinds:
//! - `handshake`, `listCapabilities`, `invoke`, `shutdown`: supervisor → worker requests
//! - `result`, `error`: worker → supervisor responses, matched by `id`
//! - `notification`: worker → supervisor, unsolicited, no `id`

use {
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

// ── Constants ────────────────────────────────────────────────────────────────

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

// ── Error codes ──────────────────────────────────────────────────────────────

/// Codes carried by `error` frames. Values follow JSON-RPC where one exists.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const UNKNOWN_CAPABILITY: i64 = -32601;
    pub const INVALID_ARGUMENTS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const SHUTTING_DOWN: i64 = -32000;
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    Empty,
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

// ── Frames ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Frame {
    /// Identify the host and ask the worker to identify itself.
    Handshake {
        id: u64,
        protocol_version: u32,
        host: HostInfo,
    },
    /// Ask for the worker's tools, resources and prompts.
    ListCapabilities { id: u64 },
    /// Invoke one capability by its local name.
    Invoke {
        id: u64,
        name: String,
        #[serde(default)]
        arguments: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    /// Ask the worker to exit after answering.
    Shutdown { id: u64 },
    /// Successful response to the request with the same `id`.
    #[serde(rename = "result")]
    Reply {
        id: u64,
        #[serde(default)]
        result: Value,
    },
    /// Failed response to the request with the same `id`.
    Error {
        id: u64,
        code: i64,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    /// Unsolicited worker → supervisor message.
    Notification {
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
}

impl Frame {
    #[must_use]
    pub fn reply(id: u64, result: Value) -> Self {
        Self::Reply { id, result }
    }

    #[must_use]
    pub fn error(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self::Error {
            id,
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Correlation id, absent for notifications.
    #[must_use]
    pub fn id(&self) -> Option<u64> {
        match self {
            Self::Handshake { id, .. }
            | Self::ListCapabilities { id }
            | Self::Invoke { id, .. }
            | Self::Shutdown { id }
            | Self::Reply { id, .. }
            | Self::Error { id, .. } => Some(*id),
            Self::Notification { .. } => None,
        }
    }

    #[must_use]
    pub fn is_response(&self) -> bool {
        matches!(self, Self::Reply { .. } | Self::Error { .. })
    }

    /// Short name of the frame kind, as written on the wire.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "handshake",
            Self::ListCapabilities { .. } => "listCapabilities",
            Self::Invoke { .. } => "invoke",
            Self::Shutdown { .. } => "shutdown",
            Self::Reply { .. } => "result",
            Self::Error { .. } => "error",
            Self::Notification { .. } => "notification",
        }
    }
}

// ── Payloads ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub name: String,
    pub version: String,
}

/// `result` payload of a `handshake` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResult {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub protocol_version: u32,
}

/// One advertised tool, resource or prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub schema: Value,
}

impl CapabilityDef {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            schema: Value::Null,
        }
    }
}

/// `result` payload of a `listCapabilities` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityList {
    #[serde(default)]
    pub tools: Vec<CapabilityDef>,
    #[serde(default)]
    pub resources: Vec<CapabilityDef>,
    #[serde(default)]
    pub prompts: Vec<CapabilityDef>,
}

// ── Codec ────────────────────────────────────────────────────────────────────

/// Serialize a frame as one newline-terminated line.
pub fn encode(frame: &Frame) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(frame)?;
    if line.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::TooLarge {
            len: line.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    line.push('\n');
    Ok(line)
}

/// Parse one line (with or without its trailing newline) into a frame.
pub fn decode(line: &str) -> Result<Frame, ProtocolError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(ProtocolError::Empty);
    }
    if trimmed.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::TooLarge {
            len: trimmed.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    Ok(serde_json::from_str(trimmed)?)
}
