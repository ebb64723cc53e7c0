//! CMake server wire types
//!
//! Inbound messages are decoded once into [`ServerMessage`], a tagged union
//! over the `type` field. Outbound messages are [`Request`] values.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;

/// Protocol major version this client speaks
pub const SUPPORTED_PROTOCOL_MAJOR: u32 = 1;

// ============================================================================
// Requests
// ============================================================================

/// The request types used by the reader, in protocol order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    #[serde(rename = "handshake")]
    Handshake,
    #[serde(rename = "configure")]
    Configure,
    #[serde(rename = "compute")]
    Compute,
    #[serde(rename = "codemodel")]
    CodeModel,
    #[serde(rename = "cache")]
    Cache,
    #[serde(rename = "cmakeInputs")]
    CmakeInputs,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Handshake => "handshake",
            RequestKind::Configure => "configure",
            RequestKind::Compute => "compute",
            RequestKind::CodeModel => "codemodel",
            RequestKind::Cache => "cache",
            RequestKind::CmakeInputs => "cmakeInputs",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "handshake" => Some(RequestKind::Handshake),
            "configure" => Some(RequestKind::Configure),
            "compute" => Some(RequestKind::Compute),
            "codemodel" => Some(RequestKind::CodeModel),
            "cache" => Some(RequestKind::Cache),
            "cmakeInputs" => Some(RequestKind::CmakeInputs),
            _ => None,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outbound request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub kind: RequestKind,
    pub cookie: String,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl Request {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A protocol version advertised by the server or requested by us
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u32,
    #[serde(default)]
    pub minor: u32,
}

/// Pick the newest advertised version with our major number
pub fn negotiate_protocol(supported: &[ProtocolVersion]) -> Option<ProtocolVersion> {
    supported
        .iter()
        .filter(|version| version.major == SUPPORTED_PROTOCOL_MAJOR)
        .max()
        .copied()
}

/// Parameters of the `handshake` request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeParams {
    pub protocol_version: ProtocolVersion,
    pub source_directory: PathBuf,
    pub build_directory: PathBuf,
    pub generator: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_generator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub toolset: Option<String>,
}

// ============================================================================
// Inbound messages
// ============================================================================

/// An inbound message, discriminated by its `type` field
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Hello(HelloMessage),
    Reply(ReplyMessage),
    Error(ErrorMessage),
    Progress(ProgressMessage),
    Message(LogMessage),
    Signal(SignalMessage),
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Cookie echoed by the server, if the message carries one
    pub fn cookie(&self) -> Option<&str> {
        let cookie = match self {
            ServerMessage::Reply(m) => m.cookie.as_deref(),
            ServerMessage::Error(m) => m.cookie.as_deref(),
            ServerMessage::Progress(m) => m.cookie.as_deref(),
            ServerMessage::Message(m) => m.cookie.as_deref(),
            ServerMessage::Signal(m) => m.cookie.as_deref(),
            ServerMessage::Hello(_) | ServerMessage::Unknown => None,
        };
        cookie.filter(|c| !c.is_empty())
    }

    /// Short name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            ServerMessage::Hello(_) => "hello",
            ServerMessage::Reply(_) => "reply",
            ServerMessage::Error(_) => "error",
            ServerMessage::Progress(_) => "progress",
            ServerMessage::Message(_) => "message",
            ServerMessage::Signal(_) => "signal",
            ServerMessage::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloMessage {
    #[serde(default)]
    pub supported_protocol_versions: Vec<ProtocolVersion>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyMessage {
    #[serde(default)]
    pub in_reply_to: String,
    #[serde(default)]
    pub cookie: Option<String>,
    /// Everything else in the reply object
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    #[serde(default)]
    pub in_reply_to: String,
    #[serde(default)]
    pub cookie: Option<String>,
    #[serde(default)]
    pub error_message: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressMessage {
    #[serde(default)]
    pub in_reply_to: String,
    #[serde(default)]
    pub cookie: Option<String>,
    #[serde(default)]
    pub progress_message: String,
    #[serde(default)]
    pub progress_minimum: i64,
    #[serde(default)]
    pub progress_maximum: i64,
    #[serde(default)]
    pub progress_current: i64,
}

/// Free text output of the server (configure log lines and the like)
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogMessage {
    #[serde(default)]
    pub in_reply_to: String,
    #[serde(default)]
    pub cookie: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SignalMessage {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub cookie: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}
