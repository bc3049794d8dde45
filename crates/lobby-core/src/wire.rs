//! Lobby wire protocol — JSON envelopes carried in WebSocket text frames.
//!
//! Every frame is `{ "type": ..., "payload": ..., "seq": n }`. The broker
//! numbers its events per connection starting at 1; a jump in `seq` means an
//! event was dropped because the client could not keep up. Client-side `seq`
//! is optional and only echoed into logs.
//!
//! Both directions are closed enums, so a frame either decodes into a known
//! variant or is rejected whole.

use serde::{Deserialize, Serialize};

use crate::types::{ClientId, EndReason, ErrorKind, SessionId};

/// A tagged message plus its sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    #[serde(flatten)]
    pub body: T,
    #[serde(default)]
    pub seq: u64,
}

impl<T> Envelope<T> {
    pub fn new(seq: u64, body: T) -> Self {
        Self { body, seq }
    }
}

// ── Client → broker ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join the queue, optionally presenting an invite token.
    Enqueue {
        #[serde(default)]
        invite_token: Option<String>,
    },
    /// Liveness signal. Must arrive within the heartbeat grace period.
    Heartbeat,
    /// Give up the active session, or leave the queue if still waiting.
    EndSession,
}

// ── Broker → client ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    /// First event on every connection.
    Welcome { client_id: ClientId },
    /// 1-based place in the waiting line.
    QueuePosition { position: usize, queue_length: usize },
    /// The sandbox is up and belongs to this client until `deadline_ms`.
    SessionGranted {
        session_id: SessionId,
        connection: String,
        deadline_ms: u64,
    },
    /// The session is being torn down.
    SessionEnding {
        session_id: SessionId,
        reason: EndReason,
    },
    Error { kind: ErrorKind, message: String },
}

impl ServerEvent {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
        }
    }

    /// The `type` tag as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::QueuePosition { .. } => "queue_position",
            Self::SessionGranted { .. } => "session_granted",
            Self::SessionEnding { .. } => "session_ending",
            Self::Error { .. } => "error",
        }
    }
}

/// Decode one inbound text frame.
pub fn decode_client(text: &str) -> Result<Envelope<ClientMessage>, serde_json::Error> {
    serde_json::from_str(text)
}

/// Encode one outbound event.
pub fn encode_server(envelope: &Envelope<ServerEvent>) -> Result<String, serde_json::Error> {
    serde_json::to_string(envelope)
}
