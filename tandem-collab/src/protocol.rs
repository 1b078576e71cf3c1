//! JSON wire protocol between editors and the document server.
//!
//! Every WebSocket text frame carries one message, tagged by `type`:
//! ```text
//! client → server                      server → client
//! ───────────────                      ───────────────
//! newClientId { clientId }             serverHeadText { data, revisionNumber? }
//! getDocument                          serverUpdate { data, revisionNumber }
//! clientUpdate { data, revisionNumber } serverAck { revisionNumber }
//! clientFastForward { revisionNumber } serverFastForward { data, revisionNumber }
//! clientAck { revisionNumber }         pong
//! ping                                 error { message }
//! ```
//!
//! `data` is a changeset: `{ startLen, endLen, ops, insertedText }`, each op
//! `{ "op": "=" | "+" | "-", "len": n }`. Malformed changesets are rejected
//! while decoding.

use serde::{Deserialize, Serialize};
use tandem_core::{ChangeSet, ClientId};

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Message {
    /// Editor announces its id and joins the document
    NewClientId { client_id: ClientId },
    /// Read-only request for the current document
    GetDocument,
    /// The document head. `revision_number` is omitted for read-only viewers.
    ServerHeadText {
        data: ChangeSet,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        revision_number: Option<usize>,
    },
    /// Local edits based on `revision_number`
    ClientUpdate {
        data: ChangeSet,
        revision_number: usize,
    },
    /// A revision authored by another client
    ServerUpdate {
        data: ChangeSet,
        revision_number: usize,
    },
    /// The sender's update became `revision_number`
    ServerAck { revision_number: usize },
    /// Ask for every revision after `revision_number`
    ClientFastForward { revision_number: usize },
    ServerFastForward {
        data: ChangeSet,
        revision_number: usize,
    },
    /// Client has folded in `revision_number`
    ClientAck { revision_number: usize },
    Ping,
    Pong,
    Error { message: String },
}

impl Message {
    pub fn server_update(data: ChangeSet, revision_number: usize) -> Self {
        Self::ServerUpdate {
            data,
            revision_number,
        }
    }

    pub fn client_update(data: ChangeSet, revision_number: usize) -> Self {
        Self::ClientUpdate {
            data,
            revision_number,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Wire name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewClientId { .. } => "newClientId",
            Self::GetDocument => "getDocument",
            Self::ServerHeadText { .. } => "serverHeadText",
            Self::ClientUpdate { .. } => "clientUpdate",
            Self::ServerUpdate { .. } => "serverUpdate",
            Self::ServerAck { .. } => "serverAck",
            Self::ClientFastForward { .. } => "clientFastForward",
            Self::ServerFastForward { .. } => "serverFastForward",
            Self::ClientAck { .. } => "clientAck",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Error { .. } => "error",
        }
    }

    /// Serialize to the JSON wire format.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from the JSON wire format.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// A message that is only valid in another state or direction
    UnexpectedMessage(&'static str),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::UnexpectedMessage(kind) => write!(f, "Unexpected message: {kind}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
