use thiserror::Error;

use crate::websocket::close::CloseCode;

/// An error in the WebSocket layer.
///
/// Errors raised while a connection is open carry the close code they fail the connection with.
/// Handshake errors carry the HTTP status that was sent or received.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WebSocketError {
    /// The peer violated the WebSocket protocol.
    #[error("{0}")]
    Protocol(String),
    /// The peer sent a payload that is invalid for its type, such as invalid UTF-8 text.
    #[error("{0}")]
    InvalidPayload(String),
    #[error("{0}")]
    FrameTooBig(String),
    #[error("{0}")]
    MessageTooBig(String),
    /// The opening handshake failed.
    #[error("WebSocket connection upgrade failed ({status} - {reason})")]
    Handshake { status: u16, reason: String },
    #[error("{0}")]
    Timeout(String),
    /// The operation requires an open connection.
    #[error("websocket connection is closed")]
    Closed,
}

impl WebSocketError {
    /// The close code used to fail the connection.
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            Self::Protocol(_) => Some(CloseCode::PROTOCOL_ERROR),
            Self::InvalidPayload(_) => Some(CloseCode::INVALID_PAYLOAD),
            Self::FrameTooBig(_) => Some(CloseCode::POLICY_VIOLATION),
            Self::MessageTooBig(_) => Some(CloseCode::MESSAGE_TOO_BIG),
            Self::Handshake { .. } | Self::Timeout(_) | Self::Closed => None,
        }
    }

    /// Creates a handshake error.
    pub fn handshake<S>(status: u16, reason: S) -> Self
    where
        S: Into<String>,
    {
        Self::Handshake {
            status,
            reason: reason.into(),
        }
    }
}
