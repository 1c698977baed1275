//! Streaming transport to the transcription service
//!
//! One persistent WebSocket per `TransportChannel`, with automatic
//! reconnection, keep-alive pings, and typed re-emission of every inbound
//! message.

mod channel;
mod protocol;

pub use channel::{ConnectionState, ReconnectPolicy, TransportChannel};
pub use protocol::{InboundMessage, OutboundMessage};

/// Errors that can occur on the streaming transport.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// `send` was called while the channel was not Connected.
    NotConnected,
    /// All reconnection attempts failed; the channel is Disconnected.
    ReconnectExhausted,
    SendFailed(String),
    MessageDecodeError(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::NotConnected => write!(f, "Not connected to the server"),
            TransportError::ReconnectExhausted => {
                write!(f, "Reconnection attempts exhausted")
            }
            TransportError::SendFailed(e) => write!(f, "Failed to send message: {}", e),
            TransportError::MessageDecodeError(e) => {
                write!(f, "Failed to decode server message: {}", e)
            }
        }
    }
}

impl std::error::Error for TransportError {}
