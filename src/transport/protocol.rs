//! Wire protocol for the streaming transcription connection
//!
//! JSON text frames tagged by a `type` field. Outbound audio payloads are
//! base64-encoded and carry the container format tag so the server can
//! decode each chunk independently.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::audio::AudioFormat;
use crate::events::TranscriptionResult;
use crate::settings::Settings;

/// Messages sent to the transcription server.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundMessage {
    /// Apply model/language before any further audio is processed.
    Config {
        model: String,
        language: Option<String>,
    },

    /// One encoded audio payload, either a streaming chunk or a whole
    /// batch recording.
    Audio {
        /// Base64-encoded container bytes.
        data: String,
        format: AudioFormat,
        model: String,
        language: Option<String>,
    },

    /// Keep-alive probe.
    Ping { timestamp: i64 },
}

impl OutboundMessage {
    pub fn config(settings: &Settings) -> Self {
        Self::Config {
            model: settings.model.clone(),
            language: settings.language.clone(),
        }
    }

    pub fn audio(bytes: &[u8], format: AudioFormat, settings: &Settings) -> Self {
        Self::Audio {
            data: STANDARD.encode(bytes),
            format,
            model: settings.model.clone(),
            language: settings.language.clone(),
        }
    }

    pub fn ping() -> Self {
        Self::Ping {
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Messages received from the transcription server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundMessage {
    /// Hello frame sent right after the socket opens.
    Connection {
        #[serde(default)]
        client_id: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },

    /// Acknowledgment of a config message.
    Config {
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        language: Option<String>,
    },

    Transcription {
        #[serde(default)]
        text: String,
        #[serde(default)]
        language: Option<String>,
        #[serde(default)]
        processing_time: Option<f64>,
        #[serde(default)]
        timestamp: Option<f64>,
    },

    Error {
        #[serde(default)]
        message: String,
    },

    Pong {
        #[serde(default)]
        timestamp: Option<f64>,
    },

    /// Catch-all for message types this client does not handle. Unknown
    /// discriminants are never a decode failure.
    #[serde(other)]
    Unknown,
}

impl InboundMessage {
    /// Build a `TranscriptionResult` if this is a transcription message.
    pub fn to_result(&self) -> Option<TranscriptionResult> {
        match self {
            InboundMessage::Transcription {
                text,
                language,
                processing_time,
                ..
            } => Some(TranscriptionResult {
                text: text.clone(),
                language_detected: language.clone(),
                processing_time_secs: processing_time.unwrap_or(0.0),
                source_request_id: None,
            }),
            _ => None,
        }
    }
}
