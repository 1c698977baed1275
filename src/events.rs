//! Publish/subscribe channel for client events
//!
//! Every component publishes to a shared `EventChannel` instead of holding
//! callbacks on its neighbours. Listeners are keyed by event name and invoked
//! synchronously in registration order; a panicking listener never prevents
//! delivery to the listeners after it.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

/// Result of a completed transcription, from either the streaming
/// connection or the HTTP fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptionResult {
    pub text: String,
    /// Language the server detected (or echoed back), if any.
    pub language_detected: Option<String>,
    pub processing_time_secs: f64,
    /// Set when the result came from an HTTP upload; `None` for streaming.
    pub source_request_id: Option<String>,
}

/// Events surfaced to the UI collaborator and exchanged between components.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected { reason: String },
    Reconnecting { attempt: u32, delay_ms: u64 },
    RecordingStarted,
    RecordingStopped { duration_secs: f64 },
    /// Normalized microphone amplitude in `[0, 1]`.
    AudioLevel { level: f32 },
    Transcription(TranscriptionResult),
    ConfigAck {
        model: String,
        language: Option<String>,
    },
    ServerError { message: String },
    Pong,
    UnknownMessage,
    /// A streaming chunk could not be delivered and was dropped.
    SendFailed { reason: String },
    UploadStarted {
        request_id: String,
        file_name: String,
    },
    UploadCompleted { request_id: String },
    Polling {
        request_id: String,
        attempt: u32,
    },
    Error { message: String },
}

impl ClientEvent {
    /// Event name used as the subscription key.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Connected => "connected",
            ClientEvent::Disconnected { .. } => "disconnected",
            ClientEvent::Reconnecting { .. } => "reconnecting",
            ClientEvent::RecordingStarted => "recordingStarted",
            ClientEvent::RecordingStopped { .. } => "recordingStopped",
            ClientEvent::AudioLevel { .. } => "audioLevel",
            ClientEvent::Transcription(_) => "transcription",
            ClientEvent::ConfigAck { .. } => "config",
            ClientEvent::ServerError { .. } => "serverError",
            ClientEvent::Pong => "pong",
            ClientEvent::UnknownMessage => "unknownMessage",
            ClientEvent::SendFailed { .. } => "sendFailed",
            ClientEvent::UploadStarted { .. } => "uploadStarted",
            ClientEvent::UploadCompleted { .. } => "uploadCompleted",
            ClientEvent::Polling { .. } => "polling",
            ClientEvent::Error { .. } => "error",
        }
    }
}

type Listener = Arc<dyn Fn(&ClientEvent) + Send + Sync + 'static>;

/// Minimal pub/sub primitive: listeners registered per event name,
/// synchronous FIFO fan-out on emit.
pub struct EventChannel {
    listeners: Mutex<HashMap<&'static str, Vec<Listener>>>,
}

impl EventChannel {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Register a listener for one event name. Listeners for the same name
    /// are invoked in the order they were registered.
    pub fn subscribe<F>(&self, name: &'static str, listener: F)
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        let mut map = self.listeners.lock().unwrap();
        map.entry(name).or_default().push(Arc::new(listener));
    }

    /// Deliver `event` to every listener registered for its name.
    ///
    /// Fan-out is synchronous on the calling thread. A panic inside one
    /// listener is caught and logged; the remaining listeners still run.
    pub fn emit(&self, event: ClientEvent) {
        let fan_out: Vec<Listener> = {
            let map = self.listeners.lock().unwrap();
            match map.get(event.name()) {
                Some(list) => list.clone(),
                None => return,
            }
        };

        for listener in fan_out {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                log::warn!("Event listener panicked for '{}'", event.name());
            }
        }
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}
