//! Session controller: routes captured audio to the right sink
//!
//! Composes the capture, transport, and submission components and re-emits
//! their events under one surface. Routing depends on the configured
//! dispatch mode and current connectivity:
//!
//! - Streaming: every chunk goes out immediately while Connected; chunks
//!   produced while disconnected are dropped with a `sendFailed` event
//!   (best-effort, no buffering or replay).
//! - Batch: the accumulated recording goes out once at stop, as a single
//!   audio message when Connected or through the HTTP fallback otherwise.

use std::sync::{Arc, Mutex};

use crate::audio::{AudioCapture, AudioChunk, AudioError, CaptureEvent, CaptureReceiver,
                   RecordingBuffer};
use crate::events::{ClientEvent, EventChannel};
use crate::settings::{DispatchMode, Settings, SettingsPatch, SettingsStore};
use crate::submit::{FileSubmitter, PollOptions, SubmitOptions};
use crate::transport::{ConnectionState, OutboundMessage, TransportChannel, TransportError};

/// Sink seam over the streaming transport. `TransportChannel` is the
/// production implementation.
pub trait StreamSink: Send + Sync {
    fn connection_state(&self) -> ConnectionState;
    fn send_message(&self, message: &OutboundMessage) -> Result<(), TransportError>;
}

impl StreamSink for TransportChannel {
    fn connection_state(&self) -> ConnectionState {
        self.state()
    }

    fn send_message(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        self.send(message)
    }
}

/// Owns the user-visible session: settings, the microphone, and the routing
/// of captured audio. One active recording at a time.
pub struct SessionController {
    events: Arc<EventChannel>,
    capture: AudioCapture,
    sink: Arc<dyn StreamSink>,
    submitter: Arc<FileSubmitter>,
    store: Arc<dyn SettingsStore>,
    settings: Mutex<Settings>,
    poll: PollOptions,
    /// Batch recording held back while `auto_send` is off.
    held: Mutex<Option<RecordingBuffer>>,
}

impl SessionController {
    pub fn new(
        events: Arc<EventChannel>,
        sink: Arc<dyn StreamSink>,
        submitter: Arc<FileSubmitter>,
        store: Arc<dyn SettingsStore>,
    ) -> Self {
        let settings = Settings::load(store.as_ref());
        let capture = AudioCapture::new(events.clone());
        Self {
            events,
            capture,
            sink,
            submitter,
            store,
            settings: Mutex::new(settings),
            poll: PollOptions::default(),
            held: Mutex::new(None),
        }
    }

    pub fn capture(&self) -> &AudioCapture {
        &self.capture
    }

    /// Take the capture event receiver to feed `run`.
    pub fn take_capture_receiver(&self) -> Option<CaptureReceiver> {
        self.capture.take_capture_receiver()
    }

    pub fn settings(&self) -> Settings {
        self.settings.lock().unwrap().clone()
    }

    /// Merge a partial update, persist it, and - when connected - push the
    /// new config so server-side state matches before any further audio.
    pub fn update_settings(&self, patch: &SettingsPatch) -> Result<Settings, String> {
        let merged = {
            let mut settings = self.settings.lock().unwrap();
            *settings = settings.merged(patch);
            settings.clone()
        };
        merged.persist(self.store.as_ref())?;

        if self.sink.connection_state() == ConnectionState::Connected {
            if let Err(e) = self.sink.send_message(&OutboundMessage::config(&merged)) {
                log::warn!("Failed to push config update: {}", e);
                self.events.emit(ClientEvent::Error {
                    message: e.to_string(),
                });
            }
        }

        Ok(merged)
    }

    /// Begin a recording in the currently configured mode.
    pub fn start_recording(&self) -> Result<(), AudioError> {
        let mode = self.settings.lock().unwrap().mode;
        self.capture.start(mode)
    }

    pub fn stop_recording(&self) -> Result<(), AudioError> {
        self.capture.stop()
    }

    /// Pump capture events until the capture side closes.
    pub async fn run(&self, mut rx: CaptureReceiver) {
        while let Some(event) = rx.recv().await {
            self.route_capture_event(event).await;
        }
        log::debug!("Capture channel closed, session pump exiting");
    }

    /// Route one capture event per the current mode and connectivity.
    pub async fn route_capture_event(&self, event: CaptureEvent) {
        match event {
            CaptureEvent::Chunk(chunk) => self.dispatch_chunk(chunk),
            CaptureEvent::Finished(buffer) => {
                let (mode, auto_send) = {
                    let settings = self.settings.lock().unwrap();
                    (settings.mode, settings.auto_send)
                };
                // Streaming recordings were already dispatched chunk by
                // chunk; the final buffer is not re-sent.
                if mode != DispatchMode::Batch {
                    return;
                }
                if auto_send {
                    self.dispatch_recording(buffer).await;
                } else {
                    *self.held.lock().unwrap() = Some(buffer);
                }
            }
        }
    }

    /// Dispatch the batch recording held back by `auto_send` being off.
    /// Returns false when nothing is held.
    pub async fn send_pending(&self) -> bool {
        let buffer = self.held.lock().unwrap().take();
        match buffer {
            Some(buffer) => {
                self.dispatch_recording(buffer).await;
                true
            }
            None => false,
        }
    }

    fn dispatch_chunk(&self, chunk: AudioChunk) {
        let settings = self.settings.lock().unwrap().clone();
        if settings.mode != DispatchMode::Streaming {
            log::debug!("Dropping chunk {} outside streaming mode", chunk.sequence);
            return;
        }

        if self.sink.connection_state() != ConnectionState::Connected {
            self.events.emit(ClientEvent::SendFailed {
                reason: "not connected".to_string(),
            });
            return;
        }

        let message = OutboundMessage::audio(&chunk.data, chunk.format, &settings);
        if let Err(e) = self.sink.send_message(&message) {
            log::warn!("Chunk {} send failed: {}", chunk.sequence, e);
            self.events.emit(ClientEvent::SendFailed {
                reason: e.to_string(),
            });
        }
    }

    /// Send one accumulated recording: a single audio message when
    /// Connected, the HTTP fallback otherwise.
    async fn dispatch_recording(&self, buffer: RecordingBuffer) {
        let settings = self.settings.lock().unwrap().clone();

        if self.sink.connection_state() == ConnectionState::Connected {
            let message = OutboundMessage::audio(&buffer.data, buffer.format, &settings);
            if let Err(e) = self.sink.send_message(&message) {
                log::warn!("Recording send failed: {}", e);
                self.events.emit(ClientEvent::SendFailed {
                    reason: e.to_string(),
                });
            }
            return;
        }

        let options = SubmitOptions {
            model: settings.model.clone(),
            language: settings.language.clone(),
        };
        let file_name = format!("recording.{}", buffer.format.as_str());

        match self
            .submitter
            .submit_bytes(&file_name, buffer.data, &options)
            .await
        {
            Ok(request_id) => match self.submitter.await_result(&request_id, &self.poll).await {
                Ok(result) => self.events.emit(ClientEvent::Transcription(result)),
                Err(e) => self.events.emit(ClientEvent::Error {
                    message: e.to_string(),
                }),
            },
            Err(e) => self.events.emit(ClientEvent::Error {
                message: e.to_string(),
            }),
        }
    }
}
