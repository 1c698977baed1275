//! Real-time voice capture and transcription client
//!
//! Acquires live microphone audio, packages it, and delivers it to a remote
//! transcription service over a persistent WebSocket, with an HTTP
//! upload-plus-poll fallback for discrete files and for when no connection
//! is available.
//!
//! # Architecture
//!
//! ```text
//! microphone ──▶ AudioCapture ──▶ SessionController ──▶ TransportChannel ──▶ server
//!                    │                   │ (batch fallback)
//!                    │                   └──▶ FileSubmitter ──▶ server (HTTP)
//!                    │
//!                    └──▶ EventChannel ◀── transcriptions, connection state,
//!                                          audio levels, upload progress
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use voicewire::{
//!     EventChannel, FileSubmitter, HttpTranscriptionApi, JsonFileStore,
//!     SessionController, TransportChannel,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let events = Arc::new(EventChannel::new());
//! events.subscribe("transcription", |event| println!("{:?}", event));
//!
//! let transport = Arc::new(TransportChannel::new(events.clone()));
//! let submitter = Arc::new(FileSubmitter::new(
//!     Arc::new(HttpTranscriptionApi::new("http://localhost:8000")),
//!     events.clone(),
//! ));
//! let store = Arc::new(JsonFileStore::new(JsonFileStore::default_path()?));
//!
//! transport.connect("ws://localhost:8000/ws/transcribe");
//! let session = SessionController::new(events, transport.clone(), submitter, store);
//!
//! let rx = session.take_capture_receiver().expect("receiver taken once");
//! session.start_recording()?;
//! session.run(rx).await;
//! # Ok(())
//! # }
//! ```

mod audio;
mod events;
mod session;
mod settings;
mod submit;
mod transport;

pub use audio::{
    probe_format, AudioCapture, AudioChunk, AudioError, AudioFormat, CaptureEvent,
    CaptureReceiver, RecordingBuffer, RecordingState, FORMAT_PREFERENCE, TARGET_SAMPLE_RATE,
};
pub use events::{ClientEvent, EventChannel, TranscriptionResult};
pub use session::{SessionController, StreamSink};
pub use settings::{
    DispatchMode, JsonFileStore, Settings, SettingsPatch, SettingsStore, SETTINGS_KEY,
};
pub use submit::{
    CancelResponse, CreateResponse, FileMeta, FileSubmitter, HttpTranscriptionApi,
    PendingUpload, PollOptions, StatusResponse, SubmitError, SubmitOptions, TranscriptionApi,
    UploadPolicy, ALLOWED_EXTENSIONS, MAX_FILE_SIZE,
};
pub use transport::{
    ConnectionState, InboundMessage, OutboundMessage, ReconnectPolicy, TransportChannel,
    TransportError,
};
