//! Audio capture module
//!
//! Microphone input capture and chunk encoding. Uses CPAL for capture and
//! hound for WAV encoding; the device lives on a dedicated audio thread so
//! the public handle stays `Send + Sync`.

mod capture;
mod encoder;

pub use capture::{AudioCapture, CaptureEvent, CaptureReceiver, RecordingState};
pub use encoder::{
    probe_format, AudioChunk, AudioFormat, RecordingBuffer, FORMAT_PREFERENCE, TARGET_SAMPLE_RATE,
};

/// Errors that can occur during audio capture.
#[derive(Debug, Clone)]
pub enum AudioError {
    /// The platform refused access to the capture device.
    DeviceDenied(String),
    /// No input device, or the platform capture API is missing.
    DeviceUnavailable,
    NoSupportedConfig,
    AlreadyRecording,
    NotRecording,
    StreamCreationFailed(String),
    EncodeFailed(String),
    /// The dedicated audio thread is gone.
    WorkerGone,
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::DeviceDenied(e) => write!(f, "Capture device access denied: {}", e),
            AudioError::DeviceUnavailable => write!(f, "No audio input device available"),
            AudioError::NoSupportedConfig => write!(f, "No supported audio configuration"),
            AudioError::AlreadyRecording => write!(f, "Recording already in progress"),
            AudioError::NotRecording => write!(f, "No recording in progress"),
            AudioError::StreamCreationFailed(e) => {
                write!(f, "Failed to create audio stream: {}", e)
            }
            AudioError::EncodeFailed(e) => write!(f, "Failed to encode audio: {}", e),
            AudioError::WorkerGone => write!(f, "Audio worker thread is not running"),
        }
    }
}

impl std::error::Error for AudioError {}
