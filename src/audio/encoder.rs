//! Chunk encoding and container format selection
//!
//! The capture pipeline probes an ordered list of container formats and
//! uses the first one with an encoder in this build. The selection is fixed
//! for the lifetime of a capture session and stamped on every chunk so
//! outbound messages carry the right format tag.

use std::io::Cursor;

use hound::{WavSpec, WavWriter};
use serde::{Deserialize, Serialize};

use super::AudioError;

/// Sample rate chunks are standardized to before encoding, when the device
/// rate is an integer multiple of it.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Container formats understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Webm,
    Ogg,
    Wav,
    Mp4,
}

impl AudioFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioFormat::Webm => "webm",
            AudioFormat::Ogg => "ogg",
            AudioFormat::Wav => "wav",
            AudioFormat::Mp4 => "mp4",
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            AudioFormat::Webm => "audio/webm",
            AudioFormat::Ogg => "audio/ogg",
            AudioFormat::Wav => "audio/wav",
            AudioFormat::Mp4 => "audio/mp4",
        }
    }
}

/// Probe order. Compressed containers are preferred; the probe degrades
/// through entries without an encoder in this build.
pub const FORMAT_PREFERENCE: [AudioFormat; 4] = [
    AudioFormat::Webm,
    AudioFormat::Ogg,
    AudioFormat::Wav,
    AudioFormat::Mp4,
];

/// One encoded fragment of a recording. Dispatched at most once.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub data: Vec<u8>,
    pub format: AudioFormat,
    /// Position within the current recording, starting at 0.
    pub sequence: u32,
}

/// A complete recording, encoded as a single blob at stop.
#[derive(Debug, Clone)]
pub struct RecordingBuffer {
    pub data: Vec<u8>,
    pub format: AudioFormat,
    pub duration_secs: f64,
    /// Number of intermediate chunks flushed during the recording.
    pub chunk_count: u32,
}

/// WAV is the only encoder linked into this build.
fn has_encoder(format: AudioFormat) -> bool {
    matches!(format, AudioFormat::Wav)
}

/// Select the first format in the preference order with a working encoder.
pub fn probe_format() -> Result<AudioFormat, AudioError> {
    FORMAT_PREFERENCE
        .iter()
        .copied()
        .find(|f| has_encoder(*f))
        .ok_or(AudioError::NoSupportedConfig)
}

/// Encode mono PCM16 samples into the selected container.
pub(crate) fn encode(
    format: AudioFormat,
    samples: &[i16],
    sample_rate: u32,
) -> Result<Vec<u8>, AudioError> {
    match format {
        AudioFormat::Wav => encode_wav(samples, sample_rate),
        other => Err(AudioError::EncodeFailed(format!(
            "no encoder for {}",
            other.as_str()
        ))),
    }
}

fn encode_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>, AudioError> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec)
            .map_err(|e| AudioError::EncodeFailed(e.to_string()))?;
        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| AudioError::EncodeFailed(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| AudioError::EncodeFailed(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
