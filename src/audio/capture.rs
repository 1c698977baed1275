//! Microphone capture on a dedicated audio thread
//!
//! CPAL streams are not `Send`, so the device handle and input stream live
//! on one dedicated thread; the public `AudioCapture` handle talks to it
//! over a command channel and stays `Send + Sync`. The same thread drives
//! the amplitude level loop and, in streaming mode, the periodic encoder
//! flush, so all capture-side mutation is single-threaded.
//!
//! # Data flow
//!
//! ```text
//! CPAL callback ──▶ CallbackState (pending samples, peak)
//!                        │ drained every 100ms tick
//!                        ▼
//!                  worker loop ──▶ audioLevel events
//!                        │             (EventChannel)
//!                        ▼
//!                  flush / stop ──▶ CaptureEvent::{Chunk, Finished}
//!                                       (mpsc to SessionController)
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::encoder::{encode, probe_format, AudioChunk, AudioFormat, RecordingBuffer};
use super::{AudioError, TARGET_SAMPLE_RATE};
use crate::events::{ClientEvent, EventChannel};
use crate::settings::DispatchMode;

/// Cadence of `audioLevel` emission while the device handle is open.
const LEVEL_INTERVAL: Duration = Duration::from_millis(100);

/// Streaming-mode encoder flush cadence: one chunk per second.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Depth of the capture event queue toward the session controller.
const CAPTURE_QUEUE: usize = 64;

/// Recording lifecycle, owned exclusively by the capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Idle,
    Recording,
    Stopping,
}

/// Output of the capture pipeline.
#[derive(Debug)]
pub enum CaptureEvent {
    /// One streaming-mode flush.
    Chunk(AudioChunk),
    /// The accumulated recording, emitted at stop in every mode.
    Finished(RecordingBuffer),
}

pub type CaptureReceiver = mpsc::Receiver<CaptureEvent>;

enum Command {
    Start {
        mode: DispatchMode,
        reply: std_mpsc::Sender<Result<(), AudioError>>,
    },
    Stop {
        reply: std_mpsc::Sender<Result<(), AudioError>>,
    },
    Release,
}

/// State shared between the CPAL callback and the worker loop.
struct CallbackState {
    recording: AtomicBool,
    /// f32 bits of the peak absolute sample since the last level tick.
    /// Non-negative floats order the same as their bit patterns, so
    /// `fetch_max` on the bits is a lock-free running maximum.
    peak: AtomicU32,
    /// Mono samples at the device rate, pending pickup by the worker.
    pending: Mutex<Vec<i16>>,
}

impl CallbackState {
    fn new() -> Self {
        Self {
            recording: AtomicBool::new(false),
            peak: AtomicU32::new(0),
            pending: Mutex::new(Vec::new()),
        }
    }

    fn note_peak(&self, value: f32) {
        self.peak.fetch_max(value.to_bits(), Ordering::Relaxed);
    }

    fn take_peak(&self) -> f32 {
        f32::from_bits(self.peak.swap(0, Ordering::Relaxed))
    }

    fn drain_pending(&self) -> Vec<i16> {
        std::mem::take(&mut *self.pending.lock().unwrap())
    }
}

struct Worker {
    cmd_tx: std_mpsc::Sender<Command>,
    join: JoinHandle<()>,
}

/// Owns the microphone: device acquisition, level metering, and the
/// recording state machine. One active recording at a time.
pub struct AudioCapture {
    events: Arc<EventChannel>,
    worker: Mutex<Option<Worker>>,
    capture_tx: mpsc::Sender<CaptureEvent>,
    capture_rx: Mutex<Option<CaptureReceiver>>,
    state: Arc<Mutex<RecordingState>>,
}

impl AudioCapture {
    pub fn new(events: Arc<EventChannel>) -> Self {
        let (capture_tx, capture_rx) = mpsc::channel(CAPTURE_QUEUE);
        Self {
            events,
            worker: Mutex::new(None),
            capture_tx,
            capture_rx: Mutex::new(Some(capture_rx)),
            state: Arc::new(Mutex::new(RecordingState::Idle)),
        }
    }

    /// Take ownership of the capture event receiver. Returns `None` if it
    /// was already taken.
    pub fn take_capture_receiver(&self) -> Option<CaptureReceiver> {
        self.capture_rx.lock().unwrap().take()
    }

    pub fn recording_state(&self) -> RecordingState {
        *self.state.lock().unwrap()
    }

    /// Acquire the capture device and start the amplitude level loop.
    /// Idempotent while the device is open.
    ///
    /// Fails with `DeviceUnavailable` when no input device (or no usable
    /// configuration) exists, and `DeviceDenied` when the platform backend
    /// refuses the stream.
    pub fn request_access(&self) -> Result<(), AudioError> {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return Ok(());
        }

        let (cmd_tx, cmd_rx) = std_mpsc::channel();
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let events = self.events.clone();
        let capture_tx = self.capture_tx.clone();
        let state = self.state.clone();

        let join = std::thread::Builder::new()
            .name("voicewire-audio".to_string())
            .spawn(move || run_worker(cmd_rx, ready_tx, events, capture_tx, state))
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                *worker = Some(Worker { cmd_tx, join });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = join.join();
                Err(e)
            }
            Err(_) => Err(AudioError::WorkerGone),
        }
    }

    /// Begin recording. Transitions `Idle -> Recording`; acquires the
    /// device first if `request_access` has not been called yet.
    pub fn start(&self, mode: DispatchMode) -> Result<(), AudioError> {
        if self.recording_state() != RecordingState::Idle {
            return Err(AudioError::AlreadyRecording);
        }
        self.request_access()?;
        self.send_command(|reply| Command::Start { mode, reply })
    }

    /// Stop recording. Transitions `Recording -> Stopping -> Idle` and
    /// emits the final `RecordingBuffer` on the capture channel.
    pub fn stop(&self) -> Result<(), AudioError> {
        if self.worker.lock().unwrap().is_none() {
            return Err(AudioError::NotRecording);
        }
        self.send_command(|reply| Command::Stop { reply })
    }

    /// Close the device handle and stop level sampling. Idempotent.
    pub fn release(&self) {
        let mut worker = self.worker.lock().unwrap();
        if let Some(w) = worker.take() {
            let _ = w.cmd_tx.send(Command::Release);
            let _ = w.join.join();
        }
    }

    fn send_command<F>(&self, make: F) -> Result<(), AudioError>
    where
        F: FnOnce(std_mpsc::Sender<Result<(), AudioError>>) -> Command,
    {
        let worker = self.worker.lock().unwrap();
        let w = worker.as_ref().ok_or(AudioError::WorkerGone)?;
        let (reply_tx, reply_rx) = std_mpsc::channel();
        w.cmd_tx
            .send(make(reply_tx))
            .map_err(|_| AudioError::WorkerGone)?;
        reply_rx.recv().map_err(|_| AudioError::WorkerGone)?
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.release();
    }
}

/// Bookkeeping for one recording, private to the worker thread.
struct RecordingSession {
    id: Uuid,
    mode: DispatchMode,
    started_at: Instant,
    /// Mono samples at the device rate for the whole recording.
    samples: Vec<i16>,
    /// Index of the first sample not yet flushed as a chunk.
    flush_mark: usize,
    last_flush: Instant,
    sequence: u32,
}

fn run_worker(
    cmd_rx: std_mpsc::Receiver<Command>,
    ready_tx: std_mpsc::Sender<Result<(), AudioError>>,
    events: Arc<EventChannel>,
    capture_tx: mpsc::Sender<CaptureEvent>,
    state: Arc<Mutex<RecordingState>>,
) {
    let (stream, cb, device_rate, format) = match open_input_stream() {
        Ok(parts) => {
            let _ = ready_tx.send(Ok(()));
            parts
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let set_state = |next: RecordingState| {
        *state.lock().unwrap() = next;
    };

    let mut session: Option<RecordingSession> = None;

    loop {
        match cmd_rx.recv_timeout(LEVEL_INTERVAL) {
            Ok(Command::Start { mode, reply }) => {
                if session.is_some() {
                    let _ = reply.send(Err(AudioError::AlreadyRecording));
                    continue;
                }
                cb.drain_pending();
                cb.recording.store(true, Ordering::SeqCst);
                let id = Uuid::new_v4();
                session = Some(RecordingSession {
                    id,
                    mode,
                    started_at: Instant::now(),
                    samples: Vec::new(),
                    flush_mark: 0,
                    last_flush: Instant::now(),
                    sequence: 0,
                });
                set_state(RecordingState::Recording);
                log::info!("Recording {} started ({:?} mode, {})", id, mode, format.as_str());
                events.emit(ClientEvent::RecordingStarted);
                let _ = reply.send(Ok(()));
            }
            Ok(Command::Stop { reply }) => {
                let Some(mut s) = session.take() else {
                    let _ = reply.send(Err(AudioError::NotRecording));
                    continue;
                };
                set_state(RecordingState::Stopping);
                cb.recording.store(false, Ordering::SeqCst);
                s.samples.extend(cb.drain_pending());

                // Streaming mode: the tail since the last flush goes out as
                // a final partial chunk.
                if s.mode == DispatchMode::Streaming && s.flush_mark < s.samples.len() {
                    flush_chunk(&mut s, device_rate, format, &capture_tx);
                }

                let duration_secs = s.started_at.elapsed().as_secs_f64();
                let (standardized, rate) = standardize(&s.samples, device_rate);
                match encode(format, &standardized, rate) {
                    Ok(data) => {
                        let buffer = RecordingBuffer {
                            data,
                            format,
                            duration_secs,
                            chunk_count: s.sequence,
                        };
                        log::info!(
                            "Recording {} finished: {:.1}s, {} chunks, {} bytes",
                            s.id,
                            duration_secs,
                            s.sequence,
                            buffer.data.len()
                        );
                        if capture_tx.blocking_send(CaptureEvent::Finished(buffer)).is_err() {
                            log::warn!("Capture consumer gone, dropping recording {}", s.id);
                        }
                    }
                    Err(e) => {
                        log::error!("Failed to encode recording {}: {}", s.id, e);
                        events.emit(ClientEvent::Error {
                            message: e.to_string(),
                        });
                    }
                }
                events.emit(ClientEvent::RecordingStopped { duration_secs });
                set_state(RecordingState::Idle);
                let _ = reply.send(Ok(()));
            }
            Ok(Command::Release) => break,
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                events.emit(ClientEvent::AudioLevel {
                    level: cb.take_peak().clamp(0.0, 1.0),
                });

                if let Some(s) = session.as_mut() {
                    s.samples.extend(cb.drain_pending());
                    if s.mode == DispatchMode::Streaming
                        && s.last_flush.elapsed() >= FLUSH_INTERVAL
                        && s.flush_mark < s.samples.len()
                    {
                        flush_chunk(s, device_rate, format, &capture_tx);
                    }
                }
            }
            Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    drop(stream);
    *state.lock().unwrap() = RecordingState::Idle;
    log::debug!("Audio worker stopped");
}

/// Encode the unflushed tail of the recording as one chunk and hand it to
/// the capture channel. Chunks are best-effort: a full queue drops the
/// chunk with a warning.
fn flush_chunk(
    s: &mut RecordingSession,
    device_rate: u32,
    format: AudioFormat,
    capture_tx: &mpsc::Sender<CaptureEvent>,
) {
    let tail = &s.samples[s.flush_mark..];
    let (standardized, rate) = standardize(tail, device_rate);
    s.flush_mark = s.samples.len();
    s.last_flush = Instant::now();

    match encode(format, &standardized, rate) {
        Ok(data) => {
            let chunk = AudioChunk {
                data,
                format,
                sequence: s.sequence,
            };
            s.sequence += 1;
            if capture_tx.try_send(CaptureEvent::Chunk(chunk)).is_err() {
                log::warn!("Capture queue full, dropping chunk {}", s.sequence - 1);
            }
        }
        Err(e) => log::error!("Failed to encode chunk {}: {}", s.sequence, e),
    }
}

fn open_input_stream(
) -> Result<(cpal::Stream, Arc<CallbackState>, u32, AudioFormat), AudioError> {
    let format = probe_format()?;

    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(AudioError::DeviceUnavailable)?;
    log::info!("Using audio input device: {:?}", device.name());

    let supported = device
        .default_input_config()
        .map_err(|_| AudioError::DeviceUnavailable)?;
    log::info!(
        "Audio config: {} Hz, {} channels, {:?}",
        supported.sample_rate().0,
        supported.channels(),
        supported.sample_format()
    );

    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let cb = Arc::new(CallbackState::new());

    let stream = match sample_format {
        cpal::SampleFormat::I16 => build_stream_typed::<i16>(&device, &config, cb.clone()),
        cpal::SampleFormat::U16 => build_stream_typed::<u16>(&device, &config, cb.clone()),
        cpal::SampleFormat::F32 => build_stream_typed::<f32>(&device, &config, cb.clone()),
        _ => Err(AudioError::NoSupportedConfig),
    }?;

    stream
        .play()
        .map_err(|e| AudioError::DeviceDenied(e.to_string()))?;

    Ok((stream, cb, config.sample_rate.0, format))
}

fn build_stream_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    cb: Arc<CallbackState>,
) -> Result<cpal::Stream, AudioError>
where
    T: cpal::Sample<Float = f32> + cpal::SizedSample + Send + 'static,
{
    let channels = config.channels.max(1) as usize;
    let err_fn = |err| log::error!("Audio stream error: {}", err);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let recording = cb.recording.load(Ordering::Relaxed);
                let mut guard = if recording {
                    Some(cb.pending.lock().unwrap())
                } else {
                    None
                };

                let mut peak = 0.0f32;
                for frame in data.chunks(channels) {
                    // Downmix interleaved frames to mono.
                    let sum: i32 = frame.iter().map(|&s| sample_to_i16(s) as i32).sum();
                    let mono = (sum / frame.len() as i32) as i16;

                    let normalized = (mono as f32 / i16::MAX as f32).abs();
                    if normalized > peak {
                        peak = normalized;
                    }
                    if let Some(pending) = guard.as_mut() {
                        pending.push(mono);
                    }
                }
                cb.note_peak(peak);
            },
            err_fn,
            None,
        )
        .map_err(map_build_error)
}

fn map_build_error(e: cpal::BuildStreamError) -> AudioError {
    match e {
        cpal::BuildStreamError::DeviceNotAvailable => AudioError::DeviceUnavailable,
        cpal::BuildStreamError::BackendSpecific { err } => {
            AudioError::DeviceDenied(err.to_string())
        }
        other => AudioError::StreamCreationFailed(other.to_string()),
    }
}

/// Convert any sample type to i16.
fn sample_to_i16<T: cpal::Sample<Float = f32>>(sample: T) -> i16 {
    let f32_sample: f32 = sample.to_float_sample();
    let clamped = f32_sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}

/// Decimate to the target rate when the device rate is an integer multiple
/// of it; otherwise keep the device rate. Returns the samples and the rate
/// they are actually at, so WAV headers never lie.
fn standardize(samples: &[i16], device_rate: u32) -> (Vec<i16>, u32) {
    if device_rate == 0 {
        log::warn!("Invalid device rate 0, assuming target rate");
        return (samples.to_vec(), TARGET_SAMPLE_RATE);
    }
    if device_rate == TARGET_SAMPLE_RATE {
        return (samples.to_vec(), device_rate);
    }
    if device_rate % TARGET_SAMPLE_RATE != 0 {
        log::warn!(
            "Unsupported resample ratio {}:{}, keeping device rate",
            device_rate,
            TARGET_SAMPLE_RATE
        );
        return (samples.to_vec(), device_rate);
    }

    let ratio = (device_rate / TARGET_SAMPLE_RATE) as usize;
    let decimated = samples
        .chunks(ratio)
        .map(|chunk| {
            let sum: i64 = chunk.iter().map(|&s| s as i64).sum();
            (sum / chunk.len() as i64) as i16
        })
        .collect();
    (decimated, TARGET_SAMPLE_RATE)
}
