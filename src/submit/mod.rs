//! HTTP fallback: discrete file submission with upload-then-poll
//!
//! Used when no persistent connection is available, and for transcribing
//! files that were never streamed. The flow is create-request, then poll
//! the status endpoint until a terminal state or timeout, with a
//! best-effort cancel.

mod http;

pub use http::HttpTranscriptionApi;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::events::{ClientEvent, EventChannel, TranscriptionResult};

/// Upload size ceiling, matching the server's limit.
pub const MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// Formats the server accepts for file uploads.
pub const ALLOWED_EXTENSIONS: [&str; 8] =
    ["wav", "wave", "mp3", "flac", "m4a", "webm", "ogg", "mp4"];

/// Errors from the submission path.
#[derive(Debug, Clone)]
pub enum SubmitError {
    /// Rejected locally before any network request.
    ValidationFailed(String),
    /// Transport failure or server rejection of the upload.
    SubmitFailed(String),
    /// The server reported the transcription as failed.
    TranscriptionFailed(String),
    /// No terminal status within the configured attempts.
    PollTimeout { attempts: u32 },
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitError::ValidationFailed(e) => write!(f, "Validation failed: {}", e),
            SubmitError::SubmitFailed(e) => write!(f, "Upload failed: {}", e),
            SubmitError::TranscriptionFailed(e) => write!(f, "Transcription failed: {}", e),
            SubmitError::PollTimeout { attempts } => {
                write!(f, "No result after {} poll attempts", attempts)
            }
        }
    }
}

impl std::error::Error for SubmitError {}

/// Validation rules applied before any network I/O.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub max_size_bytes: u64,
    pub allowed_extensions: Vec<String>,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_size_bytes: MAX_FILE_SIZE,
            allowed_extensions: ALLOWED_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }
}

impl UploadPolicy {
    pub fn validate(&self, file_name: &str, size_bytes: u64) -> Result<(), SubmitError> {
        let extension = file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();

        if !self.allowed_extensions.iter().any(|e| *e == extension) {
            return Err(SubmitError::ValidationFailed(format!(
                "Unsupported format '{}'. Supported: {}",
                extension,
                self.allowed_extensions.join(", ")
            )));
        }
        if size_bytes > self.max_size_bytes {
            return Err(SubmitError::ValidationFailed(format!(
                "File too large: {} bytes (max {})",
                size_bytes, self.max_size_bytes
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FileMeta {
    pub file_name: String,
    pub size_bytes: u64,
}

/// One upload being tracked through its poll loop. Removed on a terminal
/// status or explicit cancel.
#[derive(Debug, Clone)]
pub struct PendingUpload {
    pub request_id: String,
    pub file_meta: FileMeta,
    pub attempts_made: u32,
}

/// Server-side parameters sent with the upload.
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    pub model: String,
    pub language: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PollOptions {
    pub max_attempts: u32,
    pub poll_interval: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            max_attempts: 60,
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// `POST /api/transcribe` response.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateResponse {
    pub id: String,
    pub status: String,
}

/// `GET /api/transcribe/{id}` response.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub processing_time: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
}

/// `DELETE /api/transcribe/{id}` response.
#[derive(Debug, Clone, Deserialize)]
pub struct CancelResponse {
    pub message: String,
}

/// Request/response seam to the transcription service's HTTP API.
#[async_trait]
pub trait TranscriptionApi: Send + Sync {
    async fn create_request(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
        options: &SubmitOptions,
    ) -> Result<CreateResponse, SubmitError>;

    async fn fetch_status(&self, request_id: &str) -> Result<StatusResponse, SubmitError>;

    async fn cancel_request(&self, request_id: &str) -> Result<CancelResponse, SubmitError>;
}

/// Validates and submits complete audio files, then polls for the
/// asynchronous result.
pub struct FileSubmitter {
    api: Arc<dyn TranscriptionApi>,
    policy: UploadPolicy,
    events: Arc<EventChannel>,
    pending: Mutex<HashMap<String, PendingUpload>>,
}

impl FileSubmitter {
    pub fn new(api: Arc<dyn TranscriptionApi>, events: Arc<EventChannel>) -> Self {
        Self::with_policy(api, events, UploadPolicy::default())
    }

    pub fn with_policy(
        api: Arc<dyn TranscriptionApi>,
        events: Arc<EventChannel>,
        policy: UploadPolicy,
    ) -> Self {
        Self {
            api,
            policy,
            events,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Submit a file from disk. Validates name and size against the policy
    /// before any network request; returns the server-assigned request id.
    pub async fn submit(
        &self,
        path: &Path,
        options: &SubmitOptions,
    ) -> Result<String, SubmitError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("audio")
            .to_string();

        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| SubmitError::SubmitFailed(format!("read {:?}: {}", path, e)))?;
        self.policy.validate(&file_name, metadata.len())?;

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| SubmitError::SubmitFailed(format!("read {:?}: {}", path, e)))?;

        self.submit_bytes(&file_name, bytes, options).await
    }

    /// Submit an in-memory blob, e.g. a batch recording that never touched
    /// disk. Same validation as `submit`.
    pub async fn submit_bytes(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
        options: &SubmitOptions,
    ) -> Result<String, SubmitError> {
        let size_bytes = bytes.len() as u64;
        self.policy.validate(file_name, size_bytes)?;

        log::info!("Uploading {} ({} bytes)", file_name, size_bytes);
        let created = self.api.create_request(file_name, bytes, options).await?;

        self.pending.lock().unwrap().insert(
            created.id.clone(),
            PendingUpload {
                request_id: created.id.clone(),
                file_meta: FileMeta {
                    file_name: file_name.to_string(),
                    size_bytes,
                },
                attempts_made: 0,
            },
        );
        self.events.emit(ClientEvent::UploadStarted {
            request_id: created.id.clone(),
            file_name: file_name.to_string(),
        });

        Ok(created.id)
    }

    /// Poll until the request reaches a terminal state or the attempt
    /// budget runs out. Each non-terminal round emits a `polling` event.
    pub async fn await_result(
        &self,
        request_id: &str,
        poll: &PollOptions,
    ) -> Result<TranscriptionResult, SubmitError> {
        for attempt in 1..=poll.max_attempts {
            let status = self.api.fetch_status(request_id).await?;

            match status.status.as_str() {
                "completed" => {
                    self.pending.lock().unwrap().remove(request_id);
                    self.events.emit(ClientEvent::UploadCompleted {
                        request_id: request_id.to_string(),
                    });
                    log::info!(
                        "Transcription {} completed after {} poll attempts",
                        request_id,
                        attempt
                    );
                    return Ok(TranscriptionResult {
                        text: status.text.unwrap_or_default(),
                        language_detected: status.language,
                        processing_time_secs: status.processing_time.unwrap_or(0.0),
                        source_request_id: Some(request_id.to_string()),
                    });
                }
                "failed" => {
                    self.pending.lock().unwrap().remove(request_id);
                    return Err(SubmitError::TranscriptionFailed(
                        status
                            .error
                            .unwrap_or_else(|| "unknown server error".to_string()),
                    ));
                }
                _ => {
                    if let Some(upload) =
                        self.pending.lock().unwrap().get_mut(request_id)
                    {
                        upload.attempts_made = attempt;
                    }
                    self.events.emit(ClientEvent::Polling {
                        request_id: request_id.to_string(),
                        attempt,
                    });
                    if attempt < poll.max_attempts {
                        tokio::time::sleep(poll.poll_interval).await;
                    }
                }
            }
        }

        self.pending.lock().unwrap().remove(request_id);
        Err(SubmitError::PollTimeout {
            attempts: poll.max_attempts,
        })
    }

    /// Best-effort server-side abort. The caller stops awaiting after a
    /// successful acknowledgment.
    pub async fn cancel(&self, request_id: &str) -> Result<String, SubmitError> {
        let response = self.api.cancel_request(request_id).await?;
        self.pending.lock().unwrap().remove(request_id);
        log::info!("Cancelled transcription request {}", request_id);
        Ok(response.message)
    }

    pub fn pending_upload(&self, request_id: &str) -> Option<PendingUpload> {
        self.pending.lock().unwrap().get(request_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted API: answers polls from a fixed sequence of statuses and
    /// counts every call.
    struct ScriptedApi {
        creates: AtomicU32,
        polls: AtomicU32,
        cancels: AtomicU32,
        statuses: Mutex<Vec<StatusResponse>>,
    }

    impl ScriptedApi {
        fn new(statuses: Vec<StatusResponse>) -> Arc<Self> {
            Arc::new(Self {
                creates: AtomicU32::new(0),
                polls: AtomicU32::new(0),
                cancels: AtomicU32::new(0),
                statuses: Mutex::new(statuses),
            })
        }
    }

    fn processing() -> StatusResponse {
        StatusResponse {
            status: "processing".to_string(),
            text: None,
            language: None,
            processing_time: None,
            error: None,
        }
    }

    fn completed(text: &str) -> StatusResponse {
        StatusResponse {
            status: "completed".to_string(),
            text: Some(text.to_string()),
            language: Some("en".to_string()),
            processing_time: Some(1.5),
            error: None,
        }
    }

    #[async_trait]
    impl TranscriptionApi for ScriptedApi {
        async fn create_request(
            &self,
            _file_name: &str,
            _bytes: Vec<u8>,
            _options: &SubmitOptions,
        ) -> Result<CreateResponse, SubmitError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(CreateResponse {
                id: "req-1".to_string(),
                status: "pending".to_string(),
            })
        }

        async fn fetch_status(&self, _request_id: &str) -> Result<StatusResponse, SubmitError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let mut statuses = self.statuses.lock().unwrap();
            if statuses.is_empty() {
                Ok(processing())
            } else {
                Ok(statuses.remove(0))
            }
        }

        async fn cancel_request(&self, request_id: &str) -> Result<CancelResponse, SubmitError> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(CancelResponse {
                message: format!("Transcription request {} cancelled", request_id),
            })
        }
    }

    fn submitter(api: Arc<ScriptedApi>) -> FileSubmitter {
        FileSubmitter::new(api, Arc::new(EventChannel::new()))
    }

    fn options() -> SubmitOptions {
        SubmitOptions {
            model: "base".to_string(),
            language: None,
        }
    }

    fn fast_poll(max_attempts: u32) -> PollOptions {
        PollOptions {
            max_attempts,
            poll_interval: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_policy_rejects_unsupported_extension() {
        let policy = UploadPolicy::default();
        let result = policy.validate("notes.txt", 10);
        assert!(matches!(result, Err(SubmitError::ValidationFailed(_))));
    }

    #[test]
    fn test_policy_rejects_oversize_file() {
        let policy = UploadPolicy::default();
        let result = policy.validate("clip.wav", MAX_FILE_SIZE + 1);
        assert!(matches!(result, Err(SubmitError::ValidationFailed(_))));
    }

    #[test]
    fn test_policy_accepts_allowed_formats() {
        let policy = UploadPolicy::default();
        for name in ["a.wav", "b.WAV", "c.webm", "d.ogg", "e.mp4", "f.flac"] {
            assert!(policy.validate(name, 1024).is_ok(), "rejected {}", name);
        }
    }

    #[tokio::test]
    async fn test_oversize_submission_makes_no_network_request() {
        let api = ScriptedApi::new(vec![]);
        let submitter = FileSubmitter::with_policy(
            api.clone(),
            Arc::new(EventChannel::new()),
            UploadPolicy {
                max_size_bytes: 8,
                ..UploadPolicy::default()
            },
        );

        let result = submitter
            .submit_bytes("clip.wav", vec![0u8; 16], &options())
            .await;
        assert!(matches!(result, Err(SubmitError::ValidationFailed(_))));
        assert_eq!(api.creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_submit_returns_request_id_and_tracks_pending() {
        let api = ScriptedApi::new(vec![]);
        let submitter = submitter(api.clone());

        let id = submitter
            .submit_bytes("clip.wav", vec![0u8; 64], &options())
            .await
            .unwrap();

        assert_eq!(id, "req-1");
        assert_eq!(api.creates.load(Ordering::SeqCst), 1);
        let pending = submitter.pending_upload(&id).unwrap();
        assert_eq!(pending.file_meta.file_name, "clip.wav");
        assert_eq!(pending.file_meta.size_bytes, 64);
        assert_eq!(pending.attempts_made, 0);
    }

    #[tokio::test]
    async fn test_poll_resolves_on_completed_second_attempt() {
        let api = ScriptedApi::new(vec![processing(), completed("hello")]);
        let events = Arc::new(EventChannel::new());
        let polling_attempts = Arc::new(Mutex::new(Vec::new()));
        {
            let polling_attempts = polling_attempts.clone();
            events.subscribe("polling", move |event| {
                if let ClientEvent::Polling { attempt, .. } = event {
                    polling_attempts.lock().unwrap().push(*attempt);
                }
            });
        }
        let submitter = FileSubmitter::new(api.clone(), events);

        let id = submitter
            .submit_bytes("clip.wav", vec![0u8; 64], &options())
            .await
            .unwrap();
        let result = submitter.await_result(&id, &fast_poll(5)).await.unwrap();

        assert_eq!(result.text, "hello");
        assert_eq!(result.language_detected, Some("en".to_string()));
        assert_eq!(result.source_request_id, Some("req-1".to_string()));
        assert_eq!(api.polls.load(Ordering::SeqCst), 2);
        // One polling event, for the non-terminal first attempt.
        assert_eq!(*polling_attempts.lock().unwrap(), vec![1]);
        // Terminal status destroys the tracked upload.
        assert!(submitter.pending_upload(&id).is_none());
    }

    #[tokio::test]
    async fn test_poll_surfaces_server_reported_failure() {
        let api = ScriptedApi::new(vec![StatusResponse {
            status: "failed".to_string(),
            error: Some("audio undecodable".to_string()),
            ..processing()
        }]);
        let submitter = submitter(api);

        let id = submitter
            .submit_bytes("clip.wav", vec![0u8; 64], &options())
            .await
            .unwrap();
        let result = submitter.await_result(&id, &fast_poll(5)).await;

        assert!(matches!(
            result,
            Err(SubmitError::TranscriptionFailed(msg)) if msg == "audio undecodable"
        ));
        assert!(submitter.pending_upload(&id).is_none());
    }

    #[tokio::test]
    async fn test_poll_times_out_after_max_attempts() {
        let api = ScriptedApi::new(vec![]);
        let submitter = submitter(api.clone());

        let id = submitter
            .submit_bytes("clip.wav", vec![0u8; 64], &options())
            .await
            .unwrap();
        let result = submitter.await_result(&id, &fast_poll(3)).await;

        assert!(matches!(
            result,
            Err(SubmitError::PollTimeout { attempts: 3 })
        ));
        assert_eq!(api.polls.load(Ordering::SeqCst), 3);
        assert!(submitter.pending_upload(&id).is_none());
    }

    #[tokio::test]
    async fn test_cancel_acknowledges_and_drops_tracking() {
        let api = ScriptedApi::new(vec![]);
        let submitter = submitter(api.clone());

        let id = submitter
            .submit_bytes("clip.wav", vec![0u8; 64], &options())
            .await
            .unwrap();
        let message = submitter.cancel(&id).await.unwrap();

        assert!(message.contains("req-1"));
        assert_eq!(api.cancels.load(Ordering::SeqCst), 1);
        assert!(submitter.pending_upload(&id).is_none());
    }
}
