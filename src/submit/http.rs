//! HTTP implementation of the transcription API
//!
//! Multipart upload to `POST /api/transcribe`, status polls via
//! `GET /api/transcribe/{id}`, cancellation via `DELETE`. One shared
//! client avoids repeated TLS handshakes.

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{CancelResponse, CreateResponse, StatusResponse, SubmitError, SubmitOptions,
            TranscriptionApi};

static HTTP_CLIENT: OnceCell<Client> = OnceCell::new();

fn get_http_client() -> &'static Client {
    HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("Failed to build HTTP client")
    })
}

/// Error body shape returned by the server.
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    detail: String,
}

/// Production `TranscriptionApi` backed by the transcription server's
/// REST endpoints.
pub struct HttpTranscriptionApi {
    base_url: String,
}

impl HttpTranscriptionApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url }
    }

    fn transcribe_url(&self) -> String {
        format!("{}/api/transcribe", self.base_url)
    }

    fn request_url(&self, request_id: &str) -> String {
        format!("{}/api/transcribe/{}", self.base_url, request_id)
    }
}

#[async_trait]
impl TranscriptionApi for HttpTranscriptionApi {
    async fn create_request(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
        options: &SubmitOptions,
    ) -> Result<CreateResponse, SubmitError> {
        let part = Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(mime_for(file_name))
            .map_err(|e| SubmitError::SubmitFailed(e.to_string()))?;

        let mut form = Form::new()
            .part("file", part)
            .text("model", options.model.clone());
        if let Some(language) = &options.language {
            form = form.text("language", language.clone());
        }

        let response = get_http_client()
            .post(self.transcribe_url())
            .multipart(form)
            .send()
            .await
            .map_err(|e| SubmitError::SubmitFailed(e.to_string()))?;

        parse_json(response).await
    }

    async fn fetch_status(&self, request_id: &str) -> Result<StatusResponse, SubmitError> {
        let response = get_http_client()
            .get(self.request_url(request_id))
            .send()
            .await
            .map_err(|e| SubmitError::SubmitFailed(e.to_string()))?;

        parse_json(response).await
    }

    async fn cancel_request(&self, request_id: &str) -> Result<CancelResponse, SubmitError> {
        let response = get_http_client()
            .delete(self.request_url(request_id))
            .send()
            .await
            .map_err(|e| SubmitError::SubmitFailed(e.to_string()))?;

        parse_json(response).await
    }
}

async fn parse_json<T: DeserializeOwned>(response: Response) -> Result<T, SubmitError> {
    let status = response.status();

    if status.is_success() {
        response
            .json()
            .await
            .map_err(|e| SubmitError::SubmitFailed(format!("parse response: {}", e)))
    } else {
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorResponse>(&body)
            .map(|e| e.detail)
            .unwrap_or(body);
        log::error!("Server error ({}): {}", status.as_u16(), message);
        Err(SubmitError::SubmitFailed(format!(
            "{}: {}",
            status.as_u16(),
            message
        )))
    }
}

fn mime_for(file_name: &str) -> &'static str {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "wav" | "wave" => "audio/wav",
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "m4a" => "audio/x-m4a",
        "webm" => "audio/webm",
        "ogg" => "audio/ogg",
        "mp4" => "audio/mp4",
        _ => "application/octet-stream",
    }
}
