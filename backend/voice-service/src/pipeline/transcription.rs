//! Transcription provider client.

use crate::pipeline::ProviderError;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    /// Transcribe the audio file at `file_path` and return the text.
    async fn transcribe(&self, file_path: &str) -> Result<String, ProviderError>;
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

pub struct HttpTranscriptionProvider {
    http: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpTranscriptionProvider {
    pub fn new(url: String, api_key: Option<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { http, url, api_key }
    }
}

#[async_trait]
impl TranscriptionProvider for HttpTranscriptionProvider {
    async fn transcribe(&self, file_path: &str) -> Result<String, ProviderError> {
        let bytes = tokio::fs::read(file_path)
            .await
            .map_err(|e| ProviderError::Validation(format!("audio file unreadable: {e}")))?;

        let file_name = Path::new(file_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "audio".to_string());

        let form = reqwest::multipart::Form::new().part(
            "file",
            reqwest::multipart::Part::bytes(bytes).file_name(file_name),
        );

        let mut request = self.http.post(&self.url).multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Validation(format!("{status}: {body}")));
        }
        if !status.is_success() {
            return Err(ProviderError::Transport(format!("status {status}")));
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Transport(format!("malformed response: {e}")))?;

        debug!(chars = parsed.text.len(), "transcription completed");
        Ok(parsed.text)
    }
}
