//! Speech-to-text engine client.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::EngineError;
use crate::store::WordTiming;

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptOutput {
    pub full_text: String,
    pub words: Vec<WordTiming>,
    pub language: String,
}

/// Speech-to-text seam. The engine receives a path because it runs on the
/// same host as the uploads directory.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, path: &Path) -> Result<TranscriptOutput, EngineError>;
}

/// Client for a co-located Whisper transcription service.
pub struct WhisperClient {
    client: Client,
    base_url: String,
    model: String,
    device: String,
    language: String,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct TranscribeRequest<'a> {
    path: &'a str,
    model: &'a str,
    device: &'a str,
    language: &'a str,
    word_timestamps: bool,
}

#[derive(Debug, Deserialize)]
struct TranscribeResponse {
    text: String,
    #[serde(default)]
    words: Vec<ResponseWord>,
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseWord {
    word: String,
    start: f64,
    end: f64,
}

impl WhisperClient {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        device: impl Into<String>,
        language: impl Into<String>,
        timeout_sec: u64,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            device: device.into(),
            language: language.into(),
            timeout: Duration::from_secs(timeout_sec),
        }
    }

    pub fn language(&self) -> &str {
        &self.language
    }
}

#[async_trait]
impl Transcriber for WhisperClient {
    async fn transcribe(&self, path: &Path) -> Result<TranscriptOutput, EngineError> {
        let url = format!("{}/transcribe", self.base_url);
        let path_str = path.to_string_lossy();
        let request = TranscribeRequest {
            path: &path_str,
            model: &self.model,
            device: &self.device,
            language: &self.language,
            word_timestamps: true,
        };

        debug!(model = %self.model, path = %path_str, "requesting transcription");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(EngineError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let parsed: TranscribeResponse = response
            .json()
            .await
            .map_err(|e| EngineError::InvalidResponse(format!("transcription response: {e}")))?;

        let words = parsed
            .words
            .into_iter()
            .map(|w| WordTiming {
                word: w.word.trim().to_string(),
                start: w.start,
                end: w.end,
            })
            .collect();

        Ok(TranscriptOutput {
            full_text: parsed.text.trim().to_string(),
            words,
            language: parsed.language.unwrap_or_else(|| self.language.clone()),
        })
    }
}
